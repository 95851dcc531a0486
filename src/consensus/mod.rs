// Multi-agent consensus aggregation
//
// Plurality vote over actions. Ties resolve to the most conservative action:
// HOLD beats SELL beats BUY. Amount and confidence are averaged over the
// decisions that agree with the winner; dissenters only count in the tally.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::models::{Action, Decision, CONSENSUS_SOURCE_ID};
use crate::Result;

/// Separator between merged reasons and strategy tags
pub const JOIN_SEPARATOR: &str = " | ";

/// Strategy tag used when no agreeing decision carried one
pub const DEFAULT_STRATEGY: &str = "consensus";

/// Vote count per action for one time step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteTally {
    pub buy: usize,
    pub sell: usize,
    pub hold: usize,
}

impl VoteTally {
    pub fn from_decisions(decisions: &[Decision]) -> Self {
        let mut tally = Self::default();
        for decision in decisions {
            match decision.action {
                Action::Buy => tally.buy += 1,
                Action::Sell => tally.sell += 1,
                Action::Hold => tally.hold += 1,
            }
        }
        tally
    }

    pub fn votes(&self, action: Action) -> usize {
        match action {
            Action::Buy => self.buy,
            Action::Sell => self.sell,
            Action::Hold => self.hold,
        }
    }

    /// Plurality winner with conservative tie-break
    pub fn winner(&self) -> Action {
        // Priority order: first entry wins a tie
        [Action::Hold, Action::Sell, Action::Buy]
            .into_iter()
            .fold(Action::Hold, |best, candidate| {
                if self.votes(candidate) > self.votes(best) {
                    candidate
                } else {
                    best
                }
            })
    }

    pub fn total(&self) -> usize {
        self.buy + self.sell + self.hold
    }
}

/// Outcome of aggregating one step's decisions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusOutcome {
    pub decision: Decision,
    pub tally: VoteTally,
}

/// Aggregates one decision per source into a single team decision
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsensusEngine;

impl ConsensusEngine {
    pub fn new() -> Self {
        Self
    }

    /// Aggregate decisions into a consensus decision
    pub fn aggregate(&self, decisions: &[Decision]) -> Result<Decision> {
        self.aggregate_with_tally(decisions).map(|o| o.decision)
    }

    /// Aggregate decisions and keep the vote tally for journalling
    pub fn aggregate_with_tally(&self, decisions: &[Decision]) -> Result<ConsensusOutcome> {
        if decisions.is_empty() {
            return Err(Error::EmptyDecisionSet);
        }

        let tally = VoteTally::from_decisions(decisions);
        let action = tally.winner();

        let agreeing: Vec<&Decision> = decisions.iter().filter(|d| d.action == action).collect();

        let amount = bounded_mean(agreeing.iter().map(|d| d.amount));
        let confidence = bounded_mean(agreeing.iter().map(|d| d.confidence));

        let reason = agreeing
            .iter()
            .map(|d| format!("{}: {}", d.source_id, d.reason))
            .collect::<Vec<_>>()
            .join(JOIN_SEPARATOR);

        let mut strategies: Vec<&str> = Vec::new();
        for d in &agreeing {
            let tag = d.strategy.trim();
            if !tag.is_empty() && !strategies.contains(&tag) {
                strategies.push(tag);
            }
        }
        let strategy = if strategies.is_empty() {
            DEFAULT_STRATEGY.to_string()
        } else {
            strategies.join(JOIN_SEPARATOR)
        };

        tracing::debug!(
            "Consensus {} ({}/{} votes, buy={} sell={} hold={})",
            action,
            agreeing.len(),
            tally.total(),
            tally.buy,
            tally.sell,
            tally.hold
        );

        Ok(ConsensusOutcome {
            decision: Decision::new(
                CONSENSUS_SOURCE_ID,
                action,
                amount,
                confidence,
                strategy,
                reason,
            ),
            tally,
        })
    }
}

/// Arithmetic mean kept inside the [min, max] of its inputs
///
/// Summing then dividing can land one ulp outside the input range, so a
/// unanimous "sell all held shares" would otherwise ask for slightly more
/// than is held.
fn bounded_mean(values: impl Iterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;

    for v in values {
        sum += v;
        count += 1;
        min = min.min(v);
        max = max.max(v);
    }

    if count == 0 {
        return 0.0;
    }
    (sum / count as f64).clamp(min, max)
}
