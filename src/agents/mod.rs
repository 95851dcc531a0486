// Decision sources: the agents whose opinions feed the consensus engine
pub mod llm;
pub mod rules;

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

use crate::models::{Decision, MarketContext, FALLBACK_MAX_CONFIDENCE};

pub use llm::{LlmDecisionSource, LlmSourceConfig};
pub use rules::{FixedSource, RiskGuard, TrendFollower, VolumeMomentum};

/// Default per-call budget for a decision source
pub const DEFAULT_DECISION_TIMEOUT: Duration = Duration::from_secs(30);

/// Result shape of every decision-source call
#[derive(Debug, Clone, PartialEq)]
pub enum DecisionOutcome {
    /// The source produced a real opinion
    Decided(Decision),
    /// The source failed internally and degraded to a HOLD
    Fallback { decision: Decision, cause: String },
}

impl DecisionOutcome {
    /// Build a fallback outcome; the decision is always a zero-amount HOLD
    pub fn fallback(source_id: &str, cause: impl Into<String>) -> Self {
        let cause = cause.into();
        Self::Fallback {
            decision: Decision::fallback(source_id, format!("Fallback HOLD: {}", cause)),
            cause,
        }
    }

    pub fn decision(&self) -> &Decision {
        match self {
            DecisionOutcome::Decided(decision) => decision,
            DecisionOutcome::Fallback { decision, .. } => decision,
        }
    }

    pub fn into_decision(self) -> Decision {
        match self {
            DecisionOutcome::Decided(decision) => decision,
            DecisionOutcome::Fallback { decision, .. } => decision,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, DecisionOutcome::Fallback { .. })
    }
}

/// Capability implemented by every participating agent
///
/// Implementations must not panic or block indefinitely; internal failures are
/// reported as [`DecisionOutcome::Fallback`].
#[async_trait]
pub trait DecisionSource: Send + Sync {
    /// Stable identifier written into every decision
    fn id(&self) -> &str;

    /// Produce exactly one decision for this market snapshot
    async fn decide(&self, ctx: &MarketContext) -> DecisionOutcome;
}

/// Call a source with a time budget, degrading to HOLD on timeout
///
/// Also normalises the returned decision: the source id is forced to the
/// source's own id and fallbacks are capped at the fallback confidence.
pub async fn decide_guarded(
    source: &dyn DecisionSource,
    ctx: &MarketContext,
    timeout: Duration,
) -> DecisionOutcome {
    let outcome = match tokio::time::timeout(timeout, source.decide(ctx)).await {
        Ok(outcome) => outcome,
        Err(_) => DecisionOutcome::fallback(
            source.id(),
            format!("no decision within {:.1}s", timeout.as_secs_f64()),
        ),
    };

    let outcome = match outcome {
        DecisionOutcome::Decided(mut decision) => {
            decision.source_id = source.id().to_string();
            DecisionOutcome::Decided(decision)
        }
        DecisionOutcome::Fallback { mut decision, cause } => {
            decision.source_id = source.id().to_string();
            decision.action = crate::models::Action::Hold;
            decision.amount = 0.0;
            decision.confidence = decision.confidence.min(FALLBACK_MAX_CONFIDENCE);
            DecisionOutcome::Fallback { decision, cause }
        }
    };

    if let DecisionOutcome::Fallback { cause, .. } = &outcome {
        tracing::warn!(
            "Source {} fell back to HOLD for {} @ {}: {}",
            source.id(),
            ctx.ticker,
            ctx.timestamp,
            cause
        );
    }

    outcome
}

/// Query every source concurrently and wait for all of them
///
/// Results come back in source order regardless of completion order.
pub async fn gather_decisions(
    sources: &[Arc<dyn DecisionSource>],
    ctx: &MarketContext,
    timeout: Duration,
) -> Vec<DecisionOutcome> {
    let calls = sources
        .iter()
        .map(|source| decide_guarded(source.as_ref(), ctx, timeout));

    join_all(calls).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Action;
    use chrono::Utc;

    fn context(price: f64) -> MarketContext {
        MarketContext {
            ticker: "BTC-USD".to_string(),
            price,
            volume: 1_000.0,
            ema: Some(price),
            ema_proj_1: Some(price),
            ema_proj_2: Some(price),
            timestamp: Utc::now(),
            cash: 10_000.0,
            position: None,
        }
    }

    struct SlowSource;

    #[async_trait]
    impl DecisionSource for SlowSource {
        fn id(&self) -> &str {
            "slow"
        }

        async fn decide(&self, _ctx: &MarketContext) -> DecisionOutcome {
            tokio::time::sleep(Duration::from_secs(60)).await;
            DecisionOutcome::Decided(Decision::new("slow", Action::Buy, 100.0, 0.9, "", ""))
        }
    }

    struct LyingFallback;

    #[async_trait]
    impl DecisionSource for LyingFallback {
        fn id(&self) -> &str {
            "liar"
        }

        async fn decide(&self, _ctx: &MarketContext) -> DecisionOutcome {
            DecisionOutcome::Fallback {
                decision: Decision::new("someone-else", Action::Buy, 500.0, 0.9, "", "broken"),
                cause: "parse error".to_string(),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_degrades_to_hold() {
        let outcome = decide_guarded(&SlowSource, &context(100.0), Duration::from_secs(1)).await;

        assert!(outcome.is_fallback());
        let decision = outcome.decision();
        assert_eq!(decision.action, Action::Hold);
        assert_eq!(decision.amount, 0.0);
        assert!(decision.confidence <= FALLBACK_MAX_CONFIDENCE);
        assert_eq!(decision.source_id, "slow");
    }

    #[tokio::test]
    async fn test_fallback_is_normalised() {
        let outcome = decide_guarded(&LyingFallback, &context(100.0), Duration::from_secs(1)).await;
        let decision = outcome.into_decision();

        assert_eq!(decision.action, Action::Hold);
        assert_eq!(decision.amount, 0.0);
        assert!(decision.confidence <= FALLBACK_MAX_CONFIDENCE);
        assert_eq!(decision.source_id, "liar");
    }

    #[tokio::test(start_paused = true)]
    async fn test_gather_preserves_source_order() {
        let sources: Vec<Arc<dyn DecisionSource>> = vec![
            Arc::new(SlowSource),
            Arc::new(FixedSource::new(Decision::new("fixed", Action::Sell, 1.0, 0.5, "", ""))),
            Arc::new(RiskGuard::default()),
        ];

        let outcomes = gather_decisions(&sources, &context(100.0), Duration::from_secs(2)).await;

        let ids: Vec<&str> = outcomes.iter().map(|o| o.decision().source_id.as_str()).collect();
        assert_eq!(ids, vec!["slow", "fixed", "risk_guard"]);
        assert!(outcomes[0].is_fallback());
        assert_eq!(outcomes[1].decision().action, Action::Sell);
    }
}
