use serde::{Deserialize, Serialize};

use crate::models::{Action, Decision, Position};

/// Source id stamped on automatic exits
pub const RISK_EXIT_SOURCE_ID: &str = "RISK_EXIT";

/// Automatic stop-loss / take-profit exits, checked before each step's decisions
///
/// Thresholds are fractions (0.03 = 3%). Both disabled by default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExitRules {
    pub stop_loss_pct: Option<f64>,
    pub take_profit_pct: Option<f64>,
}

/// Which limit a position crossed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitTrigger {
    StopLoss,
    TakeProfit,
}

impl ExitTrigger {
    pub fn label(&self) -> &'static str {
        match self {
            ExitTrigger::StopLoss => "stop loss",
            ExitTrigger::TakeProfit => "take profit",
        }
    }
}

impl ExitRules {
    pub fn is_enabled(&self) -> bool {
        self.stop_loss_pct.is_some() || self.take_profit_pct.is_some()
    }

    pub fn check(&self, position: &Position, price: f64) -> Option<ExitTrigger> {
        let change = price / position.avg_cost - 1.0;

        if let Some(stop) = self.stop_loss_pct {
            if change <= -stop {
                return Some(ExitTrigger::StopLoss);
            }
        }

        if let Some(target) = self.take_profit_pct {
            if change >= target {
                return Some(ExitTrigger::TakeProfit);
            }
        }

        None
    }

    /// Full-position SELL for a position that crossed a limit
    pub fn exit_decision(&self, position: &Position, price: f64) -> Option<Decision> {
        let trigger = self.check(position, price)?;
        let change_pct = position.unrealized_pnl_pct(price);

        Some(Decision::new(
            RISK_EXIT_SOURCE_ID,
            Action::Sell,
            position.shares,
            1.0,
            trigger.label().replace(' ', "_"),
            format!("{} at {:+.2}%", trigger.label(), change_pct),
        ))
    }
}
