use async_trait::async_trait;

use super::{DecisionOutcome, DecisionSource};
use crate::models::{Action, Decision, MarketContext};

/// EMA trend follower
///
/// Buys a fixed notional when price sits above a rising EMA, exits the whole
/// position when price falls below a falling EMA.
#[derive(Debug, Clone)]
pub struct TrendFollower {
    id: String,
    buy_notional: f64,
}

impl TrendFollower {
    pub fn new(id: impl Into<String>, buy_notional: f64) -> Self {
        Self {
            id: id.into(),
            buy_notional,
        }
    }
}

impl Default for TrendFollower {
    fn default() -> Self {
        Self::new("trend_follower", 100.0)
    }
}

#[async_trait]
impl DecisionSource for TrendFollower {
    fn id(&self) -> &str {
        &self.id
    }

    async fn decide(&self, ctx: &MarketContext) -> DecisionOutcome {
        let (Some(ema), Some(proj_1)) = (ctx.ema, ctx.ema_proj_1) else {
            return DecisionOutcome::Decided(Decision::hold(
                &self.id,
                0.3,
                "insufficient_data",
                "EMA not ready yet",
            ));
        };

        let rising = proj_1 > ema;
        let falling = proj_1 < ema;

        let decision = if ctx.price > ema && rising {
            Decision::new(
                &self.id,
                Action::Buy,
                self.buy_notional.min(ctx.cash),
                0.7,
                "trend_following",
                format!("Price ${:.2} above rising EMA ${:.2}", ctx.price, ema),
            )
        } else if ctx.price < ema && falling && ctx.held_shares() > 0.0 {
            Decision::new(
                &self.id,
                Action::Sell,
                ctx.held_shares(),
                0.7,
                "trend_exit",
                format!("Price ${:.2} below falling EMA ${:.2}", ctx.price, ema),
            )
        } else {
            Decision::hold(
                &self.id,
                0.5,
                "wait_signal",
                format!("No clear trend (price ${:.2}, EMA ${:.2})", ctx.price, ema),
            )
        };

        DecisionOutcome::Decided(decision)
    }
}

/// Volume momentum: buys when traded volume exceeds a threshold
#[derive(Debug, Clone)]
pub struct VolumeMomentum {
    id: String,
    volume_threshold: f64,
    buy_notional: f64,
}

impl VolumeMomentum {
    pub fn new(id: impl Into<String>, volume_threshold: f64, buy_notional: f64) -> Self {
        Self {
            id: id.into(),
            volume_threshold,
            buy_notional,
        }
    }
}

impl Default for VolumeMomentum {
    fn default() -> Self {
        Self::new("volume_momentum", 1_000_000.0, 200.0)
    }
}

#[async_trait]
impl DecisionSource for VolumeMomentum {
    fn id(&self) -> &str {
        &self.id
    }

    async fn decide(&self, ctx: &MarketContext) -> DecisionOutcome {
        if !ctx.volume.is_finite() {
            return DecisionOutcome::fallback(&self.id, "volume missing");
        }

        let decision = if ctx.volume > self.volume_threshold {
            Decision::new(
                &self.id,
                Action::Buy,
                self.buy_notional.min(ctx.cash),
                0.8,
                "momentum",
                format!("High volume {:.0} signals momentum", ctx.volume),
            )
        } else {
            Decision::hold(&self.id, 0.4, "low_volume", format!("Volume {:.0} too low", ctx.volume))
        };

        DecisionOutcome::Decided(decision)
    }
}

/// Always waits for confirmation
#[derive(Debug, Clone)]
pub struct RiskGuard {
    id: String,
}

impl RiskGuard {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Default for RiskGuard {
    fn default() -> Self {
        Self::new("risk_guard")
    }
}

#[async_trait]
impl DecisionSource for RiskGuard {
    fn id(&self) -> &str {
        &self.id
    }

    async fn decide(&self, _ctx: &MarketContext) -> DecisionOutcome {
        DecisionOutcome::Decided(Decision::hold(
            &self.id,
            0.6,
            "risk_management",
            "Wait for confirmation",
        ))
    }
}

/// Returns the same decision every step; useful for scripted runs
#[derive(Debug, Clone)]
pub struct FixedSource {
    decision: Decision,
}

impl FixedSource {
    pub fn new(decision: Decision) -> Self {
        Self { decision }
    }
}

#[async_trait]
impl DecisionSource for FixedSource {
    fn id(&self) -> &str {
        &self.decision.source_id
    }

    async fn decide(&self, _ctx: &MarketContext) -> DecisionOutcome {
        DecisionOutcome::Decided(self.decision.clone())
    }
}
