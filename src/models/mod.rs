use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::Result;

/// Source id carried by every aggregated decision
pub const CONSENSUS_SOURCE_ID: &str = "TEAM_CONSENSUS";

/// Highest confidence a fallback decision may carry
pub const FALLBACK_MAX_CONFIDENCE: f64 = 0.3;

/// Trading action proposed by a decision source
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl Action {
    /// Parse a free-form action label ("buy", "SELL", " Hold ")
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_uppercase().as_str() {
            "BUY" => Some(Action::Buy),
            "SELL" => Some(Action::Sell),
            "HOLD" => Some(Action::Hold),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Buy => "BUY",
            Action::Sell => "SELL",
            Action::Hold => "HOLD",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One trading opinion for a single time step
///
/// `amount` is a USD notional for BUY and a share count for SELL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub action: Action,
    pub amount: f64,
    pub reason: String,
    pub strategy: String,
    pub confidence: f64,
    pub source_id: String,
}

impl Decision {
    /// Build a decision, clamping confidence into [0, 1] and amount to >= 0
    pub fn new(
        source_id: impl Into<String>,
        action: Action,
        amount: f64,
        confidence: f64,
        strategy: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let amount = if amount.is_finite() { amount.max(0.0) } else { 0.0 };
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };

        Self {
            action,
            amount,
            reason: reason.into(),
            strategy: strategy.into(),
            confidence,
            source_id: source_id.into(),
        }
    }

    pub fn hold(
        source_id: impl Into<String>,
        confidence: f64,
        strategy: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(source_id, Action::Hold, 0.0, confidence, strategy, reason)
    }

    /// Degraded HOLD used when a source cannot produce a real opinion
    pub fn fallback(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(source_id, Action::Hold, 0.0, 0.0, "fallback", reason)
    }

    pub fn is_consensus(&self) -> bool {
        self.source_id == CONSENSUS_SOURCE_ID
    }
}

/// One OHLCV row from the market-data provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketRow {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Typed snapshot handed to every decision source
///
/// EMA fields are `None` until the trailing window is full.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketContext {
    pub ticker: String,
    pub price: f64,
    pub volume: f64,
    pub ema: Option<f64>,
    pub ema_proj_1: Option<f64>,
    pub ema_proj_2: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub cash: f64,
    pub position: Option<Position>,
}

impl MarketContext {
    pub fn held_shares(&self) -> f64 {
        self.position.as_ref().map(|p| p.shares).unwrap_or(0.0)
    }
}

/// Open holding in a ticker; exists only while shares > 0
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub ticker: String,
    pub shares: f64,
    pub avg_cost: f64,
}

impl Position {
    pub fn market_value(&self, price: f64) -> f64 {
        self.shares * price
    }

    pub fn unrealized_pnl_pct(&self, price: f64) -> f64 {
        (price / self.avg_cost - 1.0) * 100.0
    }
}

/// Side of an executed trade
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// Executed fill; append-only journal entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trade {
    pub date: DateTime<Utc>,
    pub ticker: String,
    pub action: TradeSide,
    pub shares: f64,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pnl: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pnl_pct: Option<f64>,
    /// Transaction cost charged on this fill, absent when fees are disabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<f64>,
    pub reason: String,
}

/// Mark-to-market portfolio value at one time step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EquityPoint {
    pub date: DateTime<Utc>,
    pub value: f64,
}

/// Immutable parameters fixing the time axis of a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    pub tickers: Vec<String>,
    pub days: u32,
    pub initial_capital: f64,
    pub decision_interval_hours: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            tickers: vec!["BTC-USD".to_string()],
            days: 7,
            initial_capital: 10_000.0,
            decision_interval_hours: 1,
        }
    }
}

impl RunConfig {
    pub fn new(
        tickers: impl IntoIterator<Item = impl Into<String>>,
        days: u32,
        initial_capital: f64,
        decision_interval_hours: u32,
    ) -> Result<Self> {
        let mut config = Self {
            tickers: Vec::new(),
            days,
            initial_capital,
            decision_interval_hours,
        };
        for ticker in tickers {
            let ticker = ticker.into();
            if !config.tickers.contains(&ticker) {
                config.tickers.push(ticker);
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the runner relies on
    pub fn validate(&self) -> Result<()> {
        if self.tickers.is_empty() {
            return Err(Error::InvalidConfig("at least one ticker is required".into()));
        }
        if self.tickers.iter().any(|t| t.trim().is_empty()) {
            return Err(Error::InvalidConfig("ticker symbols must not be blank".into()));
        }
        let mut seen = std::collections::HashSet::new();
        if !self.tickers.iter().all(|t| seen.insert(t)) {
            return Err(Error::InvalidConfig("tickers must be unique".into()));
        }
        if self.decision_interval_hours == 0 {
            return Err(Error::InvalidConfig(
                "decision_interval_hours must be at least 1".into(),
            ));
        }
        if !(self.initial_capital.is_finite() && self.initial_capital > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "initial_capital must be positive, got {}",
                self.initial_capital
            )));
        }
        Ok(())
    }
}
