use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::models::{Action, Decision, EquityPoint, Position, Trade, TradeSide};

/// Share balances below this are treated as fully closed
const DUST_SHARES: f64 = 1e-9;

/// How oversized orders are handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillPolicy {
    /// Reject the whole order; no partial fills
    #[default]
    Reject,
    /// Shrink the order to available cash (BUY) or held shares (SELL)
    Clamp,
}

impl std::str::FromStr for FillPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(FillPolicy::Reject),
            "clamp" => Ok(FillPolicy::Clamp),
            other => Err(format!("unknown fill policy: {}", other)),
        }
    }
}

/// Cash plus open positions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioState {
    pub cash: f64,
    pub positions: BTreeMap<String, Position>,
}

impl PortfolioState {
    pub fn new(cash: f64) -> Self {
        Self {
            cash,
            positions: BTreeMap::new(),
        }
    }

    pub fn position(&self, ticker: &str) -> Option<&Position> {
        self.positions.get(ticker)
    }

    /// Cash plus every position marked at `prices` (falls back to cost basis)
    pub fn value_at(&self, prices: &HashMap<String, f64>) -> f64 {
        self.cash
            + self
                .positions
                .values()
                .map(|p| p.market_value(prices.get(&p.ticker).copied().unwrap_or(p.avg_cost)))
                .sum::<f64>()
    }
}

/// Result of applying one decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Executed { trade: Trade },
    Rejected { reason: String },
    Held,
}

impl ExecutionOutcome {
    pub fn trade(&self) -> Option<&Trade> {
        match self {
            ExecutionOutcome::Executed { trade } => Some(trade),
            _ => None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, ExecutionOutcome::Rejected { .. })
    }
}

/// Portfolio state machine
///
/// Sole owner of `PortfolioState`. Every call to [`step`](Self::step) or
/// [`record_equity`](Self::record_equity) appends exactly one equity point.
#[derive(Debug, Clone)]
pub struct PortfolioSimulator {
    initial_capital: f64,
    state: PortfolioState,
    fill_policy: FillPolicy,
    transaction_cost: f64,
    last_prices: HashMap<String, f64>,
    trades: Vec<Trade>,
    equity_curve: Vec<EquityPoint>,
}

impl PortfolioSimulator {
    pub fn new(initial_capital: f64, fill_policy: FillPolicy) -> Self {
        Self {
            initial_capital,
            state: PortfolioState::new(initial_capital),
            fill_policy,
            transaction_cost: 0.0,
            last_prices: HashMap::new(),
            trades: Vec::new(),
            equity_curve: Vec::new(),
        }
    }

    /// Start from an existing state (restored or hand-built for tests)
    pub fn with_state(
        initial_capital: f64,
        state: PortfolioState,
        fill_policy: FillPolicy,
    ) -> Self {
        let last_prices = state
            .positions
            .values()
            .map(|p| (p.ticker.clone(), p.avg_cost))
            .collect();

        Self {
            initial_capital,
            state,
            fill_policy,
            transaction_cost: 0.0,
            last_prices,
            trades: Vec::new(),
            equity_curve: Vec::new(),
        }
    }

    /// Charge `rate` (a fraction of each fill's gross value) on every trade
    ///
    /// Non-finite or negative rates are treated as zero.
    pub fn with_transaction_cost(mut self, rate: f64) -> Self {
        self.transaction_cost = if rate.is_finite() { rate.max(0.0) } else { 0.0 };
        self
    }

    pub fn transaction_cost(&self) -> f64 {
        self.transaction_cost
    }

    pub fn initial_capital(&self) -> f64 {
        self.initial_capital
    }

    pub fn state(&self) -> &PortfolioState {
        &self.state
    }

    pub fn cash(&self) -> f64 {
        self.state.cash
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn equity_curve(&self) -> &[EquityPoint] {
        &self.equity_curve
    }

    pub fn last_prices(&self) -> &HashMap<String, f64> {
        &self.last_prices
    }

    /// Current mark-to-market value at the last known prices
    pub fn portfolio_value(&self) -> f64 {
        self.state.value_at(&self.last_prices)
    }

    /// Record the latest observed price for a ticker
    pub fn update_price(&mut self, ticker: &str, price: f64) {
        if price.is_finite() && price > 0.0 {
            self.last_prices.insert(ticker.to_string(), price);
        }
    }

    /// Apply a (consensus) decision at `price`
    ///
    /// BUY `amount` is a USD notional, SELL `amount` is a share count.
    pub fn apply(
        &mut self,
        ticker: &str,
        decision: &Decision,
        price: f64,
        timestamp: DateTime<Utc>,
    ) -> ExecutionOutcome {
        self.update_price(ticker, price);

        let outcome = match decision.action {
            Action::Hold => ExecutionOutcome::Held,
            Action::Buy => {
                self.execute_buy(ticker, decision.amount, price, timestamp, &decision.reason)
            }
            Action::Sell => {
                self.execute_sell(ticker, decision.amount, price, timestamp, &decision.reason)
            }
        };

        match &outcome {
            ExecutionOutcome::Executed { trade } => {
                tracing::info!(
                    "{:?} {} {:.6} @ ${:.2} (cash ${:.2})",
                    trade.action,
                    trade.ticker,
                    trade.shares,
                    trade.price,
                    self.state.cash
                );
            }
            ExecutionOutcome::Rejected { reason } => {
                tracing::debug!("Rejected {} {}: {}", decision.action, ticker, reason);
            }
            ExecutionOutcome::Held => {}
        }

        outcome
    }

    /// Append one equity point valuing open positions at their last known prices
    pub fn record_equity(&mut self, timestamp: DateTime<Utc>) -> EquityPoint {
        let point = EquityPoint {
            date: timestamp,
            value: self.portfolio_value(),
        };
        self.equity_curve.push(point.clone());
        point
    }

    /// One full time step: mark prices, apply decisions in order, record equity
    pub fn step(
        &mut self,
        timestamp: DateTime<Utc>,
        prices: &HashMap<String, f64>,
        decisions: &[(String, Decision)],
    ) -> (Vec<ExecutionOutcome>, EquityPoint) {
        for (ticker, price) in prices {
            self.update_price(ticker, *price);
        }

        let mut outcomes = Vec::with_capacity(decisions.len());
        for (ticker, decision) in decisions {
            let outcome = match prices.get(ticker) {
                Some(&price) => self.apply(ticker, decision, price, timestamp),
                None => ExecutionOutcome::Rejected {
                    reason: format!("No price for {} at this step", ticker),
                },
            };
            outcomes.push(outcome);
        }

        let point = self.record_equity(timestamp);
        (outcomes, point)
    }

    fn execute_buy(
        &mut self,
        ticker: &str,
        amount: f64,
        price: f64,
        timestamp: DateTime<Utc>,
        reason: &str,
    ) -> ExecutionOutcome {
        if !(price.is_finite() && price > 0.0) {
            return rejected(format!("Invalid price {}", price));
        }
        if !(amount.is_finite() && amount > 0.0) {
            return rejected(format!("BUY notional must be positive, got {}", amount));
        }

        let rate = self.transaction_cost;
        let notional = if amount * (1.0 + rate) > self.state.cash {
            match self.fill_policy {
                FillPolicy::Reject => {
                    return rejected(format!(
                        "Insufficient cash: need ${:.2}, have ${:.2}",
                        amount * (1.0 + rate),
                        self.state.cash
                    ));
                }
                FillPolicy::Clamp => self.state.cash / (1.0 + rate),
            }
        } else {
            amount
        };

        if notional <= 0.0 {
            return rejected("No cash available".to_string());
        }

        let shares = notional / price;

        match self.state.positions.get_mut(ticker) {
            Some(position) => {
                let total_shares = position.shares + shares;
                position.avg_cost =
                    (position.shares * position.avg_cost + shares * price) / total_shares;
                position.shares = total_shares;
            }
            None => {
                self.state.positions.insert(
                    ticker.to_string(),
                    Position {
                        ticker: ticker.to_string(),
                        shares,
                        avg_cost: price,
                    },
                );
            }
        }

        let fee = notional * rate;
        // Guard against float drift leaving -0.0000001
        self.state.cash = (self.state.cash - notional - fee).max(0.0);

        let trade = Trade {
            date: timestamp,
            ticker: ticker.to_string(),
            action: TradeSide::Buy,
            shares,
            price,
            pnl: None,
            pnl_pct: None,
            fee: self.fee_field(fee),
            reason: reason.to_string(),
        };
        self.trades.push(trade.clone());

        ExecutionOutcome::Executed { trade }
    }

    fn execute_sell(
        &mut self,
        ticker: &str,
        amount: f64,
        price: f64,
        timestamp: DateTime<Utc>,
        reason: &str,
    ) -> ExecutionOutcome {
        if !(price.is_finite() && price > 0.0) {
            return rejected(format!("Invalid price {}", price));
        }
        if !(amount.is_finite() && amount > 0.0) {
            return rejected(format!("SELL share count must be positive, got {}", amount));
        }

        let Some(position) = self.state.positions.get_mut(ticker) else {
            return rejected(format!("No position in {}", ticker));
        };

        // A request within dust of the whole position closes it
        let shares = if amount <= position.shares + DUST_SHARES {
            amount.min(position.shares)
        } else {
            match self.fill_policy {
                FillPolicy::Reject => {
                    return rejected(format!(
                        "Insufficient shares: want {:.6}, hold {:.6}",
                        amount, position.shares
                    ));
                }
                FillPolicy::Clamp => position.shares,
            }
        };

        let avg_cost = position.avg_cost;
        let pnl = (price - avg_cost) * shares;
        let pnl_pct = (price / avg_cost - 1.0) * 100.0;

        position.shares -= shares;
        if position.shares < DUST_SHARES {
            self.state.positions.remove(ticker);
        }
        let proceeds = shares * price;
        let fee = proceeds * self.transaction_cost;
        self.state.cash += proceeds - fee;

        let trade = Trade {
            date: timestamp,
            ticker: ticker.to_string(),
            action: TradeSide::Sell,
            shares,
            price,
            pnl: Some(pnl),
            pnl_pct: Some(pnl_pct),
            fee: self.fee_field(fee),
            reason: reason.to_string(),
        };
        self.trades.push(trade.clone());

        ExecutionOutcome::Executed { trade }
    }

    fn fee_field(&self, fee: f64) -> Option<f64> {
        (self.transaction_cost > 0.0).then_some(fee)
    }

    /// Consume the simulator, yielding its final state and journals
    pub fn into_parts(
        self,
    ) -> (PortfolioState, Vec<Trade>, Vec<EquityPoint>, HashMap<String, f64>) {
        (self.state, self.trades, self.equity_curve, self.last_prices)
    }
}

fn rejected(reason: String) -> ExecutionOutcome {
    ExecutionOutcome::Rejected { reason }
}
