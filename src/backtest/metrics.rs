use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::execution::PortfolioState;
use crate::models::{EquityPoint, RunConfig, Trade, TradeSide};

/// Open position snapshot as persisted in `final_metrics.holdings`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub shares: f64,
    pub avg_cost: f64,
}

/// Summary statistics of a completed run
///
/// Field names are part of the persisted record format; do not rename.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalMetrics {
    pub current_value: f64,
    pub total_return: f64,
    pub total_return_pct: f64,
    pub cash: f64,

    // Closed (SELL) trade statistics
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    /// Gross wins over gross losses; `None` (JSON null) when nothing lost
    pub profit_factor: Option<f64>,

    pub holdings: BTreeMap<String, Holding>,
}

/// Derives [`FinalMetrics`] from a run's journals and final state
pub struct MetricsCalculator;

impl MetricsCalculator {
    /// Positions are marked at `last_prices`, falling back to cost basis for
    /// tickers that never printed a price.
    pub fn calculate(
        config: &RunConfig,
        trades: &[Trade],
        state: &PortfolioState,
        last_prices: &HashMap<String, f64>,
    ) -> FinalMetrics {
        let current_value = state.value_at(last_prices);
        let total_return = current_value - config.initial_capital;
        let total_return_pct = total_return / config.initial_capital * 100.0;

        let closed: Vec<f64> = trades
            .iter()
            .filter(|t| t.action == TradeSide::Sell)
            .map(|t| t.pnl.unwrap_or(0.0))
            .collect();

        let wins: Vec<f64> = closed.iter().copied().filter(|pnl| *pnl > 0.0).collect();
        let losses: Vec<f64> = closed.iter().copied().filter(|pnl| *pnl < 0.0).collect();

        let total_trades = closed.len();
        let win_rate = if total_trades > 0 {
            wins.len() as f64 / total_trades as f64 * 100.0
        } else {
            0.0
        };

        let gross_wins: f64 = wins.iter().sum();
        let gross_losses: f64 = losses.iter().sum();

        let profit_factor = if losses.is_empty() {
            None
        } else {
            Some(gross_wins / gross_losses.abs())
        };

        let holdings = state
            .positions
            .iter()
            .map(|(ticker, p)| {
                (
                    ticker.clone(),
                    Holding {
                        shares: p.shares,
                        avg_cost: p.avg_cost,
                    },
                )
            })
            .collect();

        FinalMetrics {
            current_value,
            total_return,
            total_return_pct,
            cash: state.cash,
            total_trades,
            winning_trades: wins.len(),
            losing_trades: losses.len(),
            win_rate,
            avg_win: mean(&wins),
            avg_loss: mean(&losses),
            profit_factor,
            holdings,
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Largest peak-to-trough decline of the equity curve, in percent (<= 0)
pub fn max_drawdown_pct(equity_curve: &[EquityPoint]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst = 0.0_f64;

    for point in equity_curve {
        if point.value > peak {
            peak = point.value;
        }
        if peak > 0.0 {
            let drawdown = (point.value / peak - 1.0) * 100.0;
            worst = worst.min(drawdown);
        }
    }

    worst
}

impl FinalMetrics {
    /// Print a formatted report to stdout
    pub fn print_report(&self, config: &RunConfig, equity_curve: &[EquityPoint]) {
        println!("\n╔═══════════════════════════════════════════════════════╗");
        println!("║               TEAM BACKTEST PERFORMANCE               ║");
        println!("╚═══════════════════════════════════════════════════════╝\n");

        println!("⚙️  RUN");
        println!("  Tickers:               {}", config.tickers.join(", "));
        println!("  Days:                  {}", config.days);
        println!(
            "  Decision Interval:     {}h",
            config.decision_interval_hours
        );
        println!("  Equity Points:         {}", equity_curve.len());

        println!("\n📊 P&L SUMMARY");
        println!("  Initial Capital:       ${:.2}", config.initial_capital);
        println!("  Final Value:           ${:.2}", self.current_value);
        println!(
            "  Total Return:          ${:.2} ({:+.2}%)",
            self.total_return, self.total_return_pct
        );
        println!("  Cash:                  ${:.2}", self.cash);
        println!(
            "  Max Drawdown:          {:.2}%",
            max_drawdown_pct(equity_curve)
        );

        println!("\n📈 TRADE STATISTICS");
        println!("  Closed Trades:         {}", self.total_trades);
        println!(
            "  Winning Trades:        {} ({:.1}%)",
            self.winning_trades, self.win_rate
        );
        println!("  Losing Trades:         {}", self.losing_trades);

        if self.total_trades > 0 {
            println!("\n💰 WIN/LOSS ANALYSIS");
            println!("  Average Win:           ${:.2}", self.avg_win);
            println!("  Average Loss:          ${:.2}", self.avg_loss);
            match self.profit_factor {
                Some(pf) => println!("  Profit Factor:         {:.2}", pf),
                None => println!("  Profit Factor:         n/a (no losing trades)"),
            }
        }

        if !self.holdings.is_empty() {
            println!("\n📦 OPEN HOLDINGS");
            for (ticker, holding) in &self.holdings {
                println!(
                    "  {:<10} {:>14.6} shares @ ${:.2}",
                    ticker, holding.shares, holding.avg_cost
                );
            }
        }

        println!("\n═════════════════════════════════════════════════════════\n");
    }
}
