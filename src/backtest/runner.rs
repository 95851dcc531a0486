use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::agents::{gather_decisions, DecisionSource, DEFAULT_DECISION_TIMEOUT};
use crate::backtest::metrics::{FinalMetrics, MetricsCalculator};
use crate::consensus::{ConsensusEngine, VoteTally};
use crate::error::Error;
use crate::execution::{ExecutionOutcome, FillPolicy, PortfolioSimulator};
use crate::indicators::{SignalCalculator, DEFAULT_EMA_WINDOW};
use crate::models::{Decision, EquityPoint, MarketContext, MarketRow, RunConfig, Trade};
use crate::persistence::{JournalEntry, JournalWriter};
use crate::risk::ExitRules;
use crate::Result;

/// Engine knobs that do not change the time axis
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunnerOptions {
    pub ema_window: usize,
    pub decision_timeout: Duration,
    pub fill_policy: FillPolicy,
    pub exit_rules: ExitRules,
    /// Fee per fill as a fraction of its gross value (0.001 = 0.1%)
    pub transaction_cost: f64,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            ema_window: DEFAULT_EMA_WINDOW,
            decision_timeout: DEFAULT_DECISION_TIMEOUT,
            fill_policy: FillPolicy::default(),
            exit_rules: ExitRules::default(),
            transaction_cost: 0.0,
        }
    }
}

/// What the team decided for one ticker at one decision step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub date: DateTime<Utc>,
    pub ticker: String,
    pub price: f64,
    pub decisions: Vec<Decision>,
    pub fallbacks: usize,
    pub consensus: Decision,
    pub tally: VoteTally,
    pub outcome: ExecutionOutcome,
}

/// Complete record of a finished run; the persisted document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub config: RunConfig,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub final_metrics: FinalMetrics,
}

impl RunResult {
    pub fn print_report(&self) {
        self.final_metrics
            .print_report(&self.config, &self.equity_curve);
    }
}

/// Per-ticker close history and a cursor aligned to the run's time axis
struct TickerSeries<'a> {
    ticker: &'a str,
    rows: &'a [MarketRow],
    closes: Vec<f64>,
    cursor: usize,
}

impl<'a> TickerSeries<'a> {
    fn new(ticker: &'a str, rows: &'a [MarketRow]) -> Self {
        Self {
            ticker,
            rows,
            closes: rows.iter().map(|r| r.close).collect(),
            cursor: 0,
        }
    }

    /// Index of the row stamped exactly `timestamp`, advancing the cursor
    fn seek(&mut self, timestamp: DateTime<Utc>) -> Option<usize> {
        while self.cursor < self.rows.len() && self.rows[self.cursor].timestamp < timestamp {
            self.cursor += 1;
        }
        match self.rows.get(self.cursor) {
            Some(row) if row.timestamp == timestamp => Some(self.cursor),
            _ => None,
        }
    }
}

/// Replays market rows through the decision team and the portfolio simulator
pub struct BacktestRunner {
    config: RunConfig,
    sources: Vec<Arc<dyn DecisionSource>>,
    options: RunnerOptions,
    consensus: ConsensusEngine,
    journal: Option<JournalWriter>,
    decision_log: Vec<DecisionRecord>,
}

impl BacktestRunner {
    pub fn new(
        config: RunConfig,
        sources: Vec<Arc<dyn DecisionSource>>,
        options: RunnerOptions,
    ) -> Result<Self> {
        config.validate()?;
        if sources.is_empty() {
            return Err(Error::NoSources);
        }
        let cost = options.transaction_cost;
        if !(0.0..1.0).contains(&cost) {
            return Err(Error::InvalidConfig(format!(
                "transaction_cost must be in [0, 1), got {}",
                cost
            )));
        }

        Ok(Self {
            config,
            sources,
            options,
            consensus: ConsensusEngine::new(),
            journal: None,
            decision_log: Vec::new(),
        })
    }

    /// Append trades, equity points and decisions to `journal` as they happen
    pub fn with_journal(mut self, journal: JournalWriter) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Decision records of the most recent run
    pub fn decision_log(&self) -> &[DecisionRecord] {
        &self.decision_log
    }

    /// Run the full backtest over `market` (rows keyed by ticker)
    ///
    /// The first configured ticker defines the time axis. Only a journal write
    /// failure aborts the run.
    pub async fn run(&mut self, market: &BTreeMap<String, Vec<MarketRow>>) -> Result<RunResult> {
        let mut series = Vec::with_capacity(self.config.tickers.len());
        for ticker in &self.config.tickers {
            match market.get_key_value(ticker) {
                Some((key, rows)) if !rows.is_empty() => series.push(TickerSeries::new(key, rows)),
                _ => {
                    return Err(Error::Data(format!("no market rows for {}", ticker)));
                }
            }
        }

        let axis: Vec<DateTime<Utc>> = series[0].rows.iter().map(|r| r.timestamp).collect();
        let interval = self.config.decision_interval_hours as usize;
        let signals = SignalCalculator::new(self.options.ema_window);
        let mut simulator =
            PortfolioSimulator::new(self.config.initial_capital, self.options.fill_policy)
                .with_transaction_cost(self.options.transaction_cost);
        self.decision_log.clear();

        tracing::info!(
            "Starting backtest: {} steps, tickers [{}], {} sources, decide every {}h, capital ${:.2}",
            axis.len(),
            self.config.tickers.join(", "),
            self.sources.len(),
            interval,
            self.config.initial_capital
        );

        let mut fallback_count = 0;
        let mut rejected_count = 0;

        for (step, &timestamp) in axis.iter().enumerate() {
            // Locate this step's row for every ticker
            let mut present: Vec<(usize, usize)> = Vec::with_capacity(series.len());
            for (s, ticker_series) in series.iter_mut().enumerate() {
                if let Some(row) = ticker_series.seek(timestamp) {
                    simulator.update_price(ticker_series.ticker, ticker_series.rows[row].close);
                    present.push((s, row));
                } else {
                    tracing::debug!(
                        "{} has no row at {}, skipping",
                        ticker_series.ticker,
                        timestamp
                    );
                }
            }

            if self.options.exit_rules.is_enabled() {
                for &(s, row) in &present {
                    let ticker = series[s].ticker;
                    let price = series[s].rows[row].close;
                    let exit = simulator
                        .state()
                        .position(ticker)
                        .and_then(|p| self.options.exit_rules.exit_decision(p, price));

                    if let Some(decision) = exit {
                        let outcome = simulator.apply(ticker, &decision, price, timestamp);
                        if let Some(trade) = outcome.trade() {
                            tracing::info!("{} triggered for {}", decision.strategy, ticker);
                            self.journal(JournalEntry::Trade(trade.clone()))?;
                        }
                    }
                }
            }

            if step % interval == 0 {
                for &(s, row) in &present {
                    let ticker = series[s].ticker;
                    let market_row = &series[s].rows[row];
                    let signal = signals.compute(&series[s].closes[..=row]);
                    let (ema_proj_1, ema_proj_2) = match signal.projections() {
                        Some((p1, p2)) => (Some(p1), Some(p2)),
                        None => (None, None),
                    };

                    let ctx = MarketContext {
                        ticker: ticker.to_string(),
                        price: market_row.close,
                        volume: market_row.volume,
                        ema: signal.ema(),
                        ema_proj_1,
                        ema_proj_2,
                        timestamp,
                        cash: simulator.cash(),
                        position: simulator.state().position(ticker).cloned(),
                    };

                    let outcomes =
                        gather_decisions(&self.sources, &ctx, self.options.decision_timeout).await;
                    let fallbacks = outcomes.iter().filter(|o| o.is_fallback()).count();
                    fallback_count += fallbacks;

                    let decisions: Vec<Decision> =
                        outcomes.into_iter().map(|o| o.into_decision()).collect();
                    let consensus = self.consensus.aggregate_with_tally(&decisions)?;

                    let outcome =
                        simulator.apply(ticker, &consensus.decision, ctx.price, timestamp);
                    if outcome.is_rejected() {
                        rejected_count += 1;
                    }

                    let record = DecisionRecord {
                        date: timestamp,
                        ticker: ticker.to_string(),
                        price: ctx.price,
                        decisions,
                        fallbacks,
                        consensus: consensus.decision,
                        tally: consensus.tally,
                        outcome,
                    };

                    if let Some(trade) = record.outcome.trade() {
                        self.journal(JournalEntry::Trade(trade.clone()))?;
                    }
                    self.journal(JournalEntry::Decision(record.clone()))?;
                    self.decision_log.push(record);
                }
            }

            let point = simulator.record_equity(timestamp);
            tracing::debug!("Step {} @ {}: equity ${:.2}", step, timestamp, point.value);
            self.journal(JournalEntry::Equity(point))?;
            self.flush_journal()?;
        }

        let (state, trades, equity_curve, last_prices) = simulator.into_parts();
        let final_metrics =
            MetricsCalculator::calculate(&self.config, &trades, &state, &last_prices);

        tracing::info!(
            "Backtest complete: {} trades, {} rejected, {} fallbacks, final value ${:.2} ({:+.2}%)",
            trades.len(),
            rejected_count,
            fallback_count,
            final_metrics.current_value,
            final_metrics.total_return_pct
        );

        Ok(RunResult {
            config: self.config.clone(),
            trades,
            equity_curve,
            final_metrics,
        })
    }

    fn journal(&mut self, entry: JournalEntry) -> Result<()> {
        if let Some(journal) = self.journal.as_mut() {
            if let Err(e) = journal.append(&entry) {
                tracing::error!("Journal write failed, aborting run: {}", e);
                return Err(e);
            }
        }
        Ok(())
    }

    fn flush_journal(&mut self) -> Result<()> {
        match self.journal.as_mut() {
            Some(journal) => journal.flush(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{DecisionOutcome, FixedSource, RiskGuard, TrendFollower, VolumeMomentum};
    use crate::backtest::synthetic::{MarketScenario, SyntheticDataGenerator};
    use crate::models::{Action, TradeSide};
    use crate::persistence::read_journal;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn flat_rows(n: usize, price: f64) -> Vec<MarketRow> {
        (0..n)
            .map(|i| MarketRow {
                timestamp: start() + ChronoDuration::hours(i as i64),
                open: price,
                high: price,
                low: price,
                close: price,
                volume: 1_000.0,
            })
            .collect()
    }

    fn market(rows: Vec<MarketRow>) -> BTreeMap<String, Vec<MarketRow>> {
        BTreeMap::from([("X".to_string(), rows)])
    }

    fn buyer(notional: f64) -> Arc<dyn DecisionSource> {
        Arc::new(FixedSource::new(Decision::new(
            "buyer",
            Action::Buy,
            notional,
            0.9,
            "scripted",
            "always buy",
        )))
    }

    struct Stalled;

    #[async_trait]
    impl DecisionSource for Stalled {
        fn id(&self) -> &str {
            "stalled"
        }

        async fn decide(&self, _ctx: &MarketContext) -> DecisionOutcome {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    #[tokio::test]
    async fn test_one_equity_point_per_step_and_no_overdraft() {
        let config = RunConfig::new(["X"], 1, 10_000.0, 1).unwrap();
        let mut runner =
            BacktestRunner::new(config, vec![buyer(5_000.0)], RunnerOptions::default()).unwrap();

        let result = runner.run(&market(flat_rows(10, 100.0))).await.unwrap();

        assert_eq!(result.equity_curve.len(), 10);
        assert_eq!(result.trades.len(), 2);
        assert!(result.trades.iter().all(|t| t.action == TradeSide::Buy));
        assert!(result.final_metrics.cash >= 0.0);
        assert_eq!(
            runner.decision_log().iter().filter(|r| r.outcome.is_rejected()).count(),
            8
        );
        for point in &result.equity_curve {
            assert!((point.value - 10_000.0).abs() < 1e-6);
        }
    }

    #[tokio::test]
    async fn test_transaction_cost_reduces_cash_and_equity() {
        let config = RunConfig::new(["X"], 1, 10_000.0, 1).unwrap();
        let options = RunnerOptions {
            transaction_cost: 0.001,
            ..Default::default()
        };
        let mut runner = BacktestRunner::new(config, vec![buyer(5_000.0)], options).unwrap();

        let result = runner.run(&market(flat_rows(10, 100.0))).await.unwrap();

        // 5000 + 5 fee leaves 4995, too little for a second 5005 fill
        assert_eq!(result.trades.len(), 1);
        assert!((result.trades[0].fee.unwrap() - 5.0).abs() < 1e-9);
        assert!((result.final_metrics.cash - 4_995.0).abs() < 1e-9);
        for point in &result.equity_curve {
            assert!((point.value - 9_995.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_out_of_range_transaction_cost_rejected() {
        let config = RunConfig::new(["X"], 1, 10_000.0, 1).unwrap();
        for cost in [-0.01, 1.0, f64::NAN] {
            let options = RunnerOptions {
                transaction_cost: cost,
                ..Default::default()
            };
            assert!(matches!(
                BacktestRunner::new(config.clone(), vec![buyer(1.0)], options),
                Err(Error::InvalidConfig(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_decision_interval_skips_steps() {
        let config = RunConfig::new(["X"], 1, 10_000.0, 4).unwrap();
        let mut runner = BacktestRunner::new(
            config,
            vec![Arc::new(RiskGuard::default())],
            RunnerOptions::default(),
        )
        .unwrap();

        let result = runner.run(&market(flat_rows(10, 100.0))).await.unwrap();

        assert_eq!(result.equity_curve.len(), 10);
        let dates: Vec<_> = runner.decision_log().iter().map(|r| r.date).collect();
        assert_eq!(
            dates,
            vec![
                start(),
                start() + ChronoDuration::hours(4),
                start() + ChronoDuration::hours(8)
            ]
        );
    }

    #[tokio::test]
    async fn test_rejects_missing_sources_and_data() {
        let config = RunConfig::new(["X", "Y"], 1, 10_000.0, 1).unwrap();
        assert!(matches!(
            BacktestRunner::new(config.clone(), vec![], RunnerOptions::default()),
            Err(Error::NoSources)
        ));

        let mut runner =
            BacktestRunner::new(config, vec![buyer(1.0)], RunnerOptions::default()).unwrap();
        let err = runner.run(&market(flat_rows(5, 100.0))).await.unwrap_err();
        assert!(matches!(err, Error::Data(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_source_does_not_halt_run() {
        let config = RunConfig::new(["X"], 1, 10_000.0, 1).unwrap();
        let options = RunnerOptions {
            decision_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let sources: Vec<Arc<dyn DecisionSource>> =
            vec![Arc::new(Stalled), buyer(100.0), buyer(100.0)];
        let mut runner = BacktestRunner::new(config, sources, options).unwrap();

        let result = runner.run(&market(flat_rows(3, 100.0))).await.unwrap();

        assert_eq!(result.equity_curve.len(), 3);
        assert_eq!(result.trades.len(), 3);
        assert!(runner.decision_log().iter().all(|r| r.fallbacks == 1));
    }

    #[tokio::test]
    async fn test_secondary_ticker_aligned_by_timestamp() {
        let config = RunConfig::new(["X", "Y"], 1, 10_000.0, 1).unwrap();
        let mut y_rows = flat_rows(6, 50.0);
        y_rows.remove(2);
        let market = BTreeMap::from([
            ("X".to_string(), flat_rows(6, 100.0)),
            ("Y".to_string(), y_rows),
        ]);

        let mut runner =
            BacktestRunner::new(config, vec![buyer(100.0)], RunnerOptions::default()).unwrap();
        let result = runner.run(&market).await.unwrap();

        assert_eq!(result.equity_curve.len(), 6);
        let y_decisions = runner.decision_log().iter().filter(|r| r.ticker == "Y").count();
        assert_eq!(y_decisions, 5);
        assert_eq!(result.final_metrics.holdings.len(), 2);
    }

    #[tokio::test]
    async fn test_take_profit_exit() {
        let config = RunConfig::new(["X"], 1, 10_000.0, 1).unwrap();
        let mut rows = flat_rows(4, 100.0);
        rows[2].close = 120.0;
        rows[3].close = 120.0;
        let options = RunnerOptions {
            exit_rules: ExitRules {
                stop_loss_pct: None,
                take_profit_pct: Some(0.1),
            },
            ..Default::default()
        };
        let mut runner = BacktestRunner::new(config, vec![buyer(1_000.0)], options).unwrap();

        let result = runner.run(&market(rows)).await.unwrap();

        let sells: Vec<&Trade> = result
            .trades
            .iter()
            .filter(|t| t.action == TradeSide::Sell)
            .collect();
        assert_eq!(sells.len(), 1);
        assert!(sells[0].reason.starts_with("take profit"));
        assert!((sells[0].pnl.unwrap() - 400.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_rule_team_on_synthetic_uptrend() {
        let config = RunConfig::new(["BTC-USD"], 5, 10_000.0, 1).unwrap();
        let market = SyntheticDataGenerator::new(42).generate_for_config(
            &config,
            MarketScenario::Uptrend,
            start(),
        );
        let sources: Vec<Arc<dyn DecisionSource>> = vec![
            Arc::new(TrendFollower::default()),
            Arc::new(VolumeMomentum::default()),
            Arc::new(RiskGuard::default()),
        ];
        let mut runner = BacktestRunner::new(config, sources, RunnerOptions::default()).unwrap();

        let result = runner.run(&market).await.unwrap();

        assert_eq!(result.equity_curve.len(), 120);
        assert!(result.final_metrics.cash >= 0.0);
        // Nothing can be decided before the EMA window fills
        assert!(result.trades.iter().all(|t| t.date >= start() + ChronoDuration::hours(47)));
    }

    #[tokio::test]
    async fn test_journal_receives_every_step() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.journal.jsonl");
        let config = RunConfig::new(["X"], 1, 10_000.0, 2).unwrap();

        let journal = JournalWriter::create(&path).unwrap();
        let mut runner = BacktestRunner::new(config, vec![buyer(100.0)], RunnerOptions::default())
            .unwrap()
            .with_journal(journal);
        runner.run(&market(flat_rows(4, 100.0))).await.unwrap();

        let entries = read_journal(&path).unwrap();
        let count = |f: fn(&JournalEntry) -> bool| entries.iter().filter(|e| f(e)).count();
        assert_eq!(count(|e| matches!(e, JournalEntry::Equity(_))), 4);
        assert_eq!(count(|e| matches!(e, JournalEntry::Decision(_))), 2);
        assert_eq!(count(|e| matches!(e, JournalEntry::Trade(_))), 2);
    }
}
