// Backtest module: step loop, metrics and synthetic market data
pub mod metrics;
pub mod runner;
pub mod synthetic;

pub use metrics::{max_drawdown_pct, FinalMetrics, Holding, MetricsCalculator};
pub use runner::{BacktestRunner, DecisionRecord, RunResult, RunnerOptions};
pub use synthetic::{MarketScenario, SyntheticDataGenerator};
