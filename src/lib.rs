// Core modules
pub mod agents;
pub mod backtest;
pub mod consensus;
pub mod data;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod persistence;
pub mod risk;
pub mod settings;

// Re-export commonly used types
pub use agents::DecisionSource;
pub use backtest::{BacktestRunner, RunResult, RunnerOptions};
pub use consensus::ConsensusEngine;
pub use error::Error;
pub use execution::PortfolioSimulator;
pub use models::*;
pub use persistence::ResultsStore;

// Error handling
pub type Result<T> = std::result::Result<T, Error>;
