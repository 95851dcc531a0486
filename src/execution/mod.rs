// Order execution module
pub mod simulator;

pub use simulator::{ExecutionOutcome, FillPolicy, PortfolioSimulator, PortfolioState};
