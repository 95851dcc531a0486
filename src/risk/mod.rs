// Risk management module
pub mod exit_rules;

pub use exit_rules::{ExitRules, ExitTrigger, RISK_EXIT_SOURCE_ID};
