use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the backtest engine
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid run configuration: {0}")]
    InvalidConfig(String),

    #[error("Consensus requires at least one decision")]
    EmptyDecisionSet,

    #[error("Backtest requires at least one decision source")]
    NoSources,

    #[error("Market data error: {0}")]
    Data(String),

    #[error("Failed to persist run record at {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("LLM decision source error: {0}")]
    Llm(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Persistence {
            path: path.into(),
            source,
        }
    }
}
