// Layered settings: defaults, optional TOML file, then TEAMTRADER__* environment
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agents::llm::{LlmSourceConfig, DEFAULT_API_URL, DEFAULT_MODEL};
use crate::backtest::RunnerOptions;
use crate::error::Error;
use crate::execution::FillPolicy;
use crate::indicators::DEFAULT_EMA_WINDOW;
use crate::models::RunConfig;
use crate::risk::ExitRules;
use crate::Result;

pub const DEFAULT_CONFIG_FILE: &str = "teamtrader";
pub const ENV_PREFIX: &str = "TEAMTRADER";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub run: RunConfig,
    pub engine: EngineSettings,
    pub llm: LlmSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub ema_window: usize,
    pub decision_timeout_secs: u64,
    pub fill_policy: FillPolicy,
    pub stop_loss_pct: Option<f64>,
    pub take_profit_pct: Option<f64>,
    /// Fee per fill as a fraction of gross value; 0 disables fees
    pub transaction_cost: f64,
    pub results_dir: PathBuf,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            ema_window: DEFAULT_EMA_WINDOW,
            decision_timeout_secs: 30,
            fill_policy: FillPolicy::Reject,
            stop_loss_pct: None,
            take_profit_pct: None,
            transaction_cost: 0.0,
            results_dir: PathBuf::from("results"),
        }
    }
}

impl EngineSettings {
    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            ema_window: self.ema_window.max(1),
            decision_timeout: Duration::from_secs(self.decision_timeout_secs.max(1)),
            fill_policy: self.fill_policy,
            exit_rules: ExitRules {
                stop_loss_pct: self.stop_loss_pct,
                take_profit_pct: self.take_profit_pct,
            },
            transaction_cost: self.transaction_cost,
        }
    }
}

/// Model-backed team member; the API key is read from `api_key_env`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub enabled: bool,
    pub api_url: String,
    pub model: String,
    pub api_key_env: String,
    pub requests_per_minute: u32,
    pub max_retries: u32,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: DEFAULT_API_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            requests_per_minute: 30,
            max_retries: 3,
        }
    }
}

impl LlmSettings {
    pub fn source_config(&self) -> Result<LlmSourceConfig> {
        let api_key = std::env::var(&self.api_key_env).map_err(|_| {
            Error::InvalidConfig(format!(
                "LLM source enabled but {} is not set",
                self.api_key_env
            ))
        })?;

        Ok(LlmSourceConfig {
            api_url: self.api_url.clone(),
            api_key,
            model: self.model.clone(),
            requests_per_minute: self.requests_per_minute,
            max_retries: self.max_retries,
            ..Default::default()
        })
    }
}

impl Settings {
    /// Load settings; `path` makes the file mandatory, otherwise
    /// `teamtrader.toml` in the working directory is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let settings: Settings = Config::builder()
            .add_source(Config::try_from(&Settings::default())?)
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("run.tickers")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.run.validate()?;
        Ok(settings)
    }
}
