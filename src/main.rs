use anyhow::{Context, Result};
use chrono::{DurationRound, TimeDelta, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use teamtrader::agents::{
    DecisionSource, LlmDecisionSource, RiskGuard, TrendFollower, VolumeMomentum,
};
use teamtrader::backtest::{BacktestRunner, MarketScenario, SyntheticDataGenerator};
use teamtrader::data::load_market_file;
use teamtrader::models::RunConfig;
use teamtrader::persistence::ResultsStore;
use teamtrader::settings::Settings;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "teamtrader", about = "Multi-agent consensus backtester")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay market data through the decision team and save the run record
    Run {
        /// TOML settings file (defaults to ./teamtrader.toml when present)
        #[arg(long)]
        config: Option<PathBuf>,

        /// JSON market file `{ticker: [rows]}`; synthetic data when omitted
        #[arg(long, conflicts_with = "scenario")]
        data: Option<PathBuf>,

        /// Synthetic scenario: uptrend, downtrend, sideways, volatile
        #[arg(long)]
        scenario: Option<MarketScenario>,

        /// Seed for synthetic data
        #[arg(long, default_value_t = 42)]
        seed: u64,

        #[arg(long)]
        days: Option<u32>,

        /// Hours between team decisions
        #[arg(long)]
        interval: Option<u32>,

        #[arg(long)]
        capital: Option<f64>,

        /// Fee per fill as a fraction of gross value (e.g. 0.001)
        #[arg(long)]
        transaction_cost: Option<f64>,

        /// Comma-separated tickers (e.g. BTC-USD,ETH-USD)
        #[arg(long, value_delimiter = ',')]
        tickers: Option<Vec<String>>,

        /// Name of the saved record; random when omitted
        #[arg(long)]
        name: Option<String>,

        /// Add the LLM-backed trader to the team
        #[arg(long, default_value_t = false)]
        llm: bool,
    },
    /// Print the metrics report of a saved run
    Report {
        name: String,

        /// Results directory (defaults to the configured results_dir)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            data,
            scenario,
            seed,
            days,
            interval,
            capital,
            transaction_cost,
            tickers,
            name,
            llm,
        } => {
            let mut settings =
                Settings::load(config.as_deref()).context("Failed to load settings")?;

            let run = &settings.run;
            let run_config = RunConfig::new(
                tickers.unwrap_or_else(|| run.tickers.clone()),
                days.unwrap_or(run.days),
                capital.unwrap_or(run.initial_capital),
                interval.unwrap_or(run.decision_interval_hours),
            )?;
            settings.llm.enabled |= llm;
            if let Some(cost) = transaction_cost {
                settings.engine.transaction_cost = cost;
            }

            let market = match &data {
                Some(path) => load_market_file(path).with_context(|| {
                    format!("Failed to load market data from {}", path.display())
                })?,
                None => {
                    let scenario = scenario.unwrap_or(MarketScenario::Uptrend);
                    let start = Utc::now().duration_trunc(TimeDelta::hours(1))?
                        - TimeDelta::hours(run_config.days as i64 * 24);
                    tracing::info!("Generating synthetic {:?} market (seed {})", scenario, seed);
                    SyntheticDataGenerator::new(seed)
                        .generate_for_config(&run_config, scenario, start)
                }
            };

            let mut sources: Vec<Arc<dyn DecisionSource>> = vec![
                Arc::new(TrendFollower::default()),
                Arc::new(VolumeMomentum::default()),
                Arc::new(RiskGuard::default()),
            ];
            if settings.llm.enabled {
                let llm_config = settings.llm.source_config()?;
                tracing::info!("LLM trader enabled ({})", llm_config.model);
                sources.push(Arc::new(LlmDecisionSource::new(llm_config)?));
            }

            let name = name.unwrap_or_else(|| {
                format!("team_{}", &Uuid::new_v4().simple().to_string()[..8])
            });
            let store = ResultsStore::new(&settings.engine.results_dir);
            let journal = store.journal(&name)?;

            let mut runner =
                BacktestRunner::new(run_config, sources, settings.engine.runner_options())?
                    .with_journal(journal);

            let result = runner
                .run(&market)
                .await
                .with_context(|| format!("Backtest '{}' aborted", name))?;

            let path = store
                .save(&name, &result)
                .with_context(|| format!("Failed to save run '{}'", name))?;

            result.print_report();
            println!("Saved run record to {}", path.display());
        }
        Commands::Report { name, dir } => {
            let dir = match dir {
                Some(dir) => dir,
                None => Settings::load(None)?.engine.results_dir,
            };
            let result = ResultsStore::new(dir)
                .load(&name)
                .with_context(|| format!("Failed to load run '{}'", name))?;
            result.print_report();
        }
    }

    Ok(())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("teamtrader=info")),
        )
        .init();
}
