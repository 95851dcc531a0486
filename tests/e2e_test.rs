use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use teamtrader::agents::{
    DecisionSource, FixedSource, LlmDecisionSource, LlmSourceConfig, RiskGuard, TrendFollower,
    VolumeMomentum,
};
use teamtrader::backtest::{MarketScenario, SyntheticDataGenerator};
use teamtrader::persistence::{read_journal, JournalEntry};
use teamtrader::risk::ExitRules;
use teamtrader::*;

fn team() -> Vec<Arc<dyn DecisionSource>> {
    vec![
        Arc::new(TrendFollower::default()),
        Arc::new(VolumeMomentum::default()),
        Arc::new(RiskGuard::default()),
    ]
}

/// Replay the trade journal (net of fees) and check cash and share conservation at every fill
fn assert_conservation(result: &RunResult) {
    let mut cash = result.config.initial_capital;
    let mut held: HashMap<&str, f64> = HashMap::new();

    for trade in &result.trades {
        let shares = held.entry(trade.ticker.as_str()).or_insert(0.0);
        match trade.action {
            TradeSide::Buy => {
                cash -= trade.shares * trade.price + trade.fee.unwrap_or(0.0);
                *shares += trade.shares;
            }
            TradeSide::Sell => {
                assert!(
                    trade.shares <= *shares + 1e-9,
                    "sold {} of {} held",
                    trade.shares,
                    shares
                );
                cash += trade.shares * trade.price - trade.fee.unwrap_or(0.0);
                *shares -= trade.shares;
            }
        }
        assert!(cash >= -1e-6, "cash went negative: {}", cash);
    }

    assert!((cash - result.final_metrics.cash).abs() < 1e-6);
}

#[tokio::test]
async fn test_e2e_team_backtest() {
    tracing_subscriber::fmt()
        .with_env_filter("teamtrader=debug")
        .try_init()
        .ok();

    println!("=== Starting E2E Backtest ===\n");

    // 1. Market data
    let config = RunConfig::new(["BTC-USD", "ETH-USD"], 10, 10_000.0, 2).unwrap();
    let start = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    let market = SyntheticDataGenerator::new(11).generate_for_config(
        &config,
        MarketScenario::Volatile,
        start,
    );
    println!("1. Generated {} hourly rows per ticker", market["BTC-USD"].len());

    // 2. Run with a journal
    let dir = tempfile::tempdir().unwrap();
    let store = ResultsStore::new(dir.path());
    let journal = store.journal("e2e").unwrap();
    let mut runner = BacktestRunner::new(config.clone(), team(), RunnerOptions::default())
        .unwrap()
        .with_journal(journal);
    let result = runner.run(&market).await.unwrap();
    println!(
        "2. Run finished: {} trades, final value ${:.2}",
        result.trades.len(),
        result.final_metrics.current_value
    );

    assert_eq!(result.equity_curve.len(), 240);
    assert_eq!(runner.decision_log().len(), 240);
    assert_conservation(&result);

    // 3. Incremental journal matches the in-memory record
    let entries = read_journal(store.journal_path("e2e")).unwrap();
    let journal_trades: Vec<&Trade> = entries
        .iter()
        .filter_map(|e| match e {
            JournalEntry::Trade(t) => Some(t),
            _ => None,
        })
        .collect();
    assert_eq!(journal_trades.len(), result.trades.len());
    println!("3. Journal holds {} entries", entries.len());

    // 4. Save and load round trip
    let path = store.save("e2e", &result).unwrap();
    let loaded = store.load("e2e").unwrap();
    assert_eq!(loaded, result);
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        serde_json::to_string_pretty(&loaded).unwrap()
    );
    println!("4. Round trip through {} OK", path.display());

    result.print_report();
}

#[tokio::test]
async fn test_e2e_unreliable_llm_member_does_not_halt_run() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/v1/chat/completions")
        .with_status(500)
        .with_body("upstream exploded")
        .create_async()
        .await;

    let llm = LlmDecisionSource::new(LlmSourceConfig {
        api_url: format!("{}/v1/chat/completions", server.url()),
        api_key: "test".to_string(),
        requests_per_minute: 60_000,
        max_retries: 1,
        retry_delay_ms: 0,
        ..Default::default()
    })
    .unwrap();

    let mut sources = team();
    sources.push(Arc::new(llm));

    let config = RunConfig::new(["BTC-USD"], 1, 10_000.0, 6).unwrap();
    let start = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    let market = SyntheticDataGenerator::new(5).generate_for_config(
        &config,
        MarketScenario::Sideways,
        start,
    );

    let options = RunnerOptions {
        decision_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    let mut runner = BacktestRunner::new(config, sources, options).unwrap();
    let result = runner.run(&market).await.unwrap();

    assert_eq!(result.equity_curve.len(), 24);
    assert_eq!(runner.decision_log().len(), 4);
    for record in runner.decision_log() {
        assert_eq!(record.fallbacks, 1);
        let llm_decision = record
            .decisions
            .iter()
            .find(|d| d.source_id == "llm_trader")
            .unwrap();
        assert_eq!(llm_decision.action, Action::Hold);
        assert_eq!(llm_decision.amount, 0.0);
    }
}

#[tokio::test]
async fn test_e2e_persistence_failure_is_surfaced() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, "x").unwrap();

    let config = RunConfig::new(["BTC-USD"], 1, 10_000.0, 1).unwrap();
    let market = SyntheticDataGenerator::new(1).generate_for_config(
        &config,
        MarketScenario::Uptrend,
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
    );
    let mut runner = BacktestRunner::new(config, team(), RunnerOptions::default()).unwrap();
    let result = runner.run(&market).await.unwrap();

    let err = ResultsStore::new(&blocker).save("run", &result).unwrap_err();
    assert!(matches!(err, Error::Persistence { .. }));
}

#[tokio::test]
async fn test_e2e_fees_keep_cash_conserved() {
    let buy = Decision::new("dca", Action::Buy, 750.0, 0.8, "dca", "accumulate");
    let sources: Vec<Arc<dyn DecisionSource>> = vec![
        Arc::new(FixedSource::new(buy.clone())),
        Arc::new(FixedSource::new(Decision { source_id: "dca_2".to_string(), ..buy })),
        Arc::new(TrendFollower::default()),
    ];

    let config = RunConfig::new(["BTC-USD"], 5, 10_000.0, 3).unwrap();
    let market = SyntheticDataGenerator::new(9).generate_for_config(
        &config,
        MarketScenario::Volatile,
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
    );
    let options = RunnerOptions {
        transaction_cost: 0.001,
        exit_rules: ExitRules {
            stop_loss_pct: Some(0.03),
            take_profit_pct: Some(0.03),
        },
        ..Default::default()
    };
    let mut runner = BacktestRunner::new(config, sources, options).unwrap();
    let result = runner.run(&market).await.unwrap();

    assert!(!result.trades.is_empty());
    assert!(result.trades.iter().all(|t| t.fee.is_some_and(|fee| fee > 0.0)));
    assert!(result.final_metrics.cash >= 0.0);
    assert_conservation(&result);
}
