// Market data loading from JSON files
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::Error;
use crate::models::MarketRow;
use crate::Result;

/// Load `{ "TICKER": [rows...] }` from a JSON file
///
/// Rows are sorted by timestamp and exact duplicate timestamps are dropped
/// (first occurrence wins).
pub fn load_market_file(path: impl AsRef<Path>) -> Result<BTreeMap<String, Vec<MarketRow>>> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path)
        .map_err(|e| Error::Data(format!("cannot read {}: {}", path.display(), e)))?;

    let raw: BTreeMap<String, Vec<MarketRow>> = serde_json::from_str(&json)
        .map_err(|e| Error::Data(format!("malformed market file {}: {}", path.display(), e)))?;

    let mut market = BTreeMap::new();
    for (ticker, rows) in raw {
        market.insert(ticker.clone(), normalize_rows(&ticker, rows)?);
    }

    tracing::info!(
        "Loaded {} tickers from {}",
        market.len(),
        path.display()
    );

    Ok(market)
}

/// Sort, dedupe and sanity-check one ticker's rows
pub fn normalize_rows(ticker: &str, mut rows: Vec<MarketRow>) -> Result<Vec<MarketRow>> {
    if rows.is_empty() {
        return Err(Error::Data(format!("{} has no rows", ticker)));
    }

    rows.sort_by_key(|r| r.timestamp);
    let before = rows.len();
    rows.dedup_by_key(|r| r.timestamp);
    if rows.len() < before {
        tracing::warn!(
            "{}: dropped {} rows with duplicate timestamps",
            ticker,
            before - rows.len()
        );
    }

    if let Some(bad) = rows.iter().find(|r| !(r.close.is_finite() && r.close > 0.0)) {
        return Err(Error::Data(format!(
            "{} has invalid close {} at {}",
            ticker, bad.close, bad.timestamp
        )));
    }

    Ok(rows)
}
