use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

use crate::models::{MarketRow, RunConfig};

/// Market scenario types for synthetic data generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketScenario {
    /// Steady uptrend with noise (+2% daily average)
    Uptrend,
    /// Steady downtrend with noise (-2% daily average)
    Downtrend,
    /// Mean-reverting chop (±1% around the base price)
    Sideways,
    /// Large swings (±5% per row)
    Volatile,
}

impl std::str::FromStr for MarketScenario {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uptrend" | "up" => Ok(MarketScenario::Uptrend),
            "downtrend" | "down" => Ok(MarketScenario::Downtrend),
            "sideways" | "flat" => Ok(MarketScenario::Sideways),
            "volatile" => Ok(MarketScenario::Volatile),
            other => Err(format!(
                "unknown scenario '{}' (expected uptrend, downtrend, sideways or volatile)",
                other
            )),
        }
    }
}

/// Generates hourly OHLCV rows for offline runs
pub struct SyntheticDataGenerator {
    rng: StdRng,
    base_price: f64,
    base_volume: f64,
}

impl SyntheticDataGenerator {
    /// Create a new generator with a seed for reproducibility
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            base_price: 150.0,
            base_volume: 1_000_000.0,
        }
    }

    /// Generate `num_rows` hourly rows starting at `start`
    pub fn generate(
        &mut self,
        scenario: MarketScenario,
        num_rows: usize,
        start: DateTime<Utc>,
    ) -> Vec<MarketRow> {
        let mut rows = Vec::with_capacity(num_rows);
        let mut price = self.base_price;

        // +-2% per day spread over 24 hourly rows
        let hourly_drift = 0.02 / 24.0;

        for i in 0..num_rows {
            let timestamp = start + Duration::hours(i as i64);

            price += match scenario {
                MarketScenario::Uptrend => {
                    price * hourly_drift + price * self.rng.gen_range(-0.001..0.001)
                }
                MarketScenario::Downtrend => {
                    -price * hourly_drift + price * self.rng.gen_range(-0.001..0.001)
                }
                MarketScenario::Sideways => {
                    (self.base_price - price) * 0.1 + price * self.rng.gen_range(-0.01..0.01)
                }
                MarketScenario::Volatile => price * self.rng.gen_range(-0.05..0.05),
            };

            if price < self.base_price * 0.5 {
                price = self.base_price * 0.5;
            }

            rows.push(self.create_row(price, timestamp));
        }

        rows
    }

    /// One series per configured ticker covering `days * 24` hourly rows
    ///
    /// Every ticker shares the same time axis; base prices are spread so the
    /// series are distinguishable.
    pub fn generate_for_config(
        &mut self,
        config: &RunConfig,
        scenario: MarketScenario,
        start: DateTime<Utc>,
    ) -> BTreeMap<String, Vec<MarketRow>> {
        let num_rows = config.days as usize * 24;
        let base = self.base_price;

        let mut market = BTreeMap::new();
        for (i, ticker) in config.tickers.iter().enumerate() {
            self.base_price = base * (1.0 + i as f64);
            market.insert(ticker.clone(), self.generate(scenario, num_rows, start));
        }
        self.base_price = base;

        market
    }

    /// Build a row around a close price
    fn create_row(&mut self, close: f64, timestamp: DateTime<Utc>) -> MarketRow {
        let noise_pct = 0.002;

        let high = close * (1.0 + self.rng.gen_range(0.0..noise_pct));
        let low = close * (1.0 - self.rng.gen_range(0.0..noise_pct));
        let open = (close * (1.0 + self.rng.gen_range(-noise_pct..noise_pct))).clamp(low, high);

        // Vary volume ±30%
        let volume = self.base_volume * self.rng.gen_range(0.7..1.3);

        MarketRow {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}
