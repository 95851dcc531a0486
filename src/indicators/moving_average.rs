/// Smoothing factor for an EMA over `period` observations
pub fn ema_alpha(period: usize) -> f64 {
    2.0 / (period as f64 + 1.0)
}

/// Calculate the full Exponential Moving Average series
///
/// The series is seeded with the first observed price rather than an SMA, so
/// `series[i]` is defined for every input index.
pub fn ema_series(prices: &[f64], period: usize) -> Vec<f64> {
    let multiplier = ema_alpha(period);

    let mut series = Vec::with_capacity(prices.len());
    let mut iter = prices.iter();
    let Some(&first) = iter.next() else {
        return series;
    };

    let mut ema = first;
    series.push(ema);
    for price in iter {
        ema = (price - ema) * multiplier + ema;
        series.push(ema);
    }

    series
}

/// Calculate the latest EMA value, or `None` before `period` observations
pub fn calculate_ema(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    ema_series(prices, period).last().copied()
}
