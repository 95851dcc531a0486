use serde::{Deserialize, Serialize};

use super::moving_average::ema_series;

/// Default trailing window (48 hourly bars)
pub const DEFAULT_EMA_WINDOW: usize = 48;

/// Result of evaluating the EMA trend signal on a price history
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum EmaSignal {
    /// Fewer than `need` observations; not an error, consumers should branch on it
    Insufficient { have: usize, need: usize },
    /// Valid EMA plus a linear projection one and two steps ahead
    Ready { ema: f64, proj_1: f64, proj_2: f64 },
}

impl EmaSignal {
    pub fn is_ready(&self) -> bool {
        matches!(self, EmaSignal::Ready { .. })
    }

    pub fn ema(&self) -> Option<f64> {
        match self {
            EmaSignal::Ready { ema, .. } => Some(*ema),
            EmaSignal::Insufficient { .. } => None,
        }
    }

    pub fn projections(&self) -> Option<(f64, f64)> {
        match self {
            EmaSignal::Ready { proj_1, proj_2, .. } => Some((*proj_1, *proj_2)),
            EmaSignal::Insufficient { .. } => None,
        }
    }
}

/// Trailing EMA and short-horizon projection over closing prices
///
/// Pure function of the price prefix it is given, so it can be restarted from
/// any point in the history.
#[derive(Debug, Clone, Copy)]
pub struct SignalCalculator {
    window: usize,
}

impl Default for SignalCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_EMA_WINDOW)
    }
}

impl SignalCalculator {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Evaluate the signal on the closes observed so far (oldest first)
    pub fn compute(&self, closes: &[f64]) -> EmaSignal {
        if closes.len() < self.window {
            return EmaSignal::Insufficient {
                have: closes.len(),
                need: self.window,
            };
        }

        let series = ema_series(closes, self.window);
        let n = series.len();
        let ema = series[n - 1];

        // Projection needs three EMA points; a window of 1 or 2 can be ready earlier
        if n < 3 {
            return EmaSignal::Ready {
                ema,
                proj_1: ema,
                proj_2: ema,
            };
        }

        let delta1 = series[n - 1] - series[n - 2];
        let delta2 = series[n - 2] - series[n - 3];
        let avg_delta = (delta1 + delta2) / 2.0;
        let proj_1 = ema + avg_delta;
        let proj_2 = proj_1 + avg_delta;

        EmaSignal::Ready { ema, proj_1, proj_2 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_series_is_flat() {
        let closes = vec![100.0; 50];
        let signal = SignalCalculator::default().compute(&closes);

        match signal {
            EmaSignal::Ready { ema, proj_1, proj_2 } => {
                assert!((ema - 100.0).abs() < 1e-9);
                assert!((proj_1 - 100.0).abs() < 1e-9);
                assert!((proj_2 - 100.0).abs() < 1e-9);
            }
            other => panic!("expected ready signal, got {:?}", other),
        }
    }

    #[test]
    fn test_insufficient_before_window() {
        let closes = vec![100.0; 47];
        let signal = SignalCalculator::default().compute(&closes);
        assert_eq!(signal, EmaSignal::Insufficient { have: 47, need: 48 });
        assert!(signal.ema().is_none());

        assert!(SignalCalculator::default().compute(&[100.0; 48]).is_ready());
    }

    #[test]
    fn test_projection_follows_average_slope() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let calc = SignalCalculator::new(10);
        let series = ema_series(&closes, 10);
        let n = series.len();
        let avg_delta = ((series[n - 1] - series[n - 2]) + (series[n - 2] - series[n - 3])) / 2.0;

        let (proj_1, proj_2) = calc.compute(&closes).projections().unwrap();
        assert!((proj_1 - (series[n - 1] + avg_delta)).abs() < 1e-9);
        assert!((proj_2 - (series[n - 1] + 2.0 * avg_delta)).abs() < 1e-9);
        assert!(proj_2 > proj_1);
    }

    #[test]
    fn test_restartable_from_prefix() {
        let closes: Vec<f64> = (0..80).map(|i| 50.0 + (i as f64 * 0.3).sin() * 5.0).collect();
        let calc = SignalCalculator::new(20);
        let full = calc.compute(&closes[..60]);
        let again = calc.compute(&closes[..60]);
        assert_eq!(full, again);
    }
}
