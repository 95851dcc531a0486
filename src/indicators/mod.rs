// Technical indicators module
// EMA trend signal with a two-step linear projection

pub mod moving_average;
pub mod signal;

pub use moving_average::{calculate_ema, ema_alpha, ema_series};
pub use signal::{EmaSignal, SignalCalculator, DEFAULT_EMA_WINDOW};
