pub const MA_SHORT_WINDOW: usize = 20;
pub const MA_LONG_WINDOW: usize = 50;
pub const RSI_PERIOD: usize = 14;
pub const VOLATILITY_WINDOW: usize = 20;

/// Rows loaded per symbol; enough for the longest window.
pub const LOOKBACK: usize = MA_LONG_WINDOW;
/// Below this many closes a symbol gets no metrics row.
pub const MIN_SAMPLES: usize = MA_SHORT_WINDOW;

#[derive(Clone, Debug, PartialEq)]
pub struct MetricValues {
    pub ma_20: f64,
    pub ma_50: Option<f64>,
    pub rsi_14: f64,
    pub volatility_20: f64,
    pub daily_return: Option<f64>,
}

/// Mean of the last `window` closes, or `None` when the series is shorter.
pub fn sma(closes: &[f64], window: usize) -> Option<f64> {
    if window == 0 || closes.len() < window {
        return None;
    }
    let tail = &closes[closes.len() - window..];
    Some(tail.iter().sum::<f64>() / window as f64)
}

/// Percent change between the last two closes.
pub fn daily_return(closes: &[f64]) -> Option<f64> {
    match closes {
        [.., prev, last] if *prev != 0.0 => Some((last - prev) / prev * 100.0),
        _ => None,
    }
}

/// RSI over the last `period` close-to-close deltas, simple averages.
///
/// No losses in the window gives exactly 100.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }
    let window = &closes[closes.len() - (period + 1)..];
    let (gains, losses) = window
        .windows(2)
        .map(|pair| pair[1] - pair[0])
        .fold((0.0, 0.0), |(gains, losses), delta| {
            if delta > 0.0 {
                (gains + delta, losses)
            } else {
                (gains, losses - delta)
            }
        });

    let avg_gain = gains / period as f64;
    let avg_loss = losses / period as f64;
    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// Population standard deviation of the last `window` closes.
pub fn population_std_dev(closes: &[f64], window: usize) -> Option<f64> {
    if window == 0 || closes.len() < window {
        return None;
    }
    let tail = &closes[closes.len() - window..];
    // A flat window must read exactly zero, not a rounding residue.
    if tail.iter().all(|&c| c == tail[0]) {
        return Some(0.0);
    }
    let mean = tail.iter().sum::<f64>() / window as f64;
    let variance = tail.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / window as f64;
    Some(variance.sqrt())
}

/// All indicators for one symbol, or `None` with fewer than `MIN_SAMPLES` closes.
///
/// Only the most recent `LOOKBACK` closes are considered, and nothing is
/// carried between calls.
pub fn compute(closes: &[f64]) -> Option<MetricValues> {
    if closes.len() < MIN_SAMPLES {
        return None;
    }
    let closes = &closes[closes.len().saturating_sub(LOOKBACK)..];
    Some(MetricValues {
        ma_20: sma(closes, MA_SHORT_WINDOW)?,
        ma_50: sma(closes, MA_LONG_WINDOW),
        rsi_14: rsi(closes, RSI_PERIOD)?,
        volatility_20: population_std_dev(closes, VOLATILITY_WINDOW)?,
        daily_return: daily_return(closes),
    })
}
