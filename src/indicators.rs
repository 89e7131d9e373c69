//! Technical indicator primitives
//!
//! Series-in, series-out helpers. Moving averages are backed by the `ta` crate;
//! rolling statistics that `ta` does not expose (sample standard deviation,
//! rolling extrema over optional inputs) are implemented here.
//!
//! Conventions:
//! - `Vec<Option<f64>>` marks warm-up positions with `None`.
//! - EMAs are defined from the first sample (recursive smoothing seeded with
//!   the first value, factor `2/(period+1)`).
//! - Denominators that can reach zero are floored at [`EPSILON`].

use ta::indicators::{ExponentialMovingAverage, SimpleMovingAverage};
use ta::Next;

use crate::types::EPSILON;

/// Output of [`macd`]: (macd line, signal line, histogram)
pub type MacdOutput = (Vec<f64>, Vec<f64>, Vec<f64>);

/// Bollinger bands (upper, middle, lower)
#[derive(Debug, Clone)]
pub struct BollingerBands {
    pub upper: Vec<Option<f64>>,
    pub middle: Vec<Option<f64>>,
    pub lower: Vec<Option<f64>>,
}

/// Directional movement system
#[derive(Debug, Clone)]
pub struct DmiOutput {
    pub plus_di: Vec<Option<f64>>,
    pub minus_di: Vec<Option<f64>>,
    pub adx: Vec<Option<f64>>,
}

// =============================================================================
// Moving Averages
// =============================================================================

/// Simple moving average, `None` until `period` samples are available
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![None; values.len()];
    }

    let mut indicator = match SimpleMovingAverage::new(period) {
        Ok(i) => i,
        Err(_) => return vec![None; values.len()],
    };

    values
        .iter()
        .enumerate()
        .map(|(i, &value)| {
            let sma_val = indicator.next(value);
            (i + 1 >= period).then_some(sma_val)
        })
        .collect()
}

/// Exponential moving average seeded with the first value
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    let mut indicator = match ExponentialMovingAverage::new(period.max(1)) {
        Ok(i) => i,
        Err(_) => return values.to_vec(),
    };
    values.iter().map(|&v| indicator.next(v)).collect()
}

/// Single-step EMA with a peek for in-progress samples.
///
/// Used for higher-timeframe series where the latest candle is still forming:
/// `peek` evaluates the EMA as if the forming close were final without
/// committing it.
#[derive(Debug, Clone)]
pub struct EmaState {
    k: f64,
    value: Option<f64>,
}

impl EmaState {
    pub fn new(period: usize) -> Self {
        EmaState {
            k: 2.0 / (period.max(1) as f64 + 1.0),
            value: None,
        }
    }

    pub fn peek(&self, input: f64) -> f64 {
        match self.value {
            Some(prev) => self.k * input + (1.0 - self.k) * prev,
            None => input,
        }
    }

    pub fn commit(&mut self, input: f64) -> f64 {
        let next = self.peek(input);
        self.value = Some(next);
        next
    }
}

// =============================================================================
// Rolling Statistics
// =============================================================================

/// Lift a plain series into the optional representation
pub fn lift(values: &[f64]) -> Vec<Option<f64>> {
    values.iter().copied().map(Some).collect()
}

/// Apply `f` over every full window of `period` defined samples.
///
/// A window containing any `None` yields `None`.
pub fn rolling<F>(values: &[Option<f64>], period: usize, f: F) -> Vec<Option<f64>>
where
    F: Fn(&[f64]) -> f64,
{
    let mut out = vec![None; values.len()];
    if period == 0 {
        return out;
    }
    let mut window = Vec::with_capacity(period);
    for i in (period - 1)..values.len() {
        window.clear();
        window.extend(values[i + 1 - period..=i].iter().map_while(|v| *v));
        if window.len() == period {
            out[i] = Some(f(&window));
        }
    }
    out
}

pub fn mean(window: &[f64]) -> f64 {
    window.iter().sum::<f64>() / window.len() as f64
}

/// Sample standard deviation (n - 1 denominator)
pub fn sample_std(window: &[f64]) -> f64 {
    if window.len() < 2 {
        return 0.0;
    }
    let m = mean(window);
    let var = window.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (window.len() - 1) as f64;
    var.sqrt()
}

pub fn rolling_mean(values: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    rolling(values, period, mean)
}

pub fn rolling_std(values: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    rolling(values, period, sample_std)
}

pub fn rolling_max(values: &[f64], period: usize) -> Vec<Option<f64>> {
    rolling(&lift(values), period, |w| {
        w.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    })
}

pub fn rolling_min(values: &[f64], period: usize) -> Vec<Option<f64>> {
    rolling(&lift(values), period, |w| {
        w.iter().copied().fold(f64::INFINITY, f64::min)
    })
}

/// Shift a series forward by `n` positions (value at `i` comes from `i - n`)
pub fn shift(values: &[Option<f64>], n: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| if i >= n { values[i - n] } else { None })
        .collect()
}

/// Relative change over `period` bars: `(x[i] - x[i-p]) / x[i-p]`
pub fn pct_change(values: &[f64], period: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| {
            if i < period || period == 0 {
                return None;
            }
            let base = values[i - period];
            (base.abs() > EPSILON).then(|| (values[i] - base) / base)
        })
        .collect()
}

// =============================================================================
// Volatility
// =============================================================================

/// True range. The first bar has no previous close and uses `high - low`.
pub fn true_range(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    (0..high.len())
        .map(|i| {
            let hl = high[i] - low[i];
            if i == 0 {
                hl
            } else {
                let hc = (high[i] - close[i - 1]).abs();
                let lc = (low[i] - close[i - 1]).abs();
                hl.max(hc).max(lc)
            }
        })
        .collect()
}

/// Average true range as the rolling mean of true range
pub fn atr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    rolling_mean(&lift(&true_range(high, low, close)), period)
}

/// Bollinger bands over close using the sample standard deviation
pub fn bollinger_bands(values: &[f64], period: usize, num_std: f64) -> BollingerBands {
    let lifted = lift(values);
    let middle = rolling_mean(&lifted, period);
    let std = rolling_std(&lifted, period);

    let upper = middle
        .iter()
        .zip(&std)
        .map(|(m, s)| Some((*m)? + (*s)? * num_std))
        .collect();
    let lower = middle
        .iter()
        .zip(&std)
        .map(|(m, s)| Some((*m)? - (*s)? * num_std))
        .collect();

    BollingerBands {
        upper,
        middle,
        lower,
    }
}

// =============================================================================
// Momentum
// =============================================================================

/// RSI from rolling-mean gains and losses. The loss average is floored at
/// [`EPSILON`] so a run without losses resolves to ~100 instead of dividing by zero.
pub fn rsi(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut gains = Vec::with_capacity(values.len());
    let mut losses = Vec::with_capacity(values.len());
    for i in 0..values.len() {
        let delta = if i == 0 { 0.0 } else { values[i] - values[i - 1] };
        gains.push(Some(delta.max(0.0)));
        losses.push(Some((-delta).max(0.0)));
    }

    let avg_gain = rolling_mean(&gains, period);
    let avg_loss = rolling_mean(&losses, period);

    avg_gain
        .iter()
        .zip(&avg_loss)
        .map(|(g, l)| {
            let rs = (*g)? / (*l)?.max(EPSILON);
            Some(100.0 - 100.0 / (1.0 + rs))
        })
        .collect()
}

/// MACD with EMA signal line and histogram
pub fn macd(values: &[f64], fast: usize, slow: usize, signal: usize) -> MacdOutput {
    let fast_ema = ema(values, fast);
    let slow_ema = ema(values, slow);
    let line: Vec<f64> = fast_ema.iter().zip(&slow_ema).map(|(f, s)| f - s).collect();
    let signal_line = ema(&line, signal);
    let hist = line.iter().zip(&signal_line).map(|(m, s)| m - s).collect();
    (line, signal_line, hist)
}

// =============================================================================
// Trend Strength
// =============================================================================

/// +DI, -DI and ADX from rolling means of directional movement and true range
pub fn dmi(high: &[f64], low: &[f64], close: &[f64], period: usize) -> DmiOutput {
    let n = high.len();
    let mut plus_dm = Vec::with_capacity(n);
    let mut minus_dm = Vec::with_capacity(n);
    for i in 0..n {
        if i == 0 {
            plus_dm.push(Some(0.0));
            minus_dm.push(Some(0.0));
            continue;
        }
        let up = high[i] - high[i - 1];
        let down = low[i - 1] - low[i];
        plus_dm.push(Some(if up > down && up > 0.0 { up } else { 0.0 }));
        minus_dm.push(Some(if down > up && down > 0.0 { down } else { 0.0 }));
    }

    let atr_values = atr(high, low, close, period);
    let plus_smooth = rolling_mean(&plus_dm, period);
    let minus_smooth = rolling_mean(&minus_dm, period);

    let mut plus_di = vec![None; n];
    let mut minus_di = vec![None; n];
    let mut dx = vec![None; n];
    for i in 0..n {
        if let (Some(a), Some(p), Some(m)) = (atr_values[i], plus_smooth[i], minus_smooth[i]) {
            let a = a.max(EPSILON);
            let pdi = 100.0 * p / a;
            let mdi = 100.0 * m / a;
            plus_di[i] = Some(pdi);
            minus_di[i] = Some(mdi);
            dx[i] = Some(100.0 * (pdi - mdi).abs() / (pdi + mdi).max(EPSILON));
        }
    }

    DmiOutput {
        plus_di,
        minus_di,
        adx: rolling_mean(&dx, period),
    }
}
