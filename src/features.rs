//! Per-bar feature pipeline
//!
//! Turns an OHLCV series into one [`FeatureSet`] per bar: trend, oscillator,
//! volatility and volume indicators, price structure, divergences,
//! multi-timeframe confirmation, mean-reversion z-score, market-cycle phase,
//! market health, momentum and the blended long/short biases.
//!
//! Every feature at bar `i` depends only on bars `0..=i`. Higher-timeframe
//! closes use the forming candle (completed higher-timeframe closes plus the
//! current bar's close), and divergences are flagged once the centred window
//! confirming the later extremum has closed. Truncating the input therefore
//! never changes features of earlier bars.
//!
//! Leading bars whose lookbacks are not yet satisfied are dropped; this is a
//! warm-up truncation, not an error.

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::config::StrategyParams;
use crate::indicators::{
    atr, bollinger_bands, dmi, ema, lift, macd, pct_change, rolling_max, rolling_mean,
    rolling_min, rolling_std, rsi, shift, sma, EmaState,
};
use crate::regime::{classify_regimes, MarketRegime};
use crate::types::{Candle, EPSILON};

/// Floor for the ATR moving average before it is defined
pub const ATR_MA_FLOOR: f64 = 1e-6;

/// Bias level above which a side is considered dominant
pub const BALANCED_SIGNAL_THRESHOLD: f64 = 0.65;

const DIVERGENCE_WINDOW_HOURS: i64 = 3;
const EXTREMUM_HALF_WINDOW: usize = 2;
const STRUCTURE_RECENT: usize = 10;
const STRUCTURE_PRIOR: usize = 20;
const PHASE_LOOKBACK: usize = 10;

/// Market-cycle phase with asymmetric long/short weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CyclePhase {
    Accumulation,
    Markup,
    Distribution,
    Markdown,
    Unknown,
}

impl CyclePhase {
    /// (long, short) phase weights
    pub fn weights(&self) -> (f64, f64) {
        match self {
            CyclePhase::Accumulation => (1.3, 0.7),
            CyclePhase::Markup => (1.5, 0.5),
            CyclePhase::Distribution => (0.7, 1.3),
            CyclePhase::Markdown => (0.5, 1.5),
            CyclePhase::Unknown => (1.0, 1.0),
        }
    }
}

/// Market health sub-scores, each on 0..=20
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthScores {
    pub trend: f64,
    pub volatility: f64,
    pub volume: f64,
    pub breadth: f64,
    pub support_resistance: f64,
}

impl HealthScores {
    /// `bullish_votes` counts RSI > 50, MACD > 0, fast EMA above slow EMA and
    /// bullish structure; `bb_position` is the close's place in the Bollinger band.
    pub fn compute(
        above_daily_fast: bool,
        long_vol_ratio: f64,
        volume_ratio: f64,
        bullish_votes: usize,
        bb_position: f64,
    ) -> Self {
        HealthScores {
            trend: if above_daily_fast { 20.0 } else { 0.0 },
            volatility: 20.0 - (long_vol_ratio - 1.0).clamp(0.0, 2.0) * 10.0,
            volume: volume_ratio.clamp(0.0, 2.0) * 10.0,
            breadth: bullish_votes.min(4) as f64 / 4.0 * 20.0,
            support_resistance: (0.5 - (bb_position - 0.5).abs()) * 2.0 * 20.0,
        }
    }

    /// Weighted blend clipped to [0, 100]
    pub fn blend(&self, p: &StrategyParams) -> f64 {
        (self.trend * p.health_trend_weight
            + self.volatility * p.health_volatility_weight
            + self.volume * p.health_volume_weight
            + self.breadth * p.health_breadth_weight
            + self.support_resistance * p.health_sr_weight)
            .clamp(0.0, 100.0)
    }
}

/// All derived values for one bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    /// Position of the bar in the input series
    pub index: usize,
    pub datetime: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,

    // Trend
    pub ema_short: f64,
    pub ema_long: f64,
    pub plus_di: f64,
    pub minus_di: f64,
    pub adx: f64,
    pub price_change_pct: f64,
    pub strong_trend: bool,
    pub weak_trend: bool,
    pub bullish_trend: bool,
    pub bearish_trend: bool,
    pub trend_weight: f64,
    pub range_weight: f64,

    // Oscillators
    pub rsi: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub macd_hist: f64,
    pub macd_bullish_cross: bool,
    pub macd_bearish_cross: bool,
    pub bb_upper: f64,
    pub bb_middle: f64,
    pub bb_lower: f64,

    // Volatility and volume
    pub atr: f64,
    pub atr_ma: f64,
    pub volatility_ratio: f64,
    pub volume_ma: f64,
    pub volume_ratio: f64,

    // Higher timeframes
    pub daily_ema_fast: f64,
    pub daily_ema_slow: f64,
    pub higher_tf_bullish: bool,
    pub higher_tf_bearish: bool,
    pub hourly_bullish: bool,
    pub four_hour_bullish: bool,
    pub mtf_bull_strength: f64,
    pub mtf_bear_strength: f64,
    pub price_to_ma200_ratio: f64,
    pub extreme_overbought: bool,
    pub extreme_oversold: bool,

    // Price structure
    pub bullish_structure: bool,
    pub bearish_structure: bool,
    pub bullish_engulfing: bool,
    pub bearish_engulfing: bool,
    pub bullish_divergence: bool,
    pub bearish_divergence: bool,
    /// Highest high of the preceding `breakout_lookback` bars, if that much history exists
    pub breakout_high: Option<f64>,

    // Mean reversion
    pub z_score: f64,
    pub mr_long_signal: bool,
    pub mr_short_signal: bool,

    // Regime
    pub regime: MarketRegime,
    pub regime_long_multiplier: f64,
    pub regime_short_multiplier: f64,

    // Cycle, health, momentum
    pub cycle_phase: CyclePhase,
    pub long_phase_weight: f64,
    pub short_phase_weight: f64,
    pub market_health: f64,
    pub enhanced_market_health: f64,
    pub health_long_bias: f64,
    pub health_short_bias: f64,
    pub momentum_score: f64,
    pub momentum_acceleration: f64,
    pub momentum_reversal: bool,
    pub momentum_long_bias: f64,
    pub momentum_short_bias: f64,

    // Blended bias
    pub final_long_bias: f64,
    pub final_short_bias: f64,
    pub choppy: bool,
    pub mr_signal_weight: f64,
    pub balanced_long_signal: bool,
    pub balanced_short_signal: bool,
    pub adaptive_sl_multiplier: f64,
    pub adaptive_tp_multiplier: f64,
}

impl FeatureSet {
    pub fn is_bullish_candle(&self) -> bool {
        self.close > self.open
    }

    pub fn hour(&self) -> u32 {
        self.datetime.hour()
    }
}

/// Compute features for every bar past the warm-up window.
pub fn compute_features(candles: &[Candle], params: &StrategyParams) -> Vec<FeatureSet> {
    let series = Series::new(candles, params);
    let start = (0..candles.len()).find(|&i| series.row(i).is_some());

    let features: Vec<FeatureSet> = match start {
        Some(start) => (start..candles.len()).map_while(|i| series.row(i)).collect(),
        None => Vec::new(),
    };

    tracing::debug!(
        bars = candles.len(),
        rows = features.len(),
        warmup = candles.len() - features.len(),
        "Features computed"
    );
    features
}

/// Column-oriented intermediate results
struct Series<'a> {
    candles: &'a [Candle],
    params: &'a StrategyParams,
    close: Vec<f64>,
    ema_short: Vec<f64>,
    ema_long: Vec<f64>,
    rsi: Vec<Option<f64>>,
    bb_upper: Vec<Option<f64>>,
    bb_middle: Vec<Option<f64>>,
    bb_lower: Vec<Option<f64>>,
    atr: Vec<Option<f64>>,
    atr_ma: Vec<f64>,
    atr_long_mean: Vec<Option<f64>>,
    plus_di: Vec<Option<f64>>,
    minus_di: Vec<Option<f64>>,
    adx: Vec<Option<f64>>,
    macd: Vec<f64>,
    macd_signal: Vec<f64>,
    macd_hist: Vec<f64>,
    volume_ma: Vec<Option<f64>>,
    price_change: Vec<Option<f64>>,
    daily: Vec<(f64, f64)>,
    hourly: Vec<(f64, f64)>,
    four_hour: Vec<(f64, f64)>,
    structure: Vec<Option<Structure>>,
    bullish_divergence: Vec<bool>,
    bearish_divergence: Vec<bool>,
    breakout_high: Vec<Option<f64>>,
    z_score: Vec<Option<f64>>,
    momentum: Vec<Option<f64>>,
    regimes: Vec<MarketRegime>,
}

#[derive(Debug, Clone, Copy)]
struct Structure {
    higher_high: bool,
    higher_low: bool,
    lower_high: bool,
    lower_low: bool,
}

impl<'a> Series<'a> {
    fn new(candles: &'a [Candle], params: &'a StrategyParams) -> Self {
        let high: Vec<f64> = candles.iter().map(|c| c.high).collect();
        let low: Vec<f64> = candles.iter().map(|c| c.low).collect();
        let close: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let volume: Vec<f64> = candles.iter().map(|c| c.volume).collect();

        let bands = bollinger_bands(&close, params.bb_period, params.bb_std);
        let atr_values = atr(&high, &low, &close, params.atr_period);
        let atr_ma = forward_fill_floor(
            &rolling_mean(&atr_values, params.atr_ma_period),
            ATR_MA_FLOOR,
        );
        let directional = dmi(&high, &low, &close, params.adx_period);
        let (macd_line, macd_signal, macd_hist) =
            macd(&close, params.macd_fast, params.macd_slow, params.macd_signal);
        let rsi_values = rsi(&close, params.rsi_period);
        let (bullish_divergence, bearish_divergence) = divergences(candles, &close, &rsi_values);

        Series {
            candles,
            params,
            ema_short: ema(&close, params.short_ema),
            ema_long: ema(&close, params.long_ema),
            bb_upper: bands.upper,
            bb_middle: bands.middle,
            bb_lower: bands.lower,
            atr_long_mean: rolling_mean(&atr_values, params.regime_volatility_lookback),
            atr: atr_values,
            atr_ma,
            plus_di: directional.plus_di,
            minus_di: directional.minus_di,
            adx: directional.adx,
            macd: macd_line,
            macd_signal,
            macd_hist,
            volume_ma: sma(&volume, params.volume_ma_period),
            price_change: pct_change(&close, params.trend_lookback),
            daily: higher_timeframe_emas(
                candles,
                Duration::days(1),
                params.daily_ema_fast,
                params.daily_ema_slow,
            ),
            hourly: higher_timeframe_emas(
                candles,
                Duration::hours(1),
                params.hourly_ema_fast,
                params.hourly_ema_slow,
            ),
            four_hour: higher_timeframe_emas(
                candles,
                Duration::hours(4),
                params.four_hour_ema_fast,
                params.four_hour_ema_slow,
            ),
            structure: market_structure(&high, &low),
            bullish_divergence,
            bearish_divergence,
            breakout_high: shift(&rolling_max(&high, params.breakout_lookback), 1),
            z_score: z_scores(&close, params.mean_reversion_lookback),
            momentum: momentum_scores(&close, &params.momentum_roc_periods),
            regimes: classify_regimes(&close, params),
            rsi: rsi_values,
            close,
        }
    }

    /// Assemble bar `i`, or `None` while any lookback is unsatisfied.
    fn row(&self, i: usize) -> Option<FeatureSet> {
        if i < PHASE_LOOKBACK.max(3) {
            return None;
        }
        let p = self.params;
        let c = &self.candles[i];
        let prev = &self.candles[i - 1];

        let rsi = self.rsi[i]?;
        let bb_upper = self.bb_upper[i]?;
        let bb_middle = self.bb_middle[i]?;
        let bb_lower = self.bb_lower[i]?;
        let atr = self.atr[i]?;
        let atr_long_mean = self.atr_long_mean[i]?;
        let plus_di = self.plus_di[i]?;
        let minus_di = self.minus_di[i]?;
        let adx = self.adx[i]?;
        let volume_ma = self.volume_ma[i]?;
        let price_change_pct = self.price_change[i]?;
        let structure = self.structure[i]?;
        let z_score = self.z_score[i]?;
        let prev_z = self.z_score[i - 1]?;
        let momentum_score = self.momentum[i]?;
        let momentum_acceleration = momentum_score - self.momentum[i - 3]?;

        let atr_ma = self.atr_ma[i];
        let volatility_ratio = atr / atr_ma;
        let volume_ratio = c.volume / volume_ma.max(EPSILON);

        // Trend classification
        let strong_trend = adx > p.adx_strong_trend && price_change_pct.abs() > p.trend_threshold;
        let weak_trend =
            adx < p.adx_weak_trend && price_change_pct.abs() < p.trend_threshold / 2.0;
        let bullish_trend = strong_trend && price_change_pct > 0.0 && plus_di > minus_di;
        let bearish_trend = strong_trend && price_change_pct < 0.0 && plus_di < minus_di;
        let trend_weight = ((adx - p.adx_min) / (p.adx_max - p.adx_min)).clamp(0.0, 1.0);
        let range_weight = 1.0 - trend_weight;

        let macd_bullish_cross = self.macd[i] > self.macd_signal[i]
            && self.macd[i - 1] <= self.macd_signal[i - 1];
        let macd_bearish_cross = self.macd[i] < self.macd_signal[i]
            && self.macd[i - 1] >= self.macd_signal[i - 1];

        // Higher timeframes
        let (daily_ema_fast, daily_ema_slow) = self.daily[i];
        let higher_tf_bullish = daily_ema_fast > daily_ema_slow;
        let higher_tf_bearish = daily_ema_fast < daily_ema_slow;
        let hourly_bullish = self.hourly[i].0 > self.hourly[i].1;
        let four_hour_bullish = self.four_hour[i].0 > self.four_hour[i].1;
        let mtf_bull_strength =
            (hourly_bullish as u8 + four_hour_bullish as u8 + higher_tf_bullish as u8) as f64 / 3.0;
        let mtf_bear_strength = (!hourly_bullish as u8
            + !four_hour_bullish as u8
            + higher_tf_bearish as u8) as f64
            / 3.0;
        let price_to_ma200_ratio = c.close / daily_ema_slow.max(EPSILON);

        // Structure and candle patterns
        let bullish_structure = structure.higher_high && structure.higher_low;
        let bearish_structure = structure.lower_high && structure.lower_low;
        let bullish_engulfing = c.open < prev.close
            && c.close > prev.open
            && c.close > c.open
            && prev.open > prev.close;
        let bearish_engulfing = c.open > prev.close
            && c.close < prev.open
            && c.close < c.open
            && prev.open < prev.close;

        // Mean reversion
        let t = p.mean_reversion_threshold;
        let mr_long_signal = z_score < -t && prev_z >= -t;
        let mr_short_signal = z_score > t && prev_z <= t;

        // Regime
        let regime = self.regimes[i];
        let (regime_long_multiplier, regime_short_multiplier) = regime.multipliers();

        // Cycle phase; later rules take precedence
        let close_back = self.close[i - PHASE_LOOKBACK];
        let cycle_phase = if bearish_trend && higher_tf_bearish && volume_ratio > 1.0 {
            CyclePhase::Markdown
        } else if rsi > 60.0
            && volume_ratio > 1.2
            && c.close > daily_ema_fast
            && c.close < close_back
        {
            CyclePhase::Distribution
        } else if bullish_trend && higher_tf_bullish && volume_ratio > 1.0 {
            CyclePhase::Markup
        } else if rsi < 40.0
            && volume_ratio > 1.2
            && c.close < daily_ema_fast
            && c.close > close_back
        {
            CyclePhase::Accumulation
        } else {
            CyclePhase::Unknown
        };
        let (long_phase_weight, short_phase_weight) = cycle_phase.weights();

        // Market health
        let long_vol_ratio = atr / atr_long_mean.max(EPSILON);
        let breadth_votes = [
            rsi > 50.0,
            self.macd[i] > 0.0,
            self.ema_short[i] > self.ema_long[i],
            bullish_structure,
        ];
        let band_width = bb_upper - bb_lower;
        let bb_position = if band_width > EPSILON {
            (c.close - bb_lower) / band_width
        } else {
            0.5
        };
        let health = HealthScores::compute(
            c.close > daily_ema_fast,
            long_vol_ratio,
            volume_ratio,
            breadth_votes.iter().filter(|v| **v).count(),
            bb_position,
        );
        let market_health = health.blend(p);
        let health_long_bias = market_health / 100.0;
        let health_short_bias = 1.0 - health_long_bias;

        let enhanced_market_health = ((adx / 50.0).clamp(0.0, 1.0) * 0.3
            + (((rsi - 50.0) / 50.0).clamp(-1.0, 1.0) + 1.0) / 2.0 * 0.3
            + (volume_ratio / 2.0).clamp(0.0, 1.0) * 0.2
            + health_long_bias * 0.2)
            * 100.0;

        // Momentum
        let r = p.momentum_reversal_threshold;
        let momentum_reversal = (momentum_score > 80.0 && momentum_acceleration < -r)
            || (momentum_score < -80.0 && momentum_acceleration > r);
        let momentum_long_bias = ((momentum_score + 100.0) / 200.0).clamp(0.3, 0.7);
        let momentum_short_bias = 1.0 - momentum_long_bias;

        // Blended bias
        let final_long_bias = health_long_bias * 0.3
            + momentum_long_bias * 0.3
            + long_phase_weight / 2.0 * 0.2
            + mtf_bull_strength * 0.2;
        let final_short_bias = health_short_bias * 0.3
            + momentum_short_bias * 0.3
            + short_phase_weight / 2.0 * 0.2
            + mtf_bear_strength * 0.2;
        let choppy = final_long_bias < BALANCED_SIGNAL_THRESHOLD
            && final_short_bias < BALANCED_SIGNAL_THRESHOLD;
        let (adaptive_sl_multiplier, adaptive_tp_multiplier) = if choppy {
            (p.atr_multiplier_sl * 1.2, p.atr_multiplier_tp * 0.8)
        } else {
            (p.atr_multiplier_sl * 0.9, p.atr_multiplier_tp * 1.2)
        };

        Some(FeatureSet {
            index: i,
            datetime: c.datetime,
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
            ema_short: self.ema_short[i],
            ema_long: self.ema_long[i],
            plus_di,
            minus_di,
            adx,
            price_change_pct,
            strong_trend,
            weak_trend,
            bullish_trend,
            bearish_trend,
            trend_weight,
            range_weight,
            rsi,
            macd: self.macd[i],
            macd_signal: self.macd_signal[i],
            macd_hist: self.macd_hist[i],
            macd_bullish_cross,
            macd_bearish_cross,
            bb_upper,
            bb_middle,
            bb_lower,
            atr,
            atr_ma,
            volatility_ratio,
            volume_ma,
            volume_ratio,
            daily_ema_fast,
            daily_ema_slow,
            higher_tf_bullish,
            higher_tf_bearish,
            hourly_bullish,
            four_hour_bullish,
            mtf_bull_strength,
            mtf_bear_strength,
            price_to_ma200_ratio,
            extreme_overbought: price_to_ma200_ratio > 1.3,
            extreme_oversold: price_to_ma200_ratio < 0.7,
            bullish_structure,
            bearish_structure,
            bullish_engulfing,
            bearish_engulfing,
            bullish_divergence: self.bullish_divergence[i],
            bearish_divergence: self.bearish_divergence[i],
            breakout_high: self.breakout_high[i],
            z_score,
            mr_long_signal,
            mr_short_signal,
            regime,
            regime_long_multiplier,
            regime_short_multiplier,
            cycle_phase,
            long_phase_weight,
            short_phase_weight,
            market_health,
            enhanced_market_health,
            health_long_bias,
            health_short_bias,
            momentum_score,
            momentum_acceleration,
            momentum_reversal,
            momentum_long_bias,
            momentum_short_bias,
            final_long_bias,
            final_short_bias,
            choppy,
            mr_signal_weight: if choppy { 1.5 } else { 0.5 },
            balanced_long_signal: final_long_bias > BALANCED_SIGNAL_THRESHOLD
                || (choppy && mr_long_signal),
            balanced_short_signal: final_short_bias > BALANCED_SIGNAL_THRESHOLD
                || (choppy && mr_short_signal),
            adaptive_sl_multiplier,
            adaptive_tp_multiplier,
        })
    }
}

/// Forward-fill undefined values, back-fill the leading gap with `floor`,
/// and never return less than `floor`.
fn forward_fill_floor(values: &[Option<f64>], floor: f64) -> Vec<f64> {
    let mut last = None;
    values
        .iter()
        .map(|v| {
            if v.is_some() {
                last = *v;
            }
            last.unwrap_or(floor).max(floor)
        })
        .collect()
}

/// Fast/slow EMA pair of a higher timeframe, evaluated on the forming candle.
///
/// Bars are bucketed by `frame` (aligned to the Unix epoch, so days start at
/// 00:00 UTC). Completed buckets commit their last close; the current bar's
/// close stands in for the bucket still forming.
fn higher_timeframe_emas(
    candles: &[Candle],
    frame: Duration,
    fast: usize,
    slow: usize,
) -> Vec<(f64, f64)> {
    let frame_secs = frame.num_seconds().max(1);
    let mut fast_ema = EmaState::new(fast);
    let mut slow_ema = EmaState::new(slow);
    let mut bucket: Option<i64> = None;
    let mut bucket_close = 0.0;

    candles
        .iter()
        .map(|c| {
            let current = c.datetime.timestamp().div_euclid(frame_secs);
            if bucket.is_some_and(|b| b != current) {
                fast_ema.commit(bucket_close);
                slow_ema.commit(bucket_close);
            }
            bucket = Some(current);
            bucket_close = c.close;
            (fast_ema.peek(c.close), slow_ema.peek(c.close))
        })
        .collect()
}

/// Highs/lows of the last 10 bars against the 20 bars before them
fn market_structure(high: &[f64], low: &[f64]) -> Vec<Option<Structure>> {
    let recent_high = rolling_max(high, STRUCTURE_RECENT);
    let recent_low = rolling_min(low, STRUCTURE_RECENT);
    let prior_high = shift(&rolling_max(high, STRUCTURE_PRIOR), STRUCTURE_RECENT);
    let prior_low = shift(&rolling_min(low, STRUCTURE_PRIOR), STRUCTURE_RECENT);

    (0..high.len())
        .map(|i| {
            let (rh, rl) = (recent_high[i]?, recent_low[i]?);
            let (ph, pl) = (prior_high[i]?, prior_low[i]?);
            Some(Structure {
                higher_high: rh > ph,
                higher_low: rl > pl,
                lower_high: rh < ph,
                lower_low: rl < pl,
            })
        })
        .collect()
}

/// `(close - mean) / std(deviation)` over `lookback`. A zero deviation
/// spread has no defined z-score and resolves to 0.
fn z_scores(close: &[f64], lookback: usize) -> Vec<Option<f64>> {
    let mean = rolling_mean(&lift(close), lookback);
    let deviation: Vec<Option<f64>> = close
        .iter()
        .zip(&mean)
        .map(|(c, m)| m.map(|m| c - m))
        .collect();
    let spread = rolling_std(&deviation, lookback);

    deviation
        .iter()
        .zip(&spread)
        .map(|(d, s)| {
            let (d, s) = ((*d)?, (*s)?);
            Some(if s > EPSILON { d / s } else { 0.0 })
        })
        .collect()
}

/// Sign-preserving square-root blend of rates of change, rescaled to ±100 by
/// the largest magnitude seen so far.
fn momentum_scores(close: &[f64], periods: &[usize]) -> Vec<Option<f64>> {
    let rocs: Vec<Vec<Option<f64>>> = periods.iter().map(|&p| pct_change(close, p)).collect();
    let mut max_abs: f64 = 0.0;

    (0..close.len())
        .map(|i| {
            let mut sum = 0.0;
            for roc in &rocs {
                let pct = roc[i]? * 100.0;
                sum += pct.signum() * pct.abs().sqrt();
            }
            let raw = sum / rocs.len() as f64;
            max_abs = max_abs.max(raw.abs());
            Some(if max_abs > EPSILON {
                raw * 100.0 / max_abs
            } else {
                0.0
            })
        })
        .collect()
}

/// Indices of 5-bar centred minima and maxima
fn local_extrema(values: &[Option<f64>]) -> (Vec<usize>, Vec<usize>) {
    let h = EXTREMUM_HALF_WINDOW;
    let mut minima = Vec::new();
    let mut maxima = Vec::new();
    if values.len() < 2 * h + 1 {
        return (minima, maxima);
    }
    for i in h..values.len() - h {
        let window: Option<Vec<f64>> = values[i - h..=i + h].iter().copied().collect();
        let (Some(window), Some(v)) = (window, values[i]) else {
            continue;
        };
        if window.iter().all(|w| v <= *w) {
            minima.push(i);
        }
        if window.iter().all(|w| v >= *w) {
            maxima.push(i);
        }
    }
    (minima, maxima)
}

/// Price/RSI divergence flags.
///
/// Consecutive price extrema are paired with consecutive RSI extrema found
/// within three hours after the price extremum. Bullish: lower price low with
/// a higher RSI low; bearish: higher price high with a lower RSI high.
fn divergences(candles: &[Candle], close: &[f64], rsi: &[Option<f64>]) -> (Vec<bool>, Vec<bool>) {
    let n = candles.len();
    let mut bullish = vec![false; n];
    let mut bearish = vec![false; n];

    let (price_min, price_max) = local_extrema(&lift(close));
    let (rsi_min, rsi_max) = local_extrema(rsi);
    let window = Duration::hours(DIVERGENCE_WINDOW_HOURS);

    let mark = |flags: &mut [bool], price: &[usize], osc: &[usize], bull: bool| {
        for pi in 1..price.len() {
            let t0 = candles[price[pi]].datetime;
            let t1 = t0 + window;
            let first = osc
                .partition_point(|&k| candles[k].datetime < t0)
                .max(1);
            for oj in first..osc.len() {
                if candles[osc[oj]].datetime > t1 {
                    break;
                }
                let price_change = close[price[pi]] - close[price[pi - 1]];
                let (Some(r_now), Some(r_prev)) = (rsi[osc[oj]], rsi[osc[oj - 1]]) else {
                    continue;
                };
                let rsi_change = r_now - r_prev;
                let diverges = if bull {
                    price_change < 0.0 && rsi_change > 0.0
                } else {
                    price_change > 0.0 && rsi_change < 0.0
                };
                if diverges {
                    let confirmed = price[pi].max(osc[oj]) + EXTREMUM_HALF_WINDOW;
                    if confirmed < n {
                        flags[confirmed] = true;
                    }
                }
            }
        }
    };

    mark(&mut bullish, &price_min, &rsi_min, true);
    mark(&mut bearish, &price_max, &rsi_max, false);
    (bullish, bearish)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn trending(n: usize, step: f64) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut price: f64 = 100.0;
        (0..n)
            .map(|i| {
                let open = price;
                price *= 1.0 + step;
                let close = price;
                Candle::new(
                    start + Duration::minutes(15 * i as i64),
                    open,
                    open.max(close) * 1.0005,
                    open.min(close) * 0.9995,
                    close,
                    1000.0 + (i % 7) as f64 * 50.0,
                )
            })
            .collect()
    }

    fn wave(n: usize) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut prev = 100.0;
        (0..n)
            .map(|i| {
                let x = i as f64;
                let close = 100.0 + 5.0 * (x / 12.0).sin() + 2.0 * (x / 5.0).cos();
                let open = prev;
                prev = close;
                Candle::new(
                    start + Duration::minutes(15 * i as i64),
                    open,
                    open.max(close) + 0.3,
                    open.min(close) - 0.3,
                    close,
                    800.0 + 400.0 * ((x / 3.0).sin().abs()),
                )
            })
            .collect()
    }

    #[test]
    fn test_warmup_rows_are_dropped() {
        let params = StrategyParams::default();
        let candles = trending(300, 0.001);
        let features = compute_features(&candles, &params);
        assert!(!features.is_empty());
        let first = features[0].index;
        assert!(first >= params.regime_volatility_lookback);
        assert!(first <= params.warmup_bars());
        // contiguous after warm-up
        for (k, f) in features.iter().enumerate() {
            assert_eq!(f.index, first + k);
        }
    }

    #[test]
    fn test_too_short_series_yields_nothing() {
        let params = StrategyParams::default();
        assert!(compute_features(&trending(50, 0.001), &params).is_empty());
        assert!(compute_features(&[], &params).is_empty());
    }

    #[test]
    fn test_bounds_hold() {
        let params = StrategyParams::default();
        for candles in [trending(400, 0.001), trending(400, -0.001), wave(600)] {
            for f in compute_features(&candles, &params) {
                assert!((0.0..=100.0).contains(&f.rsi), "rsi {}", f.rsi);
                assert!((0.0..=100.0).contains(&f.adx), "adx {}", f.adx);
                assert!((0.0..=100.0).contains(&f.market_health));
                assert!((0.0..=1.0).contains(&f.trend_weight));
                assert!(f.atr_ma >= ATR_MA_FLOOR);
                assert!((0.0..=1.0).contains(&f.mtf_bull_strength));
                assert!((-100.0..=100.0).contains(&f.momentum_score));
            }
        }
    }

    #[test]
    fn test_uptrend_features() {
        let params = StrategyParams::default();
        let features = compute_features(&trending(400, 0.001), &params);
        let last = features.last().unwrap();
        assert!(last.ema_short > last.ema_long);
        assert!(last.higher_tf_bullish);
        assert!(last.plus_di > last.minus_di);
        assert!(last.adx > 90.0);
        assert!(last.trend_weight > 0.99);
        assert!(last.bullish_structure);
        assert!((last.momentum_score - 100.0).abs() < 1e-6);
        assert!((last.momentum_long_bias - 0.7).abs() < 1e-12);
        assert!(last.final_long_bias > last.final_short_bias);
    }

    #[test]
    fn test_features_are_causal() {
        let params = StrategyParams::default();
        let candles = wave(500);
        let full = compute_features(&candles, &params);
        let truncated = compute_features(&candles[..420], &params);
        for (a, b) in truncated.iter().zip(&full) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_zero_volume_is_guarded() {
        let params = StrategyParams::default();
        let mut candles = trending(300, 0.001);
        for c in candles.iter_mut().skip(200) {
            c.volume = 0.0;
        }
        let features = compute_features(&candles, &params);
        assert!(!features.is_empty());
        for f in &features {
            assert!(f.volume_ratio.is_finite());
            assert!(f.final_long_bias.is_finite());
        }
    }

    #[test]
    fn test_higher_timeframe_uses_forming_candle() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let candles: Vec<Candle> = (0..8)
            .map(|i| {
                let p = 100.0 + i as f64;
                Candle::new(start + Duration::minutes(30 * i), p, p, p, p, 1.0)
            })
            .collect();
        let emas = higher_timeframe_emas(&candles, Duration::hours(1), 3, 5);
        // first hour bucket still forming: both EMAs equal the current close
        assert_eq!(emas[0], (100.0, 100.0));
        assert_eq!(emas[1], (101.0, 101.0));
        // second bucket: committed 101, forming 102 -> fast 101.5
        assert!((emas[2].0 - 101.5).abs() < 1e-12);
        assert!(emas[2].0 > emas[2].1);
    }

    #[test]
    fn test_local_extrema() {
        let values = lift(&[5.0, 4.0, 1.0, 4.0, 5.0, 6.0, 9.0, 6.0, 5.0]);
        let (minima, maxima) = local_extrema(&values);
        assert_eq!(minima, vec![2]);
        assert_eq!(maxima, vec![6]);
    }

    #[test]
    fn test_cycle_phase_weights() {
        assert_eq!(CyclePhase::Markup.weights(), (1.5, 0.5));
        assert_eq!(CyclePhase::Unknown.weights(), (1.0, 1.0));
    }

    #[test]
    fn test_health_sub_scores() {
        let params = StrategyParams::default();

        let strong = HealthScores::compute(true, 1.5, 2.0, 4, 0.5);
        assert_eq!(strong.trend, 20.0);
        assert_relative_eq!(strong.volatility, 15.0);
        assert_relative_eq!(strong.volume, 20.0);
        assert_relative_eq!(strong.breadth, 20.0);
        assert_relative_eq!(strong.support_resistance, 20.0);
        assert_relative_eq!(strong.blend(&params), 19.0, epsilon = 1e-12);

        let weak = HealthScores::compute(false, 4.0, 0.5, 1, 0.9);
        assert_eq!(weak.trend, 0.0);
        assert_relative_eq!(weak.volatility, 0.0);
        assert_relative_eq!(weak.volume, 5.0);
        assert_relative_eq!(weak.breadth, 5.0);
        assert_relative_eq!(weak.support_resistance, 4.0, epsilon = 1e-12);
        assert_relative_eq!(weak.blend(&params), 2.4, epsilon = 1e-12);

        let best = HealthScores::compute(true, 0.5, 3.0, 4, 0.5);
        assert_relative_eq!(best.blend(&params), 20.0, epsilon = 1e-12);
    }

    #[test]
    fn test_health_stays_on_twenty_point_scale() {
        let params = StrategyParams::default();
        for candles in [trending(400, 0.001), wave(600)] {
            for f in compute_features(&candles, &params) {
                assert!(f.market_health <= 20.0 + 1e-9, "health {}", f.market_health);
                assert!(f.health_long_bias <= 0.2 + 1e-12);
                assert!(f.health_short_bias >= 0.8 - 1e-12);
            }
        }
    }
}
