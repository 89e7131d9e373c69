//! Weighted signal generation
//!
//! Each bar is evaluated as a trend bar or a range bar. Every condition that
//! holds contributes a tagged [`Signal`] with a deterministic weight; each
//! side's list is then folded to a single scalar by [`fold_weights`].

use serde::{Deserialize, Serialize};

use crate::config::StrategyParams;
use crate::features::FeatureSet;
use crate::types::Side;

/// Trend weight above which a bar is treated as trending
pub const TREND_SPLIT: f64 = 0.5;
/// Minimum trend weight for trend-mode signals
pub const TREND_MODE_MIN_WEIGHT: f64 = 0.45;
/// Minimum range weight for range-mode signals
pub const RANGE_MODE_MIN_WEIGHT: f64 = 0.6;
/// Boost applied to already-collected signals agreeing with the daily trend
pub const HIGHER_TF_BOOST: f64 = 1.3;

/// Which signal family a bar is evaluated with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegimeMode {
    Trend,
    Range,
}

impl RegimeMode {
    pub fn of(feature: &FeatureSet) -> Self {
        if feature.trend_weight > TREND_SPLIT {
            RegimeMode::Trend
        } else {
            RegimeMode::Range
        }
    }
}

/// Identifier of a signal contribution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    // trend family
    EmaCrossover,
    MacdCross,
    StrongTrend,
    VolumeBreakout,
    DailyGoldenCross,
    BalancedBias,
    EnhancedVolumeBreakout,
    SupportLevelBounce,
    HighBreakout,
    VolumeMomentum,
    SupportBounceEnhanced,
    ConfirmedEngulfing,
    // range family
    RsiBandExtreme,
    Divergence,
    ReversalCandle,
    MeanReversion,
}

impl SignalKind {
    /// Human-readable label for the side the signal was raised on
    pub fn name(&self, side: Side) -> &'static str {
        let long = side == Side::Long;
        match self {
            SignalKind::EmaCrossover => "EMA Crossover",
            SignalKind::MacdCross if long => "MACD Bullish Cross",
            SignalKind::MacdCross => "MACD Bearish Cross",
            SignalKind::StrongTrend if long => "Strong Bullish Trend",
            SignalKind::StrongTrend => "Strong Bearish Trend",
            SignalKind::VolumeBreakout => "Volume Breakout",
            SignalKind::DailyGoldenCross => "Daily Golden Cross",
            SignalKind::BalancedBias if long => "Balanced Long Signal",
            SignalKind::BalancedBias => "Balanced Short Signal",
            SignalKind::EnhancedVolumeBreakout => "Enhanced Volume Breakout",
            SignalKind::SupportLevelBounce => "Support Level Bounce",
            SignalKind::HighBreakout => "Range High Breakout",
            SignalKind::VolumeMomentum => "Volume Momentum",
            SignalKind::SupportBounceEnhanced => "Support Bounce Enhanced",
            SignalKind::ConfirmedEngulfing => "Confirmed Bullish Engulfing",
            SignalKind::RsiBandExtreme if long => "RSI Oversold + BB Lower",
            SignalKind::RsiBandExtreme => "RSI Overbought + BB Upper",
            SignalKind::Divergence if long => "Strong Bullish Divergence",
            SignalKind::Divergence => "Strong Bearish Divergence",
            SignalKind::ReversalCandle if long => "Support Bounce",
            SignalKind::ReversalCandle => "Resistance Rejection",
            SignalKind::MeanReversion if long => "Mean Reversion Long",
            SignalKind::MeanReversion => "Mean Reversion Short",
        }
    }

    pub fn is_mean_reversion(&self) -> bool {
        matches!(self, SignalKind::MeanReversion)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,
    pub weight: f64,
}

/// Candidate signals for one bar
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalSet {
    pub long: Vec<Signal>,
    pub short: Vec<Signal>,
    pub long_weight: f64,
    pub short_weight: f64,
}

impl SignalSet {
    pub fn signals(&self, side: Side) -> &[Signal] {
        match side {
            Side::Long => &self.long,
            Side::Short => &self.short,
        }
    }

    pub fn weight(&self, side: Side) -> f64 {
        match side {
            Side::Long => self.long_weight,
            Side::Short => self.short_weight,
        }
    }

    pub fn has_mean_reversion(&self, side: Side) -> bool {
        self.signals(side).iter().any(|s| s.kind.is_mean_reversion())
    }

    pub fn names(&self, side: Side) -> Vec<String> {
        self.signals(side)
            .iter()
            .map(|s| s.kind.name(side).to_string())
            .collect()
    }
}

/// Arithmetic mean of the contributed weights; zero for an empty list.
pub fn fold_weights(signals: &[Signal]) -> f64 {
    if signals.is_empty() {
        return 0.0;
    }
    signals.iter().map(|s| s.weight).sum::<f64>() / signals.len() as f64
}

fn push(list: &mut Vec<Signal>, kind: SignalKind, weight: f64) {
    list.push(Signal { kind, weight });
}

/// Evaluate every signal condition for the current bar.
pub fn generate_signals(
    cur: &FeatureSet,
    prev: &FeatureSet,
    params: &StrategyParams,
) -> SignalSet {
    let mut long = Vec::new();
    let mut short = Vec::new();

    match RegimeMode::of(cur) {
        RegimeMode::Trend if cur.trend_weight > TREND_MODE_MIN_WEIGHT => {
            trend_signals(cur, prev, &mut long, &mut short)
        }
        RegimeMode::Range if cur.range_weight > RANGE_MODE_MIN_WEIGHT => {
            range_signals(cur, prev, params, &mut long, &mut short)
        }
        _ => {}
    }

    let volume_multiplier = if cur.volume_ratio > params.volume_threshold {
        (cur.volume_ratio / params.volume_threshold).min(2.0)
    } else {
        1.0
    };
    for s in long.iter_mut().chain(short.iter_mut()) {
        s.weight *= volume_multiplier;
    }

    // Soft daily filter: the daily cross disagrees with the higher-timeframe bias
    if cur.daily_ema_fast < cur.daily_ema_slow && !cur.higher_tf_bullish {
        long.clear();
    }
    if cur.daily_ema_fast > cur.daily_ema_slow && !cur.higher_tf_bearish {
        short.clear();
    }

    SignalSet {
        long_weight: fold_weights(&long),
        short_weight: fold_weights(&short),
        long,
        short,
    }
}

fn trend_signals(cur: &FeatureSet, prev: &FeatureSet, long: &mut Vec<Signal>, short: &mut Vec<Signal>) {
    let tw = cur.trend_weight;
    let long_factor = cur.health_long_bias
        * cur.momentum_long_bias
        * cur.long_phase_weight
        * cur.regime_long_multiplier;
    let short_factor = cur.health_short_bias
        * cur.momentum_short_bias
        * cur.short_phase_weight
        * cur.regime_short_multiplier;
    let rl = cur.regime_long_multiplier;
    let rs = cur.regime_short_multiplier;

    if prev.ema_short < prev.ema_long && cur.ema_short >= cur.ema_long {
        push(long, SignalKind::EmaCrossover, tw * 1.2 * long_factor);
    }
    if cur.macd_bullish_cross && cur.macd_hist > 0.0 && cur.macd_hist > prev.macd_hist {
        push(long, SignalKind::MacdCross, tw * 1.3 * long_factor);
    }
    if cur.bullish_trend && !prev.bullish_trend && cur.plus_di > cur.minus_di * 1.2 {
        push(long, SignalKind::StrongTrend, tw * 1.5 * long_factor);
    }
    if cur.higher_tf_bullish {
        for s in long.iter_mut() {
            s.weight *= HIGHER_TF_BOOST;
        }
    }
    if cur.high > prev.high * 1.002 && cur.volume_ratio > 1.3 && cur.bullish_trend {
        push(long, SignalKind::VolumeBreakout, tw * 1.4 * rl);
    }
    if cur.higher_tf_bullish && !prev.higher_tf_bullish {
        push(long, SignalKind::DailyGoldenCross, 1.5);
    }
    if cur.balanced_long_signal && cur.final_long_bias > 0.60 {
        push(long, SignalKind::BalancedBias, cur.final_long_bias * 1.5 * rl);
    }
    if cur.volume_ratio > 1.3 && cur.close > prev.high * 1.001 {
        push(long, SignalKind::EnhancedVolumeBreakout, tw * 1.4 * rl);
    }
    if cur.close > cur.bb_lower * 1.01 && cur.rsi > 35.0 && cur.adx > 15.0 {
        push(long, SignalKind::SupportLevelBounce, 1.3 * rl);
    }

    if prev.ema_short > prev.ema_long && cur.ema_short <= cur.ema_long {
        push(short, SignalKind::EmaCrossover, tw * 1.2 * short_factor);
    }
    if cur.macd_bearish_cross && cur.macd_hist < 0.0 && cur.macd_hist < prev.macd_hist {
        push(short, SignalKind::MacdCross, tw * 1.3 * short_factor);
    }
    if cur.bearish_trend && !prev.bearish_trend && cur.minus_di > cur.plus_di * 1.2 {
        push(short, SignalKind::StrongTrend, tw * 1.5 * short_factor);
    }
    if cur.higher_tf_bearish {
        for s in short.iter_mut() {
            s.weight *= HIGHER_TF_BOOST;
        }
    }
    if cur.balanced_short_signal && cur.final_short_bias > 0.65 {
        push(short, SignalKind::BalancedBias, cur.final_short_bias * 1.5 * rs);
    }

    if cur.breakout_high.is_some_and(|h| cur.high > h) && cur.volume_ratio > 1.5 {
        push(long, SignalKind::HighBreakout, 1.6 * cur.health_long_bias * rl);
    }
    if cur.volume_ratio > 1.5 && cur.close > prev.high && cur.rsi > 45.0 {
        push(long, SignalKind::VolumeMomentum, 1.3);
    }
    if cur.close > cur.bb_lower * 1.01 && cur.rsi > 40.0 && cur.macd_hist > prev.macd_hist {
        push(long, SignalKind::SupportBounceEnhanced, 1.4);
    }
    if cur.bullish_engulfing && cur.volume_ratio > 1.2 && cur.adx > 20.0 {
        push(long, SignalKind::ConfirmedEngulfing, 1.5);
    }
}

fn range_signals(
    cur: &FeatureSet,
    prev: &FeatureSet,
    params: &StrategyParams,
    long: &mut Vec<Signal>,
    short: &mut Vec<Signal>,
) {
    let rw = cur.range_weight;
    let long_factor = cur.health_long_bias * cur.long_phase_weight * cur.regime_long_multiplier;
    let short_factor =
        cur.health_short_bias * cur.short_phase_weight * cur.regime_short_multiplier;
    let z = params.mean_reversion_threshold;

    if cur.rsi < params.rsi_oversold && cur.close < cur.bb_lower * 1.01 {
        push(long, SignalKind::RsiBandExtreme, rw * 1.3 * long_factor);
    }
    if cur.bullish_divergence && cur.rsi < 40.0 {
        push(long, SignalKind::Divergence, rw * 1.6 * long_factor);
    }
    if cur.close > cur.open
        && prev.close < prev.open
        && cur.low > prev.low * 0.998
        && cur.volume > prev.volume * 1.2
    {
        push(long, SignalKind::ReversalCandle, rw * 1.2 * long_factor);
    }
    if cur.mr_long_signal && cur.z_score < -z {
        push(
            long,
            SignalKind::MeanReversion,
            rw * 1.4 * cur.mr_signal_weight * cur.regime_long_multiplier,
        );
    }

    if cur.rsi > params.rsi_overbought && cur.close > cur.bb_upper * 0.99 {
        push(short, SignalKind::RsiBandExtreme, rw * 1.3 * short_factor);
    }
    if cur.bearish_divergence && cur.rsi > 60.0 {
        push(short, SignalKind::Divergence, rw * 1.6 * short_factor);
    }
    if cur.close < cur.open
        && prev.close > prev.open
        && cur.high < prev.high * 1.002
        && cur.volume > prev.volume * 1.2
    {
        push(short, SignalKind::ReversalCandle, rw * 1.2 * short_factor);
    }
    if cur.mr_short_signal && cur.z_score > z {
        push(
            short,
            SignalKind::MeanReversion,
            rw * 1.4 * cur.mr_signal_weight * cur.regime_short_multiplier,
        );
    }
}
