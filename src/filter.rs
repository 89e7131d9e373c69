//! Bias filter and entry gating
//!
//! Reshapes the raw signal weights through a fixed chain of multiplicative
//! adjustments (volatility, session, candle direction, recent performance,
//! blended bias, regime, trend safety, rebalancing, account-level boosts) and
//! decides which side, if any, is actionable.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::config::StrategyParams;
use crate::features::FeatureSet;
use crate::regime::MarketRegime;
use crate::signals::SignalSet;
use crate::types::Side;

/// Mean-reversion weights are raised to at least this on quiet bars
pub const MR_WEIGHT_FLOOR: f64 = 1.3;
const RECENT_PERFORMANCE_WINDOW: usize = 5;
const CIRCUIT_BREAKER_WINDOW: usize = 20;
const CIRCUIT_BREAKER_SHORT_SHARE: f64 = 0.7;

/// A closed trade as seen by the feedback loops
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub side: Side,
    pub pnl: f64,
}

/// Bounded window over the most recently closed trades.
///
/// Read by the bias filter and the risk adaptation steps; written only by the
/// simulation loop (or live trader) when a trade closes.
#[derive(Debug, Clone)]
pub struct RecentTrades {
    trades: VecDeque<ClosedTrade>,
    capacity: usize,
    total_closed: usize,
}

impl Default for RecentTrades {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl RecentTrades {
    pub const DEFAULT_CAPACITY: usize = 50;

    pub fn new(capacity: usize) -> Self {
        RecentTrades {
            trades: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            total_closed: 0,
        }
    }

    pub fn push(&mut self, side: Side, pnl: f64) {
        if self.trades.len() == self.capacity {
            self.trades.pop_front();
        }
        self.trades.push_back(ClosedTrade { side, pnl });
        self.total_closed += 1;
    }

    /// Trades currently held in the window
    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    /// Trades closed since the window was created
    pub fn total_closed(&self) -> usize {
        self.total_closed
    }

    /// The last `n` trades, oldest first
    pub fn last(&self, n: usize) -> impl Iterator<Item = &ClosedTrade> + '_ {
        self.trades.iter().skip(self.trades.len().saturating_sub(n))
    }

    /// Win rate over the last `n` trades, optionally restricted to one side
    pub fn win_rate(&self, n: usize, side: Option<Side>) -> Option<f64> {
        let (wins, count) = self
            .last(n)
            .filter(|t| side.map_or(true, |s| t.side == s))
            .fold((0usize, 0usize), |(w, c), t| (w + (t.pnl > 0.0) as usize, c + 1));
        (count > 0).then(|| wins as f64 / count as f64)
    }

    /// Share of the last `n` trades taken on `side`
    pub fn side_share(&self, n: usize, side: Side) -> Option<f64> {
        let window: Vec<_> = self.last(n).collect();
        if window.is_empty() {
            return None;
        }
        let matching = window.iter().filter(|t| t.side == side).count();
        Some(matching as f64 / window.len() as f64)
    }

    /// Gross profit over gross loss for the last `n` trades; infinite with no losses
    pub fn profit_factor(&self, n: usize) -> f64 {
        let (gross_profit, gross_loss) = self.last(n).fold((0.0, 0.0), |(p, l), t| {
            if t.pnl > 0.0 {
                (p + t.pnl, l)
            } else {
                (p, l - t.pnl)
            }
        });
        if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        }
    }

    /// (average win, average absolute loss) over the last `n` trades
    pub fn average_win_loss(&self, n: usize) -> (f64, f64) {
        let wins: Vec<f64> = self.last(n).filter(|t| t.pnl > 0.0).map(|t| t.pnl).collect();
        let losses: Vec<f64> = self.last(n).filter(|t| t.pnl <= 0.0).map(|t| -t.pnl).collect();
        let avg = |v: &[f64]| {
            if v.is_empty() {
                0.0
            } else {
                v.iter().sum::<f64>() / v.len() as f64
            }
        };
        (avg(&wins), avg(&losses))
    }
}

/// Account-level multipliers applied once per bar
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiasContext {
    pub global_long_boost: f64,
    pub global_short_penalty: f64,
    pub short_hotfix_multiplier: f64,
    pub volume_threshold: f64,
}

impl BiasContext {
    /// `global_short_penalty` comes from the rebalancing state, not the static parameters
    pub fn new(params: &StrategyParams, global_short_penalty: f64) -> Self {
        BiasContext {
            global_long_boost: params.global_long_boost,
            global_short_penalty,
            short_hotfix_multiplier: params.short_hotfix_multiplier,
            volume_threshold: params.volume_threshold,
        }
    }
}

/// Decision weights after filtering
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilteredWeights {
    pub long: f64,
    pub short: f64,
}

impl FilteredWeights {
    pub fn weight(&self, side: Side) -> f64 {
        match side {
            Side::Long => self.long,
            Side::Short => self.short,
        }
    }

    /// A side is actionable when its weight reaches `threshold` and strictly
    /// beats the other side.
    pub fn actionable_side(&self, threshold: f64) -> Option<Side> {
        if self.long >= threshold && self.long > self.short {
            Some(Side::Long)
        } else if self.short >= threshold && self.short > self.long {
            Some(Side::Short)
        } else {
            None
        }
    }
}

/// Run the ordered adjustment chain over the raw signal weights.
pub fn apply_bias_filter(
    cur: &FeatureSet,
    signals: &SignalSet,
    recent: &RecentTrades,
    ctx: &BiasContext,
) -> FilteredWeights {
    let mut long = signals.long_weight;
    let mut short = signals.short_weight;

    // 1. quiet market: lift mean-reversion contributions
    if cur.adx < 18.0 && cur.volatility_ratio < 1.3 {
        if signals.has_mean_reversion(Side::Long) {
            long = long.max(MR_WEIGHT_FLOOR);
        }
        if signals.has_mean_reversion(Side::Short) {
            short = short.max(MR_WEIGHT_FLOOR);
        }
    }

    // 2. high volatility
    if cur.volatility_ratio > 1.5 {
        long *= 0.7;
        short *= 0.7;
    }

    // 3. overnight session
    if cur.hour() < 6 {
        long *= 0.8;
        short *= 0.8;
    }

    // 4. candle direction
    if cur.is_bullish_candle() {
        long *= 1.1;
        short *= 0.9;
    } else {
        long *= 0.9;
        short *= 1.1;
    }

    // 5. recent per-side performance
    if recent.len() >= RECENT_PERFORMANCE_WINDOW {
        long *= performance_factor(recent.win_rate(RECENT_PERFORMANCE_WINDOW, Some(Side::Long)));
        short *= performance_factor(recent.win_rate(RECENT_PERFORMANCE_WINDOW, Some(Side::Short)));
    }

    // 6. blended bias
    long *= cur.final_long_bias;
    short *= cur.final_short_bias;

    // 7. regime
    match cur.regime {
        MarketRegime::StrongBull => {
            long *= 1.25;
            short *= 0.60;
        }
        MarketRegime::StrongBear => {
            long *= 0.80;
            short *= 1.25;
        }
        MarketRegime::ChoppyRange => {
            if !signals.has_mean_reversion(Side::Long) {
                long *= 0.8;
            }
            if !signals.has_mean_reversion(Side::Short) {
                short *= 0.8;
            }
        }
        MarketRegime::TransitionToBull => long *= 1.1,
        MarketRegime::TransitionToBear => short *= 1.1,
        MarketRegime::Mixed | MarketRegime::Unknown => {}
    }

    // 8. trend safety for shorts
    if cur.higher_tf_bullish && cur.close > cur.daily_ema_fast {
        short *= 0.3;
        if cur.close > cur.daily_ema_fast * 1.005 {
            short *= 0.3;
        }
    }

    // 9. rebalancing circuit breaker
    if recent.len() >= CIRCUIT_BREAKER_WINDOW
        && recent
            .side_share(CIRCUIT_BREAKER_WINDOW, Side::Short)
            .is_some_and(|share| share > CIRCUIT_BREAKER_SHORT_SHARE)
    {
        short *= 0.1;
    }

    // 10. account-level boost and penalty, once each
    short *= ctx.global_short_penalty;
    long *= ctx.global_long_boost;

    // 11.
    short *= ctx.short_hotfix_multiplier;

    // 12. directional trend filter for longs
    if cur.higher_tf_bullish && cur.daily_ema_fast > cur.daily_ema_slow {
        long *= 1.3;
    } else {
        long *= 0.6;
    }

    // 13. volume confirmation for longs
    if cur.volume_ratio < ctx.volume_threshold {
        long *= 0.7;
    }

    FilteredWeights { long, short }
}

fn performance_factor(win_rate: Option<f64>) -> f64 {
    match win_rate {
        Some(wr) if wr > 0.6 => 1.2,
        Some(wr) if wr < 0.4 => 0.8,
        _ => 1.0,
    }
}
