//! Risk management
//!
//! Position sizing, leverage selection and the feedback loops that adapt
//! risk from recent results.
//!
//! Sizes are quote-currency notionals:
//! ```text
//! size = (balance * risk_per_trade) / (|entry - stop| / entry)
//! ```
//! floored at the configured minimum position and capped at
//! `balance * leverage`. The cap wins when the two conflict.

use crate::config::{AccountConfig, StrategyParams};
use crate::features::FeatureSet;
use crate::filter::RecentTrades;
use crate::regime::MarketRegime;
use crate::types::{Side, SizingWarning, EPSILON};

pub const BASE_LEVERAGE: f64 = 2.0;

/// Closed trades between risk adaptations
pub const ADAPT_EVERY_TRADES: usize = 20;
const ADAPT_WINDOW: usize = 50;
const RISK_CEILING: f64 = 0.026;
const RISK_FLOOR: f64 = 0.014;

/// Bars between long/short rebalancing (one week of 15-minute bars)
pub const REBALANCE_EVERY_BARS: usize = 672;
const REBALANCE_WINDOW: usize = 10;
/// Closed trades required before rebalancing engages
const REBALANCE_MIN_HISTORY: usize = 30;
const REBALANCE_SHORT_SHARE: f64 = 0.7;
const REBALANCE_SHORT_PENALTY: f64 = 0.7;

const KELLY_CAP: f64 = 0.25;

/// Smallest tradable quantity in base units
pub const MIN_QTY: f64 = 0.0001;
/// Stop distance used when the stop coincides with the price
const FALLBACK_PRICE_RISK: f64 = 0.001;

/// Risk-based notional size, clamped to `[min_position, balance * leverage]`.
pub fn position_size(
    balance: f64,
    risk_per_trade: f64,
    entry_price: f64,
    stop_loss: f64,
    leverage: f64,
    min_position: f64,
) -> (f64, Vec<SizingWarning>) {
    let mut warnings = Vec::new();
    let price_risk = (entry_price - stop_loss).abs() / entry_price.max(EPSILON);
    let mut size = if price_risk > EPSILON {
        balance * risk_per_trade / price_risk
    } else {
        0.0
    };

    if size < min_position {
        warnings.push(SizingWarning::BelowMinimum {
            requested: size,
            minimum: min_position,
        });
        size = min_position;
    }

    let cap = balance * leverage;
    if size > cap {
        warnings.push(SizingWarning::AboveLeverageCap {
            requested: size,
            cap,
        });
        size = cap;
    }

    tracing::debug!(balance, risk_per_trade, price_risk, leverage, size, "Position sized");
    (size, warnings)
}

/// Leverage from volatility, trend agreement, regime and market health
pub fn optimal_leverage(feature: &FeatureSet, side: Side, max_leverage: f64) -> f64 {
    let volatility = if feature.volatility_ratio > 1.5 {
        0.7
    } else if feature.volatility_ratio < 0.8 {
        1.3
    } else {
        1.0
    };

    let trend = if feature.adx > 35.0 {
        let in_favour = match side {
            Side::Long => feature.plus_di > feature.minus_di,
            Side::Short => feature.minus_di > feature.plus_di,
        };
        if in_favour {
            1.2
        } else {
            0.7
        }
    } else {
        1.0
    };

    let regime = match (feature.regime, side) {
        (MarketRegime::StrongBull, Side::Long) => 1.2,
        (MarketRegime::StrongBear, Side::Short) => 1.4,
        (MarketRegime::ChoppyRange, _) => 0.8,
        (MarketRegime::TransitionToBull, Side::Short) => 0.8,
        (MarketRegime::TransitionToBear, Side::Long) => 0.8,
        _ => 1.0,
    };

    let health = feature.market_health / 100.0;
    let health_adj = match side {
        Side::Long => 0.8 + health * 0.4,
        Side::Short => 1.2 - health * 0.4,
    };

    (BASE_LEVERAGE * volatility * trend * regime * health_adj).min(max_leverage)
}

/// Adaptive account state: risk per trade, take-profit multiplier and the
/// short penalty maintained by rebalancing.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskState {
    pub risk_per_trade: f64,
    pub take_profit_multiplier: f64,
    pub global_short_penalty: f64,
    tp_upper: f64,
    tp_lower: f64,
    adapted_at: usize,
}

impl RiskState {
    pub fn new(account: &AccountConfig, params: &StrategyParams) -> Self {
        RiskState {
            risk_per_trade: account.base_risk_per_trade,
            take_profit_multiplier: params.atr_multiplier_tp,
            global_short_penalty: params.global_short_penalty,
            tp_upper: params.atr_multiplier_tp,
            tp_lower: params.atr_multiplier_tp * 3.0 / 7.0,
            adapted_at: 0,
        }
    }

    /// Scale applied to exit-level target multipliers
    pub fn tp_scale(&self) -> f64 {
        self.take_profit_multiplier / self.tp_upper.max(EPSILON)
    }

    /// Adapt once each time the closed-trade count reaches a new multiple of 20.
    pub fn maybe_adapt(&mut self, recent: &RecentTrades) -> bool {
        let closed = recent.total_closed();
        if closed == 0 || closed % ADAPT_EVERY_TRADES != 0 || closed == self.adapted_at {
            return false;
        }
        self.adapted_at = closed;
        self.adapt(recent);
        true
    }

    /// Retune risk and target from the last 50 closed trades
    pub fn adapt(&mut self, recent: &RecentTrades) {
        let Some(win_rate) = recent.win_rate(ADAPT_WINDOW, None) else {
            return;
        };
        let profit_factor = recent.profit_factor(ADAPT_WINDOW);
        let (avg_win, avg_loss) = recent.average_win_loss(ADAPT_WINDOW);
        let before = (self.risk_per_trade, self.take_profit_multiplier);

        if profit_factor > 1.5 && win_rate > 0.5 {
            self.risk_per_trade = (self.risk_per_trade * 1.3).min(RISK_CEILING);
        } else if profit_factor < 1.0 || win_rate < 0.4 {
            self.risk_per_trade = (self.risk_per_trade * 0.7).max(RISK_FLOOR);
        }

        if avg_win > 0.0 && avg_loss > 0.0 {
            let ratio = avg_win / avg_loss;
            if ratio < 1.5 {
                self.take_profit_multiplier = (self.take_profit_multiplier * 1.05).min(self.tp_upper);
            } else if ratio > 3.0 && win_rate < 0.4 {
                self.take_profit_multiplier = (self.take_profit_multiplier * 0.95).max(self.tp_lower);
            }
        }

        tracing::info!(
            win_rate,
            profit_factor,
            risk_before = before.0,
            risk_after = self.risk_per_trade,
            tp_before = before.1,
            tp_after = self.take_profit_multiplier,
            "Risk parameters adapted"
        );
    }

    /// Penalise shorts when they dominated the last 10 trades; lift the penalty otherwise.
    /// No-op until more than 30 trades have closed.
    pub fn rebalance(&mut self, recent: &RecentTrades) -> bool {
        if recent.total_closed() <= REBALANCE_MIN_HISTORY || recent.len() < REBALANCE_WINDOW {
            return false;
        }
        let share = recent.side_share(REBALANCE_WINDOW, Side::Short).unwrap_or(0.0);
        self.global_short_penalty = if share > REBALANCE_SHORT_SHARE {
            REBALANCE_SHORT_PENALTY
        } else {
            1.0
        };
        tracing::debug!(short_share = share, penalty = self.global_short_penalty, "Long/short rebalanced");
        true
    }
}

/// Kelly fraction, clamped to [0, 0.25]
pub fn kelly_fraction(win_rate: f64, avg_win: f64, avg_loss: f64) -> f64 {
    let avg_loss = if avg_loss == 0.0 { 0.001 } else { avg_loss };
    let payoff = avg_win / avg_loss;
    if payoff <= 0.0 {
        return 0.0;
    }
    (win_rate - (1.0 - win_rate) / payoff).clamp(0.0, KELLY_CAP)
}

/// Per-side risk per trade from side win rates, regime and recent form.
///
/// Returns `(long, short)`.
pub fn adaptive_risk_per_trade(
    base_risk: f64,
    regime: MarketRegime,
    win_rate_long: f64,
    win_rate_short: f64,
    recent: &RecentTrades,
) -> (f64, f64) {
    let side_adjustment = |wr: f64| {
        if wr > 0.6 {
            1.2
        } else if wr < 0.4 {
            0.8
        } else {
            1.0
        }
    };

    let (regime_long, regime_short) = match regime {
        MarketRegime::StrongBull => (1.1, 0.7),
        MarketRegime::StrongBear => (0.7, 1.1),
        MarketRegime::ChoppyRange => (0.8, 0.8),
        MarketRegime::TransitionToBull => (0.9, 0.8),
        MarketRegime::TransitionToBear => (0.8, 0.9),
        MarketRegime::Mixed | MarketRegime::Unknown => (0.7, 0.7),
    };

    let mut risk = base_risk;
    if recent.len() > 20 {
        let win_rate = recent.win_rate(20, None).unwrap_or(0.0);
        let profit_factor = if recent.last(20).any(|t| t.pnl <= 0.0) {
            recent.profit_factor(20)
        } else {
            2.0
        };
        if win_rate > 0.6 {
            risk *= 1.3;
        } else if profit_factor > 2.0 {
            risk *= 1.2;
        }
    }

    (
        risk * side_adjustment(win_rate_long) * regime_long,
        risk * side_adjustment(win_rate_short) * regime_short,
    )
}

/// Base-unit quantity for a live order.
///
/// Risk is scaled by the win rate of `recent_pnl` (the last 20 closed trades);
/// a stop equal to the price falls back to a 0.1% stop distance.
pub fn calc_qty(balance: f64, price: f64, stop_loss: f64, base_risk: f64, recent_pnl: &[f64]) -> f64 {
    let mut risk_pct = base_risk;
    if !recent_pnl.is_empty() {
        let wins = recent_pnl.iter().filter(|p| **p > 0.0).count();
        let win_rate = wins as f64 / recent_pnl.len() as f64;
        if win_rate < 0.4 {
            risk_pct *= 0.8;
        } else if win_rate > 0.6 {
            risk_pct *= 1.2;
        }
    }

    if price <= 0.0 {
        tracing::warn!(price, "Invalid price for sizing");
        return MIN_QTY;
    }
    let price_risk = if price != stop_loss {
        (price - stop_loss).abs() / price
    } else {
        FALLBACK_PRICE_RISK
    };

    let qty = balance * risk_pct / (price * price_risk);
    qty.max(MIN_QTY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::tests::base_feature;
    use approx::assert_relative_eq;

    fn window(trades: &[(Side, f64)]) -> RecentTrades {
        let mut recent = RecentTrades::default();
        for (side, pnl) in trades {
            recent.push(*side, *pnl);
        }
        recent
    }

    #[test]
    fn test_position_sizing() {
        // risk 20 over a 5% stop = 400 notional
        let (size, warnings) = position_size(1000.0, 0.02, 100.0, 95.0, 3.0, 100.0);
        assert_relative_eq!(size, 400.0, epsilon = 1e-9);
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_sizing_floor_and_cap() {
        let (size, warnings) = position_size(1000.0, 0.02, 100.0, 50.0, 3.0, 100.0);
        assert_eq!(size, 100.0);
        assert!(matches!(warnings[0], SizingWarning::BelowMinimum { .. }));

        let (size, warnings) = position_size(1000.0, 0.02, 100.0, 99.9, 2.0, 100.0);
        assert_eq!(size, 2000.0);
        assert!(matches!(warnings[0], SizingWarning::AboveLeverageCap { .. }));

        // floor above the cap: the cap wins
        let (size, warnings) = position_size(40.0, 0.02, 100.0, 50.0, 2.0, 100.0);
        assert_eq!(size, 80.0);
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn test_leverage_components() {
        let f = FeatureSet {
            volatility_ratio: 1.0,
            adx: 25.0,
            market_health: 50.0,
            ..base_feature()
        };
        assert_relative_eq!(optimal_leverage(&f, Side::Long, 5.0), 2.0, epsilon = 1e-12);

        let strong = FeatureSet {
            volatility_ratio: 0.5,
            adx: 40.0,
            regime: MarketRegime::StrongBull,
            market_health: 100.0,
            ..base_feature()
        };
        // 2 * 1.3 * 1.2 * 1.2 * 1.2 = 4.49, clamped
        assert_eq!(optimal_leverage(&strong, Side::Long, 3.0), 3.0);
        // against the trend: 2 * 1.3 * 0.7 * 1.0 * 0.8
        assert_relative_eq!(optimal_leverage(&strong, Side::Short, 3.0), 1.456, epsilon = 1e-9);
    }

    #[test]
    fn test_adaptation_fires_once_per_twenty() {
        let account = AccountConfig::default();
        let params = StrategyParams::default();
        let mut state = RiskState::new(&account, &params);
        let mut recent = RecentTrades::default();
        for _ in 0..19 {
            recent.push(Side::Long, 10.0);
        }
        assert!(!state.maybe_adapt(&recent));
        recent.push(Side::Long, 10.0);
        assert!(state.maybe_adapt(&recent));
        assert!(!state.maybe_adapt(&recent));
        // all winners, no losses: profit factor infinite
        assert_relative_eq!(state.risk_per_trade, 0.026, epsilon = 1e-12);
    }

    #[test]
    fn test_adaptation_cuts_risk_and_extends_target() {
        let account = AccountConfig::default();
        let params = StrategyParams::default();
        let mut state = RiskState::new(&account, &params);
        state.take_profit_multiplier = 5.0;
        let trades: Vec<_> = (0..20)
            .map(|i| (Side::Long, if i % 3 == 0 { 10.0 } else { -10.0 }))
            .collect();
        state.adapt(&window(&trades));
        assert_relative_eq!(state.risk_per_trade, 0.014, epsilon = 1e-12);
        assert_relative_eq!(state.take_profit_multiplier, 5.25, epsilon = 1e-12);
        assert_relative_eq!(state.tp_scale(), 0.75, epsilon = 1e-12);
    }

    #[test]
    fn test_take_profit_bounds() {
        let account = AccountConfig::default();
        let params = StrategyParams::default();
        let mut state = RiskState::new(&account, &params);
        // already at the upper bound
        state.adapt(&window(&[(Side::Long, 1.0), (Side::Long, -1.0)]));
        assert_relative_eq!(state.take_profit_multiplier, 7.0, epsilon = 1e-12);

        state.take_profit_multiplier = 3.05;
        let trades: Vec<_> = (0..10)
            .map(|i| (Side::Long, if i < 3 { 40.0 } else { -10.0 }))
            .collect();
        state.adapt(&window(&trades));
        assert_relative_eq!(state.take_profit_multiplier, 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_rebalance() {
        let account = AccountConfig::default();
        let params = StrategyParams::default();
        let mut state = RiskState::new(&account, &params);
        assert!(!state.rebalance(&window(&[(Side::Short, 1.0); 9])));
        assert_relative_eq!(state.global_short_penalty, 0.9);

        // a full short window is ignored until the history exceeds 30 trades
        assert!(!state.rebalance(&window(&[(Side::Short, 1.0); 30])));
        assert_relative_eq!(state.global_short_penalty, 0.9);

        assert!(state.rebalance(&window(&[(Side::Short, 1.0); 31])));
        assert_relative_eq!(state.global_short_penalty, 0.7);

        let mixed: Vec<_> = (0..31)
            .map(|i| (if i % 2 == 0 { Side::Long } else { Side::Short }, 1.0))
            .collect();
        assert!(state.rebalance(&window(&mixed)));
        assert_relative_eq!(state.global_short_penalty, 1.0);
    }

    #[test]
    fn test_kelly() {
        assert_relative_eq!(kelly_fraction(0.6, 2.0, 1.0), 0.25);
        assert_relative_eq!(kelly_fraction(0.5, 1.5, 1.0), 0.5 - 0.5 / 1.5, epsilon = 1e-12);
        assert_eq!(kelly_fraction(0.2, 1.0, 1.0), 0.0);
        assert!(kelly_fraction(0.5, 1.0, 0.0) <= 0.25);
    }

    #[test]
    fn test_adaptive_risk_per_trade() {
        let recent = RecentTrades::default();
        let (long, short) =
            adaptive_risk_per_trade(0.02, MarketRegime::StrongBull, 0.7, 0.3, &recent);
        assert_relative_eq!(long, 0.02 * 1.2 * 1.1, epsilon = 1e-12);
        assert_relative_eq!(short, 0.02 * 0.8 * 0.7, epsilon = 1e-12);

        let hot = window(&[(Side::Long, 5.0); 21]);
        let (long, _) = adaptive_risk_per_trade(0.02, MarketRegime::Mixed, 0.5, 0.5, &hot);
        assert_relative_eq!(long, 0.02 * 1.3 * 0.7, epsilon = 1e-12);
    }

    #[test]
    fn test_calc_qty() {
        // 1000 * 0.02 / (100 * 0.02) = 10
        assert_relative_eq!(calc_qty(1000.0, 100.0, 98.0, 0.02, &[]), 10.0, epsilon = 1e-9);
        let losing = [-1.0; 20];
        assert_relative_eq!(calc_qty(1000.0, 100.0, 98.0, 0.02, &losing), 8.0, epsilon = 1e-9);
        // stop at price: 0.1% fallback
        assert_relative_eq!(calc_qty(1000.0, 100.0, 100.0, 0.02, &[]), 200.0, epsilon = 1e-9);
        assert_eq!(calc_qty(0.0, 100.0, 98.0, 0.02, &[]), MIN_QTY);
    }
}
