//! Stop-loss / take-profit levels and trailing stops

use serde::{Deserialize, Serialize};

use crate::config::StrategyParams;
use crate::features::FeatureSet;
use crate::regime::MarketRegime;
use crate::types::Side;

/// Trade age after which the stop starts tightening
const AGE_TIGHTEN_AFTER_HOURS: f64 = 4.0;
const AGE_FACTOR_CAP: f64 = 3.0;
/// Range weight above which the target is capped at the Bollinger band
const RANGE_CAP_WEIGHT: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExitLevels {
    pub stop_loss: f64,
    pub take_profit: f64,
}

impl ExitLevels {
    /// Distance from entry to the stop, positive when the stop is on the losing side
    pub fn risk(&self, side: Side, entry_price: f64) -> f64 {
        (entry_price - self.stop_loss) * side.sign()
    }

    pub fn reward(&self, side: Side, entry_price: f64) -> f64 {
        (self.take_profit - entry_price) * side.sign()
    }

    pub fn reward_risk(&self, side: Side, entry_price: f64) -> f64 {
        let risk = self.risk(side, entry_price);
        if risk > 0.0 {
            self.reward(side, entry_price) / risk
        } else {
            0.0
        }
    }
}

/// (stop, target) ATR multipliers by volatility bucket
pub fn volatility_multipliers(volatility_ratio: f64) -> (f64, f64) {
    if volatility_ratio < 0.8 {
        (1.8, 5.5)
    } else if volatility_ratio < 1.5 {
        (2.3, 6.5)
    } else {
        (3.0, 8.0)
    }
}

/// Compute exit levels for a position entered (or re-averaged) at `entry_price`.
///
/// `tp_scale` is the ratio of the adapted take-profit multiplier to its
/// configured value; it is 1.0 until risk adaptation moves it.
pub fn calculate_exit_levels(
    side: Side,
    entry_price: f64,
    feature: &FeatureSet,
    age_hours: f64,
    tp_scale: f64,
    params: &StrategyParams,
) -> ExitLevels {
    let (mut sl_mult, mut tp_mult) = volatility_multipliers(feature.volatility_ratio);
    tp_mult *= tp_scale;

    if feature.regime.favours(side) {
        tp_mult *= 1.2;
    } else if feature.regime == MarketRegime::ChoppyRange {
        tp_mult *= 0.8;
        sl_mult *= 1.2;
    }

    if age_hours > AGE_TIGHTEN_AFTER_HOURS {
        let age_factor = (1.0 + (age_hours - AGE_TIGHTEN_AFTER_HOURS) / 20.0).min(AGE_FACTOR_CAP);
        sl_mult /= age_factor;
    }

    let sign = side.sign();
    let stop_loss = entry_price - sign * feature.atr * sl_mult;
    let mut take_profit = entry_price + sign * feature.atr * tp_mult;

    if feature.range_weight > RANGE_CAP_WEIGHT {
        take_profit = match side {
            Side::Long => take_profit.min(feature.bb_upper),
            Side::Short => take_profit.max(feature.bb_lower),
        };
    }

    let mut levels = ExitLevels {
        stop_loss,
        take_profit,
    };
    let risk = levels.risk(side, entry_price);
    if levels.reward_risk(side, entry_price) < params.min_reward_risk {
        levels.take_profit = entry_price + sign * risk * params.min_reward_risk;
    }
    levels
}

/// Profit-locking stop once unrealized gain reaches `activation`.
///
/// The stop sits a fraction of the gain beyond entry: 20% of it below 5%,
/// 30% up to 10%, 40% above.
pub fn trailing_stop(side: Side, entry_price: f64, unrealized_pct: f64, activation: f64) -> Option<f64> {
    if unrealized_pct <= 0.0 || unrealized_pct < activation {
        return None;
    }
    let fraction = if unrealized_pct >= 0.10 {
        0.4
    } else if unrealized_pct >= 0.05 {
        0.3
    } else {
        0.2
    };
    Some(entry_price * (1.0 + side.sign() * unrealized_pct * fraction))
}

/// Move `current` to `candidate` only if that tightens the stop
pub fn tighten(side: Side, current: f64, candidate: f64) -> f64 {
    match side {
        Side::Long => current.max(candidate),
        Side::Short => current.min(candidate),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::tests::base_feature;

    fn feature(volatility_ratio: f64, regime: MarketRegime, range_weight: f64) -> FeatureSet {
        FeatureSet {
            atr: 1.0,
            volatility_ratio,
            regime,
            range_weight,
            trend_weight: 1.0 - range_weight,
            ..base_feature()
        }
    }

    #[test]
    fn test_volatility_buckets() {
        assert_eq!(volatility_multipliers(0.5), (1.8, 5.5));
        assert_eq!(volatility_multipliers(1.0), (2.3, 6.5));
        assert_eq!(volatility_multipliers(2.0), (3.0, 8.0));
    }

    #[test]
    fn test_long_levels() {
        let params = StrategyParams::default();
        let levels = calculate_exit_levels(
            Side::Long,
            100.0,
            &feature(1.0, MarketRegime::Mixed, 0.2),
            0.0,
            1.0,
            &params,
        );
        assert!((levels.stop_loss - 97.7).abs() < 1e-9);
        assert!((levels.take_profit - 106.5).abs() < 1e-9);
    }

    #[test]
    fn test_regime_adjustments() {
        let params = StrategyParams::default();
        let bull = calculate_exit_levels(
            Side::Long,
            100.0,
            &feature(1.0, MarketRegime::StrongBull, 0.2),
            0.0,
            1.0,
            &params,
        );
        assert!((bull.take_profit - (100.0 + 6.5 * 1.2)).abs() < 1e-9);

        let choppy = calculate_exit_levels(
            Side::Short,
            100.0,
            &feature(1.0, MarketRegime::ChoppyRange, 0.2),
            0.0,
            1.0,
            &params,
        );
        assert!((choppy.stop_loss - (100.0 + 2.3 * 1.2)).abs() < 1e-9);
        // 5.2 reward on 2.76 risk falls under the 2R floor
        assert!((choppy.take_profit - (100.0 - 2.3 * 1.2 * 2.0)).abs() < 1e-9);
    }

    #[test]
    fn test_age_tightens_stop() {
        let params = StrategyParams::default();
        let f = feature(1.0, MarketRegime::Mixed, 0.2);
        let fresh = calculate_exit_levels(Side::Long, 100.0, &f, 0.0, 1.0, &params);
        let aged = calculate_exit_levels(Side::Long, 100.0, &f, 24.0, 1.0, &params);
        let ancient = calculate_exit_levels(Side::Long, 100.0, &f, 500.0, 1.0, &params);
        assert!((aged.risk(Side::Long, 100.0) - 2.3 / 2.0).abs() < 1e-9);
        assert!(aged.stop_loss > fresh.stop_loss);
        assert!((ancient.risk(Side::Long, 100.0) - 2.3 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_range_cap_then_reward_risk_floor() {
        let params = StrategyParams::default();
        // band 3 away, stop 2.3 away: capped target gives 1.3 R, floor lifts it to 2 R
        let f = FeatureSet {
            bb_upper: 103.0,
            ..feature(1.0, MarketRegime::Mixed, 0.8)
        };
        let levels = calculate_exit_levels(Side::Long, 100.0, &f, 0.0, 1.0, &params);
        assert!((levels.take_profit - (100.0 + 2.3 * 2.0)).abs() < 1e-9);
        assert!(levels.reward_risk(Side::Long, 100.0) >= 2.0 - 1e-9);
    }

    #[test]
    fn test_reward_risk_floor_holds_everywhere() {
        let params = StrategyParams::default();
        for side in [Side::Long, Side::Short] {
            for vol in [0.5, 1.0, 2.0] {
                for regime in MarketRegime::ALL {
                    for age in [0.0, 10.0, 100.0] {
                        for scale in [3.0 / 7.0, 1.0] {
                            let f = feature(vol, regime, 0.9);
                            let levels = calculate_exit_levels(side, 100.0, &f, age, scale, &params);
                            assert!(levels.risk(side, 100.0) > 0.0);
                            assert!(levels.reward_risk(side, 100.0) >= 2.0 - 1e-9);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_trailing_stop_fractions() {
        assert_eq!(trailing_stop(Side::Long, 100.0, 0.02, 0.03), None);
        assert!((trailing_stop(Side::Long, 100.0, 0.04, 0.03).unwrap() - 100.8).abs() < 1e-9);
        assert!((trailing_stop(Side::Long, 100.0, 0.06, 0.03).unwrap() - 101.8).abs() < 1e-9);
        assert!((trailing_stop(Side::Short, 100.0, 0.20, 0.03).unwrap() - 92.0).abs() < 1e-9);
    }

    #[test]
    fn test_tighten_never_loosens() {
        assert_eq!(tighten(Side::Long, 95.0, 94.0), 95.0);
        assert_eq!(tighten(Side::Long, 95.0, 96.0), 96.0);
        assert_eq!(tighten(Side::Short, 105.0, 106.0), 105.0);
        assert_eq!(tighten(Side::Short, 105.0, 104.0), 104.0);
    }
}
