//! Market regime classification
//!
//! Labels every bar by comparing short/medium horizon price direction with
//! short/medium/long return volatility. Bars without enough history are
//! `Unknown`.

use serde::{Deserialize, Serialize};

use crate::config::StrategyParams;
use crate::indicators::sample_std;
use crate::types::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    StrongBull,
    StrongBear,
    ChoppyRange,
    TransitionToBull,
    TransitionToBear,
    Mixed,
    Unknown,
}

impl MarketRegime {
    pub const ALL: [MarketRegime; 7] = [
        MarketRegime::StrongBull,
        MarketRegime::StrongBear,
        MarketRegime::ChoppyRange,
        MarketRegime::TransitionToBull,
        MarketRegime::TransitionToBear,
        MarketRegime::Mixed,
        MarketRegime::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketRegime::StrongBull => "strong_bull",
            MarketRegime::StrongBear => "strong_bear",
            MarketRegime::ChoppyRange => "choppy_range",
            MarketRegime::TransitionToBull => "transition_to_bull",
            MarketRegime::TransitionToBear => "transition_to_bear",
            MarketRegime::Mixed => "mixed",
            MarketRegime::Unknown => "unknown",
        }
    }

    /// Fixed (long, short) signal multipliers for the regime
    pub fn multipliers(&self) -> (f64, f64) {
        match self {
            MarketRegime::StrongBull => (1.2, 0.6),
            MarketRegime::StrongBear => (0.6, 1.2),
            MarketRegime::ChoppyRange => (0.8, 0.8),
            MarketRegime::TransitionToBull => (1.0, 0.8),
            MarketRegime::TransitionToBear => (0.8, 1.0),
            MarketRegime::Mixed | MarketRegime::Unknown => (0.7, 0.7),
        }
    }

    pub fn multiplier(&self, side: Side) -> f64 {
        let (long, short) = self.multipliers();
        match side {
            Side::Long => long,
            Side::Short => short,
        }
    }

    /// True when the regime is a strong trend pointing the same way as `side`
    pub fn favours(&self, side: Side) -> bool {
        matches!(
            (self, side),
            (MarketRegime::StrongBull, Side::Long) | (MarketRegime::StrongBear, Side::Short)
        )
    }
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction/volatility snapshot the classification rule is evaluated on
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegimeInputs {
    pub short_direction: f64,
    pub medium_direction: f64,
    pub short_vol: f64,
    pub medium_vol: f64,
    pub long_vol: f64,
}

impl RegimeInputs {
    pub fn volatility_expanding(&self) -> bool {
        self.medium_vol > 0.0
            && self.long_vol > 0.0
            && self.short_vol > self.medium_vol
            && self.medium_vol > self.long_vol
    }

    pub fn volatility_contracting(&self) -> bool {
        self.short_vol > 0.0
            && self.medium_vol > 0.0
            && self.short_vol < self.medium_vol
            && self.medium_vol < self.long_vol
    }
}

/// Priority-ordered classification rule
pub fn classify(inputs: &RegimeInputs) -> MarketRegime {
    let s = inputs.short_direction;
    let m = inputs.medium_direction;

    if s > 0.05 && m > 0.03 && inputs.volatility_expanding() {
        MarketRegime::StrongBull
    } else if s < -0.05 && m < -0.03 && inputs.volatility_expanding() {
        MarketRegime::StrongBear
    } else if s.abs() < 0.02 && inputs.volatility_contracting() {
        MarketRegime::ChoppyRange
    } else if s > 0.0 && m < 0.0 {
        MarketRegime::TransitionToBull
    } else if s < 0.0 && m > 0.0 {
        MarketRegime::TransitionToBear
    } else {
        MarketRegime::Mixed
    }
}

/// Regime label for every bar of a close series
pub fn classify_regimes(closes: &[f64], params: &StrategyParams) -> Vec<MarketRegime> {
    let n = closes.len();
    let lookback = params.regime_volatility_lookback;
    let mut regimes = vec![MarketRegime::Unknown; n];
    if n <= lookback {
        return regimes;
    }

    let returns: Vec<f64> = (0..n)
        .map(|i| {
            if i == 0 {
                0.0
            } else {
                closes[i] / closes[i - 1] - 1.0
            }
        })
        .collect();

    for (i, regime) in regimes.iter_mut().enumerate().skip(lookback) {
        let inputs = regime_inputs(closes, &returns, i, params);
        *regime = classify(&inputs);
    }
    regimes
}

/// Direction is measured against the close `period - 1` bars back so a
/// `period`-bar window is spanned inclusive of the current bar.
fn regime_inputs(
    closes: &[f64],
    returns: &[f64],
    i: usize,
    params: &StrategyParams,
) -> RegimeInputs {
    let direction = |period: usize| {
        let base = closes[i + 1 - period.max(1)];
        (closes[i] - base) / base
    };
    let vol = |period: usize| sample_std(&returns[i + 1 - period..=i]);

    RegimeInputs {
        short_direction: direction(params.regime_direction_short),
        medium_direction: direction(params.regime_direction_medium),
        short_vol: vol(params.regime_direction_short),
        medium_vol: vol(params.regime_direction_medium),
        long_vol: vol(params.regime_direction_long),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(short_direction: f64, medium_direction: f64, vols: (f64, f64, f64)) -> RegimeInputs {
        RegimeInputs {
            short_direction,
            medium_direction,
            short_vol: vols.0,
            medium_vol: vols.1,
            long_vol: vols.2,
        }
    }

    #[test]
    fn test_priority_order() {
        let expanding = (0.03, 0.02, 0.01);
        let contracting = (0.01, 0.02, 0.03);
        assert_eq!(classify(&inputs(0.06, 0.04, expanding)), MarketRegime::StrongBull);
        assert_eq!(classify(&inputs(-0.06, -0.04, expanding)), MarketRegime::StrongBear);
        assert_eq!(classify(&inputs(0.01, -0.01, contracting)), MarketRegime::ChoppyRange);
        assert_eq!(classify(&inputs(0.01, -0.01, expanding)), MarketRegime::TransitionToBull);
        assert_eq!(classify(&inputs(-0.01, 0.01, expanding)), MarketRegime::TransitionToBear);
        assert_eq!(classify(&inputs(0.06, 0.04, contracting)), MarketRegime::Mixed);
    }

    #[test]
    fn test_zero_volatility_is_neither_expanding_nor_contracting() {
        let flat = inputs(0.0, 0.0, (0.0, 0.0, 0.0));
        assert!(!flat.volatility_expanding());
        assert!(!flat.volatility_contracting());
        assert_eq!(classify(&flat), MarketRegime::Mixed);
    }

    #[test]
    fn test_warmup_is_unknown() {
        let params = StrategyParams::default();
        let closes: Vec<f64> = (0..150).map(|i| 100.0 + i as f64).collect();
        let regimes = classify_regimes(&closes, &params);
        assert!(regimes[..params.regime_volatility_lookback]
            .iter()
            .all(|r| *r == MarketRegime::Unknown));
        assert!(regimes[params.regime_volatility_lookback..]
            .iter()
            .all(|r| *r != MarketRegime::Unknown));
    }

    #[test]
    fn test_multipliers() {
        assert_eq!(MarketRegime::StrongBull.multipliers(), (1.2, 0.6));
        assert_eq!(MarketRegime::Unknown.multiplier(Side::Short), 0.7);
        assert!(MarketRegime::StrongBear.favours(Side::Short));
        assert!(!MarketRegime::StrongBear.favours(Side::Long));
    }
}
