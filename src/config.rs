//! Configuration management
//!
//! JSON configuration with typed sections, documented defaults and
//! `.env`/environment overrides. Everything is validated once at load time.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::error::ConfigError;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub account: AccountConfig,
    pub strategy: StrategyParams,
    pub backtest: BacktestConfig,
    pub live: LiveConfig,
    /// Grid search values for optimization, keyed by strategy parameter name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grid: Option<BTreeMap<String, Vec<f64>>>,
}

impl Config {
    /// Load configuration from a JSON file, apply environment overrides and validate.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        dotenv::dotenv().ok();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides picked up from the process environment (and `.env`)
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = env_value::<f64>("INITIAL_BALANCE")? {
            self.account.initial_balance = v;
        }
        if let Some(v) = env_value::<usize>("WARMUP_CANDLES")? {
            self.live.warmup_candles = v;
        }
        if let Some(v) = env_value::<f64>("TRAIL_TRIGGER_LONG")? {
            self.live.trail_trigger_long = v;
        }
        if let Some(v) = env_value::<f64>("TRAIL_TRIGGER_SHORT")? {
            self.live.trail_trigger_short = v;
        }
        if let Some(v) = env_value::<f64>("TRAIL_SL_LONG")? {
            self.live.trail_sl_long = v;
        }
        if let Some(v) = env_value::<f64>("TRAIL_SL_SHORT")? {
            self.live.trail_sl_short = v;
        }
        if let Ok(symbol) = std::env::var("SYMBOL") {
            self.live.symbol = symbol;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.account.validate()?;
        self.strategy.validate()?;
        self.live.validate()?;
        if let Some(grid) = &self.grid {
            let mut candidate = self.strategy.clone();
            for (name, values) in grid {
                for &value in values {
                    candidate.set(name, value)?;
                }
            }
        }
        Ok(())
    }
}

fn env_value<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => parse_env_value(key, &raw).map(Some),
        Err(_) => Ok(None),
    }
}

fn parse_env_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse::<T>()
        .with_context(|| format!("Environment variable {} is not a valid value: {}", key, raw))
}

/// Account and execution-cost configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    pub initial_balance: f64,
    pub max_leverage: f64,
    /// Fraction of balance risked per trade before adaptation
    pub base_risk_per_trade: f64,
    /// Smallest notional a position may be sized to
    pub min_position: f64,
    pub commission_entry: f64,
    pub commission_exit: f64,
    /// Exit slippage in percent of notional
    pub slippage_pct: f64,
}

impl Default for AccountConfig {
    fn default() -> Self {
        AccountConfig {
            initial_balance: 1000.0,
            max_leverage: 3.0,
            base_risk_per_trade: 0.02,
            min_position: 100.0,
            commission_entry: 0.00035,
            commission_exit: 0.00035,
            slippage_pct: 0.05,
        }
    }
}

impl AccountConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("initial_balance", self.initial_balance)?;
        positive("max_leverage", self.max_leverage)?;
        positive("base_risk_per_trade", self.base_risk_per_trade)?;
        if self.base_risk_per_trade > 1.0 {
            return Err(ConfigError::invalid(
                "base_risk_per_trade",
                "must be a fraction of balance (<= 1)",
            ));
        }
        non_negative("min_position", self.min_position)?;
        non_negative("commission_entry", self.commission_entry)?;
        non_negative("commission_exit", self.commission_exit)?;
        non_negative("slippage_pct", self.slippage_pct)?;
        Ok(())
    }
}

/// Backtest input/output locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub data_file: String,
    pub results_dir: String,
    /// Inclusive start date filter (YYYY-MM-DD)
    pub start_date: Option<String>,
    /// Inclusive end date filter (YYYY-MM-DD)
    pub end_date: Option<String>,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            data_file: "data/BTCUSDT_15m.csv".to_string(),
            results_dir: "results".to_string(),
            start_date: None,
            end_date: None,
        }
    }
}

/// Live adapter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    pub symbol: String,
    /// Bars required before the first decision
    pub warmup_candles: usize,
    /// Trailing window of bars the features are recomputed over
    pub history_window: usize,
    pub trail_trigger_long: f64,
    pub trail_trigger_short: f64,
    pub trail_sl_long: f64,
    pub trail_sl_short: f64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        LiveConfig {
            symbol: "BTCUSDT".to_string(),
            warmup_candles: 300,
            history_window: 450,
            trail_trigger_long: 0.04,
            trail_trigger_short: 0.04,
            trail_sl_long: 0.02,
            trail_sl_short: 0.02,
        }
    }
}

impl LiveConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.warmup_candles < 2 {
            return Err(ConfigError::invalid("warmup_candles", "must be at least 2"));
        }
        if self.history_window < self.warmup_candles {
            return Err(ConfigError::invalid(
                "history_window",
                "must not be smaller than warmup_candles",
            ));
        }
        positive("trail_trigger_long", self.trail_trigger_long)?;
        positive("trail_trigger_short", self.trail_trigger_short)?;
        positive("trail_sl_long", self.trail_sl_long)?;
        positive("trail_sl_short", self.trail_sl_short)?;
        Ok(())
    }
}

/// Strategy parameters shared by every component of the decision pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyParams {
    // Trend
    pub short_ema: usize,
    pub long_ema: usize,
    pub adx_period: usize,
    pub adx_strong_trend: f64,
    pub adx_weak_trend: f64,
    /// ADX at which the trend weight starts rising from 0
    pub adx_min: f64,
    /// ADX at which the trend weight saturates at 1
    pub adx_max: f64,
    pub trend_lookback: usize,
    pub trend_threshold: f64,

    // Oscillators
    pub rsi_period: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub bb_period: usize,
    pub bb_std: f64,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,

    // Volatility
    pub atr_period: usize,
    pub atr_ma_period: usize,
    pub atr_multiplier_sl: f64,
    pub atr_multiplier_tp: f64,

    // Volume
    pub volume_ma_period: usize,
    pub volume_threshold: f64,

    // Regime classifier
    pub regime_volatility_lookback: usize,
    pub regime_direction_short: usize,
    pub regime_direction_medium: usize,
    pub regime_direction_long: usize,

    // Mean reversion
    pub mean_reversion_lookback: usize,
    pub mean_reversion_threshold: f64,

    // Multi-timeframe
    pub hourly_ema_fast: usize,
    pub hourly_ema_slow: usize,
    pub four_hour_ema_fast: usize,
    pub four_hour_ema_slow: usize,
    pub daily_ema_fast: usize,
    pub daily_ema_slow: usize,

    // Market health weights
    pub health_trend_weight: f64,
    pub health_volatility_weight: f64,
    pub health_volume_weight: f64,
    pub health_breadth_weight: f64,
    pub health_sr_weight: f64,

    // Momentum
    pub momentum_roc_periods: Vec<usize>,
    pub momentum_reversal_threshold: f64,

    // Pyramiding
    pub max_pyramid_entries: u32,
    pub pyramid_size_multiplier: f64,
    pub pyramid_min_profit: f64,
    pub pyramid_adx_threshold: f64,
    pub pyramid_bias_threshold: f64,

    // Position management
    pub trailing_activation: f64,
    pub partial_exit_trigger: f64,
    pub partial_exit_fraction: f64,
    pub min_reward_risk: f64,

    // Entry gating and bias
    pub entry_threshold: f64,
    /// Minimum bars between a full close and the next entry
    pub min_trades_interval: usize,
    pub global_long_boost: f64,
    pub global_short_penalty: f64,
    pub short_hotfix_multiplier: f64,
    /// Lookback of the long-horizon high breakout
    pub breakout_lookback: usize,
}

impl Default for StrategyParams {
    fn default() -> Self {
        StrategyParams {
            short_ema: 8,
            long_ema: 25,
            adx_period: 14,
            adx_strong_trend: 20.0,
            adx_weak_trend: 15.0,
            adx_min: 15.0,
            adx_max: 35.0,
            trend_lookback: 20,
            trend_threshold: 0.1,

            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            bb_period: 20,
            bb_std: 2.0,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,

            atr_period: 14,
            atr_ma_period: 20,
            atr_multiplier_sl: 2.5,
            atr_multiplier_tp: 7.0,

            volume_ma_period: 20,
            volume_threshold: 1.4,

            regime_volatility_lookback: 100,
            regime_direction_short: 20,
            regime_direction_medium: 50,
            regime_direction_long: 100,

            mean_reversion_lookback: 20,
            mean_reversion_threshold: 2.0,

            hourly_ema_fast: 9,
            hourly_ema_slow: 30,
            four_hour_ema_fast: 9,
            four_hour_ema_slow: 30,
            daily_ema_fast: 50,
            daily_ema_slow: 200,

            health_trend_weight: 0.3,
            health_volatility_weight: 0.2,
            health_volume_weight: 0.2,
            health_breadth_weight: 0.2,
            health_sr_weight: 0.1,

            momentum_roc_periods: vec![5, 10, 20, 50],
            momentum_reversal_threshold: 5.0,

            max_pyramid_entries: 3,
            pyramid_size_multiplier: 0.7,
            pyramid_min_profit: 0.03,
            pyramid_adx_threshold: 30.0,
            pyramid_bias_threshold: 0.65,

            trailing_activation: 0.03,
            partial_exit_trigger: 0.12,
            partial_exit_fraction: 0.4,
            min_reward_risk: 2.0,

            entry_threshold: 0.65,
            min_trades_interval: 12,
            global_long_boost: 1.10,
            global_short_penalty: 0.90,
            short_hotfix_multiplier: 1.0,
            breakout_lookback: 1440,
        }
    }
}

impl StrategyParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let periods = [
            ("short_ema", self.short_ema),
            ("long_ema", self.long_ema),
            ("adx_period", self.adx_period),
            ("trend_lookback", self.trend_lookback),
            ("rsi_period", self.rsi_period),
            ("bb_period", self.bb_period),
            ("macd_fast", self.macd_fast),
            ("macd_slow", self.macd_slow),
            ("macd_signal", self.macd_signal),
            ("atr_period", self.atr_period),
            ("atr_ma_period", self.atr_ma_period),
            ("volume_ma_period", self.volume_ma_period),
            ("regime_volatility_lookback", self.regime_volatility_lookback),
            ("regime_direction_short", self.regime_direction_short),
            ("regime_direction_medium", self.regime_direction_medium),
            ("regime_direction_long", self.regime_direction_long),
            ("mean_reversion_lookback", self.mean_reversion_lookback),
            ("hourly_ema_fast", self.hourly_ema_fast),
            ("hourly_ema_slow", self.hourly_ema_slow),
            ("four_hour_ema_fast", self.four_hour_ema_fast),
            ("four_hour_ema_slow", self.four_hour_ema_slow),
            ("daily_ema_fast", self.daily_ema_fast),
            ("daily_ema_slow", self.daily_ema_slow),
            ("breakout_lookback", self.breakout_lookback),
        ];
        for (name, value) in periods {
            if value == 0 {
                return Err(ConfigError::invalid(name, "period must be positive"));
            }
        }
        // Sample standard deviation needs two points
        for (name, value) in [
            ("bb_period", self.bb_period),
            ("mean_reversion_lookback", self.mean_reversion_lookback),
            ("regime_direction_short", self.regime_direction_short),
        ] {
            if value < 2 {
                return Err(ConfigError::invalid(name, "must be at least 2"));
            }
        }

        if self.short_ema >= self.long_ema {
            return Err(ConfigError::invalid("short_ema", "must be below long_ema"));
        }
        if self.macd_fast >= self.macd_slow {
            return Err(ConfigError::invalid("macd_fast", "must be below macd_slow"));
        }
        if self.adx_min >= self.adx_max {
            return Err(ConfigError::invalid("adx_min", "must be below adx_max"));
        }
        if self.rsi_oversold >= self.rsi_overbought {
            return Err(ConfigError::invalid(
                "rsi_oversold",
                "must be below rsi_overbought",
            ));
        }
        if !(self.regime_direction_short <= self.regime_direction_medium
            && self.regime_direction_medium <= self.regime_direction_long
            && self.regime_direction_long <= self.regime_volatility_lookback)
        {
            return Err(ConfigError::invalid(
                "regime_direction_long",
                "direction periods must be ordered short <= medium <= long <= lookback",
            ));
        }
        if self.momentum_roc_periods.is_empty() || self.momentum_roc_periods.contains(&0) {
            return Err(ConfigError::invalid(
                "momentum_roc_periods",
                "needs at least one positive period",
            ));
        }

        for (name, value) in [
            ("bb_std", self.bb_std),
            ("atr_multiplier_sl", self.atr_multiplier_sl),
            ("atr_multiplier_tp", self.atr_multiplier_tp),
            ("volume_threshold", self.volume_threshold),
            ("mean_reversion_threshold", self.mean_reversion_threshold),
            ("pyramid_size_multiplier", self.pyramid_size_multiplier),
            ("trailing_activation", self.trailing_activation),
            ("partial_exit_trigger", self.partial_exit_trigger),
            ("min_reward_risk", self.min_reward_risk),
            ("global_long_boost", self.global_long_boost),
            ("global_short_penalty", self.global_short_penalty),
            ("short_hotfix_multiplier", self.short_hotfix_multiplier),
        ] {
            positive(name, value)?;
        }
        non_negative("pyramid_min_profit", self.pyramid_min_profit)?;

        let weights = [
            self.health_trend_weight,
            self.health_volatility_weight,
            self.health_volume_weight,
            self.health_breadth_weight,
            self.health_sr_weight,
        ];
        if weights.iter().any(|w| *w < 0.0 || !w.is_finite()) {
            return Err(ConfigError::invalid(
                "health_trend_weight",
                "health weights must be non-negative",
            ));
        }
        if !(self.partial_exit_fraction > 0.0 && self.partial_exit_fraction < 1.0) {
            return Err(ConfigError::invalid(
                "partial_exit_fraction",
                "must lie strictly between 0 and 1",
            ));
        }
        if !(self.entry_threshold > 0.0 && self.entry_threshold <= 2.0) {
            return Err(ConfigError::invalid(
                "entry_threshold",
                "must lie in (0, 2]",
            ));
        }
        Ok(())
    }

    /// Longest lookback any feature needs before it is defined
    pub fn warmup_bars(&self) -> usize {
        let roc = self.momentum_roc_periods.iter().copied().max().unwrap_or(0);
        [
            self.atr_period + self.regime_volatility_lookback,
            2 * self.adx_period,
            self.bb_period,
            self.volume_ma_period,
            self.trend_lookback,
            2 * self.mean_reversion_lookback,
            roc + 3,
            30,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }

    /// Set a numeric parameter by name (used by grid search and CLI overrides)
    pub fn set(&mut self, name: &str, value: f64) -> Result<(), ConfigError> {
        let as_period = |v: f64| v.round().max(0.0) as usize;
        match name {
            "short_ema" => self.short_ema = as_period(value),
            "long_ema" => self.long_ema = as_period(value),
            "adx_period" => self.adx_period = as_period(value),
            "adx_strong_trend" => self.adx_strong_trend = value,
            "adx_weak_trend" => self.adx_weak_trend = value,
            "adx_min" => self.adx_min = value,
            "adx_max" => self.adx_max = value,
            "trend_lookback" => self.trend_lookback = as_period(value),
            "trend_threshold" => self.trend_threshold = value,
            "rsi_period" => self.rsi_period = as_period(value),
            "rsi_oversold" => self.rsi_oversold = value,
            "rsi_overbought" => self.rsi_overbought = value,
            "bb_period" => self.bb_period = as_period(value),
            "bb_std" => self.bb_std = value,
            "macd_fast" => self.macd_fast = as_period(value),
            "macd_slow" => self.macd_slow = as_period(value),
            "macd_signal" => self.macd_signal = as_period(value),
            "atr_period" => self.atr_period = as_period(value),
            "atr_ma_period" => self.atr_ma_period = as_period(value),
            "atr_multiplier_sl" => self.atr_multiplier_sl = value,
            "atr_multiplier_tp" => self.atr_multiplier_tp = value,
            "volume_ma_period" => self.volume_ma_period = as_period(value),
            "volume_threshold" => self.volume_threshold = value,
            "mean_reversion_lookback" => self.mean_reversion_lookback = as_period(value),
            "mean_reversion_threshold" => self.mean_reversion_threshold = value,
            "momentum_reversal_threshold" => self.momentum_reversal_threshold = value,
            "max_pyramid_entries" => self.max_pyramid_entries = value.round().max(0.0) as u32,
            "pyramid_size_multiplier" => self.pyramid_size_multiplier = value,
            "pyramid_min_profit" => self.pyramid_min_profit = value,
            "pyramid_adx_threshold" => self.pyramid_adx_threshold = value,
            "pyramid_bias_threshold" => self.pyramid_bias_threshold = value,
            "trailing_activation" => self.trailing_activation = value,
            "partial_exit_trigger" => self.partial_exit_trigger = value,
            "partial_exit_fraction" => self.partial_exit_fraction = value,
            "entry_threshold" => self.entry_threshold = value,
            "min_trades_interval" => self.min_trades_interval = as_period(value),
            "global_long_boost" => self.global_long_boost = value,
            "global_short_penalty" => self.global_short_penalty = value,
            "short_hotfix_multiplier" => self.short_hotfix_multiplier = value,
            other => return Err(ConfigError::UnknownGridParameter(other.to_string())),
        }
        Ok(())
    }
}

fn positive(name: &str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::invalid(name, format!("must be positive, got {}", value)))
    }
}

fn non_negative(name: &str, value: f64) -> Result<(), ConfigError> {
    if value >= 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            name,
            format!("must be non-negative, got {}", value),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_values_parse_strictly() {
        assert_eq!(parse_env_value::<usize>("WARMUP_CANDLES", " 300 ").unwrap(), 300);
        assert!(parse_env_value::<usize>("WARMUP_CANDLES", "-5").is_err());
        assert!(parse_env_value::<usize>("WARMUP_CANDLES", "250.7").is_err());
        let err = parse_env_value::<usize>("WARMUP_CANDLES", "abc").unwrap_err();
        assert!(err.to_string().contains("WARMUP_CANDLES"));

        assert_eq!(parse_env_value::<f64>("TRAIL_SL_LONG", "0.025").unwrap(), 0.025);
        assert!(parse_env_value::<f64>("TRAIL_SL_LONG", "two").is_err());
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.strategy.short_ema, 8);
        assert_eq!(config.strategy.long_ema, 25);
        assert_eq!(config.account.max_leverage, 3.0);
        assert_eq!(config.live.warmup_candles, 300);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "strategy": { "short_ema": 5, "long_ema": 21 }, "account": { "initial_balance": 5000.0 } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.strategy.short_ema, 5);
        assert_eq!(config.strategy.rsi_period, 14);
        assert_eq!(config.account.initial_balance, 5000.0);
        assert_eq!(config.account.base_risk_per_trade, 0.02);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let mut params = StrategyParams::default();
        params.adx_min = 40.0;
        assert!(matches!(
            params.validate(),
            Err(ConfigError::InvalidParameter { ref name, .. }) if name == "adx_min"
        ));

        let mut params = StrategyParams::default();
        params.short_ema = 30;
        assert!(params.validate().is_err());

        let mut params = StrategyParams::default();
        params.rsi_period = 0;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_set_by_name() {
        let mut params = StrategyParams::default();
        params.set("atr_multiplier_sl", 3.0).unwrap();
        params.set("short_ema", 5.0).unwrap();
        assert_eq!(params.atr_multiplier_sl, 3.0);
        assert_eq!(params.short_ema, 5);
        assert_eq!(
            params.set("no_such_knob", 1.0),
            Err(ConfigError::UnknownGridParameter("no_such_knob".to_string()))
        );
    }

    #[test]
    fn test_unknown_grid_key_fails_validation() {
        let mut config = Config::default();
        let mut grid = BTreeMap::new();
        grid.insert("bogus".to_string(), vec![1.0]);
        config.grid = Some(grid);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_warmup_covers_longest_lookback() {
        let params = StrategyParams::default();
        assert!(params.warmup_bars() >= 114);
    }
}
