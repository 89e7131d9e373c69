//! Adaptive Multi-Regime Strategy
//!
//! An OHLCV trading strategy that classifies market regimes, blends trend,
//! mean-reversion and multi-timeframe signals through an adaptive bias filter,
//! and manages positions with ATR-based exits, trailing stops, partial exits
//! and pyramiding. Ships a deterministic backtester, a grid-search optimizer
//! and a live decision adapter.

pub mod backtest;
pub mod config;
pub mod data;
pub mod error;
pub mod exits;
pub mod features;
pub mod filter;
pub mod indicators;
pub mod live;
pub mod optimizer;
pub mod position;
pub mod regime;
pub mod report;
pub mod risk;
pub mod signals;
pub mod store;
pub mod types;

pub use backtest::{run_backtest, BacktestResult, Backtester};
pub use config::{Config, StrategyParams};
pub use error::{ConfigError, DataValidationError};
pub use features::{compute_features, FeatureSet};
pub use regime::MarketRegime;
pub use types::*;
