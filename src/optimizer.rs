//! Parameter optimization
//!
//! Grid search over `StrategyParams`: the configured grid expands to the
//! Cartesian product of its values and every combination is backtested on
//! the same bars, in parallel by default.

use indicatif::ProgressBar;
use itertools::Itertools;
use rayon::prelude::*;
use std::collections::BTreeMap;

use crate::backtest::Backtester;
use crate::config::Config;
use crate::error::ConfigError;
use crate::types::Candle;

/// Optimization result for a single parameter combination
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    pub params: BTreeMap<String, f64>,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub total_return: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub total_trades: usize,
    pub calmar_ratio: f64,
    pub profit_factor: f64,
    pub expectancy: f64,
}

/// Expand `grid` into one config per parameter combination.
///
/// Combinations that fail validation (e.g. a short EMA not below the long EMA)
/// are dropped; an unknown parameter name is an error.
pub fn expand_grid(
    base: &Config,
    grid: &BTreeMap<String, Vec<f64>>,
) -> Result<Vec<(BTreeMap<String, f64>, Config)>, ConfigError> {
    let axes: Vec<(&String, &Vec<f64>)> = grid.iter().filter(|(_, values)| !values.is_empty()).collect();
    if axes.is_empty() {
        return Ok(vec![(BTreeMap::new(), base.clone())]);
    }

    let mut configs = Vec::new();
    for combo in axes.iter().map(|(_, values)| values.iter().copied()).multi_cartesian_product() {
        let mut config = base.clone();
        let mut params = BTreeMap::new();
        for ((name, _), value) in axes.iter().zip(combo) {
            config.strategy.set(name, value)?;
            params.insert((*name).clone(), value);
        }
        match config.strategy.validate() {
            Ok(()) => configs.push((params, config)),
            Err(e) => tracing::debug!(?params, error = %e, "Skipping invalid combination"),
        }
    }
    Ok(configs)
}

pub struct Optimizer {
    base_config: Config,
}

impl Optimizer {
    pub fn new(base_config: Config) -> Self {
        Optimizer { base_config }
    }

    /// All valid combinations of the base config's grid
    pub fn combinations(&self) -> Result<Vec<(BTreeMap<String, f64>, Config)>, ConfigError> {
        match &self.base_config.grid {
            Some(grid) => expand_grid(&self.base_config, grid),
            None => Ok(vec![(BTreeMap::new(), self.base_config.clone())]),
        }
    }

    /// Backtest every combination in parallel, ticking `progress` after each run
    pub fn optimize_with_progress(
        &self,
        candles: &[Candle],
        combinations: Vec<(BTreeMap<String, f64>, Config)>,
        progress: &ProgressBar,
    ) -> Vec<OptimizationResult> {
        tracing::info!("Testing {} parameter combinations", combinations.len());
        combinations
            .into_par_iter()
            .map(|(params, config)| {
                let result = evaluate(candles, params, config);
                progress.inc(1);
                result
            })
            .collect()
    }

    /// Backtest every combination on the current thread
    pub fn optimize_sequential(
        &self,
        candles: &[Candle],
        combinations: Vec<(BTreeMap<String, f64>, Config)>,
    ) -> Vec<OptimizationResult> {
        tracing::info!(
            "Testing {} parameter combinations sequentially",
            combinations.len()
        );
        combinations
            .into_iter()
            .map(|(params, config)| evaluate(candles, params, config))
            .collect()
    }

    /// Sort optimization results by specified metric, best first
    pub fn sort_results(results: &mut [OptimizationResult], sort_by: &str) {
        results.sort_by(|a, b| {
            let (va, vb) = match sort_by {
                "calmar" => (a.calmar_ratio, b.calmar_ratio),
                "return" => (a.total_return, b.total_return),
                "win_rate" => (a.win_rate, b.win_rate),
                "profit_factor" => (a.profit_factor, b.profit_factor),
                "sortino" => (a.sortino_ratio, b.sortino_ratio),
                "expectancy" => (a.expectancy, b.expectancy),
                _ => (a.sharpe_ratio, b.sharpe_ratio),
            };
            vb.partial_cmp(&va).unwrap_or(std::cmp::Ordering::Equal)
        });
    }
}

fn evaluate(candles: &[Candle], params: BTreeMap<String, f64>, config: Config) -> OptimizationResult {
    let result = Backtester::new(config).run(candles);
    let m = result.metrics;
    OptimizationResult {
        params,
        sharpe_ratio: m.sharpe_ratio,
        sortino_ratio: m.sortino_ratio,
        total_return: m.total_return,
        max_drawdown: m.max_drawdown,
        win_rate: m.win_rate,
        total_trades: m.total_trades,
        calmar_ratio: m.calmar_ratio,
        profit_factor: m.profit_factor,
        expectancy: m.expectancy,
    }
}
