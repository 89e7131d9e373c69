//! Backtest command implementation

use anyhow::{Context, Result};
use adaptive_strategy::{backtest::Backtester, data, report, Config};
use std::path::PathBuf;
use tracing::info;

pub fn run(
    config_path: String,
    data_override: Option<String>,
    output_override: Option<String>,
    balance_override: Option<f64>,
    start_override: Option<String>,
    end_override: Option<String>,
) -> Result<()> {
    info!("Starting backtest");

    let mut config = Config::from_file(&config_path)?;
    info!("Loaded configuration from: {}", config_path);

    if let Some(balance) = balance_override {
        info!("Overriding initial balance to: ${:.2}", balance);
        config.account.initial_balance = balance;
        config.account.validate()?;
    }
    if let Some(start) = start_override {
        info!("Overriding start date to: {}", start);
        config.backtest.start_date = Some(start);
    }
    if let Some(end) = end_override {
        info!("Overriding end date to: {}", end);
        config.backtest.end_date = Some(end);
    }
    if let Some(output) = output_override {
        config.backtest.results_dir = output;
    }

    let candles = super::load_bars(&config, data_override)?;
    info!(
        "Running backtest on {} bars ({} to {})",
        candles.len(),
        candles[0].datetime,
        candles[candles.len() - 1].datetime
    );

    let backtester = Backtester::new(config.clone());
    let result = backtester.run(&candles);

    print!("{}", report::render(&result));

    let out_dir = PathBuf::from(&config.backtest.results_dir);
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;
    data::write_equity_csv(out_dir.join("equity_curve.csv"), &result.rows)?;
    data::write_trades_csv(out_dir.join("trades.csv"), &result.trades)?;
    info!("Results written to {}", out_dir.display());

    info!("Backtest completed successfully");
    Ok(())
}
