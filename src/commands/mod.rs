pub mod backtest;
pub mod live;
pub mod optimize;

use adaptive_strategy::{data, Candle, Config};
use anyhow::Result;
use tracing::info;

/// Load the bar file named by `data_override` or the config, filtered to the configured dates
pub(crate) fn load_bars(config: &Config, data_override: Option<String>) -> Result<Vec<Candle>> {
    let path = data_override.unwrap_or_else(|| config.backtest.data_file.clone());
    info!("Loading data from: {}", path);
    let candles = data::load_csv(&path)?;
    let candles = data::filter_by_date(
        candles,
        config.backtest.start_date.as_deref(),
        config.backtest.end_date.as_deref(),
    )?;
    if candles.is_empty() {
        anyhow::bail!("No bars left in {} after date filtering", path);
    }
    Ok(candles)
}
