//! Data loading and result export
//!
//! Loads OHLCV bars from CSV files with header detection and validation, and
//! writes the equity curve and trade history back out as CSV.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use itertools::Itertools;
use serde::Serialize;
use std::fs;
use std::io::Read;
use std::path::Path;
use tracing::info;

use crate::error::DataValidationError;
use crate::types::{Candle, ResultRow, TradeRecord};

/// Accepted timestamp column names, matched case-insensitively
const TIMESTAMP_COLUMNS: &[&str] = &["date", "datetime", "timestamp", "open_time", "open time", "time"];
const OHLCV_COLUMNS: [&str; 5] = ["open", "high", "low", "close", "volume"];

/// Load OHLCV data from a CSV file
pub fn load_csv(path: impl AsRef<Path>) -> Result<Vec<Candle>> {
    let path = path.as_ref();
    let file = fs::File::open(path)
        .with_context(|| format!("Failed to open CSV file {}", path.display()))?;
    let candles = read_candles(file).with_context(|| format!("Invalid bar data in {}", path.display()))?;
    info!(bars = candles.len(), file = %path.display(), "Loaded candles");
    Ok(candles)
}

/// Parse bars from any CSV source.
///
/// The header must name a timestamp column and the five OHLCV columns; other
/// columns are ignored. Rows must be strictly increasing in time.
pub fn read_candles<R: Read>(source: R) -> Result<Vec<Candle>> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(source);
    let headers: Vec<String> = reader
        .headers()
        .context("Failed to read CSV header")?
        .iter()
        .map(|h| h.trim().to_lowercase())
        .collect();

    let find = |name: &str| headers.iter().position(|h| h == name);
    let time_idx = TIMESTAMP_COLUMNS
        .iter()
        .find_map(|name| find(name))
        .ok_or(DataValidationError::NoTimestampColumn)?;

    let missing: Vec<String> = OHLCV_COLUMNS
        .iter()
        .filter(|name| find(name).is_none())
        .map(|name| name.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(DataValidationError::MissingColumns(missing).into());
    }
    let idx: Vec<usize> = OHLCV_COLUMNS.iter().filter_map(|name| find(name)).collect();

    let mut candles: Vec<Candle> = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let row = i + 1;
        let record = record.with_context(|| format!("Failed to read row {}", row))?;

        let raw_time = record.get(time_idx).unwrap_or_default();
        let datetime = parse_timestamp(raw_time).ok_or_else(|| DataValidationError::InvalidTimestamp {
            row,
            value: raw_time.to_string(),
        })?;

        let mut values = [0.0; 5];
        for (slot, (&col, name)) in values.iter_mut().zip(idx.iter().zip(OHLCV_COLUMNS)) {
            let raw = record.get(col).unwrap_or_default();
            *slot = raw.parse::<f64>().map_err(|_| DataValidationError::InvalidNumber {
                row,
                column: name.to_string(),
                value: raw.to_string(),
            })?;
        }
        let [open, high, low, close, volume] = values;
        let candle = Candle::new(datetime, open, high, low, close, volume);
        candle
            .validate()
            .map_err(|reason| DataValidationError::InvalidCandle { row, reason })?;

        if candles.last().is_some_and(|prev| prev.datetime >= datetime) {
            return Err(DataValidationError::NonMonotonicTimestamps { row }.into());
        }
        candles.push(candle);
    }
    Ok(candles)
}

/// RFC 3339, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DD`, or a Unix epoch in seconds or milliseconds
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(Utc.from_utc_datetime(&ndt));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|ndt| Utc.from_utc_datetime(&ndt));
    }
    let epoch = raw.parse::<i64>().ok()?;
    if epoch.abs() >= 100_000_000_000 {
        DateTime::from_timestamp_millis(epoch)
    } else {
        DateTime::from_timestamp(epoch, 0)
    }
}

/// Keep bars within the inclusive `YYYY-MM-DD` date range
pub fn filter_by_date(
    candles: Vec<Candle>,
    start: Option<&str>,
    end: Option<&str>,
) -> Result<Vec<Candle>> {
    let parse = |s: &str| {
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .with_context(|| format!("Invalid date '{}', expected YYYY-MM-DD", s))
    };
    let start = start.map(parse).transpose()?;
    let end = end.map(parse).transpose()?;

    let start_dt = start.and_then(|d| d.and_hms_opt(0, 0, 0)).map(|n| Utc.from_utc_datetime(&n));
    let end_dt = end
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| Utc.from_utc_datetime(&n) + Duration::days(1));

    Ok(candles
        .into_iter()
        .filter(|c| start_dt.map_or(true, |s| c.datetime >= s))
        .filter(|c| end_dt.map_or(true, |e| c.datetime < e))
        .collect())
}

/// Write the per-bar equity curve
pub fn write_equity_csv(path: impl AsRef<Path>, rows: &[ResultRow]) -> Result<()> {
    let path = path.as_ref();
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for row in rows {
        writer.serialize(row).context("Failed to write equity row")?;
    }
    writer.flush()?;
    Ok(())
}

/// Flat CSV view of a trade
#[derive(Debug, Serialize)]
struct TradeRow<'a> {
    id: usize,
    side: String,
    entry_time: String,
    entry_price: f64,
    exit_time: String,
    exit_price: Option<f64>,
    size: f64,
    leverage: f64,
    entry_weight: f64,
    entry_signals: String,
    initial_stop: f64,
    initial_target: f64,
    regime: &'a str,
    market_health: f64,
    pyramid_adds: u32,
    partial_pnl: f64,
    pnl: Option<f64>,
    net_pnl: f64,
    return_pct: Option<f64>,
    duration_hours: Option<f64>,
    costs: f64,
    balance_after: Option<f64>,
    exit_reason: String,
}

impl<'a> From<&'a TradeRecord> for TradeRow<'a> {
    fn from(t: &'a TradeRecord) -> Self {
        TradeRow {
            id: t.id,
            side: t.side.to_string(),
            entry_time: t.entry_time.to_rfc3339(),
            entry_price: t.entry_price,
            exit_time: t.exit_time.map(|d| d.to_rfc3339()).unwrap_or_default(),
            exit_price: t.exit_price,
            size: t.size,
            leverage: t.leverage,
            entry_weight: t.entry_weight,
            entry_signals: t.entry_signals.iter().join("; "),
            initial_stop: t.initial_stop,
            initial_target: t.initial_target,
            regime: t.regime.as_str(),
            market_health: t.market_health,
            pyramid_adds: t.pyramid_adds,
            partial_pnl: t.partial_pnl,
            pnl: t.pnl,
            net_pnl: t.net_pnl(),
            return_pct: t.return_pct(),
            duration_hours: t.duration_hours(),
            costs: t.costs,
            balance_after: t.balance_after,
            exit_reason: t.exit_reason.map(|r| r.to_string()).unwrap_or_default(),
        }
    }
}

/// Write the trade history
pub fn write_trades_csv(path: impl AsRef<Path>, trades: &[TradeRecord]) -> Result<()> {
    let path = path.as_ref();
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for trade in trades {
        writer
            .serialize(TradeRow::from(trade))
            .context("Failed to write trade row")?;
    }
    writer.flush()?;
    Ok(())
}
