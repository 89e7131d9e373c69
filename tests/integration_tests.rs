//! Integration tests for the adaptive strategy
//!
//! These tests drive the public API end to end: features, backtest, report,
//! CSV round trips, the live trader and the SQLite store.

use anyhow::Result;
use approx::assert_relative_eq;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::BTreeMap;

use adaptive_strategy::exits::ExitLevels;
use adaptive_strategy::live::{LiveTrader, MemoryTradeStore, Notifier, PaperBroker, TradeStore};
use adaptive_strategy::position::{CostModel, EntryRequest, PositionBook};
use adaptive_strategy::risk::position_size;
use adaptive_strategy::store::{SqliteTradeStore, StoredTrade};
use adaptive_strategy::{
    compute_features, data, report, run_backtest, Action, Candle, Config, ExitReason, MarketRegime,
    Side,
};

// =============================================================================
// Test Utilities
// =============================================================================

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// 15-minute uptrend: close rises 0.1% per bar, volume spikes 3x every 8th bar
fn generate_trending_candles(count: usize) -> Vec<Candle> {
    let mut candles = Vec::with_capacity(count);
    let mut close = 100.0;
    for i in 0..count {
        let open = close;
        close = open * 1.001;
        let volume = if i % 8 == 7 { 3000.0 } else { 1000.0 };
        candles.push(Candle::new(
            start_time() + Duration::minutes(15 * i as i64),
            open,
            close * 1.0005,
            open * 0.9995,
            close,
            volume,
        ));
    }
    candles
}

/// 15-minute sideways oscillation with uneven volume
fn generate_choppy_candles(count: usize) -> Vec<Candle> {
    let mut candles = Vec::with_capacity(count);
    let mut prev_close = 100.0;
    for i in 0..count {
        let x = i as f64;
        let close = 100.0 + 5.0 * (x / 10.0).sin() + 0.3 * (x * 1.7).sin();
        let open = prev_close;
        candles.push(Candle::new(
            start_time() + Duration::minutes(15 * i as i64),
            open,
            open.max(close) * 1.001,
            open.min(close) * 0.999,
            close,
            1000.0 + 400.0 * (x / 3.0).sin().abs(),
        ));
        prev_close = close;
    }
    candles
}

fn temp_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("adaptive_strategy_{}_{}", std::process::id(), name))
}

// =============================================================================
// Backtest scenarios
// =============================================================================

#[test]
fn test_uptrend_produces_long_entries() {
    let candles = generate_trending_candles(400);
    let result = run_backtest(&candles, &Config::default());

    assert!(!result.rows.is_empty());
    let longs: Vec<_> = result
        .trades
        .iter()
        .filter(|t| t.side == Side::Long && t.pyramid_adds == 0)
        .collect();
    assert!(!longs.is_empty(), "expected at least one long entry in an uptrend");
    for trade in longs {
        assert!(trade.entry_weight >= 0.65, "entry weight {}", trade.entry_weight);
        assert!(trade.initial_stop < trade.entry_price);
        assert!(trade.entry_price < trade.initial_target);
    }
}

#[test]
fn test_end_of_data_forces_close() {
    let candles = generate_trending_candles(400);
    let full = run_backtest(&candles, &Config::default());
    let first = full.trades.first().expect("uptrend should trade");
    let entry_idx = candles
        .iter()
        .position(|c| c.datetime == first.entry_time)
        .unwrap();

    // Two bars after the entry neither stop nor target is reachable
    let truncated = &candles[..entry_idx + 3];
    let result = run_backtest(truncated, &Config::default());
    let last = result.trades.last().unwrap();

    assert_eq!(last.entry_time, first.entry_time);
    assert_eq!(last.exit_reason, Some(ExitReason::EndOfSimulation));
    assert_eq!(last.exit_price, Some(truncated[truncated.len() - 1].close));
    assert!(result.trades.iter().all(|t| !t.is_open()));

    let final_row = result.rows.last().unwrap();
    assert_eq!(final_row.position, None);
    assert_relative_eq!(final_row.equity, final_row.balance);
}

#[test]
fn test_backtest_is_deterministic() {
    let candles = generate_choppy_candles(900);
    let config = Config::default();
    let a = run_backtest(&candles, &config);
    let b = run_backtest(&candles, &config);

    assert_eq!(a.trades, b.trades);
    assert_eq!(a.rows, b.rows);
    assert_eq!(
        serde_json::to_string(&a.trades).unwrap(),
        serde_json::to_string(&b.trades).unwrap()
    );
    assert_eq!(
        serde_json::to_string(&a.rows).unwrap(),
        serde_json::to_string(&b.rows).unwrap()
    );
}

#[test]
fn test_equity_reconciles_with_balance_and_trades() {
    let config = Config::default();
    for candles in [generate_trending_candles(400), generate_choppy_candles(900)] {
        let result = run_backtest(&candles, &config);

        for row in &result.rows {
            match (row.position, row.entry_price) {
                (Some(side), Some(entry)) => {
                    let unrealized = row.size * side.pnl_pct(entry, row.price);
                    assert_relative_eq!(row.equity, row.balance + unrealized, epsilon = 1e-9);
                }
                _ => assert_relative_eq!(row.equity, row.balance, epsilon = 1e-9),
            }
        }

        let realized: f64 = result.trades.iter().map(|t| t.net_pnl()).sum();
        assert_relative_eq!(
            result.metrics.final_balance,
            config.account.initial_balance + realized,
            epsilon = 1e-6
        );
    }
}

#[test]
fn test_trailing_stop_is_monotonic_per_trade() {
    let result = run_backtest(&generate_trending_candles(400), &Config::default());
    let mut stops: BTreeMap<usize, (Side, Vec<f64>)> = BTreeMap::new();
    for row in &result.rows {
        if let (Some(id), Some(side), Some(stop)) = (row.trade_id, row.position, row.stop_loss) {
            stops.entry(id).or_insert((side, Vec::new())).1.push(stop);
        }
    }
    for (id, (side, series)) in stops {
        for pair in series.windows(2) {
            match side {
                Side::Long => assert!(pair[1] >= pair[0], "trade {} stop loosened", id),
                Side::Short => assert!(pair[1] <= pair[0], "trade {} stop loosened", id),
            }
        }
    }
}

#[test]
fn test_trade_level_invariants() {
    let config = Config::default();
    let candles = generate_choppy_candles(900);
    let result = run_backtest(&candles, &config);

    for trade in &result.trades {
        assert!(trade.pyramid_adds <= config.strategy.max_pyramid_entries);
        if trade.pyramid_adds > 0 {
            continue;
        }
        let levels = ExitLevels {
            stop_loss: trade.initial_stop,
            take_profit: trade.initial_target,
        };
        assert!(levels.reward_risk(trade.side, trade.entry_price) >= 2.0 - 1e-9);

        if trade.partial_pnl == 0.0 {
            let row = result
                .rows
                .iter()
                .find(|r| r.datetime == trade.entry_time)
                .unwrap();
            let balance_before = row.balance + trade.size * config.account.commission_entry;
            assert!(trade.size <= balance_before * trade.leverage + 1e-9);
            assert!(trade.leverage <= config.account.max_leverage + 1e-12);
        }
    }
}

#[test]
fn test_sizing_never_exceeds_leverage_cap() {
    for balance in [50.0, 1000.0, 25_000.0] {
        for stop in [99.99, 99.0, 90.0, 50.0] {
            for leverage in [1.0, 2.0, 3.0] {
                let (size, _) = position_size(balance, 0.02, 100.0, stop, leverage, 100.0);
                assert!(size <= balance * leverage + 1e-9);
                assert!(size > 0.0);
            }
        }
    }
}

#[test]
fn test_stop_loss_wins_same_bar_conflict() {
    let mut book = PositionBook::new(
        1000.0,
        CostModel {
            commission_entry: 0.0,
            commission_exit: 0.0,
            slippage_pct: 0.0,
        },
    );
    book.open(EntryRequest {
        side: Side::Long,
        time: start_time(),
        price: 100.0,
        size: 400.0,
        leverage: 2.0,
        levels: ExitLevels {
            stop_loss: 97.0,
            take_profit: 106.0,
        },
        weight: 1.0,
        signals: vec![],
        regime: MarketRegime::Mixed,
        market_health: 50.0,
    });
    book.check_exit(1, start_time() + Duration::minutes(15), 107.0, 96.0);

    let trade = &book.trades()[0];
    assert_eq!(trade.exit_reason, Some(ExitReason::StopLoss));
    assert_eq!(trade.exit_price, Some(97.0));
}

#[test]
fn test_degenerate_volume_does_not_break_pipeline() {
    let candles: Vec<Candle> = generate_trending_candles(300)
        .into_iter()
        .map(|c| Candle { volume: 0.0, ..c })
        .collect();
    let features = compute_features(&candles, &Config::default().strategy);
    assert!(!features.is_empty());
    assert!(features.iter().all(|f| f.volume_ratio.is_finite()));

    let result = run_backtest(&candles, &Config::default());
    assert!(!result.rows.is_empty());
    assert!(result.rows.iter().all(|r| r.equity.is_finite()));
}

#[test]
fn test_indicator_bounds_on_choppy_market() {
    let features = compute_features(&generate_choppy_candles(900), &Config::default().strategy);
    assert!(!features.is_empty());
    for f in &features {
        assert!((0.0..=100.0).contains(&f.rsi), "rsi {}", f.rsi);
        assert!((0.0..=100.0).contains(&f.adx), "adx {}", f.adx);
        assert!((0.0..=100.0).contains(&f.market_health), "health {}", f.market_health);
        assert!(f.final_long_bias.is_finite() && f.final_short_bias.is_finite());
    }
}

#[test]
fn test_rows_and_trades_record_market_health() {
    let config = Config::default();
    let candles = generate_trending_candles(400);
    let features = compute_features(&candles, &config.strategy);
    let by_time: BTreeMap<_, _> = features.iter().map(|f| (f.datetime, f)).collect();
    let result = run_backtest(&candles, &config);

    assert!(!result.rows.is_empty());
    for row in &result.rows {
        let feature = by_time[&row.datetime];
        assert_eq!(row.market_health, feature.market_health);
        assert!(row.market_health <= 20.0 + 1e-9);
    }
    for trade in &result.trades {
        assert_eq!(trade.market_health, by_time[&trade.entry_time].market_health);
    }
}

#[test]
fn test_report_renders_all_sections() {
    let result = run_backtest(&generate_trending_candles(400), &Config::default());
    let text = report::render(&result);
    assert!(text.contains("BACKTEST RESULTS"));
    assert!(text.contains("BY SIDE"));
    assert!(text.contains("BY EXIT REASON"));
}

// =============================================================================
// CSV round trips
// =============================================================================

#[test]
fn test_csv_round_trip_gives_identical_backtest() -> Result<()> {
    let candles = generate_trending_candles(400);
    let path = temp_path("bars.csv");
    let mut body = String::from("timestamp,open,high,low,close,volume\n");
    for c in &candles {
        body.push_str(&format!(
            "{},{},{},{},{},{}\n",
            c.datetime.to_rfc3339(),
            c.open,
            c.high,
            c.low,
            c.close,
            c.volume
        ));
    }
    std::fs::write(&path, body)?;

    let loaded = data::load_csv(&path)?;
    assert_eq!(loaded, candles);

    let config = Config::default();
    let from_file = run_backtest(&loaded, &config);
    let in_memory = run_backtest(&candles, &config);
    assert_eq!(from_file.trades, in_memory.trades);

    let equity_path = temp_path("equity_curve.csv");
    let trades_path = temp_path("trades.csv");
    data::write_equity_csv(&equity_path, &from_file.rows)?;
    data::write_trades_csv(&trades_path, &from_file.trades)?;
    assert_eq!(
        std::fs::read_to_string(&equity_path)?.lines().count(),
        from_file.rows.len() + 1
    );
    assert_eq!(
        std::fs::read_to_string(&trades_path)?.lines().count(),
        from_file.trades.len() + 1
    );

    for p in [path, equity_path, trades_path] {
        let _ = std::fs::remove_file(p);
    }
    Ok(())
}

// =============================================================================
// Live trader
// =============================================================================

struct OfflineNotifier;

impl Notifier for OfflineNotifier {
    async fn notify(&self, _text: &str) -> Result<()> {
        anyhow::bail!("notification channel offline")
    }
}

#[tokio::test]
async fn test_live_trader_replay() -> Result<()> {
    let candles = generate_trending_candles(400);
    let config = Config::default();
    let mut trader = LiveTrader::new(
        &config,
        PaperBroker::default(),
        MemoryTradeStore::default(),
        OfflineNotifier,
    );

    let mut entries = 0;
    for end in 1..=candles.len() {
        let decision = trader.on_bar(&candles[..end]).await?;
        if end < config.live.warmup_candles {
            assert_eq!(decision.action, Action::None);
        }
        if matches!(decision.action, Action::Buy | Action::Sell) {
            entries += 1;
        }
    }

    let stored = trader.store().trades();
    let open = usize::from(trader.strategy().position().is_some());
    assert!(entries >= 1, "expected the live adapter to enter");
    assert_eq!(trader.broker().orders.len(), 2 * stored.len() + open);

    let realized: f64 = stored.iter().map(|t| t.pnl).sum();
    assert_relative_eq!(trader.balance(), config.account.initial_balance + realized, epsilon = 1e-9);

    // paper fills fall back to the bar close
    if let Some(pos) = trader.strategy().position() {
        assert!(candles.iter().any(|c| c.close == pos.entry_price));
        assert!(pos.qty >= 0.0001);
    }
    Ok(())
}

#[test]
fn test_sqlite_store_persists_across_reopen() -> Result<()> {
    let path = temp_path("trades.db");
    let _ = std::fs::remove_file(&path);
    {
        let store = SqliteTradeStore::open(&path)?;
        for pnl in [4.0, -1.5, 2.5] {
            store.store_trade(&StoredTrade {
                symbol: "BTCUSDT".to_string(),
                entry_time: start_time(),
                exit_time: start_time() + Duration::hours(1),
                side: Side::Short,
                qty: 0.02,
                entry_price: 42_000.0,
                exit_price: 41_800.0,
                pnl,
                reason: ExitReason::TakeProfit.to_string(),
            })?;
        }
    }

    let store = SqliteTradeStore::open(&path)?;
    assert_eq!(store.last_n_pnl(2)?, vec![-1.5, 2.5]);
    let stats = store.stats()?;
    assert_eq!(stats.total_trades, 3);
    assert_relative_eq!(stats.total_pnl, 5.0);
    drop(store);

    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
    }
    Ok(())
}
