//! Live command: paper replay
//!
//! Feeds a bar file to the live trader one bar at a time, as a feed would,
//! with a paper broker and the SQLite trade store.

use anyhow::{Context, Result};
use adaptive_strategy::live::{LiveTrader, LogNotifier, PaperBroker};
use adaptive_strategy::store::SqliteTradeStore;
use adaptive_strategy::{Action, Config};
use chrono::Utc;
use tracing::info;

pub fn run(config_path: String, data_override: Option<String>, state_db: String) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    info!("Loaded configuration from: {}", config_path);
    let candles = super::load_bars(&config, data_override)?;
    let store = SqliteTradeStore::open(&state_db)
        .with_context(|| format!("Failed to open trade store {}", state_db))?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let mut trader = LiveTrader::new(&config, PaperBroker::default(), store, LogNotifier);
        let mut decisions = 0usize;

        for end in 1..=candles.len() {
            let decision = trader.on_bar(&candles[..end]).await?;
            if decision.action != Action::None {
                decisions += 1;
            }
        }

        let stats = trader.store().stats()?;
        println!("\n{}", "=".repeat(60));
        println!("PAPER REPLAY ({})", config.live.symbol);
        println!("{}", "=".repeat(60));
        println!("Bars replayed:      {}", candles.len());
        println!("Decisions:          {}", decisions);
        println!("Orders placed:      {}", trader.broker().orders.len());
        println!("Closed trades:      {}", stats.total_trades);
        println!("Win Rate:           {:.2}%", stats.win_rate());
        println!("Total PnL:          ${:.2}", stats.total_pnl);
        println!("PnL today:          ${:.2}", trader.store().today_pnl(Utc::now())?);
        println!("Final Balance:      ${:.2}", trader.balance());
        if let Some(pos) = trader.strategy().position() {
            println!(
                "Open position:      {} {:.6} @ {:.2} (SL {:.2})",
                pos.side, pos.qty, pos.entry_price, pos.stop_loss
            );
        }
        println!("{}", "=".repeat(60));
        Ok::<(), anyhow::Error>(())
    })?;

    info!("Paper replay completed");
    Ok(())
}
