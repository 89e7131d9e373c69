//! SQLite trade store
//!
//! Append-only persistence of closed live trades, plus the small queries the
//! live sizer and status output need.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::live::TradeStore;
use crate::types::Side;

/// One closed trade as handed to the persistence collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTrade {
    pub symbol: String,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub side: Side,
    pub qty: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl: f64,
    pub reason: String,
}

/// Summary over every stored trade
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeStats {
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub total_pnl: f64,
}

impl TradeStats {
    pub fn win_rate(&self) -> f64 {
        if self.total_trades > 0 {
            self.wins as f64 / self.total_trades as f64 * 100.0
        } else {
            0.0
        }
    }
}

pub struct SqliteTradeStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTradeStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.create_tables()?;
        info!(db = %db_path.display(), "SQLite trade store initialized");
        Ok(store)
    }

    /// Private in-memory database
    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        store.create_tables()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("trade store connection lock poisoned"))
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                entry_date TEXT NOT NULL,
                exit_date TEXT NOT NULL,
                side TEXT NOT NULL,
                qty REAL NOT NULL,
                entry_price REAL NOT NULL,
                exit_price REAL NOT NULL,
                pnl REAL NOT NULL,
                reason TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_exit_date ON trades(exit_date);",
        )
        .context("Failed to create trades table")?;
        Ok(())
    }

    /// Sum of PnL for trades closed since UTC midnight of `now`
    pub fn today_pnl(&self, now: DateTime<Utc>) -> Result<f64> {
        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|n| n.and_utc())
            .unwrap_or(now);
        let conn = self.lock()?;
        let pnl: f64 = conn.query_row(
            "SELECT COALESCE(SUM(pnl), 0.0) FROM trades WHERE exit_date >= ?1",
            params![timestamp(midnight)],
            |row| row.get(0),
        )?;
        Ok(pnl)
    }

    pub fn stats(&self) -> Result<TradeStats> {
        let conn = self.lock()?;
        let stats = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN pnl > 0 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(pnl), 0.0)
             FROM trades",
            [],
            |row| {
                let total: i64 = row.get(0)?;
                let wins: i64 = row.get(1)?;
                Ok(TradeStats {
                    total_trades: total as usize,
                    wins: wins as usize,
                    losses: (total - wins) as usize,
                    total_pnl: row.get(2)?,
                })
            },
        )?;
        Ok(stats)
    }
}

impl TradeStore for SqliteTradeStore {
    fn store_trade(&self, trade: &StoredTrade) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO trades (symbol, entry_date, exit_date, side, qty, entry_price, exit_price, pnl, reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                trade.symbol,
                timestamp(trade.entry_time),
                timestamp(trade.exit_time),
                trade.side.to_string(),
                trade.qty,
                trade.entry_price,
                trade.exit_price,
                trade.pnl,
                trade.reason,
            ],
        )
        .context("Failed to insert trade")?;
        let id = conn.last_insert_rowid();
        debug!(id, symbol = %trade.symbol, pnl = trade.pnl, "Trade stored");
        Ok(id)
    }

    fn last_n_pnl(&self, n: usize) -> Result<Vec<f64>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT pnl FROM trades ORDER BY id DESC LIMIT ?1")?;
        let mut pnl = stmt
            .query_map(params![n as i64], |row| row.get::<_, f64>(0))?
            .collect::<Result<Vec<f64>, _>>()?;
        pnl.reverse();
        Ok(pnl)
    }
}

fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}
