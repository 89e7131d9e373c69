//! Core data types used across the trading system

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::regime::MarketRegime;

/// Floor applied to denominators that may legitimately reach zero
/// (ATR moving average, loss average, DI sum, volume average).
pub const EPSILON: f64 = 1e-10;

/// OHLCV candlestick data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub datetime: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(
        datetime: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Candle {
            datetime,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    /// Checks internal OHLC consistency. Returns a human-readable reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        let fields = [self.open, self.high, self.low, self.close, self.volume];
        if fields.iter().any(|v| !v.is_finite()) {
            return Err("non-finite OHLCV value".to_string());
        }
        if self.open <= 0.0 || self.high <= 0.0 || self.low <= 0.0 || self.close <= 0.0 {
            return Err("prices must be positive".to_string());
        }
        if self.volume < 0.0 {
            return Err(format!("negative volume {}", self.volume));
        }
        if self.high < self.low {
            return Err(format!("high {} below low {}", self.high, self.low));
        }
        if self.high < self.open.max(self.close) || self.low > self.open.min(self.close) {
            return Err("open/close outside the high-low range".to_string());
        }
        Ok(())
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1 for longs, -1 for shorts
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// Relative price move in this side's favour: `exit/entry - 1` for longs.
    pub fn pnl_pct(self, entry_price: f64, price: f64) -> f64 {
        match self {
            Side::Long => price / entry_price - 1.0,
            Side::Short => 1.0 - price / entry_price,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// Action emitted by the live decision adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    None,
    Buy,
    Sell,
    Exit,
}

/// `{action, stop_loss?, take_profit?}` decision for one bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// Why an EXIT fired. `None` for every other action.
    pub reason: Option<ExitReason>,
}

impl Decision {
    pub fn none() -> Self {
        Decision {
            action: Action::None,
            stop_loss: None,
            take_profit: None,
            reason: None,
        }
    }

    pub fn enter(side: Side, stop_loss: f64, take_profit: f64) -> Self {
        let action = match side {
            Side::Long => Action::Buy,
            Side::Short => Action::Sell,
        };
        Decision {
            action,
            stop_loss: Some(stop_loss),
            take_profit: Some(take_profit),
            reason: None,
        }
    }

    pub fn exit(reason: ExitReason) -> Self {
        Decision {
            action: Action::Exit,
            stop_loss: None,
            take_profit: None,
            reason: Some(reason),
        }
    }
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Signal,
    EndOfSimulation,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ExitReason::StopLoss => "Stop Loss",
            ExitReason::TakeProfit => "Take Profit",
            ExitReason::Signal => "Signal Exit",
            ExitReason::EndOfSimulation => "End of Simulation",
        };
        f.write_str(label)
    }
}

/// One simulated trade. Exit fields stay `None` while the trade is open.
///
/// `size` is the quote-currency notional currently held; `entry_price` is the
/// size-weighted average after pyramid adds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: usize,
    pub side: Side,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub size: f64,
    pub leverage: f64,
    /// Filtered decision weight that triggered the entry
    pub entry_weight: f64,
    pub entry_signals: Vec<String>,
    pub initial_stop: f64,
    pub initial_target: f64,
    pub regime: MarketRegime,
    pub market_health: f64,
    pub pyramid_adds: u32,
    /// Realized PnL of partial exits, net of costs
    pub partial_pnl: f64,
    /// Entry and exit commissions plus exit slippage
    pub costs: f64,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_price: Option<f64>,
    /// Realized PnL of the final close, net of exit costs and of every entry
    /// commission paid on the trade
    pub pnl: Option<f64>,
    pub balance_after: Option<f64>,
    pub exit_reason: Option<ExitReason>,
}

impl TradeRecord {
    pub fn is_open(&self) -> bool {
        self.exit_time.is_none()
    }

    /// Total realized PnL including partial exits. Zero while open.
    ///
    /// Summed over all trades this reconciles the initial and final balance.
    pub fn net_pnl(&self) -> f64 {
        self.pnl.unwrap_or(0.0) + self.partial_pnl
    }

    pub fn is_win(&self) -> bool {
        self.net_pnl() > 0.0
    }

    pub fn duration_hours(&self) -> Option<f64> {
        self.exit_time
            .map(|exit| (exit - self.entry_time).num_seconds() as f64 / 3600.0)
    }

    /// Price return of the trade in percent, signed per side
    pub fn return_pct(&self) -> Option<f64> {
        self.exit_price
            .map(|exit| self.side.pnl_pct(self.entry_price, exit) * 100.0)
    }
}

/// One row of the equity-curve table, emitted for every simulated bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub datetime: DateTime<Utc>,
    pub balance: f64,
    pub equity: f64,
    pub position: Option<Side>,
    pub trade_id: Option<usize>,
    pub entry_price: Option<f64>,
    pub size: f64,
    pub stop_loss: Option<f64>,
    pub price: f64,
    pub market_health: f64,
    pub regime: MarketRegime,
}

/// Non-fatal diagnostic produced while sizing a position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SizingWarning {
    BelowMinimum { requested: f64, minimum: f64 },
    AboveLeverageCap { requested: f64, cap: f64 },
}

impl std::fmt::Display for SizingWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SizingWarning::BelowMinimum { requested, minimum } => write!(
                f,
                "position size {:.2} below minimum {:.2}; raised to the floor",
                requested, minimum
            ),
            SizingWarning::AboveLeverageCap { requested, cap } => write!(
                f,
                "position size {:.2} above leverage cap {:.2}; clamped",
                requested, cap
            ),
        }
    }
}

/// Sizing warning tagged with the bar it happened on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationWarning {
    pub datetime: DateTime<Utc>,
    pub warning: SizingWarning,
}

/// Portfolio statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub initial_balance: f64,
    pub final_balance: f64,
    pub total_return: f64,
    pub annual_return: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub expectancy: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub total_costs: f64,
}
