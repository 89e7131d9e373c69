//! Live decision adapter and trader
//!
//! `LiveStrategy` turns the newest bar of an externally delivered series into
//! a `{NONE, BUY, SELL, EXIT}` decision through the same pipeline as the
//! backtest. `LiveTrader` acts on those decisions through three collaborators:
//! a broker for market orders, a trade store and a notifier.
//!
//! Bars must arrive in order; the adapter is not safe to drive from more than
//! one task at a time.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{Config, LiveConfig, StrategyParams};
use crate::exits::calculate_exit_levels;
use crate::features::compute_features;
use crate::filter::{apply_bias_filter, BiasContext, RecentTrades};
use crate::regime::MarketRegime;
use crate::risk::{adaptive_risk_per_trade, calc_qty, RiskState, MIN_QTY};
use crate::signals::generate_signals;
use crate::store::StoredTrade;
use crate::types::{Action, Candle, Decision, ExitReason, Side};

/// Quantity precision of live orders
const QTY_STEP: f64 = 1e-6;
/// Closed trades the live sizer looks back over
const SIZING_LOOKBACK: usize = 20;

/// Market order execution
pub trait Broker {
    /// Place a market order; `Ok(None)` or a zero price means the fill price is unknown.
    fn place_market(
        &mut self,
        symbol: &str,
        side: Side,
        qty: f64,
    ) -> impl Future<Output = Result<Option<f64>>> + Send;
}

/// Append-only store of closed trades
pub trait TradeStore {
    fn store_trade(&self, trade: &StoredTrade) -> Result<i64>;

    /// PnL of the last `n` closed trades, oldest first
    fn last_n_pnl(&self, n: usize) -> Result<Vec<f64>>;
}

/// Fire-and-forget notifications
pub trait Notifier {
    fn notify(&self, text: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Open live position
#[derive(Debug, Clone, PartialEq)]
pub struct LivePosition {
    pub side: Side,
    /// Base-unit quantity
    pub qty: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub entry_time: DateTime<Utc>,
}

impl LivePosition {
    /// Exit reason if `price` is at or beyond the stop or target
    pub fn exit_reason(&self, price: f64) -> Option<ExitReason> {
        let (stopped, target) = match self.side {
            Side::Long => (price <= self.stop_loss, price >= self.take_profit),
            Side::Short => (price >= self.stop_loss, price <= self.take_profit),
        };
        if stopped {
            Some(ExitReason::StopLoss)
        } else if target {
            Some(ExitReason::TakeProfit)
        } else {
            None
        }
    }

    pub fn pnl(&self, exit_price: f64) -> f64 {
        (exit_price - self.entry_price) * self.qty * self.side.sign()
    }
}

pub struct LiveStrategy {
    params: StrategyParams,
    live: LiveConfig,
    risk: RiskState,
    recent: RecentTrades,
    position: Option<LivePosition>,
    last_regime: MarketRegime,
}

impl LiveStrategy {
    pub fn new(config: &Config) -> Self {
        LiveStrategy {
            params: config.strategy.clone(),
            live: config.live.clone(),
            risk: RiskState::new(&config.account, &config.strategy),
            recent: RecentTrades::default(),
            position: None,
            last_regime: MarketRegime::Unknown,
        }
    }

    pub fn position(&self) -> Option<&LivePosition> {
        self.position.as_ref()
    }

    /// Decide on the newest bar of `bars`.
    ///
    /// Returns `NONE` until `warmup_candles` bars are available. While in a
    /// position the close is checked against stop and target, and the stop
    /// trails the close once the trigger gain is reached.
    pub fn on_new_bar(&mut self, bars: &[Candle]) -> Decision {
        if bars.len() < self.live.warmup_candles {
            debug!(bars = bars.len(), needed = self.live.warmup_candles, "Warming up");
            return Decision::none();
        }

        let window = &bars[bars.len().saturating_sub(self.live.history_window)..];
        let features = compute_features(window, &self.params);
        let (Some(cur), Some(prev)) = (features.last(), features.len().checked_sub(2).map(|i| &features[i]))
        else {
            warn!(bars = window.len(), "History window too short for features");
            return Decision::none();
        };
        self.last_regime = cur.regime;

        if let Some(pos) = self.position.as_mut() {
            if let Some(reason) = pos.exit_reason(cur.close) {
                return Decision::exit(reason);
            }
            let trailed = match pos.side {
                Side::Long if cur.close > pos.entry_price * (1.0 + self.live.trail_trigger_long) => {
                    pos.stop_loss.max(cur.close * (1.0 - self.live.trail_sl_long))
                }
                Side::Short if cur.close < pos.entry_price * (1.0 - self.live.trail_trigger_short) => {
                    pos.stop_loss.min(cur.close * (1.0 + self.live.trail_sl_short))
                }
                _ => pos.stop_loss,
            };
            if trailed != pos.stop_loss {
                info!(side = %pos.side, from = pos.stop_loss, to = trailed, "Trailing stop updated");
                pos.stop_loss = trailed;
            }
            return Decision::none();
        }

        let signals = generate_signals(cur, prev, &self.params);
        let ctx = BiasContext::new(&self.params, self.risk.global_short_penalty);
        let filtered = apply_bias_filter(cur, &signals, &self.recent, &ctx);
        match filtered.actionable_side(self.params.entry_threshold) {
            Some(side) => {
                let levels =
                    calculate_exit_levels(side, cur.close, cur, 0.0, self.risk.tp_scale(), &self.params);
                debug!(side = %side, weight = filtered.weight(side), "Entry signal");
                Decision::enter(side, levels.stop_loss, levels.take_profit)
            }
            None => Decision::none(),
        }
    }

    /// Base-unit quantity for an entry, risk adapted to side, regime and recent form
    pub fn calc_qty(&self, side: Side, balance: f64, price: f64, stop_loss: f64, recent_pnl: &[f64]) -> f64 {
        let window = RecentTrades::DEFAULT_CAPACITY;
        let (long_risk, short_risk) = adaptive_risk_per_trade(
            self.risk.risk_per_trade,
            self.last_regime,
            self.recent.win_rate(window, Some(Side::Long)).unwrap_or(0.5),
            self.recent.win_rate(window, Some(Side::Short)).unwrap_or(0.5),
            &self.recent,
        );
        let base_risk = match side {
            Side::Long => long_risk,
            Side::Short => short_risk,
        };
        calc_qty(balance, price, stop_loss, base_risk, recent_pnl)
    }

    pub fn open_position(
        &mut self,
        side: Side,
        qty: f64,
        entry_price: f64,
        stop_loss: f64,
        take_profit: f64,
        time: DateTime<Utc>,
    ) {
        info!(side = %side, qty, entry_price, stop_loss, take_profit, "Position opened");
        self.position = Some(LivePosition {
            side,
            qty,
            entry_price,
            stop_loss,
            take_profit,
            entry_time: time,
        });
    }

    /// Close the open position and feed the result back into the adaptive state
    pub fn close_position(&mut self, exit_price: f64) -> Option<(LivePosition, f64)> {
        let pos = self.position.take()?;
        let pnl = pos.pnl(exit_price);
        self.recent.push(pos.side, pnl);
        self.risk.maybe_adapt(&self.recent);
        info!(side = %pos.side, exit_price, pnl, "Position closed");
        Some((pos, pnl))
    }
}

/// Drives a `LiveStrategy` against its collaborators
pub struct LiveTrader<B, S, N> {
    symbol: String,
    strategy: LiveStrategy,
    broker: B,
    store: S,
    notifier: N,
    balance: f64,
}

impl<B: Broker, S: TradeStore, N: Notifier> LiveTrader<B, S, N> {
    pub fn new(config: &Config, broker: B, store: S, notifier: N) -> Self {
        LiveTrader {
            symbol: config.live.symbol.clone(),
            strategy: LiveStrategy::new(config),
            broker,
            store,
            notifier,
            balance: config.account.initial_balance,
        }
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    pub fn strategy(&self) -> &LiveStrategy {
        &self.strategy
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Process the newest bar. Broker and store failures propagate.
    pub async fn on_bar(&mut self, bars: &[Candle]) -> Result<Decision> {
        let Some(last) = bars.last() else {
            return Ok(Decision::none());
        };
        let decision = self.strategy.on_new_bar(bars);

        match decision.action {
            Action::Buy | Action::Sell if self.strategy.position().is_none() => {
                let side = if decision.action == Action::Buy { Side::Long } else { Side::Short };
                let (Some(stop_loss), Some(take_profit)) = (decision.stop_loss, decision.take_profit) else {
                    return Ok(decision);
                };

                let recent_pnl = self.store.last_n_pnl(SIZING_LOOKBACK)?;
                let qty = self
                    .strategy
                    .calc_qty(side, self.balance, last.close, stop_loss, &recent_pnl);
                let qty = (qty / QTY_STEP).floor() * QTY_STEP;
                if qty < MIN_QTY {
                    warn!(qty, "Quantity too small, entry skipped");
                    return Ok(decision);
                }

                let fill = self.broker.place_market(&self.symbol, side, qty).await?;
                let price = fill_or(fill, last.close);
                self.strategy
                    .open_position(side, qty, price, stop_loss, take_profit, last.datetime);
                self.notify(&format!(
                    "OPEN {} {:.4} {} @ {:.2} SL {:.2} TP {:.2}",
                    side, qty, self.symbol, price, stop_loss, take_profit
                ))
                .await;
            }
            Action::Exit => {
                let Some(pos) = self.strategy.position().cloned() else {
                    return Ok(decision);
                };
                let fill = self
                    .broker
                    .place_market(&self.symbol, pos.side.opposite(), pos.qty)
                    .await?;
                let price = fill_or(fill, last.close);
                if let Some((pos, pnl)) = self.strategy.close_position(price) {
                    let reason = decision.reason.unwrap_or(ExitReason::Signal);
                    self.store.store_trade(&StoredTrade {
                        symbol: self.symbol.clone(),
                        entry_time: pos.entry_time,
                        exit_time: last.datetime,
                        side: pos.side,
                        qty: pos.qty,
                        entry_price: pos.entry_price,
                        exit_price: price,
                        pnl,
                        reason: reason.to_string(),
                    })?;
                    self.balance += pnl;
                    info!(balance = self.balance, pnl, "Balance updated");
                    self.notify(&format!("CLOSE {} {} PnL {:.2} ({})", pos.side, self.symbol, pnl, reason))
                        .await;
                }
            }
            _ => {}
        }
        Ok(decision)
    }

    async fn notify(&self, text: &str) {
        if let Err(e) = self.notifier.notify(text).await {
            warn!(error = %e, "Notification failed");
        }
    }
}

fn fill_or(fill: Option<f64>, fallback: f64) -> f64 {
    fill.filter(|p| *p > 0.0 && p.is_finite()).unwrap_or(fallback)
}

/// Order placed with the paper broker
#[derive(Debug, Clone, PartialEq)]
pub struct PaperOrder {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
}

/// Records orders without reporting a fill price, so fills fall back to the bar close
#[derive(Debug, Default)]
pub struct PaperBroker {
    pub orders: Vec<PaperOrder>,
}

impl Broker for PaperBroker {
    async fn place_market(&mut self, symbol: &str, side: Side, qty: f64) -> Result<Option<f64>> {
        info!(symbol, side = %side, qty, "Paper market order");
        self.orders.push(PaperOrder {
            symbol: symbol.to_string(),
            side,
            qty,
        });
        Ok(None)
    }
}

#[derive(Debug, Default)]
pub struct MemoryTradeStore {
    trades: Mutex<Vec<StoredTrade>>,
}

impl MemoryTradeStore {
    pub fn trades(&self) -> Vec<StoredTrade> {
        self.trades.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

impl TradeStore for MemoryTradeStore {
    fn store_trade(&self, trade: &StoredTrade) -> Result<i64> {
        let mut trades = self
            .trades
            .lock()
            .map_err(|_| anyhow::anyhow!("trade store lock poisoned"))?;
        trades.push(trade.clone());
        Ok(trades.len() as i64)
    }

    fn last_n_pnl(&self, n: usize) -> Result<Vec<f64>> {
        let trades = self
            .trades
            .lock()
            .map_err(|_| anyhow::anyhow!("trade store lock poisoned"))?;
        Ok(trades[trades.len().saturating_sub(n)..].iter().map(|t| t.pnl).collect())
    }
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    async fn notify(&self, text: &str) -> Result<()> {
        info!(target: "notify", "{}", text);
        Ok(())
    }
}
