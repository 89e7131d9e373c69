//! Position state machine
//!
//! A single position slot (`FLAT`, `LONG` or `SHORT`) together with the cash
//! balance and the trade ledger. Pyramiding is a counter on the open position,
//! not a separate state.
//!
//! Costs:
//! - entry commission is charged on the notional when opening and on each
//!   pyramid increment;
//! - exit commission plus slippage is charged on the notional closed.

use chrono::{DateTime, Utc};

use crate::config::{AccountConfig, StrategyParams};
use crate::exits::{tighten, trailing_stop, ExitLevels};
use crate::features::FeatureSet;
use crate::filter::ClosedTrade;
use crate::regime::MarketRegime;
use crate::types::{ExitReason, Side, TradeRecord};

/// Commission and slippage model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostModel {
    pub commission_entry: f64,
    pub commission_exit: f64,
    /// Percent, e.g. 0.05 = 0.05%
    pub slippage_pct: f64,
}

impl CostModel {
    pub fn from_account(account: &AccountConfig) -> Self {
        CostModel {
            commission_entry: account.commission_entry,
            commission_exit: account.commission_exit,
            slippage_pct: account.slippage_pct,
        }
    }

    pub fn entry_cost(&self, notional: f64) -> f64 {
        notional * self.commission_entry
    }

    pub fn exit_cost(&self, notional: f64) -> f64 {
        notional * (self.commission_exit + self.slippage_pct / 100.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenPosition {
    pub trade_id: usize,
    pub side: Side,
    pub entry_time: DateTime<Utc>,
    /// Size-weighted average entry
    pub entry_price: f64,
    /// Quote-currency notional currently held
    pub size: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub leverage: f64,
    pub pyramid_adds: u32,
    pub partial_taken: bool,
    /// Entry commissions paid so far (initial entry plus pyramid adds)
    pub entry_costs: f64,
}

impl OpenPosition {
    pub fn unrealized_pct(&self, price: f64) -> f64 {
        self.side.pnl_pct(self.entry_price, price)
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.size * self.unrealized_pct(price)
    }

    pub fn age_hours(&self, now: DateTime<Utc>) -> f64 {
        (now - self.entry_time).num_seconds() as f64 / 3600.0
    }

    pub fn stop_hit(&self, high: f64, low: f64) -> bool {
        match self.side {
            Side::Long => low <= self.stop_loss,
            Side::Short => high >= self.stop_loss,
        }
    }

    pub fn target_hit(&self, high: f64, low: f64) -> bool {
        match self.side {
            Side::Long => high >= self.take_profit,
            Side::Short => low <= self.take_profit,
        }
    }

    /// Exit triggered by this bar's range. The stop is checked first, so a bar
    /// touching both levels resolves as a stop-loss.
    pub fn exit_trigger(&self, high: f64, low: f64) -> Option<(ExitReason, f64)> {
        if self.stop_hit(high, low) {
            Some((ExitReason::StopLoss, self.stop_loss))
        } else if self.target_hit(high, low) {
            Some((ExitReason::TakeProfit, self.take_profit))
        } else {
            None
        }
    }
}

/// Everything needed to open a position
#[derive(Debug, Clone, PartialEq)]
pub struct EntryRequest {
    pub side: Side,
    pub time: DateTime<Utc>,
    pub price: f64,
    pub size: f64,
    pub leverage: f64,
    pub levels: ExitLevels,
    pub weight: f64,
    pub signals: Vec<String>,
    pub regime: MarketRegime,
    pub market_health: f64,
}

/// Whether the open position may be scaled in on this bar
pub fn pyramid_allowed(position: &OpenPosition, feature: &FeatureSet, params: &StrategyParams) -> bool {
    if position.pyramid_adds >= params.max_pyramid_entries {
        return false;
    }
    let (trend, cross, bias, progressed) = match position.side {
        Side::Long => (
            feature.bullish_trend,
            feature.macd_bullish_cross,
            feature.final_long_bias,
            feature.close > position.entry_price * (1.0 + params.pyramid_min_profit),
        ),
        Side::Short => (
            feature.bearish_trend,
            feature.macd_bearish_cross,
            feature.final_short_bias,
            feature.close < position.entry_price * (1.0 - params.pyramid_min_profit),
        ),
    };
    trend
        && feature.adx > params.pyramid_adx_threshold
        && progressed
        && (cross || bias > params.pyramid_bias_threshold)
}

/// Balance, the position slot and the trade ledger
#[derive(Debug, Clone)]
pub struct PositionBook {
    balance: f64,
    position: Option<OpenPosition>,
    trades: Vec<TradeRecord>,
    costs: CostModel,
    last_exit_bar: Option<usize>,
}

impl PositionBook {
    pub fn new(initial_balance: f64, costs: CostModel) -> Self {
        PositionBook {
            balance: initial_balance,
            position: None,
            trades: Vec::new(),
            costs,
            last_exit_bar: None,
        }
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    pub fn position(&self) -> Option<&OpenPosition> {
        self.position.as_ref()
    }

    pub fn is_flat(&self) -> bool {
        self.position.is_none()
    }

    pub fn trades(&self) -> &[TradeRecord] {
        &self.trades
    }

    pub fn into_trades(self) -> Vec<TradeRecord> {
        self.trades
    }

    /// Balance plus unrealized PnL at `price`
    pub fn equity(&self, price: f64) -> f64 {
        self.balance
            + self
                .position
                .as_ref()
                .map_or(0.0, |p| p.unrealized_pnl(price))
    }

    /// True when at least `min_interval` bars have passed since the last full close
    pub fn cooldown_elapsed(&self, bar: usize, min_interval: usize) -> bool {
        self.last_exit_bar
            .map_or(true, |last| bar.saturating_sub(last) >= min_interval)
    }

    /// FLAT -> LONG/SHORT. Returns the new trade id, or `None` if a position is already open.
    pub fn open(&mut self, req: EntryRequest) -> Option<usize> {
        if self.position.is_some() {
            return None;
        }
        let trade_id = self.trades.len();
        let entry_costs = self.costs.entry_cost(req.size);
        self.balance -= entry_costs;

        self.position = Some(OpenPosition {
            trade_id,
            side: req.side,
            entry_time: req.time,
            entry_price: req.price,
            size: req.size,
            stop_loss: req.levels.stop_loss,
            take_profit: req.levels.take_profit,
            leverage: req.leverage,
            pyramid_adds: 0,
            partial_taken: false,
            entry_costs,
        });
        self.trades.push(TradeRecord {
            id: trade_id,
            side: req.side,
            entry_time: req.time,
            entry_price: req.price,
            size: req.size,
            leverage: req.leverage,
            entry_weight: req.weight,
            entry_signals: req.signals,
            initial_stop: req.levels.stop_loss,
            initial_target: req.levels.take_profit,
            regime: req.regime,
            market_health: req.market_health,
            pyramid_adds: 0,
            partial_pnl: 0.0,
            costs: entry_costs,
            exit_time: None,
            exit_price: None,
            pnl: None,
            balance_after: None,
            exit_reason: None,
        });

        tracing::info!(
            trade_id,
            side = %req.side,
            price = req.price,
            size = req.size,
            stop = req.levels.stop_loss,
            target = req.levels.take_profit,
            "Position opened"
        );
        Some(trade_id)
    }

    /// Ratchet the stop from the unrealized gain at `price`. Returns the new stop if it moved.
    pub fn update_trailing(&mut self, price: f64, activation: f64) -> Option<f64> {
        let pos = self.position.as_mut()?;
        let candidate = trailing_stop(pos.side, pos.entry_price, pos.unrealized_pct(price), activation)?;
        let tightened = tighten(pos.side, pos.stop_loss, candidate);
        if tightened == pos.stop_loss {
            return None;
        }
        tracing::debug!(trade_id = pos.trade_id, from = pos.stop_loss, to = tightened, "Trailing stop moved");
        pos.stop_loss = tightened;
        Some(tightened)
    }

    /// Close at the stop or target if this bar touched either
    pub fn check_exit(
        &mut self,
        bar: usize,
        time: DateTime<Utc>,
        high: f64,
        low: f64,
    ) -> Option<ClosedTrade> {
        let (reason, price) = self.position.as_ref()?.exit_trigger(high, low)?;
        self.close(bar, time, price, reason)
    }

    /// Close `fraction` of the position at `price` once gain exceeds `trigger`.
    /// Fires at most once per position; returns the realized PnL.
    pub fn partial_exit(&mut self, price: f64, trigger: f64, fraction: f64) -> Option<f64> {
        let pos = self.position.as_mut()?;
        if pos.partial_taken || pos.unrealized_pct(price) <= trigger {
            return None;
        }
        let closed = pos.size * fraction;
        let exit_costs = self.costs.exit_cost(closed);
        let pnl = closed * pos.unrealized_pct(price) - exit_costs;
        pos.size -= closed;
        pos.partial_taken = true;
        self.balance += pnl;

        let record = &mut self.trades[pos.trade_id];
        record.partial_pnl += pnl;
        record.costs += exit_costs;
        record.size = pos.size;

        tracing::info!(trade_id = pos.trade_id, price, closed, pnl, "Partial exit");
        Some(pnl)
    }

    /// Scale in by `multiplier * size` at `price`.
    ///
    /// The entry becomes the size-weighted average; `relevel` maps the new
    /// entry to fresh exit levels. The stop only tightens, the target is replaced.
    pub fn pyramid<F>(&mut self, price: f64, multiplier: f64, relevel: F) -> bool
    where
        F: FnOnce(Side, f64) -> ExitLevels,
    {
        let Some(pos) = self.position.as_mut() else {
            return false;
        };
        let added = pos.size * multiplier;
        let new_size = pos.size + added;
        let new_entry = (pos.entry_price * pos.size + price * added) / new_size;
        let commission = self.costs.entry_cost(added);

        let levels = relevel(pos.side, new_entry);
        pos.entry_price = new_entry;
        pos.size = new_size;
        pos.stop_loss = tighten(pos.side, pos.stop_loss, levels.stop_loss);
        pos.take_profit = levels.take_profit;
        pos.pyramid_adds += 1;
        pos.entry_costs += commission;
        self.balance -= commission;

        let record = &mut self.trades[pos.trade_id];
        record.entry_price = new_entry;
        record.size = new_size;
        record.pyramid_adds = pos.pyramid_adds;
        record.costs += commission;

        tracing::info!(
            trade_id = pos.trade_id,
            adds = pos.pyramid_adds,
            price,
            added,
            entry = new_entry,
            "Pyramid add"
        );
        true
    }

    /// LONG/SHORT -> FLAT at `price`
    pub fn close(
        &mut self,
        bar: usize,
        time: DateTime<Utc>,
        price: f64,
        reason: ExitReason,
    ) -> Option<ClosedTrade> {
        let pos = self.position.take()?;
        let gross = pos.size * pos.unrealized_pct(price);
        let exit_costs = self.costs.exit_cost(pos.size);
        self.balance += gross - exit_costs;
        self.last_exit_bar = Some(bar);

        let record = &mut self.trades[pos.trade_id];
        record.exit_time = Some(time);
        record.exit_price = Some(price);
        record.pnl = Some(gross - exit_costs - pos.entry_costs);
        record.balance_after = Some(self.balance);
        record.exit_reason = Some(reason);
        record.costs += exit_costs;
        record.size = pos.size;

        tracing::info!(
            trade_id = pos.trade_id,
            side = %pos.side,
            price,
            pnl = record.net_pnl(),
            balance = self.balance,
            reason = %reason,
            "Position closed"
        );
        Some(ClosedTrade {
            side: pos.side,
            pnl: record.net_pnl(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::tests::base_feature;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn free() -> CostModel {
        CostModel {
            commission_entry: 0.0,
            commission_exit: 0.0,
            slippage_pct: 0.0,
        }
    }

    fn long_request(size: f64) -> EntryRequest {
        EntryRequest {
            side: Side::Long,
            time: t0(),
            price: 100.0,
            size,
            leverage: 2.0,
            levels: ExitLevels {
                stop_loss: 95.0,
                take_profit: 110.0,
            },
            weight: 0.9,
            signals: vec!["EMA Crossover".to_string()],
            regime: MarketRegime::Mixed,
            market_health: 60.0,
        }
    }

    #[test]
    fn test_stop_checked_before_target() {
        let mut book = PositionBook::new(1000.0, free());
        book.open(long_request(500.0));
        // one bar spans both levels
        let closed = book.check_exit(5, t0() + Duration::hours(1), 111.0, 94.0).unwrap();
        let trade = &book.trades()[0];
        assert_eq!(trade.exit_reason, Some(ExitReason::StopLoss));
        assert_eq!(trade.exit_price, Some(95.0));
        assert_relative_eq!(closed.pnl, -25.0, epsilon = 1e-9);
        assert_relative_eq!(book.balance(), 975.0, epsilon = 1e-9);
        assert!(book.is_flat());
    }

    #[test]
    fn test_short_target() {
        let mut book = PositionBook::new(1000.0, free());
        book.open(EntryRequest {
            side: Side::Short,
            levels: ExitLevels {
                stop_loss: 105.0,
                take_profit: 90.0,
            },
            ..long_request(500.0)
        });
        assert!(book.check_exit(1, t0(), 101.0, 95.0).is_none());
        let closed = book.check_exit(2, t0(), 99.0, 89.0).unwrap();
        assert_eq!(book.trades()[0].exit_reason, Some(ExitReason::TakeProfit));
        assert_relative_eq!(closed.pnl, 50.0, epsilon = 1e-9);
    }

    #[test]
    fn test_costs_reconcile_with_balance() {
        let costs = CostModel {
            commission_entry: 0.001,
            commission_exit: 0.001,
            slippage_pct: 0.1,
        };
        let mut book = PositionBook::new(1000.0, costs);
        book.open(long_request(500.0));
        assert_relative_eq!(book.balance(), 999.5, epsilon = 1e-9);
        book.close(3, t0(), 104.0, ExitReason::Signal);
        let trade = &book.trades()[0];
        // gross 20, exit costs 500 * 0.002 = 1, entry 0.5
        assert_relative_eq!(trade.net_pnl(), 18.5, epsilon = 1e-9);
        assert_relative_eq!(trade.costs, 1.5, epsilon = 1e-9);
        assert_relative_eq!(book.balance(), 1000.0 + trade.net_pnl(), epsilon = 1e-9);
    }

    #[test]
    fn test_partial_exit_fires_once() {
        let mut book = PositionBook::new(1000.0, free());
        book.open(long_request(500.0));
        assert!(book.partial_exit(110.0, 0.12, 0.4).is_none());
        let pnl = book.partial_exit(113.0, 0.12, 0.4).unwrap();
        assert_relative_eq!(pnl, 200.0 * 0.13, epsilon = 1e-9);
        assert_relative_eq!(book.position().unwrap().size, 300.0, epsilon = 1e-9);
        assert!(book.partial_exit(120.0, 0.12, 0.4).is_none());
        book.close(9, t0(), 113.0, ExitReason::Signal);
        assert_relative_eq!(book.trades()[0].net_pnl(), 500.0 * 0.13, epsilon = 1e-9);
    }

    #[test]
    fn test_pyramid_averages_entry_and_tightens_stop() {
        let costs = CostModel {
            commission_entry: 0.001,
            ..free()
        };
        let mut book = PositionBook::new(1000.0, costs);
        book.open(long_request(500.0));
        let before = book.balance();
        assert!(book.pyramid(110.0, 0.7, |_, _| ExitLevels {
            stop_loss: 90.0,
            take_profit: 120.0,
        }));
        let pos = book.position().unwrap();
        assert_relative_eq!(pos.size, 850.0, epsilon = 1e-9);
        assert_relative_eq!(pos.entry_price, (100.0 * 500.0 + 110.0 * 350.0) / 850.0, epsilon = 1e-9);
        // looser proposed stop ignored, target replaced
        assert_eq!(pos.stop_loss, 95.0);
        assert_eq!(pos.take_profit, 120.0);
        assert_eq!(pos.pyramid_adds, 1);
        assert_relative_eq!(before - book.balance(), 0.35, epsilon = 1e-9);
        assert_eq!(book.trades()[0].pyramid_adds, 1);
    }

    #[test]
    fn test_pyramid_gate() {
        let params = StrategyParams::default();
        let pos = OpenPosition {
            trade_id: 0,
            side: Side::Long,
            entry_time: t0(),
            entry_price: 100.0,
            size: 500.0,
            stop_loss: 95.0,
            take_profit: 110.0,
            leverage: 2.0,
            pyramid_adds: 0,
            partial_taken: false,
            entry_costs: 0.0,
        };
        let ready = FeatureSet {
            bullish_trend: true,
            adx: 35.0,
            close: 104.0,
            final_long_bias: 0.7,
            ..base_feature()
        };
        assert!(pyramid_allowed(&pos, &ready, &params));
        assert!(!pyramid_allowed(&pos, &FeatureSet { close: 102.0, ..ready.clone() }, &params));
        assert!(!pyramid_allowed(&pos, &FeatureSet { adx: 25.0, ..ready.clone() }, &params));
        let maxed = OpenPosition { pyramid_adds: params.max_pyramid_entries, ..pos };
        assert!(!pyramid_allowed(&maxed, &ready, &params));
    }

    #[test]
    fn test_trailing_only_tightens() {
        let mut book = PositionBook::new(1000.0, free());
        book.open(long_request(500.0));
        assert_eq!(book.update_trailing(102.0, 0.03), None);
        assert!((book.update_trailing(106.0, 0.03).unwrap() - 101.8).abs() < 1e-9);
        // pullback proposes a lower stop: ignored
        assert_eq!(book.update_trailing(104.0, 0.03), None);
        assert!((book.position().unwrap().stop_loss - 101.8).abs() < 1e-9);
    }

    #[test]
    fn test_cooldown_and_equity() {
        let mut book = PositionBook::new(1000.0, free());
        assert!(book.cooldown_elapsed(0, 12));
        book.open(long_request(500.0));
        assert_relative_eq!(book.equity(102.0), 1010.0, epsilon = 1e-9);
        assert!(book.open(long_request(100.0)).is_none());
        book.close(20, t0(), 100.0, ExitReason::Signal);
        assert!(!book.cooldown_elapsed(31, 12));
        assert!(book.cooldown_elapsed(32, 12));
        assert_eq!(book.equity(150.0), book.balance());
    }
}
