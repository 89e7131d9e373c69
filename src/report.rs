//! Trade breakdown analysis and results rendering
//!
//! Groups closed trades by side, exit reason, regime, hour of day, weekday and
//! month, and renders them with the headline metrics.

use chrono::{Datelike, Timelike};
use itertools::Itertools;
use std::collections::BTreeMap;
use std::fmt::Write;

use crate::backtest::BacktestResult;
use crate::regime::MarketRegime;
use crate::types::{ExitReason, PerformanceMetrics, Side, TradeRecord};

/// Aggregate PnL statistics for one group of trades
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupStats {
    pub trades: usize,
    pub wins: usize,
    pub net_pnl: f64,
    pub costs: f64,
}

impl GroupStats {
    fn add_trade(&mut self, trade: &TradeRecord) {
        self.trades += 1;
        if trade.is_win() {
            self.wins += 1;
        }
        self.net_pnl += trade.net_pnl();
        self.costs += trade.costs;
    }

    pub fn win_rate(&self) -> f64 {
        if self.trades > 0 {
            self.wins as f64 / self.trades as f64 * 100.0
        } else {
            0.0
        }
    }

    pub fn avg_pnl(&self) -> f64 {
        if self.trades > 0 {
            self.net_pnl / self.trades as f64
        } else {
            0.0
        }
    }
}

/// Calendar month key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl std::fmt::Display for YearMonth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{:02}", self.year, self.month)
    }
}

/// Breakdowns of closed trades. Open trades are ignored.
#[derive(Debug, Clone, Default)]
pub struct TradeReport {
    pub by_side: BTreeMap<Side, GroupStats>,
    pub by_exit_reason: BTreeMap<ExitReason, GroupStats>,
    pub by_regime: BTreeMap<MarketRegime, GroupStats>,
    /// Entry hour (UTC)
    pub by_hour: BTreeMap<u32, GroupStats>,
    /// Entry weekday, 0 = Monday
    pub by_weekday: BTreeMap<u32, GroupStats>,
    /// Exit month
    pub by_month: BTreeMap<YearMonth, GroupStats>,
    pub with_pyramid: GroupStats,
    pub without_pyramid: GroupStats,
}

impl TradeReport {
    pub fn from_trades(trades: &[TradeRecord]) -> Self {
        let mut report = TradeReport::default();
        for trade in trades.iter().filter(|t| !t.is_open()) {
            report.by_side.entry(trade.side).or_default().add_trade(trade);
            if let Some(reason) = trade.exit_reason {
                report.by_exit_reason.entry(reason).or_default().add_trade(trade);
            }
            report.by_regime.entry(trade.regime).or_default().add_trade(trade);
            report
                .by_hour
                .entry(trade.entry_time.hour())
                .or_default()
                .add_trade(trade);
            report
                .by_weekday
                .entry(trade.entry_time.weekday().num_days_from_monday())
                .or_default()
                .add_trade(trade);
            if let Some(exit) = trade.exit_time {
                let key = YearMonth {
                    year: exit.year(),
                    month: exit.month(),
                };
                report.by_month.entry(key).or_default().add_trade(trade);
            }
            if trade.pyramid_adds > 0 {
                report.with_pyramid.add_trade(trade);
            } else {
                report.without_pyramid.add_trade(trade);
            }
        }
        report
    }

    /// Hours sorted by net PnL, best first
    pub fn best_hours(&self, n: usize) -> Vec<u32> {
        self.by_hour
            .iter()
            .sorted_by(|a, b| b.1.net_pnl.total_cmp(&a.1.net_pnl))
            .take(n)
            .map(|(hour, _)| *hour)
            .collect()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.by_side.is_empty() {
            out.push_str("No closed trades to analyse.\n");
            return out;
        }

        section(&mut out, "BY SIDE", self.by_side.iter().map(|(k, v)| (k.to_string(), v)));
        section(
            &mut out,
            "BY EXIT REASON",
            self.by_exit_reason.iter().map(|(k, v)| (k.to_string(), v)),
        );
        section(&mut out, "BY REGIME", self.by_regime.iter().map(|(k, v)| (k.to_string(), v)));
        section(
            &mut out,
            "BY HOUR (UTC)",
            self.by_hour.iter().map(|(k, v)| (format!("{:02}:00", k), v)),
        );
        section(
            &mut out,
            "BY WEEKDAY",
            self.by_weekday.iter().map(|(k, v)| (weekday_name(*k).to_string(), v)),
        );
        section(&mut out, "BY MONTH", self.by_month.iter().map(|(k, v)| (k.to_string(), v)));
        section(
            &mut out,
            "PYRAMID EFFECT",
            [
                ("with adds".to_string(), &self.with_pyramid),
                ("without adds".to_string(), &self.without_pyramid),
            ]
            .into_iter(),
        );

        let best = self.best_hours(3).iter().map(|h| format!("{:02}:00", h)).join(", ");
        let _ = writeln!(out, "Best entry hours:   {}", best);
        out
    }
}

fn section<'a>(out: &mut String, title: &str, rows: impl Iterator<Item = (String, &'a GroupStats)>) {
    let _ = writeln!(out, "\n{}", title);
    let _ = writeln!(out, "{}", "-".repeat(60));
    let _ = writeln!(
        out,
        "{:<20} {:>7} {:>8} {:>11} {:>10}",
        "", "Trades", "Win %", "Net PnL", "Avg PnL"
    );
    for (label, stats) in rows.filter(|(_, s)| s.trades > 0) {
        let _ = writeln!(
            out,
            "{:<20} {:>7} {:>7.1}% {:>11.2} {:>10.2}",
            label,
            stats.trades,
            stats.win_rate(),
            stats.net_pnl,
            stats.avg_pnl()
        );
    }
}

fn weekday_name(day: u32) -> &'static str {
    const NAMES: [&str; 7] = [
        "Monday",
        "Tuesday",
        "Wednesday",
        "Thursday",
        "Friday",
        "Saturday",
        "Sunday",
    ];
    NAMES[day as usize % 7]
}

/// Headline metrics block
pub fn render_metrics(metrics: &PerformanceMetrics) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\n{}", "=".repeat(60));
    let _ = writeln!(out, "BACKTEST RESULTS");
    let _ = writeln!(out, "{}", "=".repeat(60));
    let _ = writeln!(out, "Initial Balance:    ${:.2}", metrics.initial_balance);
    let _ = writeln!(out, "Final Balance:      ${:.2}", metrics.final_balance);
    let _ = writeln!(out, "Total Return:       {:.2}%", metrics.total_return);
    let _ = writeln!(out, "Annual Return:      {:.2}%", metrics.annual_return);
    let _ = writeln!(out, "Sharpe Ratio:       {:.2}", metrics.sharpe_ratio);
    let _ = writeln!(out, "Sortino Ratio:      {:.2}", metrics.sortino_ratio);
    let _ = writeln!(out, "Calmar Ratio:       {:.2}", metrics.calmar_ratio);
    let _ = writeln!(out, "Max Drawdown:       {:.2}%", metrics.max_drawdown);
    let _ = writeln!(out, "Win Rate:           {:.2}%", metrics.win_rate);
    let _ = writeln!(out, "Profit Factor:      {:.2}", metrics.profit_factor);
    let _ = writeln!(out, "Expectancy:         ${:.2}", metrics.expectancy);
    let _ = writeln!(out, "Total Trades:       {}", metrics.total_trades);
    let _ = writeln!(out, "Winning Trades:     {}", metrics.winning_trades);
    let _ = writeln!(out, "Losing Trades:      {}", metrics.losing_trades);
    let _ = writeln!(out, "Average Win:        ${:.2}", metrics.avg_win);
    let _ = writeln!(out, "Average Loss:       ${:.2}", metrics.avg_loss);
    let _ = writeln!(out, "Largest Win:        ${:.2}", metrics.largest_win);
    let _ = writeln!(out, "Largest Loss:       ${:.2}", metrics.largest_loss);
    let _ = writeln!(out, "Total Costs:        ${:.2}", metrics.total_costs);
    let _ = writeln!(out, "{}", "=".repeat(60));
    out
}

/// Full report: metrics, breakdowns and simulation warnings
pub fn render(result: &BacktestResult) -> String {
    let mut out = render_metrics(&result.metrics);
    out.push_str(&TradeReport::from_trades(&result.trades).render());
    if !result.warnings.is_empty() {
        let _ = writeln!(
            out,
            "\n{} sizing warnings, first: {}",
            result.warnings.len(),
            result.warnings[0].warning
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn trade(side: Side, entry: DateTime<Utc>, pnl: f64, reason: ExitReason, adds: u32) -> TradeRecord {
        TradeRecord {
            id: 0,
            side,
            entry_time: entry,
            entry_price: 100.0,
            size: 500.0,
            leverage: 2.0,
            entry_weight: 1.0,
            entry_signals: vec![],
            initial_stop: 95.0,
            initial_target: 110.0,
            regime: MarketRegime::StrongBull,
            market_health: 60.0,
            pyramid_adds: adds,
            partial_pnl: 0.0,
            costs: 0.5,
            exit_time: Some(entry + chrono::Duration::hours(3)),
            exit_price: Some(101.0),
            pnl: Some(pnl),
            balance_after: None,
            exit_reason: Some(reason),
        }
    }

    #[test]
    fn test_grouping() {
        // 2024-01-01 is a Monday
        let mon = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        let tue = Utc.with_ymd_and_hms(2024, 1, 2, 14, 0, 0).unwrap();
        let feb = Utc.with_ymd_and_hms(2024, 2, 6, 9, 30, 0).unwrap();
        let trades = vec![
            trade(Side::Long, mon, 30.0, ExitReason::TakeProfit, 1),
            trade(Side::Long, tue, -10.0, ExitReason::StopLoss, 0),
            trade(Side::Short, feb, 5.0, ExitReason::TakeProfit, 0),
        ];
        let report = TradeReport::from_trades(&trades);

        assert_eq!(report.by_side[&Side::Long].trades, 2);
        assert_eq!(report.by_side[&Side::Long].win_rate(), 50.0);
        assert_eq!(report.by_exit_reason[&ExitReason::TakeProfit].trades, 2);
        assert_eq!(report.by_hour[&9].trades, 2);
        assert_eq!(report.by_weekday[&0].trades, 1);
        assert_eq!(report.by_weekday[&1].trades, 2);
        assert_eq!(report.by_month.len(), 2);
        assert_eq!(report.with_pyramid.trades, 1);
        assert_eq!(report.without_pyramid.avg_pnl(), -2.5);
        assert_eq!(report.best_hours(1), vec![9]);
        assert!(report.render().contains("BY REGIME"));
    }

    #[test]
    fn test_open_trades_ignored() {
        let mut open = trade(Side::Long, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(), 0.0, ExitReason::Signal, 0);
        open.exit_time = None;
        open.pnl = None;
        let report = TradeReport::from_trades(&[open]);
        assert!(report.by_side.is_empty());
        assert!(report.render().contains("No closed trades"));
    }
}
