//! Backtesting engine
//!
//! Deterministic bar-by-bar simulation of the full decision pipeline:
//! features, signals, bias filter, exit levels, sizing and the position
//! state machine, with commission and slippage modeling.

use chrono::{DateTime, Duration, Utc};
use statrs::statistics::Statistics;

use crate::config::Config;
use crate::exits::calculate_exit_levels;
use crate::features::{compute_features, FeatureSet};
use crate::filter::{apply_bias_filter, BiasContext, RecentTrades};
use crate::position::{pyramid_allowed, CostModel, EntryRequest, PositionBook};
use crate::risk::{optimal_leverage, position_size, RiskState, REBALANCE_EVERY_BARS};
use crate::signals::generate_signals;
use crate::types::{
    Candle, ExitReason, PerformanceMetrics, ResultRow, SimulationWarning, TradeRecord, EPSILON,
};

const SECONDS_PER_YEAR: f64 = 365.0 * 24.0 * 3600.0;

/// Backtest engine
pub struct Backtester {
    config: Config,
}

impl Backtester {
    pub fn new(config: Config) -> Self {
        Backtester { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run the simulation over a validated, time-ordered bar series
    pub fn run(&self, candles: &[Candle]) -> BacktestResult {
        let params = &self.config.strategy;
        let account = &self.config.account;

        let features = compute_features(candles, params);
        if features.len() < 2 {
            tracing::error!(
                bars = candles.len(),
                warmup = params.warmup_bars(),
                "Not enough data to run the backtest"
            );
            return BacktestResult::empty(account.initial_balance);
        }

        let mut book = PositionBook::new(account.initial_balance, CostModel::from_account(account));
        let mut risk = RiskState::new(account, params);
        let mut recent = RecentTrades::default();
        let mut rows = Vec::with_capacity(features.len() - 1);
        let mut warnings = Vec::new();
        let last = features.len() - 1;

        for i in 1..features.len() {
            let cur = &features[i];
            let prev = &features[i - 1];

            if !book.is_flat() {
                book.update_trailing(cur.close, params.trailing_activation);

                if let Some(closed) = book.check_exit(i, cur.datetime, cur.high, cur.low) {
                    recent.push(closed.side, closed.pnl);
                } else {
                    book.partial_exit(cur.close, params.partial_exit_trigger, params.partial_exit_fraction);

                    let age = book
                        .position()
                        .filter(|pos| pyramid_allowed(pos, cur, params))
                        .map(|pos| pos.age_hours(cur.datetime));
                    if let Some(age) = age {
                        let tp_scale = risk.tp_scale();
                        book.pyramid(cur.close, params.pyramid_size_multiplier, |side, entry| {
                            calculate_exit_levels(side, entry, cur, age, tp_scale, params)
                        });
                    }
                }
            } else if i < last && book.cooldown_elapsed(i, params.min_trades_interval) {
                self.try_enter(cur, prev, &mut book, &risk, &recent, &mut warnings);
            }

            if i == last {
                if let Some(closed) = book.close(i, cur.datetime, cur.close, ExitReason::EndOfSimulation) {
                    recent.push(closed.side, closed.pnl);
                }
            }

            rows.push(result_row(cur, &book));

            risk.maybe_adapt(&recent);
            if i % REBALANCE_EVERY_BARS == 0 {
                risk.rebalance(&recent);
            }
        }

        let trades = book.into_trades();
        let metrics = self.calculate_metrics(&trades, &rows, bar_interval(candles));

        tracing::info!(
            bars = rows.len(),
            trades = trades.len(),
            final_balance = metrics.final_balance,
            warnings = warnings.len(),
            "Backtest complete"
        );

        BacktestResult {
            rows,
            trades,
            metrics,
            warnings,
        }
    }

    fn try_enter(
        &self,
        cur: &FeatureSet,
        prev: &FeatureSet,
        book: &mut PositionBook,
        risk: &RiskState,
        recent: &RecentTrades,
        warnings: &mut Vec<SimulationWarning>,
    ) {
        let params = &self.config.strategy;
        let account = &self.config.account;

        let signals = generate_signals(cur, prev, params);
        let ctx = BiasContext::new(params, risk.global_short_penalty);
        let filtered = apply_bias_filter(cur, &signals, recent, &ctx);
        let Some(side) = filtered.actionable_side(params.entry_threshold) else {
            return;
        };

        if book.balance() <= 0.0 {
            tracing::warn!(balance = book.balance(), "Account depleted; entry skipped");
            return;
        }

        let entry = cur.close;
        let levels = calculate_exit_levels(side, entry, cur, 0.0, risk.tp_scale(), params);
        if levels.risk(side, entry) <= EPSILON {
            tracing::debug!(datetime = %cur.datetime, "Zero stop distance; entry skipped");
            return;
        }

        let leverage = optimal_leverage(cur, side, account.max_leverage);
        let (size, sizing) = position_size(
            book.balance(),
            risk.risk_per_trade,
            entry,
            levels.stop_loss,
            leverage,
            account.min_position,
        );
        for warning in sizing {
            tracing::warn!(datetime = %cur.datetime, "{}", warning);
            warnings.push(SimulationWarning {
                datetime: cur.datetime,
                warning,
            });
        }
        if size <= 0.0 {
            return;
        }

        book.open(EntryRequest {
            side,
            time: cur.datetime,
            price: entry,
            size,
            leverage,
            levels,
            weight: filtered.weight(side),
            signals: signals.names(side),
            regime: cur.regime,
            market_health: cur.market_health,
        });
    }

    fn calculate_metrics(
        &self,
        trades: &[TradeRecord],
        rows: &[ResultRow],
        bar_interval: Duration,
    ) -> PerformanceMetrics {
        let initial_balance = self.config.account.initial_balance;
        let Some(final_row) = rows.last() else {
            return PerformanceMetrics {
                initial_balance,
                final_balance: initial_balance,
                ..Default::default()
            };
        };
        let final_balance = final_row.balance;
        let total_return = (final_balance - initial_balance) / initial_balance * 100.0;

        let span_days = (final_row.datetime - rows[0].datetime).num_seconds() as f64 / 86_400.0;
        let annual_return = if span_days > 0.0 && final_balance > 0.0 {
            ((final_balance / initial_balance).powf(365.0 / span_days) - 1.0) * 100.0
        } else {
            0.0
        };

        let closed: Vec<&TradeRecord> = trades.iter().filter(|t| !t.is_open()).collect();
        let winning_trades: Vec<f64> = closed.iter().map(|t| t.net_pnl()).filter(|p| *p > 0.0).collect();
        let losing_trades: Vec<f64> = closed.iter().map(|t| t.net_pnl()).filter(|p| *p <= 0.0).collect();

        let win_rate = if !closed.is_empty() {
            winning_trades.len() as f64 / closed.len() as f64 * 100.0
        } else {
            0.0
        };

        let gross_profits: f64 = winning_trades.iter().sum();
        let gross_losses: f64 = losing_trades.iter().map(|p| p.abs()).sum();

        let profit_factor = if gross_losses > 0.0 {
            gross_profits / gross_losses
        } else if gross_profits > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let avg_win = if !winning_trades.is_empty() {
            gross_profits / winning_trades.len() as f64
        } else {
            0.0
        };
        let avg_loss = if !losing_trades.is_empty() {
            gross_losses / losing_trades.len() as f64
        } else {
            0.0
        };
        let expectancy = if !closed.is_empty() {
            (gross_profits - gross_losses) / closed.len() as f64
        } else {
            0.0
        };

        let largest_win = winning_trades.iter().copied().fold(0.0, f64::max);
        let largest_loss = losing_trades.iter().copied().fold(0.0, f64::min);

        let mut peak = initial_balance;
        let mut max_dd = 0.0;
        for row in rows {
            if row.equity > peak {
                peak = row.equity;
            }
            let dd = (peak - row.equity) / peak;
            if dd > max_dd {
                max_dd = dd;
            }
        }

        let bars_per_year = SECONDS_PER_YEAR / (bar_interval.num_seconds().max(1) as f64);
        let (sharpe_ratio, sortino_ratio) = risk_adjusted_ratios(rows, initial_balance, bars_per_year);

        let calmar_ratio = if max_dd > 0.0 {
            (annual_return / 100.0) / max_dd
        } else {
            0.0
        };

        PerformanceMetrics {
            initial_balance,
            final_balance,
            total_return,
            annual_return,
            sharpe_ratio,
            sortino_ratio,
            calmar_ratio,
            max_drawdown: max_dd * 100.0,
            win_rate,
            profit_factor,
            expectancy,
            total_trades: closed.len(),
            winning_trades: winning_trades.len(),
            losing_trades: losing_trades.len(),
            avg_win,
            avg_loss,
            largest_win,
            largest_loss,
            total_costs: trades.iter().map(|t| t.costs).sum(),
        }
    }
}

/// Batch entry point: equity-curve rows and trade history for `candles` under `config`
pub fn run_backtest(candles: &[Candle], config: &Config) -> BacktestResult {
    Backtester::new(config.clone()).run(candles)
}

fn result_row(feature: &FeatureSet, book: &PositionBook) -> ResultRow {
    let position = book.position();
    ResultRow {
        datetime: feature.datetime,
        balance: book.balance(),
        equity: book.equity(feature.close),
        position: position.map(|p| p.side),
        trade_id: position.map(|p| p.trade_id),
        entry_price: position.map(|p| p.entry_price),
        size: position.map_or(0.0, |p| p.size),
        stop_loss: position.map(|p| p.stop_loss),
        price: feature.close,
        market_health: feature.market_health,
        regime: feature.regime,
    }
}

/// Annualised Sharpe and Sortino from per-bar equity returns
fn risk_adjusted_ratios(rows: &[ResultRow], initial_balance: f64, bars_per_year: f64) -> (f64, f64) {
    let mut previous = initial_balance;
    let returns: Vec<f64> = rows
        .iter()
        .map(|row| {
            let r = if previous.abs() > EPSILON {
                row.equity / previous - 1.0
            } else {
                0.0
            };
            previous = row.equity;
            r
        })
        .collect();
    if returns.len() < 2 {
        return (0.0, 0.0);
    }

    let mean_return = returns.iter().mean();
    let std_dev = returns.iter().std_dev();
    let downside = (returns.iter().map(|r| r.min(0.0).powi(2)).sum::<f64>() / returns.len() as f64).sqrt();

    let annualise = bars_per_year.sqrt();
    let sharpe = if std_dev > EPSILON {
        mean_return / std_dev * annualise
    } else {
        0.0
    };
    let sortino = if downside > EPSILON {
        mean_return / downside * annualise
    } else {
        0.0
    };
    (sharpe, sortino)
}

/// Median spacing between consecutive bars; 15 minutes when undeterminable
pub fn bar_interval(candles: &[Candle]) -> Duration {
    let mut gaps: Vec<i64> = candles
        .windows(2)
        .map(|w| (w[1].datetime - w[0].datetime).num_seconds())
        .filter(|s| *s > 0)
        .collect();
    if gaps.is_empty() {
        return Duration::minutes(15);
    }
    gaps.sort_unstable();
    Duration::seconds(gaps[gaps.len() / 2])
}

#[derive(Debug, Clone, Default)]
pub struct BacktestResult {
    /// One row per simulated bar
    pub rows: Vec<ResultRow>,
    pub trades: Vec<TradeRecord>,
    pub metrics: PerformanceMetrics,
    pub warnings: Vec<SimulationWarning>,
}

impl BacktestResult {
    fn empty(initial_balance: f64) -> Self {
        BacktestResult {
            metrics: PerformanceMetrics {
                initial_balance,
                final_balance: initial_balance,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.rows.first().map(|r| r.datetime)
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.rows.last().map(|r| r.datetime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regime::MarketRegime;
    use crate::types::Side;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn row(minutes: i64, equity: f64) -> ResultRow {
        ResultRow {
            datetime: t(minutes),
            balance: equity,
            equity,
            position: None,
            trade_id: None,
            entry_price: None,
            size: 0.0,
            stop_loss: None,
            price: 100.0,
            market_health: 50.0,
            regime: MarketRegime::Mixed,
        }
    }

    fn trade(id: usize, pnl: f64, costs: f64) -> TradeRecord {
        TradeRecord {
            id,
            side: Side::Long,
            entry_time: t(0),
            entry_price: 100.0,
            size: 500.0,
            leverage: 2.0,
            entry_weight: 1.0,
            entry_signals: vec![],
            initial_stop: 95.0,
            initial_target: 110.0,
            regime: MarketRegime::Mixed,
            market_health: 50.0,
            pyramid_adds: 0,
            partial_pnl: 0.0,
            costs,
            exit_time: Some(t(60)),
            exit_price: Some(101.0),
            pnl: Some(pnl),
            balance_after: None,
            exit_reason: Some(ExitReason::Signal),
        }
    }

    #[test]
    fn test_too_little_data_returns_empty_result() {
        let candles: Vec<Candle> = (0..50)
            .map(|i| Candle::new(t(i * 15), 100.0, 101.0, 99.0, 100.0, 10.0))
            .collect();
        let result = run_backtest(&candles, &Config::default());
        assert!(result.rows.is_empty());
        assert!(result.trades.is_empty());
        assert_eq!(result.metrics.final_balance, 1000.0);
    }

    #[test]
    fn test_metrics_from_trades_and_curve() {
        let backtester = Backtester::new(Config::default());
        let trades = vec![trade(0, 30.0, 1.0), trade(1, -10.0, 1.0), trade(2, 20.0, 0.5)];
        let rows = vec![row(0, 1000.0), row(15, 1030.0), row(30, 1020.0), row(45, 1040.0)];
        let m = backtester.calculate_metrics(&trades, &rows, Duration::minutes(15));

        assert_eq!(m.total_trades, 3);
        assert_eq!(m.winning_trades, 2);
        assert_relative_eq!(m.win_rate, 200.0 / 3.0, epsilon = 1e-9);
        assert_relative_eq!(m.profit_factor, 5.0, epsilon = 1e-9);
        assert_relative_eq!(m.expectancy, 40.0 / 3.0, epsilon = 1e-9);
        assert_relative_eq!(m.avg_win, 25.0, epsilon = 1e-9);
        assert_relative_eq!(m.avg_loss, 10.0, epsilon = 1e-9);
        assert_relative_eq!(m.largest_win, 30.0, epsilon = 1e-9);
        assert_relative_eq!(m.largest_loss, -10.0, epsilon = 1e-9);
        assert_relative_eq!(m.total_return, 4.0, epsilon = 1e-9);
        assert_relative_eq!(m.max_drawdown, 10.0 / 1030.0 * 100.0, epsilon = 1e-9);
        assert_relative_eq!(m.total_costs, 2.5, epsilon = 1e-9);
        assert!(m.sharpe_ratio > 0.0);
        assert!(m.sortino_ratio > 0.0);
    }

    #[test]
    fn test_profit_factor_without_losses() {
        let backtester = Backtester::new(Config::default());
        let rows = vec![row(0, 1000.0), row(15, 1010.0)];
        let m = backtester.calculate_metrics(&[trade(0, 10.0, 0.0)], &rows, Duration::minutes(15));
        assert!(m.profit_factor.is_infinite());
        assert_eq!(m.max_drawdown, 0.0);
        assert_eq!(m.calmar_ratio, 0.0);
    }

    #[test]
    fn test_bar_interval_uses_median_gap() {
        let candles: Vec<Candle> = [0, 15, 30, 90, 105]
            .iter()
            .map(|m| Candle::new(t(*m), 1.0, 1.0, 1.0, 1.0, 1.0))
            .collect();
        assert_eq!(bar_interval(&candles), Duration::minutes(15));
        assert_eq!(bar_interval(&candles[..1]), Duration::minutes(15));
    }
}
