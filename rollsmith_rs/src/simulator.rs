use std::collections::{BTreeSet, VecDeque};

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, NaiveDateTime, Timelike};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::asset::Asset;
use crate::calendar::{weekday_index, DAYS_PER_WEEK};
use crate::config::Side;
use crate::currency::CurrencyConverter;
use crate::feature::{FeatureRecord, ReturnsDescriptor, ReturnsRecord};
use crate::stats::{mean, segment_scores, std_dev, ReturnSample, SegmentScores};

/// Most recent trades kept per weekday for the rolling Sharpe.
pub const WEEKDAY_WINDOW: usize = 35;
pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;
const HOURS_PER_YEAR: f64 = 365.25 * 24.0;

/// Converts tick deltas into USD cash P&L for one instrument.
#[derive(Clone, Copy, Debug)]
pub struct TradeModel<'a> {
    pub asset: &'a Asset,
    pub currencies: &'a CurrencyConverter,
    pub leverage: Option<f64>,
    /// Ignore spread and fees (buy-and-hold reference).
    pub frictionless: bool,
}

/// Result of pricing one signal.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Trade {
    /// USD P&L after costs and leverage.
    pub cash: Decimal,
    /// Unlevered P&L relative to the USD notional of one contract.
    pub percent: f64,
}

impl<'a> TradeModel<'a> {
    pub fn new(asset: &'a Asset, currencies: &'a CurrencyConverter, leverage: Option<f64>) -> Self {
        Self {
            asset,
            currencies,
            leverage,
            frictionless: false,
        }
    }

    /// Prices a trade on `side` entered at `timestamp`. `None` when the
    /// notional is not positive.
    pub fn price(&self, side: Side, timestamp: NaiveDateTime, returns: &ReturnsRecord) -> Result<Option<Trade>> {
        let spread = if self.frictionless { 0 } else { self.asset.spread };
        let delta = returns.ticks();
        let effective = match side {
            Side::Long => delta - spread,
            Side::Short => -(delta + spread),
        };
        let currency = &self.asset.currency;
        let gross = Decimal::from(effective) * self.asset.tick_value;
        let mut net = self.currencies.convert(gross, currency, timestamp)?;
        if !self.frictionless {
            net -= self.asset.fees();
        }
        let notional = Decimal::from(returns.close1) * self.asset.tick_value;
        let notional = self.currencies.convert(notional, currency, timestamp)?;
        if notional <= Decimal::ZERO {
            return Ok(None);
        }
        let percent = (net / notional)
            .to_f64()
            .ok_or_else(|| anyhow!("P&L ratio of {} is not representable", self.asset.symbol))?;
        let cash = match self.leverage {
            Some(leverage) => {
                let factor = Decimal::from_f64(leverage)
                    .ok_or_else(|| anyhow!("Invalid leverage {leverage}"))?;
                net * factor
            }
            None => net,
        };
        Ok(Some(Trade { cash, percent }))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct EquitySample {
    pub timestamp: NaiveDateTime,
    pub cash: Decimal,
}

/// Weekday ban behaviour of a simulation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WeekdayOptimization {
    pub threshold: f64,
}

/// Outcome of offering a signal to a simulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    WrongHour,
    Overlapping,
    NoLabel,
    NoNotional,
    BannedWeekday,
    /// The trade lost at least the whole notional; the simulation is disabled.
    TotalLoss,
    /// A previous total loss stopped the simulation.
    Disabled,
}

/// Equity curve and statistics of one (horizon, side, entry hour) result.
#[derive(Clone, Debug)]
pub struct Simulation {
    pub returns: &'static ReturnsDescriptor,
    pub side: Side,
    pub time_of_day: Option<u32>,
    pub weekday_optimization: Option<WeekdayOptimization>,
    pub enabled: bool,
    pub equity_curve: Vec<EquitySample>,
    pub samples: Vec<ReturnSample>,
    pub weekday_returns: [Vec<f64>; DAYS_PER_WEEK],
    recent_weekday_returns: [VecDeque<f64>; DAYS_PER_WEEK],
    pub banned_day: Option<usize>,
    pub cumulative_return: f64,
    pub cumulative_max: f64,
    pub drawdown_max: f64,
    pub trades: usize,
    pub trades_ratio: f64,
    pub scores: SegmentScores,
}

impl Simulation {
    pub fn new(returns: &'static ReturnsDescriptor, side: Side, time_of_day: Option<u32>) -> Self {
        Self {
            returns,
            side,
            time_of_day,
            weekday_optimization: None,
            enabled: true,
            equity_curve: Vec::new(),
            samples: Vec::new(),
            weekday_returns: Default::default(),
            recent_weekday_returns: Default::default(),
            banned_day: None,
            cumulative_return: 1.0,
            cumulative_max: 1.0,
            drawdown_max: 0.0,
            trades: 0,
            trades_ratio: 0.0,
            scores: SegmentScores::default(),
        }
    }

    pub fn with_weekday_optimization(mut self, optimization: Option<WeekdayOptimization>) -> Self {
        self.weekday_optimization = optimization;
        self
    }

    pub fn holding_hours(&self) -> i64 {
        self.returns.holding_hours
    }

    pub fn cash(&self) -> Decimal {
        self.equity_curve
            .last()
            .map(|sample| sample.cash)
            .unwrap_or(Decimal::ZERO)
    }

    /// Offers the matched record to the simulation and applies the trade if
    /// it is admitted.
    pub fn on_signal(&mut self, record: &FeatureRecord, model: &TradeModel<'_>) -> Result<Admission> {
        if !self.enabled {
            return Ok(Admission::Disabled);
        }
        let timestamp = record.timestamp;
        if self
            .time_of_day
            .is_some_and(|hour| timestamp.hour() != hour)
        {
            return Ok(Admission::WrongHour);
        }
        if let Some(last) = self.equity_curve.last() {
            if (timestamp - last.timestamp).num_hours() < self.holding_hours() {
                return Ok(Admission::Overlapping);
            }
        }
        let Some(returns) = self.returns.get(record) else {
            return Ok(Admission::NoLabel);
        };
        let Some(trade) = model
            .price(self.side, timestamp, returns)
            .with_context(|| format!("Failed to price {} signal at {timestamp}", model.asset.symbol))?
        else {
            return Ok(Admission::NoNotional);
        };
        // A compounded curve cannot recover from a loss of the full notional.
        if trade.percent <= -1.0 {
            self.enabled = false;
            return Ok(Admission::TotalLoss);
        }

        let weekday = weekday_index(timestamp);
        if let (Some(optimization), Some(weekday)) = (self.weekday_optimization, weekday) {
            let banned = self.banned_day;
            let recent = &mut self.recent_weekday_returns[weekday];
            recent.push_back(trade.percent);
            if recent.len() > WEEKDAY_WINDOW {
                recent.pop_front();
            }
            self.update_ban(optimization.threshold);
            if banned == Some(weekday) {
                return Ok(Admission::BannedWeekday);
            }
        }

        self.apply(timestamp, weekday, trade);
        Ok(Admission::Admitted)
    }

    fn apply(&mut self, timestamp: NaiveDateTime, weekday: Option<usize>, trade: Trade) {
        let cash = self.cash() + trade.cash;
        self.equity_curve.push(EquitySample { timestamp, cash });
        self.samples.push(ReturnSample {
            timestamp,
            percent: trade.percent,
        });
        if let Some(weekday) = weekday {
            self.weekday_returns[weekday].push(trade.percent);
        }
        self.trades += 1;
        self.cumulative_return *= 1.0 + trade.percent;
        self.cumulative_max = self.cumulative_max.max(self.cumulative_return);
        let drawdown = 1.0 - self.cumulative_return / self.cumulative_max;
        self.drawdown_max = self.drawdown_max.max(drawdown);
    }

    /// Bans the weekday with the weakest rolling Sharpe once every weekday
    /// has a full window, provided it is below `threshold`.
    fn update_ban(&mut self, threshold: f64) {
        if self
            .recent_weekday_returns
            .iter()
            .any(|recent| recent.len() < WEEKDAY_WINDOW)
        {
            return;
        }
        let worst = self
            .recent_weekday_returns
            .iter()
            .enumerate()
            .map(|(day, recent)| {
                let values: Vec<f64> = recent.iter().copied().collect();
                let sharpe = match (mean(&values), std_dev(&values)) {
                    (Some(mean), Some(std_dev)) if std_dev > 0.0 => mean / std_dev,
                    (Some(mean), _) => mean.signum() * f64::INFINITY,
                    _ => 0.0,
                };
                (day, sharpe)
            })
            .min_by(|a, b| a.1.total_cmp(&b.1));
        self.banned_day = match worst {
            Some((day, sharpe)) if sharpe < threshold => Some(day),
            _ => None,
        };
    }

    /// Distinct trade dates per expected trading day in the window.
    pub fn trade_date_ratio(&self, window_hours: f64) -> f64 {
        if window_hours <= 0.0 {
            return 0.0;
        }
        let dates: BTreeSet<NaiveDate> = self
            .samples
            .iter()
            .map(|sample| sample.timestamp.date())
            .collect();
        let years = window_hours / HOURS_PER_YEAR;
        dates.len() as f64 / (TRADING_DAYS_PER_YEAR * years)
    }

    /// Computes scores and the trades ratio. Per-trade samples are dropped
    /// unless `retain_samples` is set.
    pub fn finish(&mut self, window: (NaiveDateTime, NaiveDateTime), segments: usize, retain_samples: bool) {
        let window_hours = (window.1 - window.0).num_hours() as f64;
        self.trades_ratio = self.trade_date_ratio(window_hours);
        self.scores = segment_scores(&self.samples, segments);
        if !retain_samples {
            self.samples = Vec::new();
            self.equity_curve = Vec::new();
        }
    }

    pub fn weekday_means(&self) -> [Option<f64>; DAYS_PER_WEEK] {
        std::array::from_fn(|day| mean(&self.weekday_returns[day]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::parse_timestamp;
    use crate::feature::find_returns;
    use std::str::FromStr;

    fn es() -> Asset {
        serde_yaml::from_str(
            "symbol: ES\ntickSize: 0.25\ntickValue: 12.50\nspread: 1\nbrokerFee: 2.50\nexchangeFee: 1.00\n",
        )
        .unwrap()
    }

    fn record(raw: &str, close1: i64, close2: i64) -> FeatureRecord {
        let mut record = FeatureRecord::new(parse_timestamp(raw).unwrap());
        record.returns_24h = Some(ReturnsRecord {
            high: close1.max(close2),
            low: close1.min(close2),
            close1,
            close2,
        });
        record
    }

    fn simulation(side: Side) -> Simulation {
        Simulation::new(find_returns("returns24H").unwrap(), side, None)
    }

    #[test]
    fn long_trade_pays_spread_and_fees() -> Result<()> {
        let asset = es();
        let currencies = CurrencyConverter::default();
        let model = TradeModel::new(&asset, &currencies, None);
        let mut long = simulation(Side::Long);
        let admission = long.on_signal(&record("2024-01-09 10:00", 400, 406), &model)?;
        assert_eq!(admission, Admission::Admitted);
        assert_eq!(long.cash(), Decimal::from_str("59.00")?);
        assert!((long.samples[0].percent - 59.0 / 5000.0).abs() < 1e-12);
        assert_eq!(long.weekday_returns[1].len(), 1);
        Ok(())
    }

    #[test]
    fn short_trade_inverts_delta() -> Result<()> {
        let asset = es();
        let currencies = CurrencyConverter::default();
        let model = TradeModel::new(&asset, &currencies, None);
        let mut short = simulation(Side::Short);
        short.on_signal(&record("2024-01-09 10:00", 400, 406), &model)?;
        assert_eq!(short.cash(), Decimal::from_str("-91.00")?);
        assert!(short.cumulative_return < 1.0);
        assert!(short.drawdown_max > 0.0);
        Ok(())
    }

    #[test]
    fn leverage_scales_cash_only() -> Result<()> {
        let asset = es();
        let currencies = CurrencyConverter::default();
        let model = TradeModel::new(&asset, &currencies, Some(2.0));
        let mut long = simulation(Side::Long);
        long.on_signal(&record("2024-01-09 10:00", 400, 406), &model)?;
        assert_eq!(long.cash(), Decimal::from_str("118.00")?);
        assert!((long.samples[0].percent - 59.0 / 5000.0).abs() < 1e-12);
        Ok(())
    }

    fn euro_asset() -> Asset {
        serde_yaml::from_str(
            "symbol: FGBL\ncurrency: EUR\ntickSize: 0.01\ntickValue: 10\nspread: 1\n\
             brokerFee: 2.50\nexchangeFee: 1.00\n",
        )
        .unwrap()
    }

    fn euro_rates(rate: &str) -> Result<CurrencyConverter> {
        let mut currencies = CurrencyConverter::default();
        let mut closes = std::collections::BTreeMap::new();
        closes.insert(parse_timestamp("2024-01-09 08:00")?, Decimal::from_str(rate)?);
        currencies.insert("EUR", closes);
        Ok(currencies)
    }

    #[test]
    fn foreign_currency_trades_are_priced_in_usd() -> Result<()> {
        let asset = euro_asset();
        let currencies = euro_rates("1.10")?;
        let model = TradeModel::new(&asset, &currencies, None);
        let mut long = simulation(Side::Long);
        long.on_signal(&record("2024-01-09 10:00", 400, 406), &model)?;
        // 5 ticks of EUR 10 at 1.10, minus USD 3.50 fees.
        assert_eq!(long.cash(), Decimal::from_str("51.50")?);
        assert!((long.samples[0].percent - 51.5 / 4400.0).abs() < 1e-12);

        let label = ReturnsRecord {
            high: 406,
            low: 400,
            close1: 400,
            close2: 406,
        };
        let timestamp = parse_timestamp("2024-01-09 10:00")?;
        let mut percents = Vec::new();
        for rate in ["0.90", "1.25"] {
            let currencies = euro_rates(rate)?;
            let mut model = TradeModel::new(&asset, &currencies, None);
            model.frictionless = true;
            let trade = model.price(Side::Long, timestamp, &label)?.unwrap();
            percents.push(trade.percent);
        }
        assert!((percents[0] - 6.0 / 400.0).abs() < 1e-12);
        assert!((percents[0] - percents[1]).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn missing_fx_rate_fails_with_context() -> Result<()> {
        let asset = euro_asset();
        let currencies = euro_rates("1.10")?;
        let model = TradeModel::new(&asset, &currencies, None);
        let mut long = simulation(Side::Long);
        let err = long
            .on_signal(&record("2024-01-12 10:00", 400, 406), &model)
            .unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("Failed to price FGBL signal"), "{message}");
        assert!(message.contains("EURUSD"), "{message}");
        assert!(long.equity_curve.is_empty());

        let empty = CurrencyConverter::default();
        let model = TradeModel::new(&asset, &empty, None);
        let err = long
            .on_signal(&record("2024-01-09 10:00", 400, 406), &model)
            .unwrap_err();
        assert!(format!("{err:#}").contains("No FX rates loaded for currency EUR"));
        Ok(())
    }

    #[test]
    fn overlapping_and_off_hour_signals_are_rejected() -> Result<()> {
        let asset = es();
        let currencies = CurrencyConverter::default();
        let model = TradeModel::new(&asset, &currencies, None);
        let mut long = Simulation::new(find_returns("returns24H").unwrap(), Side::Long, Some(10));
        assert_eq!(
            long.on_signal(&record("2024-01-09 10:00", 400, 406), &model)?,
            Admission::Admitted
        );
        assert_eq!(
            long.on_signal(&record("2024-01-09 10:00", 400, 406), &model)?,
            Admission::Overlapping
        );
        assert_eq!(
            long.on_signal(&record("2024-01-10 09:00", 400, 406), &model)?,
            Admission::WrongHour
        );
        assert_eq!(
            long.on_signal(&record("2024-01-10 10:00", 400, 406), &model)?,
            Admission::Admitted
        );
        let mut missing = FeatureRecord::new(parse_timestamp("2024-01-12 10:00")?);
        missing.returns_4h = Some(ReturnsRecord {
            high: 1,
            low: 1,
            close1: 1,
            close2: 1,
        });
        assert_eq!(long.on_signal(&missing, &model)?, Admission::NoLabel);
        assert_eq!(long.trades, 2);
        Ok(())
    }

    #[test]
    fn curve_invariants_hold() -> Result<()> {
        let asset = es();
        let currencies = CurrencyConverter::default();
        let model = TradeModel::new(&asset, &currencies, None);
        let mut long = simulation(Side::Long);
        let start = parse_timestamp("2024-01-01 10:00")?;
        for day in 0..60i64 {
            let timestamp = start + chrono::Duration::days(day);
            if weekday_index(timestamp).is_none() {
                continue;
            }
            let delta = (day * 7919) % 23 - 11;
            let raw = timestamp.format("%Y-%m-%d %H:%M").to_string();
            long.on_signal(&record(&raw, 400, 400 + delta), &model)?;
            assert!(long.cumulative_max >= long.cumulative_return);
            assert!(long.cumulative_return >= 0.0);
            assert!((0.0..1.0).contains(&long.drawdown_max));
        }
        let times: Vec<_> = long.equity_curve.iter().map(|sample| sample.timestamp).collect();
        assert!(times.windows(2).all(|pair| (pair[1] - pair[0]).num_hours() >= 24));
        let end = start + chrono::Duration::days(60);
        long.finish((start, end), 3, false);
        assert!(long.trades_ratio > 0.0);
        assert!(long.samples.is_empty());
        Ok(())
    }

    #[test]
    fn total_loss_disables_the_simulation() -> Result<()> {
        let asset = es();
        let currencies = CurrencyConverter::default();
        let model = TradeModel::new(&asset, &currencies, None);
        let mut long = simulation(Side::Long);
        long.on_signal(&record("2024-01-08 10:00", 400, 404), &model)?;
        let drawdown = long.drawdown_max;

        // Three ticks lost against a notional of one tick.
        let admission = long.on_signal(&record("2024-01-09 10:00", 1, -1), &model)?;
        assert_eq!(admission, Admission::TotalLoss);
        assert!(!long.enabled);
        assert_eq!(long.trades, 1);
        assert_eq!(long.drawdown_max, drawdown);
        assert!((0.0..1.0).contains(&long.drawdown_max));
        assert!(long.cumulative_return > 0.0);

        let admission = long.on_signal(&record("2024-01-10 10:00", 400, 404), &model)?;
        assert_eq!(admission, Admission::Disabled);
        assert_eq!(long.trades, 1);
        Ok(())
    }

    #[test]
    fn weakest_weekday_gets_banned() -> Result<()> {
        let asset: Asset = serde_yaml::from_str("symbol: ES\ntickSize: 0.25\ntickValue: 12.5\n")?;
        let currencies = CurrencyConverter::default();
        let model = TradeModel::new(&asset, &currencies, None);
        let mut long = simulation(Side::Long)
            .with_weekday_optimization(Some(WeekdayOptimization { threshold: 0.0 }));
        let start = parse_timestamp("2024-01-01 10:00")?;
        let mut monday_trades_after_ban = 0;
        for day in 0..(7 * 40) {
            let timestamp = start + chrono::Duration::days(day);
            let Some(weekday) = weekday_index(timestamp) else {
                continue;
            };
            // Mondays lose, other days win, with some dispersion.
            let delta = if weekday == 0 { -4 - day % 3 } else { 4 + day % 3 };
            let raw = timestamp.format("%Y-%m-%d %H:%M").to_string();
            let admission = long.on_signal(&record(&raw, 400, 400 + delta), &model)?;
            if weekday == 0 && long.banned_day == Some(0) && admission == Admission::Admitted {
                monday_trades_after_ban += 1;
            }
        }
        assert_eq!(long.banned_day, Some(0));
        assert!(monday_trades_after_ban <= 1);
        assert!(long.weekday_returns[0].len() <= WEEKDAY_WINDOW + 1);
        Ok(())
    }
}
