use std::fmt;
use std::path::Path;
use std::time::Instant;

use anyhow::{anyhow, bail, Result};
use chrono::NaiveDate;
use rayon::prelude::*;
use tracing::info;

use crate::calendar::{format_date, start_of_day, years_before};
use crate::config::MiningConfig;
use crate::context::Context;
use crate::mining::{mine, StrategyResult};
use crate::progress::elapsed_ms;
use crate::stats::{compound_drawdown, compound_return, pearson, risk_adjusted_score, window, ReturnSample};

/// Length of the "recent" window preceding each split.
pub const RECENT_YEARS: i32 = 2;

/// Performance of one result inside a date window.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WindowMetrics {
    pub returns: f64,
    pub drawdown: f64,
    pub sharpe: f64,
}

impl WindowMetrics {
    pub fn measure(samples: &[ReturnSample], start: NaiveDate, end: NaiveDate) -> Self {
        let samples = window(samples, start_of_day(start), start_of_day(end));
        Self {
            returns: compound_return(samples),
            drawdown: compound_drawdown(samples),
            sharpe: risk_adjusted_score(samples),
        }
    }
}

/// In-sample, recent and out-of-sample metrics of one result at one split.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SplitSample {
    pub in_sample: WindowMetrics,
    pub recent: WindowMetrics,
    pub out_of_sample: WindowMetrics,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Metric {
    Returns,
    Drawdown,
    Sharpe,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Period {
    InSample,
    Recent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Predictor {
    pub metric: Metric,
    pub period: Period,
}

impl Predictor {
    pub const ALL: [Predictor; 6] = [
        Predictor::new(Metric::Returns, Period::InSample),
        Predictor::new(Metric::Drawdown, Period::InSample),
        Predictor::new(Metric::Sharpe, Period::InSample),
        Predictor::new(Metric::Returns, Period::Recent),
        Predictor::new(Metric::Drawdown, Period::Recent),
        Predictor::new(Metric::Sharpe, Period::Recent),
    ];

    pub const fn new(metric: Metric, period: Period) -> Self {
        Self { metric, period }
    }

    pub fn value(&self, sample: &SplitSample) -> f64 {
        let metrics = match self.period {
            Period::InSample => &sample.in_sample,
            Period::Recent => &sample.recent,
        };
        match self.metric {
            Metric::Returns => metrics.returns,
            Metric::Drawdown => metrics.drawdown,
            Metric::Sharpe => metrics.sharpe,
        }
    }

    /// Lower drawdowns rank first; every other metric ranks highest first.
    fn ascending(&self) -> bool {
        self.metric == Metric::Drawdown
    }
}

impl fmt::Display for Predictor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let metric = match self.metric {
            Metric::Returns => "Returns",
            Metric::Drawdown => "Max Drawdown",
            Metric::Sharpe => "Sharpe",
        };
        let period = match self.period {
            Period::InSample => "IS",
            Period::Recent => "recent",
        };
        write!(f, "{metric} ({period})")
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PredictorCorrelation {
    pub predictor: Predictor,
    /// Number of samples the coefficient was computed over.
    pub samples: usize,
    pub coefficient: Option<f64>,
}

/// Metrics of every enabled result for the split `[start, end)`.
pub fn split_samples(
    results: &[StrategyResult],
    date_min: NaiveDate,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<SplitSample>> {
    if date_min >= start || start >= end {
        bail!(
            "Invalid split (dateMin = {}, start = {}, end = {})",
            format_date(date_min),
            format_date(start),
            format_date(end)
        );
    }
    let recent_start = years_before(start, RECENT_YEARS).max(date_min);
    Ok(results
        .iter()
        .map(|result| SplitSample {
            in_sample: WindowMetrics::measure(&result.samples, date_min, start),
            recent: WindowMetrics::measure(&result.samples, recent_start, start),
            out_of_sample: WindowMetrics::measure(&result.samples, start, end),
        })
        .collect())
}

/// Correlates `predictor` with the OOS Sharpe over the best `ratio` of
/// samples, skipping samples whose in-sample drawdown exceeds
/// `drawdown_limit`.
pub fn correlate(
    samples: &[SplitSample],
    predictor: Predictor,
    ratio: f64,
    drawdown_limit: f64,
) -> PredictorCorrelation {
    let mut ranked: Vec<&SplitSample> = samples.iter().collect();
    ranked.sort_by(|a, b| {
        let ordering = predictor.value(b).total_cmp(&predictor.value(a));
        if predictor.ascending() {
            ordering.reverse()
        } else {
            ordering
        }
    });
    let limit = (ratio * samples.len() as f64) as usize;
    let (xs, ys): (Vec<f64>, Vec<f64>) = ranked
        .into_iter()
        .filter(|sample| sample.in_sample.drawdown <= drawdown_limit)
        .take(limit)
        .map(|sample| (predictor.value(sample), sample.out_of_sample.sharpe))
        .unzip();
    PredictorCorrelation {
        predictor,
        samples: xs.len(),
        coefficient: pearson(&xs, &ys),
    }
}

/// Every predictor's correlation, strongest (by absolute value) first.
pub fn rank_predictors(samples: &[SplitSample], ratio: f64, drawdown_limit: f64) -> Vec<PredictorCorrelation> {
    let mut correlations: Vec<PredictorCorrelation> = Predictor::ALL
        .iter()
        .map(|predictor| correlate(samples, *predictor, ratio, drawdown_limit))
        .collect();
    correlations.sort_by(|a, b| {
        let strength = |c: &PredictorCorrelation| c.coefficient.map_or(-1.0, f64::abs);
        strength(b).total_cmp(&strength(a))
    });
    correlations
}

/// Pools the split samples of every consecutive split pair.
pub fn pooled_samples(results: &[StrategyResult], config: &MiningConfig) -> Result<Vec<SplitSample>> {
    let date_min = config
        .date_min
        .ok_or_else(|| anyhow!("The OOS correlation study requires dateMin"))?;
    let per_split = config
        .correlation_splits
        .par_windows(2)
        .map(|pair| split_samples(results, date_min, pair[0], pair[1]))
        .collect::<Result<Vec<_>>>()?;
    Ok(per_split.into_iter().flatten().collect())
}

/// `oos-correlation` command.
pub fn oos_correlation(context: &Context, config_path: &Path) -> Result<Vec<PredictorCorrelation>> {
    let mut config = MiningConfig::load(config_path)?;
    if !config.is_correlation() {
        bail!("No correlationSplits defined in {}", config_path.display());
    }
    let last_split = config
        .correlation_splits
        .last()
        .copied()
        .ok_or_else(|| anyhow!("No correlationSplits defined"))?;
    if config.date_max.map_or(true, |date_max| date_max < last_split) {
        config.date_max = Some(last_split);
    }
    let ratio = config
        .strategy_ratio
        .ok_or_else(|| anyhow!("The OOS correlation study requires strategyRatio"))?;

    let (_, results) = mine(context, &config)?;
    let start = Instant::now();
    let samples = pooled_samples(&results, &config)?;
    let correlations = rank_predictors(&samples, ratio, config.drawdown);
    info!(
        results = results.len(),
        periods = config.correlation_splits.len() - 1,
        samples = samples.len(),
        elapsed_ms = elapsed_ms(start),
        "Correlated IS/OOS metrics"
    );
    for (index, correlation) in correlations.iter().enumerate() {
        info!(
            rank = index + 1,
            predictor = %correlation.predictor,
            samples = correlation.samples,
            coefficient = %correlation
                .coefficient
                .map_or_else(|| "-".to_string(), |value| format!("{value:.3}")),
            "Predictor of OOS RAR"
        );
    }
    Ok(correlations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn date(raw: &str) -> NaiveDate {
        crate::calendar::parse_date(raw).unwrap()
    }

    /// Daily samples from 2018 to 2021 with a per-result edge that carries
    /// over from the in-sample to the out-of-sample period.
    fn samples(edge: f64) -> Vec<ReturnSample> {
        let start = date("2018-01-01");
        (0..4 * 365)
            .map(|day| {
                let noise = ((day * 7919) % 13) as f64 / 1000.0 - 0.006;
                ReturnSample {
                    timestamp: start_of_day(start + Duration::days(day)) + Duration::hours(16),
                    percent: edge + noise,
                }
            })
            .collect()
    }

    fn split_sample(is_sharpe: f64, oos_sharpe: f64, is_drawdown: f64) -> SplitSample {
        let metrics = |sharpe, drawdown| WindowMetrics {
            returns: sharpe / 10.0,
            drawdown,
            sharpe,
        };
        SplitSample {
            in_sample: metrics(is_sharpe, is_drawdown),
            recent: metrics(is_sharpe, is_drawdown),
            out_of_sample: metrics(oos_sharpe, 0.0),
        }
    }

    #[test]
    fn windows_partition_the_samples() -> Result<()> {
        let mut result = samples(0.001);
        result.truncate(3 * 365);
        let split = split_samples(&[], date("2018-01-01"), date("2020-01-01"), date("2021-01-01"))?;
        assert!(split.is_empty());

        let metrics = WindowMetrics::measure(&result, date("2020-01-01"), date("2021-01-01"));
        assert!(metrics.returns > 0.0);
        assert!(metrics.drawdown >= 0.0 && metrics.drawdown < 1.0);
        assert!(split_samples(&[], date("2020-01-01"), date("2020-01-01"), date("2021-01-01")).is_err());
        Ok(())
    }

    #[test]
    fn in_sample_sharpe_predicts_oos_sharpe() {
        let pooled: Vec<SplitSample> = (0..20)
            .map(|index| {
                let sharpe = index as f64 / 10.0;
                split_sample(sharpe, sharpe * 0.8 + 0.1, 0.1)
            })
            .collect();
        let correlation = correlate(&pooled, Predictor::new(Metric::Sharpe, Period::InSample), 0.5, 0.5);
        assert_eq!(correlation.samples, 10);
        assert!(correlation.coefficient.unwrap() > 0.99);

        let ranked = rank_predictors(&pooled, 0.5, 0.5);
        assert_eq!(ranked.len(), Predictor::ALL.len());
        // Constant drawdowns have no coefficient and sort last.
        assert_eq!(ranked.last().unwrap().coefficient, None);
    }

    #[test]
    fn excessive_in_sample_drawdowns_are_skipped() {
        let pooled = vec![
            split_sample(3.0, -1.0, 0.9),
            split_sample(2.0, 2.0, 0.1),
            split_sample(1.0, 1.0, 0.1),
            split_sample(0.5, 0.5, 0.1),
        ];
        let correlation = correlate(&pooled, Predictor::new(Metric::Sharpe, Period::InSample), 1.0, 0.5);
        assert_eq!(correlation.samples, 3);
        assert!(correlation.coefficient.unwrap() > 0.99);
        assert_eq!(Predictor::ALL[1].to_string(), "Max Drawdown (IS)");
    }
}
