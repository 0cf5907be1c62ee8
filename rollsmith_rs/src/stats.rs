use chrono::{Datelike, NaiveDateTime};
use serde::Serialize;

use crate::calendar::month_ordinal;

pub const MONTHS_PER_YEAR: f64 = 12.0;

/// Fractional return of one admitted trade.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ReturnSample {
    pub timestamp: NaiveDateTime,
    pub percent: f64,
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample standard deviation (divisor `n - 1`).
pub fn std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let mean = mean(values)?;
    let sum_sq: f64 = values.iter().map(|value| (value - mean).powi(2)).sum();
    Some((sum_sq / (values.len() - 1) as f64).sqrt())
}

/// Pearson correlation coefficient; `None` for fewer than two pairs or a
/// constant series.
pub fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    if xs.len() != ys.len() || xs.len() < 2 {
        return None;
    }
    let mean_x = mean(xs)?;
    let mean_y = mean(ys)?;
    let mut covariance = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        let dx = x - mean_x;
        let dy = y - mean_y;
        covariance += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    let denominator = (var_x * var_y).sqrt();
    if denominator <= f64::EPSILON {
        return None;
    }
    Some(covariance / denominator)
}

/// Compounded return per calendar month from the first to the last sample's
/// month. Months without trades contribute 0.
pub fn monthly_returns(samples: &[ReturnSample]) -> Vec<f64> {
    let (Some(first), Some(last)) = (samples.first(), samples.last()) else {
        return Vec::new();
    };
    let first_month = month_ordinal(first.timestamp.date());
    let last_month = month_ordinal(last.timestamp.date());
    if last_month < first_month {
        return Vec::new();
    }
    let mut factors = vec![1.0; (last_month - first_month + 1) as usize];
    for sample in samples {
        let slot = (month_ordinal(sample.timestamp.date()) - first_month) as usize;
        if let Some(factor) = factors.get_mut(slot) {
            *factor *= 1.0 + sample.percent;
        }
    }
    factors.into_iter().map(|factor| factor - 1.0).collect()
}

/// Annualized Sharpe-style ratio of monthly returns. Zero with fewer than
/// two months or without dispersion.
pub fn risk_adjusted_score(samples: &[ReturnSample]) -> f64 {
    let monthly = monthly_returns(samples);
    match (mean(&monthly), std_dev(&monthly)) {
        (Some(mean), Some(std_dev)) if std_dev > 0.0 => mean / std_dev * MONTHS_PER_YEAR.sqrt(),
        _ => 0.0,
    }
}

/// Risk-adjusted scores over the whole sample list, the weakest segment and
/// the most recent segment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentScores {
    pub overall: f64,
    pub min: f64,
    pub recent: f64,
}

/// Splits into `segments` equal parts; the last part absorbs the remainder.
/// Fewer samples than segments collapse into a single segment.
pub fn split_segments(samples: &[ReturnSample], segments: usize) -> Vec<&[ReturnSample]> {
    let segments = segments.max(1);
    let size = samples.len() / segments;
    if size == 0 {
        return vec![samples];
    }
    let mut parts = Vec::with_capacity(segments);
    for index in 0..segments {
        let start = index * size;
        let end = if index + 1 == segments {
            samples.len()
        } else {
            start + size
        };
        parts.push(&samples[start..end]);
    }
    parts
}

pub fn segment_scores(samples: &[ReturnSample], segments: usize) -> SegmentScores {
    let overall = risk_adjusted_score(samples);
    let scores: Vec<f64> = split_segments(samples, segments)
        .into_iter()
        .map(risk_adjusted_score)
        .collect();
    SegmentScores {
        overall,
        min: scores.iter().copied().fold(f64::INFINITY, f64::min),
        recent: scores.last().copied().unwrap_or(overall),
    }
}

/// Product of `1 + percent` minus one.
pub fn compound_return(samples: &[ReturnSample]) -> f64 {
    samples
        .iter()
        .fold(1.0, |acc, sample| acc * (1.0 + sample.percent))
        - 1.0
}

/// Largest peak-to-trough decline of the compounded curve. Stays below one
/// as long as every percent is above -1, which the simulator enforces.
pub fn compound_drawdown(samples: &[ReturnSample]) -> f64 {
    let mut cumulative = 1.0f64;
    let mut peak = 1.0f64;
    let mut drawdown = 0.0f64;
    for sample in samples {
        cumulative *= 1.0 + sample.percent;
        peak = peak.max(cumulative);
        drawdown = drawdown.max(1.0 - cumulative / peak);
    }
    drawdown
}

/// Samples whose timestamps fall in `[start, end)`.
pub fn window(samples: &[ReturnSample], start: NaiveDateTime, end: NaiveDateTime) -> &[ReturnSample] {
    let from = samples.partition_point(|sample| sample.timestamp < start);
    let to = samples.partition_point(|sample| sample.timestamp < end);
    &samples[from..to.max(from)]
}

/// Distinct years in `[first_year, last_year]` without any sample.
pub fn years_without_samples(samples: &[ReturnSample], first_year: i32, last_year: i32) -> Vec<i32> {
    (first_year..=last_year)
        .filter(|year| !samples.iter().any(|sample| sample.timestamp.year() == *year))
        .collect()
}

pub const HISTOGRAM_BINS: usize = 20;

/// Descriptive statistics of one scalar series.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptive {
    pub count: usize,
    pub nulls: usize,
    pub null_ratio: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
    /// Equal-width counts over `[min, max]`.
    pub histogram: Vec<usize>,
}

pub fn describe(values: &[f64], nulls: usize) -> Option<Descriptive> {
    let mean = mean(values)?;
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let total = values.len() + nulls;
    Some(Descriptive {
        count: values.len(),
        nulls,
        null_ratio: nulls as f64 / total as f64,
        min,
        max,
        mean,
        std_dev: std_dev(values).unwrap_or(0.0),
        histogram: histogram(values, min, max, HISTOGRAM_BINS),
    })
}

pub fn histogram(values: &[f64], min: f64, max: f64, bins: usize) -> Vec<usize> {
    let mut counts = vec![0usize; bins];
    if bins == 0 {
        return counts;
    }
    let width = (max - min) / bins as f64;
    for value in values {
        let slot = if width > 0.0 {
            (((value - min) / width) as usize).min(bins - 1)
        } else {
            0
        };
        counts[slot] += 1;
    }
    counts
}
