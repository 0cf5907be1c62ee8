use std::path::Path;

use anyhow::{anyhow, Context as _, Result};
use rayon::prelude::*;
use serde::Serialize;
use tracing::info;

use crate::archive::{read_archive, Archive};
use crate::context::Context;
use crate::feature::{FEATURES, RETURNS};
use crate::records::stream_archive_path;
use crate::stats::{describe, Descriptive};

/// Minimum number of values a scalar needs before it is analyzed.
pub const ARCHIVE_MIN_NON_NULL_VALUES: usize = 1000;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalarAnalysis {
    pub name: String,
    #[serde(flatten)]
    pub stats: Descriptive,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveAnalysis {
    pub symbol: String,
    pub daily_records: usize,
    pub intraday_records: usize,
    pub features: Vec<ScalarAnalysis>,
    /// Tick deltas (`close2 - close1`) of each returns horizon.
    pub returns: Vec<ScalarAnalysis>,
}

fn analyze_scalar(name: &str, values: Vec<Option<f64>>) -> Result<ScalarAnalysis> {
    let nulls = values.iter().filter(|value| value.is_none()).count();
    let present: Vec<f64> = values.into_iter().flatten().collect();
    if present.len() < ARCHIVE_MIN_NON_NULL_VALUES {
        return Err(anyhow!(
            "Not enough values for {name}: {} non-null, {ARCHIVE_MIN_NON_NULL_VALUES} required",
            present.len()
        ));
    }
    let stats = describe(&present, nulls).ok_or_else(|| anyhow!("No values for {name}"))?;
    Ok(ScalarAnalysis {
        name: name.to_string(),
        stats,
    })
}

pub fn analyze_archive(archive: &Archive) -> Result<ArchiveAnalysis> {
    let records = &archive.intraday_records;
    let features = FEATURES
        .par_iter()
        .map(|feature| {
            let values = records.iter().map(|record| feature.get(record)).collect();
            analyze_scalar(feature.name, values)
        })
        .collect::<Result<Vec<_>>>()?;
    let returns = RETURNS
        .par_iter()
        .map(|returns| {
            let values = records
                .iter()
                .map(|record| returns.get(record).map(|label| label.ticks() as f64))
                .collect();
            analyze_scalar(returns.name, values)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(ArchiveAnalysis {
        symbol: archive.symbol.clone(),
        daily_records: archive.daily_records.len(),
        intraday_records: records.len(),
        features,
        returns,
    })
}

/// Analyzes the archive of `symbol` and optionally writes the result as JSON.
pub fn analyze_symbol(context: &Context, symbol: &str, output: Option<&Path>) -> Result<ArchiveAnalysis> {
    let (_, path) = stream_archive_path(context, symbol)?;
    let archive = read_archive(&path)?;
    let analysis =
        analyze_archive(&archive).with_context(|| format!("Failed to analyze {}", path.display()))?;
    for scalar in analysis.features.iter().chain(&analysis.returns) {
        let stats = &scalar.stats;
        info!(
            name = %scalar.name,
            count = stats.count,
            null_ratio = %format!("{:.3}", stats.null_ratio),
            min = stats.min,
            max = stats.max,
            mean = stats.mean,
            std_dev = stats.std_dev,
            "Scalar statistics"
        );
    }
    if let Some(output) = output {
        let file = std::fs::File::create(output)
            .with_context(|| format!("Failed to create {}", output.display()))?;
        serde_json::to_writer_pretty(file, &analysis)
            .with_context(|| format!("Failed to write {}", output.display()))?;
        info!(path = %output.display(), "Wrote analysis");
    }
    Ok(analysis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::{FeatureRecord, ReturnsRecord};
    use chrono::{Duration, NaiveDate};

    fn archive(len: usize) -> Archive {
        let start = NaiveDate::from_ymd_opt(2020, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let intraday_records = (0..len)
            .map(|index| {
                let mut record = FeatureRecord::new(start + Duration::hours(index as i64));
                let value = (index % 100) as f64 / 100.0;
                for feature in FEATURES.iter() {
                    *record.feature_mut(feature.field) = Some(value);
                }
                for returns in RETURNS.iter() {
                    *record.returns_mut(returns.field) = Some(ReturnsRecord {
                        high: 10,
                        low: -10,
                        close1: 0,
                        close2: (index % 7) as i64 - 3,
                    });
                }
                if index % 4 == 0 {
                    record.momentum_10d = None;
                }
                record
            })
            .collect();
        Archive {
            symbol: "ES".to_string(),
            daily_records: Vec::new(),
            intraday_records,
        }
    }

    #[test]
    fn summarizes_features_and_returns() -> Result<()> {
        let analysis = analyze_archive(&archive(1400))?;
        assert_eq!(analysis.features.len(), FEATURES.len());
        assert_eq!(analysis.returns.len(), RETURNS.len());
        let ten_day = analysis
            .features
            .iter()
            .find(|scalar| scalar.name == "momentum10D")
            .unwrap();
        assert_eq!(ten_day.stats.nulls, 350);
        assert!((ten_day.stats.null_ratio - 0.25).abs() < 1e-12);
        let returns = &analysis.returns[0].stats;
        assert_eq!((returns.min, returns.max), (-3.0, 3.0));
        Ok(())
    }

    #[test]
    fn short_histories_fail() {
        let err = analyze_archive(&archive(999)).unwrap_err();
        assert!(err.to_string().contains("Not enough values"));
    }
}
