use std::path::PathBuf;
use std::time::Instant;

use ahash::AHashMap;
use anyhow::{Context as _, Result};
use chrono::{NaiveDate, NaiveDateTime, Timelike};
use rayon::prelude::*;
use tracing::info;

use crate::archive::{archive_path, read_archive};
use crate::asset::{split_stream_symbol, Asset};
use crate::context::Context;
use crate::feature::{DailyRecord, FeatureRecord};
use crate::progress::elapsed_ms;

/// Date and time-of-day bounds applied while loading an archive.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RecordFilter {
    pub date_min: Option<NaiveDate>,
    /// Exclusive.
    pub date_max: Option<NaiveDate>,
    pub time_min: Option<u32>,
    pub time_max: Option<u32>,
}

impl RecordFilter {
    pub fn between(date_min: NaiveDate, date_max: NaiveDate) -> Self {
        Self {
            date_min: Some(date_min),
            date_max: Some(date_max),
            ..Self::default()
        }
    }

    fn hour_allowed(&self, timestamp: NaiveDateTime) -> bool {
        let hour = timestamp.hour();
        self.time_min.map_or(true, |min| hour >= min) && self.time_max.map_or(true, |max| hour <= max)
    }

    /// Keeps the records of `[date_min, date_max)` whose hour lies in
    /// `[time_min, time_max]`. Input must be ascending.
    pub fn apply(&self, records: Vec<FeatureRecord>) -> Vec<FeatureRecord> {
        let mut output = Vec::with_capacity(records.len());
        for record in records {
            let date = record.timestamp.date();
            if self.date_min.is_some_and(|min| date < min) {
                continue;
            }
            if self.date_max.is_some_and(|max| date >= max) {
                break;
            }
            if self.hour_allowed(record.timestamp) {
                output.push(record);
            }
        }
        output
    }
}

/// Archive contents of one stream indexed by timestamp.
#[derive(Debug, Clone)]
pub struct AssetRecords {
    pub asset: Asset,
    pub daily_records: Vec<DailyRecord>,
    pub records: Vec<FeatureRecord>,
    by_timestamp: AHashMap<NaiveDateTime, usize>,
}

impl AssetRecords {
    pub fn new(asset: Asset, daily_records: Vec<DailyRecord>, records: Vec<FeatureRecord>) -> Self {
        let by_timestamp = records
            .iter()
            .enumerate()
            .map(|(index, record)| (record.timestamp, index))
            .collect();
        Self {
            asset,
            daily_records,
            records,
            by_timestamp,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.asset.symbol
    }

    pub fn get(&self, timestamp: NaiveDateTime) -> Option<&FeatureRecord> {
        self.by_timestamp
            .get(&timestamp)
            .and_then(|&index| self.records.get(index))
    }

    pub fn first_timestamp(&self) -> Option<NaiveDateTime> {
        self.records.first().map(|record| record.timestamp)
    }

    pub fn last_timestamp(&self) -> Option<NaiveDateTime> {
        self.records.last().map(|record| record.timestamp)
    }
}

/// Archive file backing `symbol` (`ES` or `ES.F2`).
pub fn stream_archive_path(context: &Context, symbol: &str) -> Result<(Asset, PathBuf)> {
    let (asset, f_number) = context.stream(symbol)?;
    let (base, _) = split_stream_symbol(&asset.symbol)?;
    let path = archive_path(&context.configuration.archive_path, base, f_number);
    Ok((asset, path))
}

pub fn load_asset_records(context: &Context, symbol: &str, filter: &RecordFilter) -> Result<AssetRecords> {
    let (asset, path) = stream_archive_path(context, symbol)?;
    let archive = read_archive(&path).with_context(|| format!("Unable to load records of {symbol}"))?;
    let records = filter.apply(archive.intraday_records);
    Ok(AssetRecords::new(asset, archive.daily_records, records))
}

/// Loads several streams in parallel, preserving the order of `symbols`.
pub fn load_records(context: &Context, symbols: &[String], filter: &RecordFilter) -> Result<Vec<AssetRecords>> {
    let start = Instant::now();
    let loaded = symbols
        .par_iter()
        .map(|symbol| load_asset_records(context, symbol, filter))
        .collect::<Result<Vec<_>>>()?;
    let records: usize = loaded.iter().map(|asset| asset.records.len()).sum();
    info!(
        assets = loaded.len(),
        records,
        elapsed_ms = elapsed_ms(start),
        "Loaded archive records"
    );
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::parse_timestamp;

    fn records(raw: &[&str]) -> Vec<FeatureRecord> {
        raw.iter()
            .map(|raw| FeatureRecord::new(parse_timestamp(raw).unwrap()))
            .collect()
    }

    #[test]
    fn filter_bounds_dates_and_hours() {
        let filter = RecordFilter {
            date_min: NaiveDate::from_ymd_opt(2024, 1, 2),
            date_max: NaiveDate::from_ymd_opt(2024, 1, 4),
            time_min: Some(9),
            time_max: Some(16),
        };
        let kept = filter.apply(records(&[
            "2024-01-01 10:00",
            "2024-01-02 08:00",
            "2024-01-02 09:00",
            "2024-01-03 16:00",
            "2024-01-03 17:00",
            "2024-01-04 10:00",
        ]));
        let kept: Vec<String> = kept
            .iter()
            .map(|record| record.timestamp.format("%Y-%m-%d %H:%M").to_string())
            .collect();
        assert_eq!(kept, vec!["2024-01-02 09:00", "2024-01-03 16:00"]);
    }

    #[test]
    fn lookup_by_timestamp() {
        let asset: Asset = serde_yaml::from_str("symbol: ES\ntickSize: 0.25\ntickValue: 12.5\n").unwrap();
        let loaded = AssetRecords::new(asset, Vec::new(), records(&["2024-01-02 09:00", "2024-01-02 10:00"]));
        let probe = parse_timestamp("2024-01-02 10:00").unwrap();
        assert_eq!(loaded.get(probe).map(|record| record.timestamp), Some(probe));
        assert!(loaded.get(parse_timestamp("2024-01-02 11:00").unwrap()).is_none());
        assert_eq!(loaded.symbol(), "ES");
    }
}
