use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ahash::AHashMap;
use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use polars::prelude::*;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::asset::Asset;
use crate::calendar::{parse_date, parse_timestamp};
use crate::contract::GlobexCode;

pub const DAILY_COLUMNS: [&str; 4] = ["symbol", "time", "close", "open_interest"];
pub const HOURLY_COLUMNS: [&str; 3] = ["symbol", "time", "close"];
pub const FX_COLUMNS: [&str; 2] = ["time", "close"];

/// One vendor daily bar of a single contract.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyRow {
    pub contract: GlobexCode,
    pub date: NaiveDate,
    pub close: Decimal,
    pub open_interest: i64,
}

/// Raw CSV loaded with every column kept as text so that numeric and date
/// parsing errors surface with the offending value.
pub struct TextTable {
    path: PathBuf,
    frame: DataFrame,
}

impl TextTable {
    pub fn load(path: &Path, required: &[&str]) -> Result<Self> {
        let frame = LazyCsvReader::new(path)
            .with_has_header(true)
            .with_infer_schema_length(Some(0))
            .finish()
            .with_context(|| format!("Failed to initialize CSV reader for {}", path.display()))?
            .collect()
            .with_context(|| format!("Failed to read CSV file {}", path.display()))?;
        for column in required {
            if frame.column(column).is_err() {
                return Err(anyhow!(
                    "Missing column \"{column}\" in CSV file ({})",
                    path.display()
                ));
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            frame,
        })
    }

    pub fn height(&self) -> usize {
        self.frame.height()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn column(&self, name: &str) -> Result<&StringChunked> {
        self.frame
            .column(name)
            .with_context(|| format!("Missing column '{name}' in {}", self.path.display()))?
            .str()
            .with_context(|| format!("Column '{name}' in {} is not text", self.path.display()))
    }

    /// Value at (`column`, `row`); empty cells are an error.
    pub fn cell<'a>(&self, column: &'a StringChunked, name: &str, row: usize) -> Result<&'a str> {
        column.get(row).ok_or_else(|| {
            anyhow!(
                "Empty '{name}' value in row {} of {}",
                row + 1,
                self.path.display()
            )
        })
    }
}

pub fn parse_decimal(raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw.trim()).with_context(|| format!("Failed to parse decimal value \"{raw}\""))
}

pub fn raw_csv_path(raw_data_path: &Path, asset: &Asset, suffix: &str) -> PathBuf {
    raw_data_path.join(format!("{}.{suffix}.csv", asset.vendor_symbol()))
}

/// Daily rows that passed the cutoff and roll filters, plus counters.
#[derive(Debug, Default)]
pub struct DailyRows {
    pub rows: Vec<DailyRow>,
    pub included: usize,
    pub excluded: usize,
}

impl DailyRows {
    pub fn exclusion_ratio(&self) -> f64 {
        let total = self.included + self.excluded;
        if total == 0 {
            0.0
        } else {
            self.excluded as f64 / total as f64
        }
    }
}

pub fn read_daily_rows(path: &Path, asset: &Asset, cutoff: Option<NaiveDate>) -> Result<DailyRows> {
    let table = TextTable::load(path, &DAILY_COLUMNS)?;
    let symbols = table.column("symbol")?;
    let times = table.column("time")?;
    let closes = table.column("close")?;
    let open_interests = table.column("open_interest")?;
    let mut output = DailyRows::default();
    for row in 0..table.height() {
        let context = || format!("Row {} of {}", row + 1, path.display());
        let contract = GlobexCode::parse(table.cell(symbols, "symbol", row)?).with_context(context)?;
        let date = parse_date(table.cell(times, "time", row)?).with_context(context)?;
        if cutoff.is_some_and(|cutoff| date < cutoff) || !asset.include_record(date, &contract)? {
            output.excluded += 1;
            continue;
        }
        let close = parse_decimal(table.cell(closes, "close", row)?).with_context(context)?;
        let raw_interest = table.cell(open_interests, "open_interest", row)?;
        let open_interest: i64 = raw_interest.trim().parse().with_context(|| {
            format!(
                "Failed to parse open interest value \"{raw_interest}\" in row {} of {}",
                row + 1,
                path.display()
            )
        })?;
        output.rows.push(DailyRow {
            contract,
            date,
            close,
            open_interest,
        });
        output.included += 1;
    }
    debug!(
        path = %path.display(),
        included = output.included,
        excluded = output.excluded,
        "Read daily rows"
    );
    Ok(output)
}

/// Hourly closes per contract together with the sorted set of distinct
/// timestamps across all contracts.
#[derive(Debug, Default, Clone)]
pub struct HourlyTable {
    closes: AHashMap<GlobexCode, BTreeMap<NaiveDateTime, Decimal>>,
    timestamps: BTreeSet<NaiveDateTime>,
    len: usize,
}

impl HourlyTable {
    pub fn insert(&mut self, contract: GlobexCode, timestamp: NaiveDateTime, close: Decimal) {
        self.timestamps.insert(timestamp);
        if self
            .closes
            .entry(contract)
            .or_default()
            .insert(timestamp, close)
            .is_none()
        {
            self.len += 1;
        }
    }

    pub fn close(&self, contract: &GlobexCode, timestamp: NaiveDateTime) -> Option<Decimal> {
        self.closes.get(contract)?.get(&timestamp).copied()
    }

    /// Highest and lowest close of `contract` strictly after `start` up to
    /// and including `end`.
    pub fn close_extremes(
        &self,
        contract: &GlobexCode,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Option<(Decimal, Decimal)> {
        if start >= end {
            return None;
        }
        self.closes
            .get(contract)?
            .range((Bound::Excluded(start), Bound::Included(end)))
            .map(|(_, close)| *close)
            .fold(None, |extremes, close| match extremes {
                None => Some((close, close)),
                Some((high, low)) => Some((high.max(close), low.min(close))),
            })
    }

    pub fn timestamps(&self) -> impl Iterator<Item = NaiveDateTime> + '_ {
        self.timestamps.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

pub fn read_hourly_table(path: &Path, asset: &Asset, cutoff: Option<NaiveDate>) -> Result<HourlyTable> {
    let table = TextTable::load(path, &HOURLY_COLUMNS)?;
    let symbols = table.column("symbol")?;
    let times = table.column("time")?;
    let closes = table.column("close")?;
    let mut hourly = HourlyTable::default();
    let mut dropped = 0usize;
    for row in 0..table.height() {
        let context = || format!("Row {} of {}", row + 1, path.display());
        let contract = GlobexCode::parse(table.cell(symbols, "symbol", row)?).with_context(context)?;
        let timestamp = parse_timestamp(table.cell(times, "time", row)?).with_context(context)?;
        if cutoff.is_some_and(|cutoff| timestamp.date() < cutoff)
            || asset.exclude_records.contains(&timestamp)
        {
            dropped += 1;
            continue;
        }
        let close = parse_decimal(table.cell(closes, "close", row)?).with_context(context)?;
        hourly.insert(contract, timestamp, close);
    }
    debug!(path = %path.display(), rows = hourly.len(), dropped, "Read hourly rows");
    Ok(hourly)
}

/// Hourly FX closes for one currency against USD.
pub fn read_fx_closes(path: &Path) -> Result<BTreeMap<NaiveDateTime, Decimal>> {
    let table = TextTable::load(path, &FX_COLUMNS)?;
    let times = table.column("time")?;
    let closes = table.column("close")?;
    let mut output = BTreeMap::new();
    for row in 0..table.height() {
        let context = || format!("Row {} of {}", row + 1, path.display());
        let timestamp = parse_timestamp(table.cell(times, "time", row)?).with_context(context)?;
        let close = parse_decimal(table.cell(closes, "close", row)?).with_context(context)?;
        output.insert(timestamp, close);
    }
    info!(path = %table.path().display(), rows = output.len(), "Loaded FX closes");
    Ok(output)
}
