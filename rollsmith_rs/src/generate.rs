use std::path::PathBuf;
use std::time::Instant;

use anyhow::{anyhow, bail, Context as _, Result};
use rayon::prelude::*;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{debug, info, warn};

use crate::archive::{archive_path, write_archive, Archive};
use crate::asset::{find_asset, Asset};
use crate::calendar::business_hours_adjust;
use crate::config::Configuration;
use crate::context::Context;
use crate::data::{raw_csv_path, read_daily_rows, read_hourly_table, HourlyTable};
use crate::feature::{FeatureRecord, ReturnsRecord, FEATURES, RETURNS};
use crate::progress::{elapsed_ms, ProgressTracker};
use crate::quantile::{quantile_transform, QuantileSettings};
use crate::roller::{group_by_date, roll, RollResult};

/// Largest plausible label move in ticks; anything beyond is a bad close.
pub const RETURNS_LIMIT: i64 = 100_000;

/// `(a - b) / b`, absent when the base is not positive or `a` is negative.
pub fn rate_of_change(a: Decimal, b: Decimal) -> Option<f64> {
    if b <= Decimal::ZERO || a < Decimal::ZERO {
        return None;
    }
    ((a - b) / b).to_f64()
}

/// Price expressed in whole ticks, rounding halves away from zero.
pub fn price_to_ticks(price: Decimal, tick_size: Decimal) -> Result<i64> {
    if tick_size <= Decimal::ZERO {
        return Err(anyhow!("Tick size must be positive, got {tick_size}"));
    }
    (price / tick_size)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| anyhow!("Price {price} does not fit into a tick count"))
}

/// Walks every hourly timestamp in ascending order and derives momentum
/// features and forward-return labels on the contract mapped to its date.
pub fn generate_records(
    rolled: &RollResult,
    hourly: &HourlyTable,
    asset: &Asset,
) -> Result<Vec<FeatureRecord>> {
    let mut records = Vec::new();
    let mut unmapped = 0usize;
    for timestamp in hourly.timestamps() {
        let Some(contract) = rolled.contract_on(timestamp.date()) else {
            unmapped += 1;
            continue;
        };
        let Some(price) = hourly.close(contract, timestamp) else {
            continue;
        };
        let mut record = FeatureRecord::new(timestamp);

        for feature in FEATURES.iter() {
            let base_time = business_hours_adjust(timestamp, -feature.offset_hours);
            let close_time = if feature.lag_hours > 0 {
                business_hours_adjust(timestamp, -feature.lag_hours)
            } else {
                timestamp
            };
            let momentum = match (
                hourly.close(contract, close_time),
                hourly.close(contract, base_time),
            ) {
                (Some(close), Some(base)) => rate_of_change(close, base),
                _ => None,
            };
            *record.feature_mut(feature.field) = momentum;
        }

        for returns in RETURNS.iter() {
            let exit_time = business_hours_adjust(timestamp, returns.holding_hours);
            let Some(exit) = hourly.close(contract, exit_time) else {
                continue;
            };
            let (high, low) = hourly
                .close_extremes(contract, timestamp, exit_time)
                .unwrap_or((exit, exit));
            let ticks = |value: Decimal| {
                price_to_ticks(value, asset.tick_size).with_context(|| {
                    format!("Invalid {} close for {} at {timestamp}", returns.name, asset.symbol)
                })
            };
            let label = ReturnsRecord {
                high: ticks(high)?,
                low: ticks(low)?,
                close1: ticks(price)?,
                close2: ticks(exit)?,
            };
            if label.ticks().abs() > RETURNS_LIMIT {
                bail!(
                    "Excessive {} label for {}: {} ticks from {timestamp} ({price}) to {exit_time} ({exit})",
                    returns.name,
                    asset.symbol,
                    label.ticks()
                );
            }
            *record.returns_mut(returns.field) = Some(label);
        }

        if !record.is_empty() {
            records.push(record);
        }
    }
    if unmapped > 0 {
        debug!(
            symbol = %asset.symbol,
            unmapped,
            "Skipped hourly timestamps without a daily counterpart"
        );
    }
    Ok(records)
}

/// Outcome of writing one stream archive.
#[derive(Debug, Clone)]
pub struct StreamSummary {
    pub symbol: String,
    pub path: PathBuf,
    pub daily_records: usize,
    pub intraday_records: usize,
    pub bytes: u64,
}

fn quantile_settings(configuration: &Configuration) -> Option<QuantileSettings> {
    configuration.quantile_transform.then_some(QuantileSettings {
        buffer_size: configuration.quantile_buffer_size,
        stride: configuration.quantile_stride,
    })
}

/// Builds the F1..Fn archives of one asset. Existing archives are kept
/// unless `overwrite` is set.
pub fn build_asset_archives(
    configuration: &Configuration,
    asset: &Asset,
    overwrite: bool,
) -> Result<Vec<StreamSummary>> {
    let first_path = archive_path(&configuration.archive_path, &asset.symbol, 1);
    if !overwrite && first_path.exists() {
        info!(symbol = %asset.symbol, path = %first_path.display(), "Archive exists, skipping");
        return Ok(Vec::new());
    }
    let start = Instant::now();
    let daily_path = raw_csv_path(&configuration.raw_data_path, asset, "D1");
    let hourly_path = raw_csv_path(&configuration.raw_data_path, asset, "H1");
    let daily = read_daily_rows(&daily_path, asset, configuration.cutoff_date)
        .with_context(|| format!("Failed to read daily data of {}", asset.symbol))?;
    info!(
        symbol = %asset.symbol,
        included = daily.included,
        excluded = daily.excluded,
        exclusion_ratio = %format!("{:.1}%", daily.exclusion_ratio() * 100.0),
        "Filtered daily rows"
    );
    let hourly = read_hourly_table(&hourly_path, asset, configuration.cutoff_date)
        .with_context(|| format!("Failed to read hourly data of {}", asset.symbol))?;
    let grouped = group_by_date(daily.rows);
    let quantile = quantile_settings(configuration);

    let mut summaries = Vec::with_capacity(asset.f_records);
    for f_number in 1..=asset.f_records {
        let stream = asset.for_stream(f_number);
        let rolled = roll(&grouped, f_number);
        let mut records = generate_records(&rolled, &hourly, &stream)?;
        if records.is_empty() {
            warn!(symbol = %stream.symbol, "No intraday records generated");
        }
        if let Some(settings) = quantile {
            quantile_transform(&mut records, settings)
                .with_context(|| format!("Quantile transform failed for {}", stream.symbol))?;
        }
        let archive = Archive {
            symbol: stream.symbol.clone(),
            daily_records: rolled.daily_records,
            intraday_records: records,
        };
        archive.validate_order()?;
        let path = archive_path(&configuration.archive_path, &asset.symbol, f_number);
        let bytes = write_archive(&path, &archive)?;
        info!(
            symbol = %stream.symbol,
            path = %path.display(),
            daily = archive.daily_records.len(),
            intraday = archive.intraday_records.len(),
            bytes,
            "Wrote archive"
        );
        summaries.push(StreamSummary {
            symbol: stream.symbol,
            path,
            daily_records: archive.daily_records.len(),
            intraday_records: archive.intraday_records.len(),
            bytes,
        });
    }
    debug!(symbol = %asset.symbol, elapsed_ms = elapsed_ms(start), "Asset generated");
    Ok(summaries)
}

/// Generates archives for every configured asset in parallel, or for one
/// explicitly named asset (which is always rebuilt).
pub fn generate_archives(context: &Context, symbol: Option<&str>) -> Result<Vec<StreamSummary>> {
    let configuration = &context.configuration;
    let (assets, overwrite): (Vec<&Asset>, bool) = match symbol {
        Some(symbol) => {
            let asset = find_asset(&context.assets, symbol)
                .ok_or_else(|| anyhow!("Unknown asset symbol '{symbol}'"))?;
            (vec![asset], true)
        }
        None => (context.assets.iter().collect(), configuration.overwrite_archives),
    };
    let start = Instant::now();
    let progress = ProgressTracker::new("generate", assets.len());
    let summaries = assets
        .par_iter()
        .map(|asset| {
            let result = build_asset_archives(configuration, asset, overwrite);
            progress.record();
            result
        })
        .collect::<Result<Vec<_>>>()?;
    let summaries: Vec<StreamSummary> = summaries.into_iter().flatten().collect();
    info!(
        archives = summaries.len(),
        elapsed_ms = elapsed_ms(start),
        "Generation finished"
    );
    Ok(summaries)
}
