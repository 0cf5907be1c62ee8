use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use polars::io::parquet::write::{ParquetCompression, ParquetWriter};
use polars::prelude::*;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::calendar::format_hour_of_day;
use crate::config::MiningConfig;
use crate::mining::{StrategyResult, SymbolResults};
use crate::progress::elapsed_ms;

/// Files produced by one data-mining run.
#[derive(Debug, Clone, PartialEq)]
pub struct MiningReportPaths {
    pub report: PathBuf,
    pub descriptors: PathBuf,
    pub strategies: usize,
}

/// Hex SHA-256 of the serialized mining configuration.
pub fn stable_config_hash(config: &MiningConfig) -> Result<String> {
    let serialized = serde_json::to_vec(config)?;
    Ok(hex::encode(Sha256::digest(serialized)))
}

/// File stem shared by the report and descriptor list of `config`.
pub fn report_stem(config: &MiningConfig) -> Result<String> {
    let hash = stable_config_hash(config)?;
    Ok(format!("mining-{}", &hash[..12]))
}

fn flatten(ranked: &[SymbolResults]) -> Vec<(usize, &StrategyResult)> {
    ranked
        .iter()
        .flat_map(|symbol| {
            symbol
                .strategies
                .iter()
                .enumerate()
                .map(|(index, strategy)| (index + 1, strategy))
        })
        .collect()
}

fn condition_columns(rows: &[(usize, &StrategyResult)], index: usize, columns: &mut Vec<Series>) {
    let prefix = format!("feature{}", index + 1);
    let condition = |row: &(usize, &StrategyResult)| row.1.descriptor.conditions.get(index).cloned();
    columns.push(Series::new(
        &format!("{prefix}_symbol"),
        rows.iter()
            .map(|row| condition(row).map(|c| c.symbol))
            .collect::<Vec<_>>(),
    ));
    columns.push(Series::new(
        &format!("{prefix}_name"),
        rows.iter()
            .map(|row| condition(row).map(|c| c.feature))
            .collect::<Vec<_>>(),
    ));
    columns.push(Series::new(
        &format!("{prefix}_min"),
        rows.iter()
            .map(|row| condition(row).map(|c| c.min))
            .collect::<Vec<_>>(),
    ));
    columns.push(Series::new(
        &format!("{prefix}_max"),
        rows.iter()
            .map(|row| condition(row).map(|c| c.max))
            .collect::<Vec<_>>(),
    ));
}

pub fn build_report_frame(ranked: &[SymbolResults]) -> Result<DataFrame> {
    let rows = flatten(ranked);

    let mut columns = vec![
        Series::new("rank", rows.iter().map(|row| row.0 as u32).collect::<Vec<_>>()),
        Series::new(
            "symbol",
            rows.iter().map(|row| row.1.symbol.clone()).collect::<Vec<_>>(),
        ),
        Series::new(
            "strategy",
            rows.iter()
                .map(|row| row.1.descriptor.to_string())
                .collect::<Vec<_>>(),
        ),
    ];

    macro_rules! push_series {
        ($name:expr, $iter:expr) => {
            columns.push(Series::new($name, $iter));
        };
    }

    push_series!(
        "side",
        rows.iter()
            .map(|row| row.1.side.as_str().to_string())
            .collect::<Vec<_>>()
    );
    push_series!(
        "optimize_weekdays",
        rows.iter()
            .map(|row| row.1.weekday_optimized)
            .collect::<Vec<_>>()
    );
    push_series!(
        "banned_day",
        rows.iter()
            .map(|row| row.1.banned_day.map(|day| day as u32))
            .collect::<Vec<_>>()
    );
    push_series!(
        "time_of_day",
        rows.iter()
            .map(|row| row.1.time_of_day.map(format_hour_of_day))
            .collect::<Vec<_>>()
    );
    condition_columns(&rows, 0, &mut columns);
    condition_columns(&rows, 1, &mut columns);
    push_series!(
        "exit",
        rows.iter()
            .map(|row| row.1.returns_name.to_string())
            .collect::<Vec<_>>()
    );
    push_series!(
        "holding_hours",
        rows.iter().map(|row| row.1.holding_hours).collect::<Vec<_>>()
    );
    push_series!(
        "trades",
        rows.iter().map(|row| row.1.trades as u64).collect::<Vec<_>>()
    );
    push_series!(
        "trades_ratio",
        rows.iter().map(|row| row.1.trades_ratio).collect::<Vec<_>>()
    );
    push_series!(
        "returns",
        rows.iter().map(|row| row.1.cash).collect::<Vec<_>>()
    );
    push_series!(
        "cumulative_return",
        rows.iter()
            .map(|row| row.1.cumulative_return)
            .collect::<Vec<_>>()
    );
    push_series!(
        "risk_adjusted",
        rows.iter().map(|row| row.1.scores.overall).collect::<Vec<_>>()
    );
    push_series!(
        "risk_adjusted_min",
        rows.iter().map(|row| row.1.scores.min).collect::<Vec<_>>()
    );
    push_series!(
        "risk_adjusted_recent",
        rows.iter().map(|row| row.1.scores.recent).collect::<Vec<_>>()
    );
    push_series!(
        "max_drawdown",
        rows.iter().map(|row| row.1.drawdown_max).collect::<Vec<_>>()
    );

    DataFrame::new(columns).context("Failed to build mining report DataFrame")
}

/// Descriptor list in rank order, one `N. descriptor` line per strategy.
pub fn render_descriptors(ranked: &[SymbolResults]) -> String {
    let mut text = String::new();
    for (rank, strategy) in flatten(ranked) {
        text.push_str(&format!("{rank}. {}\n", strategy.descriptor));
    }
    text
}

/// Writes the zstd Parquet report and the descriptor list next to it.
pub fn write_mining_report(
    output_dir: &Path,
    config: &MiningConfig,
    ranked: &[SymbolResults],
) -> Result<MiningReportPaths> {
    let start = Instant::now();
    fs::create_dir_all(output_dir)
        .with_context(|| format!("Unable to create {}", output_dir.display()))?;
    let stem = report_stem(config)?;
    let report = output_dir.join(format!("{stem}.parquet"));
    let descriptors = output_dir.join(format!("{stem}.txt"));

    let mut df = build_report_frame(ranked)?;
    let mut file =
        File::create(&report).with_context(|| format!("Unable to create {}", report.display()))?;
    ParquetWriter::new(&mut file)
        .with_compression(ParquetCompression::Zstd(None))
        .finish(&mut df)
        .context("Failed to write mining report")?;
    fs::write(&descriptors, render_descriptors(ranked))
        .with_context(|| format!("Unable to write {}", descriptors.display()))?;

    let strategies = df.height();
    info!(
        strategies,
        report = %report.display(),
        descriptors = %descriptors.display(),
        elapsed_ms = elapsed_ms(start),
        "Wrote mining report"
    );
    Ok(MiningReportPaths {
        report,
        descriptors,
        strategies,
    })
}
