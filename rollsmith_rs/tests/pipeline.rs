use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::Result;
use chrono::{Datelike, Duration, NaiveDate};
use tempfile::tempdir;

use rollsmith_rs::archive::{archive_path, read_archive};
use rollsmith_rs::config::BacktestConfig;
use rollsmith_rs::context::Context;
use rollsmith_rs::generate::generate_archives;
use rollsmith_rs::records::{load_records, RecordFilter};
use rollsmith_rs::{backtest, FEATURES};

/// Weekday dates starting on Monday 2023-01-02.
fn weekdays(count: usize) -> Vec<NaiveDate> {
    let mut date = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
    let mut dates = Vec::with_capacity(count);
    while dates.len() < count {
        if date.weekday().number_from_monday() <= 5 {
            dates.push(date);
        }
        date += Duration::days(1);
    }
    dates
}

/// Price in ticks of a deterministic, slowly rising walk.
fn ticks(index: usize) -> i64 {
    16_000 + (index as i64 * 37) % 101 - 50 + index as i64 / 8
}

fn write_fixtures(root: &Path, days: usize) -> Result<()> {
    let raw = root.join("raw");
    fs::create_dir_all(&raw)?;
    let dates = weekdays(days);
    let mut daily = String::from("symbol,time,open,close,open_interest\n");
    let mut hourly = String::from("symbol,time,close\n");
    for (day, date) in dates.iter().enumerate() {
        let (march, june) = if day < days / 2 { (300, 100) } else { (80, 250) };
        let close = ticks(day * 24) as f64 * 0.25;
        writeln!(daily, "ESH23,{date},0,{close:.2},{march}")?;
        writeln!(daily, "ESM23,{date},0,{:.2},{june}", close + 10.0)?;
        for hour in 0..24 {
            let index = day * 24 + hour;
            let close = ticks(index) as f64 * 0.25;
            writeln!(hourly, "ESH23,{date} {hour:02}:00,{close:.2}")?;
            writeln!(hourly, "ESM23,{date} {hour:02}:00,{:.2}", close + 10.0)?;
        }
    }
    fs::write(raw.join("ES.D1.csv"), daily)?;
    fs::write(raw.join("ES.H1.csv"), hourly)?;

    let configuration = format!(
        "rawDataPath: {raw}\narchivePath: {archives}\ntempPath: {temp}\n\
         quantileTransform: true\nquantileBufferSize: 100\nquantileStride: 24\n",
        raw = raw.display(),
        archives = root.join("archives").display(),
        temp = root.join("temp").display(),
    );
    fs::write(root.join("configuration.yaml"), configuration)?;
    fs::write(
        root.join("assets.yaml"),
        "- symbol: ES\n  tickSize: 0.25\n  tickValue: 12.50\n  \
         spread: 1\n  brokerFee: 2.50\n  exchangeFee: 1.00\n  fRecords: 2\n",
    )?;
    Ok(())
}

fn context(root: &Path) -> Result<Context> {
    Context::load(&root.join("configuration.yaml"), &root.join("assets.yaml"))
}

#[test]
fn generates_ordered_archives_for_every_stream() -> Result<()> {
    let dir = tempdir()?;
    write_fixtures(dir.path(), 60)?;
    let context = context(dir.path())?;

    let summaries = generate_archives(&context, None)?;
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].symbol, "ES");
    assert_eq!(summaries[1].symbol, "ES.F2");

    let archives = dir.path().join("archives");
    let front = read_archive(&archive_path(&archives, "ES", 1))?;
    let second = read_archive(&archive_path(&archives, "ES", 2))?;
    front.validate_order()?;
    second.validate_order()?;
    assert_eq!(front.daily_records.len(), 60);
    assert!(!front.intraday_records.is_empty());

    // The March contract is front for the first half, June afterwards.
    let first_close = front.daily_records[0].close;
    let second_first_close = second.daily_records[0].close;
    assert!((second_first_close - first_close - 10.0).abs() < 1e-9);

    for record in &front.intraday_records {
        for feature in FEATURES.iter() {
            if let Some(value) = feature.get(record) {
                assert!((0.0..=1.0).contains(&value), "{} = {value}", feature.name);
            }
        }
    }

    // Existing archives are kept unless a symbol is named explicitly.
    assert!(generate_archives(&context, None)?.is_empty());
    assert_eq!(generate_archives(&context, Some("ES"))?.len(), 2);
    assert!(generate_archives(&context, Some("NQ")).is_err());
    Ok(())
}

#[test]
fn backtests_generated_archives() -> Result<()> {
    let dir = tempdir()?;
    write_fixtures(dir.path(), 120)?;
    let context = context(dir.path())?;
    generate_archives(&context, None)?;

    let config: BacktestConfig = serde_yaml::from_str(
        "dateMin: 2023-01-01\ndateSplit: 2023-04-01\ndateMax: 2023-07-01\n\
         strategies:\n\
         - symbol: ES\n  side: long\n  time: '16:00'\n  holdingTime: 24\n  \
           conditions:\n  - {feature: momentum1D, min: 0.0, max: 1.0}\n  \
           - {symbol: ES.F2, feature: momentum8H, min: 0.0, max: 1.0}\n",
    )?;
    config.validate()?;
    let symbols = backtest::required_symbols(&config);
    assert_eq!(symbols, vec!["ES", "ES.F2"]);
    let filter = RecordFilter::between(config.date_min, config.date_max);
    let assets = load_records(&context, &symbols, &filter)?;
    let report = backtest::run_backtest(&config, &assets, &context.currencies)?;
    assert_eq!(report.strategies.len(), 1);
    let strategy = &report.strategies[0];
    assert_eq!(
        strategy.strategy,
        "ES.momentum1D (0.00, 1.00), ES.F2.momentum8H (0.00, 1.00), long, 16:00, 24h"
    );
    assert!(strategy.trades > 0);
    assert!(strategy.max_drawdown >= 0.0 && strategy.max_drawdown < 1.0);
    Ok(())
}
