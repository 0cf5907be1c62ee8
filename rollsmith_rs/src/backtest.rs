use std::path::Path;
use std::time::Instant;

use anyhow::{anyhow, Context as _, Result};
use chrono::{NaiveDate, NaiveDateTime};
use rayon::prelude::*;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use tracing::{info, warn};

use crate::calendar::start_of_day;
use crate::config::{BacktestConfig, Bin, Side, StrategyConfig};
use crate::context::Context;
use crate::currency::CurrencyConverter;
use crate::feature::{find_feature, find_returns, find_returns_by_hours, FeatureDescriptor, FeatureRecord};
use crate::progress::elapsed_ms;
use crate::records::{load_records, AssetRecords, RecordFilter};
use crate::simulator::{Simulation, TradeModel};
use crate::stats::{mean, pearson, risk_adjusted_score, ReturnSample, SegmentScores};
use crate::strategy::{DescriptorCondition, StrategyDescriptor};

/// Entry hour and horizon of the buy-and-hold reference.
pub const BENCHMARK_HOUR: u32 = 12;
pub const BENCHMARK_RETURNS: &str = "returns24H";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    /// OOS score above the benchmark's.
    Outperform,
    /// Positive OOS score, at or below the benchmark.
    Underperform,
    Loss,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyReport {
    pub strategy: String,
    pub is_rar: f64,
    pub is_recent_rar: f64,
    pub oos_rar: f64,
    pub trades: usize,
    /// Final USD equity over the complete window.
    pub returns: f64,
    pub max_drawdown: f64,
    pub classification: Classification,
    #[serde(skip)]
    pub oos_samples: Vec<ReturnSample>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkReport {
    pub symbol: String,
    pub is_rar: f64,
    pub oos_rar: f64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestReport {
    pub strategies: Vec<StrategyReport>,
    pub benchmark: BenchmarkReport,
    pub is_oos_correlation: Option<f64>,
    pub recent_oos_correlation: Option<f64>,
    pub mean_is_rar: f64,
    pub mean_is_recent_rar: f64,
    pub mean_oos_rar: f64,
    pub portfolio_oos_rar: f64,
    pub outperform: usize,
    pub underperform: usize,
    pub loss: usize,
}

/// Condition bound to a loaded stream.
struct ResolvedCondition {
    asset: usize,
    feature: &'static FeatureDescriptor,
    bin: Bin,
}

/// Strategy with every symbol resolved against the loaded streams.
struct ResolvedStrategy<'a> {
    config: &'a StrategyConfig,
    asset: usize,
    conditions: Vec<ResolvedCondition>,
}

fn asset_index(assets: &[AssetRecords], symbol: &str) -> Result<usize> {
    assets
        .iter()
        .position(|records| records.symbol().eq_ignore_ascii_case(symbol))
        .ok_or_else(|| anyhow!("No records loaded for {symbol}"))
}

fn resolve<'a>(strategy: &'a StrategyConfig, assets: &[AssetRecords]) -> Result<ResolvedStrategy<'a>> {
    let asset = asset_index(assets, &strategy.symbol)?;
    let conditions = strategy
        .conditions
        .iter()
        .map(|condition| {
            let feature = find_feature(&condition.feature)
                .ok_or_else(|| anyhow!("Unknown feature '{}'", condition.feature))?;
            let asset = if condition.symbol.is_empty() {
                asset
            } else {
                asset_index(assets, &condition.symbol)?
            };
            Ok(ResolvedCondition {
                asset,
                feature,
                bin: Bin::new(condition.min, condition.max),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(ResolvedStrategy {
        config: strategy,
        asset,
        conditions,
    })
}

impl ResolvedStrategy<'_> {
    fn matches(&self, record: &FeatureRecord, assets: &[AssetRecords]) -> bool {
        self.conditions.iter().all(|condition| {
            let probe = if condition.asset == self.asset {
                Some(record)
            } else {
                assets[condition.asset].get(record.timestamp)
            };
            probe
                .and_then(|probe| condition.feature.get(probe))
                .is_some_and(|value| condition.bin.contains(value))
        })
    }

    fn descriptor(&self) -> StrategyDescriptor {
        StrategyDescriptor {
            conditions: self
                .config
                .conditions
                .iter()
                .map(|condition| DescriptorCondition {
                    symbol: if condition.symbol.is_empty() {
                        self.config.symbol.clone()
                    } else {
                        condition.symbol.clone()
                    },
                    feature: condition.feature.clone(),
                    min: condition.min,
                    max: condition.max,
                })
                .collect(),
            side: self.config.side,
            time: Some(self.config.time),
            holding_hours: self.config.holding_time,
        }
    }
}

/// Runs one simulation over the records of `[start, end)` accepted by
/// `matches`.
fn simulate_window(
    mut simulation: Simulation,
    records: &[FeatureRecord],
    model: &TradeModel<'_>,
    (start, end): (NaiveDate, NaiveDate),
    segments: usize,
    mut matches: impl FnMut(&FeatureRecord) -> bool,
) -> Result<Simulation> {
    let start: NaiveDateTime = start_of_day(start);
    let end: NaiveDateTime = start_of_day(end);
    let from = records.partition_point(|record| record.timestamp < start);
    for record in &records[from..] {
        if record.timestamp >= end {
            break;
        }
        if matches(record) {
            simulation.on_signal(record, model)?;
        }
    }
    if !simulation.enabled {
        warn!(
            symbol = %model.asset.symbol,
            trades = simulation.trades,
            "Simulation stopped after a total loss"
        );
    }
    simulation.finish((start, end), segments, true);
    Ok(simulation)
}

struct WindowScores {
    is: SegmentScores,
    oos: SegmentScores,
    oos_samples: Vec<ReturnSample>,
    complete: Simulation,
}

fn backtest_strategy(
    strategy: &ResolvedStrategy<'_>,
    assets: &[AssetRecords],
    config: &BacktestConfig,
    currencies: &CurrencyConverter,
) -> Result<WindowScores> {
    let primary = &assets[strategy.asset];
    let returns = find_returns_by_hours(strategy.config.holding_time)
        .ok_or_else(|| anyhow!("No returns horizon matches {}h", strategy.config.holding_time))?;
    let model = TradeModel::new(&primary.asset, currencies, config.leverage);
    let fresh = || Simulation::new(returns, strategy.config.side, Some(strategy.config.time));
    let matches = |record: &FeatureRecord| strategy.matches(record, assets);
    let run = |window| simulate_window(fresh(), &primary.records, &model, window, config.segments, matches);

    let is = run((config.date_min, config.date_split))?;
    let oos = run((config.date_split, config.date_max))?;
    let complete = run((config.date_min, config.date_max))?;
    Ok(WindowScores {
        is: is.scores,
        oos: oos.scores,
        oos_samples: oos.samples,
        complete,
    })
}

fn benchmark(
    assets: &[AssetRecords],
    config: &BacktestConfig,
    currencies: &CurrencyConverter,
) -> Result<BenchmarkReport> {
    let records = &assets[asset_index(assets, &config.benchmark)?];
    let returns = find_returns(BENCHMARK_RETURNS)
        .ok_or_else(|| anyhow!("Unknown returns horizon {BENCHMARK_RETURNS}"))?;
    let mut model = TradeModel::new(&records.asset, currencies, None);
    model.frictionless = true;
    let fresh = || Simulation::new(returns, Side::Long, Some(BENCHMARK_HOUR));
    let is = simulate_window(
        fresh(),
        &records.records,
        &model,
        (config.date_min, config.date_split),
        config.segments,
        |_| true,
    )?;
    let oos = simulate_window(
        fresh(),
        &records.records,
        &model,
        (config.date_split, config.date_max),
        config.segments,
        |_| true,
    )?;
    Ok(BenchmarkReport {
        symbol: records.symbol().to_string(),
        is_rar: is.scores.overall,
        oos_rar: oos.scores.overall,
    })
}

fn classify(oos_rar: f64, benchmark_oos_rar: f64) -> Classification {
    if oos_rar > benchmark_oos_rar {
        Classification::Outperform
    } else if oos_rar > 0.0 {
        Classification::Underperform
    } else {
        Classification::Loss
    }
}

/// Symbols a backtest needs loaded: traded streams, condition streams and
/// the benchmark, in first-use order.
pub fn required_symbols(config: &BacktestConfig) -> Vec<String> {
    let mut symbols: Vec<String> = Vec::new();
    let mut push = |symbol: &str| {
        if !symbol.is_empty() && !symbols.iter().any(|known| known.eq_ignore_ascii_case(symbol)) {
            symbols.push(symbol.to_string());
        }
    };
    for strategy in &config.strategies {
        push(&strategy.symbol);
        for condition in &strategy.conditions {
            push(&condition.symbol);
        }
    }
    push(&config.benchmark);
    symbols
}

/// Scores every strategy in sample, out of sample and over the complete
/// window against already loaded streams.
pub fn run_backtest(
    config: &BacktestConfig,
    assets: &[AssetRecords],
    currencies: &CurrencyConverter,
) -> Result<BacktestReport> {
    let resolved = config
        .strategies
        .iter()
        .map(|strategy| resolve(strategy, assets))
        .collect::<Result<Vec<_>>>()?;
    let benchmark = benchmark(assets, config, currencies)?;
    let windows = resolved
        .par_iter()
        .map(|strategy| backtest_strategy(strategy, assets, config, currencies))
        .collect::<Result<Vec<_>>>()?;

    let strategies: Vec<StrategyReport> = resolved
        .iter()
        .zip(windows)
        .map(|(strategy, window)| {
            let oos_rar = window.oos.overall;
            let returns = window
                .complete
                .cash()
                .to_f64()
                .ok_or_else(|| anyhow!("Cash of {} is not representable", strategy.config.symbol))?;
            Ok(StrategyReport {
                strategy: strategy.descriptor().to_string(),
                is_rar: window.is.overall,
                is_recent_rar: window.is.recent,
                oos_rar,
                trades: window.complete.trades,
                returns,
                max_drawdown: window.complete.drawdown_max,
                classification: classify(oos_rar, benchmark.oos_rar),
                oos_samples: window.oos_samples,
            })
        })
        .collect::<Result<_>>()?;

    let is_rar: Vec<f64> = strategies.iter().map(|report| report.is_rar).collect();
    let is_recent_rar: Vec<f64> = strategies.iter().map(|report| report.is_recent_rar).collect();
    let oos_rar: Vec<f64> = strategies.iter().map(|report| report.oos_rar).collect();
    let mut portfolio: Vec<ReturnSample> = strategies
        .iter()
        .flat_map(|report| report.oos_samples.iter().copied())
        .collect();
    portfolio.sort_by_key(|sample| sample.timestamp);
    let count = |class: Classification| {
        strategies
            .iter()
            .filter(|report| report.classification == class)
            .count()
    };

    Ok(BacktestReport {
        is_oos_correlation: pearson(&is_rar, &oos_rar),
        recent_oos_correlation: pearson(&is_recent_rar, &oos_rar),
        mean_is_rar: mean(&is_rar).unwrap_or(0.0),
        mean_is_recent_rar: mean(&is_recent_rar).unwrap_or(0.0),
        mean_oos_rar: mean(&oos_rar).unwrap_or(0.0),
        portfolio_oos_rar: risk_adjusted_score(&portfolio),
        outperform: count(Classification::Outperform),
        underperform: count(Classification::Underperform),
        loss: count(Classification::Loss),
        benchmark,
        strategies,
    })
}

fn format_coefficient(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |value| format!("{value:.3}"))
}

fn log_report(report: &BacktestReport) {
    for (index, strategy) in report.strategies.iter().enumerate() {
        info!(
            rank = index + 1,
            strategy = %strategy.strategy,
            is_rar = %format!("{:.3}", strategy.is_rar),
            is_recent_rar = %format!("{:.3}", strategy.is_recent_rar),
            oos_rar = %format!("{:.3}", strategy.oos_rar),
            trades = strategy.trades,
            classification = ?strategy.classification,
            "Strategy backtest"
        );
    }
    info!(
        symbol = %report.benchmark.symbol,
        is_rar = %format!("{:.3}", report.benchmark.is_rar),
        oos_rar = %format!("{:.3}", report.benchmark.oos_rar),
        "Buy-and-hold benchmark"
    );
    info!(
        is_oos = %format_coefficient(report.is_oos_correlation),
        recent_oos = %format_coefficient(report.recent_oos_correlation),
        mean_is_rar = %format!("{:.3}", report.mean_is_rar),
        mean_is_recent_rar = %format!("{:.3}", report.mean_is_recent_rar),
        mean_oos_rar = %format!("{:.3}", report.mean_oos_rar),
        portfolio_oos_rar = %format!("{:.3}", report.portfolio_oos_rar),
        outperform = report.outperform,
        underperform = report.underperform,
        loss = report.loss,
        "Backtest summary"
    );
}

/// `backtest` command.
pub fn backtest(context: &Context, config_path: &Path, output: Option<&Path>) -> Result<BacktestReport> {
    let start = Instant::now();
    let config = BacktestConfig::load(config_path)?;
    let symbols = required_symbols(&config);
    let filter = RecordFilter::between(config.date_min, config.date_max);
    let assets = load_records(context, &symbols, &filter)?;
    let report = run_backtest(&config, &assets, &context.currencies)?;
    log_report(&report);
    if let Some(output) = output {
        let file = std::fs::File::create(output)
            .with_context(|| format!("Failed to create {}", output.display()))?;
        serde_json::to_writer_pretty(file, &report)
            .with_context(|| format!("Failed to write {}", output.display()))?;
        info!(path = %output.display(), "Wrote backtest report");
    }
    info!(
        strategies = report.strategies.len(),
        elapsed_ms = elapsed_ms(start),
        "Finished backtest"
    );
    Ok(report)
}
