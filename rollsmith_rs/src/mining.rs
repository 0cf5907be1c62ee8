use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context as _, Result};
use chrono::{Datelike, NaiveDateTime};
use itertools::iproduct;
use rayon::prelude::*;
use rust_decimal::prelude::ToPrimitive;
use tracing::{info, warn};

use crate::calendar::start_of_day;
use crate::config::{Bin, MiningConfig, Side};
use crate::context::Context;
use crate::currency::CurrencyConverter;
use crate::feature::{FeatureDescriptor, FeatureRecord, FEATURES, RETURNS};
use crate::progress::{elapsed_ms, ProgressTracker};
use crate::records::{load_records, AssetRecords, RecordFilter};
use crate::simulator::{Simulation, TradeModel, WeekdayOptimization};
use crate::stats::{mean, years_without_samples, ReturnSample, SegmentScores};
use crate::storage::{write_mining_report, MiningReportPaths};
use crate::strategy::{DescriptorCondition, StrategyDescriptor};

/// Feature range on one loaded stream.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Threshold {
    /// Index into the loaded asset records.
    pub asset: usize,
    pub feature: &'static FeatureDescriptor,
    pub bin: Bin,
}

impl Threshold {
    pub fn matches(&self, record: &FeatureRecord) -> bool {
        self.feature
            .get(record)
            .is_some_and(|value| self.bin.contains(value))
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MiningTask {
    pub primary: Threshold,
    pub secondary: Threshold,
}

impl MiningTask {
    pub fn is_single(&self) -> bool {
        self.primary == self.secondary
    }
}

/// Cartesian product of (asset, feature, bin) pairs. Streams flagged as
/// features-only never act as the primary. Single-feature mode pairs every
/// threshold with itself only.
pub fn enumerate_tasks(primary_allowed: &[bool], bins: &[Bin], single_feature: bool) -> Vec<MiningTask> {
    let assets = primary_allowed.len();
    let features = FEATURES.len();
    if single_feature {
        return iproduct!(0..assets, 0..features, bins.iter())
            .filter(|(asset, _, _)| primary_allowed[*asset])
            .map(|(asset, feature, bin)| {
                let threshold = Threshold {
                    asset,
                    feature: &FEATURES[feature],
                    bin: *bin,
                };
                MiningTask {
                    primary: threshold,
                    secondary: threshold,
                }
            })
            .collect();
    }
    iproduct!(0..assets, 0..assets, 0..features, 0..features, bins.iter(), bins.iter())
        .filter(|(i, j, k, l, _, _)| primary_allowed[*i] && !(i == j && k == l))
        .map(|(i, j, k, l, bin1, bin2)| MiningTask {
            primary: Threshold {
                asset: i,
                feature: &FEATURES[k],
                bin: *bin1,
            },
            secondary: Threshold {
                asset: j,
                feature: &FEATURES[l],
                bin: *bin2,
            },
        })
        .collect()
}

/// Enabled result of a mining task after post-processing.
#[derive(Clone, Debug)]
pub struct StrategyResult {
    pub symbol: String,
    pub descriptor: StrategyDescriptor,
    pub returns_name: &'static str,
    pub side: Side,
    pub time_of_day: Option<u32>,
    pub holding_hours: i64,
    pub weekday_optimized: bool,
    pub banned_day: Option<usize>,
    pub trades: usize,
    pub trades_ratio: f64,
    pub cumulative_return: f64,
    pub drawdown_max: f64,
    /// Final equity in USD.
    pub cash: f64,
    pub scores: SegmentScores,
    /// Kept only for the OOS correlation study.
    pub samples: Vec<ReturnSample>,
}

fn sides(config: &MiningConfig) -> Vec<Side> {
    let mut sides = Vec::with_capacity(2);
    if config.enable_long {
        sides.push(Side::Long);
    }
    if config.enable_short {
        sides.push(Side::Short);
    }
    sides
}

fn initial_simulations(config: &MiningConfig) -> Vec<Simulation> {
    let hours: Vec<Option<u32>> = if config.hours.is_empty() {
        vec![None]
    } else {
        config.hours.iter().copied().map(Some).collect()
    };
    let mut optimizations = vec![None];
    if config.optimize_weekdays {
        optimizations.push(Some(WeekdayOptimization {
            threshold: config.weekday_threshold,
        }));
    }
    let sides = sides(config);
    iproduct!(RETURNS.iter(), sides.iter(), optimizations.iter(), hours.iter())
        .map(|(returns, side, optimization, hour)| {
            Simulation::new(returns, *side, *hour).with_weekday_optimization(*optimization)
        })
        .collect()
}

fn descriptor(task: &MiningTask, assets: &[AssetRecords], simulation: &Simulation) -> StrategyDescriptor {
    let condition = |threshold: &Threshold| DescriptorCondition {
        symbol: assets[threshold.asset].symbol().to_string(),
        feature: threshold.feature.name.to_string(),
        min: threshold.bin.min,
        max: threshold.bin.max,
    };
    let mut conditions = vec![condition(&task.primary)];
    if !task.is_single() {
        conditions.push(condition(&task.secondary));
    }
    StrategyDescriptor {
        conditions,
        side: simulation.side,
        time: simulation.time_of_day,
        holding_hours: simulation.holding_hours(),
    }
}

/// Last year that must contain a trade; a January end date does not count
/// its own year.
fn coverage_years(config: &MiningConfig, first: NaiveDateTime, last: NaiveDateTime) -> (i32, i32) {
    let first_year = config.date_min.map_or(first.year(), |date| date.year());
    let last_year = match config.date_max {
        Some(date) if date.month() == 1 => date.year() - 1,
        Some(date) => date.year(),
        None => last.year(),
    };
    (first_year, last_year)
}

/// Disables results that traded too rarely and computes the remaining
/// results' scores.
fn post_process(simulation: &mut Simulation, config: &MiningConfig, primary: &AssetRecords) {
    let (Some(records_first), Some(records_last)) = (primary.first_timestamp(), primary.last_timestamp())
    else {
        simulation.enabled = false;
        return;
    };
    let (Some(first_sample), Some(last_sample)) = (simulation.samples.first(), simulation.samples.last())
    else {
        simulation.enabled = false;
        return;
    };
    if simulation.trades < config.trades_min {
        simulation.enabled = false;
        return;
    }
    let (first_year, last_year) = coverage_years(config, records_first, records_last);
    if !years_without_samples(&simulation.samples, first_year, last_year).is_empty() {
        simulation.enabled = false;
        return;
    }
    let start = config
        .date_min
        .map_or(first_sample.timestamp, start_of_day)
        .max(records_first);
    let end = config
        .date_max
        .map_or(last_sample.timestamp, start_of_day)
        .min(records_last);
    simulation.finish((start, end), config.segments, config.is_correlation());
    if simulation.trades_ratio < config.trades_ratio {
        simulation.enabled = false;
    }
}

/// Scans the primary stream for records matching both thresholds and feeds
/// every matched signal to each enabled simulation.
pub fn execute_task(
    task: &MiningTask,
    assets: &[AssetRecords],
    config: &MiningConfig,
    currencies: &CurrencyConverter,
) -> Result<Vec<StrategyResult>> {
    let primary = &assets[task.primary.asset];
    let secondary = &assets[task.secondary.asset];
    let model = TradeModel::new(&primary.asset, currencies, config.leverage);
    let mut simulations = initial_simulations(config);
    let correlation = config.is_correlation();

    for record in &primary.records {
        if !record.has_returns() || !task.primary.matches(record) {
            continue;
        }
        let Some(other) = secondary.get(record.timestamp) else {
            continue;
        };
        if !task.secondary.matches(other) {
            continue;
        }
        let mut working = false;
        for simulation in simulations.iter_mut().filter(|simulation| simulation.enabled) {
            simulation.on_signal(record, &model)?;
            let drawdown_exceeded = !correlation && simulation.drawdown_max > config.drawdown;
            let filtered = config.strategy_filter.is_some_and(|filter| {
                simulation.trades >= filter.trades && simulation.cumulative_return < filter.limit
            });
            if drawdown_exceeded || filtered {
                simulation.enabled = false;
            }
            working |= simulation.enabled;
        }
        if !working {
            break;
        }
    }

    let mut results = Vec::new();
    for mut simulation in simulations {
        if !simulation.enabled {
            continue;
        }
        let cash = simulation
            .cash()
            .to_f64()
            .ok_or_else(|| anyhow!("Cash of {} is not representable", primary.symbol()))?;
        post_process(&mut simulation, config, primary);
        if !simulation.enabled {
            continue;
        }
        let descriptor = descriptor(task, assets, &simulation);
        results.push(StrategyResult {
            symbol: primary.symbol().to_string(),
            descriptor,
            returns_name: simulation.returns.name,
            side: simulation.side,
            time_of_day: simulation.time_of_day,
            holding_hours: simulation.holding_hours(),
            weekday_optimized: simulation.weekday_optimization.is_some(),
            banned_day: simulation.banned_day,
            trades: simulation.trades,
            trades_ratio: simulation.trades_ratio,
            cumulative_return: simulation.cumulative_return,
            drawdown_max: simulation.drawdown_max,
            cash,
            scores: simulation.scores,
            samples: simulation.samples,
        });
    }
    Ok(results)
}

/// Runs every task in parallel and returns the enabled results in task
/// order.
pub fn run_tasks(
    tasks: &[MiningTask],
    assets: &[AssetRecords],
    config: &MiningConfig,
    currencies: &CurrencyConverter,
) -> Result<Vec<StrategyResult>> {
    let start = Instant::now();
    let progress = ProgressTracker::new("data-mine", tasks.len());
    let per_task = tasks
        .par_iter()
        .map(|task| {
            let results = execute_task(task, assets, config, currencies);
            progress.record();
            results
        })
        .collect::<Result<Vec<_>>>()?;
    let results: Vec<StrategyResult> = per_task.into_iter().flatten().collect();
    info!(
        tasks = tasks.len(),
        results = results.len(),
        elapsed_ms = elapsed_ms(start),
        "Finished data mining"
    );
    Ok(results)
}

/// Ranked strategies of one primary stream.
#[derive(Clone, Debug)]
pub struct SymbolResults {
    pub symbol: String,
    pub strategies: Vec<StrategyResult>,
}

/// Keeps the `limit` results with the best weakest-segment score per symbol
/// and orders them by their most recent score. Symbols follow `symbols`.
pub fn rank_results(results: Vec<StrategyResult>, symbols: &[String], limit: usize) -> Vec<SymbolResults> {
    let mut ranked = Vec::new();
    let mut remaining = results;
    for symbol in symbols {
        let (mut strategies, rest): (Vec<_>, Vec<_>) =
            remaining.into_iter().partition(|result| &result.symbol == symbol);
        remaining = rest;
        if strategies.is_empty() {
            continue;
        }
        strategies.sort_by(|a, b| b.scores.min.total_cmp(&a.scores.min));
        strategies.truncate(limit);
        strategies.sort_by(|a, b| b.scores.recent.total_cmp(&a.scores.recent));
        ranked.push(SymbolResults {
            symbol: symbol.clone(),
            strategies,
        });
    }
    ranked
}

/// Mean scores of weekday-optimized and plain results.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WeekdaySummary {
    pub count: usize,
    pub mean_rar: f64,
    pub mean_min_rar: f64,
    pub mean_recent_rar: f64,
}

pub fn weekday_summary(results: &[StrategyResult], optimized: bool) -> WeekdaySummary {
    let selected: Vec<&StrategyResult> = results
        .iter()
        .filter(|result| result.weekday_optimized == optimized)
        .collect();
    let average = |value: fn(&SegmentScores) -> f64| {
        let values: Vec<f64> = selected.iter().map(|result| value(&result.scores)).collect();
        mean(&values).unwrap_or(0.0)
    };
    WeekdaySummary {
        count: selected.len(),
        mean_rar: average(|scores| scores.overall),
        mean_min_rar: average(|scores| scores.min),
        mean_recent_rar: average(|scores| scores.recent),
    }
}

fn log_weekday_summary(results: &[StrategyResult]) {
    for (label, optimized) in [("plain", false), ("weekday-optimized", true)] {
        let summary = weekday_summary(results, optimized);
        if summary.count == 0 {
            continue;
        }
        info!(
            results = label,
            count = summary.count,
            rar = %format!("{:.3}", summary.mean_rar),
            min_rar = %format!("{:.3}", summary.mean_min_rar),
            recent_rar = %format!("{:.3}", summary.mean_recent_rar),
            "Weekday optimization summary"
        );
    }
}

/// Symbols named in the mining configuration, or every configured stream.
pub fn mining_symbols(context: &Context, config: &MiningConfig) -> Vec<String> {
    if config.assets.is_empty() {
        let mut symbols = context.stream_symbols();
        for symbol in &config.features_only {
            if !symbols.contains(symbol) {
                symbols.push(symbol.clone());
            }
        }
        symbols
    } else {
        config.symbols()
    }
}

/// Loads the configured streams and runs the full search.
pub fn mine(context: &Context, config: &MiningConfig) -> Result<(Vec<AssetRecords>, Vec<StrategyResult>)> {
    let symbols = mining_symbols(context, config);
    let filter = RecordFilter {
        date_min: config.date_min,
        date_max: config.date_max,
        time_min: config.time_min,
        time_max: config.time_max,
    };
    let assets = load_records(context, &symbols, &filter)?;
    let primary_allowed: Vec<bool> = assets
        .iter()
        .map(|records| {
            !(records.asset.features_only || config.features_only.iter().any(|s| s == records.symbol()))
        })
        .collect();
    let tasks = enumerate_tasks(&primary_allowed, &config.bins, config.single_feature);
    info!(assets = assets.len(), tasks = tasks.len(), "Data mining strategies");
    let results = run_tasks(&tasks, &assets, config, &context.currencies)?;
    Ok((assets, results))
}

/// `data-mine` command: search, rank and persist the report.
pub fn data_mine(context: &Context, config_path: &Path, output_dir: Option<&Path>) -> Result<MiningReportPaths> {
    let config = MiningConfig::load(config_path)?;
    let (assets, results) = mine(context, &config)?;
    if results.is_empty() {
        warn!("No strategy passed the data mining filters");
    }
    log_weekday_summary(&results);
    let symbols: Vec<String> = assets.iter().map(|records| records.symbol().to_string()).collect();
    let ranked = rank_results(results, &symbols, config.strategy_limit);
    let output_dir: PathBuf = output_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| context.configuration.temp_path.clone());
    let paths = write_mining_report(&output_dir, &config, &ranked)
        .with_context(|| format!("Failed to write mining report to {}", output_dir.display()))?;
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::Asset;
    use crate::config::DEFAULT_BINS;
    use crate::feature::ReturnsRecord;
    use chrono::{Duration, NaiveDate};

    fn asset(symbol: &str) -> Asset {
        serde_yaml::from_str(&format!("symbol: {symbol}\ntickSize: 0.25\ntickValue: 12.5\n")).unwrap()
    }

    /// Daily 16:00 records over two years with a feature that alternates
    /// between bins and a label that rewards the low bin.
    fn records(symbol: &str) -> AssetRecords {
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let mut records = Vec::new();
        for day in 0..730 {
            let date = start + Duration::days(day);
            if date.weekday().number_from_monday() > 5 {
                continue;
            }
            let mut record = FeatureRecord::new(date.and_hms_opt(16, 0, 0).unwrap());
            let low = day % 2 == 0;
            record.momentum_1d = Some(if low { 0.1 } else { 0.9 });
            record.momentum_8h = Some(0.5);
            let delta = if low { 8 + day % 3 } else { -(8 + day % 3) };
            for returns in RETURNS.iter() {
                *record.returns_mut(returns.field) = Some(ReturnsRecord {
                    high: 400 + delta.max(0),
                    low: 400 + delta.min(0),
                    close1: 400,
                    close2: 400 + delta,
                });
            }
            records.push(record);
        }
        AssetRecords::new(asset(symbol), Vec::new(), records)
    }

    fn config() -> MiningConfig {
        MiningConfig {
            date_min: NaiveDate::from_ymd_opt(2020, 1, 1),
            date_max: NaiveDate::from_ymd_opt(2022, 1, 1),
            hours: vec![16],
            ..MiningConfig::default()
        }
    }

    #[test]
    fn enumeration_skips_identical_thresholds_and_feature_only_primaries() {
        let bins = DEFAULT_BINS.to_vec();
        let tasks = enumerate_tasks(&[true, false], &bins, false);
        let features = FEATURES.len();
        // Primary is asset 0 only; (0, 0, k, k) pairs are skipped.
        let expected = (2 * features * features - features) * bins.len() * bins.len();
        assert_eq!(tasks.len(), expected);
        assert!(tasks.iter().all(|task| task.primary.asset == 0));
        assert!(tasks.iter().all(|task| !task.is_single()));

        let single = enumerate_tasks(&[true, true], &bins, true);
        assert_eq!(single.len(), 2 * features * bins.len());
        assert!(single.iter().all(MiningTask::is_single));
    }

    #[test]
    fn task_finds_the_profitable_bin() -> Result<()> {
        let assets = vec![records("ES")];
        let config = config();
        let currencies = CurrencyConverter::default();
        let task = MiningTask {
            primary: Threshold {
                asset: 0,
                feature: crate::feature::find_feature("momentum1D").unwrap(),
                bin: DEFAULT_BINS[0],
            },
            secondary: Threshold {
                asset: 0,
                feature: crate::feature::find_feature("momentum8H").unwrap(),
                bin: DEFAULT_BINS[1],
            },
        };
        let results = execute_task(&task, &assets, &config, &currencies)?;
        assert!(!results.is_empty());
        assert!(results.iter().all(|result| result.side == Side::Long));
        let daily = results
            .iter()
            .find(|result| result.holding_hours == 24)
            .unwrap();
        assert!(daily.cumulative_return > 1.0);
        assert!(daily.samples.is_empty());
        assert_eq!(
            daily.descriptor.to_string(),
            "ES.momentum1D (0.00, 0.30), ES.momentum8H (0.35, 0.65), long, 16:00, 24h"
        );

        let again = execute_task(&task, &assets, &config, &currencies)?;
        let scores: Vec<_> = results.iter().map(|result| result.scores).collect();
        let replay: Vec<_> = again.iter().map(|result| result.scores).collect();
        assert_eq!(scores, replay);
        Ok(())
    }

    #[test]
    fn short_horizon_results_fail_year_coverage() -> Result<()> {
        let assets = vec![records("ES")];
        let mut config = config();
        config.date_max = NaiveDate::from_ymd_opt(2023, 6, 1);
        let currencies = CurrencyConverter::default();
        let task = MiningTask {
            primary: Threshold {
                asset: 0,
                feature: crate::feature::find_feature("momentum1D").unwrap(),
                bin: DEFAULT_BINS[0],
            },
            secondary: Threshold {
                asset: 0,
                feature: crate::feature::find_feature("momentum8H").unwrap(),
                bin: DEFAULT_BINS[1],
            },
        };
        // No trades exist in 2022 or 2023.
        assert!(execute_task(&task, &assets, &config, &currencies)?.is_empty());
        Ok(())
    }

    #[test]
    fn ranking_limits_and_orders_per_symbol() {
        let template = StrategyResult {
            symbol: "ES".into(),
            descriptor: "ES.momentum1D (0.00, 0.30), long, 16:00, 24h".parse().unwrap(),
            returns_name: "returns24H",
            side: Side::Long,
            time_of_day: Some(16),
            holding_hours: 24,
            weekday_optimized: false,
            banned_day: None,
            trades: 10,
            trades_ratio: 0.5,
            cumulative_return: 1.1,
            drawdown_max: 0.1,
            cash: 100.0,
            scores: SegmentScores::default(),
            samples: Vec::new(),
        };
        let make = |symbol: &str, min: f64, recent: f64| StrategyResult {
            symbol: symbol.into(),
            scores: SegmentScores {
                overall: 0.0,
                min,
                recent,
            },
            ..template.clone()
        };
        let results = vec![
            make("NQ", 1.0, 1.0),
            make("ES", 0.1, 0.9),
            make("ES", 0.5, 0.2),
            make("ES", 0.3, 0.4),
        ];
        let ranked = rank_results(results, &["ES".to_string(), "NQ".to_string()], 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].symbol, "ES");
        let recents: Vec<f64> = ranked[0].strategies.iter().map(|s| s.scores.recent).collect();
        assert_eq!(recents, vec![0.4, 0.2]);
        assert_eq!(ranked[1].strategies.len(), 1);
    }
}
