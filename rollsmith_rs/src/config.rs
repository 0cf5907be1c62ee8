use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::calendar::{format_date, serde_format};
use crate::feature::{find_feature, find_returns_by_hours};

pub const DEFAULT_CONFIGURATION_PATH: &str = "configuration/configuration.yaml";
pub const DEFAULT_ASSETS_PATH: &str = "configuration/assets.yaml";

const fn default_quantile_buffer_size() -> usize {
    1000
}

const fn default_quantile_stride() -> usize {
    24
}

/// Paths and flags shared by every command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    /// Directory holding the vendor CSVs (`{symbol}.D1.csv`, `{symbol}.H1.csv`).
    #[serde(alias = "barchartPath")]
    pub raw_data_path: PathBuf,
    /// Directory receiving the `.gobz` archives.
    #[serde(alias = "gobPath")]
    pub archive_path: PathBuf,
    #[serde(default = "std::env::temp_dir")]
    pub temp_path: PathBuf,
    /// Directory holding `^{CUR}USD.H1.csv` files. Defaults to `raw_data_path`.
    #[serde(default)]
    pub fx_path: Option<PathBuf>,
    /// Global lower bound for ingested rows.
    #[serde(default, with = "serde_format::optional_date")]
    pub cutoff_date: Option<NaiveDate>,
    #[serde(default)]
    pub overwrite_archives: bool,
    #[serde(default)]
    pub quantile_transform: bool,
    #[serde(default = "default_quantile_buffer_size")]
    pub quantile_buffer_size: usize,
    #[serde(default = "default_quantile_stride")]
    pub quantile_stride: usize,
}

impl Configuration {
    pub fn load(path: &Path) -> Result<Self> {
        let configuration: Configuration = read_yaml(path)?;
        if configuration.quantile_transform && configuration.quantile_stride == 0 {
            bail!("quantileStride must be positive");
        }
        Ok(configuration)
    }

    pub fn fx_path(&self) -> &Path {
        self.fx_path.as_deref().unwrap_or(&self.raw_data_path)
    }
}

pub fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Unable to read YAML file {}", path.display()))?;
    serde_yaml::from_str(&text)
        .with_context(|| format!("Failed to parse YAML file {}", path.display()))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }
}

impl std::str::FromStr for Side {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "long" => Ok(Side::Long),
            "short" => Ok(Side::Short),
            other => Err(anyhow!("Unknown side '{other}'")),
        }
    }
}

/// Stop evaluating a result once it has `trades` trades and its cumulative
/// return factor is below `limit`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct StrategyFilter {
    pub trades: usize,
    pub limit: f64,
}

/// Quantile range `[min, max]` a feature must fall in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Bin {
    pub min: f64,
    pub max: f64,
}

impl Bin {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

pub const DEFAULT_BINS: [Bin; 3] = [Bin::new(0.0, 0.3), Bin::new(0.35, 0.65), Bin::new(0.7, 1.0)];

fn default_bins() -> Vec<Bin> {
    DEFAULT_BINS.to_vec()
}

const fn default_true() -> bool {
    true
}

const fn default_strategy_limit() -> usize {
    50
}

const fn default_drawdown() -> f64 {
    0.5
}

const fn default_segments() -> usize {
    3
}

/// Data-mining run definition. Also drives the OOS correlation study when
/// `correlation_splits` is non-empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MiningConfig {
    /// Symbols to load; empty selects every configured stream.
    #[serde(default)]
    pub assets: Vec<String>,
    /// Symbols loaded only for use as the secondary condition.
    #[serde(default)]
    pub features_only: Vec<String>,
    #[serde(default = "default_true")]
    pub enable_long: bool,
    #[serde(default = "default_true")]
    pub enable_short: bool,
    #[serde(default = "default_strategy_limit")]
    pub strategy_limit: usize,
    #[serde(default)]
    pub strategy_filter: Option<StrategyFilter>,
    /// Maximum tolerated drawdown of the compounded curve.
    #[serde(default = "default_drawdown")]
    pub drawdown: f64,
    #[serde(default, with = "serde_format::optional_date")]
    pub date_min: Option<NaiveDate>,
    /// Exclusive.
    #[serde(default, with = "serde_format::optional_date")]
    pub date_max: Option<NaiveDate>,
    #[serde(default, with = "serde_format::optional_hour_of_day")]
    pub time_min: Option<u32>,
    #[serde(default, with = "serde_format::optional_hour_of_day")]
    pub time_max: Option<u32>,
    /// Entry hours evaluated as separate results. Empty evaluates every hour
    /// as one unfiltered result.
    #[serde(default, with = "serde_format::hour_list")]
    pub hours: Vec<u32>,
    #[serde(default)]
    pub optimize_weekdays: bool,
    /// Rolling Sharpe below which the worst weekday gets banned.
    #[serde(default)]
    pub weekday_threshold: f64,
    #[serde(default)]
    pub trades_min: usize,
    #[serde(default)]
    pub trades_ratio: f64,
    #[serde(default = "default_bins")]
    pub bins: Vec<Bin>,
    #[serde(default)]
    pub leverage: Option<f64>,
    #[serde(default)]
    pub single_feature: bool,
    /// Number of windows the risk-adjusted score is segmented into.
    #[serde(default = "default_segments")]
    pub segments: usize,
    #[serde(default, with = "serde_format::date_list")]
    pub correlation_splits: Vec<NaiveDate>,
    #[serde(default)]
    pub strategy_ratio: Option<f64>,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            assets: Vec::new(),
            features_only: Vec::new(),
            enable_long: true,
            enable_short: true,
            strategy_limit: default_strategy_limit(),
            strategy_filter: None,
            drawdown: default_drawdown(),
            date_min: None,
            date_max: None,
            time_min: None,
            time_max: None,
            hours: Vec::new(),
            optimize_weekdays: false,
            weekday_threshold: 0.0,
            trades_min: 0,
            trades_ratio: 0.0,
            bins: default_bins(),
            leverage: None,
            single_feature: false,
            segments: default_segments(),
            correlation_splits: Vec::new(),
            strategy_ratio: None,
        }
    }
}

impl MiningConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config: MiningConfig = read_yaml(path)?;
        config
            .validate()
            .with_context(|| format!("Invalid data mining configuration {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let (Some(min), Some(max)) = (self.date_min, self.date_max) {
            if min >= max {
                bail!(
                    "dateMin must precede dateMax ({} vs. {})",
                    format_date(min),
                    format_date(max)
                );
            }
        }
        if let (Some(min), Some(max)) = (self.time_min, self.time_max) {
            if min > max {
                bail!("timeMin must not exceed timeMax ({min:02}:00 vs. {max:02}:00)");
            }
        }
        if !self.enable_long && !self.enable_short {
            bail!("At least one of enableLong/enableShort must be set");
        }
        if self.bins.is_empty() {
            bail!("At least one threshold bin is required");
        }
        for bin in &self.bins {
            if bin.min < 0.0 || bin.max > 1.0 || bin.min > bin.max {
                bail!("Invalid bin [{}, {}]", bin.min, bin.max);
            }
        }
        if let Some(filter) = &self.strategy_filter {
            if filter.trades == 0 || filter.limit == 0.0 {
                bail!("Invalid strategyFilter (trades = {}, limit = {})", filter.trades, filter.limit);
            }
        }
        if self.segments == 0 {
            bail!("segments must be positive");
        }
        if self.strategy_limit == 0 {
            bail!("strategyLimit must be positive");
        }
        if self.hours.iter().any(|&hour| hour > 23) {
            bail!("hours must lie within 00:00..23:00");
        }
        if self.is_correlation() {
            self.validate_correlation()?;
        }
        Ok(())
    }

    fn validate_correlation(&self) -> Result<()> {
        let date_min = self
            .date_min
            .ok_or_else(|| anyhow!("correlationSplits require dateMin"))?;
        if self.correlation_splits.len() < 2 {
            bail!("correlationSplits needs at least two dates");
        }
        if self.correlation_splits[0] <= date_min {
            bail!("correlationSplits must start after dateMin");
        }
        if self
            .correlation_splits
            .windows(2)
            .any(|pair| pair[0] >= pair[1])
        {
            bail!("correlationSplits must be strictly ascending");
        }
        match self.strategy_ratio {
            Some(ratio) if ratio > 0.0 && ratio <= 1.0 => Ok(()),
            Some(ratio) => bail!("strategyRatio must lie in (0, 1], got {ratio}"),
            None => bail!("correlationSplits require strategyRatio"),
        }
    }

    pub fn is_correlation(&self) -> bool {
        !self.correlation_splits.is_empty()
    }

    /// Symbols to load: configured assets followed by features-only ones.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols = self.assets.clone();
        for symbol in &self.features_only {
            if !symbols.contains(symbol) {
                symbols.push(symbol.clone());
            }
        }
        symbols
    }
}

/// One threshold on a feature of a (possibly different) asset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrategyCondition {
    /// Empty for the traded asset.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub symbol: String,
    pub feature: String,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StrategyConfig {
    pub symbol: String,
    pub side: Side,
    #[serde(with = "serde_format::hour_of_day")]
    pub time: u32,
    /// Hours; must name one of the returns horizons.
    pub holding_time: i64,
    pub conditions: Vec<StrategyCondition>,
}

impl StrategyConfig {
    pub fn validate(&self) -> Result<()> {
        let first = self
            .conditions
            .first()
            .ok_or_else(|| anyhow!("No conditions defined for strategy on {}", self.symbol))?;
        if !first.symbol.is_empty() {
            bail!(
                "The first condition symbol must be empty, encountered '{}' instead",
                first.symbol
            );
        }
        for (index, condition) in self.conditions.iter().enumerate() {
            if condition.min < 0.0 || condition.max > 1.0 || condition.min > condition.max {
                bail!(
                    "Invalid min/max values in condition (min = {:.2}, max = {:.2})",
                    condition.min,
                    condition.max
                );
            }
            if index > 0 && condition.symbol.is_empty() {
                bail!("Only the first condition may have an unset symbol");
            }
            if find_feature(&condition.feature).is_none() {
                bail!("Unknown feature '{}'", condition.feature);
            }
        }
        if find_returns_by_hours(self.holding_time).is_none() {
            bail!("No returns horizon matches holdingTime {}h", self.holding_time);
        }
        Ok(())
    }
}

fn default_benchmark() -> String {
    "ES".to_string()
}

/// In-sample / out-of-sample backtest of a fixed strategy list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BacktestConfig {
    #[serde(with = "serde_format::date")]
    pub date_min: NaiveDate,
    #[serde(with = "serde_format::date")]
    pub date_split: NaiveDate,
    #[serde(with = "serde_format::date")]
    pub date_max: NaiveDate,
    #[serde(default)]
    pub leverage: Option<f64>,
    /// Buy-and-hold reference symbol.
    #[serde(default = "default_benchmark")]
    pub benchmark: String,
    #[serde(default = "default_segments")]
    pub segments: usize,
    pub strategies: Vec<StrategyConfig>,
}

impl BacktestConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config: BacktestConfig = read_yaml(path)?;
        config
            .validate()
            .with_context(|| format!("Invalid backtest configuration {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.date_min < self.date_split && self.date_split < self.date_max) {
            bail!(
                "Invalid dates: dateMin = {}, dateSplit = {}, dateMax = {}",
                format_date(self.date_min),
                format_date(self.date_split),
                format_date(self.date_max)
            );
        }
        if self.strategies.is_empty() {
            bail!("No strategies configured");
        }
        if self.segments == 0 {
            bail!("segments must be positive");
        }
        for strategy in &self.strategies {
            strategy.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mining_defaults_and_validation() {
        let config: MiningConfig = serde_yaml::from_str(
            r#"
assets: [ES, NQ]
featuresOnly: [VX]
dateMin: 2010-01-01
dateMax: 2020-01-01
timeMin: "09:00"
timeMax: "17:00"
hours: ["16:00"]
strategyFilter: { trades: 20, limit: 0.8 }
"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.bins, DEFAULT_BINS.to_vec());
        assert_eq!(config.symbols(), vec!["ES", "NQ", "VX"]);
        assert_eq!(config.hours, vec![16]);
        assert_eq!(config.segments, 3);
        assert!(config.enable_long && config.enable_short);
        assert!(!config.is_correlation());
    }

    #[test]
    fn rejects_inverted_dates_and_bins() {
        let mut config = MiningConfig {
            date_min: NaiveDate::from_ymd_opt(2020, 1, 1),
            date_max: NaiveDate::from_ymd_opt(2010, 1, 1),
            ..MiningConfig::default()
        };
        assert!(config.validate().is_err());
        config.date_max = None;
        config.bins = vec![Bin::new(0.5, 1.2)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn correlation_requires_ratio_and_ordered_splits() {
        let mut config = MiningConfig {
            date_min: NaiveDate::from_ymd_opt(2005, 1, 1),
            correlation_splits: vec![
                NaiveDate::from_ymd_opt(2015, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2016, 1, 1).unwrap(),
            ],
            ..MiningConfig::default()
        };
        assert!(config.validate().is_err());
        config.strategy_ratio = Some(0.1);
        config.validate().unwrap();
        config.correlation_splits.reverse();
        assert!(config.validate().is_err());
    }

    #[test]
    fn backtest_conditions_are_checked() {
        let yaml = r#"
dateMin: 2010-01-01
dateSplit: 2018-01-01
dateMax: 2020-01-01
strategies:
  - symbol: ES
    side: long
    time: "16:00"
    holdingTime: 24
    conditions:
      - feature: momentum1D
        min: 0.0
        max: 0.3
      - symbol: NQ
        feature: momentum8H
        min: 0.7
        max: 1.0
"#;
        let config: BacktestConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.benchmark, "ES");
        assert_eq!(config.strategies[0].time, 16);

        let mut broken = config.clone();
        broken.strategies[0].conditions[0].symbol = "NQ".into();
        assert!(broken.validate().is_err());

        let mut broken = config.clone();
        broken.strategies[0].conditions[1].max = 1.5;
        assert!(broken.validate().is_err());

        let mut broken = config.clone();
        broken.strategies[0].holding_time = 5;
        assert!(broken.validate().is_err());

        let mut broken = config;
        broken.date_split = broken.date_max;
        assert!(broken.validate().is_err());
    }
}
