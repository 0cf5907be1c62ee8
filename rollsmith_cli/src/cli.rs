use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};

use rollsmith_rs::calendar::parse_date;
use rollsmith_rs::config::{DEFAULT_ASSETS_PATH, DEFAULT_CONFIGURATION_PATH};
use rollsmith_rs::strategy::BacktestDates;

#[derive(Parser, Debug)]
#[command(
    name = "rollsmith",
    version,
    about = "Continuous futures archives, threshold search and strategy backtests"
)]
pub struct Cli {
    /// Global configuration with data, archive and FX paths
    #[arg(
        long,
        global = true,
        value_name = "FILE",
        default_value = DEFAULT_CONFIGURATION_PATH,
        value_hint = clap::ValueHint::FilePath
    )]
    pub config: PathBuf,

    /// Instrument definitions
    #[arg(
        long,
        global = true,
        value_name = "FILE",
        default_value = DEFAULT_ASSETS_PATH,
        value_hint = clap::ValueHint::FilePath
    )]
    pub assets: PathBuf,

    /// Also append log output to this file
    #[arg(long = "log-file", global = true, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build feature archives from the raw daily and hourly CSVs
    Generate(GenerateArgs),
    /// Print descriptive statistics of an archive's features and labels
    Analyze(AnalyzeArgs),
    /// Score a fixed strategy list in and out of sample
    Backtest(BacktestArgs),
    /// Search feature threshold pairs for profitable strategies
    #[command(name = "data-mine")]
    DataMine(DataMineArgs),
    /// Correlate in-sample metrics of mined strategies with their OOS performance
    #[command(name = "oos-correlation")]
    OosCorrelation(OosCorrelationArgs),
    /// Convert a strategy descriptor list into a backtest YAML file
    #[command(name = "emit-strategy-yaml")]
    EmitStrategyYaml(EmitStrategyYamlArgs),
}

impl Commands {
    /// Whether the command reads configuration, instruments and FX tables.
    pub fn needs_context(&self) -> bool {
        !matches!(self, Commands::EmitStrategyYaml(_))
    }
}

#[derive(Args, Debug)]
pub struct GenerateArgs {
    /// Only (re)build this asset; its archives are always overwritten
    #[arg(long)]
    pub symbol: Option<String>,
}

#[derive(Args, Debug)]
pub struct AnalyzeArgs {
    /// Stream symbol, e.g. ES or ES.F2
    #[arg(long)]
    pub symbol: String,

    /// Write the statistics as JSON
    #[arg(long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct BacktestArgs {
    #[arg(long = "config-file", value_name = "FILE", value_hint = clap::ValueHint::FilePath)]
    pub config_file: PathBuf,

    /// Write the report as JSON
    #[arg(long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct DataMineArgs {
    #[arg(long = "config-file", value_name = "FILE", value_hint = clap::ValueHint::FilePath)]
    pub config_file: PathBuf,

    /// Report directory; defaults to the configured temp path
    #[arg(long = "output-dir", value_hint = clap::ValueHint::DirPath)]
    pub output_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct OosCorrelationArgs {
    #[arg(long = "config-file", value_name = "FILE", value_hint = clap::ValueHint::FilePath)]
    pub config_file: PathBuf,
}

#[derive(Args, Debug)]
pub struct EmitStrategyYamlArgs {
    /// Descriptor list, one strategy per line
    #[arg(long, value_name = "FILE")]
    pub input: PathBuf,

    #[arg(long, value_name = "FILE")]
    pub output: PathBuf,

    #[arg(long = "date-min", value_parser = parse_date_arg)]
    pub date_min: Option<NaiveDate>,

    #[arg(long = "date-split", value_parser = parse_date_arg)]
    pub date_split: Option<NaiveDate>,

    #[arg(long = "date-max", value_parser = parse_date_arg)]
    pub date_max: Option<NaiveDate>,
}

impl EmitStrategyYamlArgs {
    pub fn dates(&self) -> BacktestDates {
        BacktestDates {
            date_min: self.date_min,
            date_split: self.date_split,
            date_max: self.date_max,
        }
    }
}

fn parse_date_arg(raw: &str) -> Result<NaiveDate, String> {
    parse_date(raw).map_err(|err| format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "rollsmith",
            "analyze",
            "--symbol",
            "ES.F2",
            "--config",
            "other.yaml",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("other.yaml"));
        assert_eq!(cli.assets, PathBuf::from(DEFAULT_ASSETS_PATH));
        match cli.command {
            Commands::Analyze(args) => assert_eq!(args.symbol, "ES.F2"),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn emit_strategy_yaml_needs_no_context() {
        let cli = Cli::try_parse_from([
            "rollsmith",
            "emit-strategy-yaml",
            "--input",
            "in.txt",
            "--output",
            "out.yaml",
            "--date-split",
            "2018-01-01",
        ])
        .unwrap();
        assert!(!cli.command.needs_context());
        let Commands::EmitStrategyYaml(args) = cli.command else {
            panic!("unexpected command");
        };
        assert_eq!(args.dates().date_split, NaiveDate::from_ymd_opt(2018, 1, 1));
        let invalid = Cli::try_parse_from([
            "rollsmith",
            "emit-strategy-yaml",
            "--input",
            "a",
            "--output",
            "b",
            "--date-min",
            "2018-13-01",
        ]);
        assert!(invalid.is_err());
    }
}
