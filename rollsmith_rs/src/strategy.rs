use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use tracing::info;

use crate::calendar::{format_hour_of_day, parse_hour_of_day, serde_format};
use crate::config::{Side, StrategyCondition, StrategyConfig};
use crate::feature::{find_feature, find_returns_by_hours};

/// Feature range on a named stream.
#[derive(Clone, Debug, PartialEq)]
pub struct DescriptorCondition {
    pub symbol: String,
    pub feature: String,
    pub min: f64,
    pub max: f64,
}

/// One-line strategy description shared by mining and backtest reports:
/// `ES.momentum1D (0.00, 0.30), NQ.momentum8H (0.70, 1.00), long, 16:00, 24h`.
#[derive(Clone, Debug, PartialEq)]
pub struct StrategyDescriptor {
    pub conditions: Vec<DescriptorCondition>,
    pub side: Side,
    pub time: Option<u32>,
    pub holding_hours: i64,
}

impl fmt::Display for StrategyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for condition in &self.conditions {
            write!(
                f,
                "{}.{} ({:.2}, {:.2}), ",
                condition.symbol, condition.feature, condition.min, condition.max
            )?;
        }
        write!(f, "{}", self.side.as_str())?;
        if let Some(hour) = self.time {
            write!(f, ", {}", format_hour_of_day(hour))?;
        }
        write!(f, ", {}h", self.holding_hours)
    }
}

fn strip_enumerator(text: &str) -> &str {
    match text.split_once(". ") {
        Some((number, rest)) if !number.is_empty() && number.chars().all(|c| c.is_ascii_digit()) => rest,
        _ => text,
    }
}

fn parse_condition(head: &str, range: &str) -> Result<DescriptorCondition> {
    let (symbol, feature) = head
        .rsplit_once('.')
        .ok_or_else(|| anyhow!("Condition '{head}' must have the form SYMBOL.feature"))?;
    let (min, max) = range
        .split_once(',')
        .ok_or_else(|| anyhow!("Range '({range})' must have the form (min, max)"))?;
    Ok(DescriptorCondition {
        symbol: symbol.trim().to_string(),
        feature: feature.trim().to_string(),
        min: min.trim().parse().with_context(|| format!("Invalid minimum '{min}'"))?,
        max: max.trim().parse().with_context(|| format!("Invalid maximum '{max}'"))?,
    })
}

impl FromStr for StrategyDescriptor {
    type Err = anyhow::Error;

    fn from_str(text: &str) -> Result<Self> {
        let mut rest = strip_enumerator(text.trim());
        let mut conditions = Vec::new();
        while let Some(open) = rest.find(" (") {
            let head = &rest[..open];
            if head.contains(',') {
                break;
            }
            let close = rest[open..]
                .find(')')
                .map(|offset| open + offset)
                .ok_or_else(|| anyhow!("Unterminated range in '{text}'"))?;
            conditions.push(parse_condition(head, &rest[open + 2..close])?);
            rest = rest[close + 1..].trim_start();
            rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
        }
        if conditions.is_empty() {
            bail!("No conditions in strategy '{text}'");
        }
        let tokens: Vec<&str> = rest.split(',').map(str::trim).collect();
        let (side, time, holding) = match tokens.as_slice() {
            [side, time, holding] => (side, Some(parse_hour_of_day(time)?), holding),
            [side, holding] => (side, None, holding),
            _ => bail!("Expected 'side, HH:00, Nh' after the conditions in '{text}'"),
        };
        let holding_hours: i64 = holding
            .strip_suffix('h')
            .ok_or_else(|| anyhow!("Holding time '{holding}' must end in 'h'"))?
            .parse()
            .with_context(|| format!("Invalid holding time '{holding}'"))?;
        Ok(Self {
            conditions,
            side: side.parse()?,
            time,
            holding_hours,
        })
    }
}

impl StrategyDescriptor {
    /// Backtest definition; the first condition applies to the traded
    /// stream and loses its symbol.
    pub fn to_config(&self) -> Result<StrategyConfig> {
        let first = self
            .conditions
            .first()
            .ok_or_else(|| anyhow!("Strategy '{self}' has no conditions"))?;
        let time = self
            .time
            .ok_or_else(|| anyhow!("Strategy '{self}' has no entry time"))?;
        let conditions = self
            .conditions
            .iter()
            .enumerate()
            .map(|(index, condition)| {
                if find_feature(&condition.feature).is_none() {
                    bail!("Unknown feature '{}'", condition.feature);
                }
                Ok(StrategyCondition {
                    symbol: if index == 0 {
                        String::new()
                    } else {
                        condition.symbol.clone()
                    },
                    feature: condition.feature.clone(),
                    min: condition.min,
                    max: condition.max,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if find_returns_by_hours(self.holding_hours).is_none() {
            bail!("No returns horizon matches {}h", self.holding_hours);
        }
        let config = StrategyConfig {
            symbol: first.symbol.clone(),
            side: self.side,
            time,
            holding_time: self.holding_hours,
            conditions,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Parses one descriptor per non-empty line.
pub fn parse_descriptors(text: &str) -> Result<Vec<StrategyDescriptor>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            line.parse()
                .with_context(|| format!("Invalid strategy on line {}", index + 1))
        })
        .collect()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StrategyYaml {
    #[serde(with = "serde_format::optional_date", skip_serializing_if = "Option::is_none")]
    date_min: Option<NaiveDate>,
    #[serde(with = "serde_format::optional_date", skip_serializing_if = "Option::is_none")]
    date_split: Option<NaiveDate>,
    #[serde(with = "serde_format::optional_date", skip_serializing_if = "Option::is_none")]
    date_max: Option<NaiveDate>,
    strategies: Vec<StrategyConfig>,
}

/// Optional backtest dates written ahead of the strategy list.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BacktestDates {
    pub date_min: Option<NaiveDate>,
    pub date_split: Option<NaiveDate>,
    pub date_max: Option<NaiveDate>,
}

pub fn render_strategy_yaml(descriptors: &[StrategyDescriptor], dates: BacktestDates) -> Result<String> {
    let strategies = descriptors
        .iter()
        .map(StrategyDescriptor::to_config)
        .collect::<Result<Vec<_>>>()?;
    let document = StrategyYaml {
        date_min: dates.date_min,
        date_split: dates.date_split,
        date_max: dates.date_max,
        strategies,
    };
    serde_yaml::to_string(&document).context("Failed to serialize strategies")
}

/// Converts a descriptor list file into a backtest YAML file.
pub fn emit_strategy_yaml(input: &Path, output: &Path, dates: BacktestDates) -> Result<usize> {
    let text = std::fs::read_to_string(input)
        .with_context(|| format!("Unable to read strategy list {}", input.display()))?;
    let descriptors = parse_descriptors(&text)?;
    if descriptors.is_empty() {
        bail!("No strategies found in {}", input.display());
    }
    let yaml = render_strategy_yaml(&descriptors, dates)?;
    std::fs::write(output, yaml).with_context(|| format!("Failed to write {}", output.display()))?;
    info!(
        strategies = descriptors.len(),
        path = %output.display(),
        "Wrote strategy YAML"
    );
    Ok(descriptors.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BacktestConfig;

    #[test]
    fn parses_two_condition_descriptor() -> Result<()> {
        let text = "3. ES.momentum1D (0.00, 0.30), NQ.F2.momentum8H (0.70, 1.00), short, 16:00, 24h";
        let descriptor: StrategyDescriptor = text.parse()?;
        assert_eq!(descriptor.conditions.len(), 2);
        assert_eq!(descriptor.conditions[1].symbol, "NQ.F2");
        assert_eq!(descriptor.conditions[1].feature, "momentum8H");
        assert_eq!(descriptor.side, Side::Short);
        assert_eq!(descriptor.time, Some(16));
        assert_eq!(descriptor.holding_hours, 24);
        assert_eq!(descriptor.to_string(), &text[3..]);
        Ok(())
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!("long, 16:00, 24h".parse::<StrategyDescriptor>().is_err());
        assert!("ES.momentum1D (0.00 0.30), long, 16:00, 24h"
            .parse::<StrategyDescriptor>()
            .is_err());
        assert!("ES.momentum1D (0.00, 0.30), long, 16:30, 24h"
            .parse::<StrategyDescriptor>()
            .is_err());
        assert!("ES.momentum1D (0.00, 0.30), sideways, 16:00, 24h"
            .parse::<StrategyDescriptor>()
            .is_err());
    }

    #[test]
    fn yaml_round_trips_into_backtest_config() -> Result<()> {
        let descriptors = parse_descriptors(
            "1. ES.momentum1D (0.00, 0.30), NQ.momentum8H (0.70, 1.00), long, 16:00, 24h\n\n\
             2. NQ.momentum2D (0.35, 0.65), short, 10:00, 48h\n",
        )?;
        let dates = BacktestDates {
            date_min: NaiveDate::from_ymd_opt(2010, 1, 1),
            date_split: NaiveDate::from_ymd_opt(2018, 1, 1),
            date_max: NaiveDate::from_ymd_opt(2020, 1, 1),
        };
        let yaml = render_strategy_yaml(&descriptors, dates)?;
        let config: BacktestConfig = serde_yaml::from_str(&yaml)?;
        config.validate()?;
        assert_eq!(config.strategies.len(), 2);
        assert_eq!(config.strategies[0].symbol, "ES");
        assert!(config.strategies[0].conditions[0].symbol.is_empty());
        assert_eq!(config.strategies[0].conditions[1].symbol, "NQ");
        assert_eq!(config.strategies[1].holding_time, 48);
        Ok(())
    }

    #[test]
    fn descriptors_without_time_cannot_be_backtested() -> Result<()> {
        let descriptor: StrategyDescriptor = "ES.momentum1D (0.00, 0.30), long, 24h".parse()?;
        assert_eq!(descriptor.time, None);
        assert!(descriptor.to_config().is_err());
        Ok(())
    }
}
