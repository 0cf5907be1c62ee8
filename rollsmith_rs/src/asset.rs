use std::path::Path;

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::calendar::serde_format;
use crate::contract::GlobexCode;

pub const USD: &str = "USD";

const fn default_f_records() -> usize {
    1
}

fn default_currency() -> String {
    USD.to_string()
}

/// Futures instrument definition loaded from `assets.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub symbol: String,
    /// Symbol used by the data vendor's file names, when it differs.
    #[serde(default, alias = "barchartSymbol")]
    pub vendor_symbol: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub tick_size: Decimal,
    /// Currency value of one tick in `currency`.
    pub tick_value: Decimal,
    /// Per-side fee in USD.
    #[serde(default)]
    pub broker_fee: Decimal,
    /// Per-side fee in USD.
    #[serde(default)]
    pub exchange_fee: Decimal,
    /// Fixed spread in ticks charged on every trade.
    #[serde(default)]
    pub spread: i64,
    #[serde(default)]
    pub margin: Decimal,

    /// Contracts earlier than this one never participate in the roll.
    #[serde(default)]
    pub legacy_cutoff: Option<GlobexCode>,
    #[serde(default)]
    pub first_filter_contract: Option<GlobexCode>,
    #[serde(default)]
    pub last_filter_contract: Option<GlobexCode>,
    #[serde(default)]
    pub include_months: Option<Vec<char>>,
    #[serde(default)]
    pub exclude_months: Option<Vec<char>>,
    /// Hourly bars known to be faulty.
    #[serde(default, with = "serde_format::timestamp_list")]
    pub exclude_records: Vec<NaiveDateTime>,
    #[serde(default, with = "serde_format::optional_date")]
    pub cutoff_date: Option<NaiveDate>,
    /// Number of continuous-contract streams (F1..Fn) to build.
    #[serde(default = "default_f_records")]
    pub f_records: usize,
    /// May only act as the secondary asset of a data-mining task.
    #[serde(default)]
    pub features_only: bool,
}

impl Asset {
    pub fn vendor_symbol(&self) -> &str {
        self.vendor_symbol.as_deref().unwrap_or(&self.symbol)
    }

    pub fn is_usd(&self) -> bool {
        self.currency.eq_ignore_ascii_case(USD)
    }

    /// Per-trade fee total in USD (broker plus exchange).
    pub fn fees(&self) -> Decimal {
        self.broker_fee + self.exchange_fee
    }

    /// Decides whether a daily row for `contract` on `date` participates in
    /// the roll. Contracts outside the filter window bypass the month filter.
    pub fn include_record(&self, date: NaiveDate, contract: &GlobexCode) -> Result<bool> {
        if self.cutoff_date.is_some_and(|cutoff| date < cutoff) {
            return Ok(false);
        }
        if let Some(legacy) = &self.legacy_cutoff {
            if contract.precedes(legacy)? {
                return Ok(false);
            }
        }
        let outside_window = match (&self.first_filter_contract, &self.last_filter_contract) {
            (Some(first), Some(last)) => contract.precedes(first)? || !contract.precedes(last)?,
            (Some(first), None) => contract.precedes(first)?,
            (None, Some(last)) => !contract.precedes(last)?,
            (None, None) => false,
        };
        if outside_window {
            return Ok(true);
        }
        if let Some(months) = &self.include_months {
            return Ok(months.contains(&contract.month));
        }
        if let Some(months) = &self.exclude_months {
            return Ok(!months.contains(&contract.month));
        }
        Ok(true)
    }

    /// Derived asset addressing the n-th continuous stream (`ES.F2`).
    pub fn for_stream(&self, f_number: usize) -> Asset {
        let mut asset = self.clone();
        asset.symbol = stream_symbol(&self.symbol, f_number);
        asset
    }
}

/// `ES` for F1, `ES.F2` for the second stream and so on.
pub fn stream_symbol(symbol: &str, f_number: usize) -> String {
    if f_number <= 1 {
        symbol.to_string()
    } else {
        format!("{symbol}.F{f_number}")
    }
}

/// Splits `ES.F2` into (`ES`, 2); plain symbols map to stream 1.
pub fn split_stream_symbol(symbol: &str) -> Result<(&str, usize)> {
    match symbol.rsplit_once(".F") {
        Some((base, number)) => {
            let f_number: usize = number
                .parse()
                .with_context(|| format!("Invalid stream suffix in symbol '{symbol}'"))?;
            Ok((base, f_number))
        }
        None => Ok((symbol, 1)),
    }
}

pub fn load_assets(path: &Path) -> Result<Vec<Asset>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Unable to read assets file {}", path.display()))?;
    let assets: Vec<Asset> = serde_yaml::from_str(&text)
        .with_context(|| format!("Failed to parse assets file {}", path.display()))?;
    for asset in &assets {
        validate_asset(asset)?;
    }
    Ok(assets)
}

fn validate_asset(asset: &Asset) -> Result<()> {
    if asset.tick_size <= Decimal::ZERO || asset.tick_value <= Decimal::ZERO {
        return Err(anyhow!(
            "Asset {} must have a positive tickSize and tickValue",
            asset.symbol
        ));
    }
    if asset.f_records == 0 {
        return Err(anyhow!("Asset {} must build at least one stream", asset.symbol));
    }
    if asset.spread < 0 {
        return Err(anyhow!("Asset {} has a negative spread", asset.symbol));
    }
    Ok(())
}

pub fn find_asset<'a>(assets: &'a [Asset], symbol: &str) -> Option<&'a Asset> {
    assets
        .iter()
        .find(|asset| asset.symbol.eq_ignore_ascii_case(symbol))
}

/// Resolves `ES` or `ES.F2` to the stream-specific asset definition.
pub fn resolve_stream(assets: &[Asset], symbol: &str) -> Result<(Asset, usize)> {
    let (base, f_number) = split_stream_symbol(symbol)?;
    let asset = find_asset(assets, base)
        .ok_or_else(|| anyhow!("Unknown asset symbol '{symbol}'"))?;
    if f_number == 0 || f_number > asset.f_records {
        return Err(anyhow!(
            "Asset {} only has {} stream(s), cannot address '{symbol}'",
            asset.symbol,
            asset.f_records
        ));
    }
    Ok((asset.for_stream(f_number), f_number))
}
