use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use chrono::{Duration, NaiveDateTime};
use rust_decimal::Decimal;

use crate::asset::{Asset, USD};
use crate::calendar::format_timestamp;
use crate::data::read_fx_closes;

/// Hours probed backwards from the conversion timestamp.
pub const FX_LOOKBACK_HOURS: i64 = 50;

pub fn fx_csv_path(fx_dir: &Path, currency: &str) -> PathBuf {
    fx_dir.join(format!("^{currency}{USD}.H1.csv"))
}

/// Hourly `{currency}/USD` closes for every non-USD currency in use.
#[derive(Debug, Default, Clone)]
pub struct CurrencyConverter {
    rates: HashMap<String, BTreeMap<NaiveDateTime, Decimal>>,
}

impl CurrencyConverter {
    /// Loads one FX file per distinct non-USD currency of `assets`.
    pub fn load(fx_dir: &Path, assets: &[Asset]) -> Result<Self> {
        let mut converter = Self::default();
        for asset in assets.iter().filter(|asset| !asset.is_usd()) {
            let currency = asset.currency.to_ascii_uppercase();
            if converter.rates.contains_key(&currency) {
                continue;
            }
            let closes = read_fx_closes(&fx_csv_path(fx_dir, &currency))?;
            converter.rates.insert(currency, closes);
        }
        Ok(converter)
    }

    pub fn insert(&mut self, currency: &str, closes: BTreeMap<NaiveDateTime, Decimal>) {
        self.rates.insert(currency.to_ascii_uppercase(), closes);
    }

    pub fn currencies(&self) -> impl Iterator<Item = &str> {
        self.rates.keys().map(String::as_str)
    }

    /// Converts `amount` in `currency` to USD using the latest close at or
    /// before `timestamp`, looking back at most [`FX_LOOKBACK_HOURS`].
    pub fn convert(&self, amount: Decimal, currency: &str, timestamp: NaiveDateTime) -> Result<Decimal> {
        if currency.eq_ignore_ascii_case(USD) {
            return Ok(amount);
        }
        let closes = self
            .rates
            .get(&currency.to_ascii_uppercase())
            .ok_or_else(|| anyhow!("No FX rates loaded for currency {currency}"))?;
        for hours in 0..=FX_LOOKBACK_HOURS {
            if let Some(rate) = closes.get(&(timestamp - Duration::hours(hours))) {
                return Ok(amount * rate);
            }
        }
        Err(anyhow!(
            "Unable to find {currency}{USD} rate for {} within {FX_LOOKBACK_HOURS} hours",
            format_timestamp(timestamp)
        ))
    }
}
