use std::path::Path;

use anyhow::{anyhow, bail, Result};
use once_cell::sync::OnceCell;
use tracing::info;

use crate::asset::{find_asset, load_assets, resolve_stream, Asset};
use crate::config::Configuration;
use crate::currency::CurrencyConverter;

static CONTEXT: OnceCell<Context> = OnceCell::new();

/// Configuration, instruments and FX tables shared read-only by every
/// command once loaded.
#[derive(Debug, Clone)]
pub struct Context {
    pub configuration: Configuration,
    pub assets: Vec<Asset>,
    pub currencies: CurrencyConverter,
}

impl Context {
    pub fn load(configuration_path: &Path, assets_path: &Path) -> Result<Self> {
        let configuration = Configuration::load(configuration_path)?;
        let assets = load_assets(assets_path)?;
        let currencies = CurrencyConverter::load(configuration.fx_path(), &assets)?;
        info!(
            assets = assets.len(),
            currencies = currencies.currencies().count(),
            "Loaded configuration"
        );
        Ok(Self {
            configuration,
            assets,
            currencies,
        })
    }

    pub fn asset(&self, symbol: &str) -> Result<&Asset> {
        find_asset(&self.assets, symbol).ok_or_else(|| anyhow!("Unknown asset symbol '{symbol}'"))
    }

    /// Stream-specific asset for `ES` / `ES.F2` style symbols.
    pub fn stream(&self, symbol: &str) -> Result<(Asset, usize)> {
        resolve_stream(&self.assets, symbol)
    }

    /// Every configured stream symbol (`ES`, `ES.F2`, ...) in file order.
    pub fn stream_symbols(&self) -> Vec<String> {
        self.assets
            .iter()
            .flat_map(|asset| (1..=asset.f_records).map(|f_number| asset.for_stream(f_number).symbol))
            .collect()
    }
}

/// Publishes the process-wide context. Installing twice is an error.
pub fn install(context: Context) -> Result<&'static Context> {
    if CONTEXT.set(context).is_err() {
        bail!("Context has already been initialized");
    }
    CONTEXT
        .get()
        .ok_or_else(|| anyhow!("Context initialization failed"))
}

pub fn get() -> Result<&'static Context> {
    CONTEXT
        .get()
        .ok_or_else(|| anyhow!("Context has not been initialized"))
}
