pub mod analyze;
pub mod archive;
pub mod asset;
pub mod backtest;
pub mod calendar;
pub mod config;
pub mod context;
pub mod contract;
pub mod correlation;
pub mod currency;
pub mod data;
pub mod feature;
pub mod generate;
pub mod mining;
pub mod progress;
pub mod quantile;
pub mod records;
pub mod roller;
pub mod simulator;
pub mod stats;
pub mod storage;
pub mod strategy;

pub use asset::Asset;
pub use config::{BacktestConfig, Configuration, MiningConfig, Side};
pub use context::Context;
pub use contract::GlobexCode;
pub use feature::{FeatureDescriptor, FeatureRecord, FEATURES, RETURNS};
