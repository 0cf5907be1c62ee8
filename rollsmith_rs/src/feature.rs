use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// How a feature is remapped into quantile space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantileMode {
    /// Scored against an ever-growing prefix of the series.
    Anchored,
    /// Scored within a sliding window.
    Rolling,
}

/// Slot of a momentum feature inside [`FeatureRecord`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FeatureField {
    Momentum1H,
    Momentum2H,
    Momentum4H,
    Momentum8H,
    Momentum1D,
    Momentum1DLag,
    Momentum2D,
    Momentum5D,
    Momentum10D,
}

/// Slot of a forward-return label inside [`FeatureRecord`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReturnsField {
    Returns4H,
    Returns8H,
    Returns16H,
    Returns24H,
    Returns48H,
    Returns72H,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FeatureDescriptor {
    pub name: &'static str,
    pub field: FeatureField,
    pub mode: QuantileMode,
    /// Distance in hours between the evaluated close and the base close.
    pub offset_hours: i64,
    /// Hours the evaluated close is shifted back from the record timestamp.
    pub lag_hours: i64,
}

impl FeatureDescriptor {
    const fn new(
        name: &'static str,
        field: FeatureField,
        mode: QuantileMode,
        offset_hours: i64,
        lag_hours: i64,
    ) -> Self {
        Self {
            name,
            field,
            mode,
            offset_hours,
            lag_hours,
        }
    }

    pub fn anchored(&self) -> bool {
        self.mode == QuantileMode::Anchored
    }

    pub fn get(&self, record: &FeatureRecord) -> Option<f64> {
        record.feature(self.field)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReturnsDescriptor {
    pub name: &'static str,
    pub field: ReturnsField,
    /// Holding horizon in hours.
    pub holding_hours: i64,
}

impl ReturnsDescriptor {
    pub fn get<'a>(&self, record: &'a FeatureRecord) -> Option<&'a ReturnsRecord> {
        record.returns(self.field)
    }
}

use FeatureField as F;
use QuantileMode::{Anchored, Rolling};

/// Momentum features. Hourly horizons are quantile-ranked in rolling
/// windows, daily horizons against the anchored prefix.
pub static FEATURES: [FeatureDescriptor; 9] = [
    FeatureDescriptor::new("momentum1H", F::Momentum1H, Rolling, 1, 0),
    FeatureDescriptor::new("momentum2H", F::Momentum2H, Rolling, 2, 0),
    FeatureDescriptor::new("momentum4H", F::Momentum4H, Rolling, 4, 0),
    FeatureDescriptor::new("momentum8H", F::Momentum8H, Rolling, 8, 0),
    FeatureDescriptor::new("momentum1D", F::Momentum1D, Anchored, 24, 0),
    FeatureDescriptor::new("momentum1DLag", F::Momentum1DLag, Anchored, 48, 24),
    FeatureDescriptor::new("momentum2D", F::Momentum2D, Anchored, 48, 0),
    FeatureDescriptor::new("momentum5D", F::Momentum5D, Anchored, 120, 0),
    FeatureDescriptor::new("momentum10D", F::Momentum10D, Anchored, 240, 0),
];

pub static RETURNS: [ReturnsDescriptor; 6] = [
    ReturnsDescriptor {
        name: "returns4H",
        field: ReturnsField::Returns4H,
        holding_hours: 4,
    },
    ReturnsDescriptor {
        name: "returns8H",
        field: ReturnsField::Returns8H,
        holding_hours: 8,
    },
    ReturnsDescriptor {
        name: "returns16H",
        field: ReturnsField::Returns16H,
        holding_hours: 16,
    },
    ReturnsDescriptor {
        name: "returns24H",
        field: ReturnsField::Returns24H,
        holding_hours: 24,
    },
    ReturnsDescriptor {
        name: "returns48H",
        field: ReturnsField::Returns48H,
        holding_hours: 48,
    },
    ReturnsDescriptor {
        name: "returns72H",
        field: ReturnsField::Returns72H,
        holding_hours: 72,
    },
];

pub fn find_feature(name: &str) -> Option<&'static FeatureDescriptor> {
    FEATURES.iter().find(|feature| feature.name == name)
}

pub fn find_returns(name: &str) -> Option<&'static ReturnsDescriptor> {
    RETURNS.iter().find(|returns| returns.name == name)
}

pub fn find_returns_by_hours(hours: i64) -> Option<&'static ReturnsDescriptor> {
    RETURNS.iter().find(|returns| returns.holding_hours == hours)
}

/// Forward-return label in ticks. `close1` is the entry close and `close2`
/// the exit close; `high`/`low` bracket the closes after entry up to exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReturnsRecord {
    pub high: i64,
    pub low: i64,
    pub close1: i64,
    pub close2: i64,
}

impl ReturnsRecord {
    /// Realized tick P&L of a long position.
    pub fn ticks(&self) -> i64 {
        self.close2 - self.close1
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DailyRecord {
    pub date: NaiveDate,
    pub close: f64,
}

/// Features and labels for one hourly timestamp of a continuous series.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    #[serde(rename = "Timestamp")]
    pub timestamp: NaiveDateTime,
    #[serde(rename = "Momentum1H")]
    pub momentum_1h: Option<f64>,
    #[serde(rename = "Momentum2H")]
    pub momentum_2h: Option<f64>,
    #[serde(rename = "Momentum4H")]
    pub momentum_4h: Option<f64>,
    #[serde(rename = "Momentum8H")]
    pub momentum_8h: Option<f64>,
    #[serde(rename = "Momentum1D")]
    pub momentum_1d: Option<f64>,
    #[serde(rename = "Momentum1DLag")]
    pub momentum_1d_lag: Option<f64>,
    #[serde(rename = "Momentum2D")]
    pub momentum_2d: Option<f64>,
    #[serde(rename = "Momentum5D")]
    pub momentum_5d: Option<f64>,
    #[serde(rename = "Momentum10D")]
    pub momentum_10d: Option<f64>,
    #[serde(rename = "Returns4H")]
    pub returns_4h: Option<ReturnsRecord>,
    #[serde(rename = "Returns8H")]
    pub returns_8h: Option<ReturnsRecord>,
    #[serde(rename = "Returns16H")]
    pub returns_16h: Option<ReturnsRecord>,
    #[serde(rename = "Returns24H")]
    pub returns_24h: Option<ReturnsRecord>,
    #[serde(rename = "Returns48H")]
    pub returns_48h: Option<ReturnsRecord>,
    #[serde(rename = "Returns72H")]
    pub returns_72h: Option<ReturnsRecord>,
}

impl FeatureRecord {
    pub fn new(timestamp: NaiveDateTime) -> Self {
        Self {
            timestamp,
            ..Self::default()
        }
    }

    pub fn feature(&self, field: FeatureField) -> Option<f64> {
        match field {
            F::Momentum1H => self.momentum_1h,
            F::Momentum2H => self.momentum_2h,
            F::Momentum4H => self.momentum_4h,
            F::Momentum8H => self.momentum_8h,
            F::Momentum1D => self.momentum_1d,
            F::Momentum1DLag => self.momentum_1d_lag,
            F::Momentum2D => self.momentum_2d,
            F::Momentum5D => self.momentum_5d,
            F::Momentum10D => self.momentum_10d,
        }
    }

    pub fn feature_mut(&mut self, field: FeatureField) -> &mut Option<f64> {
        match field {
            F::Momentum1H => &mut self.momentum_1h,
            F::Momentum2H => &mut self.momentum_2h,
            F::Momentum4H => &mut self.momentum_4h,
            F::Momentum8H => &mut self.momentum_8h,
            F::Momentum1D => &mut self.momentum_1d,
            F::Momentum1DLag => &mut self.momentum_1d_lag,
            F::Momentum2D => &mut self.momentum_2d,
            F::Momentum5D => &mut self.momentum_5d,
            F::Momentum10D => &mut self.momentum_10d,
        }
    }

    pub fn returns(&self, field: ReturnsField) -> Option<&ReturnsRecord> {
        match field {
            ReturnsField::Returns4H => self.returns_4h.as_ref(),
            ReturnsField::Returns8H => self.returns_8h.as_ref(),
            ReturnsField::Returns16H => self.returns_16h.as_ref(),
            ReturnsField::Returns24H => self.returns_24h.as_ref(),
            ReturnsField::Returns48H => self.returns_48h.as_ref(),
            ReturnsField::Returns72H => self.returns_72h.as_ref(),
        }
    }

    pub fn returns_mut(&mut self, field: ReturnsField) -> &mut Option<ReturnsRecord> {
        match field {
            ReturnsField::Returns4H => &mut self.returns_4h,
            ReturnsField::Returns8H => &mut self.returns_8h,
            ReturnsField::Returns16H => &mut self.returns_16h,
            ReturnsField::Returns24H => &mut self.returns_24h,
            ReturnsField::Returns48H => &mut self.returns_48h,
            ReturnsField::Returns72H => &mut self.returns_72h,
        }
    }

    pub fn has_features(&self) -> bool {
        FEATURES.iter().any(|feature| feature.get(self).is_some())
    }

    pub fn has_returns(&self) -> bool {
        RETURNS.iter().any(|returns| returns.get(self).is_some())
    }

    /// Records with neither a feature nor a label are never archived.
    pub fn is_empty(&self) -> bool {
        !self.has_features() && !self.has_returns()
    }
}
