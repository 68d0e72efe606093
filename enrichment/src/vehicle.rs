//! Raw vehicle specification data as ingested from the source catalogue.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Article schema version.
///
/// `V1` articles are per model-year; `V2` articles cover a make+model
/// regardless of year.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SchemaVersion {
    #[default]
    V1,
    V2,
}

impl SchemaVersion {
    pub fn includes_year(self) -> bool {
        matches!(self, Self::V1)
    }
}

impl std::fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V1 => write!(f, "v1"),
            Self::V2 => write!(f, "v2"),
        }
    }
}

impl std::str::FromStr for SchemaVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "v1" | "1" => Ok(Self::V1),
            "v2" | "2" => Ok(Self::V2),
            other => Err(format!("unknown schema version: {other}")),
        }
    }
}

/// Tire pressures in PSI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PressureSpecs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_front: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_rear: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loaded_front: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loaded_rear: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spare: Option<f64>,
}

/// Feature flags carried by the source catalogue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct VehicleFeatures {
    #[serde(default)]
    pub has_tpms: bool,
    #[serde(default)]
    pub is_premium: bool,
    #[serde(default)]
    pub is_electric: bool,
    /// Free-form vehicle type from the catalogue (`car`, `motorcycle`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_type: Option<String>,
}

/// One row of raw vehicle specification data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RawVehicleData {
    #[serde(default)]
    pub make: String,
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tire_size: Option<String>,
    #[serde(default)]
    pub pressures: PressureSpecs,
    #[serde(default)]
    pub features: VehicleFeatures,
}

impl RawVehicleData {
    pub fn new(make: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            make: make.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_year(mut self, year: u16) -> Self {
        self.year = Some(year);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_tire_size(mut self, tire_size: impl Into<String>) -> Self {
        self.tire_size = Some(tire_size.into());
        self
    }

    pub fn with_front_pressure(mut self, psi: f64) -> Self {
        self.pressures.empty_front = Some(psi);
        self
    }

    /// Display name, e.g. `Honda Civic 2022`.
    pub fn display_name(&self, include_year: bool) -> String {
        match (include_year, self.year) {
            (true, Some(year)) => format!("{} {} {}", self.make.trim(), self.model.trim(), year),
            _ => format!("{} {}", self.make.trim(), self.model.trim()),
        }
    }

    /// Key identifying the make+model pair, ignoring case and spacing.
    pub fn make_model_key(&self) -> (String, String) {
        (normalize_key(&self.make), normalize_key(&self.model))
    }
}

fn normalize_key(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Condensed vehicle facts handed to prompt builders and validators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleInfo {
    pub make: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tire_size: Option<String>,
    pub pressures: PressureSpecs,
    pub features: VehicleFeatures,
}

impl VehicleInfo {
    pub fn from_raw(raw: &RawVehicleData, version: SchemaVersion) -> Self {
        Self {
            make: raw.make.trim().to_string(),
            model: raw.model.trim().to_string(),
            year: if version.includes_year() { raw.year } else { None },
            category: raw.category.clone(),
            tire_size: raw.tire_size.clone(),
            pressures: raw.pressures.clone(),
            features: raw.features.clone(),
        }
    }

    pub fn display_name(&self) -> String {
        match self.year {
            Some(year) => format!("{} {} {}", self.make, self.model, year),
            None => format!("{} {}", self.make, self.model),
        }
    }
}
