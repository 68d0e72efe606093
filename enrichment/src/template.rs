//! Rendering-template selection and template/category consistency checks.
//!
//! Every article is rendered with the layout matching its vehicle category.
//! A stored template that disagrees with the category is a defect; the
//! orchestrator's repair pass uses [`detect_mismatch`] to find them.

use serde::{Deserialize, Serialize};

use crate::vehicle::RawVehicleData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArticleTemplate {
    Car,
    Pickup,
    Motorcycle,
}

impl ArticleTemplate {
    pub fn name(self) -> &'static str {
        match self {
            Self::Car => "tire_calibration_car",
            Self::Pickup => "tire_calibration_pickup",
            Self::Motorcycle => "tire_calibration_motorcycle",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim() {
            "tire_calibration_car" => Some(Self::Car),
            "tire_calibration_pickup" => Some(Self::Pickup),
            "tire_calibration_motorcycle" => Some(Self::Motorcycle),
            _ => None,
        }
    }

    /// Template dictated by the vehicle's category and type.
    pub fn for_vehicle(vehicle: &RawVehicleData) -> Self {
        let text = format!(
            "{} {}",
            vehicle.category.as_deref().unwrap_or(""),
            vehicle.features.vehicle_type.as_deref().unwrap_or("")
        )
        .to_lowercase();

        if ["motorcycle", "moto", "scooter"]
            .iter()
            .any(|kw| text.contains(kw))
        {
            Self::Motorcycle
        } else if ["pickup", "picape", "caminhonete", "truck"]
            .iter()
            .any(|kw| text.contains(kw))
        {
            Self::Pickup
        } else {
            Self::Car
        }
    }
}

impl std::fmt::Display for ArticleTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A stored template that does not match the vehicle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateMismatch {
    /// What is stored now (`None` when the field was never set).
    pub stored: Option<String>,
    pub expected: ArticleTemplate,
}

impl std::fmt::Display for TemplateMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "template {} should be {}",
            self.stored.as_deref().unwrap_or("<unset>"),
            self.expected
        )
    }
}

pub fn detect_mismatch(stored: Option<&str>, vehicle: &RawVehicleData) -> Option<TemplateMismatch> {
    let expected = ArticleTemplate::for_vehicle(vehicle);
    match stored.and_then(ArticleTemplate::from_name) {
        Some(actual) if actual == expected => None,
        _ => Some(TemplateMismatch {
            stored: stored.map(String::from),
            expected,
        }),
    }
}
