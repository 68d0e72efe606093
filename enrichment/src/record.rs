//! The persisted calibration record and its enrichment phase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::article::{ArticleSkeleton, EditorialEnhancements, TechnicalEnhancements};
use crate::escalation::{current_sequence, AttemptRecord, ErrorCategory, RefinementPhase};
use crate::vehicle::{RawVehicleData, SchemaVersion, VehicleInfo};

/// Pipeline phase of a [`CalibrationRecord`].
///
/// Forward order is `pending` through `published`. `failed` sits outside
/// the order and is left only by an operator reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnrichmentPhase {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "vehicle_enriched")]
    VehicleEnriched,
    #[serde(rename = "article_generated")]
    ArticleGenerated,
    #[serde(rename = "claude_3a_completed")]
    Claude3aCompleted,
    #[serde(rename = "claude_3b_completed")]
    Claude3bCompleted,
    #[serde(rename = "published")]
    Published,
    #[serde(rename = "failed")]
    Failed,
}

impl EnrichmentPhase {
    pub const FORWARD: [EnrichmentPhase; 6] = [
        Self::Pending,
        Self::VehicleEnriched,
        Self::ArticleGenerated,
        Self::Claude3aCompleted,
        Self::Claude3bCompleted,
        Self::Published,
    ];

    /// Position in the forward order. `None` for `failed`.
    pub fn ordinal(self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::VehicleEnriched => Some(1),
            Self::ArticleGenerated => Some(2),
            Self::Claude3aCompleted => Some(3),
            Self::Claude3bCompleted => Some(4),
            Self::Published => Some(5),
            Self::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Published | Self::Failed)
    }

    /// The phase a successful step moves to.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Pending => Some(Self::VehicleEnriched),
            Self::VehicleEnriched => Some(Self::ArticleGenerated),
            Self::ArticleGenerated => Some(Self::Claude3aCompleted),
            Self::Claude3aCompleted => Some(Self::Claude3bCompleted),
            Self::Claude3bCompleted => Some(Self::Published),
            Self::Published | Self::Failed => None,
        }
    }

    /// Whether `self` is at or past `other` in the forward order.
    pub fn reached(self, other: Self) -> bool {
        match (self.ordinal(), other.ordinal()) {
            (Some(a), Some(b)) => a >= b,
            _ => self == other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::VehicleEnriched => "vehicle_enriched",
            Self::ArticleGenerated => "article_generated",
            Self::Claude3aCompleted => "claude_3a_completed",
            Self::Claude3bCompleted => "claude_3b_completed",
            Self::Published => "published",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for EnrichmentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EnrichmentPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::FORWARD
            .into_iter()
            .chain(std::iter::once(Self::Failed))
            .find(|p| p.as_str() == s.trim())
            .ok_or_else(|| format!("unknown enrichment phase: {s}"))
    }
}

/// A vehicle moving through the enrichment pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub id: Uuid,
    pub version: SchemaVersion,
    pub vehicle: RawVehicleData,
    /// Stored template name. Checked against the vehicle by template repair.
    #[serde(default)]
    pub template: Option<String>,
    pub enrichment_phase: EnrichmentPhase,

    #[serde(default)]
    pub generated_article: Option<ArticleSkeleton>,
    #[serde(default)]
    pub claude_phase_3a_enhancements: Option<EditorialEnhancements>,
    #[serde(default)]
    pub claude_phase_3b_enhancements: Option<TechnicalEnhancements>,
    #[serde(default)]
    pub article_refined: Option<ArticleSkeleton>,
    #[serde(default)]
    pub claude_refinement_version: Option<String>,

    #[serde(default)]
    pub data_completeness_score: f64,
    #[serde(default)]
    pub processing_attempts: u32,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_error_category: Option<ErrorCategory>,

    /// Append-only log of refinement attempts.
    #[serde(default)]
    pub escalation_history: Vec<AttemptRecord>,
    /// Start of the current escalation sequence after a reset or repair.
    #[serde(default)]
    pub escalation_reset_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub vehicle_enriched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub article_generated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub claude_3a_completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub claude_3b_completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped by the store on every successful write.
    #[serde(default)]
    pub revision: u64,
}

impl CalibrationRecord {
    /// A fresh `pending` record.
    pub fn new(vehicle: RawVehicleData, version: SchemaVersion) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            version,
            vehicle,
            template: None,
            enrichment_phase: EnrichmentPhase::Pending,
            generated_article: None,
            claude_phase_3a_enhancements: None,
            claude_phase_3b_enhancements: None,
            article_refined: None,
            claude_refinement_version: None,
            data_completeness_score: 0.0,
            processing_attempts: 0,
            error_count: 0,
            last_error: None,
            last_error_category: None,
            escalation_history: Vec::new(),
            escalation_reset_at: None,
            vehicle_enriched_at: None,
            article_generated_at: None,
            claude_3a_completed_at: None,
            claude_3b_completed_at: None,
            published_at: None,
            failed_at: None,
            created_at: now,
            updated_at: now,
            revision: 0,
        }
    }

    pub fn display_name(&self) -> String {
        self.vehicle.display_name(self.version.includes_year())
    }

    pub fn vehicle_info(&self) -> VehicleInfo {
        VehicleInfo::from_raw(&self.vehicle, self.version)
    }

    /// Identity used to skip duplicate ingestion: version, make, model and
    /// (for year-aware versions) year.
    pub fn identity_key(&self) -> (SchemaVersion, String, String, Option<u16>) {
        let (make, model) = self.vehicle.make_model_key();
        let year = if self.version.includes_year() {
            self.vehicle.year
        } else {
            None
        };
        (self.version, make, model, year)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Append an attempt to the escalation history.
    pub fn record_attempt(&mut self, attempt: AttemptRecord) {
        self.processing_attempts += 1;
        if let (Some(category), Some(message)) = (attempt.error_category, &attempt.error_message) {
            self.last_error = Some(message.clone());
            self.last_error_category = Some(category);
            self.error_count += 1;
        }
        self.escalation_history.push(attempt);
        self.touch();
    }

    pub fn record_error(&mut self, message: impl Into<String>, category: ErrorCategory) {
        self.last_error = Some(message.into());
        self.last_error_category = Some(category);
        self.error_count += 1;
        self.touch();
    }

    /// The current escalation sequence for `phase`.
    pub fn sequence_for(&self, phase: RefinementPhase) -> Vec<AttemptRecord> {
        current_sequence(&self.escalation_history, phase, self.escalation_reset_at)
    }

    /// Drop both refinement payloads and the merged article.
    pub fn clear_refinement(&mut self) {
        self.claude_phase_3a_enhancements = None;
        self.claude_phase_3b_enhancements = None;
        self.article_refined = None;
        self.claude_refinement_version = None;
        self.claude_3a_completed_at = None;
        self.claude_3b_completed_at = None;
    }

    /// Drop phase 3B output, which was built on the current 3A text.
    pub fn clear_technical(&mut self) {
        self.claude_phase_3b_enhancements = None;
        self.article_refined = None;
        self.claude_refinement_version = None;
        self.claude_3b_completed_at = None;
    }

    pub(crate) fn stamp_phase(&mut self, phase: EnrichmentPhase, at: DateTime<Utc>) {
        let slot = match phase {
            EnrichmentPhase::Pending => None,
            EnrichmentPhase::VehicleEnriched => Some(&mut self.vehicle_enriched_at),
            EnrichmentPhase::ArticleGenerated => Some(&mut self.article_generated_at),
            EnrichmentPhase::Claude3aCompleted => Some(&mut self.claude_3a_completed_at),
            EnrichmentPhase::Claude3bCompleted => Some(&mut self.claude_3b_completed_at),
            EnrichmentPhase::Published => Some(&mut self.published_at),
            EnrichmentPhase::Failed => Some(&mut self.failed_at),
        };
        if let Some(slot) = slot {
            *slot = Some(at);
        }
        self.updated_at = at;
    }
}
