use std::path::{Path, PathBuf};

use enrichment::{EnrichmentPhase, ModelTier, SchemaVersion};
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_API_URL: &str = "https://api.anthropic.com/v1/messages";
pub const DEFAULT_API_VERSION: &str = "2023-06-01";

pub const MAX_LIMIT: usize = 500;
pub const MAX_DELAY_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} is not set")]
    Missing { var: &'static str },

    #[error("invalid {field} `{value}`: {reason}")]
    Invalid {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Deployment environment. API-spending commands only run in
/// `production` and `staging`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppEnvironment {
    Production,
    Staging,
    Local,
    Testing,
}

impl AppEnvironment {
    pub fn allows_api_calls(self) -> bool {
        matches!(self, Self::Production | Self::Staging)
    }
}

impl std::fmt::Display for AppEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Production => write!(f, "production"),
            Self::Staging => write!(f, "staging"),
            Self::Local => write!(f, "local"),
            Self::Testing => write!(f, "testing"),
        }
    }
}

impl std::str::FromStr for AppEnvironment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "staging" => Ok(Self::Staging),
            "local" | "dev" | "development" => Ok(Self::Local),
            "testing" | "test" => Ok(Self::Testing),
            other => Err(ConfigError::Invalid {
                field: "CALIBRATION_ENV",
                value: other.to_string(),
                reason: "expected production, staging, local or testing".into(),
            }),
        }
    }
}

/// Model identifier per tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierModels {
    pub standard: String,
    pub intermediate: String,
    pub premium: String,
}

impl TierModels {
    pub fn for_tier(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Standard => &self.standard,
            ModelTier::Intermediate => &self.intermediate,
            ModelTier::Premium => &self.premium,
        }
    }
}

impl Default for TierModels {
    fn default() -> Self {
        Self {
            standard: ModelTier::Standard.default_model_id().into(),
            intermediate: ModelTier::Intermediate.default_model_id().into(),
            premium: ModelTier::Premium.default_model_id().into(),
        }
    }
}

/// Process-wide pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub environment: AppEnvironment,
    pub api_key: Option<String>,
    pub api_url: String,
    pub api_version: String,
    pub models: TierModels,
    /// HTTP retries per completion call.
    pub max_retries: u32,
    pub request_timeout_secs: u64,
    pub store_path: PathBuf,
    /// Minimum completeness (percent) for a record to enter the pipeline.
    pub min_completeness_percent: f64,
    /// Refinement attempts per record within one run before deferring it
    /// to the next run.
    pub attempts_per_run: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            environment: AppEnvironment::Production,
            api_key: None,
            api_url: DEFAULT_API_URL.into(),
            api_version: DEFAULT_API_VERSION.into(),
            models: TierModels::default(),
            max_retries: 3,
            request_timeout_secs: 120,
            store_path: PathBuf::from("calibration-records.json"),
            min_completeness_percent: 70.0,
            attempts_per_run: 4,
        }
    }
}

/// Optional `--config` TOML overlay. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    environment: Option<String>,
    api_key: Option<String>,
    api_url: Option<String>,
    api_version: Option<String>,
    max_retries: Option<u32>,
    request_timeout_secs: Option<u64>,
    store_path: Option<PathBuf>,
    min_completeness_percent: Option<f64>,
    attempts_per_run: Option<u32>,
    #[serde(default)]
    models: ModelsSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModelsSection {
    standard: Option<String>,
    intermediate: Option<String>,
    premium: Option<String>,
}

impl PipelineConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from a variable lookup, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(env) = var("CALIBRATION_ENV") {
            config.environment = env.parse()?;
        }
        config.api_key = var("ANTHROPIC_API_KEY");
        if let Some(url) = var("ANTHROPIC_API_URL") {
            config.api_url = url;
        }
        if let Some(version) = var("ANTHROPIC_VERSION") {
            config.api_version = version;
        }
        if let Some(model) = var("CALIBRATION_MODEL_STANDARD") {
            config.models.standard = model;
        }
        if let Some(model) = var("CALIBRATION_MODEL_INTERMEDIATE") {
            config.models.intermediate = model;
        }
        if let Some(model) = var("CALIBRATION_MODEL_PREMIUM") {
            config.models.premium = model;
        }
        if let Some(raw) = var("CALIBRATION_MAX_RETRIES") {
            config.max_retries = parse_number("CALIBRATION_MAX_RETRIES", &raw)?;
        }
        if let Some(raw) = var("CALIBRATION_REQUEST_TIMEOUT_SECS") {
            config.request_timeout_secs = parse_number("CALIBRATION_REQUEST_TIMEOUT_SECS", &raw)?;
        }
        if let Some(path) = var("CALIBRATION_STORE_PATH") {
            config.store_path = PathBuf::from(path);
        }
        if let Some(raw) = var("CALIBRATION_MIN_COMPLETENESS") {
            config.min_completeness_percent = parse_number("CALIBRATION_MIN_COMPLETENESS", &raw)?;
        }
        if let Some(raw) = var("CALIBRATION_ATTEMPTS_PER_RUN") {
            config.attempts_per_run = parse_number("CALIBRATION_ATTEMPTS_PER_RUN", &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Overlay values from a TOML file on top of `self`.
    pub fn with_file(mut self, path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: ConfigFile = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(env) = file.environment {
            self.environment = env.parse()?;
        }
        if file.api_key.is_some() {
            self.api_key = file.api_key;
        }
        self.api_url = file.api_url.unwrap_or(self.api_url);
        self.api_version = file.api_version.unwrap_or(self.api_version);
        self.max_retries = file.max_retries.unwrap_or(self.max_retries);
        self.request_timeout_secs = file.request_timeout_secs.unwrap_or(self.request_timeout_secs);
        self.store_path = file.store_path.unwrap_or(self.store_path);
        self.min_completeness_percent = file
            .min_completeness_percent
            .unwrap_or(self.min_completeness_percent);
        self.attempts_per_run = file.attempts_per_run.unwrap_or(self.attempts_per_run);
        self.models.standard = file.models.standard.unwrap_or(self.models.standard);
        self.models.intermediate = file.models.intermediate.unwrap_or(self.models.intermediate);
        self.models.premium = file.models.premium.unwrap_or(self.models.premium);

        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=100.0).contains(&self.min_completeness_percent) {
            return Err(ConfigError::Invalid {
                field: "min_completeness_percent",
                value: self.min_completeness_percent.to_string(),
                reason: "must be between 0 and 100".into(),
            });
        }
        if self.attempts_per_run == 0 {
            return Err(ConfigError::Invalid {
                field: "attempts_per_run",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "request_timeout_secs",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// The API key, or an error naming the variable to set.
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key.as_deref().ok_or(ConfigError::Missing {
            var: "ANTHROPIC_API_KEY",
        })
    }

    /// Completeness threshold on the 0-10 score scale.
    pub fn min_completeness_score(&self) -> f64 {
        self.min_completeness_percent / 10.0
    }
}

fn parse_number<T: std::str::FromStr>(field: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
        field,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

/// Validated per-invocation options shared by every pipeline command.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub limit: usize,
    pub category: Option<String>,
    pub make: Option<String>,
    pub version: Option<SchemaVersion>,
    pub dry_run: bool,
    pub force: bool,
    pub delay_secs: u64,
    pub debug: bool,
    /// Pin every refinement attempt to one tier.
    pub forced_model: Option<ModelTier>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            category: None,
            make: None,
            version: None,
            dry_run: false,
            force: false,
            delay_secs: 3,
            debug: false,
            forced_model: None,
        }
    }
}

impl RunOptions {
    pub fn validate(self) -> Result<Self, ConfigError> {
        if !(1..=MAX_LIMIT).contains(&self.limit) {
            return Err(ConfigError::Invalid {
                field: "limit",
                value: self.limit.to_string(),
                reason: format!("must be between 1 and {MAX_LIMIT}"),
            });
        }
        if self.delay_secs > MAX_DELAY_SECS {
            return Err(ConfigError::Invalid {
                field: "delay",
                value: self.delay_secs.to_string(),
                reason: format!("must be between 0 and {MAX_DELAY_SECS}"),
            });
        }
        Ok(self)
    }

    pub fn delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.delay_secs)
    }

    /// Phases selected for a stage whose input phase is `phase`.
    ///
    /// With `force`, records that already went past it are included, and
    /// so are failed records when `phase` is an operator-reset target.
    pub fn candidate_phases(&self, phase: EnrichmentPhase) -> Vec<EnrichmentPhase> {
        if !self.force {
            return vec![phase];
        }
        let resettable = matches!(
            phase,
            EnrichmentPhase::VehicleEnriched | EnrichmentPhase::ArticleGenerated
        );
        EnrichmentPhase::FORWARD
            .into_iter()
            .filter(|p| p.reached(phase) && *p != EnrichmentPhase::Published)
            .chain(resettable.then_some(EnrichmentPhase::Failed))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.environment, AppEnvironment::Production);
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.request_timeout_secs, 120);
        assert_eq!(config.min_completeness_score(), 7.0);
        assert!(config.require_api_key().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("CALIBRATION_ENV", "staging"),
            ("ANTHROPIC_API_KEY", "sk-test"),
            ("CALIBRATION_MODEL_PREMIUM", "claude-custom"),
            ("CALIBRATION_MAX_RETRIES", "5"),
            ("CALIBRATION_STORE_PATH", "/tmp/records.json"),
        ]))
        .unwrap();
        assert_eq!(config.environment, AppEnvironment::Staging);
        assert_eq!(config.require_api_key().unwrap(), "sk-test");
        assert_eq!(config.models.for_tier(ModelTier::Premium), "claude-custom");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.store_path, PathBuf::from("/tmp/records.json"));
    }

    #[test]
    fn test_invalid_env_values() {
        assert!(matches!(
            PipelineConfig::from_lookup(lookup(&[("CALIBRATION_MAX_RETRIES", "lots")])),
            Err(ConfigError::Invalid { field: "CALIBRATION_MAX_RETRIES", .. })
        ));
        assert!(PipelineConfig::from_lookup(lookup(&[("CALIBRATION_ENV", "moon")])).is_err());
        assert!(
            PipelineConfig::from_lookup(lookup(&[("CALIBRATION_MIN_COMPLETENESS", "150")]))
                .is_err()
        );
    }

    #[test]
    fn test_environment_gate() {
        assert!(AppEnvironment::Production.allows_api_calls());
        assert!(AppEnvironment::Staging.allows_api_calls());
        assert!(!AppEnvironment::Local.allows_api_calls());
        assert!(!AppEnvironment::Testing.allows_api_calls());
    }

    #[test]
    fn test_toml_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.toml");
        std::fs::write(
            &path,
            r#"
environment = "testing"
max_retries = 1

[models]
standard = "claude-small"
"#,
        )
        .unwrap();

        let config = PipelineConfig::default().with_file(&path).unwrap();
        assert_eq!(config.environment, AppEnvironment::Testing);
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.models.standard, "claude-small");
        assert_eq!(
            config.models.intermediate,
            ModelTier::Intermediate.default_model_id()
        );
    }

    #[test]
    fn test_toml_unknown_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.toml");
        std::fs::write(&path, "max_retires = 2\n").unwrap();
        assert!(matches!(
            PipelineConfig::default().with_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_run_options_bounds() {
        assert!(RunOptions::default().validate().is_ok());
        let too_many = RunOptions {
            limit: 501,
            ..Default::default()
        };
        assert!(too_many.validate().is_err());
        let zero = RunOptions {
            limit: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
        let slow = RunOptions {
            delay_secs: 61,
            ..Default::default()
        };
        assert!(slow.validate().is_err());
    }

    #[test]
    fn test_candidate_phases_with_force() {
        let normal = RunOptions::default();
        assert_eq!(
            normal.candidate_phases(EnrichmentPhase::ArticleGenerated),
            vec![EnrichmentPhase::ArticleGenerated]
        );
        let forced = RunOptions {
            force: true,
            ..Default::default()
        };
        assert_eq!(
            forced.candidate_phases(EnrichmentPhase::Claude3aCompleted),
            vec![
                EnrichmentPhase::Claude3aCompleted,
                EnrichmentPhase::Claude3bCompleted,
            ]
        );
        assert_eq!(
            forced.candidate_phases(EnrichmentPhase::ArticleGenerated),
            vec![
                EnrichmentPhase::ArticleGenerated,
                EnrichmentPhase::Claude3aCompleted,
                EnrichmentPhase::Claude3bCompleted,
                EnrichmentPhase::Failed,
            ]
        );
    }
}
