//! LLM refinement client.
//!
//! [`CompletionBackend`] is the HTTP seam; [`AnthropicBackend`] talks to the
//! Messages API and tests substitute a scripted backend. On top of it,
//! [`LlmRefinementClient`] retries failed calls with backoff, extracts JSON
//! from the response and validates it for phase 3A or 3B.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use enrichment::validation::{validate_phase3a_payload, validate_phase3b_payload};
use enrichment::{
    ArticleSkeleton, EditorialEnhancements, ErrorCategory, ModelTier, RetryPolicy,
    TechnicalEnhancements, Validated, ValidationError, VehicleInfo,
};
use regex::Regex;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{PipelineConfig, TierModels};
use crate::prompts;

static FENCED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[ \t]*(?:json|JSON)?[ \t]*\r?\n?(.*?)```").unwrap());

/// Transport-level failure of a completion call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("rate limited by Claude API ({status}): {body}")]
    RateLimited { status: u16, body: String },

    #[error("Claude API rejected credentials ({status}); check ANTHROPIC_API_KEY")]
    Unauthorized { status: u16 },

    #[error("Claude API error ({status}): {body}")]
    Status { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed API response: {0}")]
    MalformedResponse(String),
}

impl ApiError {
    /// Classify an HTTP error status.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::Unauthorized { status },
            429 | 529 => Self::RateLimited { status, body },
            408 | 504 => Self::Timeout(format!("HTTP {status}")),
            _ => Self::Status { status, body },
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Timeout(_) => ErrorCategory::ApiTimeout,
            Self::RateLimited { .. } => ErrorCategory::ApiRateLimit,
            Self::MalformedResponse(_) => ErrorCategory::JsonParseError,
            // Server-side outages clear on their own; retry the same tier.
            Self::Status { status, .. } if *status >= 500 => ErrorCategory::ApiTimeout,
            Self::Network(_) => ErrorCategory::ApiTimeout,
            Self::Unauthorized { .. } | Self::Status { .. } => ErrorCategory::Other,
        }
    }

    /// Credentials errors end the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Unauthorized { .. } | Self::MalformedResponse(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty response from model")]
    Empty,

    #[error("response is not valid JSON: {0}")]
    InvalidJson(String),
}

impl ParseError {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::JsonParseError
    }
}

/// Any failure of one refinement attempt.
#[derive(Debug, Error)]
pub enum RefinementError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl RefinementError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Api(e) => e.category(),
            Self::Parse(e) => e.category(),
            Self::Validation(e) => e.category(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Api(e) if e.is_fatal())
    }
}

/// One completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub prompt: String,
}

impl CompletionRequest {
    pub fn body(&self) -> Value {
        json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "messages": [{
                "role": "user",
                "content": self.prompt,
            }]
        })
    }
}

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Perform one call and return the first text block.
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ApiError>;
}

/// Anthropic Messages API backend.
pub struct AnthropicBackend {
    client: reqwest::Client,
    url: String,
    api_key: String,
    api_version: String,
}

impl AnthropicBackend {
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let api_key = config.require_api_key()?.to_string();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            url: config.api_url.clone(),
            api_key,
            api_version: config.api_version.clone(),
        })
    }
}

#[async_trait]
impl CompletionBackend for AnthropicBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ApiError> {
        let response = self
            .client
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.api_version)
            .header("content-type", "application/json")
            .json(&request.body())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ApiError::Timeout(e.to_string())
                } else {
                    ApiError::Network(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, body));
        }

        let resp_json: Value = response
            .json()
            .await
            .map_err(|e| ApiError::MalformedResponse(e.to_string()))?;

        resp_json["content"][0]["text"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| ApiError::MalformedResponse("missing content[0].text".into()))
    }
}

/// Extract the JSON payload from a model response.
///
/// Fenced code blocks are tried first, then the whole text.
pub fn parse_response(raw: &str) -> Result<Value, ParseError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(ParseError::Empty);
    }

    for captures in FENCED_BLOCK.captures_iter(text) {
        if let Some(block) = captures.get(1) {
            if let Ok(value) = serde_json::from_str::<Value>(block.as_str().trim()) {
                return Ok(value);
            }
        }
    }

    serde_json::from_str(text).map_err(|e| ParseError::InvalidJson(e.to_string()))
}

/// Validated refinement calls at a chosen tier.
#[derive(Clone)]
pub struct LlmRefinementClient {
    backend: Arc<dyn CompletionBackend>,
    models: TierModels,
    retry: RetryPolicy,
}

impl LlmRefinementClient {
    pub fn new(backend: Arc<dyn CompletionBackend>, models: TierModels, retry: RetryPolicy) -> Self {
        Self {
            backend,
            models,
            retry,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let backend = AnthropicBackend::from_config(config)?;
        Ok(Self::new(
            Arc::new(backend),
            config.models.clone(),
            RetryPolicy::new(config.max_retries),
        ))
    }

    pub fn model_for(&self, tier: ModelTier) -> &str {
        self.models.for_tier(tier)
    }

    /// Call the completion API, retrying with exponential backoff.
    pub async fn generate(
        &self,
        prompt: &str,
        tier: ModelTier,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, ApiError> {
        let request = CompletionRequest {
            model: self.models.for_tier(tier).to_string(),
            max_tokens,
            temperature,
            prompt: prompt.to_string(),
        };

        let mut attempt = 0;
        loop {
            match self.backend.complete(&request).await {
                Ok(text) => {
                    debug!(tier = %tier, model = %request.model, chars = text.len(), "Completion received");
                    return Ok(text);
                }
                Err(e) => {
                    if !e.is_retryable() || !self.retry.should_retry(attempt) {
                        return Err(e);
                    }
                    attempt += 1;
                    let backoff = self.retry.backoff_duration(attempt);
                    warn!(
                        attempt,
                        max_retries = self.retry.max_retries,
                        backoff_secs = backoff.as_secs(),
                        tier = %tier,
                        error = %e,
                        "Completion call failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Phase 3A: editorial enhancements.
    pub async fn refine_phase_3a(
        &self,
        vehicle: &VehicleInfo,
        article: &ArticleSkeleton,
        tier: ModelTier,
        feedback: Option<&str>,
    ) -> Result<Validated<EditorialEnhancements>, RefinementError> {
        let prompt = prompts::editorial_prompt(vehicle, article, feedback);
        let raw = self
            .generate(
                &prompt,
                tier,
                prompts::PHASE_3A_MAX_TOKENS,
                prompts::PHASE_3A_TEMPERATURE,
            )
            .await?;
        let payload = parse_response(&raw)?;
        Ok(validate_phase3a_payload(&payload, vehicle)?)
    }

    /// Phase 3B: technical specifications per real version.
    pub async fn refine_phase_3b(
        &self,
        vehicle: &VehicleInfo,
        article: &ArticleSkeleton,
        editorial: &EditorialEnhancements,
        tier: ModelTier,
        feedback: Option<&str>,
    ) -> Result<Validated<TechnicalEnhancements>, RefinementError> {
        let prompt = prompts::technical_prompt(vehicle, article, editorial, feedback);
        let raw = self
            .generate(
                &prompt,
                tier,
                prompts::PHASE_3B_MAX_TOKENS,
                prompts::PHASE_3B_TEMPERATURE,
            )
            .await?;
        let payload = parse_response(&raw)?;
        Ok(validate_phase3b_payload(&payload, vehicle)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Returns scripted results in order and records requests.
    struct ScriptedBackend {
        script: Mutex<Vec<Result<String, ApiError>>>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedBackend {
        fn new(mut script: Vec<Result<String, ApiError>>) -> Arc<Self> {
            script.reverse();
            Arc::new(Self {
                script: Mutex::new(script),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn complete(&self, request: &CompletionRequest) -> Result<String, ApiError> {
            self.requests.lock().unwrap().push(request.clone());
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(ApiError::Network("script exhausted".into())))
        }
    }

    fn client(backend: Arc<ScriptedBackend>, retries: u32) -> LlmRefinementClient {
        LlmRefinementClient::new(backend, TierModels::default(), RetryPolicy::new(retries))
    }

    #[test]
    fn test_parse_fenced_block() {
        let raw = "Aqui está:\n```json\n{\"a\": 1}\n```\nObrigado.";
        assert_eq!(parse_response(raw).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_parse_bare_fence_and_direct() {
        assert_eq!(parse_response("```\n[1,2]\n```").unwrap(), json!([1, 2]));
        assert_eq!(parse_response("  {\"b\": true} ").unwrap(), json!({"b": true}));
    }

    #[test]
    fn test_parse_failures() {
        assert_eq!(parse_response("   ").unwrap_err(), ParseError::Empty);
        assert!(matches!(
            parse_response("```json\n{broken\n```"),
            Err(ParseError::InvalidJson(_))
        ));
        assert_eq!(
            parse_response("not json").unwrap_err().category(),
            ErrorCategory::JsonParseError
        );
    }

    #[test]
    fn test_status_classification() {
        assert!(ApiError::from_status(401, String::new()).is_fatal());
        assert_eq!(
            ApiError::from_status(429, String::new()).category(),
            ErrorCategory::ApiRateLimit
        );
        assert_eq!(
            ApiError::from_status(529, String::new()).category(),
            ErrorCategory::ApiRateLimit
        );
        assert_eq!(
            ApiError::from_status(504, String::new()).category(),
            ErrorCategory::ApiTimeout
        );
        assert_eq!(
            ApiError::from_status(500, "boom".into()),
            ApiError::Status {
                status: 500,
                body: "boom".into()
            }
        );

    }

    #[test]
    fn test_outages_retry_at_same_tier() {
        for status in [500, 502, 503] {
            let category = ApiError::from_status(status, String::new()).category();
            assert_eq!(category, ErrorCategory::ApiTimeout, "HTTP {status}");
            assert!(category.is_transient());
        }
        assert!(ApiError::Network("connection reset".into())
            .category()
            .is_transient());
        assert_eq!(
            ApiError::from_status(400, String::new()).category(),
            ErrorCategory::Other
        );
    }

    #[test]
    fn test_request_body_shape() {
        let req = CompletionRequest {
            model: "claude-x".into(),
            max_tokens: 100,
            temperature: 0.5,
            prompt: "oi".into(),
        };
        let body = req.body();
        assert_eq!(body["model"], "claude-x");
        assert_eq!(body["max_tokens"], 100);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "oi");
    }

    #[tokio::test(start_paused = true)]
    async fn test_generate_retries_with_backoff() {
        let backend = ScriptedBackend::new(vec![
            Err(ApiError::Timeout("slow".into())),
            Err(ApiError::from_status(500, String::new())),
            Ok("done".into()),
        ]);
        let client = client(backend.clone(), 3);

        let start = tokio::time::Instant::now();
        let text = client
            .generate("p", ModelTier::Intermediate, 10, 0.0)
            .await
            .unwrap();
        assert_eq!(text, "done");
        assert_eq!(backend.calls(), 3);
        // 1 s + 2 s of backoff.
        assert_eq!(start.elapsed().as_secs(), 3);
        assert_eq!(
            backend.requests.lock().unwrap()[0].model,
            ModelTier::Intermediate.default_model_id()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_generate_gives_up_after_max_retries() {
        let backend = ScriptedBackend::new(vec![
            Err(ApiError::Timeout("1".into())),
            Err(ApiError::Timeout("2".into())),
            Err(ApiError::Timeout("3".into())),
        ]);
        let client = client(backend.clone(), 2);
        let err = client
            .generate("p", ModelTier::Standard, 10, 0.0)
            .await
            .unwrap_err();
        assert_eq!(err, ApiError::Timeout("3".into()));
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_is_not_retried() {
        let backend = ScriptedBackend::new(vec![Err(ApiError::from_status(401, String::new()))]);
        let client = client(backend.clone(), 3);
        let err = client
            .generate("p", ModelTier::Standard, 10, 0.0)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_refine_3b_rejects_generic_versions() {
        let payload = json!({
            "especificacoes_por_versao": [
                {"versao": "Comfort", "medida_pneus": "205/55 R16",
                 "pressao_dianteiro_normal": 32, "pressao_traseiro_normal": 32},
                {"versao": "Style", "medida_pneus": "205/55 R16",
                 "pressao_dianteiro_normal": 32, "pressao_traseiro_normal": 32}
            ],
            "tabela_carga_completa": {}
        });
        let backend = ScriptedBackend::new(vec![Ok(format!("```json\n{payload}\n```"))]);
        let client = client(backend, 0);

        let raw = enrichment::RawVehicleData::new("Honda", "Civic");
        let vehicle = VehicleInfo::from_raw(&raw, enrichment::SchemaVersion::V2);
        let article = enrichment::VehicleDataMapper::new()
            .map(&raw, enrichment::SchemaVersion::V2)
            .unwrap();
        let editorial = EditorialEnhancements {
            meta_description: "m".into(),
            introducao: "i".into(),
            consideracoes_finais: "c".into(),
            perguntas_frequentes: vec![],
        };

        let err = client
            .refine_phase_3b(&vehicle, &article, &editorial, ModelTier::Standard, None)
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::GenericVersionPersist);
        assert!(!err.is_fatal());
    }
}
