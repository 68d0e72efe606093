//! Async runner for the tire-calibration enrichment pipeline.
//!
//! Wraps the deterministic `enrichment` core with the Claude HTTP client,
//! prompt templates, the phase state machine runner and publication.

pub mod client;
pub mod config;
pub mod orchestrator;
pub mod prompts;
pub mod publication;
pub mod report;

pub use client::{
    AnthropicBackend, ApiError, CompletionBackend, CompletionRequest, LlmRefinementClient,
    ParseError, RefinementError,
};
pub use config::{AppEnvironment, ConfigError, PipelineConfig, RunOptions, TierModels};
pub use orchestrator::Pipeline;
pub use publication::{
    ArticleSink, JsonFileSink, MemorySink, PublicationError, PublicationPipeline,
    PublicationStage, PublishOutcome,
};
pub use report::{FailureNote, RunStats};
