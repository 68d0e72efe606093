//! Model escalation: cost-aware tier routing for LLM refinement.
//!
//! Decides which model tier runs the next refinement attempt for a record,
//! based on the categories of its previous failures. Pure and deterministic.
//!
//! # Escalation Ladder
//!
//! ```text
//! standard (1 cost unit)
//!     │
//!     ├─ api_timeout / api_rate_limit → retry same tier (bounded)
//!     ├─ json_parse_error / validation_error / generic_version_persist / other
//!     │     → escalate one tier
//!     ▼
//! intermediate (3 cost units)
//!     │  same rules
//!     ▼
//! premium (10 cost units)
//!     │
//!     └─ any further non-transient failure → give up, record marked failed
//! ```

pub mod classifier;
pub mod engine;
pub mod state;
pub mod stats;

pub use classifier::{categorize_error, is_generic_version, ErrorCategory};
pub use engine::{EscalationConfig, EscalationDecision, ModelEscalationPolicy};
pub use state::{current_sequence, AttemptRecord, AttemptResult, ModelTier, RefinementPhase};
pub use stats::{EscalationStatistics, TierUsage, TrendAnalysis, TrendLabel};
