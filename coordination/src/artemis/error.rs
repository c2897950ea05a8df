//! Closed error taxonomy for the pipeline core.
//!
//! Mirrors the split already used elsewhere in this crate (`state::store::StoreError`,
//! `harness::error::HarnessError`): each component keeps its own `thiserror` enum, and
//! this module aggregates them behind one `ArtemisError` for callers that just want to
//! propagate failures out of the orchestrator.

use thiserror::Error;

use crate::artemis::cost_tracker::CostError;
use crate::artemis::knowledge_store::KnowledgeStoreError;
use crate::artemis::messenger::MessengerError;
use crate::artemis::persistence::PersistenceError;
use crate::artemis::sandbox::SandboxError;

pub type ArtemisResult<T> = Result<T, ArtemisError>;

/// Top-level error type returned by the Orchestrator.
#[derive(Debug, Error)]
pub enum ArtemisError {
    /// Bad startup configuration: missing API key, invalid provider, out-of-range budget,
    /// bad resource limits. Fatal before any stage runs.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Failure inside a stage's `execute`. Carries enough context to build the final report.
    #[error("stage '{stage_name}' failed on attempt {retry_attempt}: {message}")]
    PipelineStage {
        stage_name: String,
        retry_attempt: u32,
        message: String,
    },

    /// The single class for cost overruns. Never retried.
    #[error(transparent)]
    BudgetExceeded(#[from] CostError),

    /// LLM transport failure; participates in normal retry.
    #[error("LLM API error calling {model}: {message}")]
    LlmApi { model: String, message: String },

    /// LLM response did not parse into the expected shape; stage failure without retry
    /// unless the stage explicitly opts back in.
    #[error("LLM parsing error: {0}")]
    LlmParsing(String),

    #[error("file read error for {path}: {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("file write error for {path}: {source}")]
    FileWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported document format: {0}")]
    DocumentFormatUnsupported(String),

    #[error(transparent)]
    KnowledgeStore(#[from] KnowledgeStoreError),

    #[error(transparent)]
    Messenger(#[from] MessengerError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// Sandbox refused to launch the code (high risk, or a forbidden pattern with
    /// `scan=true`). Not retried.
    #[error(transparent)]
    SandboxSecurityRefusal(#[from] SandboxError),

    #[error("pipeline stuck: no registered recovery workflow resolved the unexpected state")]
    Unrecoverable,
}

impl ArtemisError {
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ArtemisError::BudgetExceeded(_)
                | ArtemisError::SandboxSecurityRefusal(_)
                | ArtemisError::Configuration(_)
                | ArtemisError::LlmParsing(_)
        )
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        ArtemisError::Configuration(msg.into())
    }

    pub fn pipeline_stage(stage_name: impl Into<String>, retry_attempt: u32, message: impl Into<String>) -> Self {
        ArtemisError::PipelineStage {
            stage_name: stage_name.into(),
            retry_attempt,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_exceeded_and_security_refusal_never_retryable() {
        let err = ArtemisError::BudgetExceeded(CostError::BudgetExceeded {
            kind: "daily".into(),
            projected: 1.0,
            limit: 0.5,
        });
        assert!(!err.is_retryable());

        let err = ArtemisError::SandboxSecurityRefusal(SandboxError::SecurityRefusal {
            reason: "forbidden pattern".into(),
        });
        assert!(!err.is_retryable());
    }

    #[test]
    fn pipeline_stage_failure_is_retryable() {
        let err = ArtemisError::pipeline_stage("code_review", 1, "timeout");
        assert!(err.is_retryable());
    }

    #[test]
    fn llm_parsing_is_not_retried_by_default() {
        let err = ArtemisError::LlmParsing("invalid json".into());
        assert!(!err.is_retryable());
    }
}
