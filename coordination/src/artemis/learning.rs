//! Turns unexpected states into executable recovery workflows (§4.F).
//!
//! Severity classification is the same "heuristics over a closed set of state
//! names plus message sniffing" shape as the escalation engine's tier decisions;
//! the three learning strategies are a policy choice, not a pipeline — callers pick
//! one via `LearningStrategy`, they do not chain automatically.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::artemis::knowledge_store::{ArtifactType, KnowledgeStoreError, SharedKnowledgeStore};
use crate::artemis::messenger::{MessageType, MessengerError, Priority, SharedMessenger};

pub type LearningResult<T> = Result<T, LearningError>;

#[derive(Debug, Error)]
pub enum LearningError {
    #[error(transparent)]
    KnowledgeStore(#[from] KnowledgeStoreError),
    #[error(transparent)]
    Messenger(#[from] MessengerError),
    #[error("LLM response was not valid structured JSON: {0}")]
    MalformedLlmResponse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnexpectedState {
    pub card_id: String,
    pub current_state: String,
    pub expected_states: Vec<String>,
    pub context: Value,
    pub severity: Severity,
    pub error_message: Option<String>,
    pub detected_at: DateTime<Utc>,
}

/// Returns `None` when `current_state` is one of `expected_states` — the
/// happy-path case where there is nothing to learn from.
pub fn detect_unexpected_state(
    card_id: &str,
    current_state: &str,
    expected_states: &[String],
    context: Value,
) -> Option<UnexpectedState> {
    if expected_states.iter().any(|s| s == current_state) {
        return None;
    }

    let error_message = context
        .get("error_message")
        .and_then(Value::as_str)
        .map(str::to_string);

    let severity = classify_severity(current_state, error_message.as_deref());

    Some(UnexpectedState {
        card_id: card_id.to_string(),
        current_state: current_state.to_string(),
        expected_states: expected_states.to_vec(),
        context,
        severity,
        error_message,
        detected_at: Utc::now(),
    })
}

fn classify_severity(state_name: &str, error_message: Option<&str>) -> Severity {
    let lower = state_name.to_lowercase();
    let has_error = error_message.map(|m| !m.is_empty()).unwrap_or(false);

    if lower.contains("crash") || lower.contains("corrupt") || lower.contains("data_loss") {
        return Severity::Critical;
    }
    if lower.contains("failed") || lower.contains("budget_exceeded") || lower.contains("security") {
        return if has_error { Severity::Critical } else { Severity::High };
    }
    if lower.contains("timeout") || lower.contains("stuck") || lower.contains("merge_conflict") {
        return if has_error { Severity::High } else { Severity::Medium };
    }
    if has_error {
        Severity::Medium
    } else {
        Severity::Low
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowAction {
    RetryStage,
    RollbackToState,
    SkipStage,
    ResetState,
    CleanupResources,
    RestartProcess,
    ManualIntervention,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub step: u32,
    pub action: WorkflowAction,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryWorkflow {
    pub problem_analysis: String,
    pub root_cause: String,
    pub solution_description: String,
    pub workflow_steps: Vec<WorkflowStep>,
    pub confidence: f64,
    pub risks: Vec<String>,
    pub alternatives: Vec<String>,
    pub learning_strategy: LearningStrategy,
    pub provenance_artifact_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningStrategy {
    SimilarCaseAdaptation,
    LlmConsultation,
    HumanInTheLoop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalContext {
    pub historical_success_rate: f64,
    pub most_common_workflow: Option<Vec<WorkflowStep>>,
    pub past_failure_count: usize,
}

pub struct LearningEngine {
    knowledge_store: SharedKnowledgeStore,
    messenger: SharedMessenger,
}

impl LearningEngine {
    pub fn new(knowledge_store: SharedKnowledgeStore, messenger: SharedMessenger) -> Self {
        Self { knowledge_store, messenger }
    }

    /// Summarizes prior learned solutions for `unexpected.current_state` before
    /// consulting the LLM — this is the "learning over time" half of the contract.
    pub fn build_historical_context(&self, unexpected: &UnexpectedState) -> LearningResult<HistoricalContext> {
        let similar = self.knowledge_store.query_similar(
            &unexpected.current_state,
            Some(&[ArtifactType::LearnedSolution]),
            10,
            None,
        )?;

        if similar.is_empty() {
            return Ok(HistoricalContext {
                historical_success_rate: 0.0,
                most_common_workflow: None,
                past_failure_count: 0,
            });
        }

        let mut rates = Vec::new();
        let mut failures = 0usize;
        let mut best: Option<(f64, Vec<WorkflowStep>)> = None;
        for artifact in &similar {
            if let Some(rate) = artifact.metadata.get("success_rate").and_then(Value::as_f64) {
                rates.push(rate);
                if rate < 0.5 {
                    failures += 1;
                }
                if let Some(steps) = artifact
                    .metadata
                    .get("workflow_steps")
                    .and_then(|v| serde_json::from_value::<Vec<WorkflowStep>>(v.clone()).ok())
                {
                    if best.as_ref().map(|(r, _)| rate > *r).unwrap_or(true) {
                        best = Some((rate, steps));
                    }
                }
            }
        }

        Ok(HistoricalContext {
            historical_success_rate: if rates.is_empty() { 0.0 } else { rates.iter().sum::<f64>() / rates.len() as f64 },
            most_common_workflow: best.map(|(_, steps)| steps),
            past_failure_count: failures,
        })
    }

    /// Strategy 1: re-use the highest-success-rate prior `learned_solution` for a
    /// similar unexpected state, if the Knowledge Store has one.
    pub fn adapt_similar_case(&self, unexpected: &UnexpectedState) -> LearningResult<Option<RecoveryWorkflow>> {
        let similar = self.knowledge_store.query_similar(
            &format!("{} {}", unexpected.current_state, unexpected.error_message.clone().unwrap_or_default()),
            Some(&[ArtifactType::LearnedSolution]),
            5,
            None,
        )?;

        let best = similar
            .into_iter()
            .filter_map(|a| {
                let rate = a.metadata.get("success_rate").and_then(Value::as_f64)?;
                let steps: Vec<WorkflowStep> =
                    serde_json::from_value(a.metadata.get("workflow_steps")?.clone()).ok()?;
                Some((rate, a.artifact_id, steps))
            })
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap());

        Ok(best.map(|(rate, artifact_id, steps)| RecoveryWorkflow {
            problem_analysis: format!("Recurrence of a previously resolved state: {}", unexpected.current_state),
            root_cause: "matched against a prior learned solution".to_string(),
            solution_description: "re-apply the highest-success-rate prior workflow".to_string(),
            workflow_steps: steps,
            confidence: rate,
            risks: vec!["prior solution may not generalize to this context".to_string()],
            alternatives: Vec::new(),
            learning_strategy: LearningStrategy::SimilarCaseAdaptation,
            provenance_artifact_id: Some(artifact_id),
        }))
    }

    /// Strategy 2: parse a structured LLM response into a `RecoveryWorkflow`. If the
    /// response is not valid JSON, falls back to a best-effort numbered-step
    /// extraction producing `manual_intervention` actions only.
    pub fn parse_llm_consultation(&self, raw_response: &str) -> RecoveryWorkflow {
        match serde_json::from_str::<LlmConsultationResponse>(raw_response) {
            Ok(parsed) => RecoveryWorkflow {
                problem_analysis: parsed.problem_analysis,
                root_cause: parsed.root_cause,
                solution_description: parsed.solution_description,
                workflow_steps: parsed.workflow_steps,
                confidence: parsed.confidence,
                risks: parsed.risks,
                alternatives: parsed.alternatives,
                learning_strategy: LearningStrategy::LlmConsultation,
                provenance_artifact_id: None,
            },
            Err(_) => self.fallback_numbered_extraction(raw_response),
        }
    }

    fn fallback_numbered_extraction(&self, raw_response: &str) -> RecoveryWorkflow {
        let steps: Vec<WorkflowStep> = raw_response
            .lines()
            .filter_map(|line| {
                let trimmed = line.trim();
                let digits: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
                if digits.is_empty() {
                    return None;
                }
                let rest = trimmed[digits.len()..].trim_start_matches(['.', ')', ':']).trim();
                if rest.is_empty() {
                    return None;
                }
                Some((digits.parse::<u32>().ok()?, rest.to_string()))
            })
            .map(|(step, description)| WorkflowStep {
                step,
                action: WorkflowAction::ManualIntervention,
                description,
                parameters: Value::Null,
            })
            .collect();

        RecoveryWorkflow {
            problem_analysis: "LLM response was not valid JSON; extracted numbered steps as a best effort".to_string(),
            root_cause: "unparseable LLM response".to_string(),
            solution_description: "manual review of the extracted steps is required".to_string(),
            workflow_steps: steps,
            confidence: 0.1,
            risks: vec!["response could not be parsed as structured JSON".to_string()],
            alternatives: Vec::new(),
            learning_strategy: LearningStrategy::LlmConsultation,
            provenance_artifact_id: None,
        }
    }

    /// Strategy 3: emit a request via the Messenger and return no solution. The
    /// caller is expected to re-poll once the message is acknowledged.
    pub async fn request_human_intervention(&self, unexpected: &UnexpectedState) -> LearningResult<String> {
        let message_id = self
            .messenger
            .send(
                "human_operator",
                MessageType::Request,
                serde_json::json!({
                    "card_id": unexpected.card_id,
                    "current_state": unexpected.current_state,
                    "expected_states": unexpected.expected_states,
                    "severity": unexpected.severity,
                    "error_message": unexpected.error_message,
                }),
                unexpected.card_id.clone(),
                Priority::High,
                None,
            )
            .await?;
        Ok(message_id)
    }

    /// Persists a resolved workflow as a `learned_solution` artifact with updated
    /// success-rate metadata, so future similar cases can adapt it.
    pub fn record_outcome(
        &self,
        unexpected: &UnexpectedState,
        workflow: &RecoveryWorkflow,
        succeeded: bool,
        prior_attempts: u32,
        prior_successes: u32,
    ) -> LearningResult<String> {
        let times_applied = prior_attempts + 1;
        let times_successful = prior_successes + if succeeded { 1 } else { 0 };
        let success_rate = times_successful as f64 / times_applied as f64;

        let metadata = serde_json::json!({
            "workflow_steps": workflow.workflow_steps,
            "success_rate": success_rate,
            "times_applied": times_applied,
            "times_successful": times_successful,
            "learning_strategy": workflow.learning_strategy,
        });

        let id = self.knowledge_store.store(
            ArtifactType::LearnedSolution,
            &unexpected.card_id,
            &format!("Recovery for {}", unexpected.current_state),
            &workflow.solution_description,
            Some(metadata),
        )?;
        Ok(id)
    }
}

#[derive(Debug, Deserialize)]
struct LlmConsultationResponse {
    problem_analysis: String,
    root_cause: String,
    solution_description: String,
    workflow_steps: Vec<WorkflowStep>,
    confidence: f64,
    risks: Vec<String>,
    alternatives: Vec<String>,
}
