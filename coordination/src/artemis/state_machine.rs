//! Pipeline and per-stage lifecycle tracking with rollback (§4.E).
//!
//! The bounded history stack follows the same "push event, keep last N, replay
//! for rollback" shape as the escalation engine's deterministic transition log.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const DEFAULT_HISTORY_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PipelineState {
    Idle,
    Planning,
    StageRunning,
    StageCompleted,
    StageFailed,
    Recovering,
    Completed,
    Failed,
    Paused,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StageState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Retrying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Issue {
    Timeout,
    Oom,
    LlmError,
    MergeConflict,
    StageStuck,
    BudgetExceeded,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub state: PipelineState,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    /// Snapshot of per-stage states at the moment this event was pushed.
    stage_snapshot: HashMap<String, StageState>,
}

pub struct StateMachine {
    card_id: String,
    pipeline_state: PipelineState,
    stage_states: HashMap<String, StageState>,
    history: Vec<HistoryEvent>,
    capacity: usize,
    open_issues: Vec<Issue>,
}

impl StateMachine {
    pub fn new(card_id: impl Into<String>) -> Self {
        Self {
            card_id: card_id.into(),
            pipeline_state: PipelineState::Idle,
            stage_states: HashMap::new(),
            history: Vec::new(),
            capacity: DEFAULT_HISTORY_CAPACITY,
            open_issues: Vec::new(),
        }
    }

    pub fn card_id(&self) -> &str {
        &self.card_id
    }

    pub fn pipeline_state(&self) -> PipelineState {
        self.pipeline_state
    }

    pub fn stage_state(&self, stage: &str) -> Option<StageState> {
        self.stage_states.get(stage).copied()
    }

    pub fn set_stage_state(&mut self, stage: impl Into<String>, state: StageState) {
        self.stage_states.insert(stage.into(), state);
    }

    fn push_event(&mut self, state: PipelineState, payload: Value) {
        self.pipeline_state = state;
        self.history.push(HistoryEvent {
            state,
            payload,
            timestamp: Utc::now(),
            stage_snapshot: self.stage_states.clone(),
        });
        if self.history.len() > self.capacity {
            self.history.remove(0);
        }
    }

    pub fn transition(&mut self, state: PipelineState, payload: Value) {
        self.push_event(state, payload);
    }

    pub fn history(&self) -> &[HistoryEvent] {
        &self.history
    }

    /// Unwinds to the most recent history entry whose state matches `target`,
    /// restoring the stage snapshot taken at that point. Returns `false` (no-op)
    /// if no matching entry exists.
    pub fn rollback_to_state(&mut self, target: PipelineState) -> bool {
        if let Some(pos) = self.history.iter().rposition(|e| e.state == target) {
            let snapshot = self.history[pos].stage_snapshot.clone();
            self.stage_states = snapshot;
            self.pipeline_state = target;
            self.history.truncate(pos + 1);
            true
        } else {
            false
        }
    }

    /// Registers an issue. Caller is expected to then drive recovery through the
    /// Learning Engine and call `clear_issue`/`fail_pipeline` on the outcome.
    pub fn register_issue(&mut self, issue: Issue) {
        self.pipeline_state = PipelineState::Recovering;
        self.open_issues.push(issue);
    }

    pub fn clear_issue(&mut self, issue: Issue) {
        self.open_issues.retain(|i| *i != issue);
        if self.open_issues.is_empty() && self.pipeline_state == PipelineState::Recovering {
            self.pipeline_state = PipelineState::StageRunning;
        }
    }

    pub fn fail_pipeline(&mut self, reason: impl Into<String>) {
        self.push_event(PipelineState::Failed, serde_json::json!({ "reason": reason.into() }));
    }

    pub fn open_issues(&self) -> &[Issue] {
        &self.open_issues
    }
}
