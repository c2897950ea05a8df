//! The Card and its supporting data model (§3).
//!
//! The Kanban board itself is an external collaborator; this module only models the
//! shape of a card as the core receives it, plus the append-only history invariant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptanceStatus {
    Pending,
    Verified,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptanceCriterion {
    pub text: String,
    pub status: AcceptanceStatus,
    pub verified_by: Option<String>,
}

impl AcceptanceCriterion {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            status: AcceptanceStatus::Pending,
            verified_by: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub column: String,
    pub actor: String,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    /// Fibonacci-ish story points; the source allows {1,2,3,5,8,13}.
    pub story_points: u32,
    pub size: String,
    pub labels: Vec<String>,
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
    pub column: String,
    pub blocked: bool,
    pub blocked_reason: Option<String>,
    pub test_status: String,
    pub definition_of_done: Vec<String>,
    history: Vec<HistoryEntry>,
}

impl Card {
    pub fn new(id: impl Into<String>, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            priority: Priority::Medium,
            story_points: 3,
            size: "M".to_string(),
            labels: Vec::new(),
            acceptance_criteria: Vec::new(),
            column: "backlog".to_string(),
            blocked: false,
            blocked_reason: None,
            test_status: "not_run".to_string(),
            definition_of_done: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_story_points(mut self, points: u32) -> Self {
        self.story_points = points;
        self
    }

    /// Append-only: `history` may only grow. There is no `remove_history` by design.
    pub fn record(&mut self, action: impl Into<String>, actor: impl Into<String>, comment: Option<String>) {
        self.history.push(HistoryEntry {
            timestamp: Utc::now(),
            action: action.into(),
            column: self.column.clone(),
            actor: actor.into(),
            comment,
        });
    }

    pub fn move_to(&mut self, column: impl Into<String>, actor: impl Into<String>) {
        let column = column.into();
        self.column = column.clone();
        self.record("move", actor, Some(format!("moved to {column}")));
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }
}
