//! Scores a card to pick complexity and plan the stage list (§4.H).
//!
//! Deterministic scoring over a fixed keyword set, same "closed list of signals,
//! capped contribution, bucket thresholds" shape as the escalation engine's
//! `EscalationConfig` thresholds.

use serde::{Deserialize, Serialize};

use crate::artemis::card::{Card, Priority};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Bugfix,
    Refactor,
    Documentation,
    Feature,
    Other,
}

const COMPLEX_KEYWORDS: &[&str] = &[
    "integrate", "architecture", "refactor", "migrate", "performance", "scalability", "distributed", "api",
];
const SIMPLE_KEYWORDS: &[&str] = &["fix", "update", "small", "minor", "simple", "quick"];

const COMPLEX_ADD_CAP: i32 = 3;
const SIMPLE_SUBTRACT_CAP: i32 = 2;

fn priority_points(priority: Priority) -> i32 {
    match priority {
        Priority::Low => 0,
        Priority::Medium => 1,
        Priority::High => 2,
    }
}

fn story_point_score(points: u32) -> i32 {
    match points {
        0..=2 => 0,
        3..=5 => 1,
        8..=12 => 2,
        _ => 3,
    }
}

/// Adds up to `COMPLEX_ADD_CAP` points for complexity keywords and subtracts up to
/// `SIMPLE_SUBTRACT_CAP` for simplicity keywords, each counted once per keyword hit.
fn keyword_score(description: &str) -> i32 {
    let lower = description.to_lowercase();
    let complex_hits = COMPLEX_KEYWORDS.iter().filter(|k| lower.contains(*k)).count() as i32;
    let simple_hits = SIMPLE_KEYWORDS.iter().filter(|k| lower.contains(*k)).count() as i32;
    complex_hits.min(COMPLEX_ADD_CAP) - simple_hits.min(SIMPLE_SUBTRACT_CAP)
}

pub fn complexity_score(card: &Card) -> i32 {
    priority_points(card.priority) + story_point_score(card.story_points) + keyword_score(&card.description)
}

pub fn classify_complexity(card: &Card) -> Complexity {
    let score = complexity_score(card);
    if score >= 6 {
        Complexity::Complex
    } else if score >= 3 {
        Complexity::Medium
    } else {
        Complexity::Simple
    }
}

pub fn classify_task_type(card: &Card) -> TaskType {
    let lower = format!("{} {}", card.title, card.description).to_lowercase();
    if lower.contains("bug") || lower.contains("fix") || lower.contains("typo") {
        TaskType::Bugfix
    } else if lower.contains("refactor") {
        TaskType::Refactor
    } else if lower.contains("doc") || lower.contains("readme") {
        TaskType::Documentation
    } else if lower.contains("feature") || lower.contains("add") || lower.contains("implement") {
        TaskType::Feature
    } else {
        TaskType::Other
    }
}

pub fn parallel_developers(complexity: Complexity) -> u32 {
    match complexity {
        Complexity::Simple => 1,
        Complexity::Medium => 2,
        Complexity::Complex => 3,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowPlan {
    pub card_id: String,
    pub complexity: Complexity,
    pub task_type: TaskType,
    pub parallel_developers: u32,
    pub stages: Vec<String>,
}

const BASE_ORDER: &[&str] = &[
    "project_analysis", "architecture", "dependencies", "development", "code_review", "validation", "integration",
];

/// Default stage order: base order, append `testing` unless documentation,
/// insert `arbitration` before `integration` iff parallelism > 1.
pub fn plan(card: &Card) -> WorkflowPlan {
    let complexity = classify_complexity(card);
    let task_type = classify_task_type(card);
    let parallel_developers = parallel_developers(complexity);

    let mut stages: Vec<String> = BASE_ORDER.iter().map(|s| s.to_string()).collect();

    if parallel_developers > 1 {
        let idx = stages.iter().position(|s| s == "integration").expect("integration always present");
        stages.insert(idx, "arbitration".to_string());
    }

    if !matches!(task_type, TaskType::Documentation) {
        stages.push("testing".to_string());
    }

    WorkflowPlan {
        card_id: card.id.clone(),
        complexity,
        task_type,
        parallel_developers,
        stages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artemis::card::Card;

    #[test]
    fn simple_bugfix_plan() {
        let card = Card::new("card-1", "Fix bug", "fix small typo").with_priority(Priority::Medium).with_story_points(3);
        let p = plan(&card);
        assert_eq!(p.complexity, Complexity::Simple);
        assert_eq!(p.task_type, TaskType::Bugfix);
        assert_eq!(p.parallel_developers, 1);
        assert!(!p.stages.contains(&"arbitration".to_string()));
        assert_eq!(p.stages.last().unwrap(), "testing");
    }

    #[test]
    fn complex_plan_inserts_arbitration_before_integration() {
        let card = Card::new("card-2", "Rearchitect system", "integrate distributed architecture migrate scalability api")
            .with_priority(Priority::High)
            .with_story_points(13);
        let p = plan(&card);
        assert_eq!(p.complexity, Complexity::Complex);
        assert_eq!(p.parallel_developers, 3);
        let arb = p.stages.iter().position(|s| s == "arbitration").unwrap();
        let integ = p.stages.iter().position(|s| s == "integration").unwrap();
        assert!(arb < integ);
    }

    #[test]
    fn documentation_plan_has_no_testing_stage() {
        let card = Card::new("card-3", "Update README docs", "documentation update").with_priority(Priority::Low).with_story_points(1);
        let p = plan(&card);
        assert_eq!(p.task_type, TaskType::Documentation);
        assert!(!p.stages.contains(&"testing".to_string()));
    }

    #[test]
    fn boundary_score_exactly_three_is_medium_exactly_six_is_complex() {
        // priority High(2) + points 8..12(2) + 0 keyword = 4 -> medium; bump to 6 with keywords.
        let medium = Card::new("c", "t", "plain description").with_priority(Priority::High).with_story_points(8);
        assert_eq!(complexity_score(&medium), 4);
        assert_eq!(classify_complexity(&medium), Complexity::Medium);

        let complex = Card::new("c", "t", "integrate architecture refactor migrate")
            .with_priority(Priority::High)
            .with_story_points(8);
        assert_eq!(complexity_score(&complex), 7);
        assert_eq!(classify_complexity(&complex), Complexity::Complex);
    }

    #[test]
    fn keyword_contribution_is_capped() {
        let many_complex = "integrate architecture refactor migrate performance scalability distributed api";
        assert_eq!(keyword_score(many_complex), COMPLEX_ADD_CAP);
        let many_simple = "fix update small minor simple quick";
        assert_eq!(keyword_score(many_simple), -SIMPLE_SUBTRACT_CAP);
    }

    #[test]
    fn plan_is_deterministic() {
        let card = Card::new("card-4", "Add feature", "add new integration feature");
        assert_eq!(plan(&card).stages, plan(&card).stages);
    }
}
