//! §8 scenario 4: a stage that prices its own LLM calls through the cost
//! tracker hits the daily budget mid-pipeline; the tracker refuses to bill the
//! call, the stage reports failure, and the pipeline stops at that stage
//! without running anything downstream.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use coordination::artemis::card::Card;
use coordination::artemis::context::Context;
use coordination::artemis::cost_tracker::CostTracker;
use coordination::artemis::knowledge_store::KnowledgeStore;
use coordination::artemis::messenger::{Messenger, MockMessenger};
use coordination::artemis::observer::ObserverHub;
use coordination::artemis::orchestrator::{FinalStatus, Orchestrator};
use coordination::artemis::stage::{Stage, StageOutcome};
use coordination::artemis::supervisor::Supervisor;

struct AlwaysSucceeds {
    name: String,
}

#[async_trait]
impl Stage for AlwaysSucceeds {
    async fn execute(&self, _card: &Card, _context: &Context) -> StageOutcome {
        Ok(serde_json::json!({ "status": "success" }))
    }
    fn get_stage_name(&self) -> &str {
        &self.name
    }
}

/// Mirrors what a real development stage does before calling an LLM: project
/// cost against the daily budget first, and fail the stage outright if the
/// tracker refuses to bill it. The budget here is sized so the very first call
/// already exceeds it.
struct BudgetedDevelopment {
    tracker: CostTracker,
}

#[async_trait]
impl Stage for BudgetedDevelopment {
    async fn execute(&self, card: &Card, _context: &Context) -> StageOutcome {
        self.tracker
            .track("gpt-4o-mini", "openai", 2_000_000, 500_000, "development", &card.id, "implement feature")
            .map_err(|e| e.to_string())?;
        Ok(serde_json::json!({ "status": "success" }))
    }
    fn get_stage_name(&self) -> &str {
        "development"
    }
}

#[tokio::test]
async fn budget_exhaustion_mid_pipeline_halts_before_downstream_stages() {
    let dir = tempfile::tempdir().unwrap();
    let kb = Arc::new(KnowledgeStore::open(dir.path().join("kb")).unwrap());
    let messenger = Arc::new(Messenger::new(Arc::new(MockMessenger::new())));
    let supervisor = Arc::new(Supervisor::new(messenger.clone()));
    let hub = Arc::new(ObserverHub::new());
    let orchestrator = Orchestrator::new(supervisor, kb, messenger, hub);

    let card = Card::new("card-budget-1", "Implement reporting dashboard", "add a feature");

    let tracker = CostTracker::new(0.01, 1.0);
    let mut registry: HashMap<String, Arc<dyn Stage>> = [
        "project_analysis",
        "architecture",
        "dependencies",
        "code_review",
        "validation",
        "integration",
        "testing",
    ]
    .into_iter()
    .map(|name| (name.to_string(), Arc::new(AlwaysSucceeds { name: name.to_string() }) as Arc<dyn Stage>))
    .collect();
    registry.insert("development".to_string(), Arc::new(BudgetedDevelopment { tracker }));

    let report = orchestrator.run_pipeline(&card, registry, Vec::new(), None).await;

    assert_eq!(report.status, FinalStatus::Failed);
    assert_eq!(report.execution_result.failed_stage.as_deref(), Some("development"));
    assert!(report.execution_result.error.as_deref().unwrap_or_default().contains("budget"));
    assert!(!report.execution_result.results.contains_key("code_review"));
}
