//! §8 scenario 3: code review fails, the pipeline restarts at `development`
//! carrying review feedback, and succeeds within the default retry budget.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use coordination::artemis::card::Card;
use coordination::artemis::context::Context;
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

/// Fails twice with feedback, then passes on the third attempt, which is still
/// inside the supervisor's default two-retry budget for code review.
struct FailsTwiceThenPasses {
    calls: AtomicU32,
}

#[async_trait]
impl Stage for FailsTwiceThenPasses {
    async fn execute(&self, _card: &Card, context: &Context) -> StageOutcome {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < 2 {
            Ok(serde_json::json!({
                "status": "FAIL",
                "total_critical_issues": 1,
                "reviews": [{"issue": format!("pass {n} found a defect")}],
            }))
        } else {
            assert!(context.get("previous_review_feedback").is_some());
            Ok(serde_json::json!({ "status": "PASS" }))
        }
    }
    fn get_stage_name(&self) -> &str {
        "code_review"
    }
}

#[tokio::test]
async fn code_review_retry_loop_recovers_within_budget() {
    let dir = tempfile::tempdir().unwrap();
    let kb = Arc::new(KnowledgeStore::open(dir.path().join("kb")).unwrap());
    let messenger = Arc::new(Messenger::new(Arc::new(MockMessenger::new())));
    let supervisor = Arc::new(Supervisor::new(messenger.clone()));
    let hub = Arc::new(ObserverHub::new());
    let orchestrator = Orchestrator::new(supervisor, kb, messenger, hub);

    let card = Card::new("card-retry-1", "Add search endpoint", "add a small feature");

    let development = Arc::new(AlwaysSucceeds { name: "development".to_string() });
    let review = Arc::new(FailsTwiceThenPasses { calls: AtomicU32::new(0) });

    let mut registry: HashMap<String, Arc<dyn Stage>> = [
        "project_analysis",
        "architecture",
        "dependencies",
        "validation",
        "integration",
        "testing",
    ]
    .into_iter()
    .map(|name| (name.to_string(), Arc::new(AlwaysSucceeds { name: name.to_string() }) as Arc<dyn Stage>))
    .collect();
    registry.insert("development".to_string(), development);
    registry.insert("code_review".to_string(), review.clone());

    let report = orchestrator.run_pipeline(&card, registry, Vec::new(), None).await;

    assert_eq!(report.status, FinalStatus::CompletedSuccessfully);
    assert_eq!(review.calls.load(Ordering::SeqCst), 3);
}
