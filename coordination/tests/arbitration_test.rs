//! §8 scenario 2: a complex feature card fans out to multiple developers and
//! routes through the arbitration stage the planner inserts before integration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use coordination::artemis::card::{Card, Priority};
use coordination::artemis::context::Context;
use coordination::artemis::knowledge_store::KnowledgeStore;
use coordination::artemis::messenger::{Messenger, MockMessenger};
use coordination::artemis::observer::ObserverHub;
use coordination::artemis::orchestrator::{FinalStatus, Orchestrator};
use coordination::artemis::planner::Complexity;
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

struct CodeReviewPasses;

#[async_trait]
impl Stage for CodeReviewPasses {
    async fn execute(&self, _card: &Card, _context: &Context) -> StageOutcome {
        Ok(serde_json::json!({ "status": "PASS" }))
    }
    fn get_stage_name(&self) -> &str {
        "code_review"
    }
}

struct Arbitration {
    calls: AtomicU32,
}

#[async_trait]
impl Stage for Arbitration {
    async fn execute(&self, _card: &Card, _context: &Context) -> StageOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::json!({ "status": "success", "winner": "developer_1", "confidence": "high" }))
    }
    fn get_stage_name(&self) -> &str {
        "arbitration"
    }
}

struct Developer {
    name: String,
}

#[async_trait]
impl Stage for Developer {
    async fn execute(&self, _card: &Card, _context: &Context) -> StageOutcome {
        Ok(serde_json::json!({ "status": "success", "branch": self.name }))
    }
    fn get_stage_name(&self) -> &str {
        &self.name
    }
}

#[tokio::test]
async fn complex_feature_runs_arbitration_across_parallel_developers() {
    let dir = tempfile::tempdir().unwrap();
    let kb = Arc::new(KnowledgeStore::open(dir.path().join("kb")).unwrap());
    let messenger = Arc::new(Messenger::new(Arc::new(MockMessenger::new())));
    let supervisor = Arc::new(Supervisor::new(messenger.clone()));
    let hub = Arc::new(ObserverHub::new());
    let orchestrator = Orchestrator::new(supervisor, kb, messenger, hub);

    let card = Card::new(
        "card-arb-1",
        "Integrate distributed payment architecture",
        "integrate architecture migrate performance scalability distributed api",
    )
    .with_priority(Priority::High)
    .with_story_points(13);

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
    registry.insert("code_review".to_string(), Arc::new(CodeReviewPasses));
    let arbitration = Arc::new(Arbitration { calls: AtomicU32::new(0) });
    registry.insert("arbitration".to_string(), arbitration.clone());

    let developers: Vec<Arc<dyn Stage>> = vec![
        Arc::new(Developer { name: "developer_1".to_string() }),
        Arc::new(Developer { name: "developer_2".to_string() }),
        Arc::new(Developer { name: "developer_3".to_string() }),
    ];

    let report = orchestrator.run_pipeline(&card, registry, developers, None).await;

    assert_eq!(report.status, FinalStatus::CompletedSuccessfully);
    assert_eq!(report.workflow_plan.complexity, Complexity::Complex);
    assert_eq!(report.workflow_plan.parallel_developers, 3);
    assert!(report.stages.contains(&"arbitration".to_string()));
    assert_eq!(arbitration.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        report
            .execution_result
            .results
            .get("development")
            .and_then(|v| v.get("developer_count"))
            .and_then(|v| v.as_u64()),
        Some(3)
    );
}
