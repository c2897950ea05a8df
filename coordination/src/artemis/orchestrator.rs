//! Top-level entry point for driving a single card through the pipeline (§4.K).

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::artemis::card::Card;
use crate::artemis::context::Context;
use crate::artemis::knowledge_store::SharedKnowledgeStore;
use crate::artemis::messenger::{MessageType, Priority, SharedMessenger};
use crate::artemis::observer::{EventKind, ObserverHub, PipelineEvent};
use crate::artemis::planner;
use crate::artemis::planner::WorkflowPlan;
use crate::artemis::routing::{self, RoutingDecision};
use crate::artemis::stage::Stage;
use crate::artemis::strategy::{ExecutionStrategy, StrategyResult, StrategyStatus};
use crate::artemis::supervisor::Supervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalStatus {
    CompletedSuccessfully,
    Failed,
    FailedCodeReview,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub card_id: String,
    pub workflow_plan: WorkflowPlan,
    pub stages: Vec<String>,
    pub status: FinalStatus,
    pub execution_result: StrategyResult,
    pub supervisor_statistics: crate::artemis::supervisor::SupervisorStats,
}

pub struct Orchestrator {
    supervisor: Arc<Supervisor>,
    knowledge_store: SharedKnowledgeStore,
    messenger: SharedMessenger,
    observer_hub: Arc<ObserverHub>,
}

impl Orchestrator {
    pub fn new(
        supervisor: Arc<Supervisor>,
        knowledge_store: SharedKnowledgeStore,
        messenger: SharedMessenger,
        observer_hub: Arc<ObserverHub>,
    ) -> Self {
        Self { supervisor, knowledge_store, messenger, observer_hub }
    }

    /// Runs a card end to end: plan, optionally re-route, execute, persist a final
    /// report. `stage_registry` supplies stage implementations by name;
    /// `developers` are the parallel developer-stage instances the plan may use.
    pub async fn run_pipeline(
        &self,
        card: &Card,
        stage_registry: HashMap<String, Arc<dyn Stage>>,
        developers: Vec<Arc<dyn Stage>>,
        router_decision: Option<RoutingDecision>,
    ) -> PipelineReport {
        let plan = planner::plan(card);

        let recommendations = self
            .knowledge_store
            .get_recommendations(&card.description, None)
            .ok();

        self.observer_hub.dispatch(PipelineEvent::new(
            EventKind::PipelineStarted,
            card.id.clone(),
            None,
            serde_json::json!({ "plan": plan, "recommendations": recommendations }),
        ));
        let _ = self
            .messenger
            .send(
                "all",
                MessageType::Notification,
                serde_json::json!({ "event": "pipeline_started", "card_id": card.id }),
                card.id.clone(),
                Priority::Medium,
                None,
            )
            .await;

        let stages = match &router_decision {
            Some(decision) => routing::apply_routing_decision(&plan.stages, decision),
            None => plan.stages.clone(),
        };

        let mut context = Context::new();
        context.insert("card_id", card.id.clone());
        context.insert("complexity", serde_json::to_value(plan.complexity).unwrap());

        let strategy = ExecutionStrategy::new(self.supervisor.clone(), plan.parallel_developers as usize);
        let execution_result = strategy
            .run(&stages, |name| stage_registry.get(name).cloned(), &developers, card, context)
            .await;

        let status = match execution_result.status {
            StrategyStatus::Success => FinalStatus::CompletedSuccessfully,
            StrategyStatus::Failed if execution_result.failed_stage.as_deref() == Some("code_review") => {
                FinalStatus::FailedCodeReview
            }
            StrategyStatus::Failed => FinalStatus::Failed,
        };

        let event_kind = match status {
            FinalStatus::CompletedSuccessfully => EventKind::PipelineCompleted,
            _ => EventKind::PipelineFailed,
        };
        self.observer_hub.dispatch(PipelineEvent::new(
            event_kind,
            card.id.clone(),
            None,
            serde_json::json!({ "status": status }),
        ));
        let _ = self
            .messenger
            .send(
                "all",
                MessageType::Notification,
                serde_json::json!({ "event": "pipeline_finished", "card_id": card.id, "status": status }),
                card.id.clone(),
                Priority::Medium,
                None,
            )
            .await;

        if let Some(error) = &execution_result.error {
            if let Some(failing_stage) = &execution_result.failed_stage {
                let _ = self.knowledge_store.store(
                    crate::artemis::knowledge_store::ArtifactType::IssueResolution,
                    &card.id,
                    &format!("pipeline failure at {failing_stage}"),
                    error,
                    Some(serde_json::json!({ "stage": failing_stage })),
                );
            }
        }

        let supervisor_statistics = self.supervisor.stats().await;

        PipelineReport {
            card_id: card.id.clone(),
            workflow_plan: plan,
            stages,
            status,
            execution_result,
            supervisor_statistics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artemis::knowledge_store::KnowledgeStore;
    use crate::artemis::messenger::{Messenger, MockMessenger};
    use async_trait::async_trait;

    struct Echo {
        name: &'static str,
    }

    #[async_trait]
    impl Stage for Echo {
        async fn execute(&self, _card: &Card, _context: &Context) -> Result<Value, String> {
            Ok(serde_json::json!({"status": "success"}))
        }
        fn get_stage_name(&self) -> &str {
            self.name
        }
    }

    #[tokio::test]
    async fn happy_path_simple_bugfix_completes_successfully() {
        let dir = tempfile::tempdir().unwrap();
        let kb = Arc::new(KnowledgeStore::open(dir.path().join("kb")).unwrap());
        let messenger = Arc::new(Messenger::new(Arc::new(MockMessenger::new())));
        let supervisor = Arc::new(Supervisor::new(messenger.clone()));
        let hub = Arc::new(ObserverHub::new());
        let orchestrator = Orchestrator::new(supervisor, kb, messenger, hub);

        let card = Card::new("card-1", "Fix bug", "fix small typo");
        let registry: HashMap<String, Arc<dyn Stage>> = [
            "project_analysis",
            "architecture",
            "dependencies",
            "development",
            "code_review",
            "validation",
            "integration",
            "testing",
        ]
        .into_iter()
        .map(|name| (name.to_string(), Arc::new(Echo { name }) as Arc<dyn Stage>))
        .collect();

        let report = orchestrator.run_pipeline(&card, registry, Vec::new(), None).await;
        assert_eq!(report.status, FinalStatus::CompletedSuccessfully);
        assert_eq!(report.workflow_plan.parallel_developers, 1);
    }
}
