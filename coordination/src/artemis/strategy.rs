//! Runs the filtered ordered stage list, handling parallel developers and the
//! code-review retry loop (§4.J).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::artemis::card::Card;
use crate::artemis::context::Context;
use crate::artemis::stage::Stage;
use crate::artemis::supervisor::Supervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyResult {
    pub status: StrategyStatus,
    pub results: std::collections::HashMap<String, Value>,
    pub error: Option<String>,
    pub failed_stage: Option<String>,
}

pub struct ExecutionStrategy {
    supervisor: Arc<Supervisor>,
    max_parallel_developers: usize,
    max_code_review_retries: u32,
}

impl ExecutionStrategy {
    pub fn new(supervisor: Arc<Supervisor>, max_parallel_developers: usize) -> Self {
        Self {
            supervisor,
            max_parallel_developers: max_parallel_developers.clamp(1, 5),
            max_code_review_retries: 2,
        }
    }

    pub fn with_max_code_review_retries(mut self, limit: u32) -> Self {
        self.max_code_review_retries = limit;
        self
    }

    /// Runs `developers` concurrently, bounded by the configured worker-pool size.
    /// Individual failures are captured per-developer, not aggregated into an
    /// overall error — the strategy reports N results before `code_review` runs.
    async fn run_developers(
        &self,
        developers: &[Arc<dyn Stage>],
        card: &Card,
        context: &Context,
    ) -> Vec<(String, Result<Value, crate::artemis::supervisor::SupervisorError>)> {
        let permits = Arc::new(Semaphore::new(self.max_parallel_developers));
        let mut handles = Vec::new();

        for developer in developers {
            let permits = permits.clone();
            let supervisor = self.supervisor.clone();
            let developer = developer.clone();
            let card = card.clone();
            let context = context.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permits.acquire_owned().await.expect("semaphore not closed");
                let name = developer.get_stage_name().to_string();
                let result = supervisor.execute_with_supervision(developer.as_ref(), &card, &context).await;
                (name, result)
            }));
        }

        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(pair) => out.push(pair),
                Err(join_err) => out.push((
                    "developer".to_string(),
                    Err(crate::artemis::supervisor::SupervisorError::PipelineStage {
                        stage_name: "developer".to_string(),
                        retry_attempt: 0,
                        message: join_err.to_string(),
                    }),
                )),
            }
        }
        out
    }

    /// Sequential stages run in order. When `stage_name == "development"` and
    /// `developers.len() > 1`, all developers run concurrently before the next
    /// sequential stage (`code_review`) is reached. After `code_review`, a FAIL
    /// with retries remaining restarts at `development` carrying feedback in
    /// `context.previous_review_feedback`.
    pub async fn run(
        &self,
        stage_names: &[String],
        stage_lookup: impl Fn(&str) -> Option<Arc<dyn Stage>>,
        developers: &[Arc<dyn Stage>],
        card: &Card,
        mut context: Context,
    ) -> StrategyResult {
        let mut results = std::collections::HashMap::new();
        let mut code_review_attempts = 0u32;
        let mut i = 0usize;

        while i < stage_names.len() {
            let stage_name = &stage_names[i];

            if stage_name == "development" && developers.len() > 1 {
                let dev_results = self.run_developers(developers, card, &context).await;
                let mut any_hard_error = None;
                for (name, result) in dev_results {
                    match result {
                        Ok(doc) => {
                            context.insert(format!("developer_result_{name}"), doc.clone());
                            results.insert(format!("development::{name}"), doc);
                        }
                        Err(e) => {
                            context.insert(format!("developer_error_{name}"), e.to_string());
                            any_hard_error.get_or_insert(e.to_string());
                        }
                    }
                }
                results.insert(
                    "development".to_string(),
                    serde_json::json!({"status": "success", "developer_count": developers.len()}),
                );
                let _ = any_hard_error;
                i += 1;
                continue;
            }

            let Some(stage) = stage_lookup(stage_name) else {
                warn!(stage = %stage_name, "no implementation registered for planned stage; skipping");
                i += 1;
                continue;
            };

            let outcome = self.supervisor.execute_with_supervision(stage.as_ref(), card, &context).await;

            match outcome {
                Ok(doc) => {
                    if stage_name == "code_review" && Supervisor::is_code_review_fail(&doc) {
                        code_review_attempts += 1;
                        results.insert(stage_name.clone(), doc.clone());
                        if code_review_attempts <= self.max_code_review_retries {
                            context.overwrite("previous_review_feedback", doc.clone());
                            info!(attempt = code_review_attempts, "code review failed; restarting at development");
                            if let Some(dev_idx) = stage_names.iter().position(|s| s == "development") {
                                i = dev_idx;
                                continue;
                            }
                        } else {
                            return StrategyResult {
                                status: StrategyStatus::Failed,
                                results,
                                error: Some("code review failed after exhausting retries".to_string()),
                                failed_stage: Some(stage_name.clone()),
                            };
                        }
                    } else {
                        context.insert(format!("{stage_name}_result"), doc.clone());
                        results.insert(stage_name.clone(), doc);
                        i += 1;
                    }
                }
                Err(e) => {
                    return StrategyResult {
                        status: StrategyStatus::Failed,
                        results,
                        error: Some(e.to_string()),
                        failed_stage: Some(stage_name.clone()),
                    };
                }
            }
        }

        StrategyResult {
            status: StrategyStatus::Success,
            results,
            error: None,
            failed_stage: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artemis::messenger::{Messenger, MockMessenger};
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct Echo {
        name: String,
        status: String,
    }

    #[async_trait]
    impl Stage for Echo {
        async fn execute(&self, _card: &Card, _context: &Context) -> Result<Value, String> {
            Ok(serde_json::json!({"status": self.status}))
        }
        fn get_stage_name(&self) -> &str {
            &self.name
        }
    }

    fn strategy() -> ExecutionStrategy {
        let supervisor = Arc::new(Supervisor::new(Arc::new(Messenger::new(Arc::new(MockMessenger::new())))));
        ExecutionStrategy::new(supervisor, 3)
    }

    #[tokio::test]
    async fn happy_path_runs_all_stages_in_order() {
        let strategy = strategy();
        let stages = vec!["development".to_string(), "code_review".to_string(), "validation".to_string()];
        let registry: HashMap<String, Arc<dyn Stage>> = [
            ("development".to_string(), Arc::new(Echo { name: "development".to_string(), status: "success".to_string() }) as Arc<dyn Stage>),
            ("code_review".to_string(), Arc::new(Echo { name: "code_review".to_string(), status: "PASS".to_string() }) as Arc<dyn Stage>),
            ("validation".to_string(), Arc::new(Echo { name: "validation".to_string(), status: "success".to_string() }) as Arc<dyn Stage>),
        ]
        .into_iter()
        .collect();

        let card = Card::new("card-1", "t", "d");
        let result = strategy
            .run(&stages, |name| registry.get(name).cloned(), &[], &card, Context::new())
            .await;
        assert_eq!(result.status, StrategyStatus::Success);
        assert_eq!(result.results.len(), 3);
    }

    #[tokio::test]
    async fn code_review_fail_restarts_development_then_succeeds() {
        let strategy = strategy();
        let stages = vec!["development".to_string(), "code_review".to_string()];

        struct FlakyReview {
            calls: std::sync::atomic::AtomicU32,
        }
        #[async_trait]
        impl Stage for FlakyReview {
            async fn execute(&self, _card: &Card, _context: &Context) -> Result<Value, String> {
                let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if n == 0 {
                    Ok(serde_json::json!({"status": "FAIL"}))
                } else {
                    Ok(serde_json::json!({"status": "PASS"}))
                }
            }
            fn get_stage_name(&self) -> &str {
                "code_review"
            }
        }

        let dev: Arc<dyn Stage> = Arc::new(Echo { name: "development".to_string(), status: "success".to_string() });
        let review: Arc<dyn Stage> = Arc::new(FlakyReview { calls: std::sync::atomic::AtomicU32::new(0) });
        let registry: HashMap<String, Arc<dyn Stage>> =
            [("development".to_string(), dev), ("code_review".to_string(), review)].into_iter().collect();

        let card = Card::new("card-1", "t", "d");
        let result = strategy
            .run(&stages, |name| registry.get(name).cloned(), &[], &card, Context::new())
            .await;
        assert_eq!(result.status, StrategyStatus::Success);
    }

    #[tokio::test]
    async fn stage_error_halts_with_no_further_stages() {
        struct AlwaysErrors;
        #[async_trait]
        impl Stage for AlwaysErrors {
            async fn execute(&self, _card: &Card, _context: &Context) -> Result<Value, String> {
                Err("disk full".to_string())
            }
            fn get_stage_name(&self) -> &str {
                "development"
            }
        }

        let strategy = ExecutionStrategy::new(
            Arc::new(Supervisor::new(Arc::new(Messenger::new(Arc::new(MockMessenger::new()))))),
            1,
        );
        let stages = vec!["development".to_string(), "code_review".to_string()];
        let registry: HashMap<String, Arc<dyn Stage>> =
            [("development".to_string(), Arc::new(AlwaysErrors) as Arc<dyn Stage>)].into_iter().collect();

        let card = Card::new("card-1", "t", "d");
        let result = strategy
            .run(&stages, |name| registry.get(name).cloned(), &[], &card, Context::new())
            .await;
        assert_eq!(result.status, StrategyStatus::Failed);
        assert_eq!(result.failed_stage.as_deref(), Some("development"));
        assert!(!result.results.contains_key("code_review"));
    }
}
