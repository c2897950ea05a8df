//! Reference CLI driving a single card through the Artemis pipeline core.
//!
//! Wires an `Environment` read from `ARTEMIS_*` variables to concrete
//! Messenger/Persistence/Knowledge Store backends, registers a stub stage
//! implementation for every stage name the planner can produce, and runs one
//! of the three supported entry points against `--card-id`.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use clap::Parser;
use serde_json::Value;
use tracing::{error, info, warn};

use coordination::artemis::card::Card;
use coordination::artemis::config::{Environment, PersistenceBackendKind};
use coordination::artemis::context::Context;
use coordination::artemis::knowledge_store::KnowledgeStore;
use coordination::artemis::messenger::Messenger;
use coordination::artemis::observer::ObserverHub;
use coordination::artemis::orchestrator::{FinalStatus, Orchestrator};
use coordination::artemis::persistence::{JsonPersistence, PersistenceStore, SqlitePersistence};
use coordination::artemis::planner;
use coordination::artemis::stage::{Stage, StageOutcome};
use coordination::artemis::supervisor::Supervisor;

/// Minimal no-op stage used by the reference CLI in place of a real
/// implementer/reviewer backend (out of scope per the LLM-provider non-goal).
/// Mirrors the shape real stages must return: a `status` key, plus the extra
/// keys `code_review` carries.
struct ReferenceStage {
    name: String,
}

#[async_trait]
impl Stage for ReferenceStage {
    async fn execute(&self, card: &Card, _context: &Context) -> StageOutcome {
        info!(stage = %self.name, card_id = %card.id, "running reference stage");
        let result = match self.name.as_str() {
            "code_review" => serde_json::json!({
                "status": "PASS",
                "total_critical_issues": 0,
                "total_high_issues": 0,
                "reviews": [],
            }),
            "arbitration" => serde_json::json!({
                "status": "success",
                "winner": "developer_1",
                "confidence": "medium",
            }),
            _ => serde_json::json!({ "status": "success" }),
        };
        Ok(result)
    }

    fn get_stage_name(&self) -> &str {
        &self.name
    }
}

/// Every stage name any plan can produce, so `--full` never hits a missing
/// registry entry regardless of complexity/routing.
const ALL_STAGE_NAMES: &[&str] = &[
    "project_analysis",
    "architecture",
    "dependencies",
    "development",
    "code_review",
    "validation",
    "arbitration",
    "integration",
    "testing",
    "frontend",
    "backend",
    "api_integration",
    "database",
    "accessibility",
    "notebook",
];

fn build_stage_registry() -> HashMap<String, Arc<dyn Stage>> {
    ALL_STAGE_NAMES
        .iter()
        .map(|name| {
            let stage: Arc<dyn Stage> = Arc::new(ReferenceStage { name: name.to_string() });
            (name.to_string(), stage)
        })
        .collect()
}

#[derive(Parser, Debug)]
#[command(name = "artemis-cli", about = "Drive a single card through the Artemis pipeline")]
struct Args {
    #[arg(long)]
    card_id: String,

    #[arg(long)]
    full: bool,

    #[arg(long = "continue")]
    continue_run: bool,

    #[arg(long)]
    stage: Option<String>,
}

impl Args {
    fn validate(&self) -> Result<()> {
        let selected = [self.full, self.continue_run, self.stage.is_some()]
            .iter()
            .filter(|b| **b)
            .count();
        if selected != 1 {
            bail!("exactly one of --full, --continue, --stage <name> is required");
        }
        Ok(())
    }
}

fn open_persistence(env: &Environment) -> Result<PersistenceStore> {
    let store = match env.persistence_backend {
        PersistenceBackendKind::Sqlite => {
            PersistenceStore::new(Box::new(SqlitePersistence::open(&env.persistence_db)?))
        }
        PersistenceBackendKind::Json => {
            PersistenceStore::new(Box::new(JsonPersistence::open(&env.persistence_db)?))
        }
    };
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(std::env::var("RUST_LOG").unwrap_or_default()))
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    args.validate()?;

    let env = Environment::default();
    info!(
        messenger = ?env.messenger_backend,
        persistence = ?env.persistence_backend,
        max_parallel_developers = env.max_parallel_developers,
        "artemis-cli starting"
    );

    let messenger = Arc::new(
        Messenger::from_kind(env.messenger_backend, &env.message_dir, env.broker_url.as_deref())
            .context("failed to initialize messenger backend")?,
    );
    let persistence = open_persistence(&env).context("failed to open persistence backend")?;
    let knowledge_store = Arc::new(
        KnowledgeStore::open(format!("{}_kb", env.persistence_db))
            .context("failed to open knowledge store")?,
    );
    let supervisor = Arc::new(Supervisor::new(messenger.clone()));
    let observer_hub = Arc::new(ObserverHub::new());
    let registry = build_stage_registry();

    let status = if args.full {
        let card = Card::new(args.card_id.clone(), args.card_id.clone(), args.card_id.clone());
        let orchestrator = Orchestrator::new(supervisor, knowledge_store, messenger, observer_hub);
        let report = orchestrator.run_pipeline(&card, registry, Vec::new(), None).await;
        info!(status = ?report.status, stages = ?report.stages, "pipeline finished");
        persist_final(&persistence, &args.card_id, report.status)?;
        report.status
    } else if args.continue_run {
        run_continue(&args.card_id, &persistence, &supervisor, &registry).await?
    } else {
        let stage_name = args.stage.clone().expect("validated above");
        run_single_stage(&args.card_id, &stage_name, &supervisor, &registry).await?
    };

    match status {
        FinalStatus::CompletedSuccessfully => Ok(()),
        FinalStatus::Failed | FinalStatus::FailedCodeReview => {
            error!(card_id = %args.card_id, status = ?status, "pipeline did not complete successfully");
            std::process::exit(1);
        }
    }
}

/// Resumes a previously checkpointed card: skips every stage already present
/// in the persisted snapshot's `stages_completed` and runs the remainder of
/// the planned stage list in order.
async fn run_continue(
    card_id: &str,
    persistence: &PersistenceStore,
    supervisor: &Arc<Supervisor>,
    registry: &HashMap<String, Arc<dyn Stage>>,
) -> Result<FinalStatus> {
    let Some(state) = persistence.load_pipeline_state(card_id)? else {
        bail!("no persisted state for card {card_id}; nothing to continue");
    };
    if !state.status.is_resumable() {
        info!(card_id, "pipeline already in a terminal completed state");
        return Ok(FinalStatus::CompletedSuccessfully);
    }

    let card = Card::new(card_id, card_id, card_id);
    let plan = planner::plan(&card);
    let remaining: Vec<String> = plan
        .stages
        .into_iter()
        .filter(|s| !state.stages_completed.contains(s))
        .collect();

    info!(card_id, already_completed = state.stages_completed.len(), remaining = remaining.len(), "resuming pipeline");

    let mut context = Context::new();
    context.insert("card_id", card_id.to_string());

    for stage_name in &remaining {
        let Some(stage) = registry.get(stage_name) else {
            warn!(stage = %stage_name, "no implementation registered; skipping");
            continue;
        };
        let outcome = supervisor.execute_with_supervision(stage.as_ref(), &card, &context).await;
        if let Err(e) = outcome {
            error!(stage = %stage_name, error = %e, "resumed stage failed");
            return Ok(FinalStatus::Failed);
        }
    }

    Ok(FinalStatus::CompletedSuccessfully)
}

/// Runs exactly one named stage against the card, bypassing the planner and
/// strategy entirely.
async fn run_single_stage(
    card_id: &str,
    stage_name: &str,
    supervisor: &Arc<Supervisor>,
    registry: &HashMap<String, Arc<dyn Stage>>,
) -> Result<FinalStatus> {
    let Some(stage) = registry.get(stage_name) else {
        bail!("unknown stage: {stage_name}");
    };
    let card = Card::new(card_id, card_id, card_id);
    let mut context = Context::new();
    context.insert("card_id", card_id.to_string());

    match supervisor.execute_with_supervision(stage.as_ref(), &card, &context).await {
        Ok(_) => Ok(FinalStatus::CompletedSuccessfully),
        Err(e) => {
            error!(stage = %stage_name, error = %e, "stage failed");
            Ok(FinalStatus::Failed)
        }
    }
}

fn persist_final(persistence: &PersistenceStore, card_id: &str, status: FinalStatus) -> Result<()> {
    use coordination::artemis::persistence::{PipelineStateRecord, PipelineStatus};
    let now = chrono::Utc::now();
    let record = PipelineStateRecord {
        card_id: card_id.to_string(),
        status: match status {
            FinalStatus::CompletedSuccessfully => PipelineStatus::Completed,
            _ => PipelineStatus::Failed,
        },
        current_stage: None,
        stages_completed: Vec::new(),
        stage_results: Value::Null,
        developer_results: Value::Null,
        metrics: Value::Null,
        created_at: now,
        updated_at: now,
        completed_at: Some(now),
        error: None,
    };
    persistence.save_pipeline_state(&record)?;
    Ok(())
}
