//! Autonomous software-delivery pipeline orchestration.
//!
//! A card (unit of work) is planned into an ordered stage list, routed through
//! an optional keyword/AI filter, and driven stage-by-stage by the execution
//! strategy under supervisor-managed retry and circuit-breaking. Outcomes feed
//! the learning engine and knowledge store so later cards benefit from past
//! runs; every pipeline run is observable and resumable from persisted state.

pub mod card;
pub mod context;
pub mod config;
pub mod cost_tracker;
pub mod error;
pub mod knowledge_store;
pub mod learning;
pub mod messenger;
pub mod observer;
pub mod orchestrator;
pub mod persistence;
pub mod planner;
pub mod routing;
pub mod sandbox;
pub mod stage;
pub mod state_machine;
pub mod strategy;
pub mod supervisor;

pub use card::Card;
pub use config::Environment;
pub use context::Context;
pub use cost_tracker::{CostError, CostTracker};
pub use error::ArtemisError;
pub use knowledge_store::{ArtifactType, KnowledgeStore, SharedKnowledgeStore};
pub use learning::{LearningEngine, RecoveryWorkflow, Severity};
pub use messenger::{Messenger, SharedMessenger};
pub use observer::{EventKind, Observer, ObserverHub, PipelineEvent};
pub use orchestrator::{FinalStatus, Orchestrator, PipelineReport};
pub use persistence::{PersistenceBackend, PersistenceStore, PipelineStateRecord, StageCheckpoint};
pub use planner::{Complexity, TaskType as PlannerTaskType, WorkflowPlan};
pub use routing::{apply_routing_decision, keyword_fallback, RoutingDecision};
pub use sandbox::{SandboxConfig, SandboxExecutor};
pub use stage::Stage;
pub use state_machine::{PipelineState, StateMachine};
pub use strategy::{ExecutionStrategy, StrategyResult};
pub use supervisor::Supervisor;
