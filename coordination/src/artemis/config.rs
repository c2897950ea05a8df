//! Environment-derived configuration, built once at startup.
//!
//! Replaces the "global singleton configuration" pattern (see design notes): nothing
//! below the Orchestrator reads `std::env` directly. Follows the same
//! `std::env::var(...).unwrap_or_else(...)` shape already used by `main::LlmConfig`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Mock,
}

impl LlmProvider {
    fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "openai" => LlmProvider::OpenAi,
            "anthropic" => LlmProvider::Anthropic,
            _ => LlmProvider::Mock,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessengerBackendKind {
    File,
    Broker,
    Mock,
}

impl MessengerBackendKind {
    fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "broker" => MessengerBackendKind::Broker,
            "mock" => MessengerBackendKind::Mock,
            _ => MessengerBackendKind::File,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistenceBackendKind {
    Sqlite,
    Json,
}

impl PersistenceBackendKind {
    fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "json" => PersistenceBackendKind::Json,
            _ => PersistenceBackendKind::Sqlite,
        }
    }
}

/// The `Environment` value threaded into the Orchestrator constructor (design notes §9).
#[derive(Debug, Clone)]
pub struct Environment {
    pub llm_provider: LlmProvider,
    pub llm_model: String,
    pub messenger_backend: MessengerBackendKind,
    pub message_dir: String,
    pub broker_url: Option<String>,
    pub persistence_backend: PersistenceBackendKind,
    pub persistence_db: String,
    pub max_parallel_developers: u32,
    pub enable_code_review: bool,
    pub verbose: bool,
    pub log_level: String,
    pub daily_budget: f64,
    pub monthly_budget: f64,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            llm_provider: LlmProvider::parse(&env_or("ARTEMIS_LLM_PROVIDER", "mock")),
            llm_model: env_or("ARTEMIS_LLM_MODEL", "gpt-4o-mini"),
            messenger_backend: MessengerBackendKind::parse(&env_or("ARTEMIS_MESSENGER_TYPE", "file")),
            message_dir: env_or("ARTEMIS_MESSAGE_DIR", "/tmp/artemis_messages"),
            broker_url: std::env::var("ARTEMIS_BROKER_URL").ok(),
            persistence_backend: PersistenceBackendKind::parse(&env_or(
                "ARTEMIS_PERSISTENCE_TYPE",
                "sqlite",
            )),
            persistence_db: env_or("ARTEMIS_PERSISTENCE_DB", "/tmp/artemis_persistence.db"),
            max_parallel_developers: env_or("ARTEMIS_MAX_PARALLEL_DEVELOPERS", "3")
                .parse::<u32>()
                .unwrap_or(3)
                .clamp(1, 5),
            enable_code_review: env_bool("ARTEMIS_ENABLE_CODE_REVIEW", true),
            verbose: env_bool("ARTEMIS_VERBOSE", false),
            log_level: env_or("ARTEMIS_LOG_LEVEL", "INFO"),
            daily_budget: env_f64("ARTEMIS_DAILY_BUDGET", 50.0),
            monthly_budget: env_f64("ARTEMIS_MONTHLY_BUDGET", 1000.0),
        }
    }
}

impl Environment {
    /// Build a synthetic environment for tests, bypassing `std::env` entirely.
    pub fn synthetic() -> Self {
        Self {
            llm_provider: LlmProvider::Mock,
            llm_model: "mock-model".to_string(),
            messenger_backend: MessengerBackendKind::Mock,
            message_dir: "/tmp/artemis_messages_test".to_string(),
            broker_url: None,
            persistence_backend: PersistenceBackendKind::Json,
            persistence_db: "/tmp/artemis_test.db".to_string(),
            max_parallel_developers: 3,
            enable_code_review: true,
            verbose: false,
            log_level: "DEBUG".to_string(),
            daily_budget: 100.0,
            monthly_budget: 2000.0,
        }
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(300)
    }
}
