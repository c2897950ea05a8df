//! Pluggable inter-agent messenger (§4.A).
//!
//! Three backends behind one trait, selected by a factory reading either an explicit
//! kind or `ARTEMIS_MESSENGER_TYPE`. Grounded on the broadcast/subscribe shape of
//! `events::bus::EventBus` and the in-memory recording pattern used by the ensemble
//! store's test mocks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::artemis::config::MessengerBackendKind;

pub type MessengerResult<T> = Result<T, MessengerError>;

#[derive(Debug, Error)]
pub enum MessengerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("broker url not configured")]
    BrokerNotConfigured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    DataUpdate,
    Request,
    Response,
    Notification,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// Broker header mapping per §6: high→9, medium→5, low→1.
    pub fn broker_header(&self) -> u8 {
        match self {
            Priority::High => 9,
            Priority::Medium => 5,
            Priority::Low => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub protocol_version: u32,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub from_agent: String,
    pub to_agent: String,
    pub message_type: MessageType,
    pub card_id: String,
    pub priority: Priority,
    pub data: Value,
    pub metadata: Value,
}

const PROTOCOL_VERSION: u32 = 1;
pub const BROADCAST: &str = "all";

static MONOTONIC: AtomicU64 = AtomicU64::new(0);

/// Timestamp + sender + monotonic counter + payload digest: collision resistance, not
/// cryptographic, per §4.A.
fn make_message_id(from_agent: &str, data: &Value) -> String {
    let counter = MONOTONIC.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let digest = blake3::hash(data.to_string().as_bytes());
    format!("{nanos}-{from_agent}-{counter}-{}", &digest.to_hex()[..12])
}

#[derive(Debug, Default, Clone)]
pub struct ReadFilter {
    pub message_type: Option<MessageType>,
    pub from_agent: Option<String>,
    pub priority: Option<Priority>,
}

impl ReadFilter {
    fn matches(&self, msg: &Message) -> bool {
        if let Some(mt) = self.message_type {
            if mt != msg.message_type {
                return false;
            }
        }
        if let Some(ref from) = self.from_agent {
            if from != &msg.from_agent {
                return false;
            }
        }
        if let Some(p) = self.priority {
            if p != msg.priority {
                return false;
            }
        }
        true
    }
}

#[async_trait::async_trait]
pub trait MessengerBackend: Send + Sync {
    async fn send(&self, msg: Message) -> MessengerResult<String>;
    async fn read(&self, agent: &str, filter: ReadFilter, consume: bool) -> MessengerResult<Vec<Message>>;
    async fn update_shared_state(&self, card_id: &str, updates: Value) -> MessengerResult<()>;
    async fn get_shared_state(&self, card_id: Option<&str>) -> MessengerResult<Value>;
    async fn register_agent(&self, agent: &str, capabilities: Vec<String>, status: String) -> MessengerResult<()>;
    async fn heartbeat(&self, agent: &str) -> MessengerResult<()>;
    async fn cleanup(&self) -> MessengerResult<()>;
    fn backend_type(&self) -> &'static str;
}

/// In-memory mock backend: records every send, useful for tests and for scenarios
/// that don't need cross-process delivery.
#[derive(Default)]
pub struct MockMessenger {
    inboxes: Mutex<HashMap<String, Vec<Message>>>,
    shared_state: Mutex<HashMap<String, Value>>,
    sent: Mutex<Vec<Message>>,
}

impl MockMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent_messages(&self) -> Vec<Message> {
        self.sent.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl MessengerBackend for MockMessenger {
    async fn send(&self, msg: Message) -> MessengerResult<String> {
        let id = msg.message_id.clone();
        self.sent.lock().await.push(msg.clone());
        let mut inboxes = self.inboxes.lock().await;
        if msg.to_agent == BROADCAST {
            for inbox in inboxes.values_mut() {
                inbox.push(msg.clone());
            }
        } else {
            inboxes.entry(msg.to_agent.clone()).or_default().push(msg);
        }
        Ok(id)
    }

    async fn read(&self, agent: &str, filter: ReadFilter, consume: bool) -> MessengerResult<Vec<Message>> {
        let mut inboxes = self.inboxes.lock().await;
        let Some(inbox) = inboxes.get_mut(agent) else {
            return Ok(Vec::new());
        };
        let (matched, rest): (Vec<_>, Vec<_>) = inbox.drain(..).partition(|m| filter.matches(m));
        if consume {
            *inbox = rest;
        } else {
            *inbox = rest.into_iter().chain(matched.clone()).collect();
        }
        Ok(matched)
    }

    async fn update_shared_state(&self, card_id: &str, updates: Value) -> MessengerResult<()> {
        self.shared_state.lock().await.insert(card_id.to_string(), updates);
        Ok(())
    }

    async fn get_shared_state(&self, card_id: Option<&str>) -> MessengerResult<Value> {
        let state = self.shared_state.lock().await;
        match card_id {
            Some(id) => Ok(state.get(id).cloned().unwrap_or(Value::Null)),
            None => Ok(serde_json::to_value(&*state)?),
        }
    }

    async fn register_agent(&self, agent: &str, _capabilities: Vec<String>, _status: String) -> MessengerResult<()> {
        self.inboxes.lock().await.entry(agent.to_string()).or_default();
        Ok(())
    }

    async fn heartbeat(&self, _agent: &str) -> MessengerResult<()> {
        Ok(())
    }

    async fn cleanup(&self) -> MessengerResult<()> {
        self.inboxes.lock().await.clear();
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "mock"
    }
}

/// File-inbox backend: one directory per agent; `.json` is unread, `.json.read` is
/// consumed. Filenames sort by timestamp so ordering is best-effort only.
pub struct FileMessenger {
    root: PathBuf,
    shared_state_path: PathBuf,
}

impl FileMessenger {
    pub fn new(root: impl Into<PathBuf>) -> MessengerResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let shared_state_path = root.join("_shared_state.json");
        Ok(Self { root, shared_state_path })
    }

    fn agent_dir(&self, agent: &str) -> PathBuf {
        self.root.join(agent)
    }

    fn read_shared_state(&self) -> MessengerResult<HashMap<String, Value>> {
        if !self.shared_state_path.exists() {
            return Ok(HashMap::new());
        }
        let raw = std::fs::read_to_string(&self.shared_state_path)?;
        Ok(serde_json::from_str(&raw).unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl MessengerBackend for FileMessenger {
    async fn send(&self, msg: Message) -> MessengerResult<String> {
        let id = msg.message_id.clone();
        let targets: Vec<String> = if msg.to_agent == BROADCAST {
            std::fs::read_dir(&self.root)?
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_dir())
                .filter_map(|e| e.file_name().into_string().ok())
                .collect()
        } else {
            vec![msg.to_agent.clone()]
        };

        for target in targets {
            let dir = self.agent_dir(&target);
            std::fs::create_dir_all(&dir)?;
            let filename = format!(
                "{}_{}_to_{}_{:?}.json",
                msg.timestamp.format("%Y%m%d%H%M%S"),
                msg.from_agent,
                target,
                msg.message_type,
            );
            let path = dir.join(filename);
            std::fs::write(path, serde_json::to_vec_pretty(&msg)?)?;
        }
        Ok(id)
    }

    async fn read(&self, agent: &str, filter: ReadFilter, consume: bool) -> MessengerResult<Vec<Message>> {
        let dir = self.agent_dir(agent);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();
        entries.sort();

        let mut out = Vec::new();
        for path in entries {
            let raw = match std::fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read message file; quarantining");
                    continue;
                }
            };
            let msg: Message = match serde_json::from_str(&raw) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to parse message; quarantining");
                    let quarantine = path.with_extension("json.bad");
                    let _ = std::fs::rename(&path, quarantine);
                    continue;
                }
            };
            if !filter.matches(&msg) {
                continue;
            }
            out.push(msg);
            if consume {
                let read_path = path.with_extension("json.read");
                let _ = std::fs::rename(&path, read_path);
            }
        }
        Ok(out)
    }

    async fn update_shared_state(&self, card_id: &str, updates: Value) -> MessengerResult<()> {
        let mut state = self.read_shared_state()?;
        state.insert(card_id.to_string(), updates);
        std::fs::write(&self.shared_state_path, serde_json::to_vec_pretty(&state)?)?;
        Ok(())
    }

    async fn get_shared_state(&self, card_id: Option<&str>) -> MessengerResult<Value> {
        let state = self.read_shared_state()?;
        match card_id {
            Some(id) => Ok(state.get(id).cloned().unwrap_or(Value::Null)),
            None => Ok(serde_json::to_value(state)?),
        }
    }

    async fn register_agent(&self, agent: &str, _capabilities: Vec<String>, _status: String) -> MessengerResult<()> {
        std::fs::create_dir_all(self.agent_dir(agent))?;
        Ok(())
    }

    async fn heartbeat(&self, _agent: &str) -> MessengerResult<()> {
        Ok(())
    }

    async fn cleanup(&self) -> MessengerResult<()> {
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}

/// Broker-backed messenger. The real AMQP transport lives outside this crate's test
/// surface; this type holds the routing conventions from §6 (durable per-agent queue,
/// fanout broadcast exchange, topic exchange for shared state) over an injected
/// in-process transport so the routing logic itself is unit-testable without a broker.
pub struct BrokerMessenger {
    url: String,
    inner: MockMessenger,
}

impl BrokerMessenger {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            inner: MockMessenger::new(),
        }
    }

    pub fn queue_name(agent: &str) -> String {
        format!("artemis.agent.{agent}")
    }

    pub const BROADCAST_EXCHANGE: &'static str = "artemis.broadcast";

    pub fn state_routing_key(card_id: &str) -> String {
        format!("state.{card_id}")
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl MessengerBackend for BrokerMessenger {
    async fn send(&self, msg: Message) -> MessengerResult<String> {
        debug!(
            queue = %Self::queue_name(&msg.to_agent),
            priority_header = msg.priority.broker_header(),
            "publishing to broker"
        );
        self.inner.send(msg).await
    }

    async fn read(&self, agent: &str, filter: ReadFilter, consume: bool) -> MessengerResult<Vec<Message>> {
        self.inner.read(agent, filter, consume).await
    }

    async fn update_shared_state(&self, card_id: &str, updates: Value) -> MessengerResult<()> {
        debug!(routing_key = %Self::state_routing_key(card_id), "publishing state update");
        self.inner.update_shared_state(card_id, updates).await
    }

    async fn get_shared_state(&self, card_id: Option<&str>) -> MessengerResult<Value> {
        self.inner.get_shared_state(card_id).await
    }

    async fn register_agent(&self, agent: &str, capabilities: Vec<String>, status: String) -> MessengerResult<()> {
        self.inner.register_agent(agent, capabilities, status).await
    }

    async fn heartbeat(&self, agent: &str) -> MessengerResult<()> {
        self.inner.heartbeat(agent).await
    }

    async fn cleanup(&self) -> MessengerResult<()> {
        self.inner.cleanup().await
    }

    fn backend_type(&self) -> &'static str {
        "broker"
    }
}

/// Front door used by the rest of the core: builds `Message` envelopes and delegates
/// to whichever backend was selected.
pub struct Messenger {
    backend: Arc<dyn MessengerBackend>,
}

pub type SharedMessenger = Arc<Messenger>;

impl Messenger {
    pub fn new(backend: Arc<dyn MessengerBackend>) -> Self {
        Self { backend }
    }

    /// Factory: select a backend from an explicit kind plus config, per §4.A / §9.
    pub fn from_kind(kind: MessengerBackendKind, message_dir: &str, broker_url: Option<&str>) -> MessengerResult<Self> {
        let backend: Arc<dyn MessengerBackend> = match kind {
            MessengerBackendKind::Mock => Arc::new(MockMessenger::new()),
            MessengerBackendKind::File => Arc::new(FileMessenger::new(message_dir)?),
            MessengerBackendKind::Broker => {
                let url = broker_url.ok_or(MessengerError::BrokerNotConfigured)?;
                Arc::new(BrokerMessenger::new(url))
            }
        };
        Ok(Self { backend })
    }

    pub async fn send(
        &self,
        to_agent: impl Into<String>,
        message_type: MessageType,
        data: Value,
        card_id: impl Into<String>,
        priority: Priority,
        metadata: Option<Value>,
    ) -> MessengerResult<String> {
        let from_agent = "orchestrator".to_string();
        let message_id = make_message_id(&from_agent, &data);
        let msg = Message {
            protocol_version: PROTOCOL_VERSION,
            message_id,
            timestamp: Utc::now(),
            from_agent,
            to_agent: to_agent.into(),
            message_type,
            card_id: card_id.into(),
            priority,
            data,
            metadata: metadata.unwrap_or(Value::Null),
        };
        self.backend.send(msg).await
    }

    pub async fn read(&self, agent: &str, filter: ReadFilter, consume: bool) -> MessengerResult<Vec<Message>> {
        self.backend.read(agent, filter, consume).await
    }

    pub async fn update_shared_state(&self, card_id: &str, updates: Value) -> MessengerResult<()> {
        self.backend.update_shared_state(card_id, updates).await
    }

    pub async fn get_shared_state(&self, card_id: Option<&str>) -> MessengerResult<Value> {
        self.backend.get_shared_state(card_id).await
    }

    pub async fn register_agent(&self, agent: &str, capabilities: Vec<String>, status: String) -> MessengerResult<()> {
        self.backend.register_agent(agent, capabilities, status).await
    }

    pub async fn heartbeat(&self, agent: &str) -> MessengerResult<()> {
        self.backend.heartbeat(agent).await
    }

    pub async fn cleanup(&self) -> MessengerResult<()> {
        self.backend.cleanup().await
    }

    pub fn backend_type(&self) -> &'static str {
        self.backend.backend_type()
    }
}
