//! Fan-out of pipeline events to attached observers (§4.L).
//!
//! Grounded on `events::bus::EventBus`'s publish/subscribe shape, but dispatch here
//! is synchronous in the caller's thread per §5: observers must not block beyond
//! logging and must not mutate the event, so there is no channel or persistence
//! layer to hand off to — just an ordered call over attached observers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PipelineStarted,
    PipelineCompleted,
    PipelineFailed,
    StageStarted,
    StageCompleted,
    StageFailed,
    DeveloperStarted,
    DeveloperCompleted,
    DeveloperFailed,
    CodeReviewStarted,
    CodeReviewCompleted,
    CodeReviewFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub kind: EventKind,
    pub card_id: String,
    pub stage_name: Option<String>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl PipelineEvent {
    pub fn new(kind: EventKind, card_id: impl Into<String>, stage_name: Option<String>, payload: Value) -> Self {
        Self {
            kind,
            card_id: card_id.into(),
            stage_name,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Implementors must not block on I/O beyond logging and must treat `event` as
/// read-only.
pub trait Observer: Send + Sync {
    fn on_event(&self, event: &PipelineEvent);
}

pub struct LoggingObserver;

impl Observer for LoggingObserver {
    fn on_event(&self, event: &PipelineEvent) {
        info!(
            kind = ?event.kind,
            card_id = %event.card_id,
            stage = ?event.stage_name,
            "{:?} for card {} at {}",
            event.kind,
            event.card_id,
            event.timestamp,
        );
    }
}

#[derive(Debug, Default)]
struct MetricsState {
    counters: HashMap<EventKind, u64>,
    stage_started_at: HashMap<String, DateTime<Utc>>,
    stage_durations: HashMap<String, Duration>,
}

pub struct MetricsObserver {
    state: Mutex<MetricsState>,
}

impl Default for MetricsObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsObserver {
    pub fn new() -> Self {
        Self { state: Mutex::new(MetricsState::default()) }
    }

    pub fn count(&self, kind: EventKind) -> u64 {
        self.state.lock().unwrap().counters.get(&kind).copied().unwrap_or(0)
    }

    pub fn stage_duration(&self, stage_name: &str) -> Option<Duration> {
        self.state.lock().unwrap().stage_durations.get(stage_name).copied()
    }
}

impl Observer for MetricsObserver {
    fn on_event(&self, event: &PipelineEvent) {
        let mut state = self.state.lock().unwrap();
        *state.counters.entry(event.kind).or_insert(0) += 1;

        if let Some(stage) = &event.stage_name {
            match event.kind {
                EventKind::StageStarted => {
                    state.stage_started_at.insert(stage.clone(), event.timestamp);
                }
                EventKind::StageCompleted | EventKind::StageFailed => {
                    if let Some(started) = state.stage_started_at.remove(stage) {
                        let elapsed = (event.timestamp - started).to_std().unwrap_or_default();
                        state.stage_durations.insert(stage.clone(), elapsed);
                    }
                }
                _ => {}
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservedState {
    pub current_stage: Option<String>,
    pub completed_stages: Vec<String>,
    pub failed_stages: Vec<String>,
    pub pipeline_status: Option<String>,
}

#[derive(Default)]
struct TrackerState {
    current_stage: Option<String>,
    completed_stages: Vec<String>,
    failed_stages: Vec<String>,
    pipeline_status: Option<String>,
}

pub struct StateTrackingObserver {
    state: Mutex<TrackerState>,
}

impl Default for StateTrackingObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTrackingObserver {
    pub fn new() -> Self {
        Self { state: Mutex::new(TrackerState::default()) }
    }

    pub fn get_state(&self) -> ObservedState {
        let state = self.state.lock().unwrap();
        ObservedState {
            current_stage: state.current_stage.clone(),
            completed_stages: state.completed_stages.clone(),
            failed_stages: state.failed_stages.clone(),
            pipeline_status: state.pipeline_status.clone(),
        }
    }
}

impl Observer for StateTrackingObserver {
    fn on_event(&self, event: &PipelineEvent) {
        let mut state = self.state.lock().unwrap();
        match event.kind {
            EventKind::StageStarted => state.current_stage = event.stage_name.clone(),
            EventKind::StageCompleted => {
                if let Some(stage) = &event.stage_name {
                    state.completed_stages.push(stage.clone());
                }
                state.current_stage = None;
            }
            EventKind::StageFailed => {
                if let Some(stage) = &event.stage_name {
                    state.failed_stages.push(stage.clone());
                }
                state.current_stage = None;
            }
            EventKind::PipelineCompleted => state.pipeline_status = Some("completed".to_string()),
            EventKind::PipelineFailed => state.pipeline_status = Some("failed".to_string()),
            EventKind::PipelineStarted => state.pipeline_status = Some("running".to_string()),
            _ => {}
        }
    }
}

static OBSERVER_HUB_DISPATCHES: AtomicU64 = AtomicU64::new(0);

pub struct ObserverHub {
    observers: Mutex<Vec<Arc<dyn Observer>>>,
}

impl Default for ObserverHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ObserverHub {
    pub fn new() -> Self {
        Self { observers: Mutex::new(Vec::new()) }
    }

    /// Wires the three built-in observers: logging, metrics, state-tracking.
    pub fn with_builtin_observers() -> (Self, Arc<MetricsObserver>, Arc<StateTrackingObserver>) {
        let hub = Self::new();
        let metrics = Arc::new(MetricsObserver::new());
        let tracker = Arc::new(StateTrackingObserver::new());
        hub.attach(Arc::new(LoggingObserver));
        hub.attach(metrics.clone());
        hub.attach(tracker.clone());
        (hub, metrics, tracker)
    }

    pub fn attach(&self, observer: Arc<dyn Observer>) {
        self.observers.lock().unwrap().push(observer);
    }

    pub fn dispatch(&self, event: PipelineEvent) {
        OBSERVER_HUB_DISPATCHES.fetch_add(1, Ordering::Relaxed);
        let observers = self.observers.lock().unwrap();
        for observer in observers.iter() {
            observer.on_event(&event);
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_reaches_all_attached_observers() {
        let (hub, metrics, tracker) = ObserverHub::with_builtin_observers();
        assert_eq!(hub.observer_count(), 3);

        hub.dispatch(PipelineEvent::new(EventKind::PipelineStarted, "card-1", None, Value::Null));
        hub.dispatch(PipelineEvent::new(EventKind::StageStarted, "card-1", Some("development".to_string()), Value::Null));
        hub.dispatch(PipelineEvent::new(EventKind::StageCompleted, "card-1", Some("development".to_string()), Value::Null));

        assert_eq!(metrics.count(EventKind::StageStarted), 1);
        assert!(metrics.stage_duration("development").is_some());

        let state = tracker.get_state();
        assert_eq!(state.pipeline_status.as_deref(), Some("running"));
        assert_eq!(state.completed_stages, vec!["development".to_string()]);
    }

    #[test]
    fn failed_stage_is_tracked_separately_from_completed() {
        let (hub, _metrics, tracker) = ObserverHub::with_builtin_observers();
        hub.dispatch(PipelineEvent::new(EventKind::StageStarted, "card-1", Some("validation".to_string()), Value::Null));
        hub.dispatch(PipelineEvent::new(EventKind::StageFailed, "card-1", Some("validation".to_string()), Value::Null));

        let state = tracker.get_state();
        assert_eq!(state.failed_stages, vec!["validation".to_string()]);
        assert!(state.completed_stages.is_empty());
    }

    #[test]
    fn custom_observer_can_be_attached() {
        struct Counter(Arc<std::sync::atomic::AtomicU32>);
        impl Observer for Counter {
            fn on_event(&self, _event: &PipelineEvent) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let hub = ObserverHub::new();
        let count = Arc::new(std::sync::atomic::AtomicU32::new(0));
        hub.attach(Arc::new(Counter(count.clone())));
        hub.dispatch(PipelineEvent::new(EventKind::PipelineCompleted, "card-1", None, Value::Null));
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}
