//! Lifecycle events and the fire-and-forget emitter.
//!
//! The engine emits a typed event for every state transition and every
//! activity attempt/result. Delivery is at-least-once and best-effort:
//! sink failures are logged and never affect the engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

use crate::types::{Case, CaseId, CaseState, Phase};

/// Enumerated event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "state.new")]
    StateNew,
    #[serde(rename = "state.diagnose")]
    StateDiagnose,
    #[serde(rename = "state.patch")]
    StatePatch,
    #[serde(rename = "state.test")]
    StateTest,
    #[serde(rename = "state.prove")]
    StateProve,
    #[serde(rename = "state.merge")]
    StateMerge,
    #[serde(rename = "state.done")]
    StateDone,
    #[serde(rename = "state.failed")]
    StateFailed,
    #[serde(rename = "activity.attempt")]
    ActivityAttempt,
    #[serde(rename = "activity.result")]
    ActivityResult,
    #[serde(rename = "dedup.hit")]
    DedupHit,
}

impl EventType {
    /// The wire name of this event type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StateNew => "state.new",
            Self::StateDiagnose => "state.diagnose",
            Self::StatePatch => "state.patch",
            Self::StateTest => "state.test",
            Self::StateProve => "state.prove",
            Self::StateMerge => "state.merge",
            Self::StateDone => "state.done",
            Self::StateFailed => "state.failed",
            Self::ActivityAttempt => "activity.attempt",
            Self::ActivityResult => "activity.result",
            Self::DedupHit => "dedup.hit",
        }
    }

    /// The event emitted on entering a state.
    #[must_use]
    pub const fn for_state(state: CaseState) -> Self {
        match state {
            CaseState::New => Self::StateNew,
            CaseState::Diagnose => Self::StateDiagnose,
            CaseState::Patch => Self::StatePatch,
            CaseState::Test => Self::StateTest,
            CaseState::Prove => Self::StateProve,
            CaseState::Merge => Self::StateMerge,
            CaseState::Done => Self::StateDone,
            CaseState::Failed => Self::StateFailed,
        }
    }

    /// Severity for downstream channels.
    #[must_use]
    pub const fn severity(self) -> Severity {
        match self {
            Self::StateFailed => Severity::Warning,
            _ => Severity::Info,
        }
    }
}

/// Severity levels for downstream consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// One lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseEvent {
    /// Event type
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Case the event refers to
    pub case_id: CaseId,
    /// Repository full name
    pub repository: String,
    /// Workflow run ID
    pub run_id: u64,
    /// Head commit of the failing run
    pub head_sha: String,
    /// Case state at emission time
    pub state: CaseState,
    /// Activity attempt number, for `activity.*` events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    /// When the event was emitted
    pub timestamp: DateTime<Utc>,
    /// Event-specific payload
    #[serde(default)]
    pub data: Value,
}

impl CaseEvent {
    /// Build an event for a case.
    #[must_use]
    pub fn for_case(case: &Case, event_type: EventType, data: Value) -> Self {
        Self {
            event_type,
            case_id: case.id.clone(),
            repository: case.event.repository.clone(),
            run_id: case.event.run_id,
            head_sha: case.event.head_sha.clone(),
            state: case.state,
            attempt: None,
            timestamp: Utc::now(),
            data,
        }
    }

    /// Build an event for an ingress-side occurrence (e.g. a dedup hit)
    /// where no projection is in hand.
    #[must_use]
    pub fn for_ingress(
        case_id: CaseId,
        event: &crate::types::FailureEvent,
        event_type: EventType,
        data: Value,
    ) -> Self {
        Self {
            event_type,
            case_id,
            repository: event.repository.clone(),
            run_id: event.run_id,
            head_sha: event.head_sha.clone(),
            state: CaseState::New,
            attempt: None,
            timestamp: Utc::now(),
            data,
        }
    }

    /// Build an `activity.*` event for a case.
    #[must_use]
    pub fn for_activity(
        case: &Case,
        event_type: EventType,
        phase: Phase,
        attempt: u32,
        data: Value,
    ) -> Self {
        let mut event = Self::for_case(case, event_type, data);
        event.attempt = Some(attempt);
        event.data["phase"] = Value::String(phase.name().to_string());
        event
    }
}

/// Errors a sink may report. They are logged, never propagated.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Sink rejected or lost the event
    #[error("sink delivery failed: {0}")]
    Delivery(String),

    /// Event could not be serialized for the sink
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Destination for lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// A short name for logging.
    fn name(&self) -> &'static str;

    /// Publish one event.
    async fn publish(&self, event: &CaseEvent) -> Result<(), SinkError>;
}

/// Bound on events queued toward the sinks; beyond it events are dropped
/// with a warning (delivery is best-effort).
const EMIT_BUFFER: usize = 1_024;

/// Central event dispatcher.
///
/// Events flow through a channel to a single pump task that publishes to
/// every sink in order, so sinks observe events in emission order. `emit`
/// never blocks and never fails the engine; an unreachable sink costs a
/// log line, nothing more.
#[derive(Clone, Default)]
pub struct EventEmitter {
    tx: Option<mpsc::Sender<CaseEvent>>,
    sinks: Arc<Vec<Arc<dyn EventSink>>>,
}

impl EventEmitter {
    /// Create an emitter over the given sinks and start its pump task.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        if sinks.is_empty() {
            return Self::disabled();
        }

        let sinks = Arc::new(sinks);
        let (tx, mut rx) = mpsc::channel::<CaseEvent>(EMIT_BUFFER);
        let pump_sinks = Arc::clone(&sinks);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for sink in pump_sinks.iter() {
                    match sink.publish(&event).await {
                        Ok(()) => {
                            debug!(
                                sink = sink.name(),
                                event = event.event_type.as_str(),
                                "event published"
                            );
                        }
                        Err(e) => {
                            error!(
                                sink = sink.name(),
                                event = event.event_type.as_str(),
                                error = %e,
                                "failed to publish event"
                            );
                        }
                    }
                }
            }
        });

        Self {
            tx: Some(tx),
            sinks,
        }
    }

    /// Create an emitter that drops every event.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            tx: None,
            sinks: Arc::new(Vec::new()),
        }
    }

    /// Number of configured sinks.
    #[must_use]
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Queue an event toward all sinks, fire-and-forget.
    pub fn emit(&self, event: CaseEvent) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.try_send(event) {
                warn!(error = %e, "event dropped");
            }
        }
    }

    /// Best-effort wait until queued events have been handed to the sinks.
    /// A test aid; production callers never need to wait.
    pub async fn flush(&self) {
        if let Some(tx) = &self.tx {
            while tx.capacity() != tx.max_capacity() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
            // the pump may still be mid-publish on the last event
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    /// Send an event and wait for every sink, bypassing the queue.
    pub async fn emit_and_wait(&self, event: CaseEvent) -> Vec<(String, Result<(), SinkError>)> {
        let mut results = Vec::with_capacity(self.sinks.len());
        for sink in self.sinks.iter() {
            let result = sink.publish(&event).await;
            results.push((sink.name().to_string(), result));
        }
        results
    }
}

/// In-memory sink that records every event, for tests.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<CaseEvent>>>,
}

impl MemorySink {
    /// Create an empty recording sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded events, in delivery order.
    pub async fn events(&self) -> Vec<CaseEvent> {
        self.events.lock().await.clone()
    }

    /// Recorded event types, in delivery order.
    pub async fn event_types(&self) -> Vec<EventType> {
        self.events
            .lock()
            .await
            .iter()
            .map(|e| e.event_type)
            .collect()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, event: &CaseEvent) -> Result<(), SinkError> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}
