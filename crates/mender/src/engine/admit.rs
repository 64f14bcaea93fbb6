//! Admission of failure events.
//!
//! Validates the event, applies the staleness cutoff, consults the
//! deduplication index, writes the first journal entry, and enqueues the
//! case for the scheduler. Re-submission of an identical event within the
//! dedup TTL is a no-op from the engine's perspective.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::dedup::{Admission, DedupIndex};
use crate::error::AdmitError;
use crate::events::{CaseEvent, EventEmitter, EventType};
use crate::journal::{record, Journal};
use crate::types::{Case, CaseId, CaseState, EntryKind, FailureEvent};

/// What admission did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// A new case was created and queued
    Enqueued(CaseId),
    /// The event duplicates an admission within the TTL window
    DedupHit(CaseId),
}

/// Consumes failure events and feeds the scheduler.
pub struct Admitter {
    config: Arc<EngineConfig>,
    dedup: Arc<dyn DedupIndex>,
    journal: Arc<dyn Journal>,
    emitter: EventEmitter,
    queue: mpsc::Sender<Case>,
}

impl Admitter {
    /// Create an admitter feeding `queue`.
    #[must_use]
    pub fn new(
        config: Arc<EngineConfig>,
        dedup: Arc<dyn DedupIndex>,
        journal: Arc<dyn Journal>,
        emitter: EventEmitter,
        queue: mpsc::Sender<Case>,
    ) -> Self {
        Self {
            config,
            dedup,
            journal,
            emitter,
            queue,
        }
    }

    /// Admit one failure event.
    ///
    /// # Errors
    ///
    /// `IngressRejected` for malformed or ineligible events, `IngressStale`
    /// past the cutoff, `Backpressure` when the ready queue is full, and
    /// journal errors when the admission entry cannot be written.
    pub async fn admit(&self, event: FailureEvent) -> Result<AdmitOutcome, AdmitError> {
        Self::validate(&event)?;

        if !self.config.workflow_eligible(&event.workflow_name) {
            return Err(AdmitError::IngressRejected(format!(
                "workflow '{}' is not eligible for self-healing",
                event.workflow_name
            )));
        }

        let age = chrono::Utc::now() - event.occurred_at;
        if age > self.config.stale_cutoff() {
            return Err(AdmitError::IngressStale {
                age_secs: age.num_seconds(),
            });
        }

        // Saturated pool: fail fast before the dedup index records the key.
        if self.queue.capacity() == 0 {
            warn!(repository = %event.repository, run_id = event.run_id, "admission queue full");
            return Err(AdmitError::Backpressure);
        }

        let case_id = CaseId::for_event(&event);
        match self
            .dedup
            .try_admit(case_id.as_str(), self.config.dedup_ttl())
            .await
        {
            Admission::Duplicate => {
                debug!(case_id = %case_id, "duplicate failure event discarded");
                self.emitter.emit(CaseEvent::for_ingress(
                    case_id.clone(),
                    &event,
                    EventType::DedupHit,
                    serde_json::Value::Null,
                ));
                Ok(AdmitOutcome::DedupHit(case_id))
            }
            Admission::Admitted => {
                let mut case = Case::new(event, self.config.global_deadline());

                let admission = EntryKind::StateTransition {
                    from: None,
                    to: CaseState::New,
                    reason: None,
                    event: Some(case.event.clone()),
                };
                if let Err(e) = record(self.journal.as_ref(), &mut case, admission).await {
                    // Roll the key back so a retried submission can re-admit.
                    self.dedup.forget(case_id.as_str()).await;
                    return Err(e.into());
                }

                match self.queue.try_send(case) {
                    Ok(()) => {
                        info!(case_id = %case_id, "case admitted");
                        Ok(AdmitOutcome::Enqueued(case_id))
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.dedup.forget(case_id.as_str()).await;
                        Err(AdmitError::Backpressure)
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        self.dedup.forget(case_id.as_str()).await;
                        Err(AdmitError::ShutDown)
                    }
                }
            }
        }
    }

    fn validate(event: &FailureEvent) -> Result<(), AdmitError> {
        if event.repository.is_empty() {
            return Err(AdmitError::IngressRejected("empty repository".into()));
        }
        if event.head_sha.is_empty() {
            return Err(AdmitError::IngressRejected("empty head sha".into()));
        }
        if event.branch.is_empty() {
            return Err(AdmitError::IngressRejected("empty branch".into()));
        }
        if event.run_id == 0 {
            return Err(AdmitError::IngressRejected("run id is zero".into()));
        }
        Ok(())
    }
}
