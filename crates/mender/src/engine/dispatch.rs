//! Activity dispatcher: the uniform invocation surface between the driver
//! and the collaborators.
//!
//! Each phase invocation makes at most `max_attempts` network calls; every
//! attempt is journaled before the call and its result after, so a crash
//! between the two is detectable on recovery. Only errors classified as
//! retryable are retried, with exponential backoff and jitter.

use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

use crate::collaborators::Correlation;
use crate::config::EngineConfig;
use crate::error::{ActivityError, JournalError};
use crate::events::{CaseEvent, EventEmitter, EventType};
use crate::journal::{record, Journal};
use crate::redact::Redactor;
use crate::types::{ActivityOutcome, Case, EntryKind, Phase};

/// Invocation policy for one activity.
#[derive(Debug, Clone)]
pub struct ActivityPolicy {
    /// Activity name, for spans and events
    pub name: &'static str,
    /// Timeout of a single attempt
    pub timeout: Duration,
    /// Network attempts per phase invocation
    pub max_attempts: u32,
    /// Exponential-backoff base
    pub backoff_base: Duration,
    /// Exponential-backoff ceiling
    pub backoff_cap: Duration,
}

impl ActivityPolicy {
    /// Build the policy for `name` from engine configuration.
    #[must_use]
    pub fn from_config(name: &'static str, config: &EngineConfig) -> Self {
        Self {
            name,
            timeout: config.activity_timeout(),
            max_attempts: config.max_activity_attempts,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_cap: Duration::from_millis(config.backoff_cap_ms),
        }
    }
}

/// Delay before the attempt after `attempt` failed:
/// `min(cap, base * 2^attempt * (1 +/- 0.25))`.
#[must_use]
pub fn backoff_delay(policy: &ActivityPolicy, attempt: u32) -> Duration {
    let base_ms = policy.backoff_base.as_millis() as f64;
    let cap_ms = policy.backoff_cap.as_millis() as f64;
    let jitter = rand::rng().random_range(0.75..=1.25);
    let delay_ms = (base_ms * 2f64.powi(attempt.min(20) as i32) * jitter).min(cap_ms);
    Duration::from_millis(delay_ms as u64)
}

/// Why a dispatch did not return a collaborator result.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The collaborator failed terminally (or exhausted its retries)
    #[error(transparent)]
    Activity(#[from] ActivityError),

    /// A journal append failed; the case cannot advance
    #[error(transparent)]
    Journal(#[from] JournalError),
}

/// Uniform invocation surface used by the driver.
#[derive(Clone)]
pub struct Dispatcher {
    journal: Arc<dyn Journal>,
    emitter: EventEmitter,
    redactor: Arc<Redactor>,
}

impl Dispatcher {
    /// Create a dispatcher over the given journal and emitter.
    #[must_use]
    pub fn new(journal: Arc<dyn Journal>, emitter: EventEmitter, redactor: Arc<Redactor>) -> Self {
        Self {
            journal,
            emitter,
            redactor,
        }
    }

    /// Invoke one activity for `phase`, retrying per `policy`.
    ///
    /// `recovered_attempt` re-runs a specific attempt number exactly once
    /// (crash recovery: the collaborator deduplicates on the re-used
    /// correlation key). `to_outcome` converts a successful response into
    /// its journal payload.
    ///
    /// # Errors
    ///
    /// `DispatchError::Activity` once the error is terminal or the attempt
    /// budget is spent; `DispatchError::Journal` when an append fails.
    pub async fn invoke<T, F, Fut>(
        &self,
        case: &mut Case,
        phase: Phase,
        policy: &ActivityPolicy,
        cancel: &CancellationToken,
        recovered_attempt: Option<u32>,
        mut call: F,
        to_outcome: impl Fn(&T) -> ActivityOutcome,
    ) -> Result<T, DispatchError>
    where
        F: FnMut(Correlation) -> Fut,
        Fut: Future<Output = Result<T, ActivityError>>,
    {
        let budget = if recovered_attempt.is_some() {
            // At-most-once more after a crash, whatever the policy says.
            1
        } else {
            policy.max_attempts.max(1)
        };

        let mut tries = 0;
        loop {
            tries += 1;
            let attempt = recovered_attempt.unwrap_or_else(|| case.attempts.get(phase) + 1);

            record(
                self.journal.as_ref(),
                case,
                EntryKind::ActivityAttempt { phase, attempt },
            )
            .await?;
            self.emitter.emit(CaseEvent::for_activity(
                case,
                EventType::ActivityAttempt,
                phase,
                attempt,
                serde_json::json!({ "activity": policy.name }),
            ));

            let correlation = Correlation {
                case_id: case.id.clone(),
                phase,
                attempt,
            };
            let span = tracing::debug_span!(
                "activity",
                activity = policy.name,
                case_id = %case.id,
                attempt
            );

            let started = Instant::now();
            let outcome = tokio::select! {
                () = cancel.cancelled() => Err(ActivityError::Cancelled),
                result = tokio::time::timeout(policy.timeout, call(correlation).instrument(span)) => {
                    result.unwrap_or(Err(ActivityError::Timeout(policy.timeout)))
                }
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(value) => {
                    record(
                        self.journal.as_ref(),
                        case,
                        EntryKind::ActivityResult {
                            phase,
                            attempt,
                            duration_ms,
                            outcome: to_outcome(&value),
                        },
                    )
                    .await?;
                    self.emitter.emit(CaseEvent::for_activity(
                        case,
                        EventType::ActivityResult,
                        phase,
                        attempt,
                        serde_json::json!({ "activity": policy.name, "status": "ok" }),
                    ));
                    debug!(activity = policy.name, attempt, duration_ms, "activity succeeded");
                    return Ok(value);
                }
                Err(err) => {
                    let (message, _) = self.redactor.redact(&err.to_string());
                    record(
                        self.journal.as_ref(),
                        case,
                        EntryKind::ActivityResult {
                            phase,
                            attempt,
                            duration_ms,
                            outcome: ActivityOutcome::Errored {
                                kind: err.kind(),
                                message: message.clone(),
                            },
                        },
                    )
                    .await?;
                    self.emitter.emit(CaseEvent::for_activity(
                        case,
                        EventType::ActivityResult,
                        phase,
                        attempt,
                        serde_json::json!({
                            "activity": policy.name,
                            "status": "error",
                            "kind": err.kind(),
                        }),
                    ));

                    if err.is_retryable() && tries < budget && !cancel.is_cancelled() {
                        let delay = backoff_delay(policy, tries);
                        warn!(
                            activity = policy.name,
                            attempt,
                            error = %message,
                            delay_ms = delay.as_millis() as u64,
                            "retrying activity"
                        );
                        tokio::select! {
                            () = cancel.cancelled() => return Err(ActivityError::Cancelled.into()),
                            () = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }

                    return Err(err.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::InMemoryJournal;
    use crate::types::{CaseState, FailureEvent, JournalEntry, PatchRef};
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn case() -> Case {
        Case::new(
            FailureEvent {
                repository: "acme/app".into(),
                run_id: 42,
                head_sha: "abc123".into(),
                branch: "main".into(),
                actor: "dev".into(),
                installation_id: 7,
                workflow_name: "ci".into(),
                occurred_at: Utc::now(),
                received_at: Utc::now(),
            },
            chrono::Duration::minutes(20),
        )
    }

    async fn seeded(journal: &InMemoryJournal) -> Case {
        let mut case = case();
        let admission = JournalEntry {
            case_id: case.id.clone(),
            seq: 1,
            timestamp: Utc::now(),
            kind: EntryKind::StateTransition {
                from: None,
                to: CaseState::New,
                reason: None,
                event: Some(case.event.clone()),
            },
        };
        journal.append(admission.clone()).await.unwrap();
        case.apply(&admission).unwrap();
        case
    }

    fn policy() -> ActivityPolicy {
        ActivityPolicy {
            name: "patcher",
            timeout: Duration::from_secs(5),
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(4),
        }
    }

    fn dispatcher(journal: &InMemoryJournal) -> Dispatcher {
        Dispatcher::new(
            Arc::new(journal.clone()),
            EventEmitter::disabled(),
            Arc::new(Redactor::default()),
        )
    }

    #[tokio::test]
    async fn test_transient_errors_retry_until_success() {
        let journal = InMemoryJournal::new();
        let mut case = seeded(&journal).await;
        let dispatcher = dispatcher(&journal);
        let cancel = CancellationToken::new();

        let calls = AtomicU32::new(0);
        let result = dispatcher
            .invoke(
                &mut case,
                Phase::Patch,
                &policy(),
                &cancel,
                None,
                |_correlation| {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(ActivityError::Transient("503".into()))
                        } else {
                            Ok(PatchRef("p1".into()))
                        }
                    }
                },
                |patch_ref| ActivityOutcome::Patched {
                    patch_ref: patch_ref.clone(),
                    files_changed: vec![],
                },
            )
            .await
            .unwrap();

        assert_eq!(result, PatchRef("p1".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // three attempts journaled, with increasing attempt numbers
        assert_eq!(case.attempts.get(Phase::Patch), 3);
        // each attempt also journaled a result (2 errors + 1 success)
        assert_eq!(journal.len(&case.id).await, 1 + 6);
    }

    #[tokio::test]
    async fn test_terminal_error_does_not_retry() {
        let journal = InMemoryJournal::new();
        let mut case = seeded(&journal).await;
        let dispatcher = dispatcher(&journal);
        let cancel = CancellationToken::new();

        let calls = AtomicU32::new(0);
        let result: Result<PatchRef, _> = dispatcher
            .invoke(
                &mut case,
                Phase::Patch,
                &policy(),
                &cancel,
                None,
                |_correlation| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(ActivityError::InvalidInput("bad shape".into())) }
                },
                |_: &PatchRef| unreachable!("no success path"),
            )
            .await;

        assert!(matches!(
            result,
            Err(DispatchError::Activity(ActivityError::InvalidInput(_)))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_budget_exhaustion() {
        let journal = InMemoryJournal::new();
        let mut case = seeded(&journal).await;
        let dispatcher = dispatcher(&journal);
        let cancel = CancellationToken::new();

        let calls = AtomicU32::new(0);
        let result: Result<PatchRef, _> = dispatcher
            .invoke(
                &mut case,
                Phase::Patch,
                &policy(),
                &cancel,
                None,
                |_correlation| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(ActivityError::Transient("503".into())) }
                },
                |_: &PatchRef| unreachable!("no success path"),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_recovered_attempt_reuses_number_and_runs_once() {
        let journal = InMemoryJournal::new();
        let mut case = seeded(&journal).await;
        let dispatcher = dispatcher(&journal);
        let cancel = CancellationToken::new();

        let seen = std::sync::Mutex::new(Vec::new());
        let result: Result<PatchRef, _> = dispatcher
            .invoke(
                &mut case,
                Phase::Patch,
                &policy(),
                &cancel,
                Some(2),
                |correlation| {
                    seen.lock().unwrap().push(correlation.attempt);
                    async { Err(ActivityError::Transient("still down".into())) }
                },
                |_: &PatchRef| unreachable!("no success path"),
            )
            .await;

        // single call, with the crashed attempt's number
        assert!(result.is_err());
        assert_eq!(*seen.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_cancellation_wins_over_call() {
        let journal = InMemoryJournal::new();
        let mut case = seeded(&journal).await;
        let dispatcher = dispatcher(&journal);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<PatchRef, _> = dispatcher
            .invoke(
                &mut case,
                Phase::Patch,
                &policy(),
                &cancel,
                None,
                |_correlation| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(PatchRef("never".into()))
                },
                |patch_ref| ActivityOutcome::Patched {
                    patch_ref: patch_ref.clone(),
                    files_changed: vec![],
                },
            )
            .await;

        assert!(matches!(
            result,
            Err(DispatchError::Activity(ActivityError::Cancelled))
        ));
    }

    #[tokio::test]
    async fn test_error_messages_redacted_before_journaling() {
        let journal = InMemoryJournal::new();
        let mut case = seeded(&journal).await;
        let dispatcher = dispatcher(&journal);
        let cancel = CancellationToken::new();

        let _: Result<PatchRef, _> = dispatcher
            .invoke(
                &mut case,
                Phase::Patch,
                &policy(),
                &cancel,
                None,
                |_correlation| async {
                    Err(ActivityError::Internal(
                        "request failed: FORGE_TOKEN=abcd1234".into(),
                    ))
                },
                |_: &PatchRef| unreachable!("no success path"),
            )
            .await;

        let entries = journal.read_all(&case.id).await.unwrap();
        let serialized = serde_json::to_string(&entries).unwrap();
        assert!(!serialized.contains("abcd1234"));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = ActivityPolicy {
            name: "x",
            timeout: Duration::from_secs(1),
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
        };
        for attempt in 0..64 {
            assert!(backoff_delay(&policy, attempt) <= Duration::from_secs(60));
        }
    }
}
