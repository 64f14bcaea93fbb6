//! Durable per-case journal.
//!
//! The journal is the source of truth: the in-memory [`Case`] is a
//! projection rebuilt by replay. Appends within one case are strictly
//! ordered; different cases are independent partitions. Any durable store
//! with ordered per-key appends can implement [`Journal`]; the in-memory
//! implementation here backs the engine's tests and single-process use.

use async_trait::async_trait;
use chrono::Duration;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::JournalError;
use crate::types::{Case, CaseId, EntryKind, JournalEntry, Phase};

/// Append-only per-case event log.
#[async_trait]
pub trait Journal: Send + Sync {
    /// Append one entry. `entry.seq` must be exactly one past the last
    /// appended sequence for its case (1 for the first entry).
    async fn append(&self, entry: JournalEntry) -> Result<(), JournalError>;

    /// Read every retained entry for a case, in sequence order.
    async fn read_all(&self, case_id: &CaseId) -> Result<Vec<JournalEntry>, JournalError>;

    /// Store a projection snapshot as replay acceleration.
    async fn snapshot(&self, case_id: &CaseId, case: &Case) -> Result<(), JournalError>;

    /// Load the latest snapshot, if one was stored.
    async fn load_snapshot(&self, case_id: &CaseId) -> Result<Option<Case>, JournalError> {
        let _ = case_id;
        Ok(None)
    }

    /// Drop entries already covered by the latest snapshot.
    async fn compact(&self, case_id: &CaseId) -> Result<(), JournalError>;
}

/// A recovered projection plus any activity that was in flight at crash
/// time (an `ActivityAttempt` with no matching `ActivityResult`).
#[derive(Debug, Clone)]
pub struct Recovered {
    /// The rebuilt projection
    pub case: Case,
    /// The attempt that never produced a result, if any
    pub in_flight: Option<InFlightActivity>,
}

/// An activity attempt whose result never reached the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlightActivity {
    pub phase: Phase,
    pub attempt: u32,
}

/// Rebuild a case from its journal (snapshot-accelerated when available)
/// and detect an in-flight activity.
pub async fn recover(
    journal: &dyn Journal,
    case_id: &CaseId,
    global_deadline: Duration,
) -> Result<Recovered, JournalError> {
    let entries = journal.read_all(case_id).await?;

    let mut case = match journal.load_snapshot(case_id).await? {
        Some(snap) => snap,
        None => {
            if entries.is_empty() {
                return Err(JournalError::NotFound(case_id.clone()));
            }
            Case::new(
                match &entries[0].kind {
                    EntryKind::StateTransition {
                        from: None,
                        event: Some(event),
                        ..
                    } => event.clone(),
                    _ => {
                        return Err(JournalError::Corrupt {
                            case_id: case_id.clone(),
                            reason: "journal does not start with an admission entry".to_string(),
                        })
                    }
                },
                global_deadline,
            )
        }
    };

    let mut in_flight = None;
    for entry in &entries {
        if entry.seq <= case.seq {
            continue;
        }
        case.apply(entry)?;
        match &entry.kind {
            EntryKind::ActivityAttempt { phase, attempt } => {
                in_flight = Some(InFlightActivity {
                    phase: *phase,
                    attempt: *attempt,
                });
            }
            EntryKind::ActivityResult { .. } => in_flight = None,
            _ => {}
        }
    }

    debug!(case_id = %case_id, state = ?case.state, in_flight = ?in_flight, "recovered case");
    Ok(Recovered { case, in_flight })
}

/// Append `kind` as the next entry of `case` and fold it into the
/// projection. The single write path used by the admitter, the dispatcher,
/// and the driver: the projection can only advance after the append has
/// durably completed.
pub async fn record(
    journal: &dyn Journal,
    case: &mut Case,
    kind: EntryKind,
) -> Result<(), JournalError> {
    let entry = JournalEntry {
        case_id: case.id.clone(),
        seq: case.seq + 1,
        timestamp: chrono::Utc::now(),
        kind,
    };
    journal.append(entry.clone()).await?;
    case.apply(&entry)
}

/// Per-case log held by the in-memory journal.
#[derive(Debug, Default)]
struct CaseLog {
    entries: Vec<JournalEntry>,
    last_seq: u64,
    snapshot: Option<Case>,
}

/// In-memory [`Journal`]. Appends within a case are serialized by the map
/// lock; sequence discipline is enforced on every append.
#[derive(Debug, Default, Clone)]
pub struct InMemoryJournal {
    logs: Arc<Mutex<HashMap<CaseId, CaseLog>>>,
}

impl InMemoryJournal {
    /// Create an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of retained entries for a case (test helper).
    pub async fn len(&self, case_id: &CaseId) -> usize {
        self.logs
            .lock()
            .await
            .get(case_id)
            .map_or(0, |log| log.entries.len())
    }

    /// Whether any entries are retained for a case.
    pub async fn is_empty(&self, case_id: &CaseId) -> bool {
        self.len(case_id).await == 0
    }
}

#[async_trait]
impl Journal for InMemoryJournal {
    async fn append(&self, entry: JournalEntry) -> Result<(), JournalError> {
        let mut logs = self.logs.lock().await;
        let log = logs.entry(entry.case_id.clone()).or_default();

        let expected = log.last_seq + 1;
        if entry.seq != expected {
            return Err(JournalError::SequenceGap {
                case_id: entry.case_id.clone(),
                expected,
                got: entry.seq,
            });
        }

        log.last_seq = entry.seq;
        log.entries.push(entry);
        Ok(())
    }

    async fn read_all(&self, case_id: &CaseId) -> Result<Vec<JournalEntry>, JournalError> {
        let logs = self.logs.lock().await;
        Ok(logs
            .get(case_id)
            .map(|log| log.entries.clone())
            .unwrap_or_default())
    }

    async fn snapshot(&self, case_id: &CaseId, case: &Case) -> Result<(), JournalError> {
        let mut logs = self.logs.lock().await;
        let log = logs
            .get_mut(case_id)
            .ok_or_else(|| JournalError::NotFound(case_id.clone()))?;
        log.snapshot = Some(case.clone());
        Ok(())
    }

    async fn load_snapshot(&self, case_id: &CaseId) -> Result<Option<Case>, JournalError> {
        let logs = self.logs.lock().await;
        Ok(logs.get(case_id).and_then(|log| log.snapshot.clone()))
    }

    async fn compact(&self, case_id: &CaseId) -> Result<(), JournalError> {
        let mut logs = self.logs.lock().await;
        let log = logs
            .get_mut(case_id)
            .ok_or_else(|| JournalError::NotFound(case_id.clone()))?;
        if let Some(snap) = &log.snapshot {
            let covered = snap.seq;
            log.entries.retain(|e| e.seq > covered);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActivityOutcome, CaseState, Diagnosis, FailureEvent, RootCause};
    use chrono::Utc;

    fn event() -> FailureEvent {
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
        }
    }

    fn admission_entry(case: &Case) -> JournalEntry {
        JournalEntry {
            case_id: case.id.clone(),
            seq: 1,
            timestamp: Utc::now(),
            kind: EntryKind::StateTransition {
                from: None,
                to: CaseState::New,
                reason: None,
                event: Some(case.event.clone()),
            },
        }
    }

    #[tokio::test]
    async fn test_append_enforces_sequence() {
        let journal = InMemoryJournal::new();
        let case = Case::new(event(), Duration::minutes(20));

        journal.append(admission_entry(&case)).await.unwrap();

        // gap
        let gap = JournalEntry {
            case_id: case.id.clone(),
            seq: 3,
            timestamp: Utc::now(),
            kind: EntryKind::ActivityAttempt {
                phase: Phase::Diagnose,
                attempt: 1,
            },
        };
        assert!(matches!(
            journal.append(gap).await,
            Err(JournalError::SequenceGap { expected: 2, .. })
        ));

        // duplicate seq
        let dup = admission_entry(&case);
        assert!(journal.append(dup).await.is_err());
    }

    #[tokio::test]
    async fn test_recover_detects_in_flight_attempt() {
        let journal = InMemoryJournal::new();
        let case = Case::new(event(), Duration::minutes(20));

        journal.append(admission_entry(&case)).await.unwrap();
        journal
            .append(JournalEntry {
                case_id: case.id.clone(),
                seq: 2,
                timestamp: Utc::now(),
                kind: EntryKind::StateTransition {
                    from: Some(CaseState::New),
                    to: CaseState::Diagnose,
                    reason: None,
                    event: None,
                },
            })
            .await
            .unwrap();
        journal
            .append(JournalEntry {
                case_id: case.id.clone(),
                seq: 3,
                timestamp: Utc::now(),
                kind: EntryKind::ActivityAttempt {
                    phase: Phase::Diagnose,
                    attempt: 1,
                },
            })
            .await
            .unwrap();

        let recovered = recover(&journal, &case.id, Duration::minutes(20))
            .await
            .unwrap();
        assert_eq!(recovered.case.state, CaseState::Diagnose);
        assert_eq!(
            recovered.in_flight,
            Some(InFlightActivity {
                phase: Phase::Diagnose,
                attempt: 1,
            })
        );
    }

    #[tokio::test]
    async fn test_recover_after_result_sees_no_in_flight() {
        let journal = InMemoryJournal::new();
        let case = Case::new(event(), Duration::minutes(20));

        journal.append(admission_entry(&case)).await.unwrap();
        journal
            .append(JournalEntry {
                case_id: case.id.clone(),
                seq: 2,
                timestamp: Utc::now(),
                kind: EntryKind::StateTransition {
                    from: Some(CaseState::New),
                    to: CaseState::Diagnose,
                    reason: None,
                    event: None,
                },
            })
            .await
            .unwrap();
        journal
            .append(JournalEntry {
                case_id: case.id.clone(),
                seq: 3,
                timestamp: Utc::now(),
                kind: EntryKind::ActivityAttempt {
                    phase: Phase::Diagnose,
                    attempt: 1,
                },
            })
            .await
            .unwrap();
        journal
            .append(JournalEntry {
                case_id: case.id.clone(),
                seq: 4,
                timestamp: Utc::now(),
                kind: EntryKind::ActivityResult {
                    phase: Phase::Diagnose,
                    attempt: 1,
                    duration_ms: 450,
                    outcome: ActivityOutcome::Diagnosed(Diagnosis {
                        root_cause: RootCause::ConfigError,
                        confidence: 0.9,
                        patch: None,
                        explanation: "bad env var".into(),
                        suggested_actions: vec![],
                        estimated_fix_minutes: None,
                    }),
                },
            })
            .await
            .unwrap();

        let recovered = recover(&journal, &case.id, Duration::minutes(20))
            .await
            .unwrap();
        assert!(recovered.in_flight.is_none());
        assert_eq!(recovered.case.root_cause, Some(RootCause::ConfigError));
    }

    #[tokio::test]
    async fn test_snapshot_and_compact_preserve_recovery() {
        let journal = InMemoryJournal::new();
        let mut case = Case::new(event(), Duration::minutes(20));

        let e1 = admission_entry(&case);
        journal.append(e1.clone()).await.unwrap();
        case.apply(&e1).unwrap();

        let e2 = JournalEntry {
            case_id: case.id.clone(),
            seq: 2,
            timestamp: Utc::now(),
            kind: EntryKind::StateTransition {
                from: Some(CaseState::New),
                to: CaseState::Diagnose,
                reason: None,
                event: None,
            },
        };
        journal.append(e2.clone()).await.unwrap();
        case.apply(&e2).unwrap();

        journal.snapshot(&case.id, &case).await.unwrap();
        journal.compact(&case.id).await.unwrap();
        assert_eq!(journal.len(&case.id).await, 0);

        let recovered = recover(&journal, &case.id, Duration::minutes(20))
            .await
            .unwrap();
        assert_eq!(recovered.case, case);
    }

    #[tokio::test]
    async fn test_recover_unknown_case() {
        let journal = InMemoryJournal::new();
        let id = CaseId::for_parts("acme/app", 1, "feed");
        assert!(matches!(
            recover(&journal, &id, Duration::minutes(20)).await,
            Err(JournalError::NotFound(_))
        ));
    }
}
