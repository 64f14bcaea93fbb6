//! Core types for the self-healing workflow engine.
//!
//! This module defines the primary data structures for:
//! - Representing CI failure events from the ingress side
//! - The `Case`: one self-healing attempt driven through the state machine
//! - The append-only journal entries the case projection is rebuilt from
//! - Collaborator result shapes (diagnosis, patch, test, proof, merge)

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

use crate::error::ErrorKind;

/// A normalized CI failure event received from webhook ingestion.
///
/// Immutable once constructed; everything the engine later needs about the
/// triggering run is captured here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEvent {
    /// Repository full name (e.g., "acme/app")
    pub repository: String,
    /// Workflow run ID
    pub run_id: u64,
    /// Commit SHA at the head of the failing run
    pub head_sha: String,
    /// Branch where the failure occurred
    pub branch: String,
    /// Actor whose push triggered the run
    pub actor: String,
    /// Source-forge app installation the event arrived through
    pub installation_id: u64,
    /// Workflow name (drives the eligible-workflow filter)
    pub workflow_name: String,
    /// When the failing run concluded on the forge
    pub occurred_at: DateTime<Utc>,
    /// When the engine received the event
    pub received_at: DateTime<Utc>,
}

/// Stable case identifier: hex digest of `(repository, run_id, head_sha)`.
///
/// The same failing run always maps to the same id, across restarts and
/// across processes, which is what makes deduplication and journal recovery
/// line up.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaseId(String);

impl CaseId {
    /// Compute the id for a failure event.
    #[must_use]
    pub fn for_event(event: &FailureEvent) -> Self {
        Self::for_parts(&event.repository, event.run_id, &event.head_sha)
    }

    /// Compute the id from the raw triple.
    #[must_use]
    pub fn for_parts(repository: &str, run_id: u64, head_sha: &str) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(repository.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(run_id.to_string().as_bytes());
        hasher.update(b"\x1f");
        hasher.update(head_sha.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// The id as a hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Phases that invoke a collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Diagnose,
    Patch,
    Test,
    Prove,
    Merge,
}

impl Phase {
    /// Short name for logging and correlation keys.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Diagnose => "diagnose",
            Self::Patch => "patch",
            Self::Test => "test",
            Self::Prove => "prove",
            Self::Merge => "merge",
        }
    }
}

/// States of the case state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseState {
    New,
    Diagnose,
    Patch,
    Test,
    Prove,
    Merge,
    Done,
    Failed,
}

impl CaseState {
    /// Whether this state is absorbing.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether `next` is a legal successor under the declared transition
    /// graph, including the two feedback edges and the failure edge.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == Self::Failed {
            return true;
        }
        matches!(
            (self, next),
            (Self::New, Self::Diagnose)
                | (Self::Diagnose, Self::Patch | Self::Test)
                | (Self::Patch, Self::Test | Self::Diagnose)
                | (Self::Test, Self::Prove | Self::Diagnose)
                | (Self::Prove, Self::Merge)
                | (Self::Merge, Self::Done)
        )
    }

    /// The phase driven while in this state, if any.
    #[must_use]
    pub const fn phase(self) -> Option<Phase> {
        match self {
            Self::Diagnose => Some(Phase::Diagnose),
            Self::Patch => Some(Phase::Patch),
            Self::Test => Some(Phase::Test),
            Self::Prove => Some(Phase::Prove),
            Self::Merge => Some(Phase::Merge),
            Self::New | Self::Done | Self::Failed => None,
        }
    }
}

/// Categorical diagnosis of the failure's root cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RootCause {
    DepUpgrade,
    ApiChange,
    FlakyTest,
    ConfigError,
    EnvIssue,
    PermissionError,
    Timeout,
    Unknown,
}

impl RootCause {
    /// Short name for logging/labels.
    #[must_use]
    pub const fn short_name(self) -> &'static str {
        match self {
            Self::DepUpgrade => "dep-upgrade",
            Self::ApiChange => "api-change",
            Self::FlakyTest => "flaky-test",
            Self::ConfigError => "config-error",
            Self::EnvIssue => "env-issue",
            Self::PermissionError => "permission",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }
}

/// Reason a case ended in `FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailReason {
    /// Patch attempts exhausted without a compilable result
    PatchExhausted,
    /// Test retries exhausted without a passing run
    TestFailed,
    /// A required invariant could not be proven
    ProofFailed,
    /// Merge conflict or policy denial
    MergeBlocked,
    /// Case-level deadline elapsed
    Timeout,
    /// Worker cancelled mid-flight
    Cancelled,
    /// A collaborator rejected our request shape
    Contract,
    /// Unexpected engine error
    Internal,
}

/// Result of a diagnoser call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    /// Chosen root cause (already downgraded to `UNKNOWN` when confidence
    /// fell below the configured threshold)
    pub root_cause: RootCause,
    /// Diagnoser confidence in `[0,1]`
    pub confidence: f64,
    /// Unified diff to apply, if the diagnoser produced one
    pub patch: Option<String>,
    /// Human-readable explanation
    pub explanation: String,
    /// Suggested follow-up actions
    #[serde(default)]
    pub suggested_actions: Vec<String>,
    /// Diagnoser's fix-time estimate
    pub estimated_fix_minutes: Option<u32>,
}

/// Opaque handle to an applied change set, issued by the patcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatchRef(pub String);

impl fmt::Display for PatchRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Verdict of a sandboxed test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestVerdict {
    Pass,
    Fail,
    Flaky,
}

/// One repetition inside a test-runner invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryOutcome {
    /// Repetition number (1-indexed)
    pub attempt: u32,
    /// Whether this repetition passed
    pub success: bool,
    /// Wall-clock duration of the repetition
    pub duration_ms: u64,
    /// Error summary for a failed repetition
    pub error: Option<String>,
}

/// Result of a test-runner call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    /// Aggregate verdict across the runner's repetitions
    pub verdict: TestVerdict,
    /// Disagreement across repetitions: `0` deterministic, `1` maximally flaky
    pub flakiness_score: f64,
    /// Per-repetition outcomes
    #[serde(default)]
    pub retry_outcomes: Vec<RetryOutcome>,
    /// Failure trace, when available
    pub trace: Option<String>,
}

/// Per-invariant severity. Only invariants at or above the configured
/// threshold block a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Criticality {
    Low,
    Medium,
    High,
    Critical,
}

/// A declaratively stated property over the changed surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvariantSpec {
    /// Theorem name, unique within the catalog
    pub name: String,
    /// The predicate handed to the prover
    pub predicate: String,
    /// Severity of a violation
    pub criticality: Criticality,
    /// Path prefix the invariant applies to; empty means always applicable
    pub scope: String,
}

impl InvariantSpec {
    /// Whether this invariant applies to any of the changed files.
    #[must_use]
    pub fn applies_to(&self, changed_files: &[String]) -> bool {
        self.scope.is_empty() || changed_files.iter().any(|f| f.starts_with(&self.scope))
    }
}

/// Per-theorem prover verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TheoremVerdict {
    Proven,
    Unproven,
    Sorry,
    Error,
}

/// Result for a single theorem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TheoremResult {
    /// Theorem name, matching the submitted invariant
    pub name: String,
    /// Prover verdict
    pub verdict: TheoremVerdict,
    /// CPU time spent on this theorem
    pub duration_ms: u64,
    /// Prover error text, if the verdict is `error`
    pub error: Option<String>,
}

/// Tally across all theorems of one prover call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofSummary {
    pub total: u32,
    pub proven: u32,
    pub unproven: u32,
    pub sorry: u32,
    pub error: u32,
}

/// Result of a prover call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofOutcome {
    /// Per-theorem verdicts
    pub theorems: Vec<TheoremResult>,
    /// Aggregate tally
    pub summary: ProofSummary,
}

impl ProofOutcome {
    /// Build an outcome from per-theorem results, computing the tally.
    #[must_use]
    pub fn from_theorems(theorems: Vec<TheoremResult>) -> Self {
        let mut summary = ProofSummary {
            total: theorems.len() as u32,
            ..ProofSummary::default()
        };
        for t in &theorems {
            match t.verdict {
                TheoremVerdict::Proven => summary.proven += 1,
                TheoremVerdict::Unproven => summary.unproven += 1,
                TheoremVerdict::Sorry => summary.sorry += 1,
                TheoremVerdict::Error => summary.error += 1,
            }
        }
        Self { theorems, summary }
    }

    /// The required invariants (criticality at or above `threshold`) that
    /// did not come back `proven` within the per-theorem budget.
    ///
    /// `sorry` counts as unproven; invariants below the threshold never
    /// block, whatever their verdict.
    #[must_use]
    pub fn blocking_failures<'a>(
        &'a self,
        invariants: &'a [InvariantSpec],
        threshold: Criticality,
        budget_ms: u64,
    ) -> Vec<&'a InvariantSpec> {
        invariants
            .iter()
            .filter(|inv| inv.criticality >= threshold)
            .filter(|inv| {
                !self.theorems.iter().any(|t| {
                    t.name == inv.name
                        && t.verdict == TheoremVerdict::Proven
                        && t.duration_ms <= budget_ms
                })
            })
            .collect()
    }
}

/// Receipt returned by the merger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReceipt {
    /// Whether the patch branch was merged
    pub merged: bool,
    /// Merge commit SHA, when merged
    pub merge_sha: Option<String>,
    /// Pull request number, when one was opened
    pub pr_number: Option<u64>,
    /// Why the merge was blocked, when it was
    pub reason: Option<String>,
}

/// Context from an earlier round, fed back into the next diagnosis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviousAttempt {
    /// Which round produced this feedback (per-phase attempt number)
    pub attempt: u32,
    /// Compiler errors or test failure summary from that round
    pub error: String,
    /// Wall-clock duration of that round's activity call
    pub duration_ms: u64,
}

/// Per-phase counters of journaled activity attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseCounters {
    pub diagnose: u32,
    pub patch: u32,
    pub test: u32,
    pub prove: u32,
    pub merge: u32,
}

impl PhaseCounters {
    /// Get the counter for a phase.
    #[must_use]
    pub const fn get(&self, phase: Phase) -> u32 {
        match phase {
            Phase::Diagnose => self.diagnose,
            Phase::Patch => self.patch,
            Phase::Test => self.test,
            Phase::Prove => self.prove,
            Phase::Merge => self.merge,
        }
    }

    /// Increment the counter for a phase.
    pub fn bump(&mut self, phase: Phase) {
        match phase {
            Phase::Diagnose => self.diagnose += 1,
            Phase::Patch => self.patch += 1,
            Phase::Test => self.test += 1,
            Phase::Prove => self.prove += 1,
            Phase::Merge => self.merge += 1,
        }
    }
}

/// Typed payload of a journaled `ActivityResult`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActivityOutcome {
    /// Diagnoser produced a (possibly downgraded) diagnosis
    Diagnosed(Diagnosis),
    /// Patcher applied the diff
    Patched {
        patch_ref: PatchRef,
        files_changed: Vec<String>,
    },
    /// Patcher rejected the diff with compiler errors
    PatchRejected { compilation_errors: Vec<String> },
    /// Test runner finished
    Tested(TestOutcome),
    /// Prover finished
    Proved(ProofOutcome),
    /// Merger finished (merged or blocked)
    Merged(MergeReceipt),
    /// The call failed with a classified, already-redacted error
    Errored { kind: ErrorKind, message: String },
}

/// Kinds of journal entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryKind {
    /// The case moved between states. The admission entry carries the
    /// triggering event and has `from: None`.
    StateTransition {
        from: Option<CaseState>,
        to: CaseState,
        reason: Option<FailReason>,
        #[serde(skip_serializing_if = "Option::is_none")]
        event: Option<FailureEvent>,
    },
    /// A collaborator call is about to start
    ActivityAttempt { phase: Phase, attempt: u32 },
    /// A collaborator call finished
    ActivityResult {
        phase: Phase,
        attempt: u32,
        duration_ms: u64,
        #[serde(flatten)]
        outcome: ActivityOutcome,
    },
    /// A lifecycle event was handed to the emitter
    Emitted { event_type: String },
    /// An engine-side error worth auditing
    Error { error_kind: ErrorKind, message: String },
}

/// One append-only journal record. The journal is the source of truth; the
/// in-memory [`Case`] is a projection of these entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Case this entry belongs to
    pub case_id: CaseId,
    /// Per-case sequence number, strictly increasing from 1
    pub seq: u64,
    /// When the entry was appended
    pub timestamp: DateTime<Utc>,
    /// What happened
    #[serde(flatten)]
    pub kind: EntryKind,
}

/// One self-healing attempt, keyed by `(repository, run_id, head_sha)`.
///
/// Mutated only by the single worker holding its lease; rebuilt from the
/// journal on recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    /// Stable identity
    pub id: CaseId,
    /// The triggering event
    pub event: FailureEvent,
    /// Current state
    pub state: CaseState,
    /// Root cause, once diagnosed
    pub root_cause: Option<RootCause>,
    /// Journaled activity attempts per phase
    pub attempts: PhaseCounters,
    /// Completed patcher rounds (applied or rejected); bounds the
    /// `PATCH -> DIAGNOSE` feedback edge
    pub patch_rounds: u32,
    /// Failed test rounds; bounds the `TEST -> DIAGNOSE` feedback edge
    pub test_failures: u32,
    /// Last accepted diagnosis
    pub diagnosis: Option<Diagnosis>,
    /// Handle to the applied change set
    pub patch_ref: Option<PatchRef>,
    /// Last test outcome
    pub test_outcome: Option<TestOutcome>,
    /// Whether any test round came back flaky
    pub flaky: bool,
    /// Last proof outcome
    pub proof_outcome: Option<ProofOutcome>,
    /// Merge receipt, once merged
    pub merge_receipt: Option<MergeReceipt>,
    /// Why the case failed, when it did
    pub failure_reason: Option<FailReason>,
    /// Accumulated feedback for re-diagnosis (compiler errors, test traces)
    pub feedback: Vec<PreviousAttempt>,
    /// Sequence number of the last applied journal entry
    pub seq: u64,
    /// When the case was admitted
    pub started_at: DateTime<Utc>,
    /// When the last transition was applied
    pub last_transition_at: DateTime<Utc>,
    /// Wall-clock budget; elapsing forces `FAILED(TIMEOUT)`
    pub deadline: DateTime<Utc>,
}

impl Case {
    /// Create a fresh case in `NEW` from an admitted event.
    #[must_use]
    pub fn new(event: FailureEvent, global_deadline: Duration) -> Self {
        let id = CaseId::for_event(&event);
        let started_at = event.received_at;
        Self {
            id,
            state: CaseState::New,
            root_cause: None,
            attempts: PhaseCounters::default(),
            patch_rounds: 0,
            test_failures: 0,
            diagnosis: None,
            patch_ref: None,
            test_outcome: None,
            flaky: false,
            proof_outcome: None,
            merge_receipt: None,
            failure_reason: None,
            feedback: Vec::new(),
            seq: 0,
            started_at,
            last_transition_at: started_at,
            deadline: started_at + global_deadline,
            event,
        }
    }

    /// Whether the case has reached an absorbing state.
    #[must_use]
    pub const fn is_sealed(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether the wall-clock budget has elapsed.
    #[must_use]
    pub fn deadline_elapsed(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline
    }

    /// Fold a journal entry into the projection.
    ///
    /// Used both on the live path (the driver applies every entry it
    /// appends) and during replay, so the two can never diverge.
    pub fn apply(&mut self, entry: &JournalEntry) -> Result<(), crate::error::JournalError> {
        use crate::error::JournalError;

        if entry.seq != self.seq + 1 {
            return Err(JournalError::SequenceGap {
                case_id: self.id.clone(),
                expected: self.seq + 1,
                got: entry.seq,
            });
        }
        self.seq = entry.seq;

        match &entry.kind {
            EntryKind::StateTransition {
                from, to, reason, ..
            } => {
                if let Some(from) = from {
                    if *from != self.state {
                        return Err(JournalError::Corrupt {
                            case_id: self.id.clone(),
                            reason: format!(
                                "transition from {from:?} but projection is in {:?}",
                                self.state
                            ),
                        });
                    }
                    if !from.can_transition_to(*to) {
                        return Err(JournalError::IllegalTransition {
                            case_id: self.id.clone(),
                            from: *from,
                            to: *to,
                        });
                    }
                }
                self.state = *to;
                self.last_transition_at = entry.timestamp;
                if *to == CaseState::Failed {
                    self.failure_reason = *reason;
                }
            }
            EntryKind::ActivityAttempt { phase, .. } => {
                self.attempts.bump(*phase);
            }
            EntryKind::ActivityResult {
                attempt,
                duration_ms,
                outcome,
                ..
            } => match outcome {
                ActivityOutcome::Diagnosed(d) => {
                    self.root_cause = Some(d.root_cause);
                    self.diagnosis = Some(d.clone());
                }
                ActivityOutcome::Patched { patch_ref, .. } => {
                    self.patch_rounds += 1;
                    self.patch_ref = Some(patch_ref.clone());
                }
                ActivityOutcome::PatchRejected { compilation_errors } => {
                    self.patch_rounds += 1;
                    self.feedback.push(PreviousAttempt {
                        attempt: *attempt,
                        error: compilation_errors.join("; "),
                        duration_ms: *duration_ms,
                    });
                }
                ActivityOutcome::Tested(t) => {
                    if t.verdict == TestVerdict::Flaky {
                        self.flaky = true;
                    }
                    if t.verdict == TestVerdict::Fail {
                        self.test_failures += 1;
                        self.feedback.push(PreviousAttempt {
                            attempt: *attempt,
                            error: t
                                .trace
                                .clone()
                                .unwrap_or_else(|| "tests failed without trace".to_string()),
                            duration_ms: *duration_ms,
                        });
                    }
                    self.test_outcome = Some(t.clone());
                }
                ActivityOutcome::Proved(p) => {
                    self.proof_outcome = Some(p.clone());
                }
                ActivityOutcome::Merged(m) => {
                    self.merge_receipt = Some(m.clone());
                }
                ActivityOutcome::Errored { .. } => {}
            },
            EntryKind::Emitted { .. } | EntryKind::Error { .. } => {}
        }

        Ok(())
    }

    /// Rebuild a case from its full journal.
    ///
    /// The first entry must be the admission transition (`from: None`,
    /// `to: NEW`) carrying the triggering event.
    pub fn replay(
        entries: &[JournalEntry],
        global_deadline: Duration,
    ) -> Result<Self, crate::error::JournalError> {
        use crate::error::JournalError;

        let first = entries.first().ok_or_else(|| JournalError::Corrupt {
            case_id: CaseId(String::from("?")),
            reason: "empty journal".to_string(),
        })?;

        let EntryKind::StateTransition {
            from: None,
            to: CaseState::New,
            event: Some(event),
            ..
        } = &first.kind
        else {
            return Err(JournalError::Corrupt {
                case_id: first.case_id.clone(),
                reason: "journal does not start with an admission entry".to_string(),
            });
        };

        let mut case = Self::new(event.clone(), global_deadline);
        for entry in entries {
            case.apply(entry)?;
        }
        Ok(case)
    }

    /// Summary of the last diagnosis for terminal events and PR comments.
    #[must_use]
    pub fn diagnosis_summary(&self) -> Option<String> {
        self.diagnosis.as_ref().map(|d| {
            format!(
                "{} (confidence {:.2}): {}",
                d.root_cause.short_name(),
                d.confidence,
                d.explanation
            )
        })
    }
}
