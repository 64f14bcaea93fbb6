//! Per-case state-machine driver.
//!
//! Advances one case through
//! `NEW -> DIAGNOSE -> PATCH -> TEST -> PROVE -> MERGE -> DONE|FAILED`,
//! including the two feedback edges (`PATCH -> DIAGNOSE` on compiler
//! errors, `TEST -> DIAGNOSE` on test failures) and the failure edge from
//! every non-terminal state. The journal is written before the projection
//! advances; on recovery the driver picks up from whatever the journal
//! proves happened.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collaborators::{
    Collaborators, DiagnoseRequest, ForgeReader, MergeRequest, PatchCallOutcome, PatchRequest,
    ProveRequest, TestRequest,
};
use crate::config::EngineConfig;
use crate::engine::dispatch::{ActivityPolicy, DispatchError, Dispatcher};
use crate::error::{ActivityError, EngineError, ErrorKind, JournalError};
use crate::events::{CaseEvent, EventEmitter, EventType};
use crate::journal::{recover, record, InFlightActivity, Journal};
use crate::redact::Redactor;
use crate::report::ReportAssembler;
use crate::types::{
    ActivityOutcome, Case, CaseId, CaseState, EntryKind, FailReason, InvariantSpec, PatchRef,
    Phase, RootCause, TestVerdict,
};

/// Per-activity policies, derived once from configuration.
#[derive(Debug, Clone)]
struct Policies {
    diagnose: ActivityPolicy,
    patch: ActivityPolicy,
    test: ActivityPolicy,
    prove: ActivityPolicy,
    merge: ActivityPolicy,
}

impl Policies {
    fn from_config(config: &EngineConfig) -> Self {
        Self {
            diagnose: ActivityPolicy::from_config("diagnoser", config),
            patch: ActivityPolicy::from_config("patcher", config),
            test: ActivityPolicy::from_config("test-runner", config),
            prove: ActivityPolicy::from_config("prover", config),
            merge: ActivityPolicy::from_config("merger", config),
        }
    }
}

/// How a single state handler ended.
enum DriveError {
    /// The phase's activity failed terminally; the case fails with a
    /// reason derived from the error kind
    Activity(ActivityError),
    /// Journal or engine fault; the run aborts and the lease is released
    Fatal(EngineError),
}

impl From<DispatchError> for DriveError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Activity(a) => Self::Activity(a),
            DispatchError::Journal(j) => Self::Fatal(j.into()),
        }
    }
}

impl From<JournalError> for DriveError {
    fn from(e: JournalError) -> Self {
        Self::Fatal(e.into())
    }
}

impl From<EngineError> for DriveError {
    fn from(e: EngineError) -> Self {
        Self::Fatal(e)
    }
}

type StepResult = Result<(), DriveError>;

/// Drives cases through the state machine.
pub struct CaseDriver {
    config: Arc<EngineConfig>,
    collaborators: Collaborators,
    forge: Arc<dyn ForgeReader>,
    journal: Arc<dyn Journal>,
    emitter: EventEmitter,
    dispatcher: Dispatcher,
    assembler: ReportAssembler,
    invariants: Vec<InvariantSpec>,
    policies: Policies,
}

impl CaseDriver {
    /// Wire up a driver.
    ///
    /// # Errors
    ///
    /// Fails when a configured redaction pattern does not compile.
    pub fn new(
        config: Arc<EngineConfig>,
        collaborators: Collaborators,
        forge: Arc<dyn ForgeReader>,
        journal: Arc<dyn Journal>,
        emitter: EventEmitter,
        invariants: Vec<InvariantSpec>,
    ) -> Result<Self, EngineError> {
        let redactor = Arc::new(
            Redactor::new(&config.secret_patterns)
                .map_err(|e| EngineError::Internal(format!("bad secret pattern: {e}")))?,
        );
        let assembler = ReportAssembler::new(
            Redactor::new(&config.secret_patterns)
                .map_err(|e| EngineError::Internal(format!("bad secret pattern: {e}")))?,
            config.token_budget,
        );
        let dispatcher = Dispatcher::new(Arc::clone(&journal), emitter.clone(), redactor);
        let policies = Policies::from_config(&config);

        Ok(Self {
            config,
            collaborators,
            forge,
            journal,
            emitter,
            dispatcher,
            assembler,
            invariants,
            policies,
        })
    }

    /// Drive a freshly admitted case to a terminal state.
    pub async fn drive(&self, case: Case, cancel: &CancellationToken) -> Result<Case, EngineError> {
        self.drive_inner(case, cancel, None).await
    }

    /// Rebuild a case from its journal and drive it to a terminal state.
    ///
    /// An activity attempt with no journaled result is re-invoked exactly
    /// once, re-using its attempt number so the collaborator can
    /// deduplicate.
    pub async fn resume(
        &self,
        case_id: &CaseId,
        cancel: &CancellationToken,
    ) -> Result<Case, EngineError> {
        let recovered = recover(
            self.journal.as_ref(),
            case_id,
            self.config.global_deadline(),
        )
        .await?;
        if recovered.case.is_sealed() {
            return Ok(recovered.case);
        }
        self.drive_inner(recovered.case, cancel, recovered.in_flight)
            .await
    }

    async fn drive_inner(
        &self,
        mut case: Case,
        cancel: &CancellationToken,
        mut in_flight: Option<InFlightActivity>,
    ) -> Result<Case, EngineError> {
        if case.state == CaseState::New && case.seq == 1 {
            let data = json!({ "branch": case.event.branch });
            self.emit(&mut case, EventType::StateNew, data).await?;
        }

        while !case.is_sealed() {
            if cancel.is_cancelled() {
                self.fail(&mut case, FailReason::Cancelled, json!({})).await?;
                break;
            }
            if case.deadline_elapsed(Utc::now()) {
                let data = json!({ "deadline": case.deadline });
                self.fail(&mut case, FailReason::Timeout, data).await?;
                break;
            }

            let step = match case.state {
                CaseState::New => self.enter_diagnose(&mut case).await,
                CaseState::Diagnose => {
                    let recovered = take_recovered(&mut in_flight, Phase::Diagnose);
                    self.run_diagnose(&mut case, cancel, recovered).await
                }
                CaseState::Patch => {
                    let recovered = take_recovered(&mut in_flight, Phase::Patch);
                    self.run_patch(&mut case, cancel, recovered).await
                }
                CaseState::Test => {
                    let recovered = take_recovered(&mut in_flight, Phase::Test);
                    self.run_test(&mut case, cancel, recovered).await
                }
                CaseState::Prove => {
                    let recovered = take_recovered(&mut in_flight, Phase::Prove);
                    self.run_prove(&mut case, cancel, recovered).await
                }
                CaseState::Merge => {
                    let recovered = take_recovered(&mut in_flight, Phase::Merge);
                    self.run_merge(&mut case, cancel, recovered).await
                }
                CaseState::Done | CaseState::Failed => break,
            };

            match step {
                Ok(()) => {}
                Err(DriveError::Activity(err)) => {
                    let reason = reason_for(&err);
                    warn!(case_id = %case.id, state = ?case.state, error = %err, "phase failed");
                    self.fail(&mut case, reason, json!({ "error_kind": err.kind() }))
                        .await?;
                }
                Err(DriveError::Fatal(e)) => return Err(e),
            }
        }

        if let Err(e) = self.journal.snapshot(&case.id, &case).await {
            warn!(case_id = %case.id, error = %e, "failed to snapshot sealed case");
        }
        info!(case_id = %case.id, state = ?case.state, reason = ?case.failure_reason, "case sealed");
        Ok(case)
    }

    /// `NEW`: announce the case and move to diagnosis. The deadline was
    /// fixed at admission (`started_at + global deadline`).
    async fn enter_diagnose(&self, case: &mut Case) -> StepResult {
        self.transition(case, CaseState::Diagnose, None, json!({}))
            .await?;
        Ok(())
    }

    async fn run_diagnose(
        &self,
        case: &mut Case,
        cancel: &CancellationToken,
        recovered: Option<u32>,
    ) -> StepResult {
        let ctx = match self.forge.failure_context(&case.event).await {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(case_id = %case.id, error = %e, "failed to fetch forge context");
                crate::report::ForgeContext::default()
            }
        };
        let report = self.assembler.assemble(&case.event, &ctx, &case.feedback);
        let request = DiagnoseRequest {
            report,
            prior_attempts: case.feedback.clone(),
        };

        let diagnoser = Arc::clone(&self.collaborators.diagnoser);
        let min_confidence = self.config.min_diagnosis_confidence;
        let diagnosis = self
            .dispatcher
            .invoke(
                case,
                Phase::Diagnose,
                &self.policies.diagnose,
                cancel,
                recovered,
                move |correlation| {
                    let diagnoser = Arc::clone(&diagnoser);
                    let request = request.clone();
                    async move {
                        let mut diagnosis = diagnoser.diagnose(&correlation, request).await?;
                        // Downgrade before journaling so replay sees the
                        // accepted root cause, not the raw one.
                        if diagnosis.confidence < min_confidence {
                            diagnosis.root_cause = RootCause::Unknown;
                        }
                        Ok(diagnosis)
                    }
                },
                |d| ActivityOutcome::Diagnosed(d.clone()),
            )
            .await?;

        if self.deadline_guard(case).await? {
            return Ok(());
        }

        if diagnosis.root_cause == RootCause::Unknown && diagnosis.patch.is_none() {
            // Nothing to apply; confirm the failure still reproduces on
            // the unchanged head.
            self.transition(
                case,
                CaseState::Test,
                None,
                json!({ "root_cause": RootCause::Unknown }),
            )
            .await?;
        } else {
            self.transition(
                case,
                CaseState::Patch,
                None,
                json!({ "root_cause": diagnosis.root_cause, "confidence": diagnosis.confidence }),
            )
            .await?;
        }
        Ok(())
    }

    async fn run_patch(
        &self,
        case: &mut Case,
        cancel: &CancellationToken,
        recovered: Option<u32>,
    ) -> StepResult {
        let Some(diagnosis) = case.diagnosis.clone() else {
            return Err(EngineError::Internal("in PATCH without a diagnosis".into()).into());
        };
        let Some(patch) = diagnosis.patch else {
            self.transition(case, CaseState::Test, None, json!({ "patch": "none offered" }))
                .await?;
            return Ok(());
        };

        let request = PatchRequest {
            repository: case.event.repository.clone(),
            head_sha: case.event.head_sha.clone(),
            branch: case.event.branch.clone(),
            patch,
            root_cause: diagnosis.root_cause,
        };
        let patcher = Arc::clone(&self.collaborators.patcher);
        let outcome = self
            .dispatcher
            .invoke(
                case,
                Phase::Patch,
                &self.policies.patch,
                cancel,
                recovered,
                move |correlation| {
                    let patcher = Arc::clone(&patcher);
                    let request = request.clone();
                    async move { patcher.apply(&correlation, request).await }
                },
                |outcome| match outcome {
                    PatchCallOutcome::Applied {
                        patch_ref,
                        files_changed,
                    } => ActivityOutcome::Patched {
                        patch_ref: patch_ref.clone(),
                        files_changed: files_changed.clone(),
                    },
                    PatchCallOutcome::CompilationFailed { compilation_errors } => {
                        ActivityOutcome::PatchRejected {
                            compilation_errors: compilation_errors.clone(),
                        }
                    }
                },
            )
            .await?;

        if self.deadline_guard(case).await? {
            return Ok(());
        }

        match outcome {
            PatchCallOutcome::Applied { patch_ref, .. } => {
                self.transition(
                    case,
                    CaseState::Test,
                    None,
                    json!({ "patch_ref": patch_ref }),
                )
                .await?;
            }
            PatchCallOutcome::CompilationFailed { compilation_errors } => {
                // patch_rounds was bumped when the rejection was journaled
                if case.patch_rounds < self.config.max_retries.patch {
                    debug!(
                        case_id = %case.id,
                        round = case.patch_rounds,
                        "patch did not compile, re-diagnosing with compiler errors"
                    );
                    self.transition(
                        case,
                        CaseState::Diagnose,
                        None,
                        json!({ "feedback": "compilation_errors" }),
                    )
                    .await?;
                } else {
                    self.fail(
                        case,
                        FailReason::PatchExhausted,
                        json!({ "compilation_errors": compilation_errors.len() }),
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn run_test(
        &self,
        case: &mut Case,
        cancel: &CancellationToken,
        recovered: Option<u32>,
    ) -> StepResult {
        let request = TestRequest {
            repository: case.event.repository.clone(),
            head_sha: case.event.head_sha.clone(),
            patch_ref: case.patch_ref.clone(),
            suite: self.config.test_suite.clone(),
            seed: Some(case.event.run_id),
            timeout_ms: self.config.activity_timeout_ms,
            flaky_threshold: self.config.flaky_threshold,
        };
        let runner = Arc::clone(&self.collaborators.test_runner);
        let outcome = self
            .dispatcher
            .invoke(
                case,
                Phase::Test,
                &self.policies.test,
                cancel,
                recovered,
                move |correlation| {
                    let runner = Arc::clone(&runner);
                    let request = request.clone();
                    async move { runner.run(&correlation, request).await }
                },
                |t| ActivityOutcome::Tested(t.clone()),
            )
            .await?;

        if self.deadline_guard(case).await? {
            return Ok(());
        }

        match outcome.verdict {
            TestVerdict::Pass => {
                self.transition(case, CaseState::Prove, None, json!({ "verdict": "pass" }))
                    .await?;
            }
            TestVerdict::Flaky => {
                // Mixed outcomes across the runner's repetitions. Promoted
                // like a pass, but the flakiness stays on the record.
                info!(
                    case_id = %case.id,
                    flakiness_score = outcome.flakiness_score,
                    "flaky test run promoted"
                );
                self.transition(
                    case,
                    CaseState::Prove,
                    None,
                    json!({ "verdict": "flaky", "flakiness_score": outcome.flakiness_score }),
                )
                .await?;
            }
            TestVerdict::Fail => {
                // test_failures was bumped when the result was journaled;
                // retries taken so far is test_failures - 1
                if case.test_failures <= self.config.max_retries.test {
                    debug!(
                        case_id = %case.id,
                        failures = case.test_failures,
                        "tests still failing, re-diagnosing with the trace"
                    );
                    self.transition(
                        case,
                        CaseState::Diagnose,
                        None,
                        json!({ "feedback": "test_failure" }),
                    )
                    .await?;
                } else {
                    self.fail(case, FailReason::TestFailed, json!({})).await?;
                }
            }
        }
        Ok(())
    }

    async fn run_prove(
        &self,
        case: &mut Case,
        cancel: &CancellationToken,
        recovered: Option<u32>,
    ) -> StepResult {
        let changed_files = match self.forge.failure_context(&case.event).await {
            Ok(ctx) => ctx.changed_files,
            Err(e) => {
                warn!(case_id = %case.id, error = %e, "failed to fetch changed files");
                Vec::new()
            }
        };
        let applicable: Vec<InvariantSpec> = self
            .invariants
            .iter()
            .filter(|inv| inv.applies_to(&changed_files))
            .cloned()
            .collect();

        if applicable.is_empty() {
            debug!(case_id = %case.id, "no invariants apply to the changed surface");
            self.transition(case, CaseState::Merge, None, json!({ "proof": "vacuous" }))
                .await?;
            return Ok(());
        }

        let request = ProveRequest {
            repository: case.event.repository.clone(),
            head_sha: case.event.head_sha.clone(),
            invariants: applicable.clone(),
            per_theorem_budget_ms: self.config.per_theorem_budget_ms,
        };
        let prover = Arc::clone(&self.collaborators.prover);
        let outcome = self
            .dispatcher
            .invoke(
                case,
                Phase::Prove,
                &self.policies.prove,
                cancel,
                recovered,
                move |correlation| {
                    let prover = Arc::clone(&prover);
                    let request = request.clone();
                    async move { prover.prove(&correlation, request).await }
                },
                |p| ActivityOutcome::Proved(p.clone()),
            )
            .await?;

        if self.deadline_guard(case).await? {
            return Ok(());
        }

        let blocking = outcome.blocking_failures(
            &applicable,
            self.config.proof_criticality_threshold,
            self.config.per_theorem_budget_ms,
        );
        if blocking.is_empty() {
            self.transition(
                case,
                CaseState::Merge,
                None,
                json!({ "proven": outcome.summary.proven, "total": outcome.summary.total }),
            )
            .await?;
        } else {
            let names: Vec<&str> = blocking.iter().map(|inv| inv.name.as_str()).collect();
            self.fail(case, FailReason::ProofFailed, json!({ "unproven": names }))
                .await?;
        }
        Ok(())
    }

    async fn run_merge(
        &self,
        case: &mut Case,
        cancel: &CancellationToken,
        recovered: Option<u32>,
    ) -> StepResult {
        let root_cause = case.root_cause.unwrap_or(RootCause::Unknown);
        // No patch means the failure cleared on the unchanged head (flaky
        // reproduction); the merger still closes out the run, keyed by the
        // head itself.
        let patch_ref = case
            .patch_ref
            .clone()
            .unwrap_or_else(|| PatchRef(case.event.head_sha.clone()));

        let title = format!(
            "self-heal: {} on {}",
            root_cause.short_name(),
            case.event.branch
        );
        let body = case
            .diagnosis_summary()
            .unwrap_or_else(|| "automated remediation".to_string());

        let request = MergeRequest {
            repository: case.event.repository.clone(),
            base_branch: case.event.branch.clone(),
            patch_ref,
            title,
            body,
            root_cause,
            proof_verdict: true,
        };
        let merger = Arc::clone(&self.collaborators.merger);
        let receipt = self
            .dispatcher
            .invoke(
                case,
                Phase::Merge,
                &self.policies.merge,
                cancel,
                recovered,
                move |correlation| {
                    let merger = Arc::clone(&merger);
                    let request = request.clone();
                    async move { merger.merge(&correlation, request).await }
                },
                |m| ActivityOutcome::Merged(m.clone()),
            )
            .await?;

        if receipt.merged {
            self.transition(
                case,
                CaseState::Done,
                None,
                json!({ "pr_number": receipt.pr_number, "merge_sha": receipt.merge_sha }),
            )
            .await?;
        } else {
            self.fail(
                case,
                FailReason::MergeBlocked,
                json!({ "reason": receipt.reason }),
            )
            .await?;
        }
        Ok(())
    }

    /// Force `FAILED(TIMEOUT)` when the case budget has elapsed; the check
    /// runs after every activity result so the expiry preempts the
    /// follow-up transition. Returns true when the case was sealed.
    async fn deadline_guard(&self, case: &mut Case) -> Result<bool, EngineError> {
        if case.deadline_elapsed(Utc::now()) {
            let data = json!({ "deadline": case.deadline });
            self.fail(case, FailReason::Timeout, data).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Append a transition, fold it into the projection, and emit the
    /// entered state's event.
    async fn transition(
        &self,
        case: &mut Case,
        to: CaseState,
        reason: Option<FailReason>,
        data: serde_json::Value,
    ) -> Result<(), EngineError> {
        let from = case.state;
        record(
            self.journal.as_ref(),
            case,
            EntryKind::StateTransition {
                from: Some(from),
                to,
                reason,
                event: None,
            },
        )
        .await?;
        info!(case_id = %case.id, from = ?from, to = ?to, "state transition");
        self.emit(case, EventType::for_state(to), data).await
    }

    /// Seal the case as failed with `reason`.
    async fn fail(
        &self,
        case: &mut Case,
        reason: FailReason,
        mut data: serde_json::Value,
    ) -> Result<(), EngineError> {
        data["reason"] = json!(reason);
        if let Some(summary) = case.diagnosis_summary() {
            data["diagnosis"] = json!(summary);
        }
        self.transition(case, CaseState::Failed, Some(reason), data)
            .await
    }

    /// Emit a lifecycle event and journal that it was emitted.
    async fn emit(
        &self,
        case: &mut Case,
        event_type: EventType,
        data: serde_json::Value,
    ) -> Result<(), EngineError> {
        self.emitter
            .emit(CaseEvent::for_case(case, event_type, data));
        record(
            self.journal.as_ref(),
            case,
            EntryKind::Emitted {
                event_type: event_type.as_str().to_string(),
            },
        )
        .await?;
        Ok(())
    }
}

/// Consume the recovered in-flight attempt if it belongs to `phase`.
fn take_recovered(in_flight: &mut Option<InFlightActivity>, phase: Phase) -> Option<u32> {
    match in_flight {
        Some(activity) if activity.phase == phase => {
            let attempt = activity.attempt;
            *in_flight = None;
            Some(attempt)
        }
        _ => None,
    }
}

/// Map a terminal activity error onto the case's failure reason.
fn reason_for(err: &ActivityError) -> FailReason {
    match err.kind() {
        ErrorKind::InvalidInput | ErrorKind::PatchInvalid => FailReason::Contract,
        ErrorKind::Cancelled => FailReason::Cancelled,
        ErrorKind::Timeout => FailReason::Timeout,
        ErrorKind::Transient | ErrorKind::RateLimited | ErrorKind::Internal => FailReason::Internal,
    }
}
