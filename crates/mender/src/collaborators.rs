//! Typed contracts with the external collaborators.
//!
//! The engine treats the diagnoser, patcher, test runner, prover, and
//! merger as opaque RPC endpoints behind these traits; only the shapes
//! below are part of the contract. Every call carries a [`Correlation`]
//! key so a collaborator can deduplicate the re-invocation that follows a
//! mid-call crash.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ActivityError;
use crate::report::{FailureReport, ForgeContext};
use crate::types::{
    CaseId, Diagnosis, FailureEvent, InvariantSpec, MergeReceipt, PatchRef, Phase,
    PreviousAttempt, ProofOutcome, RootCause, TestOutcome,
};

/// Idempotency key forwarded on every collaborator call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlation {
    /// Case the call belongs to
    pub case_id: CaseId,
    /// Phase being driven
    pub phase: Phase,
    /// Attempt number within the phase (re-used verbatim when a crash
    /// forces a re-invocation, so the collaborator can deduplicate)
    pub attempt: u32,
}

/// Diagnoser request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnoseRequest {
    /// Redacted, budget-trimmed failure report
    pub report: FailureReport,
    /// Feedback from earlier rounds (compiler errors, test traces)
    pub prior_attempts: Vec<PreviousAttempt>,
}

/// Patcher request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchRequest {
    pub repository: String,
    pub head_sha: String,
    pub branch: String,
    /// Unified diff produced by the diagnoser
    pub patch: String,
    pub root_cause: RootCause,
}

/// Patcher result: either an applied change set or compiler errors that
/// feed the next diagnosis. Compiler errors are a semantic outcome, not a
/// transport failure; the dispatcher never retries them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PatchCallOutcome {
    Applied {
        patch_ref: PatchRef,
        files_changed: Vec<String>,
    },
    CompilationFailed {
        compilation_errors: Vec<String>,
    },
}

/// Test-runner request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRequest {
    pub repository: String,
    pub head_sha: String,
    /// Change set under test; `None` reruns the unchanged head
    pub patch_ref: Option<PatchRef>,
    pub suite: String,
    /// Seed for deterministic sandbox runs
    pub seed: Option<u64>,
    pub timeout_ms: u64,
    /// Score above which the runner reports `flaky` instead of a plain
    /// verdict
    pub flaky_threshold: f64,
}

/// Prover request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProveRequest {
    pub repository: String,
    pub head_sha: String,
    /// Invariants applicable to the changed surface
    pub invariants: Vec<InvariantSpec>,
    pub per_theorem_budget_ms: u64,
}

/// Merger request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequest {
    pub repository: String,
    pub base_branch: String,
    pub patch_ref: PatchRef,
    pub title: String,
    pub body: String,
    pub root_cause: RootCause,
    /// Whether the prover passed (forwarded for the merge policy)
    pub proof_verdict: bool,
}

/// Diagnoses a failure report into a root cause and an optional patch.
#[async_trait]
pub trait Diagnoser: Send + Sync {
    async fn diagnose(
        &self,
        correlation: &Correlation,
        request: DiagnoseRequest,
    ) -> Result<Diagnosis, ActivityError>;
}

/// Applies a unified diff and reports the resulting change set.
#[async_trait]
pub trait Patcher: Send + Sync {
    async fn apply(
        &self,
        correlation: &Correlation,
        request: PatchRequest,
    ) -> Result<PatchCallOutcome, ActivityError>;
}

/// Runs the test suite in the deterministic sandbox.
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(
        &self,
        correlation: &Correlation,
        request: TestRequest,
    ) -> Result<TestOutcome, ActivityError>;
}

/// Proves the critical invariants over the changed surface.
#[async_trait]
pub trait Prover: Send + Sync {
    async fn prove(
        &self,
        correlation: &Correlation,
        request: ProveRequest,
    ) -> Result<ProofOutcome, ActivityError>;
}

/// Opens and merges the patch-branch pull request.
#[async_trait]
pub trait Merger: Send + Sync {
    async fn merge(
        &self,
        correlation: &Correlation,
        request: MergeRequest,
    ) -> Result<MergeReceipt, ActivityError>;
}

/// Fetches diagnostic material for a failing run from the source forge.
///
/// Individual sources behind the adapter are expected to be fault-tolerant;
/// a failed fetch degrades the report rather than the case.
#[async_trait]
pub trait ForgeReader: Send + Sync {
    async fn failure_context(&self, event: &FailureEvent)
        -> Result<ForgeContext, ActivityError>;
}

/// The full set of collaborators the engine is wired to.
#[derive(Clone)]
pub struct Collaborators {
    pub diagnoser: Arc<dyn Diagnoser>,
    pub patcher: Arc<dyn Patcher>,
    pub test_runner: Arc<dyn TestRunner>,
    pub prover: Arc<dyn Prover>,
    pub merger: Arc<dyn Merger>,
}
