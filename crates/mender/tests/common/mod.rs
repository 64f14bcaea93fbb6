//! Shared fakes and builders for engine integration tests.
//!
//! Collaborators are scripted: each fake pops the next response off a
//! queue and records the request it saw. All fakes tolerate duplicate
//! calls, which is what the crash-recovery tests rely on.

// not every test binary uses every fake
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use mender::collaborators::{
    Collaborators, Correlation, DiagnoseRequest, Diagnoser, ForgeReader, MergeRequest, Merger,
    PatchCallOutcome, PatchRequest, Patcher, ProveRequest, Prover, TestRequest, TestRunner,
};
use mender::{
    ActivityError, Criticality, Diagnosis, Engine, EngineConfig, EventEmitter, FailureEvent,
    ForgeContext, InMemoryDedupIndex, InMemoryJournal, InvariantSpec, Journal, MemorySink,
    MergeReceipt, PatchRef, Phase, ProofOutcome, RootCause, TestOutcome, TestVerdict,
    TheoremResult, TheoremVerdict,
};

pub fn failure_event(run_id: u64) -> FailureEvent {
    FailureEvent {
        repository: "acme/app".into(),
        run_id,
        head_sha: "abc123".into(),
        branch: "main".into(),
        actor: "dev".into(),
        installation_id: 7,
        workflow_name: "ci".into(),
        occurred_at: Utc::now(),
        received_at: Utc::now(),
    }
}

pub fn diagnosis(root_cause: RootCause, confidence: f64, patch: Option<&str>) -> Diagnosis {
    Diagnosis {
        root_cause,
        confidence,
        patch: patch.map(String::from),
        explanation: format!("looks like {}", root_cause.short_name()),
        suggested_actions: vec![],
        estimated_fix_minutes: Some(5),
    }
}

pub fn test_pass() -> TestOutcome {
    TestOutcome {
        verdict: TestVerdict::Pass,
        flakiness_score: 0.0,
        retry_outcomes: (1..=3)
            .map(|attempt| mender::types::RetryOutcome {
                attempt,
                success: true,
                duration_ms: 900,
                error: None,
            })
            .collect(),
        trace: None,
    }
}

pub fn test_fail(trace: &str) -> TestOutcome {
    TestOutcome {
        verdict: TestVerdict::Fail,
        flakiness_score: 0.0,
        retry_outcomes: (1..=3)
            .map(|attempt| mender::types::RetryOutcome {
                attempt,
                success: false,
                duration_ms: 1100,
                error: Some(trace.to_string()),
            })
            .collect(),
        trace: Some(trace.to_string()),
    }
}

pub fn test_flaky(score: f64) -> TestOutcome {
    TestOutcome {
        verdict: TestVerdict::Flaky,
        flakiness_score: score,
        retry_outcomes: vec![
            mender::types::RetryOutcome {
                attempt: 1,
                success: false,
                duration_ms: 1000,
                error: Some("timed out waiting for socket".into()),
            },
            mender::types::RetryOutcome {
                attempt: 2,
                success: true,
                duration_ms: 950,
                error: None,
            },
            mender::types::RetryOutcome {
                attempt: 3,
                success: true,
                duration_ms: 940,
                error: None,
            },
        ],
        trace: None,
    }
}

pub fn merged(pr_number: u64) -> MergeReceipt {
    MergeReceipt {
        merged: true,
        merge_sha: Some("feedbee".into()),
        pr_number: Some(pr_number),
        reason: None,
    }
}

pub fn merge_blocked(reason: &str) -> MergeReceipt {
    MergeReceipt {
        merged: false,
        merge_sha: None,
        pr_number: None,
        reason: Some(reason.to_string()),
    }
}

pub fn invariant(name: &str, criticality: Criticality, scope: &str) -> InvariantSpec {
    InvariantSpec {
        name: name.to_string(),
        predicate: format!("holds({name})"),
        criticality,
        scope: scope.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Scripted collaborators
// ---------------------------------------------------------------------------

pub struct ScriptedDiagnoser {
    script: Mutex<VecDeque<Result<Diagnosis, ActivityError>>>,
    pub requests: Mutex<Vec<DiagnoseRequest>>,
}

impl ScriptedDiagnoser {
    pub fn new(script: Vec<Result<Diagnosis, ActivityError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Diagnoser for ScriptedDiagnoser {
    async fn diagnose(
        &self,
        _correlation: &Correlation,
        request: DiagnoseRequest,
    ) -> Result<Diagnosis, ActivityError> {
        self.requests.lock().unwrap().push(request);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ActivityError::Internal("diagnoser script exhausted".into())))
    }
}

pub struct ScriptedPatcher {
    script: Mutex<VecDeque<Result<PatchCallOutcome, ActivityError>>>,
    pub requests: Mutex<Vec<PatchRequest>>,
    pub correlations: Mutex<Vec<Correlation>>,
}

impl ScriptedPatcher {
    pub fn new(script: Vec<Result<PatchCallOutcome, ActivityError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            correlations: Mutex::new(Vec::new()),
        })
    }

    pub fn applied(patch_ref: &str) -> Result<PatchCallOutcome, ActivityError> {
        Ok(PatchCallOutcome::Applied {
            patch_ref: PatchRef(patch_ref.to_string()),
            files_changed: vec!["src/config.rs".into()],
        })
    }

    pub fn compile_failed(errors: &[&str]) -> Result<PatchCallOutcome, ActivityError> {
        Ok(PatchCallOutcome::CompilationFailed {
            compilation_errors: errors.iter().map(|e| (*e).to_string()).collect(),
        })
    }
}

#[async_trait]
impl Patcher for ScriptedPatcher {
    async fn apply(
        &self,
        correlation: &Correlation,
        request: PatchRequest,
    ) -> Result<PatchCallOutcome, ActivityError> {
        self.correlations.lock().unwrap().push(correlation.clone());
        self.requests.lock().unwrap().push(request);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ActivityError::Internal("patcher script exhausted".into())))
    }
}

pub struct ScriptedRunner {
    script: Mutex<VecDeque<Result<TestOutcome, ActivityError>>>,
    pub requests: Mutex<Vec<TestRequest>>,
}

impl ScriptedRunner {
    pub fn new(script: Vec<Result<TestOutcome, ActivityError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl TestRunner for ScriptedRunner {
    async fn run(
        &self,
        _correlation: &Correlation,
        request: TestRequest,
    ) -> Result<TestOutcome, ActivityError> {
        self.requests.lock().unwrap().push(request);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ActivityError::Internal("runner script exhausted".into())))
    }
}

/// Prover that proves every submitted invariant within budget.
pub struct AllProven;

#[async_trait]
impl Prover for AllProven {
    async fn prove(
        &self,
        _correlation: &Correlation,
        request: ProveRequest,
    ) -> Result<ProofOutcome, ActivityError> {
        Ok(ProofOutcome::from_theorems(
            request
                .invariants
                .iter()
                .map(|inv| TheoremResult {
                    name: inv.name.clone(),
                    verdict: TheoremVerdict::Proven,
                    duration_ms: 120,
                    error: None,
                })
                .collect(),
        ))
    }
}

/// Prover with a fixed per-invariant verdict script, keyed by name.
pub struct ScriptedProver {
    pub verdicts: Vec<(String, TheoremVerdict)>,
}

impl ScriptedProver {
    pub fn new(verdicts: &[(&str, TheoremVerdict)]) -> Arc<Self> {
        Arc::new(Self {
            verdicts: verdicts
                .iter()
                .map(|(name, v)| ((*name).to_string(), *v))
                .collect(),
        })
    }
}

#[async_trait]
impl Prover for ScriptedProver {
    async fn prove(
        &self,
        _correlation: &Correlation,
        request: ProveRequest,
    ) -> Result<ProofOutcome, ActivityError> {
        Ok(ProofOutcome::from_theorems(
            request
                .invariants
                .iter()
                .map(|inv| TheoremResult {
                    name: inv.name.clone(),
                    verdict: self
                        .verdicts
                        .iter()
                        .find(|(name, _)| *name == inv.name)
                        .map_or(TheoremVerdict::Unproven, |(_, v)| *v),
                    duration_ms: 80,
                    error: None,
                })
                .collect(),
        ))
    }
}

/// Prover that takes `delay` before proving everything; for deadline tests.
pub struct SlowProver {
    pub delay: std::time::Duration,
}

#[async_trait]
impl Prover for SlowProver {
    async fn prove(
        &self,
        correlation: &Correlation,
        request: ProveRequest,
    ) -> Result<ProofOutcome, ActivityError> {
        tokio::time::sleep(self.delay).await;
        AllProven.prove(correlation, request).await
    }
}

pub struct ScriptedMerger {
    script: Mutex<VecDeque<Result<MergeReceipt, ActivityError>>>,
    pub requests: Mutex<Vec<MergeRequest>>,
}

impl ScriptedMerger {
    pub fn new(script: Vec<Result<MergeReceipt, ActivityError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Merger for ScriptedMerger {
    async fn merge(
        &self,
        _correlation: &Correlation,
        request: MergeRequest,
    ) -> Result<MergeReceipt, ActivityError> {
        self.requests.lock().unwrap().push(request);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ActivityError::Internal("merger script exhausted".into())))
    }
}

/// Forge adapter serving one fixed context.
pub struct StaticForge(pub ForgeContext);

impl StaticForge {
    pub fn empty() -> Arc<Self> {
        Arc::new(Self(ForgeContext::default()))
    }

    pub fn with_changed_files(files: &[&str]) -> Arc<Self> {
        Arc::new(Self(ForgeContext {
            failure_message: "job `test` failed".into(),
            error_logs: "error: assertion failed".into(),
            changed_files: files.iter().map(|f| (*f).to_string()).collect(),
            ..ForgeContext::default()
        }))
    }
}

#[async_trait]
impl ForgeReader for StaticForge {
    async fn failure_context(
        &self,
        _event: &FailureEvent,
    ) -> Result<ForgeContext, ActivityError> {
        Ok(self.0.clone())
    }
}

// ---------------------------------------------------------------------------
// Test bed
// ---------------------------------------------------------------------------

static TRACING: std::sync::Once = std::sync::Once::new();

/// Install a test subscriber once per binary; `RUST_LOG` filters as usual.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub struct TestBed {
    pub engine: Engine,
    pub sink: MemorySink,
    pub journal: InMemoryJournal,
    pub emitter: EventEmitter,
}

pub fn testbed(
    config: EngineConfig,
    collaborators: Collaborators,
    forge: Arc<dyn ForgeReader>,
    invariants: Vec<InvariantSpec>,
) -> TestBed {
    init_tracing();
    let sink = MemorySink::new();
    let emitter = EventEmitter::new(vec![Arc::new(sink.clone())]);
    let journal = InMemoryJournal::new();
    let engine = Engine::new(
        config,
        collaborators,
        forge,
        Arc::new(journal.clone()),
        Arc::new(InMemoryDedupIndex::new()),
        emitter.clone(),
        invariants,
    )
    .expect("engine builds");

    TestBed {
        engine,
        sink,
        journal,
        emitter,
    }
}

/// The `state.*` event names observed by the sink, in order.
pub async fn state_event_names(sink: &MemorySink) -> Vec<&'static str> {
    sink.event_types()
        .await
        .into_iter()
        .map(mender::EventType::as_str)
        .filter(|name| name.starts_with("state.") || *name == "dedup.hit")
        .collect()
}

/// Count of journaled `ActivityAttempt` entries for `phase`.
pub async fn attempts_for(journal: &InMemoryJournal, case_id: &mender::CaseId, phase: Phase) -> u32 {
    journal
        .read_all(case_id)
        .await
        .unwrap()
        .iter()
        .filter(|entry| {
            matches!(
                entry.kind,
                mender::types::EntryKind::ActivityAttempt { phase: p, .. } if p == phase
            )
        })
        .count() as u32
}
