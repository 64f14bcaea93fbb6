//! Self-healing workflow engine.
//!
//! Drives each failing CI run through a durable, deterministic state
//! machine:
//!
//! ```text
//! NEW ──▶ DIAGNOSE ──▶ PATCH ──▶ TEST ──▶ PROVE ──▶ MERGE ──▶ DONE
//!              ▲          │        │                   │
//!              └──────────┴────────┘                 FAILED
//!         (feedback edges: compile errors, test failures)
//! ```
//!
//! The four analyzers (diagnoser, patcher, sandbox test runner, theorem
//! prover) and the merger are opaque collaborators behind the traits in
//! [`collaborators`]; the engine owns failure policy, bounded retry loops
//! with feedback, idempotency across crashes, and the observability events
//! emitted at every transition.
//!
//! # Architecture
//!
//! - [`engine::Admitter`] validates and deduplicates incoming
//!   [`types::FailureEvent`]s and queues a [`types::Case`] per admission.
//! - [`engine::WorkerPool`] drains the queue under a concurrency bound,
//!   holding one exclusive lease per in-flight case.
//! - [`engine::CaseDriver`] runs the state machine; every append to the
//!   [`journal::Journal`] lands before the in-memory projection advances,
//!   so a crash at any point is recoverable by replay.
//! - [`engine::Dispatcher`] makes the actual collaborator calls with
//!   timeouts, classified-error retries, and exponential backoff.
//! - [`report::ReportAssembler`] and [`redact::Redactor`] prepare the
//!   diagnoser's payload; secrets never reach the journal or the sinks.
//! - [`events::EventEmitter`] publishes lifecycle events fire-and-forget.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use mender::{Engine, EngineConfig, EventEmitter, InMemoryDedupIndex, InMemoryJournal};
//! # use mender::collaborators::Collaborators;
//! # fn collaborators() -> Collaborators { unimplemented!() }
//! # fn forge() -> Arc<dyn mender::collaborators::ForgeReader> { unimplemented!() }
//!
//! # async fn run(event: mender::FailureEvent) -> anyhow::Result<()> {
//! let engine = Engine::new(
//!     EngineConfig::default(),
//!     collaborators(),
//!     forge(),
//!     Arc::new(InMemoryJournal::new()),
//!     Arc::new(InMemoryDedupIndex::new()),
//!     EventEmitter::disabled(),
//!     Vec::new(),
//! )?;
//!
//! engine.handle(event).await?;
//! engine.drain().await;
//! # Ok(())
//! # }
//! ```

pub mod collaborators;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod events;
pub mod journal;
pub mod redact;
pub mod report;
pub mod types;

pub use collaborators::{
    Collaborators, Correlation, DiagnoseRequest, Diagnoser, ForgeReader, MergeRequest, Merger,
    PatchCallOutcome, PatchRequest, Patcher, ProveRequest, Prover, TestRequest, TestRunner,
};
pub use config::{EngineConfig, RetryCaps};
pub use dedup::{Admission, DedupIndex, InMemoryDedupIndex};
pub use engine::{AdmitOutcome, CaseDriver, Dispatcher, Engine, WorkerPool};
pub use error::{ActivityError, AdmitError, EngineError, ErrorKind, JournalError};
pub use events::{CaseEvent, EventEmitter, EventSink, EventType, MemorySink, Severity};
pub use journal::{InMemoryJournal, Journal, Recovered};
pub use redact::{Redactor, REDACTED};
pub use report::{FailureReport, ForgeContext, ReportAssembler};
pub use types::{
    Case, CaseId, CaseState, Criticality, Diagnosis, FailReason, FailureEvent, InvariantSpec,
    JournalEntry, MergeReceipt, PatchRef, Phase, ProofOutcome, RootCause, TestOutcome,
    TestVerdict, TheoremResult, TheoremVerdict,
};
