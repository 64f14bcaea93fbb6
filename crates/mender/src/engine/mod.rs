//! The workflow engine: admission, scheduling, dispatch, and the per-case
//! state-machine driver.

pub mod admit;
pub mod dispatch;
pub mod driver;
pub mod scheduler;

pub use admit::{AdmitOutcome, Admitter};
pub use dispatch::{backoff_delay, ActivityPolicy, DispatchError, Dispatcher};
pub use driver::CaseDriver;
pub use scheduler::{Lease, SealedCase, SealedStore, WorkGauge, WorkerPool};

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::collaborators::{Collaborators, ForgeReader};
use crate::config::EngineConfig;
use crate::dedup::DedupIndex;
use crate::error::{AdmitError, EngineError};
use crate::events::EventEmitter;
use crate::journal::Journal;
use crate::types::{Case, CaseId, FailureEvent, InvariantSpec};

/// The assembled engine: one admitter feeding one worker pool.
///
/// Construction wires collaborators, stores, and sinks together and starts
/// the scheduler plus a maintenance task (dedup eviction, sealed-case
/// cleanup). [`Engine::shutdown`] cancels everything cooperatively.
pub struct Engine {
    admitter: Admitter,
    pool: WorkerPool,
    driver: Arc<CaseDriver>,
    dedup: Arc<dyn DedupIndex>,
    cancel: CancellationToken,
}

impl Engine {
    /// Build and start an engine.
    ///
    /// # Errors
    ///
    /// Fails when the configured redaction patterns do not compile.
    pub fn new(
        config: EngineConfig,
        collaborators: Collaborators,
        forge: Arc<dyn ForgeReader>,
        journal: Arc<dyn Journal>,
        dedup: Arc<dyn DedupIndex>,
        emitter: EventEmitter,
        invariants: Vec<InvariantSpec>,
    ) -> Result<Self, EngineError> {
        let config = Arc::new(config);
        let cancel = CancellationToken::new();

        let driver = Arc::new(CaseDriver::new(
            Arc::clone(&config),
            collaborators,
            forge,
            Arc::clone(&journal),
            emitter.clone(),
            invariants,
        )?);

        let (queue_tx, queue_rx) = mpsc::channel(config.admission_buffer.max(1));
        let pool = WorkerPool::spawn(
            Arc::clone(&driver),
            &config,
            queue_rx,
            cancel.child_token(),
        );
        let admitter = Admitter::new(
            Arc::clone(&config),
            Arc::clone(&dedup),
            journal,
            emitter,
            queue_tx,
        );

        // Maintenance: evict expired dedup keys, archive old sealed cases.
        {
            let dedup = Arc::clone(&dedup);
            let gauge = pool.gauge();
            let sealed = pool.sealed_store();
            let retention = config.sealed_retention();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = tick.tick() => {
                            let evicted = dedup.evict_expired().await;
                            let archived = sealed.cleanup(retention).await;
                            debug!(evicted, archived, in_flight = gauge.load(), "maintenance tick");
                        }
                    }
                }
            });
        }

        Ok(Self {
            admitter,
            pool,
            driver,
            dedup,
            cancel,
        })
    }

    /// Admit one failure event; on admission the case enters the pipeline.
    ///
    /// # Errors
    ///
    /// See [`Admitter::admit`].
    pub async fn handle(&self, event: FailureEvent) -> Result<AdmitOutcome, AdmitError> {
        // Counted before the enqueue so `drain` can never observe a case
        // that is in the queue but not in the gauge.
        self.pool.gauge().incr();
        match self.admitter.admit(event).await {
            Ok(AdmitOutcome::Enqueued(case_id)) => Ok(AdmitOutcome::Enqueued(case_id)),
            other => {
                self.pool.gauge().decr();
                other
            }
        }
    }

    /// Resume a case from its journal after a crash or lease transfer.
    ///
    /// Runs on the caller's task, outside the pool's concurrency bound;
    /// intended for startup recovery of the cases that were in flight.
    pub async fn resume(&self, case_id: &CaseId) -> Result<Case, EngineError> {
        self.driver.resume(case_id, &self.cancel.child_token()).await
    }

    /// Wait until every admitted case has sealed.
    pub async fn drain(&self) {
        self.pool.drain().await;
    }

    /// Leases currently held by workers.
    pub async fn active_cases(&self) -> Vec<Lease> {
        self.pool.active_cases().await
    }

    /// A sealed case, if still retained.
    pub async fn sealed_case(&self, case_id: &CaseId) -> Option<Case> {
        self.pool.sealed_case(case_id).await
    }

    /// Evict expired dedup keys immediately (maintenance also runs this
    /// periodically).
    pub async fn evict_expired(&self) -> usize {
        self.dedup.evict_expired().await
    }

    /// Cancel workers cooperatively and wait for leases to be released.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.pool.shutdown().await;
    }
}
