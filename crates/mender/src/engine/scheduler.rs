//! Worker pool over ready cases.
//!
//! FIFO over the admission queue, bounded by `max_concurrent_cases`; each
//! case is owned by exactly one worker through an exclusive lease taken at
//! dequeue and released on sealing or cancellation. Cancellation is
//! cooperative: workers finish or abort at the next await point and the
//! driver writes `FAILED(CANCELLED)` before the lease is dropped.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::driver::CaseDriver;
use crate::types::{Case, CaseId};

/// Exclusive ownership of one in-flight case.
#[derive(Debug, Clone)]
pub struct Lease {
    /// The owned case
    pub case_id: CaseId,
    /// Lease token; a new owner mints a new token
    pub token: Uuid,
    /// When the lease was taken
    pub acquired_at: DateTime<Utc>,
}

/// A case that reached a terminal state, retained until cleanup.
#[derive(Debug, Clone)]
pub struct SealedCase {
    pub case: Case,
    pub sealed_at: DateTime<Utc>,
}

/// Shared store of sealed cases; cheap to clone into maintenance tasks.
#[derive(Debug, Clone, Default)]
pub struct SealedStore(Arc<RwLock<HashMap<CaseId, SealedCase>>>);

impl SealedStore {
    /// A sealed case, if still retained.
    pub async fn get(&self, case_id: &CaseId) -> Option<Case> {
        self.0.read().await.get(case_id).map(|s| s.case.clone())
    }

    /// Number of retained sealed cases.
    pub async fn len(&self) -> usize {
        self.0.read().await.len()
    }

    /// Whether no sealed cases are retained.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn insert(&self, sealed: SealedCase) {
        self.0
            .write()
            .await
            .insert(sealed.case.id.clone(), sealed);
    }

    /// Drop sealed cases older than the retention window. Returns how many
    /// were archived away.
    pub async fn cleanup(&self, retention: Duration) -> usize {
        let cutoff = Utc::now() - retention;
        let mut sealed = self.0.write().await;
        let before = sealed.len();
        sealed.retain(|_, s| s.sealed_at > cutoff);
        let removed = before - sealed.len();
        if removed > 0 {
            info!(removed, "cleaned up sealed cases");
        }
        removed
    }
}

/// Counter of cases admitted but not yet sealed (queued + running).
#[derive(Debug, Clone, Default)]
pub struct WorkGauge(Arc<AtomicUsize>);

impl WorkGauge {
    /// Note a case entering the pipeline.
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    /// Note a case leaving the pipeline.
    pub fn decr(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }

    /// Cases currently in the pipeline.
    #[must_use]
    pub fn load(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bounded pool of workers draining the admission queue.
pub struct WorkerPool {
    leases: Arc<RwLock<HashMap<CaseId, Lease>>>,
    sealed: SealedStore,
    gauge: WorkGauge,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Spawn the scheduler loop over `queue`.
    #[must_use]
    pub fn spawn(
        driver: Arc<CaseDriver>,
        config: &EngineConfig,
        mut queue: mpsc::Receiver<Case>,
        cancel: CancellationToken,
    ) -> Self {
        let leases: Arc<RwLock<HashMap<CaseId, Lease>>> = Arc::default();
        let sealed = SealedStore::default();
        let gauge = WorkGauge::default();
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_cases.max(1)));

        let pool = Self {
            leases: Arc::clone(&leases),
            sealed: sealed.clone(),
            gauge: gauge.clone(),
            cancel: cancel.clone(),
        };

        tokio::spawn(async move {
            loop {
                let case = tokio::select! {
                    () = cancel.cancelled() => break,
                    received = queue.recv() => match received {
                        Some(case) => case,
                        None => break,
                    },
                };

                let permit = tokio::select! {
                    () = cancel.cancelled() => {
                        // queued case abandoned during shutdown
                        gauge.decr();
                        break;
                    }
                    permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let lease = Lease {
                    case_id: case.id.clone(),
                    token: Uuid::new_v4(),
                    acquired_at: Utc::now(),
                };
                leases.write().await.insert(case.id.clone(), lease);

                let driver = Arc::clone(&driver);
                let leases = Arc::clone(&leases);
                let sealed = sealed.clone();
                let gauge = gauge.clone();
                let worker_cancel = cancel.child_token();

                tokio::spawn(async move {
                    let case_id = case.id.clone();
                    let result = driver.drive(case, &worker_cancel).await;

                    leases.write().await.remove(&case_id);
                    match result {
                        Ok(sealed_case) => {
                            sealed
                                .insert(SealedCase {
                                    case: sealed_case,
                                    sealed_at: Utc::now(),
                                })
                                .await;
                        }
                        Err(e) => {
                            // Journal-level fault: the lease is released and
                            // the case stays recoverable from its journal.
                            error!(case_id = %case_id, error = %e, "worker aborted");
                        }
                    }
                    gauge.decr();
                    drop(permit);
                });
            }
            info!("scheduler loop stopped");
        });

        pool
    }

    /// Gauge shared with the admission side.
    #[must_use]
    pub fn gauge(&self) -> WorkGauge {
        self.gauge.clone()
    }

    /// Leases currently held by workers.
    pub async fn active_cases(&self) -> Vec<Lease> {
        self.leases.read().await.values().cloned().collect()
    }

    /// A sealed case, if the pool still retains it.
    pub async fn sealed_case(&self, case_id: &CaseId) -> Option<Case> {
        self.sealed.get(case_id).await
    }

    /// Handle to the sealed-case store for maintenance tasks.
    #[must_use]
    pub fn sealed_store(&self) -> SealedStore {
        self.sealed.clone()
    }

    /// Wait until every admitted case has been sealed.
    pub async fn drain(&self) {
        while self.gauge.load() > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    /// Begin cooperative shutdown and wait for workers to release their
    /// leases.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        while !self.leases.read().await.is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    /// Drop sealed cases older than the retention window. Returns how many
    /// were archived away.
    pub async fn cleanup(&self, retention: Duration) -> usize {
        self.sealed.cleanup(retention).await
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.cancel.is_cancelled() {
            warn!("worker pool dropped without shutdown; cancelling workers");
            self.cancel.cancel();
        }
    }
}
