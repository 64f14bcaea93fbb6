//! Error types for the workflow engine.
//!
//! Collaborator failures are classified at the dispatch boundary into
//! [`ActivityError`] kinds; the driver only ever sees a typed result or a
//! classified error. Everything that can end a case maps onto a
//! [`crate::types::FailReason`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{CaseId, CaseState};

/// Classification of a collaborator failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Retryable within the attempt budget (network, 5xx, rate-limit,
    /// per-attempt timeout)
    Transient,
    /// Rate limited by the collaborator (retryable)
    RateLimited,
    /// Single attempt exceeded its timeout (retryable)
    Timeout,
    /// Caller/contract violation (terminal)
    InvalidInput,
    /// Patch could not be applied at all (terminal)
    PatchInvalid,
    /// Invocation cancelled through the worker's token (terminal)
    Cancelled,
    /// Unexpected collaborator fault (terminal)
    Internal,
}

/// A classified failure returned by a collaborator call.
#[derive(Debug, Clone, Error)]
pub enum ActivityError {
    /// Transient transport or service failure
    #[error("transient failure: {0}")]
    Transient(String),

    /// Rate limited by the collaborator
    #[error("rate limited, retry after {retry_after_secs:?}s")]
    RateLimited {
        /// Suggested wait before the next attempt, if the service sent one
        retry_after_secs: Option<u64>,
    },

    /// A single attempt exceeded its timeout
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    /// The request violated the collaborator's contract
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The patch itself is unusable (malformed diff, wrong base)
    #[error("patch invalid: {0}")]
    PatchInvalid(String),

    /// The invocation was cancelled
    #[error("cancelled")]
    Cancelled,

    /// Unexpected failure inside the collaborator
    #[error("internal collaborator error: {0}")]
    Internal(String),
}

impl ActivityError {
    /// Get the classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::Transient,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::PatchInvalid(_) => ErrorKind::PatchInvalid,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the dispatcher may retry this error within the attempt budget.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transient | ErrorKind::RateLimited | ErrorKind::Timeout
        )
    }
}

/// Errors raised while appending to or replaying the durable journal.
#[derive(Debug, Clone, Error)]
pub enum JournalError {
    /// An append arrived out of order
    #[error("journal sequence gap for case {case_id}: expected {expected}, got {got}")]
    SequenceGap {
        case_id: CaseId,
        expected: u64,
        got: u64,
    },

    /// The journal contents do not replay into a valid case
    #[error("journal corrupt for case {case_id}: {reason}")]
    Corrupt { case_id: CaseId, reason: String },

    /// A replayed transition is not an edge of the declared graph
    #[error("illegal transition for case {case_id}: {from:?} -> {to:?}")]
    IllegalTransition {
        case_id: CaseId,
        from: CaseState,
        to: CaseState,
    },

    /// No journal exists for the requested case
    #[error("no journal for case {0}")]
    NotFound(CaseId),

    /// Backing store failure
    #[error("journal storage failure: {0}")]
    Storage(String),
}

/// Errors raised while admitting a failure event.
#[derive(Debug, Error)]
pub enum AdmitError {
    /// The event is malformed or outside the supported workflow set
    #[error("ingress rejected: {0}")]
    IngressRejected(String),

    /// The event is older than the staleness cutoff
    #[error("ingress stale: event occurred {age_secs}s ago")]
    IngressStale { age_secs: i64 },

    /// The ready queue is at capacity; the caller should retry
    #[error("admission queue full")]
    Backpressure,

    /// The engine is no longer accepting events
    #[error("engine shut down")]
    ShutDown,

    /// The first journal append failed
    #[error(transparent)]
    Journal(#[from] JournalError),
}

/// Engine-level faults.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Journal access failed
    #[error(transparent)]
    Journal(#[from] JournalError),

    /// A case was referenced that the engine does not know
    #[error("unknown case {0}")]
    UnknownCase(CaseId),

    /// The engine has been shut down
    #[error("engine shut down")]
    ShutDown,

    /// Invariant violation inside the engine itself
    #[error("internal engine fault: {0}")]
    Internal(String),
}
