//! Configuration surface for the workflow engine.
//!
//! Every option has a serde default so an embedder can deserialize a partial
//! document (or `{}`) and get the documented behavior. Loading from file or
//! environment is the embedder's concern.

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::Criticality;

/// Caps for the two feedback edges of the state machine.
///
/// `patch` bounds total patcher rounds (applied or rejected); `test` bounds
/// how many times a failed test run may re-enter `DIAGNOSE`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryCaps {
    #[serde(default = "default_patch_retries")]
    pub patch: u32,
    #[serde(default = "default_test_retries")]
    pub test: u32,
}

impl Default for RetryCaps {
    fn default() -> Self {
        Self {
            patch: default_patch_retries(),
            test: default_test_retries(),
        }
    }
}

/// Configuration for the workflow engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on in-flight cases
    #[serde(default = "default_max_concurrent_cases")]
    pub max_concurrent_cases: usize,

    /// Per-case wall-clock budget
    #[serde(default = "default_global_deadline_ms")]
    pub global_deadline_ms: u64,

    /// Per-phase feedback-edge caps
    #[serde(default)]
    pub max_retries: RetryCaps,

    /// Exponential-backoff base between activity attempts
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Exponential-backoff ceiling
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Diagnoses below this confidence are downgraded to `UNKNOWN`
    #[serde(default = "default_min_diagnosis_confidence")]
    pub min_diagnosis_confidence: f64,

    /// Flakiness score above which a test verdict counts as flaky
    #[serde(default = "default_flaky_threshold")]
    pub flaky_threshold: f64,

    /// Invariants at or above this criticality must prove
    #[serde(default = "default_proof_criticality_threshold")]
    pub proof_criticality_threshold: Criticality,

    /// Prover CPU budget per invariant
    #[serde(default = "default_per_theorem_budget_ms")]
    pub per_theorem_budget_ms: u64,

    /// Admission TTL: one case per `(repo, run, head)` per window
    #[serde(default = "default_dedup_ttl_seconds")]
    pub dedup_ttl_seconds: u64,

    /// Reject events older than this
    #[serde(default = "default_stale_cutoff_ms")]
    pub stale_cutoff_ms: u64,

    /// Failure-report size target for the diagnoser, in tokens
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,

    /// Extra redaction patterns on top of the built-in set
    #[serde(default)]
    pub secret_patterns: Vec<String>,

    /// Workflow names eligible for self-healing; empty means all
    #[serde(default)]
    pub eligible_workflows: Vec<String>,

    /// Bound on events queued while the worker pool is saturated
    #[serde(default = "default_admission_buffer")]
    pub admission_buffer: usize,

    /// Timeout of a single collaborator attempt
    #[serde(default = "default_activity_timeout_ms")]
    pub activity_timeout_ms: u64,

    /// Network attempts per phase invocation
    #[serde(default = "default_max_activity_attempts")]
    pub max_activity_attempts: u32,

    /// Test suite name passed to the runner
    #[serde(default = "default_test_suite")]
    pub test_suite: String,

    /// How long sealed cases are retained before cleanup
    #[serde(default = "default_sealed_retention_secs")]
    pub sealed_retention_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        // The empty document is the canonical default.
        serde_json::from_str("{}").expect("default config deserializes")
    }
}

impl EngineConfig {
    /// Per-case wall-clock budget.
    #[must_use]
    pub fn global_deadline(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(self.global_deadline_ms as i64)
    }

    /// Staleness cutoff for ingress events.
    #[must_use]
    pub fn stale_cutoff(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(self.stale_cutoff_ms as i64)
    }

    /// Admission TTL.
    #[must_use]
    pub fn dedup_ttl(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.dedup_ttl_seconds as i64)
    }

    /// Timeout of a single collaborator attempt.
    #[must_use]
    pub const fn activity_timeout(&self) -> Duration {
        Duration::from_millis(self.activity_timeout_ms)
    }

    /// Retention window for sealed cases.
    #[must_use]
    pub fn sealed_retention(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.sealed_retention_secs as i64)
    }

    /// Whether a workflow is eligible for self-healing.
    #[must_use]
    pub fn workflow_eligible(&self, workflow_name: &str) -> bool {
        self.eligible_workflows.is_empty()
            || self.eligible_workflows.iter().any(|w| w == workflow_name)
    }
}

const fn default_max_concurrent_cases() -> usize {
    100
}

const fn default_global_deadline_ms() -> u64 {
    20 * 60 * 1000
}

const fn default_patch_retries() -> u32 {
    2
}

const fn default_test_retries() -> u32 {
    1
}

const fn default_backoff_base_ms() -> u64 {
    1_000
}

const fn default_backoff_cap_ms() -> u64 {
    60_000
}

const fn default_min_diagnosis_confidence() -> f64 {
    0.5
}

const fn default_flaky_threshold() -> f64 {
    0.2
}

const fn default_proof_criticality_threshold() -> Criticality {
    Criticality::Medium
}

const fn default_per_theorem_budget_ms() -> u64 {
    2_000
}

const fn default_dedup_ttl_seconds() -> u64 {
    3_600
}

const fn default_stale_cutoff_ms() -> u64 {
    24 * 60 * 60 * 1000
}

const fn default_token_budget() -> usize {
    16_000
}

const fn default_admission_buffer() -> usize {
    1_000
}

const fn default_activity_timeout_ms() -> u64 {
    120_000
}

const fn default_max_activity_attempts() -> u32 {
    3
}

fn default_test_suite() -> String {
    "default".to_string()
}

const fn default_sealed_retention_secs() -> u64 {
    3_600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_concurrent_cases, 100);
        assert_eq!(config.global_deadline_ms, 1_200_000);
        assert_eq!(config.max_retries.patch, 2);
        assert_eq!(config.max_retries.test, 1);
        assert!((config.min_diagnosis_confidence - 0.5).abs() < f64::EPSILON);
        assert!((config.flaky_threshold - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.proof_criticality_threshold, Criticality::Medium);
        assert_eq!(config.per_theorem_budget_ms, 2_000);
        assert_eq!(config.dedup_ttl_seconds, 3_600);
        assert_eq!(config.token_budget, 16_000);
        assert_eq!(config.admission_buffer, 1_000);
        assert!(config.eligible_workflows.is_empty());
    }

    #[test]
    fn test_partial_override() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"max_concurrent_cases": 4, "max_retries": {"patch": 5}, "eligible_workflows": ["ci"]}"#,
        )
        .unwrap();
        assert_eq!(config.max_concurrent_cases, 4);
        assert_eq!(config.max_retries.patch, 5);
        assert_eq!(config.max_retries.test, 1);
        assert!(config.workflow_eligible("ci"));
        assert!(!config.workflow_eligible("nightly"));
    }

    #[test]
    fn test_all_workflows_eligible_by_default() {
        let config = EngineConfig::default();
        assert!(config.workflow_eligible("anything"));
    }
}
