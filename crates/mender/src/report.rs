//! Failure-report assembly for the diagnoser.
//!
//! Collects diagnostic material fetched through the source-forge adapter,
//! scrubs it through the redactor, and trims it to the diagnoser's token
//! budget. Redaction always runs before journaling or hand-off.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::redact::Redactor;
use crate::types::{FailureEvent, PreviousAttempt};

/// Raw diagnostic material for one failing run, as fetched from the forge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForgeContext {
    /// One-line failure headline (job name, step, conclusion)
    pub failure_message: String,
    /// Logs of the failed jobs
    pub error_logs: String,
    /// Output of the test step, when distinguishable
    pub test_logs: String,
    /// Diff against the merge-base
    pub diff: String,
    /// Names of failed tests
    #[serde(default)]
    pub failed_tests: Vec<String>,
    /// Files changed by the failing commit
    #[serde(default)]
    pub changed_files: Vec<String>,
    /// Environment metadata (runner image, toolchain versions, ...)
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

/// Redacted, budget-trimmed payload handed to the diagnoser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    /// Repository full name
    pub repository: String,
    /// Workflow run ID
    pub run_id: u64,
    /// Head commit of the failing run
    pub head_sha: String,
    /// Branch where the failure occurred
    pub branch: String,
    /// Workflow name
    pub workflow_name: String,
    /// One-line failure headline
    pub failure_message: String,
    /// Failed-job logs (redacted, truncated)
    pub error_logs: String,
    /// Test output (redacted, truncated)
    pub test_logs: String,
    /// Diff against the merge-base (redacted, truncated)
    pub diff: String,
    /// Names of failed tests
    pub failed_tests: Vec<String>,
    /// Environment metadata with redacted values
    pub environment: HashMap<String, String>,
    /// Feedback from earlier rounds (compiler errors, test traces)
    pub previous_attempts: Vec<PreviousAttempt>,
    /// How many secret spans were scrubbed; recorded for audit
    pub redaction_count: usize,
}

impl FailureReport {
    /// Rough token estimate used against the diagnoser budget.
    #[must_use]
    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.failure_message)
            + estimate_tokens(&self.error_logs)
            + estimate_tokens(&self.test_logs)
            + estimate_tokens(&self.diff)
            + self
                .failed_tests
                .iter()
                .map(|t| estimate_tokens(t))
                .sum::<usize>()
    }
}

/// Estimate tokens as `len(text) / 4`.
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

/// Builds [`FailureReport`]s: redaction first, then truncation to budget.
#[derive(Debug)]
pub struct ReportAssembler {
    redactor: Redactor,
    token_budget: usize,
}

impl ReportAssembler {
    /// Create an assembler with the given redactor and token budget.
    #[must_use]
    pub fn new(redactor: Redactor, token_budget: usize) -> Self {
        Self {
            redactor,
            token_budget,
        }
    }

    /// Assemble the report for one failing run.
    #[must_use]
    pub fn assemble(
        &self,
        event: &FailureEvent,
        ctx: &ForgeContext,
        previous_attempts: &[PreviousAttempt],
    ) -> FailureReport {
        let mut redactions = 0;
        let mut scrub = |text: &str| {
            let (out, n) = self.redactor.redact(text);
            redactions += n;
            out
        };

        let failure_message = scrub(&ctx.failure_message);
        let error_logs = scrub(&ctx.error_logs);
        let test_logs = scrub(&ctx.test_logs);
        let diff = scrub(&ctx.diff);
        let failed_tests: Vec<String> = ctx.failed_tests.iter().map(|t| scrub(t)).collect();
        let environment: HashMap<String, String> = ctx
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), scrub(v)))
            .collect();

        let [failure_message, error_logs, test_logs, diff, failed_tests_joined] = trim_to_budget(
            [
                failure_message,
                error_logs,
                test_logs,
                diff,
                failed_tests.join("\n"),
            ],
            self.token_budget * 4,
        );
        let failed_tests: Vec<String> = if failed_tests_joined.is_empty() {
            Vec::new()
        } else {
            failed_tests_joined.lines().map(String::from).collect()
        };

        FailureReport {
            repository: event.repository.clone(),
            run_id: event.run_id,
            head_sha: event.head_sha.clone(),
            branch: event.branch.clone(),
            workflow_name: event.workflow_name.clone(),
            failure_message,
            error_logs,
            test_logs,
            diff,
            failed_tests,
            environment,
            previous_attempts: previous_attempts.to_vec(),
            redaction_count: redactions,
        }
    }
}

/// Marker appended to every field that lost content to the budget.
const TRUNCATION_MARKER: &str = "\n...[truncated]";

/// Trim the five report fields (in priority order: failure message, error
/// logs, test logs, diff, failed tests) to `budget_chars` total.
///
/// The failure message is kept whole; the remaining fields split what is
/// left evenly, with any unused share rolling forward to the next field.
fn trim_to_budget(fields: [String; 5], budget_chars: usize) -> [String; 5] {
    let total: usize = fields.iter().map(|f| f.chars().count()).sum();
    if total <= budget_chars {
        return fields;
    }

    let [message, rest @ ..] = fields;
    let message = truncate_chars(message, budget_chars);
    let mut remaining = budget_chars.saturating_sub(message.chars().count());

    let mut out = [message, String::new(), String::new(), String::new(), String::new()];
    let mut left = rest.len();
    for (slot, field) in out.iter_mut().skip(1).zip(rest) {
        let share = remaining / left.max(1);
        let trimmed = truncate_chars(field, share);
        remaining = remaining.saturating_sub(trimmed.chars().count());
        left -= 1;
        *slot = trimmed;
    }
    out
}

/// Cut `text` to at most `max_chars` characters, marking the cut.
fn truncate_chars(text: String, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text;
    }
    let kept: String = text
        .chars()
        .take(max_chars.saturating_sub(TRUNCATION_MARKER.len()))
        .collect();
    if kept.is_empty() {
        return String::new();
    }
    format!("{kept}{TRUNCATION_MARKER}")
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[test]
    fn test_assemble_redacts_before_handoff() {
        let assembler = ReportAssembler::new(Redactor::default(), 16_000);
        let ctx = ForgeContext {
            failure_message: "build failed".into(),
            error_logs: "export FORGE_TOKEN=abcd1234 then curl".into(),
            environment: HashMap::from([("RUNNER_SECRET".into(), "RUNNER_SECRET=topsecret".into())]),
            ..ForgeContext::default()
        };

        let report = assembler.assemble(&event(), &ctx, &[]);
        assert!(!report.error_logs.contains("abcd1234"));
        assert!(!report.environment["RUNNER_SECRET"].contains("topsecret"));
        assert_eq!(report.redaction_count, 2);
    }

    #[test]
    fn test_small_report_untrimmed() {
        let assembler = ReportAssembler::new(Redactor::default(), 16_000);
        let ctx = ForgeContext {
            failure_message: "lint failed".into(),
            error_logs: "short log".into(),
            diff: "- a\n+ b".into(),
            failed_tests: vec!["test_a".into()],
            ..ForgeContext::default()
        };

        let report = assembler.assemble(&event(), &ctx, &[]);
        assert_eq!(report.error_logs, "short log");
        assert_eq!(report.failed_tests, vec!["test_a".to_string()]);
    }

    #[test]
    fn test_oversized_report_trimmed_in_priority_order() {
        // 100-token budget => 400 chars total
        let assembler = ReportAssembler::new(Redactor::default(), 100);
        let ctx = ForgeContext {
            failure_message: "m".repeat(100),
            error_logs: "e".repeat(5_000),
            test_logs: "t".repeat(5_000),
            diff: "d".repeat(5_000),
            failed_tests: vec!["f".repeat(5_000)],
            ..ForgeContext::default()
        };

        let report = assembler.assemble(&event(), &ctx, &[]);

        // failure message survives whole
        assert_eq!(report.failure_message.chars().count(), 100);
        // everything else fits the remainder
        let total = report.failure_message.chars().count()
            + report.error_logs.chars().count()
            + report.test_logs.chars().count()
            + report.diff.chars().count()
            + report
                .failed_tests
                .iter()
                .map(|t| t.chars().count())
                .sum::<usize>();
        assert!(total <= 400);
        assert!(report.error_logs.ends_with("...[truncated]"));
        assert!(!report.error_logs.is_empty());
        assert!(!report.diff.is_empty());
    }

    #[test]
    fn test_previous_attempts_carried() {
        let assembler = ReportAssembler::new(Redactor::default(), 16_000);
        let previous = vec![PreviousAttempt {
            attempt: 1,
            error: "E0308: mismatched types".into(),
            duration_ms: 900,
        }];
        let report = assembler.assemble(&event(), &ForgeContext::default(), &previous);
        assert_eq!(report.previous_attempts.len(), 1);
        assert!(report.previous_attempts[0].error.contains("E0308"));
    }

    #[test]
    fn test_token_estimate() {
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens(""), 0);
    }
}
