/// Evaluation Orchestrator - High-Level Grading
///
/// **Responsibility:**
/// Sequence checker, engine and evaluator into one `Verdict` per call.
///
/// **Stages:**
/// 1. EMPTY-CHECK: blank or oversized source gets a zero-score verdict
///    immediately, before anything parses it
/// 2. STATIC-CHECK: pattern checker (skipped when type checking is off)
/// 3. SELECT: the first test case is the active one
/// 4. EXECUTE: always runs, even when diagnostics were found
/// 5. COMPARE: against the declared output, or trivially matching
/// 6. FEEDBACK + SCORE
/// 7. SUCCESS: no diagnostics, clean run, matching output
/// 8. ASSEMBLE: `passed_count` is 0 or 1, `total_count` is every test case
///
/// This module is the glue layer - it knows nothing about:
/// - How code executes (engine's job)
/// - How scoring works (evaluator's job)
///
/// Panics in stages 2-7 and overruns of the overall timeout become a
/// zero-score verdict; only an empty test-case list is reported as an error.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use codelab_common::config::{ConfigOverrides, GraderConfig};
use codelab_common::types::{Diagnostic, FeedbackEntry, FeedbackKind, TestCase, Verdict};
use futures_util::FutureExt;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::{checker, engine, evaluator};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GradeError {
    #[error("at least one test case is required to evaluate a submission")]
    NoTestCases,
}

#[derive(Default)]
struct GraderState {
    in_progress: AtomicBool,
    last_verdict: Mutex<Option<Verdict>>,
    /// Admits one evaluation at a time
    run_lock: tokio::sync::Mutex<()>,
}

/// Resets the in-progress flag on every exit path
struct InProgress<'a>(&'a AtomicBool);

impl<'a> InProgress<'a> {
    fn set(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Static-check stage; swappable so tests can fail it on purpose
type CheckFn = fn(&str) -> Vec<Diagnostic>;

#[derive(Clone)]
pub struct Grader {
    config: GraderConfig,
    state: Arc<GraderState>,
    check: CheckFn,
}

impl Grader {
    pub fn new(config: GraderConfig) -> Self {
        Self {
            config,
            state: Arc::new(GraderState::default()),
            check: checker::check,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_checker(mut self, check: CheckFn) -> Self {
        self.check = check;
        self
    }

    pub fn config(&self) -> &GraderConfig {
        &self.config
    }

    pub fn in_progress(&self) -> bool {
        self.state.in_progress.load(Ordering::SeqCst)
    }

    pub fn last_verdict(&self) -> Option<Verdict> {
        self.state
            .last_verdict
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub async fn evaluate(&self, source: &str, test_cases: &[TestCase]) -> Result<Verdict, GradeError> {
        self.evaluate_with(source, test_cases, &ConfigOverrides::default())
            .await
    }

    /// Evaluate with lesson-level overrides applied on top of the grader config
    #[instrument(skip_all, fields(source_bytes = source.len(), test_count = test_cases.len()))]
    pub async fn evaluate_with(
        &self,
        source: &str,
        test_cases: &[TestCase],
        overrides: &ConfigOverrides,
    ) -> Result<Verdict, GradeError> {
        let active = test_cases.first().ok_or(GradeError::NoTestCases)?;
        let total_count = test_cases.len() as u32;
        let config = self.config.with_overrides(overrides);

        let _serial = self.state.run_lock.lock().await;
        let _flag = InProgress::set(&self.state.in_progress);

        let verdict = if source.trim().is_empty() {
            info!("Empty submission");
            empty_source_verdict(total_count)
        } else if source.len() > engine::MAX_SOURCE_BYTES {
            warn!(bytes = source.len(), limit = engine::MAX_SOURCE_BYTES, "Rejecting oversized submission");
            oversized_source_verdict(source.len(), total_count)
        } else {
            let overall = Duration::from_millis(config.timeout_ms);
            let pipeline = AssertUnwindSafe(run_pipeline(source, active, &config, self.check, total_count));
            match tokio::time::timeout(overall, pipeline.catch_unwind()).await {
                Ok(Ok(verdict)) => verdict,
                Ok(Err(_)) => {
                    error!(test_id = %active.id, "Evaluation pipeline panicked");
                    evaluation_error_verdict(total_count)
                }
                Err(_) => {
                    warn!(timeout_ms = config.timeout_ms, "Evaluation exceeded the overall timeout");
                    Verdict::rejected(
                        FeedbackEntry::new(
                            FeedbackKind::Error,
                            format!("Evaluation did not finish within {} ms", config.timeout_ms),
                        )
                        .with_suggestion("Make sure your code finishes quickly and try again."),
                        total_count,
                    )
                }
            }
        };

        info!(
            score = verdict.score,
            success = verdict.success,
            elapsed_ms = verdict.elapsed_ms,
            "Evaluation complete"
        );

        *self
            .state
            .last_verdict
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(verdict.clone());
        Ok(verdict)
    }
}

/// A test case's own ceiling can only tighten the configured one
fn effective_time_limit(config_ms: u64, test_case_ms: u64) -> u64 {
    if test_case_ms == 0 {
        config_ms
    } else {
        config_ms.min(test_case_ms)
    }
}

async fn run_pipeline(
    source: &str,
    test_case: &TestCase,
    config: &GraderConfig,
    check: CheckFn,
    total_count: u32,
) -> Verdict {
    let diagnostics = if config.enable_type_checking {
        check(source)
    } else {
        Vec::new()
    };

    let time_limit = effective_time_limit(config.max_execution_time_ms, test_case.timeout_ms);
    let outcome = engine::execute(
        source,
        time_limit,
        engine::limits_for(config.sandbox_mode),
        config.enable_console_capture,
    )
    .await;

    let comparison = match &test_case.expected_output {
        Some(expected) => evaluator::compare(expected, &outcome.captured_output),
        None => evaluator::trivial_comparison(),
    };

    let feedback = evaluator::feedback(&diagnostics, &outcome, &comparison, test_case);
    let score = evaluator::score(&diagnostics, &outcome, &comparison, test_case);
    let success = diagnostics.is_empty() && outcome.success && comparison.matches;

    if let Some(err) = &outcome.error {
        warn!(test_id = %test_case.id, kind = ?err.kind, "Execution failed; test cannot pass");
    }

    let suggestions = feedback
        .iter()
        .filter_map(|entry| entry.suggestion.clone())
        .collect();

    Verdict {
        success,
        score,
        diagnostics,
        errors: outcome.error.into_iter().collect(),
        comparison,
        feedback,
        suggestions,
        output: outcome.captured_output,
        return_value: outcome.return_value,
        elapsed_ms: outcome.elapsed_ms,
        passed_count: u32::from(success),
        total_count,
    }
}

fn empty_source_verdict(total_count: u32) -> Verdict {
    Verdict::rejected(
        FeedbackEntry::new(FeedbackKind::Error, "No code to evaluate")
            .with_suggestion("Write your solution in the editor, then run it again."),
        total_count,
    )
}

fn oversized_source_verdict(bytes: usize, total_count: u32) -> Verdict {
    Verdict::rejected(
        FeedbackEntry::new(
            FeedbackKind::Error,
            format!(
                "Source code is too large ({} bytes, limit {} bytes)",
                bytes,
                engine::MAX_SOURCE_BYTES
            ),
        )
        .with_suggestion("Shorten your solution and run it again."),
        total_count,
    )
}

fn evaluation_error_verdict(total_count: u32) -> Verdict {
    Verdict::rejected(
        FeedbackEntry::new(
            FeedbackKind::Error,
            "An evaluation error occurred while checking your code",
        )
        .with_suggestion("Try again. If the problem persists, report it to the course staff."),
        total_count,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_limit_only_tightens() {
        assert_eq!(effective_time_limit(5000, 0), 5000);
        assert_eq!(effective_time_limit(5000, 200), 200);
        assert_eq!(effective_time_limit(5000, 9000), 5000);
    }

    #[test]
    fn test_in_progress_guard_resets() {
        let flag = AtomicBool::new(false);
        {
            let _guard = InProgress::set(&flag);
            assert!(flag.load(Ordering::SeqCst));
        }
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_fallback_verdicts_are_zero_score() {
        let empty = empty_source_verdict(2);
        assert_eq!((empty.score, empty.total_count, empty.feedback.len()), (0, 2, 1));
        let internal = evaluation_error_verdict(1);
        assert!(internal.feedback[0].message.contains("evaluation error"));
        let oversized = oversized_source_verdict(300_000, 1);
        assert!(oversized.feedback[0].message.starts_with("Source code is too large (300000 bytes"));
    }
}
