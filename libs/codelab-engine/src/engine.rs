/// Sandboxed Executor - Running Learner Script
///
/// **Core Responsibility:**
/// Execute learner source once and capture its observable effects: console
/// lines, the completion value and any uncaught error.
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to run code (interpreter thread, budget, console)
/// - Engine does NOT know scoring rules
/// - Engine does NOT look at test cases
/// - Engine returns a raw `ExecutionOutcome` for the evaluator to judge
///
/// **Guarantees:**
/// - Always settles with an outcome; never returns an error, never panics
/// - Hard timeout: `tokio::time::timeout` races the interpreter thread
/// - Real cancellation: the interpreter checks its deadline and the cancel
///   flag on every tick, so busy loops stop too
/// - Console release on every exit path via a drop guard, so a late writer
///   from an abandoned run never appends to a settled outcome
/// - Partial output is kept on timeout

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use codelab_common::config::SandboxMode;
use codelab_common::types::{ExecutionError, ExecutionErrorKind, ExecutionOutcome};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::script::{self, Console, HaltReason, Limits, RunOptions, ScriptFailure};

/// Safety limit to keep pathological submissions away from the parser
pub const MAX_SOURCE_BYTES: usize = 256 * 1024;

/// Tree-walking evaluation recurses; give it room well past the depth ceilings
const INTERPRETER_STACK_BYTES: usize = 64 * 1024 * 1024;

pub fn limits_for(mode: SandboxMode) -> Limits {
    match mode {
        SandboxMode::Standard => Limits::standard(),
        SandboxMode::Restricted => Limits::restricted(),
    }
}

/// Console release guard - seals the buffer and stops the run on drop
struct ConsoleGuard {
    console: Console,
    cancel: Arc<AtomicBool>,
}

impl ConsoleGuard {
    /// Seals first so the snapshot is final
    fn release(&self) -> Vec<String> {
        self.cancel.store(true, Ordering::SeqCst);
        self.console.seal();
        self.console.snapshot()
    }
}

impl Drop for ConsoleGuard {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.console.seal();
    }
}

type ThreadResult = std::thread::Result<Result<Option<serde_json::Value>, ScriptFailure>>;

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn timeout_error(max_execution_time_ms: u64) -> ExecutionError {
    ExecutionError::new(
        ExecutionErrorKind::Timeout,
        format!(
            "Execution exceeded the time limit of {} ms",
            max_execution_time_ms
        ),
    )
}

/// Execute `source` under `limits` for at most `max_execution_time_ms`
///
/// ## Arguments
/// * `source` - Learner script, treated as a function body
/// * `max_execution_time_ms` - Wall-clock ceiling for this run
/// * `limits` - Step, depth, output and string ceilings
/// * `capture` - Capture console lines; otherwise they go to the host log
///
/// ## Returns
/// ExecutionOutcome with `success == error.is_none()`
pub async fn execute(
    source: &str,
    max_execution_time_ms: u64,
    limits: Limits,
    capture: bool,
) -> ExecutionOutcome {
    let started = Instant::now();

    if source.len() > MAX_SOURCE_BYTES {
        warn!(bytes = source.len(), limit = MAX_SOURCE_BYTES, "Rejecting oversized source");
        return ExecutionOutcome::failed(
            Vec::new(),
            ExecutionError::new(
                ExecutionErrorKind::Runtime,
                format!(
                    "Source code is too large ({} bytes, limit {} bytes)",
                    source.len(),
                    MAX_SOURCE_BYTES
                ),
            ),
            elapsed_ms(started),
        );
    }

    let time_limit = Duration::from_millis(max_execution_time_ms);
    let console = Console::new(capture, limits.max_output_lines);
    let options = RunOptions::new(limits, time_limit);
    let guard = ConsoleGuard {
        console: console.clone(),
        cancel: options.cancel.clone(),
    };

    let (tx, rx) = oneshot::channel::<ThreadResult>();
    let program = source.to_string();
    let spawned = std::thread::Builder::new()
        .name("codelab-script".to_string())
        .stack_size(INTERPRETER_STACK_BYTES)
        .spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                script::run(&program, options, console)
            }));
            // Receiver is gone when the run was abandoned on timeout
            let _ = tx.send(result);
        });

    if let Err(e) = spawned {
        error!(error = %e, "Failed to spawn interpreter thread");
        return ExecutionOutcome::failed(
            guard.release(),
            ExecutionError::new(
                ExecutionErrorKind::Internal,
                format!("Sandbox could not start: {}", e),
            ),
            elapsed_ms(started),
        );
    }

    let settled = tokio::time::timeout(time_limit, rx).await;
    let elapsed = elapsed_ms(started);
    let output = guard.release();

    let result = match settled {
        Err(_) => {
            warn!(elapsed_ms = elapsed, limit_ms = max_execution_time_ms, "Execution timed out");
            return ExecutionOutcome::failed(output, timeout_error(max_execution_time_ms), elapsed);
        }
        Ok(Err(_)) => {
            error!("Interpreter thread ended without reporting a result");
            return ExecutionOutcome::failed(
                output,
                ExecutionError::new(
                    ExecutionErrorKind::Internal,
                    "Sandbox ended without a result",
                ),
                elapsed,
            );
        }
        Ok(Ok(Err(panic))) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(panic = %detail, "Interpreter panicked");
            return ExecutionOutcome::failed(
                output,
                ExecutionError::new(
                    ExecutionErrorKind::Internal,
                    format!("Internal sandbox error: {}", detail),
                ),
                elapsed,
            );
        }
        Ok(Ok(Ok(result))) => result,
    };

    debug!(elapsed_ms = elapsed, lines = output.len(), ok = result.is_ok(), "Execution settled");

    match result {
        Ok(return_value) => ExecutionOutcome::succeeded(output, return_value, elapsed),
        Err(failure) => ExecutionOutcome::failed(
            output,
            failure_to_error(failure, max_execution_time_ms),
            elapsed,
        ),
    }
}

fn failure_to_error(failure: ScriptFailure, max_execution_time_ms: u64) -> ExecutionError {
    match failure {
        ScriptFailure::Syntax(e) => ExecutionError::new(ExecutionErrorKind::Syntax, e.to_string()),
        ScriptFailure::Thrown { message, stack } => ExecutionError {
            kind: ExecutionErrorKind::Runtime,
            message,
            stack,
        },
        // The interpreter noticed the deadline before the timer did
        ScriptFailure::Halted(HaltReason::Deadline | HaltReason::Cancelled) => {
            timeout_error(max_execution_time_ms)
        }
        ScriptFailure::Halted(HaltReason::StepLimit) => ExecutionError::new(
            ExecutionErrorKind::Runtime,
            "Execution stopped after exceeding the operation limit",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_success_captures_output_and_value() {
        let outcome = execute("console.log('a', 1)\nconsole.warn('w')\n2 + 3", 2_000, Limits::standard(), true).await;

        assert!(outcome.success);
        assert_eq!(outcome.captured_output, vec!["a 1", "WARN: w"]);
        assert_eq!(outcome.return_value, Some(json!(5)));
    }

    #[tokio::test]
    async fn test_syntax_error_is_its_own_kind() {
        let outcome = execute("let = 4", 2_000, Limits::standard(), true).await;
        let error = outcome.error.unwrap();
        assert_eq!(error.kind, ExecutionErrorKind::Syntax);
        assert!(error.message.contains("line 1, column 5"));
    }

    #[tokio::test]
    async fn test_thrown_error_keeps_partial_output_and_stack() {
        let outcome = execute("console.log('before')\nthrow new TypeError('bad')", 2_000, Limits::standard(), true).await;

        assert!(!outcome.success);
        assert_eq!(outcome.captured_output, vec!["before"]);
        let error = outcome.error.unwrap();
        assert_eq!(error.kind, ExecutionErrorKind::Runtime);
        assert_eq!(error.message, "bad");
        assert_eq!(error.stack.as_deref(), Some("TypeError: bad\n    at line 2, column 1"));
    }

    #[tokio::test]
    async fn test_oversized_source_is_rejected() {
        let source = "1;".repeat(MAX_SOURCE_BYTES);
        let outcome = execute(&source, 2_000, Limits::standard(), true).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().message.contains("too large"));
    }

    #[tokio::test]
    async fn test_capture_disabled_returns_no_lines() {
        let outcome = execute("console.log('hi'); 1", 2_000, Limits::standard(), false).await;
        assert!(outcome.success);
        assert!(outcome.captured_output.is_empty());
    }

    #[tokio::test]
    async fn test_step_limit_is_runtime_error() {
        let limits = Limits {
            max_steps: 10_000,
            ..Limits::standard()
        };
        let outcome = execute("let i = 0; while (true) { i++ }", 5_000, limits, true).await;
        let error = outcome.error.unwrap();
        assert_eq!(error.kind, ExecutionErrorKind::Runtime);
        assert!(error.message.contains("operation limit"));
    }

    #[test]
    fn test_sandbox_modes_map_to_limits() {
        assert!(limits_for(SandboxMode::Standard).allow_sleep);
        assert!(!limits_for(SandboxMode::Restricted).allow_sleep);
        assert!(limits_for(SandboxMode::Restricted).max_steps < limits_for(SandboxMode::Standard).max_steps);
    }
}
