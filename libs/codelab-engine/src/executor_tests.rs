/// End-to-end grading tests
///
/// These run real learner snippets through the whole pipeline:
/// 1. Clean runs score 100 with the expected feedback shape
/// 2. Diagnostics and runtime errors apply their penalties
/// 3. Timeouts settle near the limit, for sleeps and for busy loops
/// 4. Grader state (in progress, last verdict) behaves across calls
/// 5. Hostile input (huge, deeply nested, crashing stages) still yields a verdict

#[cfg(test)]
mod grading_tests {
    use crate::engine::MAX_SOURCE_BYTES;
    use crate::executor::{GradeError, Grader};
    use codelab_common::config::{ConfigOverrides, GraderConfig, SandboxMode};
    use codelab_common::types::{Diagnostic, ExecutionErrorKind, FeedbackKind, TestCase};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn grader() -> Grader {
        Grader::new(GraderConfig::default())
    }

    fn kinds(verdict: &codelab_common::types::Verdict) -> Vec<FeedbackKind> {
        verdict.feedback.iter().map(|e| e.kind).collect()
    }

    /// Test: Hello World matches and scores full marks
    #[tokio::test]
    async fn test_hello_world_passes() {
        let tests = vec![TestCase::new("t1").with_expected_output("Hello World")];
        let verdict = grader()
            .evaluate(r#"console.log("Hello World")"#, &tests)
            .await
            .unwrap();

        assert!(verdict.success);
        assert_eq!(verdict.score, 100);
        assert_eq!(kinds(&verdict), vec![FeedbackKind::Success]);
        assert_eq!(verdict.output, vec!["Hello World"]);
        assert_eq!((verdict.passed_count, verdict.total_count), (1, 1));
        assert!(verdict.diagnostics.is_empty());
    }

    /// Test: Duplicate declaration is flagged but the code still runs
    #[tokio::test]
    async fn test_duplicate_declaration_costs_forty() {
        let tests = vec![TestCase::new("t1")];
        let verdict = grader().evaluate("let x = 1; let x = 2;", &tests).await.unwrap();

        assert!(!verdict.success);
        assert_eq!(verdict.score, 60);
        assert!(!verdict.diagnostics.is_empty());
        assert!(verdict.errors.is_empty());
        assert_eq!(kinds(&verdict), vec![FeedbackKind::Error]);
    }

    /// Test: Uncaught error costs thirty and is quoted back
    #[tokio::test]
    async fn test_thrown_error_costs_thirty() {
        let tests = vec![TestCase::new("t1")];
        let verdict = grader()
            .evaluate(r#"throw new Error("boom")"#, &tests)
            .await
            .unwrap();

        assert!(verdict.diagnostics.is_empty());
        assert!(!verdict.success);
        assert_eq!(verdict.score, 70);
        assert_eq!(verdict.errors.len(), 1);
        assert_eq!(verdict.errors[0].message, "boom");
        assert_eq!(kinds(&verdict), vec![FeedbackKind::Error]);
        assert!(verdict.feedback[0].message.contains("boom"));
    }

    /// Test: Final expression is the return value
    #[tokio::test]
    async fn test_return_value_check() {
        let tests = vec![TestCase::new("t1").with_expected_return(json!(15))];
        let source = "function sum(values) {\n  return values.reduce((a, b) => a + b, 0)\n}\nsum([1, 2, 3, 4, 5])";
        let verdict = grader().evaluate(source, &tests).await.unwrap();

        assert_eq!(verdict.return_value, Some(json!(15)));
        assert_eq!(verdict.score, 100);
        assert_eq!(kinds(&verdict), vec![FeedbackKind::Success]);

        let wrong = vec![TestCase::new("t1").with_expected_return(json!(16))];
        let verdict = grader().evaluate(source, &wrong).await.unwrap();
        assert_eq!(verdict.score, 80);
        assert_eq!(kinds(&verdict), vec![FeedbackKind::Warning]);
        // Return mismatches do not fail the run
        assert!(verdict.success);
    }

    /// Test: Slow but correct code gets an informational note only
    #[tokio::test]
    async fn test_slow_run_adds_info() {
        let tests = vec![TestCase::new("t1").with_expected_output("done")];
        let verdict = grader()
            .evaluate("sleep(600)\nconsole.log('done')", &tests)
            .await
            .unwrap();

        assert!(verdict.success);
        assert_eq!(verdict.score, 100);
        assert!(verdict.elapsed_ms >= 600);
        assert_eq!(kinds(&verdict), vec![FeedbackKind::Success, FeedbackKind::Info]);
    }

    #[tokio::test]
    async fn test_blank_source_is_rejected() {
        let tests = vec![TestCase::new("t1"), TestCase::new("t2")];
        for source in ["", "   \n\t  "] {
            let verdict = grader().evaluate(source, &tests).await.unwrap();
            assert_eq!(verdict.score, 0);
            assert!(!verdict.success);
            assert_eq!(kinds(&verdict), vec![FeedbackKind::Error]);
            assert_eq!(verdict.passed_count, 0);
            assert_eq!(verdict.total_count, 2);
            assert_eq!(verdict.suggestions.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_no_test_cases_is_a_caller_error() {
        let result = grader().evaluate("console.log(1)", &[]).await;
        assert_eq!(result.unwrap_err(), GradeError::NoTestCases);
    }

    /// Test: Parse failure still executes but feedback is the syntax entry alone
    #[tokio::test]
    async fn test_unparseable_source() {
        let tests = vec![TestCase::new("t1").with_expected_output("hi")];
        let verdict = grader().evaluate("console.log('hi'", &tests).await.unwrap();

        assert!(!verdict.diagnostics.is_empty());
        assert_eq!(verdict.errors[0].kind, ExecutionErrorKind::Syntax);
        assert_eq!(kinds(&verdict), vec![FeedbackKind::Error]);
        assert!(verdict.score <= 60);
        assert_eq!(verdict.score, 10);
    }

    #[tokio::test]
    async fn test_type_checking_can_be_disabled() {
        let config = GraderConfig {
            enable_type_checking: false,
            ..GraderConfig::default()
        };
        let verdict = Grader::new(config)
            .evaluate("let x = 1; let x = 2;", &[TestCase::new("t1")])
            .await
            .unwrap();
        assert!(verdict.diagnostics.is_empty());
        assert_eq!(verdict.score, 100);
    }

    #[tokio::test]
    async fn test_only_first_test_case_is_evaluated() {
        let tests = vec![
            TestCase::new("t1").with_expected_output("a"),
            TestCase::new("t2").with_expected_output("b"),
        ];
        let verdict = grader().evaluate("console.log('a')", &tests).await.unwrap();
        assert!(verdict.success);
        assert_eq!((verdict.passed_count, verdict.total_count), (1, 2));
    }

    #[tokio::test]
    async fn test_repeat_evaluations_agree() {
        let tests = vec![TestCase::new("t1").with_expected_output("3")];
        let source = "const xs = [1, 2]\nconsole.log(xs[0] + xs[1])\nMath.random()";
        let g = grader();
        let mut first = g.evaluate(source, &tests).await.unwrap();
        let mut second = g.evaluate(source, &tests).await.unwrap();
        first.elapsed_ms = 0;
        second.elapsed_ms = 0;
        assert_eq!(first, second);
    }

    /// Test: A preemptible sleep past the limit settles near the limit
    #[tokio::test]
    async fn test_sleep_timeout_settles_near_limit() {
        let config = GraderConfig {
            max_execution_time_ms: 200,
            ..GraderConfig::default()
        };
        let started = Instant::now();
        let verdict = Grader::new(config)
            .evaluate("console.log('start')\nsleep(5000)", &[TestCase::new("t1")])
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_millis(2_000));
        assert!(!verdict.success);
        assert_eq!(verdict.errors[0].kind, ExecutionErrorKind::Timeout);
        assert!(verdict.errors[0].message.contains("time limit"));
        assert_eq!(verdict.output, vec!["start"]);
        assert_eq!(verdict.score, 70);
    }

    /// Test: Busy loops are stopped too
    #[tokio::test]
    async fn test_busy_loop_is_preempted() {
        let tests = vec![TestCase::new("t1").with_expected_output("never").with_timeout(150)];
        let started = Instant::now();
        let verdict = grader().evaluate("while (true) {}", &tests).await.unwrap();

        assert!(started.elapsed() < Duration::from_millis(2_000));
        assert_eq!(verdict.errors[0].kind, ExecutionErrorKind::Timeout);
        assert_eq!(verdict.score, 50);
        assert_eq!(kinds(&verdict), vec![FeedbackKind::Error]);
    }

    #[tokio::test]
    async fn test_restricted_override_blocks_sleep() {
        let overrides = ConfigOverrides {
            sandbox_mode: Some(SandboxMode::Restricted),
            ..Default::default()
        };
        let verdict = grader()
            .evaluate_with("sleep(10)", &[TestCase::new("t1")], &overrides)
            .await
            .unwrap();
        assert_eq!(verdict.errors[0].kind, ExecutionErrorKind::Runtime);
        assert!(verdict.errors[0].message.contains("restricted"));
    }

    #[tokio::test]
    async fn test_overall_timeout_rejects() {
        let config = GraderConfig {
            timeout_ms: 100,
            max_execution_time_ms: 5_000,
            ..GraderConfig::default()
        };
        let verdict = Grader::new(config)
            .evaluate("sleep(3000)", &[TestCase::new("t1")])
            .await
            .unwrap();
        assert_eq!(verdict.score, 0);
        assert!(verdict.feedback[0].message.contains("100 ms"));
    }

    #[tokio::test]
    async fn test_state_flags_track_evaluation() {
        let g = Arc::new(grader());
        assert!(!g.in_progress());
        assert!(g.last_verdict().is_none());

        let worker = {
            let g = Arc::clone(&g);
            tokio::spawn(async move {
                g.evaluate("sleep(300)\nconsole.log('ok')", &[TestCase::new("t1")])
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(g.in_progress());

        let verdict = worker.await.unwrap().unwrap();
        assert!(!g.in_progress());
        assert_eq!(g.last_verdict(), Some(verdict));
    }

    /// Test: Overlapping calls on clones of one grader run one after another
    #[tokio::test]
    async fn test_overlapping_evaluations_are_serialized() {
        let g = grader();
        let first = {
            let g = g.clone();
            tokio::spawn(async move {
                g.evaluate(
                    "console.log('first 1')\nsleep(300)\nconsole.log('first 2')",
                    &[TestCase::new("t1")],
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(g.in_progress());

        let started = Instant::now();
        let second = g
            .clone()
            .evaluate("console.log('second')", &[TestCase::new("t1")])
            .await
            .unwrap();
        let waited = started.elapsed();
        let first = first.await.unwrap().unwrap();

        assert_eq!(first.output, vec!["first 1", "first 2"]);
        assert_eq!(second.output, vec!["second"]);
        assert!(waited >= Duration::from_millis(200), "second run started after {:?}", waited);
        assert_eq!(g.last_verdict(), Some(second));
    }

    fn exploding_check(_source: &str) -> Vec<Diagnostic> {
        panic!("checker blew up");
    }

    /// Test: A panicking stage becomes a zero-score verdict, not an error
    #[tokio::test]
    async fn test_stage_panic_becomes_evaluation_error() {
        let g = grader().with_checker(exploding_check);
        let verdict = g
            .evaluate("console.log('hi')", &[TestCase::new("t1"), TestCase::new("t2")])
            .await
            .unwrap();

        assert!(!verdict.success);
        assert_eq!(verdict.score, 0);
        assert_eq!(kinds(&verdict), vec![FeedbackKind::Error]);
        assert!(verdict.feedback[0].message.contains("evaluation error"));
        assert_eq!(verdict.total_count, 2);
        assert!(!g.in_progress());
        assert_eq!(g.last_verdict(), Some(verdict));
    }

    #[tokio::test]
    async fn test_long_operator_chain_gets_a_verdict() {
        let source = "1".to_owned() + &"+1".repeat(120_000);
        assert!(source.len() <= MAX_SOURCE_BYTES);
        let verdict = grader().evaluate(&source, &[TestCase::new("t1")]).await.unwrap();

        assert!(!verdict.success);
        assert!(verdict.score <= 60);
        assert_eq!(verdict.diagnostics[0].message, "Code is nested too deeply");
        assert_eq!(verdict.errors[0].kind, ExecutionErrorKind::Syntax);
    }

    #[tokio::test]
    async fn test_deeply_nested_array_gets_a_verdict() {
        let source = "let a = []
for (let i = 0; i < 200000; i++) a = [a]
a.length";
        let verdict = grader().evaluate(source, &[TestCase::new("t1")]).await.unwrap();

        assert!(verdict.success);
        assert_eq!(verdict.return_value, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_oversized_source_is_rejected_before_parsing() {
        let source = format!("let x = 1\n{}", "(".repeat(MAX_SOURCE_BYTES));
        let g = grader();
        let verdict = g.evaluate(&source, &[TestCase::new("t1")]).await.unwrap();

        assert_eq!(verdict.score, 0);
        assert!(verdict.diagnostics.is_empty());
        assert!(verdict.feedback[0].message.contains("too large"));
        assert!(!g.in_progress());
    }

    trait TimeoutExt {
        fn with_timeout(self, ms: u64) -> Self;
    }

    impl TimeoutExt for TestCase {
        fn with_timeout(mut self, ms: u64) -> Self {
            self.timeout_ms = ms;
            self
        }
    }
}
