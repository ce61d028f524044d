/// Verdict Evaluator - Comparison, Scoring and Feedback
///
/// **Core Responsibility:**
/// Turn diagnostics, an execution outcome and the active test case into a
/// comparison, a 0-100 score and an ordered list of learner feedback.
///
/// **Critical Properties:**
/// - Knows nothing about the interpreter
/// - Knows nothing about timeouts or threads
/// - Pure functions: same inputs always give the same verdict parts
///
/// **Scoring Rules:**
/// - Start at 100
/// - Any diagnostic: -40
/// - Execution error: -30
/// - Declared expected output not matched: -20
/// - Declared expected return value not equal: -20
/// - Penalties are additive; the result never goes below 0
///
/// **Normalization Rules:**
/// - Actual lines joined with `\n`
/// - Literal `\n` sequences in the expected text become real newlines
/// - Leading and trailing whitespace trimmed on both sides
/// - Case sensitive, internal whitespace preserved

use codelab_common::types::{
    Comparison, Diagnostic, ExecutionOutcome, FeedbackEntry, FeedbackKind, TestCase,
};
use serde_json::Value;

const DIAGNOSTIC_PENALTY: u8 = 40;
const EXECUTION_ERROR_PENALTY: u8 = 30;
const OUTPUT_MISMATCH_PENALTY: u8 = 20;
const RETURN_MISMATCH_PENALTY: u8 = 20;

/// Runs slower than this get an informational note (not penalized)
pub const SLOW_EXECUTION_MS: u64 = 500;

fn normalize_expected(expected: &str) -> String {
    expected.replace("\\n", "\n").trim().to_string()
}

fn normalize_actual(lines: &[String]) -> String {
    lines.join("\n").trim().to_string()
}

pub fn compare(expected: &str, actual_lines: &[String]) -> Comparison {
    let expected_normalized = normalize_expected(expected);
    let actual_normalized = normalize_actual(actual_lines);
    let matches = expected_normalized == actual_normalized;
    Comparison {
        expected_normalized,
        actual_normalized,
        matches,
    }
}

/// Comparison used when the test case declares no expected output
pub fn trivial_comparison() -> Comparison {
    Comparison {
        expected_normalized: String::new(),
        actual_normalized: String::new(),
        matches: true,
    }
}

/// Strict equality of return values
///
/// Numbers compare by value so `15` and `15.0` agree; everything else must be
/// structurally identical (same type, same keys, same order of elements).
/// An `undefined` completion never equals a declared value, not even `null`.
pub fn return_values_equal(actual: Option<&Value>, expected: &Value) -> bool {
    actual.map_or(false, |actual| values_equal(actual, expected))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xm), Value::Object(ym)) => {
            xm.len() == ym.len()
                && xm
                    .iter()
                    .all(|(k, x)| ym.get(k).map_or(false, |y| values_equal(x, y)))
        }
        _ => a == b,
    }
}

fn return_value_matches(outcome: &ExecutionOutcome, test_case: &TestCase) -> Option<bool> {
    test_case
        .expected_return_value
        .as_ref()
        .map(|expected| return_values_equal(outcome.return_value.as_ref(), expected))
}

pub fn score(
    diagnostics: &[Diagnostic],
    outcome: &ExecutionOutcome,
    comparison: &Comparison,
    test_case: &TestCase,
) -> u8 {
    let mut penalty: u32 = 0;
    if !diagnostics.is_empty() {
        penalty += DIAGNOSTIC_PENALTY as u32;
    }
    if outcome.error.is_some() {
        penalty += EXECUTION_ERROR_PENALTY as u32;
    }
    if test_case.expected_output.is_some() && !comparison.matches {
        penalty += OUTPUT_MISMATCH_PENALTY as u32;
    }
    if return_value_matches(outcome, test_case) == Some(false) {
        penalty += RETURN_MISMATCH_PENALTY as u32;
    }
    100u32.saturating_sub(penalty) as u8
}

/// Which branch of feedback applies, decided in priority order
#[derive(Debug, Clone, PartialEq)]
pub enum FeedbackPlan {
    SyntaxFailure { line: Option<u32> },
    RuntimeFailure { message: String },
    ChecksPassed(Vec<CheckNote>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckNote {
    OutputMatched,
    OutputMismatch { expected: String, actual: String },
    ReturnMatched { value: String },
    ReturnMismatch { expected: String, actual: String },
    Slow { elapsed_ms: u64 },
}

pub fn plan(
    diagnostics: &[Diagnostic],
    outcome: &ExecutionOutcome,
    comparison: &Comparison,
    test_case: &TestCase,
) -> FeedbackPlan {
    if !diagnostics.is_empty() {
        let line = diagnostics
            .iter()
            .find(|d| d.severity == codelab_common::types::Severity::Error)
            .or_else(|| diagnostics.first())
            .map(|d| d.line);
        return FeedbackPlan::SyntaxFailure { line };
    }

    if let Some(error) = &outcome.error {
        return FeedbackPlan::RuntimeFailure {
            message: error.message.clone(),
        };
    }

    let mut notes = Vec::new();
    if test_case.expected_output.is_some() {
        if comparison.matches {
            notes.push(CheckNote::OutputMatched);
        } else {
            notes.push(CheckNote::OutputMismatch {
                expected: comparison.expected_normalized.clone(),
                actual: comparison.actual_normalized.clone(),
            });
        }
    }
    if let Some(expected) = &test_case.expected_return_value {
        let actual = render_value(outcome.return_value.as_ref());
        if return_values_equal(outcome.return_value.as_ref(), expected) {
            notes.push(CheckNote::ReturnMatched { value: actual });
        } else {
            notes.push(CheckNote::ReturnMismatch {
                expected: render_value(Some(expected)),
                actual,
            });
        }
    }
    if outcome.elapsed_ms > SLOW_EXECUTION_MS {
        notes.push(CheckNote::Slow {
            elapsed_ms: outcome.elapsed_ms,
        });
    }
    FeedbackPlan::ChecksPassed(notes)
}

fn render_value(value: Option<&Value>) -> String {
    match value {
        None => "undefined".to_string(),
        Some(v) => v.to_string(),
    }
}

impl FeedbackPlan {
    pub fn render(self) -> Vec<FeedbackEntry> {
        match self {
            FeedbackPlan::SyntaxFailure { line } => {
                let entry = FeedbackEntry::new(
                    FeedbackKind::Error,
                    "Your code has syntax errors or problematic patterns. Fix them before it can be checked.",
                )
                .with_suggestion("Review the highlighted lines for typos, missing brackets and repeated declarations.");
                vec![match line {
                    Some(line) => entry.at_line(line),
                    None => entry,
                }]
            }
            FeedbackPlan::RuntimeFailure { message } => vec![FeedbackEntry::new(
                FeedbackKind::Error,
                format!("Your code raised an error while running: {}", message),
            )
            .with_suggestion("Check the values your code works with at the point where it failed.")],
            FeedbackPlan::ChecksPassed(notes) => notes.into_iter().map(CheckNote::render).collect(),
        }
    }
}

impl CheckNote {
    fn render(self) -> FeedbackEntry {
        match self {
            CheckNote::OutputMatched => {
                FeedbackEntry::new(FeedbackKind::Success, "Output matches the expected result.")
            }
            CheckNote::OutputMismatch { expected, actual } => FeedbackEntry::new(
                FeedbackKind::Warning,
                format!(
                    "Output does not match. Expected: \"{}\" but got: \"{}\"",
                    expected, actual
                ),
            )
            .with_suggestion("Compare your console output with the expected output line by line."),
            CheckNote::ReturnMatched { value } => FeedbackEntry::new(
                FeedbackKind::Success,
                format!("Return value {} is correct.", value),
            ),
            CheckNote::ReturnMismatch { expected, actual } => FeedbackEntry::new(
                FeedbackKind::Warning,
                format!("Expected return value {} but got {}", expected, actual),
            )
            .with_suggestion("Make sure the last expression of your code produces the requested value."),
            CheckNote::Slow { elapsed_ms } => FeedbackEntry::new(
                FeedbackKind::Info,
                format!("Your code took {}ms to run.", elapsed_ms),
            )
            .with_suggestion("Look for loops that repeat more work than they need to."),
        }
    }
}

pub fn feedback(
    diagnostics: &[Diagnostic],
    outcome: &ExecutionOutcome,
    comparison: &Comparison,
    test_case: &TestCase,
) -> Vec<FeedbackEntry> {
    plan(diagnostics, outcome, comparison, test_case).render()
}

#[cfg(test)]
mod tests {
    use super::*;
    use codelab_common::types::{ExecutionError, ExecutionErrorKind};
    use serde_json::json;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn ok_outcome(output: &[&str], return_value: Option<Value>, elapsed_ms: u64) -> ExecutionOutcome {
        ExecutionOutcome::succeeded(lines(output), return_value, elapsed_ms)
    }

    fn failed_outcome(message: &str) -> ExecutionOutcome {
        ExecutionOutcome::failed(
            vec![],
            ExecutionError::new(ExecutionErrorKind::Runtime, message),
            2,
        )
    }

    #[test]
    fn test_compare_trims_and_joins() {
        let c = compare("  Hello\\nWorld \n", &lines(&["Hello", "World", ""]));
        assert!(c.matches);
        assert_eq!(c.expected_normalized, "Hello\nWorld");
        assert_eq!(c.actual_normalized, "Hello\nWorld");
    }

    #[test]
    fn test_compare_is_case_and_space_sensitive() {
        assert!(!compare("hello world", &lines(&["Hello world"])).matches);
        assert!(!compare("a  b", &lines(&["a b"])).matches);
        assert!(compare("", &[]).matches);
    }

    #[test]
    fn test_score_penalties_are_additive() {
        let tc = TestCase::new("t")
            .with_expected_output("x")
            .with_expected_return(json!(1));
        let diagnostics = vec![Diagnostic::warning("w", 1, 1)];
        let outcome = failed_outcome("boom");
        let comparison = compare("x", &[]);

        assert_eq!(score(&diagnostics, &outcome, &comparison, &tc), 0);
        assert_eq!(score(&[], &outcome, &comparison, &tc), 30);
        assert_eq!(score(&[], &ok_outcome(&["x"], Some(json!(1)), 1), &compare("x", &lines(&["x"])), &tc), 100);
    }

    #[test]
    fn test_undeclared_expectations_are_not_scored() {
        let tc = TestCase::new("t");
        let outcome = ok_outcome(&["anything"], Some(json!("value")), 1);
        assert_eq!(score(&[], &outcome, &trivial_comparison(), &tc), 100);
        assert!(feedback(&[], &outcome, &trivial_comparison(), &tc).is_empty());
    }

    #[test]
    fn test_return_value_equality() {
        assert!(return_values_equal(Some(&json!(15)), &json!(15.0)));
        assert!(return_values_equal(Some(&json!({"a": [1, 2]})), &json!({"a": [1, 2]})));
        assert!(!return_values_equal(Some(&json!("15")), &json!(15)));
        assert!(!return_values_equal(None, &json!(null)));
        assert!(!return_values_equal(Some(&json!([1, 2])), &json!([2, 1])));
    }

    #[test]
    fn test_diagnostics_short_circuit_feedback() {
        let tc = TestCase::new("t").with_expected_output("Hello");
        let diagnostics = vec![Diagnostic::error("Unexpected token ')'", 3, 7)];
        let entries = feedback(&diagnostics, &failed_outcome("boom"), &compare("Hello", &[]), &tc);

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, FeedbackKind::Error);
        assert_eq!(entries[0].line, Some(3));
        assert!(entries[0].suggestion.is_some());
    }

    #[test]
    fn test_runtime_error_quotes_message() {
        let tc = TestCase::new("t").with_expected_output("Hello");
        let entries = feedback(&[], &failed_outcome("boom"), &compare("Hello", &[]), &tc);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].message.contains("boom"));
    }

    #[test]
    fn test_checks_in_fixed_order() {
        let tc = TestCase::new("t")
            .with_expected_output("Hello")
            .with_expected_return(json!(15));
        let outcome = ok_outcome(&["Bye"], Some(json!(15)), 750);
        let comparison = compare("Hello", &outcome.captured_output);
        let kinds: Vec<_> = feedback(&[], &outcome, &comparison, &tc)
            .into_iter()
            .map(|e| e.kind)
            .collect();

        assert_eq!(
            kinds,
            vec![FeedbackKind::Warning, FeedbackKind::Success, FeedbackKind::Info]
        );
    }

    #[test]
    fn test_mismatch_shows_both_sides() {
        let tc = TestCase::new("t").with_expected_output("Hello");
        let outcome = ok_outcome(&["Bye"], None, 1);
        let entries = feedback(&[], &outcome, &compare("Hello", &outcome.captured_output), &tc);
        assert!(entries[0].message.contains("\"Hello\""));
        assert!(entries[0].message.contains("\"Bye\""));
    }

    #[test]
    fn test_slow_threshold_is_exclusive() {
        let tc = TestCase::new("t");
        let at = ok_outcome(&[], None, SLOW_EXECUTION_MS);
        let over = ok_outcome(&[], None, SLOW_EXECUTION_MS + 1);
        assert!(feedback(&[], &at, &trivial_comparison(), &tc).is_empty());
        assert_eq!(
            plan(&[], &over, &trivial_comparison(), &tc),
            FeedbackPlan::ChecksPassed(vec![CheckNote::Slow { elapsed_ms: 501 }])
        );
    }
}
