use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ConfigOverrides;

/// A single declared test case for an exercise
///
/// Supplied by lesson content. Either expectation may be absent, in which
/// case that check is skipped entirely (neither scored nor reported).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_return_value: Option<Value>,
    /// Per-test ceiling in milliseconds; 0 means "use the grader config"
    #[serde(default)]
    pub timeout_ms: u64,
}

impl TestCase {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            expected_output: None,
            expected_return_value: None,
            timeout_ms: 0,
        }
    }

    pub fn with_expected_output(mut self, expected: impl Into<String>) -> Self {
        self.expected_output = Some(expected.into());
        self
    }

    pub fn with_expected_return(mut self, expected: Value) -> Self {
        self.expected_return_value = Some(expected);
        self
    }
}

/// Exercise envelope accepted from the lesson-content provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exercise {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub config: Option<ConfigOverrides>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// Static finding about source text, produced without running it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub message: String,
    pub line: u32,
    pub column: u32,
    pub severity: Severity,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            message: message.into(),
            line,
            column,
            severity: Severity::Error,
        }
    }

    pub fn warning(message: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            message: message.into(),
            line,
            column,
            severity: Severity::Warning,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionErrorKind {
    /// Source could not be parsed
    Syntax,
    /// Source threw (or the interpreter raised) an error while running
    Runtime,
    /// Execution exceeded its wall-clock ceiling
    Timeout,
    /// Defect in the sandbox itself
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ExecutionError {
    pub fn new(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ExecutionErrorKind::Timeout
    }
}

/// Settled result of one sandboxed run
///
/// `success` is true exactly when `error` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub captured_output: Vec<String>,
    /// `None` when the program's completion value was `undefined`
    pub return_value: Option<Value>,
    pub error: Option<ExecutionError>,
    pub elapsed_ms: u64,
}

impl ExecutionOutcome {
    pub fn succeeded(captured_output: Vec<String>, return_value: Option<Value>, elapsed_ms: u64) -> Self {
        Self {
            success: true,
            captured_output,
            return_value,
            error: None,
            elapsed_ms,
        }
    }

    pub fn failed(captured_output: Vec<String>, error: ExecutionError, elapsed_ms: u64) -> Self {
        Self {
            success: false,
            captured_output,
            return_value: None,
            error: Some(error),
            elapsed_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comparison {
    pub expected_normalized: String,
    pub actual_normalized: String,
    pub matches: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackKind {
    Success,
    Warning,
    Error,
    Info,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub kind: FeedbackKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl FeedbackEntry {
    pub fn new(kind: FeedbackKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            suggestion: None,
            line: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn at_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }
}

/// Aggregate result of one evaluation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub success: bool,
    pub score: u8,
    pub diagnostics: Vec<Diagnostic>,
    pub errors: Vec<ExecutionError>,
    pub comparison: Comparison,
    pub feedback: Vec<FeedbackEntry>,
    pub suggestions: Vec<String>,
    pub output: Vec<String>,
    pub return_value: Option<Value>,
    pub elapsed_ms: u64,
    pub passed_count: u32,
    pub total_count: u32,
}

impl Verdict {
    /// Zero-score verdict carrying a single error entry
    pub fn rejected(entry: FeedbackEntry, total_count: u32) -> Self {
        let suggestions = entry.suggestion.iter().cloned().collect();
        Self {
            success: false,
            score: 0,
            diagnostics: Vec::new(),
            errors: Vec::new(),
            comparison: Comparison {
                expected_normalized: String::new(),
                actual_normalized: String::new(),
                matches: false,
            },
            feedback: vec![entry],
            suggestions,
            output: Vec::new(),
            return_value: None,
            elapsed_ms: 0,
            passed_count: 0,
            total_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_case_deserializes_with_defaults() {
        let tc: TestCase = serde_json::from_value(json!({
            "id": "t1",
            "expected_output": "Hello World"
        }))
        .unwrap();

        assert_eq!(tc.id, "t1");
        assert_eq!(tc.expected_output.as_deref(), Some("Hello World"));
        assert!(tc.expected_return_value.is_none());
        assert_eq!(tc.timeout_ms, 0);
    }

    #[test]
    fn test_severity_serializes_lowercase() {
        let d = Diagnostic::warning("careful", 2, 4);
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v["severity"], "warning");
    }

    #[test]
    fn test_rejected_verdict_copies_suggestion() {
        let entry = FeedbackEntry::new(FeedbackKind::Error, "No code to evaluate")
            .with_suggestion("Write some code first");
        let verdict = Verdict::rejected(entry, 3);

        assert_eq!(verdict.score, 0);
        assert!(!verdict.success);
        assert_eq!(verdict.suggestions, vec!["Write some code first".to_string()]);
        assert_eq!(verdict.total_count, 3);
        assert_eq!(verdict.passed_count, 0);
    }

    #[test]
    fn test_outcome_constructors_keep_invariant() {
        let ok = ExecutionOutcome::succeeded(vec![], None, 3);
        assert!(ok.success && ok.error.is_none());

        let err = ExecutionOutcome::failed(
            vec!["partial".into()],
            ExecutionError::new(ExecutionErrorKind::Timeout, "too slow"),
            10,
        );
        assert!(!err.success);
        assert!(err.error.as_ref().unwrap().is_timeout());
    }
}
