// CLI commands for grading submissions locally
use anyhow::{bail, Context, Result};
use codelab_common::types::{Diagnostic, Exercise, FeedbackKind, Severity, Verdict};
use codelab_engine::config::ConfigLoader;
use codelab_engine::{checker, Grader};
use std::fs;
use std::path::Path;

/// Load an exercise definition
fn load_exercise(path: &Path) -> Result<Exercise> {
    if !path.exists() {
        bail!("Exercise file not found: {}", path.display());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn read_source(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read source file {}", path.display()))
}

/// Evaluate `file` against `exercise`; returns whether the submission passed
pub async fn run_exercise(
    file: &Path,
    exercise: &Path,
    config: Option<&Path>,
    json: bool,
) -> Result<bool> {
    let source = read_source(file)?;
    let exercise = load_exercise(exercise)?;

    let base = match config {
        Some(path) => ConfigLoader::load(path)?,
        None => ConfigLoader::load_default()?,
    };
    let grader = Grader::new(ConfigLoader::apply_env(base)?);
    let overrides = exercise.config.clone().unwrap_or_default();

    let verdict = grader
        .evaluate_with(&source, &exercise.test_cases, &overrides)
        .await
        .with_context(|| format!("Cannot evaluate exercise '{}'", exercise.id))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&verdict)?);
    } else {
        let title = if exercise.title.is_empty() {
            &exercise.id
        } else {
            &exercise.title
        };
        println!("→ {}", title);
        print!("{}", render_verdict(&verdict));
    }

    Ok(verdict.success)
}

/// Run the static checker only; returns whether the source is clean
pub fn check_file(file: &Path) -> Result<bool> {
    let source = read_source(file)?;
    let diagnostics = checker::check(&source);

    if diagnostics.is_empty() {
        println!("✓ No issues found in {}", file.display());
    } else {
        for d in &diagnostics {
            println!("{}", render_diagnostic(file, d));
        }
    }
    Ok(diagnostics.is_empty())
}

fn render_diagnostic(file: &Path, d: &Diagnostic) -> String {
    let severity = match d.severity {
        Severity::Error => "error",
        Severity::Warning => "warning",
        Severity::Info => "info",
    };
    format!("{}:{}:{}: {}: {}", file.display(), d.line, d.column, severity, d.message)
}

fn render_verdict(verdict: &Verdict) -> String {
    let mut out = String::new();
    let status = if verdict.success { "PASSED" } else { "FAILED" };
    out.push_str(&format!(
        "  {} - score {}/100 ({}/{} tests, {}ms)\n",
        status, verdict.score, verdict.passed_count, verdict.total_count, verdict.elapsed_ms
    ));

    if !verdict.output.is_empty() {
        out.push_str("  Output:\n");
        for line in &verdict.output {
            out.push_str(&format!("    | {}\n", line));
        }
    }

    for entry in &verdict.feedback {
        let marker = match entry.kind {
            FeedbackKind::Success => "✓",
            FeedbackKind::Warning => "⚠",
            FeedbackKind::Error => "✗",
            FeedbackKind::Info => "ℹ",
        };
        match entry.line {
            Some(line) => out.push_str(&format!("  {} {} (line {})\n", marker, entry.message, line)),
            None => out.push_str(&format!("  {} {}\n", marker, entry.message)),
        }
        if let Some(suggestion) = &entry.suggestion {
            out.push_str(&format!("    → {}\n", suggestion));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use codelab_common::types::{FeedbackEntry, TestCase};

    #[test]
    fn test_render_failed_verdict() {
        let mut verdict = Verdict::rejected(
            FeedbackEntry::new(FeedbackKind::Error, "No code to evaluate")
                .with_suggestion("Write something"),
            2,
        );
        verdict.output = vec!["hi".to_string()];

        let text = render_verdict(&verdict);
        assert!(text.contains("FAILED - score 0/100 (0/2 tests"));
        assert!(text.contains("    | hi"));
        assert!(text.contains("✗ No code to evaluate"));
        assert!(text.contains("→ Write something"));
    }

    #[test]
    fn test_render_diagnostic_location() {
        let d = Diagnostic::warning("Empty function body detected", 3, 1);
        assert_eq!(
            render_diagnostic(Path::new("main.js"), &d),
            "main.js:3:1: warning: Empty function body detected"
        );
    }

    #[tokio::test]
    async fn test_run_exercise_from_files() {
        let dir = std::env::temp_dir().join(format!("codelab-cli-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let source = dir.join("hello.js");
        let exercise = dir.join("exercise.json");
        fs::write(&source, "console.log('Hello World')").unwrap();
        let ex = Exercise {
            id: "hello".into(),
            title: "Hello".into(),
            test_cases: vec![TestCase::new("t1").with_expected_output("Hello World")],
            config: None,
        };
        fs::write(&exercise, serde_json::to_string(&ex).unwrap()).unwrap();

        let passed = run_exercise(&source, &exercise, None, true).await.unwrap();
        fs::remove_dir_all(&dir).ok();
        assert!(passed);
    }

    #[test]
    fn test_missing_exercise_is_an_error() {
        assert!(load_exercise(Path::new("nope/exercise.json")).is_err());
    }
}
