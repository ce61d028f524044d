/// Static Pattern Checker
///
/// **Responsibility:**
/// Inspect learner source without running it and report diagnostics.
///
/// **Stages:**
/// 1. Parse the source as a function body. A parse failure becomes exactly
///    one `error` diagnostic at the position the parser stopped.
/// 2. Run the fixed, ordered anti-pattern rules over the raw text. Each rule
///    that fires adds one `warning`. Rules run whether or not parsing worked.
///
/// Never fails: a rule whose pattern cannot be built is skipped.

use std::collections::HashSet;

use codelab_common::types::Diagnostic;
use regex::Regex;
use tracing::debug;

use crate::script;

const DECLARATION: &str = r"\b(let|const|var)\s+([A-Za-z_$][\w$]*)\s*=";
const EMPTY_FUNCTION: &str = r"(\bfunction\b\s*[\w$]*\s*\([^)]*\)|=>)\s*\{\s*\}";

/// One heuristic scan; `find` returns the byte offset of the first hit
struct Rule {
    name: &'static str,
    message: &'static str,
    find: fn(&str) -> Option<usize>,
}

const RULES: &[Rule] = &[
    Rule {
        name: "duplicate-declaration",
        message: "Duplicate variable declaration detected; each name should be declared once",
        find: find_duplicate_declaration,
    },
    Rule {
        name: "const-reassignment",
        message: "A variable declared with const appears to be reassigned",
        find: find_const_reassignment,
    },
    Rule {
        name: "empty-function",
        message: "Empty function body detected",
        find: find_empty_function,
    },
];

pub fn check(source: &str) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    if let Err(e) = script::parse_program(source) {
        debug!(line = e.line, column = e.column, "Source failed to parse");
        diagnostics.push(Diagnostic::error(e.message, e.line, e.column));
    }

    for rule in RULES {
        if let Some(offset) = (rule.find)(source) {
            let (line, column) = line_col(source, offset);
            debug!(rule = rule.name, line, column, "Pattern rule fired");
            diagnostics.push(Diagnostic::warning(rule.message, line, column));
        }
    }

    diagnostics
}

fn line_col(source: &str, offset: usize) -> (u32, u32) {
    let before = &source[..offset];
    let line = before.matches('\n').count() + 1;
    let column = before.rsplit('\n').next().map(|l| l.chars().count()).unwrap_or(0) + 1;
    (line as u32, column as u32)
}

fn find_duplicate_declaration(source: &str) -> Option<usize> {
    let re = match Regex::new(DECLARATION) {
        Ok(re) => re,
        Err(_) => return None,
    };
    let mut seen = HashSet::new();
    for caps in re.captures_iter(source) {
        let name = caps.get(2)?;
        if !seen.insert(name.as_str()) {
            return caps.get(0).map(|m| m.start());
        }
    }
    None
}

fn find_const_reassignment(source: &str) -> Option<usize> {
    let declarations = match Regex::new(DECLARATION) {
        Ok(re) => re,
        Err(_) => return None,
    };
    for caps in declarations.captures_iter(source) {
        if caps.get(1).map(|m| m.as_str()) != Some("const") {
            continue;
        }
        let (Some(name), Some(whole)) = (caps.get(2), caps.get(0)) else {
            continue;
        };
        let name = regex::escape(name.as_str());
        let pattern = format!(
            r"(^|[^\w$.])({name}\s*(\*\*|&&|\|\||\?\?|[-+*/%&|^])?=([^=>]|$)|{name}\s*(\+\+|--)|(\+\+|--)\s*{name}\b)",
            name = name
        );
        let reassignment = match Regex::new(&pattern) {
            Ok(re) => re,
            Err(_) => continue,
        };
        let rest = &source[whole.end()..];
        if let Some(hit) = reassignment.captures(rest).and_then(|c| c.get(2)) {
            return Some(whole.end() + hit.start());
        }
    }
    None
}

fn find_empty_function(source: &str) -> Option<usize> {
    match Regex::new(EMPTY_FUNCTION) {
        Ok(re) => re.find(source).map(|m| m.start()),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codelab_common::types::Severity;

    fn warnings(source: &str) -> Vec<String> {
        check(source)
            .into_iter()
            .filter(|d| d.severity == Severity::Warning)
            .map(|d| d.message)
            .collect()
    }

    #[test]
    fn test_clean_source_has_no_diagnostics() {
        assert!(check(r#"console.log("Hello World")"#).is_empty());
        assert!(check("const total = [1, 2].reduce((a, b) => a + b, 0)\ntotal").is_empty());
    }

    #[test]
    fn test_parse_failure_is_one_positioned_error() {
        let diagnostics = check("let x = 1\nconsole.log(x");
        let errors: Vec<_> = diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line, 2);
        assert_eq!(errors[0].message, "Unexpected end of input");
    }

    #[test]
    fn test_duplicate_declaration_warns_once() {
        let diagnostics = check("let x = 1; let x = 2;");
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].severity, Severity::Warning);
        assert_eq!((diagnostics[0].line, diagnostics[0].column), (1, 12));
    }

    #[test]
    fn test_const_reassignment_variants() {
        assert_eq!(warnings("const limit = 3\nlimit = 4").len(), 1);
        assert_eq!(warnings("const n = 1\nn += 2").len(), 1);
        assert_eq!(warnings("const n = 1\nn++").len(), 1);
        assert!(warnings("const n = 1\nif (n === 1) {}").is_empty());
        assert!(warnings("const n = 1\nconst f = (n) => n").is_empty());
        assert!(warnings("const obj = {}\nobj.limit = 4").is_empty());
    }

    #[test]
    fn test_empty_function_forms() {
        assert_eq!(warnings("function noop() {}"), vec!["Empty function body detected"]);
        assert_eq!(warnings("const f = () => { }").len(), 1);
        assert!(warnings("function f() { return 1 }").is_empty());
    }

    #[test]
    fn test_rules_are_independent_and_ordered() {
        let messages = warnings("const a = 1\nconst a = 2\na = 3\nfunction f() {}");
        assert_eq!(messages.len(), 3);
        assert!(messages[0].starts_with("Duplicate"));
        assert!(messages[1].contains("const"));
        assert_eq!(messages[2], "Empty function body detected");
    }

    #[test]
    fn test_rules_still_run_on_unparseable_source() {
        let diagnostics = check("let x = 1; let x = 2; )");
        assert_eq!(diagnostics[0].severity, Severity::Error);
        assert_eq!(diagnostics[1].severity, Severity::Warning);
    }
}
