//! Learner-script interpreter
//!
//! A tree-walking evaluator for the JavaScript subset used in lessons. Each
//! run owns its scopes, its console and its budget; nothing is shared with
//! other runs or with the host beyond the console handle.

mod ast;
mod builtins;
mod console;
mod env;
mod error;
mod interp;
mod lexer;
mod parser;
mod value;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use console::{Console, ConsoleLevel};
pub use error::ParseError;
pub use interp::{HaltReason, Limits};
pub use parser::parse_program;

use interp::{Budget, Interpreter, Interrupt};
use value::{ObjectClass, Value};

pub struct RunOptions {
    pub limits: Limits,
    pub deadline: Instant,
    /// Raised by the host to stop the run at the next budget check
    pub cancel: Arc<AtomicBool>,
}

impl RunOptions {
    pub fn new(limits: Limits, time_limit: Duration) -> Self {
        Self {
            limits,
            deadline: Instant::now() + time_limit,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptFailure {
    Syntax(ParseError),
    /// Uncaught learner-visible throw
    Thrown {
        message: String,
        stack: Option<String>,
    },
    Halted(HaltReason),
}

/// Parses and runs `source`, returning its completion value as JSON
///
/// `Ok(None)` means the program completed with `undefined`.
pub fn run(
    source: &str,
    options: RunOptions,
    console: Console,
) -> Result<Option<serde_json::Value>, ScriptFailure> {
    let program = parse_program(source).map_err(ScriptFailure::Syntax)?;
    let budget = Budget::new(options.deadline, options.cancel, options.limits);
    let mut interp = Interpreter::new(budget, console);
    match interp.run(&program) {
        Ok(value) => Ok(value.to_host()),
        Err(Interrupt::Halt(reason)) => Err(ScriptFailure::Halted(reason)),
        Err(Interrupt::Throw(thrown)) => Err(describe_throw(&thrown)),
    }
}

fn describe_throw(thrown: &Value) -> ScriptFailure {
    if let Value::Object(obj) = thrown {
        let obj = obj.borrow();
        if obj.class == ObjectClass::Error {
            return ScriptFailure::Thrown {
                message: obj.get("message").map(|m| m.to_display()).unwrap_or_default(),
                stack: obj.get("stack").map(|s| s.to_display()),
            };
        }
    }
    ScriptFailure::Thrown {
        message: thrown.inspect(),
        stack: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn quick(source: &str) -> Result<Option<serde_json::Value>, ScriptFailure> {
        run(
            source,
            RunOptions::new(Limits::standard(), Duration::from_secs(5)),
            Console::new(true, 50),
        )
    }

    #[test]
    fn test_completion_value_becomes_json() {
        assert_eq!(quick("const x = 5; x * 3").unwrap(), Some(json!(15)));
        assert_eq!(quick("({ a: [1, 'b'] })").unwrap(), Some(json!({ "a": [1, "b"] })));
        assert_eq!(quick("let y = 1").unwrap(), None);
    }

    #[test]
    fn test_error_objects_keep_message_and_stack() {
        match quick("throw new Error('boom')") {
            Err(ScriptFailure::Thrown { message, stack }) => {
                assert_eq!(message, "boom");
                assert_eq!(stack.as_deref(), Some("Error: boom\n    at line 1, column 1"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_thrown_primitives_are_inspected() {
        assert_eq!(
            quick("throw 'plain'"),
            Err(ScriptFailure::Thrown {
                message: "plain".into(),
                stack: None
            })
        );
    }

    #[test]
    fn test_syntax_errors_carry_position() {
        match quick("let = 4") {
            Err(ScriptFailure::Syntax(e)) => assert_eq!((e.line, e.column), (1, 5)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_pre_cancelled_run_halts() {
        let options = RunOptions::new(Limits::standard(), Duration::from_secs(5));
        options.cancel.store(true, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(
            run("1 + 1", options, Console::new(true, 5)),
            Err(ScriptFailure::Halted(HaltReason::Cancelled))
        );
    }
}
