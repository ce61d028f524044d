pub mod checker;
pub mod config;
pub mod engine;
pub mod evaluator;
pub mod executor;
pub mod script;

#[cfg(test)]
mod executor_tests;

pub use executor::{GradeError, Grader};
