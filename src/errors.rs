// Copyright 2025 Cornell University
// released under MIT License

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating an automaton definition.
/// All of them are fatal: the monitor refuses to start.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read automaton file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("syntax error in automaton file {path}: {message}")]
    Syntax { path: PathBuf, message: String },

    /// Aggregated over every transition of the automaton
    #[error("automaton `{automaton}` references undeclared states: {}", .names.join(", "))]
    UnresolvedStates {
        automaton: String,
        names: Vec<String>,
    },

    #[error("automaton `{automaton}` declares state `{name}` more than once")]
    DuplicateState { automaton: String, name: String },

    #[error("automaton `{automaton}` may not declare a state named `{name}` (reserved)")]
    ReservedStateName { automaton: String, name: String },

    #[error("observer automaton `{automaton}` violates the observer restrictions: {reason}")]
    ObserverViolation { automaton: String, reason: String },

    #[error("invalid regular expression `{pattern}`: {message}")]
    InvalidRegex { pattern: String, message: String },

    #[error("invalid AST pattern `{pattern}`: {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("could not write DOT export to {path}: {source}")]
    DotExport {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that abort the evaluation of a single edge.
/// Soft failures ("not enough information yet") are *not* errors,
/// they are reported through `MaybeBoolean::Maybe` instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("variable `{name}` is not defined in automaton `{automaton}`")]
    UndefinedVariable { name: String, automaton: String },

    /// Raised when an expression is evaluated although `can_evaluate` was false.
    /// This points to a bug in the caller.
    #[error("expression `{expr}` cannot be evaluated with the available information")]
    CannotEvaluate { expr: String },

    #[error("transition to `{name}` was never linked to a state")]
    UnlinkedTransition { name: String },
}

/// Failure reported by a foreign analysis while answering a query
/// or applying a modification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("analysis `{cpa}` does not understand `{query}`")]
    Unsupported { cpa: String, query: String },

    #[error("analysis `{cpa}` rejected `{query}`: {reason}")]
    Rejected {
        cpa: String,
        query: String,
        reason: String,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
pub type ExecutionResult<T> = Result<T, ExecutionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresolved_states_lists_every_name() {
        let err = ConfigError::UnresolvedStates {
            automaton: "Locking".to_string(),
            names: vec!["Locked".to_string(), "Gone".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "automaton `Locking` references undeclared states: Locked, Gone"
        );
    }
}
