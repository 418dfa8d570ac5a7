// Copyright 2025 Cornell University
// released under MIT License

//! The protocol through which an automaton talks to the other analyses
//! running in the same composite exploration step. An automaton only ever
//! sees a foreign state's declared name; everything else goes through
//! string queries and string modifications.

use crate::errors::QueryError;

/// Typed answer to a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl QueryValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            QueryValue::Bool(_) => "bool",
            QueryValue::Int(_) => "int",
            QueryValue::Text(_) => "string",
        }
    }
}

/// An abstract state of another analysis that an automaton may query or modify
pub trait QueryableState {
    /// Name under which automata refer to this analysis in `CHECK`, `EVAL` and `MODIFY`
    fn cpa_name(&self) -> &str;

    fn evaluate_property(&self, query: &str) -> Result<QueryValue, QueryError>;

    fn modify_property(&mut self, modification: &str) -> Result<(), QueryError>;
}
