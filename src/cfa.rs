// Copyright 2025 Cornell University
// released under MIT License

use crate::c_ast::{parse_statement, CStatement};

/// A single edge of the control-flow automaton, as seen by the monitor.
/// Only the parts that triggers can inspect are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfaEdge {
    raw_statement: String,
    line: u32,
    statement: Option<CStatement>,
    successor_label: Option<String>,
}

impl CfaEdge {
    /// Creates an edge from its source text. The statement is parsed eagerly;
    /// text that does not parse (blank edges, `assume` edges, ...) yields an
    /// edge without a statement, which no AST pattern ever matches.
    pub fn new(raw_statement: impl Into<String>, line: u32) -> Self {
        let raw_statement = raw_statement.into();
        let statement = if raw_statement.trim().is_empty() {
            None
        } else {
            parse_statement(&raw_statement).ok()
        };
        Self {
            raw_statement,
            line,
            statement,
            successor_label: None,
        }
    }

    /// Edge with no source text
    pub fn blank(line: u32) -> Self {
        Self::new("", line)
    }

    /// Marks the edge as entering the block labeled `label`
    pub fn with_successor_label(mut self, label: impl Into<String>) -> Self {
        self.successor_label = Some(label.into());
        self
    }

    pub fn raw_statement(&self) -> &str {
        &self.raw_statement
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn statement(&self) -> Option<&CStatement> {
        self.statement.as_ref()
    }

    pub fn successor_label(&self) -> Option<&str> {
        self.successor_label.as_deref()
    }
}

impl std::fmt::Display for CfaEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.successor_label {
            Some(label) => write!(f, "line {}: {} (-> {})", self.line, self.raw_statement, label),
            None => write!(f, "line {}: {}", self.line, self.raw_statement),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edges_parse_their_statement() {
        let edge = CfaEdge::new("lock(&m);", 12);
        assert_eq!(edge.line(), 12);
        assert_eq!(edge.raw_statement(), "lock(&m);");
        assert_eq!(edge.statement().map(|s| s.to_string()).as_deref(), Some("lock(&m);"));
    }

    #[test]
    fn blank_and_unparsable_edges_have_no_statement() {
        assert!(CfaEdge::blank(3).statement().is_none());
        assert!(CfaEdge::new("[x > 0]", 4).statement().is_none());
    }
}
