// Copyright 2025 Cornell University
// released under MIT License

use anyhow::anyhow;
use pest::{error::InputLocation, iterators::Pair, Parser};
use pest_derive::Parser;

use crate::cfa::CfaEdge;
use crate::diagnostic::*;

#[derive(Parser)]
#[grammar = "trace.pest"]
struct TraceParser;

/// Parses a trace file (specified at `filepath`), i.e. the linear sequence of
/// CFA edges the monitor is run along.
pub fn parse_trace_file(
    filepath: impl AsRef<std::path::Path>,
    handler: &mut DiagnosticHandler,
) -> anyhow::Result<Vec<CfaEdge>> {
    let filename = filepath.as_ref().display().to_string();
    let input = std::fs::read_to_string(filepath.as_ref())
        .map_err(|e| anyhow!("failed to load {}: {}", filename, e))?;
    parse_trace_str(&filename, &input, handler)
}

pub fn parse_trace_str(
    filename: &str,
    input: &str,
    handler: &mut DiagnosticHandler,
) -> anyhow::Result<Vec<CfaEdge>> {
    let fileid = handler.add_file(filename.to_string(), input.to_string());

    let mut pairs = match TraceParser::parse(Rule::trace, input) {
        Ok(pairs) => pairs,
        Err(err) => {
            let (start, end) = match err.location {
                InputLocation::Pos(start) => (start, start),
                InputLocation::Span(span) => span,
            };
            let msg = format!("Parsing failed: {}", err.variant.message());
            handler.emit_diagnostic_span(&msg, fileid, start, end, Level::Error);
            return Err(anyhow!(msg));
        }
    };

    let trace = pairs
        .next()
        .ok_or_else(|| anyhow!("{} does not contain a trace", filename))?;
    trace
        .into_inner()
        .filter(|pair| pair.as_rule() == Rule::edge)
        .map(|pair| parse_edge(pair, fileid, handler))
        .collect()
}

fn parse_edge(
    pair: Pair<Rule>,
    fileid: usize,
    handler: &mut DiagnosticHandler,
) -> anyhow::Result<CfaEdge> {
    let mut inner = pair.clone().into_inner();
    let (Some(line_no), Some(body)) = (inner.next(), inner.next()) else {
        let msg = "Expected `<line>: <statement>`";
        handler.emit_diagnostic_parsing(msg, fileid, &pair, Level::Error);
        return Err(anyhow!(msg));
    };

    let line = line_no.as_str().parse::<u32>().map_err(|e| {
        let msg = format!("Invalid line number: {}", e);
        handler.emit_diagnostic_parsing(&msg, fileid, &line_no, Level::Error);
        anyhow!(msg)
    })?;

    match body.as_rule() {
        Rule::label => {
            let name = body
                .into_inner()
                .next()
                .map(|p| p.as_str().to_string())
                .unwrap_or_default();
            Ok(CfaEdge::blank(line).with_successor_label(name))
        }
        _ => Ok(CfaEdge::new(body.as_str().trim_end(), line)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strip_ansi_escapes::strip_str;

    #[test]
    fn parse_trace_lines() {
        let mut handler = DiagnosticHandler::default();
        let input = "# a short path\n3: lock(&m);\n\n4:   label  ERROR_1 \n5:\n7: label = 3;\n";
        let edges = parse_trace_str("t.trace", input, &mut handler).unwrap();
        assert_eq!(edges.len(), 4);

        assert_eq!(edges[0].line(), 3);
        assert_eq!(edges[0].raw_statement(), "lock(&m);");
        assert!(edges[0].statement().is_some());

        assert_eq!(edges[1].line(), 4);
        assert_eq!(edges[1].successor_label(), Some("ERROR_1"));
        assert_eq!(edges[1].raw_statement(), "");

        // blank edge
        assert!(edges[2].statement().is_none());

        // `label` only starts a label when nothing else follows the name
        assert_eq!(edges[3].raw_statement(), "label = 3;");
        assert_eq!(edges[3].successor_label(), None);
    }

    #[test]
    fn parse_trace_fixture() {
        let mut handler = DiagnosticHandler::default();
        let edges = parse_trace_file("tests/traces/double_lock.trace", &mut handler).unwrap();
        assert_eq!(edges.first().map(CfaEdge::line), Some(10));
        assert!(edges.iter().any(|e| e.raw_statement() == "unlock(&m);"));
    }

    #[test]
    fn malformed_lines_are_reported() {
        let mut handler = DiagnosticHandler::default();
        let result = parse_trace_str("bad.trace", "1: x = 1;\nnot an edge\n", &mut handler);
        assert!(result.is_err());
        assert!(strip_str(handler.error_string()).contains("bad.trace:2:1"));
    }
}
