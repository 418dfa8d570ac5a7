// Copyright 2025 Cornell University
// released under MIT License

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use clap::ColorChoice;
use log::info;

use crate::cpa::AutomatonCpa;
use crate::diagnostic::DiagnosticHandler;
use crate::errors::{ConfigError, ConfigResult};
use crate::parser::parse_automaton_file;
use crate::serialize::write_dot;

/// Startup options of the automaton analysis
#[derive(Debug, Clone)]
pub struct AutomatonConfig {
    /// Automaton definition (`*.spc`)
    pub input_file: PathBuf,
    /// Where to write a graphviz rendering of the automaton, if anywhere
    pub dot_export_file: Option<PathBuf>,
    pub color_choice: ColorChoice,
}

impl AutomatonConfig {
    pub fn new(input_file: impl Into<PathBuf>) -> Self {
        Self {
            input_file: input_file.into(),
            dot_export_file: None,
            color_choice: ColorChoice::Auto,
        }
    }
}

/// Loads and checks the configured automaton, exports it as DOT if requested,
/// and wraps it into an `AutomatonCpa`.
pub fn load_cpa(
    config: &AutomatonConfig,
    handler: &mut DiagnosticHandler,
) -> ConfigResult<AutomatonCpa> {
    let automaton = parse_automaton_file(&config.input_file, handler)?;

    if let Some(path) = &config.dot_export_file {
        let dot_error = |source| ConfigError::DotExport {
            path: path.clone(),
            source,
        };
        let mut out = BufWriter::new(File::create(path).map_err(dot_error)?);
        write_dot(&mut out, &automaton).map_err(dot_error)?;
        out.flush().map_err(dot_error)?;
        info!("Wrote automaton `{}` to {}", automaton.name(), path.display());
    }

    Ok(AutomatonCpa::new(automaton))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_with_dot_export() {
        let dir = tempfile::tempdir().unwrap();
        let dot = dir.path().join("locking.dot");
        let config = AutomatonConfig {
            dot_export_file: Some(dot.clone()),
            ..AutomatonConfig::new("tests/automata/locking.spc")
        };
        let mut handler = DiagnosticHandler::default();
        let cpa = load_cpa(&config, &mut handler).unwrap();
        assert_eq!(cpa.automaton().name(), "Locking");

        let content = std::fs::read_to_string(&dot).unwrap();
        assert!(content.starts_with("digraph Locking {"));
        assert!(content.contains("label=\"Unlocked\""));
        assert!(content.trim_end().ends_with('}'));
    }

    #[test]
    fn export_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = AutomatonConfig {
            dot_export_file: Some(dir.path().join("missing").join("out.dot")),
            ..AutomatonConfig::new("tests/automata/locking.spc")
        };
        let mut handler = DiagnosticHandler::default();
        let result = load_cpa(&config, &mut handler);
        assert!(matches!(result, Err(ConfigError::DotExport { .. })));
    }

    #[test]
    fn rejected_observer_does_not_load() {
        let config = AutomatonConfig::new("tests/automata/observer_bottom.spc");
        let mut handler = DiagnosticHandler::default();
        let result = load_cpa(&config, &mut handler);
        assert!(matches!(result, Err(ConfigError::ObserverViolation { .. })));
    }
}
