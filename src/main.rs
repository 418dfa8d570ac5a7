// Copyright 2025 Cornell University
// released under MIT License

use std::path::PathBuf;

use anyhow::Context;
use automon::cpa::AutomatonState;
use automon::diagnostic::DiagnosticHandler;
use automon::query::QueryableState;
use automon::setup::{load_cpa, AutomatonConfig};
use automon::trace_parser::parse_trace_file;
use clap::{ColorChoice, Parser};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use log::info;

/// Args for the monitor CLI
#[derive(Parser, Debug)]
#[command(version, about, long_about = None, disable_version_flag = true)]
struct Cli {
    /// Path to an automaton definition
    #[arg(short, long, value_name = "AUTOMATON_FILE")]
    automaton: PathBuf,

    /// Path to a trace of CFA edges to run the automaton along
    #[arg(short, long, value_name = "TRACE_FILE")]
    trace: Option<PathBuf>,

    /// Writes the automaton as a graphviz digraph
    #[arg(long, value_name = "DOT_FILE")]
    dot: Option<PathBuf>,

    /// Whether diagnostics and logs are colored
    #[arg(long, value_enum, default_value_t = ColorChoice::Auto)]
    color: ColorChoice,

    /// Users can specify `-v` or `--verbose` to toggle logging
    #[command(flatten)]
    verbosity: Verbosity<WarnLevel>,
}

/// Example (prints every fired transition):
/// `cargo run -- --automaton tests/automata/locking.spc --trace tests/traces/double_lock.trace -v`
fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // For concision, we disable timestamps in the log
    let write_style = match cli.color {
        ColorChoice::Always => env_logger::WriteStyle::Always,
        ColorChoice::Never => env_logger::WriteStyle::Never,
        ColorChoice::Auto => env_logger::WriteStyle::Auto,
    };
    env_logger::Builder::new()
        .format_timestamp(None)
        .write_style(write_style)
        .filter_level(cli.verbosity.log_level_filter())
        .init();

    let handler = &mut DiagnosticHandler::new(cli.color);
    let config = AutomatonConfig {
        input_file: cli.automaton.clone(),
        dot_export_file: cli.dot.clone(),
        color_choice: cli.color,
    };
    let cpa = load_cpa(&config, handler)
        .with_context(|| format!("failed to load automaton {}", cli.automaton.display()))?;

    let Some(trace) = &cli.trace else {
        return Ok(());
    };
    let edges = parse_trace_file(trace, handler)
        .with_context(|| format!("failed to load trace {}", trace.display()))?;

    // the CLI runs the automaton on its own, nobody answers queries
    let mut foreign: Vec<Box<dyn QueryableState>> = vec![];
    let mut states = vec![cpa.initial_state()];
    println!("initial: {}", cpa.format_state(&states[0]));

    for edge in &edges {
        let mut next: Vec<AutomatonState> = vec![];
        for state in &states {
            for successor in cpa
                .successors(state, edge, &mut foreign)
                .with_context(|| format!("failed to evaluate {}", edge))?
            {
                let strengthened = cpa
                    .strengthen(&successor, edge, &mut foreign)
                    .with_context(|| format!("failed to evaluate {}", edge))?;
                for s in strengthened {
                    if !cpa.stop(&s, &next) {
                        next.push(s);
                    }
                }
            }
        }
        states = next;

        let rendered: Vec<String> = states.iter().map(|s| cpa.format_state(s)).collect();
        println!("{}: [{}]", edge.line(), rendered.join(", "));

        if states.iter().any(AutomatonState::is_target) {
            println!(
                "automaton `{}` reached ERROR at {}",
                cpa.automaton().name(),
                edge
            );
            return Ok(());
        }
        if states.is_empty() {
            info!("no successor left after {}", edge);
            println!("path is infeasible for automaton `{}`", cpa.automaton().name());
            return Ok(());
        }
    }
    Ok(())
}
