// Copyright 2025 Cornell University
// released under MIT License

use crate::cpa::AutomatonState;
use crate::ir::*;
use cranelift_entity::EntityRef;
use itertools::Itertools;
use std::fmt;
use std::io::Write;

/// Escapes `\` and `"` so the text can be put back between double quotes
pub fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

impl fmt::Display for MaybeBoolean {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaybeBoolean::True => write!(f, "true"),
            MaybeBoolean::False => write!(f, "false"),
            MaybeBoolean::Maybe => write!(f, "maybe"),
        }
    }
}

impl fmt::Display for IntExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntExpr::Const(value) => write!(f, "{}", value),
            IntExpr::VarAccess(name) => write!(f, "{}", name),
            IntExpr::CpaQuery { cpa, query } => write!(f, "EVAL({}, \"{}\")", cpa, escape(query)),
            IntExpr::Plus(a, b) | IntExpr::Minus(a, b) => {
                let op = if matches!(self, IntExpr::Plus(..)) { "+" } else { "-" };
                // left associative, so only the right operand needs parentheses
                match b.as_ref() {
                    IntExpr::Plus(..) | IntExpr::Minus(..) => write!(f, "{} {} ({})", a, op, b),
                    _ => write!(f, "{} {} {}", a, op, b),
                }
            }
        }
    }
}

impl BoolExpr {
    fn precedence(&self) -> u8 {
        match self {
            BoolExpr::Or(..) => 1,
            BoolExpr::And(..) => 2,
            BoolExpr::BoolEq(..)
            | BoolExpr::BoolNotEq(..)
            | BoolExpr::IntEq(..)
            | BoolExpr::IntNotEq(..) => 3,
            _ => 4,
        }
    }
}

/// Writes `expr`, parenthesized if it binds weaker than `min_precedence`
fn write_operand(f: &mut fmt::Formatter<'_>, expr: &BoolExpr, min_precedence: u8) -> fmt::Result {
    if expr.precedence() < min_precedence {
        write!(f, "({})", expr)
    } else {
        write!(f, "{}", expr)
    }
}

impl fmt::Display for BoolExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoolExpr::True => write!(f, "TRUE"),
            BoolExpr::False => write!(f, "FALSE"),
            BoolExpr::MatchEdgeExact(text) => write!(f, "MATCH \"{}\"", escape(text)),
            BoolExpr::MatchEdgeRegex(regex) => write!(f, "MATCH [{}]", regex.source()),
            BoolExpr::MatchLabelRegex(regex) => write!(f, "MATCH LABEL [{}]", regex.source()),
            BoolExpr::MatchAst(pattern) => write!(f, "MATCH {{{}}}", pattern.source()),
            BoolExpr::IntEq(a, b) => write!(f, "{} == {}", a, b),
            BoolExpr::IntNotEq(a, b) => write!(f, "{} != {}", a, b),
            BoolExpr::BoolEq(a, b)
            | BoolExpr::BoolNotEq(a, b)
            | BoolExpr::And(a, b)
            | BoolExpr::Or(a, b) => {
                let op = match self {
                    BoolExpr::BoolEq(..) => "==",
                    BoolExpr::BoolNotEq(..) => "!=",
                    BoolExpr::And(..) => "&&",
                    _ => "||",
                };
                let precedence = self.precedence();
                // comparisons do not chain
                let left = if precedence == 3 { 4 } else { precedence };
                write_operand(f, a, left)?;
                write!(f, " {} ", op)?;
                write_operand(f, b, precedence + 1)
            }
            BoolExpr::Not(a) => {
                write!(f, "!")?;
                write_operand(f, a, 4)
            }
            BoolExpr::CpaQuery { cpa, query } => write!(f, "CHECK({}, \"{}\")", cpa, escape(query)),
            BoolExpr::AllCpaQuery(query) => write!(f, "CHECK(\"{}\")", escape(query)),
        }
    }
}

impl fmt::Display for ActionExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionExpr::Print(text) => write!(f, "PRINT \"{}\"", escape(text)),
            ActionExpr::Assign(name, expr) => write!(f, "{} = {}", name, expr),
            ActionExpr::Modify { cpa, command } => {
                write!(f, "MODIFY({}, \"{}\")", cpa, escape(command))
            }
        }
    }
}

/// Renders a transition the way it is written in a definition file,
/// without the trailing `;`
impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.triggers.is_empty() {
            write!(f, "TRUE")?;
        } else {
            let triggers = self.triggers.iter().map(|t| {
                if t.precedence() < 2 {
                    format!("({})", t)
                } else {
                    t.to_string()
                }
            });
            write!(f, "{}", triggers.format(" && "))?;
        }
        write!(f, " ->")?;
        for assertion in &self.assertions {
            write!(f, " ASSERT {}", assertion)?;
        }
        if !self.actions.is_empty() {
            write!(f, " DO {}", self.actions.iter().format(" "))?;
        }
        match self.follow_state_name() {
            ERROR_STATE_NAME => write!(f, " ERROR"),
            BOTTOM_STATE_NAME => write!(f, " STOP"),
            name => write!(f, " GOTO {}", name),
        }
    }
}

/// Pretty-prints a variable environment, sorted by name to get a canonical output
pub fn serialize_vars(vars: &VariableEnvironment) -> String {
    vars.iter()
        .sorted_by_key(|var| var.name())
        .map(|var| format!("{}={}", var.name(), var.value()))
        .join(", ")
}

/// Pretty-prints an abstract state with state names resolved against `automaton`
pub fn serialize_state(automaton: &Automaton, state: &AutomatonState) -> String {
    match state {
        AutomatonState::Top => "TOP".to_string(),
        AutomatonState::Bottom => "BOTTOM".to_string(),
        AutomatonState::Regular { state, vars } => {
            format!("{} {{{}}}", automaton.state_name(*state), serialize_vars(vars))
        }
        AutomatonState::Unknown { state, vars } => {
            format!(
                "UNKNOWN({} {{{}}})",
                automaton.state_name(*state),
                serialize_vars(vars)
            )
        }
    }
}

/// Writes the automaton as a graphviz digraph. Internal states are numbered
/// in declaration order; `ERROR` and `BOTTOM` get the next two numbers and
/// only show up when some transition leads there.
pub fn write_dot(out: &mut impl Write, automaton: &Automaton) -> std::io::Result<()> {
    let num_states = automaton.state_ids().count();
    let node = |state: StateRef| match state {
        StateRef::State(id) => id.index(),
        StateRef::Error => num_states,
        StateRef::Bottom => num_states + 1,
    };
    let color = |state: StateRef| {
        if state == automaton.initial_state() {
            "green"
        } else {
            "black"
        }
    };

    writeln!(out, "digraph {} {{", automaton.name())?;
    for (id, state) in automaton.states() {
        writeln!(
            out,
            "{} [shape=\"circle\" color=\"{}\" label=\"{}\"]",
            id.index(),
            color(StateRef::State(id)),
            state.name()
        )?;
    }

    let targets = automaton
        .states()
        .flat_map(|(_, state)| state.transitions())
        .filter_map(|t| t.follow_state())
        .collect::<Vec<_>>();
    for pseudo in [StateRef::Error, StateRef::Bottom] {
        if targets.contains(&pseudo) || automaton.initial_state() == pseudo {
            writeln!(
                out,
                "{} [shape=\"doublecircle\" color=\"{}\" label=\"{}\"]",
                node(pseudo),
                if pseudo == automaton.initial_state() { "green" } else { "red" },
                automaton.state_name(pseudo)
            )?;
        }
    }

    for (id, state) in automaton.states() {
        for transition in state.transitions() {
            let Some(target) = transition.follow_state() else {
                continue;
            };
            writeln!(
                out,
                "{} -> {} [label=\"{}\"]",
                id.index(),
                node(target),
                escape(&transition.to_string())
            )?;
        }
    }
    writeln!(out, "}}")
}

pub fn dot_to_string(automaton: &Automaton) -> std::io::Result<String> {
    let mut out = Vec::new();
    write_dot(&mut out, automaton)?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}
