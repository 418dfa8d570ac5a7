// Copyright 2025 Cornell University
// released under MIT License

use std::path::{Path, PathBuf};

use log::info;
use pest::error::InputLocation;
use pest::iterators::{Pair, Pairs};
use pest::pratt_parser::PrattParser;
use pest::Parser;
use pest_derive::Parser;
use rustc_hash::FxHashSet;

use crate::diagnostic::*;
use crate::errors::{ConfigError, ConfigResult};
use crate::ir::*;

#[derive(Parser)]
#[grammar = "automaton.pest"]
struct AutomatonParser;

lazy_static::lazy_static! {
    static ref BOOL_PRATT: PrattParser<Rule> = {
        use pest::pratt_parser::{Assoc::*, Op};
        use Rule::*;

        // Precedence is defined lowest to highest
        PrattParser::new()
            .op(Op::infix(or, Left))
            .op(Op::infix(and, Left))
            .op(Op::infix(beq, Left) | Op::infix(bneq, Left))
            .op(Op::prefix(not))
    };

    static ref INT_PRATT: PrattParser<Rule> = {
        use pest::pratt_parser::{Assoc::*, Op};
        use Rule::*;

        PrattParser::new().op(Op::infix(add, Left) | Op::infix(sub, Left))
    };
}

/// A follow-state reference together with where it was written
struct TargetRef {
    name: String,
    start: usize,
    end: usize,
}

pub struct ParserContext<'a> {
    pub path: &'a Path,
    pub fileid: usize,
    pub handler: &'a mut DiagnosticHandler,
    targets: Vec<TargetRef>,
}

impl<'a> ParserContext<'a> {
    pub fn new(path: &'a Path, fileid: usize, handler: &'a mut DiagnosticHandler) -> Self {
        Self {
            path,
            fileid,
            handler,
            targets: vec![],
        }
    }

    /// Reports `message` at `pair` and turns it into a syntax error
    fn error_at(&mut self, pair: &Pair<Rule>, message: &str) -> ConfigError {
        self.handler
            .emit_diagnostic_parsing(message, self.fileid, pair, Level::Error);
        ConfigError::Syntax {
            path: self.path.to_path_buf(),
            message: message.to_string(),
        }
    }

    // Helper method for expected rule errors
    fn expect_rule<'i>(
        &mut self,
        option: Option<Pair<'i, Rule>>,
        context_pair: &Pair<Rule>,
        message: &str,
    ) -> ConfigResult<Pair<'i, Rule>> {
        match option {
            Some(pair) => Ok(pair),
            None => Err(self.error_at(context_pair, message)),
        }
    }

    /// Reports a configuration error raised while building an expression at `pair`
    fn report(&mut self, pair: &Pair<Rule>, error: ConfigError) -> ConfigError {
        self.handler
            .emit_diagnostic_parsing(&error.to_string(), self.fileid, pair, Level::Error);
        error
    }

    fn parse_string(&mut self, pair: Pair<Rule>) -> ConfigResult<String> {
        let inner = self.expect_rule(pair.clone().into_inner().next(), &pair, "Expected string")?;
        Ok(unescape(inner.as_str()))
    }

    /// Parses `CHECK(cpa, "q")`, `EVAL(cpa, "q")` and `MODIFY(cpa, "q")` arguments
    fn parse_cpa_call(&mut self, pair: Pair<Rule>) -> ConfigResult<(String, String)> {
        let mut inner = pair.clone().into_inner();
        let cpa = self.expect_rule(inner.next(), &pair, "Expected analysis name")?;
        let text = self.expect_rule(inner.next(), &pair, "Expected query string")?;
        Ok((cpa.as_str().to_string(), self.parse_string(text)?))
    }

    pub fn parse_int_expr(&mut self, pairs: Pairs<Rule>) -> ConfigResult<IntExpr> {
        INT_PRATT
            .map_primary(|primary| match primary.as_rule() {
                Rule::int_lit => primary
                    .as_str()
                    .parse::<i64>()
                    .map(IntExpr::Const)
                    .map_err(|e| self.error_at(&primary, &format!("Invalid integer: {}", e))),
                Rule::capture | Rule::line_var | Rule::ident => {
                    Ok(IntExpr::VarAccess(primary.as_str().to_string()))
                }
                Rule::eval => {
                    let (cpa, query) = self.parse_cpa_call(primary)?;
                    Ok(IntExpr::CpaQuery { cpa, query })
                }
                Rule::int_expr => self.parse_int_expr(primary.into_inner()),
                rule => unreachable!("IntExpr::parse expected atom, found {:?}", rule),
            })
            .map_infix(|lhs, op, rhs| {
                let (lhs, rhs) = (Box::new(lhs?), Box::new(rhs?));
                Ok(match op.as_rule() {
                    Rule::add => IntExpr::Plus(lhs, rhs),
                    Rule::sub => IntExpr::Minus(lhs, rhs),
                    rule => unreachable!("IntExpr::parse expected infix operation, found {:?}", rule),
                })
            })
            .parse(pairs)
    }

    fn parse_int_cmp(&mut self, pair: Pair<Rule>) -> ConfigResult<BoolExpr> {
        let mut inner = pair.clone().into_inner();
        let lhs = self.expect_rule(inner.next(), &pair, "Expected integer expression")?;
        let op = self.expect_rule(inner.next(), &pair, "Expected `==` or `!=`")?;
        let rhs = self.expect_rule(inner.next(), &pair, "Expected integer expression")?;
        let lhs = self.parse_int_expr(lhs.into_inner())?;
        let rhs = self.parse_int_expr(rhs.into_inner())?;
        Ok(match op.as_rule() {
            Rule::int_eq => BoolExpr::IntEq(lhs, rhs),
            _ => BoolExpr::IntNotEq(lhs, rhs),
        })
    }

    fn parse_bool_primary(&mut self, primary: Pair<Rule>) -> ConfigResult<BoolExpr> {
        let body = |pair: &Pair<Rule>| {
            pair.clone()
                .into_inner()
                .next()
                .map(|p| p.as_str().to_string())
                .unwrap_or_default()
        };
        match primary.as_rule() {
            Rule::true_lit => Ok(BoolExpr::True),
            Rule::false_lit => Ok(BoolExpr::False),
            Rule::match_exact => {
                let text = self.expect_rule(primary.clone().into_inner().next(), &primary, "Expected string")?;
                Ok(BoolExpr::MatchEdgeExact(self.parse_string(text)?))
            }
            Rule::match_regex => {
                BoolExpr::edge_regex(&body(&primary)).map_err(|e| self.report(&primary, e))
            }
            Rule::match_label => {
                BoolExpr::label_regex(&body(&primary)).map_err(|e| self.report(&primary, e))
            }
            Rule::match_ast => BoolExpr::ast(&body(&primary)).map_err(|e| self.report(&primary, e)),
            Rule::check_cpa => {
                let (cpa, query) = self.parse_cpa_call(primary)?;
                Ok(BoolExpr::CpaQuery { cpa, query })
            }
            Rule::check_all => {
                let text = self.expect_rule(primary.clone().into_inner().next(), &primary, "Expected query string")?;
                Ok(BoolExpr::AllCpaQuery(self.parse_string(text)?))
            }
            Rule::int_cmp => self.parse_int_cmp(primary),
            Rule::bool_expr => self.parse_bool_expr(primary.into_inner()),
            rule => unreachable!("BoolExpr::parse expected atom, found {:?}", rule),
        }
    }

    pub fn parse_bool_expr(&mut self, pairs: Pairs<Rule>) -> ConfigResult<BoolExpr> {
        BOOL_PRATT
            .map_primary(|primary| self.parse_bool_primary(primary))
            .map_infix(|lhs, op, rhs| {
                let (lhs, rhs) = (Box::new(lhs?), Box::new(rhs?));
                Ok(match op.as_rule() {
                    Rule::or => BoolExpr::Or(lhs, rhs),
                    Rule::and => BoolExpr::And(lhs, rhs),
                    Rule::beq => BoolExpr::BoolEq(lhs, rhs),
                    Rule::bneq => BoolExpr::BoolNotEq(lhs, rhs),
                    rule => unreachable!("BoolExpr::parse expected infix operation, found {:?}", rule),
                })
            })
            .map_prefix(|op, arg| {
                let arg = arg?;
                match op.as_rule() {
                    Rule::not => Ok(BoolExpr::Not(Box::new(arg))),
                    rule => unreachable!("BoolExpr::parse expected prefix operation, found {:?}", rule),
                }
            })
            .parse(pairs)
    }

    fn parse_action(&mut self, pair: Pair<Rule>) -> ConfigResult<ActionExpr> {
        match pair.as_rule() {
            Rule::print => {
                let text = self.expect_rule(pair.clone().into_inner().next(), &pair, "Expected string")?;
                Ok(ActionExpr::Print(self.parse_string(text)?))
            }
            Rule::modify => {
                let (cpa, command) = self.parse_cpa_call(pair)?;
                Ok(ActionExpr::Modify { cpa, command })
            }
            Rule::assign => {
                let mut inner = pair.clone().into_inner();
                let var = self.expect_rule(inner.next(), &pair, "Expected variable name")?;
                let value = self.expect_rule(inner.next(), &pair, "Expected integer expression")?;
                let value = self.parse_int_expr(value.into_inner())?;
                Ok(ActionExpr::Assign(var.as_str().to_string(), value))
            }
            rule => Err(self.error_at(&pair, &format!("Unexpected action: {:?}", rule))),
        }
    }

    fn parse_transition(&mut self, pair: Pair<Rule>) -> ConfigResult<Transition> {
        let mut triggers = vec![];
        let mut assertions = vec![];
        let mut actions = vec![];
        let mut follow = None;
        for inner in pair.clone().into_inner() {
            match inner.as_rule() {
                Rule::bool_expr => triggers.push(self.parse_bool_expr(inner.into_inner())?),
                Rule::assertion => {
                    let expr = self.expect_rule(inner.clone().into_inner().next(), &inner, "Expected assertion")?;
                    assertions.push(self.parse_bool_expr(expr.into_inner())?);
                }
                Rule::actions => {
                    for action in inner.into_inner() {
                        actions.push(self.parse_action(action)?);
                    }
                }
                Rule::goto => {
                    let target = self.expect_rule(inner.clone().into_inner().next(), &inner, "Expected state name")?;
                    let span = target.as_span();
                    self.targets.push(TargetRef {
                        name: target.as_str().to_string(),
                        start: span.start(),
                        end: span.end(),
                    });
                    follow = Some(target.as_str().to_string());
                }
                Rule::error_target => follow = Some(ERROR_STATE_NAME.to_string()),
                Rule::stop => follow = Some(BOTTOM_STATE_NAME.to_string()),
                rule => return Err(self.error_at(&inner, &format!("Unexpected rule in transition: {:?}", rule))),
            }
        }
        match follow {
            Some(follow) => Ok(Transition::new(triggers, assertions, actions, follow)),
            None => Err(self.error_at(&pair, "Transition without follow state")),
        }
    }

    fn parse_local(&mut self, pair: Pair<Rule>) -> ConfigResult<Variable> {
        let mut inner = pair.clone().into_inner();
        let name = self.expect_rule(inner.next(), &pair, "Expected variable name")?;
        let value = match inner.next() {
            Some(value) => value
                .as_str()
                .parse::<i64>()
                .map_err(|e| self.error_at(&value, &format!("Invalid integer: {}", e)))?,
            None => 0,
        };
        Ok(Variable::new(name.as_str(), value))
    }

    pub fn parse_automaton(&mut self, pair: Pair<Rule>) -> ConfigResult<Automaton> {
        let mut kind = AutomatonKind::Control;
        let mut name = None;
        let mut variables = vec![];
        let mut initial = None;
        let mut states = vec![];
        let mut declared: FxHashSet<String> = FxHashSet::default();

        for inner in pair.clone().into_inner() {
            match inner.as_rule() {
                Rule::observer => kind = AutomatonKind::Observer,
                Rule::control => kind = AutomatonKind::Control,
                Rule::ident => name = Some(inner.as_str().to_string()),
                Rule::local => {
                    let var = self.parse_local(inner.clone())?;
                    if variables.iter().any(|v: &Variable| v.name() == var.name()) {
                        let msg = format!("Variable `{}` is declared more than once", var.name());
                        return Err(self.error_at(&inner, &msg));
                    }
                    variables.push(var);
                }
                Rule::initial => {
                    let target = self.expect_rule(inner.clone().into_inner().next(), &inner, "Expected state name")?;
                    initial = Some(target);
                }
                Rule::state => {
                    let mut state_rules = inner.clone().into_inner();
                    let state_name = self.expect_rule(state_rules.next(), &inner, "Expected state name")?;
                    let mut transitions = vec![];
                    for transition in state_rules {
                        transitions.push(self.parse_transition(transition)?);
                    }
                    if !declared.insert(state_name.as_str().to_string()) {
                        let error = ConfigError::DuplicateState {
                            automaton: name.clone().unwrap_or_default(),
                            name: state_name.as_str().to_string(),
                        };
                        return Err(self.report(&state_name, error));
                    }
                    states.push(InternalState::new(state_name.as_str(), transitions));
                }
                rule => return Err(self.error_at(&inner, &format!("Unexpected rule in automaton: {:?}", rule))),
            }
        }

        let name = match name {
            Some(name) => name,
            None => return Err(self.error_at(&pair, "Expected automaton name")),
        };

        // point at every reference that does not resolve before linking fails
        let mut seen = FxHashSet::default();
        for target in &self.targets {
            let known = declared.contains(&target.name)
                || target.name == ERROR_STATE_NAME
                || target.name == BOTTOM_STATE_NAME;
            if !known && seen.insert((target.start, target.end)) {
                self.handler.emit_diagnostic_span(
                    &format!("Unknown state `{}`", target.name),
                    self.fileid,
                    target.start,
                    target.end,
                    Level::Error,
                );
            }
        }

        let initial_name = match &initial {
            Some(target) => {
                if !declared.contains(target.as_str()) {
                    self.handler.emit_diagnostic_parsing(
                        &format!("Initial state `{}` is not declared, starting in ERROR", target.as_str()),
                        self.fileid,
                        target,
                        Level::Warning,
                    );
                }
                target.as_str().to_string()
            }
            None => return Err(self.error_at(&pair, "Expected initial state")),
        };

        let automaton = Automaton::new(
            name,
            kind,
            variables.into_iter().collect(),
            states,
            &initial_name,
        );
        match automaton {
            Ok(automaton) => Ok(automaton),
            Err(e) => {
                if !matches!(e, ConfigError::UnresolvedStates { .. }) {
                    self.handler.emit_general_message(&e.to_string(), Level::Error);
                }
                Err(e)
            }
        }
    }
}

/// Resolves `\"` and `\\`; every other escape is kept as written
fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next @ ('"' | '\\')) => out.push(next),
                Some(next) => {
                    out.push('\\');
                    out.push(next);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Parses an automaton definition held in memory. `path` is only used to
/// label diagnostics and errors.
pub fn parse_automaton_str(
    path: impl AsRef<Path>,
    input: &str,
    handler: &mut DiagnosticHandler,
) -> ConfigResult<Automaton> {
    let path = path.as_ref();
    let fileid = handler.add_file(path.display().to_string(), input.to_string());

    let mut pairs = match AutomatonParser::parse(Rule::file, input) {
        Ok(pairs) => pairs,
        Err(err) => {
            let (start, end) = match err.location {
                InputLocation::Pos(start) => (start, start),
                InputLocation::Span(span) => span,
            };
            let msg: String = format!("Parsing failed: {}", err.variant.message());
            handler.emit_diagnostic_span(&msg, fileid, start, end, Level::Error);
            return Err(ConfigError::Syntax {
                path: PathBuf::from(path),
                message: msg,
            });
        }
    };

    let mut context = ParserContext::new(path, fileid, handler);
    let file = pairs.next();
    let automaton =
        file.and_then(|file| file.into_inner().find(|p| p.as_rule() == Rule::automaton));
    let Some(automaton) = automaton else {
        return Err(ConfigError::Syntax {
            path: path.to_path_buf(),
            message: "Expected an automaton".to_string(),
        });
    };
    let automaton = context.parse_automaton(automaton)?;
    info!(
        "Loaded {:?} automaton `{}` with {} states from {}",
        automaton.kind(),
        automaton.name(),
        automaton.state_ids().count(),
        path.display()
    );
    Ok(automaton)
}

pub fn parse_automaton_file(
    path: impl AsRef<Path>,
    handler: &mut DiagnosticHandler,
) -> ConfigResult<Automaton> {
    let path = path.as_ref();
    let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_automaton_str(path, &input, handler)
}
