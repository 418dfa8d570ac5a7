// Copyright 2025 Cornell University
// released under MIT License

use crate::c_ast::Captures;
use crate::cfa::CfaEdge;
use crate::errors::{ExecutionError, ExecutionResult};
use crate::ir::*;
use crate::query::{QueryValue, QueryableState};
use lazy_static::lazy_static;
use log::{info, warn};
use regex::Regex;

lazy_static! {
    // `$rawstatement` / `$line` (whole words only), `$N`, `$$name`
    static ref TEXT_TOKEN: Regex =
        Regex::new(r"\$(?:(rawstatement|line)\b|(\d+)|\$([A-Za-z_][A-Za-z0-9_]*))").unwrap();
}

/// Everything an expression may look at while one transition is evaluated
/// on one edge. A new context (and with it a fresh capture table) is created
/// for every transition that is tried.
pub struct EvalContext<'a> {
    automaton: &'a str,
    edge: &'a CfaEdge,
    vars: VariableEnvironment,
    captures: Captures,
    pending_log: String,
    foreign: &'a mut [Box<dyn QueryableState>],
}

impl<'a> EvalContext<'a> {
    /// `vars` is the successor's working copy of the predecessor's variables
    pub fn new(
        automaton: &'a str,
        edge: &'a CfaEdge,
        vars: VariableEnvironment,
        foreign: &'a mut [Box<dyn QueryableState>],
    ) -> Self {
        Self {
            automaton,
            edge,
            vars,
            captures: Captures::default(),
            pending_log: String::new(),
            foreign,
        }
    }

    pub fn edge(&self) -> &CfaEdge {
        self.edge
    }

    pub fn vars(&self) -> &VariableEnvironment {
        &self.vars
    }

    pub fn captures(&self) -> &Captures {
        &self.captures
    }

    pub fn into_vars(self) -> VariableEnvironment {
        self.vars
    }

    /// All foreign states registered under `cpa`, in declaration order
    fn foreign_states<'b>(&'b self, cpa: &'b str) -> impl Iterator<Item = &'b dyn QueryableState> {
        states_named(&*self.foreign, cpa)
    }

    fn has_foreign_state(&self, cpa: &str) -> bool {
        self.foreign_states(cpa).next().is_some()
    }

    /// Replaces `$rawstatement`, `$line`, captures `$N` and variables `$$name`
    /// in a single pass, so inserted text is never scanned again.
    /// Returns the first token that could not be resolved.
    pub fn substitute(&self, text: &str) -> Result<String, String> {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for caps in TEXT_TOKEN.captures_iter(text) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            let value = if let Some(keyword) = caps.get(1) {
                Some(match keyword.as_str() {
                    "line" => self.edge.line().to_string(),
                    _ => self.edge.raw_statement().to_string(),
                })
            } else if let Some(number) = caps.get(2) {
                number
                    .as_str()
                    .parse::<u32>()
                    .ok()
                    .and_then(|n| self.captures.get(&n).cloned())
            } else {
                caps.get(3)
                    .and_then(|name| self.vars.value(name.as_str()))
                    .map(|v| v.to_string())
            };
            let value = value.ok_or_else(|| whole.as_str().to_string())?;
            out.push_str(&text[last..whole.start()]);
            out.push_str(&value);
            last = whole.end();
        }
        out.push_str(&text[last..]);
        Ok(out)
    }

    /// Substitution for query strings: unresolved tokens are left in place
    fn substitute_query(&self, query: &str) -> String {
        self.substitute(query).unwrap_or_else(|token| {
            warn!(
                "Automaton `{}`: could not resolve {} in query \"{}\"",
                self.automaton, token, query
            );
            query.to_string()
        })
    }

    /// Hands back the pending PRINT output, if any, and clears it
    fn flush_log(&mut self) -> Option<String> {
        if self.pending_log.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending_log))
        }
    }
}

fn states_named<'b>(
    foreign: &'b [Box<dyn QueryableState>],
    cpa: &'b str,
) -> impl Iterator<Item = &'b dyn QueryableState> {
    foreign
        .iter()
        .filter(move |state| state.cpa_name() == cpa)
        .map(|state| state.as_ref() as &dyn QueryableState)
}

impl IntExpr {
    pub fn can_evaluate(&self, ctx: &EvalContext) -> bool {
        match self {
            IntExpr::Const(_) | IntExpr::VarAccess(_) => true,
            IntExpr::CpaQuery { cpa, .. } => ctx.has_foreign_state(cpa),
            IntExpr::Plus(a, b) | IntExpr::Minus(a, b) => a.can_evaluate(ctx) && b.can_evaluate(ctx),
        }
    }

    /// Evaluates the expression. Arithmetic over an operand that cannot
    /// evaluate is an error; it is checked once for the whole tree.
    pub fn eval(&self, ctx: &EvalContext) -> ExecutionResult<i64> {
        if matches!(self, IntExpr::Plus(..) | IntExpr::Minus(..)) && !self.can_evaluate(ctx) {
            return Err(ExecutionError::CannotEvaluate {
                expr: self.to_string(),
            });
        }
        self.eval_checked(ctx)
    }

    fn eval_checked(&self, ctx: &EvalContext) -> ExecutionResult<i64> {
        match self {
            IntExpr::Const(value) => Ok(*value),
            IntExpr::VarAccess(name) => eval_var_access(name, ctx),
            IntExpr::CpaQuery { cpa, query } => Ok(eval_int_query(cpa, query, ctx)),
            IntExpr::Plus(a, b) | IntExpr::Minus(a, b) => {
                let (a, b) = (a.eval_checked(ctx)?, b.eval_checked(ctx)?);
                Ok(match self {
                    IntExpr::Plus(..) => a.wrapping_add(b),
                    _ => a.wrapping_sub(b),
                })
            }
        }
    }
}

/// Asks every state named `cpa` in turn; the first int reply wins, otherwise 0
fn eval_int_query(cpa: &str, query: &str, ctx: &EvalContext) -> i64 {
    let query = ctx.substitute_query(query);
    let mut asked = false;
    for state in ctx.foreign_states(cpa) {
        asked = true;
        match state.evaluate_property(&query) {
            Ok(QueryValue::Int(value)) => return value,
            Ok(other) => warn!(
                "Automaton `{}`: `{}` answered \"{}\" with a {} instead of an int",
                ctx.automaton,
                cpa,
                query,
                other.type_name()
            ),
            Err(e) => warn!("Automaton `{}`: {}", ctx.automaton, e),
        }
    }
    if asked {
        warn!(
            "Automaton `{}`: no int answer to \"{}\" from `{}`, using 0",
            ctx.automaton, query, cpa
        );
    } else {
        warn!(
            "Automaton `{}`: no analysis named `{}` to evaluate \"{}\", using 0",
            ctx.automaton, cpa, query
        );
    }
    0
}

fn eval_var_access(name: &str, ctx: &EvalContext) -> ExecutionResult<i64> {
    let capture = name
        .strip_prefix('$')
        .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()));
    if let Some(digits) = capture {
        let captured = digits
            .parse::<u32>()
            .ok()
            .and_then(|n| ctx.captures.get(&n));
        return Ok(match captured.map(|text| text.trim().parse::<i64>()) {
            Some(Ok(value)) => value,
            Some(Err(_)) => {
                warn!(
                    "Automaton `{}`: capture {} is not a number, using -1",
                    ctx.automaton, name
                );
                -1
            }
            None => {
                warn!(
                    "Automaton `{}`: capture {} is not bound, using -1",
                    ctx.automaton, name
                );
                -1
            }
        });
    }
    if name == "$line" {
        return Ok(ctx.edge.line() as i64);
    }
    ctx.vars
        .value(name)
        .ok_or_else(|| ExecutionError::UndefinedVariable {
            name: name.to_string(),
            automaton: ctx.automaton.to_string(),
        })
}

impl BoolExpr {
    /// Evaluates the predicate on the current edge. AST matches record their
    /// captures in the context, so this needs mutable access.
    pub fn eval(&self, ctx: &mut EvalContext) -> ExecutionResult<MaybeBoolean> {
        use MaybeBoolean as MB;
        match self {
            BoolExpr::True => Ok(MB::True),
            BoolExpr::False => Ok(MB::False),
            BoolExpr::MatchEdgeExact(text) => Ok(MB::from(ctx.edge.raw_statement() == text)),
            BoolExpr::MatchEdgeRegex(regex) => Ok(MB::from(regex.is_match(ctx.edge.raw_statement()))),
            BoolExpr::MatchLabelRegex(regex) => Ok(match ctx.edge.successor_label() {
                Some(label) => MB::from(regex.is_match(&label.to_lowercase())),
                None => MB::False,
            }),
            BoolExpr::MatchAst(pattern) => Ok(match ctx.edge.statement() {
                Some(actual) => MB::from(pattern.pattern().matches(actual, &mut ctx.captures)),
                None => MB::False,
            }),
            BoolExpr::IntEq(a, b) | BoolExpr::IntNotEq(a, b) => {
                if !a.can_evaluate(ctx) || !b.can_evaluate(ctx) {
                    return Ok(MB::Maybe);
                }
                let equal = a.eval(ctx)? == b.eval(ctx)?;
                Ok(MB::from(matches!(self, BoolExpr::IntEq(..)) == equal))
            }
            BoolExpr::BoolEq(a, b) => Ok(a.eval(ctx)?.equals(b.eval(ctx)?)),
            BoolExpr::BoolNotEq(a, b) => Ok(a.eval(ctx)?.equals(b.eval(ctx)?).negate()),
            BoolExpr::And(a, b) => {
                let a = a.eval(ctx)?;
                if a == MB::False {
                    return Ok(MB::False);
                }
                Ok(a.and(b.eval(ctx)?))
            }
            BoolExpr::Or(a, b) => {
                let a = a.eval(ctx)?;
                if a == MB::True {
                    return Ok(MB::True);
                }
                Ok(a.or(b.eval(ctx)?))
            }
            BoolExpr::Not(a) => Ok(a.eval(ctx)?.negate()),
            BoolExpr::CpaQuery { cpa, query } => {
                if !ctx.has_foreign_state(cpa) {
                    return Ok(MB::Maybe);
                }
                let query = ctx.substitute_query(query);
                // the first bool reply of a state named `cpa` decides
                for state in ctx.foreign_states(cpa) {
                    match state.evaluate_property(&query) {
                        Ok(QueryValue::Bool(answer)) => return Ok(MB::from(answer)),
                        Ok(other) => warn!(
                            "Automaton `{}`: `{}` answered \"{}\" with a {} instead of a bool",
                            ctx.automaton,
                            cpa,
                            query,
                            other.type_name()
                        ),
                        Err(e) => warn!("Automaton `{}`: {}", ctx.automaton, e),
                    }
                }
                Ok(MB::False)
            }
            BoolExpr::AllCpaQuery(query) => {
                let query = ctx.substitute_query(query);
                if ctx.foreign.is_empty() {
                    return Ok(MB::Maybe);
                }
                let any_true = ctx
                    .foreign
                    .iter()
                    .any(|state| matches!(state.evaluate_property(&query), Ok(QueryValue::Bool(true))));
                Ok(MB::from(any_true))
            }
        }
    }
}

impl ActionExpr {
    pub fn can_execute(&self, ctx: &EvalContext) -> bool {
        match self {
            ActionExpr::Print(text) => ctx.substitute(text).is_ok(),
            ActionExpr::Assign(_, expr) => expr.can_evaluate(ctx),
            ActionExpr::Modify { command, .. } => ctx.substitute(command).is_ok(),
        }
    }

    pub fn execute(&self, ctx: &mut EvalContext) -> ExecutionResult<()> {
        match self {
            ActionExpr::Print(text) => match ctx.substitute(text) {
                Ok(line) => ctx.pending_log.push_str(&line),
                Err(token) => warn!(
                    "Automaton `{}`: could not resolve {} in \"{}\"",
                    ctx.automaton, token, text
                ),
            },
            ActionExpr::Assign(name, expr) => {
                let value = expr.eval(ctx)?;
                if !ctx.vars.contains(name) {
                    warn!(
                        "Automaton `{}`: assigning undeclared variable `{}`",
                        ctx.automaton, name
                    );
                }
                ctx.vars.assign(name, value);
            }
            ActionExpr::Modify { cpa, command } => {
                let command = match ctx.substitute(command) {
                    Ok(command) => command,
                    Err(token) => {
                        warn!(
                            "Automaton `{}`: could not resolve {} in \"{}\"",
                            ctx.automaton, token, command
                        );
                        return Ok(());
                    }
                };
                let automaton = ctx.automaton;
                let mut found = false;
                for state in ctx.foreign.iter_mut().filter(|s| s.cpa_name() == cpa) {
                    found = true;
                    if let Err(e) = state.modify_property(&command) {
                        warn!("Automaton `{}`: {}", automaton, e);
                    }
                }
                if !found {
                    warn!(
                        "Automaton `{}`: no analysis named `{}` to modify with \"{}\"",
                        automaton, cpa, command
                    );
                }
            }
        }
        Ok(())
    }
}

/// Runs `exprs` in order and stops at the first result that is not `True`
fn all_true(exprs: &[BoolExpr], ctx: &mut EvalContext) -> ExecutionResult<MaybeBoolean> {
    for expr in exprs {
        let result = expr.eval(ctx)?;
        if result != MaybeBoolean::True {
            return Ok(result);
        }
    }
    Ok(MaybeBoolean::True)
}

impl Transition {
    pub fn matches(&self, ctx: &mut EvalContext) -> ExecutionResult<MaybeBoolean> {
        all_true(&self.triggers, ctx)
    }

    pub fn assertions_hold(&self, ctx: &mut EvalContext) -> ExecutionResult<MaybeBoolean> {
        all_true(&self.assertions, ctx)
    }

    pub fn can_execute_actions(&self, ctx: &EvalContext) -> bool {
        self.actions.iter().all(|action| action.can_execute(ctx))
    }

    /// Executes all actions in order. The line assembled by `PRINT` actions
    /// is logged and handed back.
    pub fn execute_actions(&self, ctx: &mut EvalContext) -> ExecutionResult<Option<String>> {
        for action in &self.actions {
            action.execute(ctx)?;
        }
        let line = ctx.flush_log();
        if let Some(line) = &line {
            info!("{}", line);
        }
        Ok(line)
    }
}
