// Copyright 2025 Cornell University
// released under MIT License

use std::sync::Arc;

use log::{debug, info, warn};

use crate::cfa::CfaEdge;
use crate::errors::{ExecutionError, ExecutionResult};
use crate::interpreter::EvalContext;
use crate::ir::*;
use crate::query::QueryableState;
use crate::serialize::serialize_state;

/// Abstract state of the automaton analysis
#[derive(Debug, Clone)]
pub enum AutomatonState {
    Regular {
        state: StateRef,
        vars: VariableEnvironment,
    },
    /// Nothing is known, every edge is allowed
    Top,
    /// Infeasible: no successor
    Bottom,
    /// Transfer could not decide without the other analyses' successors;
    /// holds the predecessor so strengthen can redo the step
    Unknown {
        state: StateRef,
        vars: VariableEnvironment,
    },
}

impl PartialEq for AutomatonState {
    fn eq(&self, other: &Self) -> bool {
        use AutomatonState::*;

        match (self, other) {
            (Regular { state: a, vars: va }, Regular { state: b, vars: vb }) => a == b && va == vb,
            (Unknown { state: a, vars: va }, Unknown { state: b, vars: vb }) => a == b && va == vb,
            (Top, Top) | (Bottom, Bottom) => true,
            _ => false,
        }
    }
}

impl Eq for AutomatonState {}

impl AutomatonState {
    /// Only a regular state in `ERROR` is a property violation
    pub fn is_target(&self) -> bool {
        matches!(
            self,
            AutomatonState::Regular {
                state: StateRef::Error,
                ..
            }
        )
    }

    pub fn internal_state(&self) -> Option<StateRef> {
        match self {
            AutomatonState::Regular { state, .. } | AutomatonState::Unknown { state, .. } => {
                Some(*state)
            }
            AutomatonState::Top | AutomatonState::Bottom => None,
        }
    }

    pub fn vars(&self) -> Option<&VariableEnvironment> {
        match self {
            AutomatonState::Regular { vars, .. } | AutomatonState::Unknown { vars, .. } => {
                Some(vars)
            }
            AutomatonState::Top | AutomatonState::Bottom => None,
        }
    }

    fn regular(state: StateRef, vars: VariableEnvironment) -> Self {
        match state {
            StateRef::Bottom => AutomatonState::Bottom,
            state => AutomatonState::Regular { state, vars },
        }
    }
}

/// The automaton analysis only uses the trivial precision
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaticPrecision;

/// Outcome of scanning the transitions of one internal state
enum Step {
    Fired(AutomatonState),
    Undecided,
    NoMatch,
}

/// Ties an automaton into the exploration of the host analysis: initial
/// state, transfer relation, strengthening and the lattice operators.
pub struct AutomatonCpa {
    automaton: Arc<Automaton>,
}

impl AutomatonCpa {
    pub fn new(automaton: Automaton) -> Self {
        Self {
            automaton: Arc::new(automaton),
        }
    }

    pub fn automaton(&self) -> &Automaton {
        &self.automaton
    }

    pub fn initial_state(&self) -> AutomatonState {
        AutomatonState::regular(
            self.automaton.initial_state(),
            self.automaton.initial_variables().clone(),
        )
    }

    pub fn initial_precision(&self) -> StaticPrecision {
        StaticPrecision
    }

    pub fn format_state(&self, state: &AutomatonState) -> String {
        serialize_state(&self.automaton, state)
    }

    /// Evaluates the transitions of `current` in declaration order.
    /// Every transition gets its own context, so captures never leak
    /// from one transition into the next.
    fn follow(
        &self,
        current: StateRef,
        vars: &VariableEnvironment,
        edge: &CfaEdge,
        foreign: &mut [Box<dyn QueryableState>],
    ) -> ExecutionResult<Step> {
        let Some(internal) = self.automaton.internal_state(current) else {
            return Ok(Step::NoMatch);
        };

        for transition in internal.transitions() {
            let mut ctx =
                EvalContext::new(self.automaton.name(), edge, vars.clone(), &mut *foreign);
            match transition.matches(&mut ctx)? {
                MaybeBoolean::False => continue,
                MaybeBoolean::Maybe => return Ok(Step::Undecided),
                MaybeBoolean::True => {}
            }

            match transition.assertions_hold(&mut ctx)? {
                MaybeBoolean::True => {}
                MaybeBoolean::False => {
                    info!(
                        "Automaton `{}`: assertion violated in state {} at {}",
                        self.automaton.name(),
                        internal.name(),
                        edge
                    );
                    return Ok(Step::Fired(AutomatonState::regular(
                        StateRef::Error,
                        vars.clone(),
                    )));
                }
                MaybeBoolean::Maybe => return Ok(Step::Undecided),
            }

            if !transition.can_execute_actions(&ctx) {
                return Ok(Step::Undecided);
            }
            transition.execute_actions(&mut ctx)?;
            let follow = transition
                .follow_state()
                .ok_or_else(|| ExecutionError::UnlinkedTransition {
                    name: transition.follow_state_name().to_string(),
                })?;
            debug!(
                "Automaton `{}`: {} -> {} on {}",
                self.automaton.name(),
                internal.name(),
                self.automaton.state_name(follow),
                edge
            );
            return Ok(Step::Fired(AutomatonState::regular(follow, ctx.into_vars())));
        }
        Ok(Step::NoMatch)
    }

    /// Transfer relation: the successors of `state` along `edge`.
    /// An empty result means the edge is infeasible for this automaton.
    pub fn successors(
        &self,
        state: &AutomatonState,
        edge: &CfaEdge,
        foreign: &mut [Box<dyn QueryableState>],
    ) -> ExecutionResult<Vec<AutomatonState>> {
        let successors = match state {
            AutomatonState::Top => vec![AutomatonState::Top],
            AutomatonState::Bottom => vec![],
            // resolved in strengthen
            AutomatonState::Unknown { .. } => vec![state.clone()],
            AutomatonState::Regular { state: current, vars } => {
                match self.follow(*current, vars, edge, foreign)? {
                    Step::Fired(AutomatonState::Bottom) => vec![],
                    Step::Fired(next) => vec![next],
                    Step::Undecided => vec![AutomatonState::Unknown {
                        state: *current,
                        vars: vars.clone(),
                    }],
                    Step::NoMatch => vec![state.clone()],
                }
            }
        };
        debug!(
            "Automaton `{}`: {} on {} -> [{}]",
            self.automaton.name(),
            self.format_state(state),
            edge,
            successors
                .iter()
                .map(|s| self.format_state(s))
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(successors)
    }

    /// Redoes an undecided step now that the successors of the other
    /// analyses are known. States that were decided are returned unchanged.
    pub fn strengthen(
        &self,
        state: &AutomatonState,
        edge: &CfaEdge,
        foreign: &mut [Box<dyn QueryableState>],
    ) -> ExecutionResult<Vec<AutomatonState>> {
        let AutomatonState::Unknown {
            state: previous,
            vars,
        } = state
        else {
            return Ok(vec![state.clone()]);
        };

        Ok(match self.follow(*previous, vars, edge, foreign)? {
            Step::Fired(AutomatonState::Bottom) => vec![],
            Step::Fired(next) => vec![next],
            Step::NoMatch => vec![AutomatonState::Regular {
                state: *previous,
                vars: vars.clone(),
            }],
            Step::Undecided => {
                warn!(
                    "Automaton `{}`: could not decide the step from {} on {}, going to TOP",
                    self.automaton.name(),
                    self.automaton.state_name(*previous),
                    edge
                );
                vec![AutomatonState::Top]
            }
        })
    }

    pub fn join(&self, a: &AutomatonState, b: &AutomatonState) -> AutomatonState {
        match (a, b) {
            _ if a == b => a.clone(),
            (AutomatonState::Top, _) | (_, AutomatonState::Top) => AutomatonState::Top,
            (AutomatonState::Bottom, other) | (other, AutomatonState::Bottom) => other.clone(),
            _ => AutomatonState::Top,
        }
    }

    pub fn is_less_or_equal(&self, a: &AutomatonState, b: &AutomatonState) -> bool {
        a == b || *b == AutomatonState::Top || *a == AutomatonState::Bottom
    }

    /// Merge-sep: states are never combined
    pub fn merge(&self, _state: &AutomatonState, reached: &AutomatonState) -> AutomatonState {
        reached.clone()
    }

    /// Stop-sep: covered if a single reached state is at least as general
    pub fn stop(&self, state: &AutomatonState, reached: &[AutomatonState]) -> bool {
        reached.iter().any(|r| self.is_less_or_equal(state, r))
    }

    pub fn precision_adjustment(
        &self,
        state: &AutomatonState,
        precision: StaticPrecision,
    ) -> (AutomatonState, StaticPrecision) {
        (state.clone(), precision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::DiagnosticHandler;
    use crate::ir::tests::build_locking_automaton;
    use crate::parser::parse_automaton_file;
    use crate::trace_parser::parse_trace_file;
    use crate::query::tests::TableState;
    use crate::query::QueryValue;

    fn vars(pairs: &[(&str, i64)]) -> VariableEnvironment {
        pairs.iter().map(|(n, v)| Variable::new(*n, *v)).collect()
    }

    fn no_foreign() -> Vec<Box<dyn QueryableState>> {
        vec![]
    }

    fn single(
        cpa: &AutomatonCpa,
        state: &AutomatonState,
        edge: &CfaEdge,
        foreign: &mut [Box<dyn QueryableState>],
    ) -> AutomatonState {
        let mut successors = cpa.successors(state, edge, foreign).unwrap();
        assert_eq!(successors.len(), 1);
        successors.remove(0)
    }

    fn automaton(states: Vec<InternalState>, vars: VariableEnvironment) -> AutomatonCpa {
        AutomatonCpa::new(
            Automaton::new("Test", AutomatonKind::Control, vars, states, "A").unwrap(),
        )
    }

    fn check(query: &str) -> BoolExpr {
        BoolExpr::CpaQuery {
            cpa: "value".to_string(),
            query: query.to_string(),
        }
    }

    #[test]
    fn locking_automaton_finds_double_lock() {
        let cpa = AutomatonCpa::new(build_locking_automaton(AutomatonKind::Observer));
        let mut foreign = no_foreign();
        let init = cpa.initial_state();
        assert_eq!(cpa.format_state(&init), "Init {locks=0}");

        let locked = single(&cpa, &init, &CfaEdge::new("lock(&m);", 1), &mut foreign);
        assert_eq!(cpa.format_state(&locked), "Locked {locks=1}");

        // no transition matches: the state stays as it is
        let same = single(&cpa, &locked, &CfaEdge::new("x = 1;", 2), &mut foreign);
        assert_eq!(same, locked);

        let error = single(&cpa, &locked, &CfaEdge::new("lock(&m);", 3), &mut foreign);
        assert!(error.is_target());
        assert_eq!(error.vars(), locked.vars());

        // ERROR has no transitions
        let still_error = single(&cpa, &error, &CfaEdge::new("unlock(&m);", 4), &mut foreign);
        assert!(still_error.is_target());
    }

    fn run_fixture(trace: &str) -> Vec<(u32, AutomatonState)> {
        let mut handler = DiagnosticHandler::default();
        let automaton = parse_automaton_file("tests/automata/locking.spc", &mut handler).unwrap();
        let edges = parse_trace_file(trace, &mut handler).unwrap();
        let cpa = AutomatonCpa::new(automaton);
        let mut foreign = no_foreign();

        let mut state = cpa.initial_state();
        let mut visited = vec![];
        for edge in &edges {
            state = single(&cpa, &state, edge, &mut foreign);
            visited.push((edge.line(), state.clone()));
            if state.is_target() {
                break;
            }
        }
        visited
    }

    #[test]
    fn double_lock_trace_reaches_error() {
        let visited = run_fixture("tests/traces/double_lock.trace");
        let (line, last) = visited.last().unwrap();
        assert_eq!(*line, 15);
        assert!(last.is_target());
        let vars = last.vars().unwrap();
        assert_eq!(vars.value("locks"), Some(1));
        assert_eq!(vars.value("last_line"), Some(14));
        // only the last state is a target
        assert!(visited[..visited.len() - 1]
            .iter()
            .all(|(_, s)| !s.is_target()));
    }

    #[test]
    fn clean_trace_stays_safe() {
        let visited = run_fixture("tests/traces/clean.trace");
        assert_eq!(visited.len(), 5);
        assert!(visited.iter().all(|(_, s)| !s.is_target()));
        let (_, last) = visited.last().unwrap();
        assert_eq!(last.vars().and_then(|v| v.value("locks")), Some(0));
    }

    #[test]
    fn first_true_transition_fires() {
        let cpa = automaton(
            vec![
                InternalState::new(
                    "A",
                    vec![
                        Transition::new(vec![BoolExpr::False], vec![], vec![], "B"),
                        Transition::new(vec![BoolExpr::True], vec![], vec![], "C"),
                        Transition::new(vec![BoolExpr::True], vec![], vec![], "B"),
                    ],
                ),
                InternalState::new("B", vec![]),
                InternalState::new("C", vec![]),
            ],
            VariableEnvironment::default(),
        );
        let next = single(&cpa, &cpa.initial_state(), &CfaEdge::blank(1), &mut no_foreign());
        assert_eq!(next.internal_state(), cpa.automaton().state_by_name("C"));
    }

    #[test]
    fn failed_assertion_leads_to_error_with_old_variables() {
        let cpa = automaton(
            vec![InternalState::new(
                "A",
                vec![Transition::new(
                    vec![BoolExpr::True],
                    vec![BoolExpr::IntEq(
                        IntExpr::VarAccess("x".to_string()),
                        IntExpr::Const(1),
                    )],
                    vec![ActionExpr::Assign("x".to_string(), IntExpr::Const(5))],
                    "A",
                )],
            )],
            vars(&[("x", 0)]),
        );
        let next = single(&cpa, &cpa.initial_state(), &CfaEdge::blank(1), &mut no_foreign());
        assert!(next.is_target());
        assert_eq!(next.vars().and_then(|v| v.value("x")), Some(0));
    }

    #[test]
    fn stop_yields_no_successor() {
        let cpa = automaton(
            vec![InternalState::new(
                "A",
                vec![Transition::new(
                    vec![BoolExpr::MatchEdgeExact("abort();".to_string())],
                    vec![],
                    vec![],
                    BOTTOM_STATE_NAME,
                )],
            )],
            VariableEnvironment::default(),
        );
        let init = cpa.initial_state();
        let mut foreign = no_foreign();
        assert!(cpa
            .successors(&init, &CfaEdge::new("abort();", 1), &mut foreign)
            .unwrap()
            .is_empty());
        assert!(cpa
            .successors(&AutomatonState::Bottom, &CfaEdge::blank(2), &mut foreign)
            .unwrap()
            .is_empty());
        assert_eq!(
            single(&cpa, &AutomatonState::Top, &CfaEdge::blank(3), &mut foreign),
            AutomatonState::Top
        );
    }

    #[test]
    fn undecided_step_is_resolved_by_strengthen() {
        let cpa = automaton(
            vec![
                InternalState::new(
                    "A",
                    vec![Transition::new(vec![check("is_null")], vec![], vec![], "Null")],
                ),
                InternalState::new("Null", vec![]),
            ],
            VariableEnvironment::default(),
        );
        let init = cpa.initial_state();
        let edge = CfaEdge::new("p = malloc(4);", 1);

        // nobody to ask yet
        let unknown = single(&cpa, &init, &edge, &mut no_foreign());
        assert!(matches!(unknown, AutomatonState::Unknown { .. }));
        // transfer keeps unknown states for strengthen
        assert_eq!(single(&cpa, &unknown, &edge, &mut no_foreign()), unknown);

        let mut yes: Vec<Box<dyn QueryableState>> = vec![Box::new(
            TableState::new("value").answer("is_null", QueryValue::Bool(true)),
        )];
        let strengthened = cpa.strengthen(&unknown, &edge, &mut yes).unwrap();
        assert_eq!(
            strengthened[0].internal_state(),
            cpa.automaton().state_by_name("Null")
        );

        let mut no: Vec<Box<dyn QueryableState>> = vec![Box::new(
            TableState::new("value").answer("is_null", QueryValue::Bool(false)),
        )];
        let strengthened = cpa.strengthen(&unknown, &edge, &mut no).unwrap();
        assert_eq!(strengthened, vec![init.clone()]);

        // still nobody to ask
        let strengthened = cpa.strengthen(&unknown, &edge, &mut no_foreign()).unwrap();
        assert_eq!(strengthened, vec![AutomatonState::Top]);

        // regular states pass through untouched
        assert_eq!(
            cpa.strengthen(&init, &edge, &mut no_foreign()).unwrap(),
            vec![init]
        );
    }

    #[test]
    fn actions_that_cannot_execute_defer_the_step() {
        let cpa = automaton(
            vec![InternalState::new(
                "A",
                vec![Transition::new(
                    vec![BoolExpr::True],
                    vec![],
                    vec![ActionExpr::Assign(
                        "size".to_string(),
                        IntExpr::CpaQuery {
                            cpa: "value".to_string(),
                            query: "size".to_string(),
                        },
                    )],
                    "A",
                )],
            )],
            vars(&[("size", 0)]),
        );
        let init = cpa.initial_state();
        let edge = CfaEdge::blank(1);
        let unknown = single(&cpa, &init, &edge, &mut no_foreign());
        assert!(matches!(unknown, AutomatonState::Unknown { .. }));

        let mut foreign: Vec<Box<dyn QueryableState>> = vec![Box::new(
            TableState::new("value").answer("size", QueryValue::Int(16)),
        )];
        let resolved = cpa.strengthen(&unknown, &edge, &mut foreign).unwrap();
        assert_eq!(resolved[0].vars().and_then(|v| v.value("size")), Some(16));
    }

    #[test]
    fn modifications_reach_foreign_states() {
        let cpa = automaton(
            vec![InternalState::new(
                "A",
                vec![Transition::new(
                    vec![BoolExpr::ast("free($1)").unwrap()],
                    vec![],
                    vec![ActionExpr::Modify {
                        cpa: "value".to_string(),
                        command: "$1:=0".to_string(),
                    }],
                    "A",
                )],
            )],
            VariableEnvironment::default(),
        );
        let mut foreign: Vec<Box<dyn QueryableState>> = vec![Box::new(TableState::new("value"))];
        single(&cpa, &cpa.initial_state(), &CfaEdge::new("free(p);", 1), &mut foreign);
        assert_eq!(foreign[0].evaluate_property("p"), Ok(QueryValue::Int(0)));
    }

    #[test]
    fn state_equality() {
        let a = AutomatonState::Regular {
            state: StateRef::Error,
            vars: vars(&[("x", 1)]),
        };
        let b = AutomatonState::Regular {
            state: StateRef::Error,
            vars: vars(&[("x", 1)]),
        };
        let c = AutomatonState::Regular {
            state: StateRef::Error,
            vars: vars(&[("x", 2)]),
        };
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, AutomatonState::Top);
        assert_ne!(AutomatonState::Top, AutomatonState::Bottom);
        assert_eq!(AutomatonState::Top, AutomatonState::Top);
        let unknown = AutomatonState::Unknown {
            state: StateRef::Error,
            vars: vars(&[("x", 1)]),
        };
        assert_ne!(a, unknown);
    }

    #[test]
    fn lattice_operators() {
        let cpa = AutomatonCpa::new(build_locking_automaton(AutomatonKind::Observer));
        let init = cpa.initial_state();
        let locked = single(&cpa, &init, &CfaEdge::new("lock(&m);", 1), &mut no_foreign());
        let (top, bottom) = (AutomatonState::Top, AutomatonState::Bottom);

        assert_eq!(cpa.join(&init, &init), init);
        assert_eq!(cpa.join(&init, &locked), top);
        assert_eq!(cpa.join(&bottom, &locked), locked);
        assert_eq!(cpa.join(&top, &bottom), top);

        assert!(cpa.is_less_or_equal(&init, &init));
        assert!(cpa.is_less_or_equal(&init, &top));
        assert!(cpa.is_less_or_equal(&bottom, &init));
        assert!(!cpa.is_less_or_equal(&init, &locked));
        assert!(!cpa.is_less_or_equal(&top, &init));

        assert_eq!(cpa.merge(&init, &locked), locked);
        assert!(cpa.stop(&init, &[locked.clone(), init.clone()]));
        assert!(!cpa.stop(&init, &[locked]));
        assert!(cpa.stop(&init, &[top]));

        let precision = cpa.initial_precision();
        assert_eq!(cpa.precision_adjustment(&init, precision), (init, precision));
    }
}
