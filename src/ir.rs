// Copyright 2025 Cornell University
// released under MIT License

use cranelift_entity::{entity_impl, PrimaryMap};
use log::warn;
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::ops::Index;

use crate::c_ast::{parse_statement, CStatement};
use crate::errors::{ConfigError, ConfigResult};

/// Name of the pseudo-state that marks a property violation
pub const ERROR_STATE_NAME: &str = "ERROR";
/// Name of the pseudo-state that marks an infeasible path
pub const BOTTOM_STATE_NAME: &str = "BOTTOM";

#[derive(Clone, Copy, Hash, PartialEq, Eq, Default)]
pub struct StateId(u32);
entity_impl!(StateId, "state");

/// Reference to an internal state: either one of the automaton's own states
/// or one of the two pseudo-states shared by every automaton.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum StateRef {
    State(StateId),
    Error,
    Bottom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarType {
    Int,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    name: String,
    tpe: VarType,
    value: i64,
}

impl Variable {
    pub fn new(name: impl Into<String>, value: i64) -> Self {
        Self {
            name: name.into(),
            tpe: VarType::Int,
            value,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tpe(&self) -> VarType {
        self.tpe
    }

    pub fn value(&self) -> i64 {
        self.value
    }
}

/// The variables of one automaton instance. Every abstract state owns its
/// own copy; successors are built from a clone, never by mutating a predecessor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableEnvironment {
    vars: FxHashMap<String, Variable>,
}

impl VariableEnvironment {
    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.vars.get(name)
    }

    pub fn value(&self, name: &str) -> Option<i64> {
        self.vars.get(name).map(Variable::value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    /// Writes `value` into `name`, creating the variable if needed
    pub fn assign(&mut self, name: &str, value: i64) {
        match self.vars.get_mut(name) {
            Some(var) => var.value = value,
            None => {
                self.vars.insert(name.to_string(), Variable::new(name, value));
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.vars.values()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl FromIterator<Variable> for VariableEnvironment {
    fn from_iter<I: IntoIterator<Item = Variable>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|var| (var.name.clone(), var))
                .collect(),
        }
    }
}

/// Result of a boolean expression: `Maybe` means "not enough information yet"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaybeBoolean {
    True,
    False,
    Maybe,
}

impl MaybeBoolean {
    /// Conjunction table. `False` absorbs; an undecided left operand
    /// defers to the right one.
    pub fn and(self, other: MaybeBoolean) -> MaybeBoolean {
        use MaybeBoolean::*;
        match (self, other) {
            (False, _) | (_, False) => False,
            (True | Maybe, b) => b,
        }
    }

    /// Disjunction table. `True` absorbs; an undecided left operand
    /// defers to the right one.
    pub fn or(self, other: MaybeBoolean) -> MaybeBoolean {
        use MaybeBoolean::*;
        match (self, other) {
            (True, _) | (_, True) => True,
            (False | Maybe, b) => b,
        }
    }

    pub fn negate(self) -> MaybeBoolean {
        match self {
            MaybeBoolean::True => MaybeBoolean::False,
            MaybeBoolean::False => MaybeBoolean::True,
            MaybeBoolean::Maybe => MaybeBoolean::Maybe,
        }
    }

    /// Equality of two results; undecided if either side is undecided
    pub fn equals(self, other: MaybeBoolean) -> MaybeBoolean {
        if self == MaybeBoolean::Maybe || other == MaybeBoolean::Maybe {
            MaybeBoolean::Maybe
        } else {
            MaybeBoolean::from(self == other)
        }
    }
}

impl From<bool> for MaybeBoolean {
    fn from(value: bool) -> Self {
        if value {
            MaybeBoolean::True
        } else {
            MaybeBoolean::False
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntExpr {
    Const(i64),
    /// `$N` (transition capture), `$line`, or the name of an automaton variable
    VarAccess(String),
    CpaQuery {
        cpa: String,
        query: String,
    },
    Plus(Box<IntExpr>, Box<IntExpr>),
    Minus(Box<IntExpr>, Box<IntExpr>),
}

/// A regular expression that has to match the whole input
#[derive(Debug, Clone)]
pub struct FullRegex {
    source: String,
    regex: Regex,
}

impl FullRegex {
    pub fn new(source: &str) -> ConfigResult<Self> {
        let regex =
            Regex::new(&format!("^(?:{})$", source)).map_err(|e| ConfigError::InvalidRegex {
                pattern: source.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

/// A C statement pattern, parsed once when the automaton is built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AstPattern {
    source: String,
    pattern: CStatement,
}

impl AstPattern {
    pub fn new(source: &str) -> ConfigResult<Self> {
        let pattern = parse_statement(source).map_err(|message| ConfigError::InvalidPattern {
            pattern: source.to_string(),
            message,
        })?;
        Ok(Self {
            source: source.trim().to_string(),
            pattern,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn pattern(&self) -> &CStatement {
        &self.pattern
    }
}

#[derive(Debug, Clone)]
pub enum BoolExpr {
    True,
    False,
    MatchEdgeExact(String),
    MatchEdgeRegex(FullRegex),
    MatchLabelRegex(FullRegex),
    MatchAst(AstPattern),
    IntEq(IntExpr, IntExpr),
    IntNotEq(IntExpr, IntExpr),
    BoolEq(Box<BoolExpr>, Box<BoolExpr>),
    BoolNotEq(Box<BoolExpr>, Box<BoolExpr>),
    And(Box<BoolExpr>, Box<BoolExpr>),
    Or(Box<BoolExpr>, Box<BoolExpr>),
    Not(Box<BoolExpr>),
    CpaQuery { cpa: String, query: String },
    /// Broadcast to every foreign analysis
    AllCpaQuery(String),
}

impl BoolExpr {
    pub fn edge_regex(pattern: &str) -> ConfigResult<Self> {
        FullRegex::new(pattern).map(BoolExpr::MatchEdgeRegex)
    }

    pub fn label_regex(pattern: &str) -> ConfigResult<Self> {
        FullRegex::new(pattern).map(BoolExpr::MatchLabelRegex)
    }

    pub fn ast(pattern: &str) -> ConfigResult<Self> {
        AstPattern::new(pattern).map(BoolExpr::MatchAst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionExpr {
    Print(String),
    Assign(String, IntExpr),
    Modify { cpa: String, command: String },
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub triggers: Vec<BoolExpr>,
    pub assertions: Vec<BoolExpr>,
    pub actions: Vec<ActionExpr>,
    follow_state_name: String,
    follow_state: Option<StateRef>,
}

impl Transition {
    pub fn new(
        triggers: Vec<BoolExpr>,
        assertions: Vec<BoolExpr>,
        actions: Vec<ActionExpr>,
        follow_state_name: impl Into<String>,
    ) -> Self {
        Self {
            triggers,
            assertions,
            actions,
            follow_state_name: follow_state_name.into(),
            follow_state: None,
        }
    }

    pub fn follow_state_name(&self) -> &str {
        &self.follow_state_name
    }

    /// `None` until the automaton has been linked
    pub fn follow_state(&self) -> Option<StateRef> {
        self.follow_state
    }
}

#[derive(Debug, Clone)]
pub struct InternalState {
    name: String,
    transitions: Vec<Transition>,
}

impl InternalState {
    pub fn new(name: impl Into<String>, transitions: Vec<Transition>) -> Self {
        Self {
            name: name.into(),
            transitions,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AutomatonKind {
    /// Read-only monitor: may not cut paths or modify other analyses
    Observer,
    Control,
}

#[derive(Debug, Clone)]
pub struct Automaton {
    name: String,
    kind: AutomatonKind,
    initial_variables: VariableEnvironment,
    states: PrimaryMap<StateId, InternalState>,
    initial_state: StateRef,
}

impl Automaton {
    /// Builds the automaton and links every transition to its follow state.
    /// Forward references are fine; names that do not resolve are reported
    /// together in a single error. Observer automata are checked right away.
    pub fn new(
        name: impl Into<String>,
        kind: AutomatonKind,
        initial_variables: VariableEnvironment,
        states: Vec<InternalState>,
        initial_state_name: &str,
    ) -> ConfigResult<Self> {
        let name = name.into();

        let mut arena = PrimaryMap::new();
        let mut by_name: FxHashMap<String, StateId> = FxHashMap::default();
        for state in states {
            if state.name == ERROR_STATE_NAME || state.name == BOTTOM_STATE_NAME {
                return Err(ConfigError::ReservedStateName {
                    automaton: name,
                    name: state.name,
                });
            }
            if by_name.contains_key(&state.name) {
                return Err(ConfigError::DuplicateState {
                    automaton: name,
                    name: state.name,
                });
            }
            let state_name = state.name.clone();
            let id = arena.push(state);
            by_name.insert(state_name, id);
        }

        let resolve = |target: &str| match target {
            ERROR_STATE_NAME => Some(StateRef::Error),
            BOTTOM_STATE_NAME => Some(StateRef::Bottom),
            other => by_name.get(other).copied().map(StateRef::State),
        };

        // linking pass
        let mut unresolved: Vec<String> = vec![];
        let mut seen = FxHashSet::default();
        for state in arena.values_mut() {
            for transition in &mut state.transitions {
                transition.follow_state = resolve(&transition.follow_state_name);
                if transition.follow_state.is_none()
                    && seen.insert(transition.follow_state_name.clone())
                {
                    unresolved.push(transition.follow_state_name.clone());
                }
            }
        }
        if !unresolved.is_empty() {
            return Err(ConfigError::UnresolvedStates {
                automaton: name,
                names: unresolved,
            });
        }

        let initial_state = match by_name.get(initial_state_name) {
            Some(id) => StateRef::State(*id),
            None => {
                warn!(
                    "Initial state `{}` of automaton `{}` not found, starting in ERROR",
                    initial_state_name, name
                );
                StateRef::Error
            }
        };

        let automaton = Self {
            name,
            kind,
            initial_variables,
            states: arena,
            initial_state,
        };
        if kind == AutomatonKind::Observer {
            automaton.check_observer_restrictions()?;
        }
        Ok(automaton)
    }

    /// An observer never cuts a path (no transition to BOTTOM) and never
    /// changes the state of another analysis.
    pub fn check_observer_restrictions(&self) -> ConfigResult<()> {
        for state in self.states.values() {
            for transition in &state.transitions {
                if transition.follow_state == Some(StateRef::Bottom) {
                    return Err(ConfigError::ObserverViolation {
                        automaton: self.name.clone(),
                        reason: format!(
                            "state `{}` has a transition to {}",
                            state.name, BOTTOM_STATE_NAME
                        ),
                    });
                }
                if transition
                    .actions
                    .iter()
                    .any(|action| matches!(action, ActionExpr::Modify { .. }))
                {
                    return Err(ConfigError::ObserverViolation {
                        automaton: self.name.clone(),
                        reason: format!(
                            "state `{}` modifies the state of another analysis",
                            state.name
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> AutomatonKind {
        self.kind
    }

    pub fn initial_variables(&self) -> &VariableEnvironment {
        &self.initial_variables
    }

    pub fn initial_state(&self) -> StateRef {
        self.initial_state
    }

    pub fn state_ids(&self) -> impl Iterator<Item = StateId> + '_ {
        self.states.keys()
    }

    pub fn states(&self) -> impl Iterator<Item = (StateId, &InternalState)> {
        self.states.iter()
    }

    pub fn state_by_name(&self, name: &str) -> Option<StateRef> {
        match name {
            ERROR_STATE_NAME => Some(StateRef::Error),
            BOTTOM_STATE_NAME => Some(StateRef::Bottom),
            _ => self
                .states
                .iter()
                .find(|(_, s)| s.name == name)
                .map(|(id, _)| StateRef::State(id)),
        }
    }

    /// The pseudo-states have no transitions and hence no `InternalState`
    pub fn internal_state(&self, state: StateRef) -> Option<&InternalState> {
        match state {
            StateRef::State(id) => self.states.get(id),
            StateRef::Error | StateRef::Bottom => None,
        }
    }

    pub fn state_name(&self, state: StateRef) -> &str {
        match state {
            StateRef::State(id) => &self.states[id].name,
            StateRef::Error => ERROR_STATE_NAME,
            StateRef::Bottom => BOTTOM_STATE_NAME,
        }
    }
}

impl Index<StateId> for Automaton {
    type Output = InternalState;

    fn index(&self, index: StateId) -> &Self::Output {
        &self.states[index]
    }
}

impl Index<&StateId> for Automaton {
    type Output = InternalState;

    fn index(&self, index: &StateId) -> &Self::Output {
        &self.states[*index]
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn goto(target: &str) -> Transition {
        Transition::new(vec![BoolExpr::True], vec![], vec![], target)
    }

    /// `Init --lock--> Locked --unlock--> Init`, `Locked --lock--> ERROR`
    pub fn build_locking_automaton(kind: AutomatonKind) -> Automaton {
        let init = InternalState::new(
            "Init",
            vec![Transition::new(
                vec![BoolExpr::ast("lock($?)").unwrap()],
                vec![],
                vec![ActionExpr::Assign(
                    "locks".to_string(),
                    IntExpr::Plus(
                        Box::new(IntExpr::VarAccess("locks".to_string())),
                        Box::new(IntExpr::Const(1)),
                    ),
                )],
                "Locked",
            )],
        );
        let locked = InternalState::new(
            "Locked",
            vec![
                Transition::new(
                    vec![BoolExpr::ast("lock($?)").unwrap()],
                    vec![],
                    vec![ActionExpr::Print("double lock in line $line".to_string())],
                    ERROR_STATE_NAME,
                ),
                Transition::new(
                    vec![BoolExpr::ast("unlock($?)").unwrap()],
                    vec![],
                    vec![],
                    "Init",
                ),
            ],
        );
        let vars: VariableEnvironment = [Variable::new("locks", 0)].into_iter().collect();
        Automaton::new("Locking", kind, vars, vec![init, locked], "Init").unwrap()
    }

    #[test]
    fn maybe_boolean_and_table() {
        use MaybeBoolean::*;
        let expected = [
            ((True, True), True),
            ((True, False), False),
            ((True, Maybe), Maybe),
            ((False, True), False),
            ((False, False), False),
            ((False, Maybe), False),
            ((Maybe, True), True),
            ((Maybe, False), False),
            ((Maybe, Maybe), Maybe),
        ];
        for ((a, b), result) in expected {
            assert_eq!(a.and(b), result, "{:?} && {:?}", a, b);
        }
    }

    #[test]
    fn maybe_boolean_or_table() {
        use MaybeBoolean::*;
        let expected = [
            ((True, True), True),
            ((True, False), True),
            ((True, Maybe), True),
            ((False, True), True),
            ((False, False), False),
            ((False, Maybe), Maybe),
            ((Maybe, True), True),
            ((Maybe, False), False),
            ((Maybe, Maybe), Maybe),
        ];
        for ((a, b), result) in expected {
            assert_eq!(a.or(b), result, "{:?} || {:?}", a, b);
        }
    }

    #[test]
    fn maybe_boolean_negation_and_equality() {
        use MaybeBoolean::*;
        assert_eq!(True.negate(), False);
        assert_eq!(False.negate(), True);
        assert_eq!(Maybe.negate(), Maybe);
        assert_eq!(True.equals(True), True);
        assert_eq!(True.equals(False), False);
        assert_eq!(Maybe.equals(True), Maybe);
        assert_eq!(False.equals(Maybe), Maybe);
    }

    #[test]
    fn forward_references_are_linked() {
        let automaton = Automaton::new(
            "Forward",
            AutomatonKind::Control,
            VariableEnvironment::default(),
            vec![
                InternalState::new("A", vec![goto("B")]),
                InternalState::new("B", vec![goto("A"), goto(ERROR_STATE_NAME)]),
            ],
            "A",
        )
        .unwrap();

        let a = automaton.state_by_name("A").unwrap();
        let b = automaton.state_by_name("B").unwrap();
        let a_state = automaton.internal_state(a).unwrap();
        assert_eq!(a_state.transitions()[0].follow_state(), Some(b));
        let b_state = automaton.internal_state(b).unwrap();
        assert_eq!(b_state.transitions()[0].follow_state(), Some(a));
        assert_eq!(b_state.transitions()[1].follow_state(), Some(StateRef::Error));
        assert_eq!(automaton.state_name(b), "B");
    }

    #[test]
    fn unresolved_names_are_reported_together() {
        let err = Automaton::new(
            "Broken",
            AutomatonKind::Control,
            VariableEnvironment::default(),
            vec![
                InternalState::new("A", vec![goto("Nowhere"), goto("A")]),
                InternalState::new("B", vec![goto("Elsewhere"), goto("Nowhere")]),
            ],
            "A",
        )
        .unwrap_err();
        match err {
            ConfigError::UnresolvedStates { automaton, names } => {
                assert_eq!(automaton, "Broken");
                assert_eq!(names, vec!["Nowhere".to_string(), "Elsewhere".to_string()]);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn duplicate_and_reserved_names_are_rejected() {
        let duplicate = Automaton::new(
            "Dup",
            AutomatonKind::Control,
            VariableEnvironment::default(),
            vec![InternalState::new("A", vec![]), InternalState::new("A", vec![])],
            "A",
        );
        assert!(matches!(duplicate, Err(ConfigError::DuplicateState { .. })));

        let reserved = Automaton::new(
            "Reserved",
            AutomatonKind::Control,
            VariableEnvironment::default(),
            vec![InternalState::new(ERROR_STATE_NAME, vec![])],
            ERROR_STATE_NAME,
        );
        assert!(matches!(reserved, Err(ConfigError::ReservedStateName { .. })));
    }

    #[test]
    fn missing_initial_state_defaults_to_error() {
        let automaton = Automaton::new(
            "NoInit",
            AutomatonKind::Control,
            VariableEnvironment::default(),
            vec![InternalState::new("A", vec![])],
            "Start",
        )
        .unwrap();
        assert_eq!(automaton.initial_state(), StateRef::Error);
    }

    #[test]
    fn observer_may_not_reach_bottom() {
        let states = vec![InternalState::new("A", vec![goto(BOTTOM_STATE_NAME)])];
        let observer = Automaton::new(
            "Cut",
            AutomatonKind::Observer,
            VariableEnvironment::default(),
            states.clone(),
            "A",
        );
        assert!(matches!(observer, Err(ConfigError::ObserverViolation { .. })));

        // the same graph is fine for a control automaton
        let control = Automaton::new(
            "Cut",
            AutomatonKind::Control,
            VariableEnvironment::default(),
            states,
            "A",
        )
        .unwrap();
        assert!(control.check_observer_restrictions().is_err());
    }

    #[test]
    fn observer_may_not_modify_other_analyses() {
        let modify = Transition::new(
            vec![BoolExpr::True],
            vec![],
            vec![ActionExpr::Modify {
                cpa: "value".to_string(),
                command: "x:=0".to_string(),
            }],
            "A",
        );
        let observer = Automaton::new(
            "Meddler",
            AutomatonKind::Observer,
            VariableEnvironment::default(),
            vec![InternalState::new("A", vec![modify])],
            "A",
        );
        assert!(matches!(observer, Err(ConfigError::ObserverViolation { .. })));
    }

    #[test]
    fn locking_automaton_is_a_valid_observer() {
        let automaton = build_locking_automaton(AutomatonKind::Observer);
        assert_eq!(automaton.state_ids().count(), 2);
        assert_eq!(automaton.initial_variables().value("locks"), Some(0));
        assert_eq!(automaton.state_name(automaton.initial_state()), "Init");
    }

    #[test]
    fn invalid_regex_and_pattern_are_config_errors() {
        assert!(matches!(
            BoolExpr::edge_regex("lock("),
            Err(ConfigError::InvalidRegex { .. })
        ));
        assert!(matches!(
            BoolExpr::ast("lock(("),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn full_regex_matches_whole_text_only() {
        let regex = FullRegex::new("lock\\(.*\\);").unwrap();
        assert!(regex.is_match("lock(&m);"));
        assert!(!regex.is_match("unlock(&m);"));
        assert!(!regex.is_match("lock(&m); x = 1;"));
    }
}
