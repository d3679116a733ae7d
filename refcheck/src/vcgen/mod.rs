//! Verification-condition generation
//!
//! An obligation is either *scalar* (the assumed facts imply an arithmetic
//! or boolean goal) or *state* (every state combination the tracked objects
//! may be in satisfies the predicate). State obligations carry, per
//! combination, the residual term left after the state atoms were folded;
//! a residual of `false` is a violation, anything other than `true` goes to
//! the scalar backend.

mod instantiate;
mod smt;
mod term;

pub use instantiate::{admitted_states, instantiate, Bindings, Instance};
pub use smt::{render_query, smt_symbol, SmtScript};
pub use term::{ArithOp, CmpOp, Sort, Symbol, Term};

use std::collections::BTreeSet;

use serde::Serialize;

use crate::ast::Location;
use crate::predicate::Pred;
use crate::symbolic::StateValue;

/// Kind of obligation, as reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ObligationKind {
    Precondition,
    PostconditionMismatch,
    StateTransitionIllegal,
    GhostMismatch,
    /// The obligation could be neither proved nor refuted
    Unknown,
}

impl std::fmt::Display for ObligationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ObligationKind::Precondition => "Precondition",
            ObligationKind::PostconditionMismatch => "PostconditionMismatch",
            ObligationKind::StateTransitionIllegal => "StateTransitionIllegal",
            ObligationKind::GhostMismatch => "GhostMismatch",
            ObligationKind::Unknown => "Unknown",
        };
        write!(f, "{name}")
    }
}

/// Where an obligation comes from
#[derive(Debug, Clone, PartialEq)]
pub struct VcOrigin {
    pub kind: ObligationKind,
    /// Method being verified
    pub method: String,
    pub loc: Location,
    /// Callee whose contract is checked, for call-site obligations
    pub callee: Option<String>,
    /// Declared predicate text
    pub declared: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScalarVc {
    pub origin: VcOrigin,
    pub assumptions: Vec<Term>,
    pub goal: Term,
    pub abstracted: BTreeSet<String>,
}

impl ScalarVc {
    /// `assumptions && !goal`; the obligation holds iff this is unsatisfiable
    pub fn negated_query(&self) -> Term {
        Term::and(self.assumptions.iter().cloned().chain([Term::not(self.goal.clone())]))
    }
}

/// An object whose state the predicate reads
#[derive(Debug, Clone, PartialEq)]
pub struct StateTarget {
    pub label: String,
    pub current: StateValue,
}

/// One combination of states and what remains of the predicate under it
#[derive(Debug, Clone, PartialEq)]
pub struct StateCase {
    pub states: Vec<String>,
    pub residual: Term,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateVc {
    pub origin: VcOrigin,
    pub targets: Vec<StateTarget>,
    /// Empty when some target state is not known
    pub cases: Vec<StateCase>,
    pub assumptions: Vec<Term>,
    pub abstracted: BTreeSet<String>,
}

impl StateVc {
    pub fn is_determined(&self) -> bool {
        self.targets.iter().all(|t| matches!(t.current, StateValue::Known(_)))
    }

    /// Scalar obligation formed by the non-trivial residuals
    pub fn residual_vc(&self) -> Option<ScalarVc> {
        let residuals: Vec<Term> = self
            .cases
            .iter()
            .map(|c| c.residual.clone())
            .filter(|t| *t != Term::Bool(true))
            .collect();
        if residuals.is_empty() {
            return None;
        }
        Some(ScalarVc {
            origin: self.origin.clone(),
            assumptions: self.assumptions.clone(),
            goal: Term::and(residuals),
            abstracted: self.abstracted.clone(),
        })
    }

    /// Current states as `label = state` pairs
    pub fn describe_current(&self) -> String {
        self.targets
            .iter()
            .map(|t| format!("{} = {}", t.label, t.current))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Vc {
    Scalar(ScalarVc),
    State(StateVc),
}

impl Vc {
    pub fn origin(&self) -> &VcOrigin {
        match self {
            Vc::Scalar(vc) => &vc.origin,
            Vc::State(vc) => &vc.origin,
        }
    }

    /// Human-readable instantiated form
    pub fn instantiated(&self) -> String {
        match self {
            Vc::Scalar(vc) => vc.goal.to_string(),
            Vc::State(vc) => vc.describe_current(),
        }
    }
}

/// Largest number of state combinations enumerated for one obligation
const MAX_STATE_CASES: usize = 4096;

/// Build the obligation that `pred` holds under `bindings`, given `facts`.
///
/// `label` names a tracked object for messages and witnesses.
pub fn obligation(
    origin: VcOrigin,
    pred: &Pred,
    bindings: &Bindings<'_>,
    facts: &[Term],
    label: &dyn Fn(&str, bool) -> String,
) -> Vc {
    let first_pass = instantiate(pred, bindings);
    if first_pass.state_reads.is_empty() {
        return Vc::Scalar(ScalarVc {
            origin,
            assumptions: facts.to_vec(),
            goal: first_pass.term,
            abstracted: first_pass.abstracted,
        });
    }

    let reads: Vec<(String, bool)> = first_pass.state_reads.iter().cloned().collect();
    let targets: Vec<StateTarget> = reads
        .iter()
        .map(|(id, old)| StateTarget {
            label: label(id, *old),
            current: bindings.state_of(id, *old),
        })
        .collect();

    let mut vc = StateVc {
        origin,
        targets,
        cases: Vec::new(),
        assumptions: facts.to_vec(),
        abstracted: BTreeSet::new(),
    };
    if !vc.is_determined() {
        return Vc::State(vc);
    }

    let domains: Vec<Vec<String>> = vc
        .targets
        .iter()
        .map(|t| match &t.current {
            StateValue::Known(states) => states.iter().cloned().collect(),
            _ => Vec::new(),
        })
        .collect();
    let total: usize = domains.iter().map(Vec::len).product();
    if total == 0 || total > MAX_STATE_CASES {
        vc.targets.iter_mut().for_each(|t| t.current = StateValue::Unknown);
        return Vc::State(vc);
    }

    for index in 0..total {
        let mut rem = index;
        let mut states = Vec::with_capacity(domains.len());
        let mut pinned = bindings.clone();
        for ((id, old), domain) in reads.iter().zip(&domains) {
            let state = domain[rem % domain.len()].clone();
            rem /= domain.len();
            pinned.fixed_states.insert((id.clone(), *old), state.clone());
            states.push(state);
        }
        let inst = instantiate(pred, &pinned);
        vc.abstracted.extend(inst.abstracted);
        vc.cases.push(StateCase {
            states,
            residual: inst.term,
        });
    }
    Vc::State(vc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Spanned, TypeRef};
    use crate::predicate::{node, PredBinOp, PredExpr};
    use crate::symbolic::{Env, ObjState, Value};

    fn origin() -> VcOrigin {
        VcOrigin {
            kind: ObligationKind::StateTransitionIllegal,
            method: "Main.main".into(),
            loc: Location::new(4, 9),
            callee: Some("LightBulb.turnOff".into()),
            declared: "on(this)".into(),
        }
    }

    fn state_atom(name: &str) -> Pred {
        node(PredExpr::State {
            name: name.into(),
            target: Box::new(node(PredExpr::This)),
        })
    }

    fn env_with(state: StateValue) -> Env {
        let mut env = Env::default();
        env.objects.insert("b".into(), ObjState::new(TypeRef::simple("LightBulb"), state));
        env.vars.insert("bulb".into(), Value::Object("b".into()));
        env
    }

    fn label(id: &str, _old: bool) -> String {
        id.to_string()
    }

    #[test]
    fn test_scalar_obligation_without_state_atoms() {
        let env = Env::default();
        let pred = Spanned::new(PredExpr::Bool(true), Default::default());
        let vc = obligation(origin(), &pred, &Bindings::new(&env), &[], &label);
        match vc {
            Vc::Scalar(vc) => assert_eq!(vc.goal, Term::Bool(true)),
            other => panic!("expected scalar obligation, got {other:?}"),
        }
    }

    #[test]
    fn test_state_obligation_cases() {
        let env = env_with(StateValue::single("off"));
        let b = Bindings::new(&env).with_this(Some("b".into()));
        let Vc::State(vc) = obligation(origin(), &state_atom("on"), &b, &[], &label) else {
            panic!("expected state obligation");
        };
        assert!(vc.is_determined());
        assert_eq!(vc.cases.len(), 1);
        assert_eq!(vc.cases[0].residual, Term::Bool(false));
        assert_eq!(vc.describe_current(), "b = off");
    }

    #[test]
    fn test_unknown_state_is_undetermined() {
        let env = env_with(StateValue::Unknown);
        let b = Bindings::new(&env).with_this(Some("b".into()));
        let Vc::State(vc) = obligation(origin(), &state_atom("on"), &b, &[], &label) else {
            panic!("expected state obligation");
        };
        assert!(!vc.is_determined());
        assert!(vc.cases.is_empty());
    }

    #[test]
    fn test_residual_combines_scalar_parts() {
        let env = env_with(StateValue::Known(BTreeSet::from(["off".to_string(), "on".to_string()])));
        let b = Bindings::new(&env)
            .with_this(Some("b".into()))
            .bind("level", Value::Scalar(Term::var("level", Sort::Int)), Some(Sort::Int));
        // on(this) || level > 0
        let pred = node(PredExpr::Binary {
            op: PredBinOp::Or,
            lhs: Box::new(state_atom("on")),
            rhs: Box::new(node(PredExpr::Binary {
                op: PredBinOp::Gt,
                lhs: Box::new(node(PredExpr::Var("level".into()))),
                rhs: Box::new(node(PredExpr::Int(0))),
            })),
        });
        let Vc::State(vc) = obligation(origin(), &pred, &b, &[], &label) else {
            panic!("expected state obligation");
        };
        let residual = vc.residual_vc().unwrap();
        assert_eq!(residual.goal.to_string(), "level > 0");
    }
}
