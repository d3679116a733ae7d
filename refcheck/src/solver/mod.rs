//! Solver adapter
//!
//! Scalar obligations go to a [`ScalarBackend`]: the built-in
//! linear-arithmetic procedure or an external Z3 process. State obligations
//! are discharged in closed form from their enumerated cases; only the
//! scalar residue of a case ever reaches a backend.

mod linear;
mod rational;
mod z3;

pub use linear::LinearSolver;
pub use rational::Rational;
pub use z3::Z3Process;

use std::collections::BTreeMap;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::{SolverKind, VerifierConfig};
use crate::vcgen::{ScalarVc, StateVc, Term, Vc};

/// Counterexample: symbol or object label to value
pub type Witness = BTreeMap<String, String>;

/// Three-valued discharge result
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Proved,
    /// Refuted; the witness may be empty when no model was produced
    Disproved(Witness),
    Unknown(UnknownReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnknownReason {
    /// An object the obligation reads is in an unknown state
    UnknownState(String),
    /// The backend gave up (timeout, incompleteness, limits)
    Solver(String),
}

impl std::fmt::Display for UnknownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnknownReason::UnknownState(current) => write!(f, "state not determined: {current}"),
            UnknownReason::Solver(reason) => write!(f, "{reason}"),
        }
    }
}

/// Backend failure; reported as `Unknown` by the adapter
#[derive(Debug, Error)]
pub enum SolverError {
    #[error("failed to start solver `{}`: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("solver I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected solver output: {0}")]
    Parse(String),
}

/// Decision procedure for scalar obligations
pub trait ScalarBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Decide `assumptions => goal`
    fn check(&self, vc: &ScalarVc) -> Result<Outcome, SolverError>;
}

/// Discharges obligations of both kinds
pub struct SolverAdapter {
    backend: Box<dyn ScalarBackend>,
}

impl SolverAdapter {
    pub fn new(backend: Box<dyn ScalarBackend>) -> Self {
        Self { backend }
    }

    pub fn from_config(config: &VerifierConfig) -> Self {
        let backend: Box<dyn ScalarBackend> = match config.solver {
            SolverKind::Builtin => Box::new(
                LinearSolver::new()
                    .with_timeout(config.timeout())
                    .with_limits(config.max_dnf_clauses, config.max_constraints),
            ),
            SolverKind::Z3 => {
                let z3 = Z3Process::new(config.z3_path.clone()).with_timeout(config.timeout());
                match z3.probe() {
                    Some(version) => debug!(%version, "using z3"),
                    None => warn!(path = %config.z3_path.display(), "z3 cannot be started, scalar obligations will be undecided"),
                }
                Box::new(z3)
            }
        };
        Self { backend }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn discharge(&self, vc: &Vc) -> Outcome {
        match vc {
            Vc::Scalar(vc) => self.discharge_scalar(vc),
            Vc::State(vc) => self.discharge_state(vc),
        }
    }

    fn discharge_scalar(&self, vc: &ScalarVc) -> Outcome {
        if vc.goal == Term::Bool(true) || vc.negated_query() == Term::Bool(false) {
            return Outcome::Proved;
        }
        let outcome = match self.backend.check(vc) {
            Ok(outcome) => outcome,
            Err(e) => Outcome::Unknown(UnknownReason::Solver(e.to_string())),
        };
        trace!(backend = self.backend.name(), goal = %vc.goal, ?outcome, "scalar obligation");
        match outcome {
            Outcome::Disproved(witness) => match witness.keys().find(|k| k.starts_with('?')) {
                Some(key) => Outcome::Unknown(UnknownReason::Solver(format!(
                    "counterexample depends on abstracted term {key}"
                ))),
                None => Outcome::Disproved(witness),
            },
            other => other,
        }
    }

    fn discharge_state(&self, vc: &StateVc) -> Outcome {
        if !vc.is_determined() {
            return Outcome::Unknown(UnknownReason::UnknownState(vc.describe_current()));
        }
        if let Some(case) = vc.cases.iter().find(|c| c.residual == Term::Bool(false)) {
            let witness = vc
                .targets
                .iter()
                .zip(&case.states)
                .map(|(t, s)| (t.label.clone(), s.clone()))
                .collect();
            return Outcome::Disproved(witness);
        }
        match vc.residual_vc() {
            None => Outcome::Proved,
            Some(scalar) => self.discharge_scalar(&scalar),
        }
    }
}

impl Default for SolverAdapter {
    fn default() -> Self {
        Self::new(Box::new(LinearSolver::new()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::ast::Location;
    use crate::symbolic::StateValue;
    use crate::vcgen::{CmpOp, ObligationKind, Sort, StateCase, StateTarget, VcOrigin};

    fn origin(kind: ObligationKind) -> VcOrigin {
        VcOrigin {
            kind,
            method: "Main.main".into(),
            loc: Location::new(7, 9),
            callee: Some("Socket.connect".into()),
            declared: "bound(this)".into(),
        }
    }

    fn state_vc(current: StateValue, cases: Vec<StateCase>) -> Vc {
        Vc::State(StateVc {
            origin: origin(ObligationKind::Precondition),
            targets: vec![StateTarget {
                label: "socket".into(),
                current,
            }],
            cases,
            assumptions: Vec::new(),
            abstracted: BTreeSet::new(),
        })
    }

    /// Backend that refutes everything with a fixed model
    struct Refuter(Witness);

    impl ScalarBackend for Refuter {
        fn name(&self) -> &'static str {
            "refuter"
        }

        fn check(&self, _vc: &ScalarVc) -> Result<Outcome, SolverError> {
            Ok(Outcome::Disproved(self.0.clone()))
        }
    }

    struct Broken;

    impl ScalarBackend for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn check(&self, _vc: &ScalarVc) -> Result<Outcome, SolverError> {
            Err(SolverError::Parse("garbage".into()))
        }
    }

    #[test]
    fn test_state_violation_reports_current_state() {
        let vc = state_vc(
            StateValue::single("unconnected"),
            vec![StateCase {
                states: vec!["unconnected".into()],
                residual: Term::Bool(false),
            }],
        );
        let Outcome::Disproved(witness) = SolverAdapter::default().discharge(&vc) else {
            panic!("expected a refutation");
        };
        assert_eq!(witness["socket"], "unconnected");
    }

    #[test]
    fn test_unknown_state_is_potential_violation() {
        let vc = state_vc(StateValue::Unknown, Vec::new());
        assert_eq!(
            SolverAdapter::default().discharge(&vc),
            Outcome::Unknown(UnknownReason::UnknownState("socket = unknown".into()))
        );
    }

    #[test]
    fn test_trivial_goal_skips_backend() {
        let vc = Vc::Scalar(ScalarVc {
            origin: origin(ObligationKind::Precondition),
            assumptions: Vec::new(),
            goal: Term::Bool(true),
            abstracted: BTreeSet::new(),
        });
        let adapter = SolverAdapter::new(Box::new(Refuter(Witness::new())));
        assert_eq!(adapter.discharge(&vc), Outcome::Proved);
    }

    #[test]
    fn test_abstracted_witness_is_not_trusted() {
        let vc = Vc::Scalar(ScalarVc {
            origin: origin(ObligationKind::Precondition),
            assumptions: Vec::new(),
            goal: Term::cmp(CmpOp::Gt, Term::var("x", Sort::Int), Term::Int(0)),
            abstracted: BTreeSet::new(),
        });
        let witness = Witness::from([("?(x * x)".to_string(), "0".to_string())]);
        let adapter = SolverAdapter::new(Box::new(Refuter(witness)));
        assert!(matches!(
            adapter.discharge(&vc),
            Outcome::Unknown(UnknownReason::Solver(reason)) if reason.contains("abstracted")
        ));
    }

    #[test]
    fn test_backend_error_is_unknown() {
        let vc = Vc::Scalar(ScalarVc {
            origin: origin(ObligationKind::Precondition),
            assumptions: Vec::new(),
            goal: Term::var("b", Sort::Bool),
            abstracted: BTreeSet::new(),
        });
        let adapter = SolverAdapter::new(Box::new(Broken));
        assert_eq!(
            adapter.discharge(&vc),
            Outcome::Unknown(UnknownReason::Solver("unexpected solver output: garbage".into()))
        );
    }

    #[test]
    fn test_residual_goes_to_backend() {
        let level = Term::var("level", Sort::Int);
        let vc = Vc::State(StateVc {
            origin: origin(ObligationKind::StateTransitionIllegal),
            targets: vec![StateTarget {
                label: "bulb".into(),
                current: StateValue::Known(BTreeSet::from(["off".to_string(), "on".to_string()])),
            }],
            cases: vec![
                StateCase {
                    states: vec!["off".into()],
                    residual: Term::cmp(CmpOp::Gt, level.clone(), Term::Int(0)),
                },
                StateCase {
                    states: vec!["on".into()],
                    residual: Term::Bool(true),
                },
            ],
            assumptions: vec![Term::cmp(CmpOp::Eq, level, Term::Int(3))],
            abstracted: BTreeSet::new(),
        });
        assert_eq!(SolverAdapter::default().discharge(&vc), Outcome::Proved);
    }
}
