//! Diagnostics and the verification report

mod render;

pub use render::{render_json, render_pretty, render_text};

use std::sync::Mutex;

use serde::Serialize;

use crate::ast::Location;
use crate::cfg::CfgError;
use crate::contract::LoadError;
use crate::solver::{Outcome, UnknownReason, Witness};
use crate::vcgen::{ObligationKind, Vc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Note,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Note => write!(f, "note"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DiagnosticKind {
    // Verification
    PreconditionViolation,
    PostconditionMismatch,
    StateTransitionIllegal,
    GhostVariableMismatch,
    PotentialViolation,
    SolverUnknown,
    // Load
    UnknownState,
    UnknownGhost,
    UnresolvedAlias,
    UnresolvedRetrofitTarget,
    MalformedPredicate,
    UninitializedGhost,
    UnsupportedConstruct,
    /// Call to a declaration that was excluded at load time
    UncheckedCall,
}

impl DiagnosticKind {
    pub fn severity(self) -> Severity {
        match self {
            DiagnosticKind::PotentialViolation => Severity::Warning,
            DiagnosticKind::UncheckedCall => Severity::Note,
            _ => Severity::Error,
        }
    }

    fn from_load_error(error: &LoadError) -> Self {
        match error {
            LoadError::UnknownState { .. } => DiagnosticKind::UnknownState,
            LoadError::UnknownGhost { .. } => DiagnosticKind::UnknownGhost,
            LoadError::UnresolvedAlias { .. } => DiagnosticKind::UnresolvedAlias,
            LoadError::UnresolvedRetrofitTarget { .. } => DiagnosticKind::UnresolvedRetrofitTarget,
            LoadError::MalformedPredicate { .. } => DiagnosticKind::MalformedPredicate,
            LoadError::UninitializedGhost { .. } => DiagnosticKind::UninitializedGhost,
        }
    }
}

impl std::fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Predicate text, as declared and as instantiated at the obligation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredicateText {
    pub declared: String,
    pub instantiated: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub file: String,
    pub location: Location,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub kind: DiagnosticKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obligation_kind: Option<ObligationKind>,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicate: Option<PredicateText>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub witness: Option<Witness>,
    /// SMT-LIB2 query, when requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smt: Option<String>,
    /// Pre-rendered snippet for malformed annotations
    #[serde(skip)]
    pub snippet: Option<String>,
}

impl Diagnostic {
    fn new(file: &str, location: Location, kind: DiagnosticKind, message: String) -> Self {
        Self {
            file: file.to_string(),
            location,
            method: None,
            kind,
            obligation_kind: None,
            severity: kind.severity(),
            message,
            predicate: None,
            witness: None,
            smt: None,
            snippet: None,
        }
    }

    /// Diagnostic for a discharged obligation; `None` when it was proved
    pub fn from_outcome(file: &str, vc: &Vc, outcome: &Outcome) -> Option<Self> {
        let origin = vc.origin();
        let subject = match &origin.callee {
            Some(callee) => format!("`{callee}`"),
            None => format!("`{}`", origin.method),
        };
        let declared = &origin.declared;

        let (kind, obligation_kind, message, witness) = match outcome {
            Outcome::Proved => return None,
            Outcome::Disproved(witness) => {
                let current = match vc {
                    Vc::State(state) => format!(" (current: {})", state.describe_current()),
                    Vc::Scalar(_) => String::new(),
                };
                let (kind, message) = match (origin.kind, &origin.callee) {
                    (ObligationKind::Precondition, Some(_)) => (
                        DiagnosticKind::PreconditionViolation,
                        format!("precondition `{declared}` of {subject} is violated{current}"),
                    ),
                    (ObligationKind::Precondition, None) => (
                        DiagnosticKind::PreconditionViolation,
                        format!("refinement `{declared}` is violated{current}"),
                    ),
                    (ObligationKind::PostconditionMismatch, _) => (
                        DiagnosticKind::PostconditionMismatch,
                        format!("return value of {subject} does not satisfy `{declared}`"),
                    ),
                    (ObligationKind::StateTransitionIllegal, Some(_)) => (
                        DiagnosticKind::StateTransitionIllegal,
                        format!("{subject} requires `{declared}`{current}"),
                    ),
                    (ObligationKind::StateTransitionIllegal, None) => (
                        DiagnosticKind::StateTransitionIllegal,
                        format!("{subject} must leave the receiver in `{declared}`{current}"),
                    ),
                    (ObligationKind::GhostMismatch | ObligationKind::Unknown, _) => (
                        DiagnosticKind::GhostVariableMismatch,
                        format!("{subject} does not establish `{declared}`"),
                    ),
                };
                let witness = (!witness.is_empty()).then(|| witness.clone());
                (kind, Some(origin.kind), message, witness)
            }
            Outcome::Unknown(UnknownReason::UnknownState(current)) => (
                DiagnosticKind::PotentialViolation,
                Some(ObligationKind::Unknown),
                format!("cannot prove `{declared}` for {subject}: state not determined ({current})"),
                None,
            ),
            Outcome::Unknown(UnknownReason::Solver(reason)) => (
                DiagnosticKind::SolverUnknown,
                Some(ObligationKind::Unknown),
                format!("cannot decide `{declared}` for {subject}: {reason}"),
                None,
            ),
        };

        let mut diag = Self::new(file, origin.loc, kind, message);
        diag.method = Some(origin.method.clone());
        diag.obligation_kind = obligation_kind;
        diag.predicate = Some(PredicateText {
            declared: declared.clone(),
            instantiated: vc.instantiated(),
        });
        diag.witness = witness;
        Some(diag)
    }

    pub fn from_load_error(error: &LoadError) -> Self {
        let ctx = error.context();
        let kind = DiagnosticKind::from_load_error(error);
        let mut diag = Self::new(&ctx.file, ctx.loc, kind, error.to_string());
        diag.method = (!ctx.decl.is_empty()).then(|| ctx.decl.clone());
        if matches!(error, LoadError::MalformedPredicate { .. }) {
            diag.snippet = Some(error.render());
        }
        diag
    }

    pub fn from_cfg_error(file: &str, method: &str, error: &CfgError) -> Self {
        let mut diag = Self::new(
            file,
            error.location(),
            DiagnosticKind::UnsupportedConstruct,
            format!("{error}; `{method}` is not verified"),
        );
        diag.method = Some(method.to_string());
        diag
    }

    pub fn unchecked_call(file: &str, method: &str, callee: &str, loc: Location) -> Self {
        let mut diag = Self::new(
            file,
            loc,
            DiagnosticKind::UncheckedCall,
            format!("call to `{callee}` is not checked: its contract failed to load"),
        );
        diag.method = Some(method.to_string());
        diag
    }

    pub fn with_smt(mut self, smt: Option<String>) -> Self {
        self.smt = smt;
        self
    }
}

/// Collects per-method batches from worker threads.
///
/// Batches arrive in any order; each is tagged with the index of its method
/// and the report lists them by index, so the output does not depend on
/// scheduling.
#[derive(Debug, Default)]
pub struct DiagnosticSink {
    batches: Mutex<Vec<(usize, Vec<Diagnostic>)>>,
}

impl DiagnosticSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_batch(&self, index: usize, batch: Vec<Diagnostic>) {
        if batch.is_empty() {
            return;
        }
        let mut batches = self.batches.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        batches.push((index, batch));
    }

    pub fn into_sorted(self) -> Vec<Diagnostic> {
        let mut batches = self.batches.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        batches.sort_by_key(|(index, _)| *index);
        batches.into_iter().flat_map(|(_, batch)| batch).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub units: usize,
    pub methods: usize,
    pub skipped_methods: usize,
    pub obligations: usize,
    pub proved: usize,
    pub errors: usize,
    pub warnings: usize,
    pub notes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub success: bool,
    pub cancelled: bool,
    pub stats: Stats,
    pub diagnostics: Vec<Diagnostic>,
}

impl Report {
    pub fn new(diagnostics: Vec<Diagnostic>, mut stats: Stats, deny_warnings: bool, cancelled: bool) -> Self {
        let count = |s: Severity| diagnostics.iter().filter(|d| d.severity == s).count();
        stats.errors = count(Severity::Error);
        stats.warnings = count(Severity::Warning);
        stats.notes = count(Severity::Note);
        let success = !cancelled && stats.errors == 0 && !(deny_warnings && stats.warnings > 0);
        Self {
            success,
            cancelled,
            stats,
            diagnostics,
        }
    }

    pub fn of_kind(&self, kind: DiagnosticKind) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(move |d| d.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::symbolic::StateValue;
    use crate::vcgen::{ScalarVc, StateCase, StateTarget, StateVc, Term, VcOrigin};

    fn origin(kind: ObligationKind, callee: Option<&str>, declared: &str) -> VcOrigin {
        VcOrigin {
            kind,
            method: "Main.main".into(),
            loc: Location::new(9, 13),
            callee: callee.map(str::to_string),
            declared: declared.into(),
        }
    }

    fn bulb_vc(current: StateValue) -> Vc {
        Vc::State(StateVc {
            origin: origin(ObligationKind::StateTransitionIllegal, Some("LightBulb.turnOff"), "on(this)"),
            targets: vec![StateTarget {
                label: "bulb".into(),
                current,
            }],
            cases: vec![StateCase {
                states: vec!["off".into()],
                residual: Term::Bool(false),
            }],
            assumptions: Vec::new(),
            abstracted: BTreeSet::new(),
        })
    }

    #[test]
    fn test_proved_has_no_diagnostic() {
        let vc = bulb_vc(StateValue::single("on"));
        assert!(Diagnostic::from_outcome("Main.java", &vc, &Outcome::Proved).is_none());
    }

    #[test]
    fn test_state_violation_message() {
        let vc = bulb_vc(StateValue::single("off"));
        let witness = Witness::from([("bulb".to_string(), "off".to_string())]);
        let diag = Diagnostic::from_outcome("Main.java", &vc, &Outcome::Disproved(witness)).unwrap();
        assert_eq!(diag.kind, DiagnosticKind::StateTransitionIllegal);
        assert_eq!(diag.severity, Severity::Error);
        assert_eq!(diag.message, "`LightBulb.turnOff` requires `on(this)` (current: bulb = off)");
        assert_eq!(diag.predicate.unwrap().instantiated, "bulb = off");
    }

    #[test]
    fn test_unknown_state_is_a_warning() {
        let vc = bulb_vc(StateValue::Unknown);
        let outcome = Outcome::Unknown(UnknownReason::UnknownState("bulb = unknown".into()));
        let diag = Diagnostic::from_outcome("Main.java", &vc, &outcome).unwrap();
        assert_eq!(diag.kind, DiagnosticKind::PotentialViolation);
        assert_eq!(diag.severity, Severity::Warning);
        assert_eq!(diag.obligation_kind, Some(ObligationKind::Unknown));
    }

    #[test]
    fn test_solver_unknown_is_an_error() {
        let vc = Vc::Scalar(ScalarVc {
            origin: origin(ObligationKind::Precondition, Some("Math.sqrt"), "_ >= 0"),
            assumptions: Vec::new(),
            goal: Term::Bool(false),
            abstracted: BTreeSet::new(),
        });
        let outcome = Outcome::Unknown(UnknownReason::Solver("timeout".into()));
        let diag = Diagnostic::from_outcome("Main.java", &vc, &outcome).unwrap();
        assert_eq!(diag.kind, DiagnosticKind::SolverUnknown);
        assert_eq!(diag.severity, Severity::Error);
        assert_eq!(diag.message, "cannot decide `_ >= 0` for `Math.sqrt`: timeout");
    }

    #[test]
    fn test_sink_orders_batches_by_method() {
        let sink = DiagnosticSink::new();
        let note = |line| Diagnostic::unchecked_call("A.java", "A.m", "B.f", Location::new(line, 1));
        sink.push_batch(2, vec![note(30)]);
        sink.push_batch(0, vec![note(10), note(11)]);
        sink.push_batch(1, Vec::new());
        let lines: Vec<u32> = sink.into_sorted().iter().map(|d| d.location.line).collect();
        assert_eq!(lines, vec![10, 11, 30]);
    }

    #[test]
    fn test_report_success_rules() {
        let vc = bulb_vc(StateValue::Unknown);
        let outcome = Outcome::Unknown(UnknownReason::UnknownState("bulb = unknown".into()));
        let warning = Diagnostic::from_outcome("Main.java", &vc, &outcome).unwrap();

        let lenient = Report::new(vec![warning.clone()], Stats::default(), false, false);
        assert!(lenient.success);
        assert_eq!(lenient.stats.warnings, 1);

        let strict = Report::new(vec![warning], Stats::default(), true, false);
        assert!(!strict.success);

        let cancelled = Report::new(Vec::new(), Stats::default(), false, true);
        assert!(!cancelled.success);
    }
}
