//! Predicate instantiation
//!
//! Turns a loaded predicate into a solver term by substituting the caller's
//! environment for placeholders. Anything the environment cannot answer
//! (an untracked object, a state that is not determined, a malformed real
//! literal) becomes a fresh abstraction symbol prefixed with `?`; a
//! counterexample that mentions one is not trusted.

use std::collections::{BTreeMap, BTreeSet};

use crate::predicate::{Pred, PredBinOp, PredExpr, PredUnOp};
use crate::solver::Rational;
use crate::symbolic::{Env, ObjectId, StateValue, Value};

use super::term::{ArithOp, CmpOp, Sort, Term};

/// What placeholders stand for in one instantiation
#[derive(Debug, Clone)]
pub struct Bindings<'a> {
    /// Environment read by ghost and state atoms
    pub env: &'a Env,
    /// Snapshot read under `old(..)`; defaults to `env`
    pub old: Option<&'a Env>,
    pub this: Option<ObjectId>,
    /// Value of `_`
    pub value: Option<Value>,
    pub value_sort: Option<Sort>,
    /// Explicit bindings (callee parameters)
    pub vars: BTreeMap<String, Value>,
    /// Sorts of explicit bindings, used when the bound value is untracked
    pub sorts: BTreeMap<String, Sort>,
    /// Let unbound names fall back to the environment's variables
    pub env_vars: bool,
    /// States pinned for enumeration, keyed by object and snapshot
    pub fixed_states: BTreeMap<(ObjectId, bool), String>,
}

impl<'a> Bindings<'a> {
    pub fn new(env: &'a Env) -> Self {
        Self {
            env,
            old: None,
            this: None,
            value: None,
            value_sort: None,
            vars: BTreeMap::new(),
            sorts: BTreeMap::new(),
            env_vars: false,
            fixed_states: BTreeMap::new(),
        }
    }

    pub fn with_old(mut self, old: &'a Env) -> Self {
        self.old = Some(old);
        self
    }

    pub fn with_this(mut self, this: Option<ObjectId>) -> Self {
        self.this = this;
        self
    }

    pub fn with_value(mut self, value: Option<Value>, sort: Option<Sort>) -> Self {
        self.value = value;
        self.value_sort = sort;
        self
    }

    pub fn bind(mut self, name: &str, value: Value, sort: Option<Sort>) -> Self {
        self.vars.insert(name.to_string(), value);
        if let Some(sort) = sort {
            self.sorts.insert(name.to_string(), sort);
        }
        self
    }

    pub fn with_env_vars(mut self) -> Self {
        self.env_vars = true;
        self
    }

    fn snapshot(&self, old: bool) -> &'a Env {
        match (old, self.old) {
            (true, Some(old)) => old,
            _ => self.env,
        }
    }

    /// Current state of an object in the chosen snapshot
    pub fn state_of(&self, id: &str, old: bool) -> StateValue {
        match self.snapshot(old).object(id) {
            Some(obj) => obj.state.clone(),
            None => StateValue::Unknown,
        }
    }
}

/// An instantiated predicate
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub term: Term,
    /// Abstraction symbols introduced along the way
    pub abstracted: BTreeSet<String>,
    /// Objects (and snapshot flag) whose state was consulted
    pub state_reads: BTreeSet<(ObjectId, bool)>,
}

enum Inst {
    Term(Term),
    Object(ObjectId, bool),
}

struct Instantiator<'b, 'a> {
    bindings: &'b Bindings<'a>,
    abstracted: BTreeSet<String>,
    state_reads: BTreeSet<(ObjectId, bool)>,
}

/// Instantiate a predicate as a boolean term
pub fn instantiate(pred: &Pred, bindings: &Bindings<'_>) -> Instance {
    let mut inst = Instantiator {
        bindings,
        abstracted: BTreeSet::new(),
        state_reads: BTreeSet::new(),
    };
    let term = inst.term(pred, false, Sort::Bool);
    Instance {
        term,
        abstracted: inst.abstracted,
        state_reads: inst.state_reads,
    }
}

impl Instantiator<'_, '_> {
    fn abstraction(&mut self, text: String, sort: Sort) -> Term {
        let name = format!("?{text}");
        self.abstracted.insert(name.clone());
        Term::var(name, sort)
    }

    fn value_term(&mut self, value: Option<Value>, text: &str, sort: Option<Sort>, old: bool) -> Inst {
        match value {
            Some(Value::Scalar(term)) => Inst::Term(term),
            Some(Value::Object(id)) => Inst::Object(id, old),
            Some(Value::Opaque) | None => {
                Inst::Term(self.abstraction(text.to_string(), sort.unwrap_or(Sort::Int)))
            }
        }
    }

    /// Instantiate as a term; `hint` is the sort expected by the context
    fn term(&mut self, pred: &Pred, old: bool, hint: Sort) -> Term {
        match self.eval(pred, old, hint) {
            Inst::Term(term) => term,
            Inst::Object(id, _) => self.abstraction(format!("object {id}"), hint),
        }
    }

    fn eval(&mut self, pred: &Pred, old: bool, hint: Sort) -> Inst {
        stacker::maybe_grow(crate::STACK_RED_ZONE, crate::STACK_GROW_SIZE, || self.eval_inner(pred, old, hint))
    }

    fn eval_inner(&mut self, pred: &Pred, old: bool, hint: Sort) -> Inst {
        let b = self.bindings;
        match &pred.node {
            PredExpr::Int(n) => Inst::Term(Term::Int(*n as i128)),
            PredExpr::Bool(v) => Inst::Term(Term::Bool(*v)),
            PredExpr::Real(text) => match Rational::parse_decimal(text) {
                Some(r) => Inst::Term(Term::Real(r)),
                None => Inst::Term(self.abstraction(text.clone(), Sort::Real)),
            },
            PredExpr::Value => self.value_term(b.value.clone(), "_", b.value_sort.or(Some(hint)), old),
            PredExpr::This => match &b.this {
                Some(id) => Inst::Object(id.clone(), old),
                None => Inst::Term(self.abstraction("this".to_string(), hint)),
            },
            PredExpr::Old(inner) => self.eval(inner, true, hint),
            PredExpr::Var(name) => {
                let value = b.vars.get(name).cloned().or_else(|| {
                    if b.env_vars {
                        b.env.vars.get(name).cloned()
                    } else {
                        None
                    }
                });
                let sort = b.sorts.get(name).copied().or(Some(hint));
                self.value_term(value, name, sort, old)
            }
            PredExpr::Positional(i) => Inst::Term(self.abstraction(format!("#{i}"), hint)),
            PredExpr::App { .. } => Inst::Term(self.abstraction(pred.node.to_string(), hint)),
            PredExpr::Ghost { name, target } => match self.eval(target, old, Sort::Int) {
                Inst::Object(id, snapshot_old) => {
                    let ghost = b
                        .snapshot(snapshot_old)
                        .object(&id)
                        .and_then(|obj| obj.ghosts.get(name))
                        .cloned();
                    match ghost {
                        Some(term) => Inst::Term(term),
                        None => Inst::Term(self.abstraction(format!("{name}({id})"), hint)),
                    }
                }
                Inst::Term(_) => Inst::Term(self.abstraction(pred.node.to_string(), hint)),
            },
            PredExpr::State { name, target } => match self.eval(target, old, Sort::Int) {
                Inst::Object(id, snapshot_old) => {
                    self.state_reads.insert((id.clone(), snapshot_old));
                    if let Some(fixed) = b.fixed_states.get(&(id.clone(), snapshot_old)) {
                        return Inst::Term(Term::Bool(fixed == name));
                    }
                    match b.state_of(&id, snapshot_old) {
                        StateValue::Known(states) if !states.contains(name) => Inst::Term(Term::Bool(false)),
                        StateValue::Known(states) if states.len() == 1 => Inst::Term(Term::Bool(true)),
                        _ => Inst::Term(self.abstraction(format!("{name}({id})"), Sort::Bool)),
                    }
                }
                Inst::Term(_) => Inst::Term(self.abstraction(pred.node.to_string(), Sort::Bool)),
            },
            PredExpr::Unary { op, operand } => match op {
                PredUnOp::Not => Inst::Term(Term::not(self.term(operand, old, Sort::Bool))),
                PredUnOp::Neg => Inst::Term(Term::neg(self.term(operand, old, hint))),
            },
            PredExpr::Binary { op, lhs, rhs } => Inst::Term(self.binary(*op, lhs, rhs, old, hint)),
            PredExpr::Ite {
                cond,
                then_branch,
                else_branch,
            } => {
                let c = self.term(cond, old, Sort::Bool);
                let t = self.term(then_branch, old, hint);
                let e = self.term(else_branch, old, hint);
                Inst::Term(Term::ite(c, t, e))
            }
        }
    }

    fn binary(&mut self, op: PredBinOp, lhs: &Pred, rhs: &Pred, old: bool, hint: Sort) -> Term {
        let arith = |op: PredBinOp| match op {
            PredBinOp::Add => Some(ArithOp::Add),
            PredBinOp::Sub => Some(ArithOp::Sub),
            PredBinOp::Mul => Some(ArithOp::Mul),
            PredBinOp::Div => Some(ArithOp::Div),
            PredBinOp::Rem => Some(ArithOp::Rem),
            _ => None,
        };
        let cmp = |op: PredBinOp| match op {
            PredBinOp::Eq => Some(CmpOp::Eq),
            PredBinOp::Ne => Some(CmpOp::Ne),
            PredBinOp::Lt => Some(CmpOp::Lt),
            PredBinOp::Le => Some(CmpOp::Le),
            PredBinOp::Gt => Some(CmpOp::Gt),
            PredBinOp::Ge => Some(CmpOp::Ge),
            _ => None,
        };
        if let Some(aop) = arith(op) {
            let a = self.term(lhs, old, hint);
            let b = self.term(rhs, old, a.sort());
            return Term::arith(aop, a, b);
        }
        if let Some(cop) = cmp(op) {
            let operand_hint = operand_sort(lhs).or_else(|| operand_sort(rhs)).unwrap_or(Sort::Int);
            let a = self.eval(lhs, old, operand_hint);
            let b = self.eval(rhs, old, operand_hint);
            return match (a, b) {
                (Inst::Object(x, _), Inst::Object(y, _)) if matches!(cop, CmpOp::Eq | CmpOp::Ne) => {
                    if x == y {
                        Term::Bool(cop == CmpOp::Eq)
                    } else {
                        self.abstraction(format!("{x} == {y}"), Sort::Bool)
                    }
                }
                (a, b) => {
                    let a = self.into_term(a, operand_hint);
                    let b = self.into_term(b, operand_hint);
                    Term::cmp(cop, a, b)
                }
            };
        }
        let a = self.term(lhs, old, Sort::Bool);
        let b = self.term(rhs, old, Sort::Bool);
        match op {
            PredBinOp::And => Term::and([a, b]),
            PredBinOp::Or => Term::or([a, b]),
            _ => Term::implies(a, b),
        }
    }

    fn into_term(&mut self, inst: Inst, hint: Sort) -> Term {
        match inst {
            Inst::Term(term) => term,
            Inst::Object(id, _) => self.abstraction(format!("object {id}"), hint),
        }
    }
}

/// Syntactic sort of a predicate operand, when evident
fn operand_sort(pred: &Pred) -> Option<Sort> {
    match &pred.node {
        PredExpr::Int(_) => Some(Sort::Int),
        PredExpr::Real(_) => Some(Sort::Real),
        PredExpr::Bool(_)
        | PredExpr::State { .. }
        | PredExpr::Unary {
            op: PredUnOp::Not, ..
        } => Some(Sort::Bool),
        PredExpr::Binary { op, lhs, rhs } => match op {
            PredBinOp::Add | PredBinOp::Sub | PredBinOp::Mul | PredBinOp::Div | PredBinOp::Rem => {
                operand_sort(lhs).or_else(|| operand_sort(rhs))
            }
            _ => Some(Sort::Bool),
        },
        _ => None,
    }
}

/// States of `target` admitted by `pred`: those for which the predicate is
/// not definitely false. `None` when the answer depends on a snapshot state
/// that is not known.
pub fn admitted_states(
    pred: &Pred,
    bindings: &Bindings<'_>,
    target: &str,
    states: &BTreeSet<String>,
) -> Option<BTreeSet<String>> {
    let first_pass = instantiate(pred, bindings);
    let old_key = (target.to_string(), true);
    let old_states: Vec<Option<String>> = if first_pass.state_reads.contains(&old_key) {
        match bindings.state_of(target, true) {
            StateValue::Known(set) => set.into_iter().map(Some).collect(),
            _ => return None,
        }
    } else {
        vec![None]
    };

    let mut admitted = BTreeSet::new();
    for state in states {
        for old_state in &old_states {
            let mut pinned = bindings.clone();
            pinned.fixed_states.insert((target.to_string(), false), state.clone());
            if let Some(o) = old_state {
                pinned.fixed_states.insert(old_key.clone(), o.clone());
            }
            if instantiate(pred, &pinned).term != Term::Bool(false) {
                admitted.insert(state.clone());
                break;
            }
        }
    }
    Some(admitted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::TypeRef;
    use crate::predicate::{parse_predicate, PredExpr};
    use crate::symbolic::ObjState;

    /// Parse and resolve the few application forms the tests use
    fn pred(text: &str) -> Pred {
        fn resolve(p: &Pred) -> Pred {
            match &p.node {
                PredExpr::App { name, args } if args.len() == 1 => {
                    let target = Box::new(resolve(&args[0]));
                    let node = if name == "size" {
                        PredExpr::Ghost { name: name.clone(), target }
                    } else {
                        PredExpr::State { name: name.clone(), target }
                    };
                    crate::ast::Spanned::new(node, p.span)
                }
                other => crate::ast::Spanned::new(other.map_children(resolve), p.span),
            }
        }
        resolve(&parse_predicate(text).unwrap())
    }

    fn list_env(size: Term) -> Env {
        let mut env = Env::default();
        let mut obj = ObjState::new(TypeRef::simple("ArrayList"), StateValue::Stateless);
        obj.ghosts.insert("size".into(), size);
        env.objects.insert("list".into(), obj);
        env.vars.insert("list".into(), Value::Object("list".into()));
        env
    }

    #[test]
    fn test_ghost_and_value_substitution() {
        let env = list_env(Term::var("s1", Sort::Int));
        let b = Bindings::new(&env)
            .with_this(Some("list".into()))
            .with_value(Some(Value::Scalar(Term::Int(1))), Some(Sort::Int));
        let inst = instantiate(&pred("0 <= _ && _ < size(this)"), &b);
        assert_eq!(inst.term.to_string(), "1 < s1");
        assert!(inst.abstracted.is_empty());
    }

    #[test]
    fn test_old_reads_snapshot() {
        let before = list_env(Term::var("s0", Sort::Int));
        let after = list_env(Term::var("s1", Sort::Int));
        let b = Bindings::new(&after).with_old(&before).with_this(Some("list".into()));
        let inst = instantiate(&pred("size(this) == size(old(this)) + 1"), &b);
        assert_eq!(inst.term.to_string(), "s1 == s0 + 1");
    }

    #[test]
    fn test_opaque_argument_is_abstracted() {
        let env = Env::default();
        let b = Bindings::new(&env).bind("x", Value::Opaque, Some(Sort::Int));
        let inst = instantiate(&pred("x > 0"), &b);
        assert!(inst.abstracted.contains("?x"));
    }

    #[test]
    fn test_known_state_folds() {
        let mut env = Env::default();
        env.objects.insert(
            "b".into(),
            ObjState::new(TypeRef::simple("LightBulb"), StateValue::single("off")),
        );
        let b = Bindings::new(&env).with_this(Some("b".into()));
        assert_eq!(instantiate(&pred("on(this)"), &b).term, Term::Bool(false));
        assert_eq!(instantiate(&pred("off(this)"), &b).term, Term::Bool(true));
    }

    #[test]
    fn test_admitted_states() {
        let env = Env::default();
        let b = Bindings::new(&env).with_this(Some("s".into()));
        let all: BTreeSet<String> = ["bound", "closed", "connected", "unconnected"]
            .into_iter()
            .map(String::from)
            .collect();
        let admitted = admitted_states(&pred("bound(this) || connected(this)"), &b, "s", &all).unwrap();
        assert_eq!(admitted, BTreeSet::from(["bound".to_string(), "connected".to_string()]));
        let everything = admitted_states(&pred("true"), &b, "s", &all).unwrap();
        assert_eq!(everything, all);
    }

    #[test]
    fn test_admitted_states_need_known_snapshot() {
        let env = Env::default();
        let b = Bindings::new(&env).with_this(Some("s".into()));
        let all = BTreeSet::from(["a".to_string(), "b".to_string()]);
        assert!(admitted_states(&pred("a(old(this)) --> b(this)"), &b, "s", &all).is_none());
    }
}
