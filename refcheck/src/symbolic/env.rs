//! Symbolic environment and the join rule
//!
//! Symbols are named after the program point that introduces them, so
//! re-running a block during the fixpoint produces the same names and a loop
//! header stabilises once every disagreement has been replaced by the
//! header's own havoc symbol.

use std::collections::{BTreeMap, BTreeSet};

use crate::ast::TypeRef;
use crate::vcgen::{Sort, Term};

/// Object identity; named after its allocation site or binding
pub type ObjectId = String;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(Term),
    Object(ObjectId),
    /// A value the analysis does not track (strings, null, untracked reads)
    Opaque,
}

/// Current state of an object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateValue {
    /// The type declares no state set
    Stateless,
    /// One of these states
    Known(BTreeSet<String>),
    /// Branches disagreed, or nothing is known
    Unknown,
}

impl StateValue {
    pub fn single(state: &str) -> Self {
        StateValue::Known(BTreeSet::from([state.to_string()]))
    }

    pub fn join(&self, other: &StateValue) -> StateValue {
        match (self, other) {
            (StateValue::Stateless, StateValue::Stateless) => StateValue::Stateless,
            (StateValue::Known(a), StateValue::Known(b)) if a == b => self.clone(),
            _ => StateValue::Unknown,
        }
    }
}

impl std::fmt::Display for StateValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateValue::Stateless => write!(f, "stateless"),
            StateValue::Unknown => write!(f, "unknown"),
            StateValue::Known(states) => {
                let names: Vec<&str> = states.iter().map(String::as_str).collect();
                if names.len() == 1 {
                    write!(f, "{}", names[0])
                } else {
                    write!(f, "{{{}}}", names.join(", "))
                }
            }
        }
    }
}

/// Tracked facts about one object
#[derive(Debug, Clone, PartialEq)]
pub struct ObjState {
    pub ty: TypeRef,
    pub state: StateValue,
    pub ghosts: BTreeMap<String, Term>,
}

impl ObjState {
    pub fn new(ty: TypeRef, state: StateValue) -> Self {
        Self {
            ty,
            state,
            ghosts: BTreeMap::new(),
        }
    }
}

/// Environment at one program point
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Env {
    pub vars: BTreeMap<String, Value>,
    pub objects: BTreeMap<ObjectId, ObjState>,
    /// Assumed facts, in the order they were learned
    pub facts: Vec<Term>,
    /// Set once the method calls an operation on its own receiver
    pub receiver_touched: bool,
}

impl Env {
    pub fn object(&self, id: &str) -> Option<&ObjState> {
        self.objects.get(id)
    }

    pub fn object_mut(&mut self, id: &str) -> Option<&mut ObjState> {
        self.objects.get_mut(id)
    }

    /// Records a fact. `false` is dropped: a contradictory environment would
    /// prove every later obligation.
    pub fn assume(&mut self, fact: Term) {
        match fact {
            Term::Bool(_) => {}
            Term::And(parts) => parts.into_iter().for_each(|p| self.assume(p)),
            other => {
                if !self.facts.contains(&other) {
                    self.facts.push(other);
                }
            }
        }
    }

    /// Forget everything about an object except its type
    pub fn havoc_object(&mut self, id: &str, point: &str) {
        if let Some(obj) = self.objects.get_mut(id) {
            if obj.state != StateValue::Stateless {
                obj.state = StateValue::Unknown;
            }
            for (ghost, term) in obj.ghosts.iter_mut() {
                *term = Term::var(format!("{ghost}({id})@{point}"), term.sort());
            }
        }
    }

    /// Replace every scalar and object fact by an unconstrained one
    pub fn widen(&self, point: &str) -> Env {
        let mut out = self.clone();
        out.facts.clear();
        for (name, value) in out.vars.iter_mut() {
            if let Value::Scalar(term) = value {
                *value = Value::Scalar(Term::var(format!("{name}@{point}"), term.sort()));
            }
        }
        let ids: Vec<ObjectId> = out.objects.keys().cloned().collect();
        for id in ids {
            out.havoc_object(&id, point);
        }
        out
    }
}

/// Join the environments flowing into a block.
///
/// Agreeing bindings are kept. A scalar that differs becomes the block's own
/// havoc symbol; an object whose state differs becomes `Unknown`. A variable
/// bound to different objects is rebound to a fresh merged object. Facts are
/// intersected.
pub fn join(envs: &[&Env], point: &str) -> Env {
    let Some((first, rest)) = envs.split_first() else {
        return Env::default();
    };
    if rest.is_empty() {
        return (*first).clone();
    }

    let mut out = Env {
        receiver_touched: envs.iter().any(|e| e.receiver_touched),
        ..Env::default()
    };

    for (id, obj) in &first.objects {
        let others: Option<Vec<&ObjState>> = rest.iter().map(|e| e.objects.get(id)).collect();
        if let Some(others) = others {
            let merged = join_objects(id, obj, &others, point);
            out.objects.insert(id.clone(), merged);
        }
    }

    for (name, value) in &first.vars {
        let others: Option<Vec<&Value>> = rest.iter().map(|e| e.vars.get(name)).collect();
        let Some(others) = others else {
            continue;
        };
        if others.iter().all(|v| *v == value) {
            out.vars.insert(name.clone(), value.clone());
            continue;
        }
        let merged = match value {
            Value::Scalar(term) if others.iter().all(|v| matches!(v, Value::Scalar(_))) => {
                Value::Scalar(Term::var(format!("{name}@{point}"), term.sort()))
            }
            Value::Object(id) if others.iter().all(|v| matches!(v, Value::Object(_))) => {
                let merged_id = format!("{name}@{point}");
                let objs: Option<Vec<&ObjState>> = std::iter::once(Some(id))
                    .chain(others.iter().map(|v| match v {
                        Value::Object(other) => Some(other),
                        _ => None,
                    }))
                    .zip(envs.iter())
                    .map(|(id, env)| id.and_then(|id| env.objects.get(id)))
                    .collect();
                match objs.as_deref() {
                    Some([head, tail @ ..]) => {
                        let merged = join_objects(&merged_id, head, tail, point);
                        out.objects.insert(merged_id.clone(), merged);
                        Value::Object(merged_id)
                    }
                    _ => Value::Opaque,
                }
            }
            _ => Value::Opaque,
        };
        out.vars.insert(name.clone(), merged);
    }

    out.facts = first
        .facts
        .iter()
        .filter(|f| rest.iter().all(|e| e.facts.contains(f)))
        .cloned()
        .collect();
    out
}

fn join_objects(id: &str, first: &ObjState, others: &[&ObjState], point: &str) -> ObjState {
    let mut state = first.state.clone();
    for other in others {
        state = state.join(&other.state);
    }
    let mut ghosts = BTreeMap::new();
    for (ghost, term) in &first.ghosts {
        let agree = others.iter().all(|o| o.ghosts.get(ghost) == Some(term));
        let value = if agree {
            term.clone()
        } else {
            Term::var(format!("{ghost}({id})@{point}"), term.sort())
        };
        ghosts.insert(ghost.clone(), value);
    }
    ObjState {
        ty: first.ty.clone(),
        state,
        ghosts,
    }
}

/// Sort of a scalar host type, `None` for objects and `void`
pub fn scalar_sort(kind: crate::ast::ValueKind) -> Option<Sort> {
    use crate::ast::ValueKind;
    match kind {
        ValueKind::Int => Some(Sort::Int),
        ValueKind::Real => Some(Sort::Real),
        ValueKind::Bool => Some(Sort::Bool),
        ValueKind::Void | ValueKind::Object => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulb(state: &str) -> Env {
        let mut env = Env::default();
        env.vars.insert("bulb".into(), Value::Object("bulb#1".into()));
        env.objects.insert(
            "bulb#1".into(),
            ObjState::new(TypeRef::simple("LightBulb"), StateValue::single(state)),
        );
        env
    }

    #[test]
    fn test_join_agreeing_state_is_kept() {
        let a = bulb("on");
        let b = bulb("on");
        let merged = join(&[&a, &b], "bb3");
        assert_eq!(merged.objects["bulb#1"].state, StateValue::single("on"));
    }

    #[test]
    fn test_join_disagreeing_state_is_unknown() {
        let a = bulb("on");
        let b = bulb("off");
        let merged = join(&[&a, &b], "bb3");
        assert_eq!(merged.objects["bulb#1"].state, StateValue::Unknown);
    }

    #[test]
    fn test_join_havocs_differing_scalars() {
        let mut a = Env::default();
        let mut b = Env::default();
        a.vars.insert("x".into(), Value::Scalar(Term::Int(1)));
        b.vars.insert("x".into(), Value::Scalar(Term::Int(2)));
        let merged = join(&[&a, &b], "bb4");
        assert_eq!(merged.vars["x"], Value::Scalar(Term::var("x@bb4", Sort::Int)));
    }

    #[test]
    fn test_join_is_stable_on_its_own_havoc() {
        let mut a = Env::default();
        let mut b = Env::default();
        a.vars.insert("x".into(), Value::Scalar(Term::Int(0)));
        b.vars.insert("x".into(), Value::Scalar(Term::var("x@bb1", Sort::Int)));
        let once = join(&[&a, &b], "bb1");
        let twice = join(&[&a, &once], "bb1");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_join_intersects_facts() {
        let mut a = Env::default();
        let mut b = Env::default();
        let shared = Term::var("p", Sort::Bool);
        a.assume(shared.clone());
        a.assume(Term::var("q", Sort::Bool));
        b.assume(shared.clone());
        let merged = join(&[&a, &b], "bb2");
        assert_eq!(merged.facts, vec![shared]);
    }

    #[test]
    fn test_join_of_different_objects_merges_them() {
        let mut a = bulb("on");
        let mut b = bulb("on");
        a.vars.insert("cur".into(), Value::Object("bulb#1".into()));
        b.objects.insert(
            "bulb#2".into(),
            ObjState::new(TypeRef::simple("LightBulb"), StateValue::single("off")),
        );
        b.vars.insert("cur".into(), Value::Object("bulb#2".into()));
        let merged = join(&[&a, &b], "bb5");
        assert_eq!(merged.vars["cur"], Value::Object("cur@bb5".into()));
        assert_eq!(merged.objects["cur@bb5"].state, StateValue::Unknown);
    }

    #[test]
    fn test_widen_forgets_facts_and_states() {
        let mut env = bulb("on");
        env.vars.insert("n".into(), Value::Scalar(Term::Int(3)));
        env.assume(Term::var("p", Sort::Bool));
        let wide = env.widen("bb1");
        assert!(wide.facts.is_empty());
        assert_eq!(wide.objects["bulb#1"].state, StateValue::Unknown);
        assert_eq!(wide.vars["n"], Value::Scalar(Term::var("n@bb1", Sort::Int)));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(StateValue::single("off").to_string(), "off");
        let two = StateValue::Known(BTreeSet::from(["a".to_string(), "b".to_string()]));
        assert_eq!(two.to_string(), "{a, b}");
    }

    #[test]
    fn test_assume_ignores_constants() {
        let mut env = Env::default();
        env.assume(Term::Bool(false));
        env.assume(Term::and([Term::var("p", Sort::Bool), Term::Bool(false)]));
        env.assume(Term::Bool(true));
        assert!(env.facts.iter().all(|f| !matches!(f, Term::Bool(_))));
    }
}
