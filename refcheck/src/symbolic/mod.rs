//! Symbolic state tracker
//!
//! The walk over a method's CFG runs in two phases. Phase 1 iterates block
//! entry environments to a fixed point: every reachable block is re-run in
//! reverse postorder with the join of its predecessors' outputs, for at most
//! `blocks + 1` rounds, after which loop headers are widened. Phase 2 walks
//! the stable environments once more and emits obligations, so each one is
//! reported exactly once and in program order.
//!
//! Object ids and fresh symbols are named after the program point (`b3.1`)
//! that introduces them; re-running a block reproduces them exactly.

mod env;

pub use env::{join, scalar_sort, Env, ObjState, ObjectId, StateValue, Value};

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::ast::{
    simple_name, BinOp, Expr, Location, MethodDecl, MethodKind, TypeBindings, TypeRef, UnOp,
    ValueKind,
};
use crate::cfg::{BasicBlock, CallSite, CallTarget, ControlFlowGraph, Instr, Terminator};
use crate::contract::{ContractRegistry, MethodContract, TypeContracts};
use crate::predicate::{Pred, PredExpr, Predicate};
use crate::solver::Rational;
use crate::vcgen::{
    admitted_states, instantiate, obligation, ArithOp, Bindings, CmpOp, ObligationKind, Sort,
    Term, Vc, VcOrigin,
};
use crate::verify::{CancellationToken, Cancelled};

/// Something the walk reports, in program order
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Obligation {
        vc: Vc,
        /// Display names of the objects live at the obligation
        labels: BTreeMap<ObjectId, String>,
    },
    /// A call to a declaration that failed to load; nothing was checked
    ExcludedCall { callee: String, loc: Location },
}

/// Id of the enclosing instance
const THIS: &str = "this";

/// Per-method walker
pub struct Tracker<'a> {
    registry: &'a ContractRegistry,
    method: &'a MethodDecl,
    contract: Option<&'a MethodContract>,
    owner: Option<&'a TypeContracts>,
    cancel: &'a CancellationToken,
    name: String,
}

impl<'a> Tracker<'a> {
    pub fn new(registry: &'a ContractRegistry, method: &'a MethodDecl, cancel: &'a CancellationToken) -> Self {
        let owner = registry.type_contracts(&method.owner);
        let arity = method.params.len();
        let contract = owner.and_then(|t| match method.kind {
            MethodKind::Constructor => t.constructor(arity),
            MethodKind::Method | MethodKind::Static => t.method(&method.name, arity),
        });
        Self {
            registry,
            method,
            contract,
            owner,
            cancel,
            name: method.qualified_name(),
        }
    }

    /// Walk `cfg`, handing every event to `emit` as soon as it is produced
    pub fn walk(&self, cfg: &ControlFlowGraph, emit: &mut dyn FnMut(Event)) -> Result<(), Cancelled> {
        let order = cfg.reverse_postorder();
        let entry = self.entry_env();
        let inputs = self.fixed_point(cfg, &order, &entry)?;

        for &id in &order {
            self.cancel.check()?;
            if let Some(input) = &inputs[id] {
                self.run_block(cfg.block(id), input.clone(), &entry, emit);
            }
        }
        Ok(())
    }

    /// Stable entry environment of every reachable block
    fn fixed_point(
        &self,
        cfg: &ControlFlowGraph,
        order: &[usize],
        entry: &Env,
    ) -> Result<Vec<Option<Env>>, Cancelled> {
        let mut inputs: Vec<Option<Env>> = vec![None; cfg.len()];
        let mut outputs: Vec<Option<Env>> = vec![None; cfg.len()];
        let rounds = cfg.len() + 1;

        let mut stable = false;
        for round in 0..rounds {
            let mut changed = false;
            for &id in order {
                self.cancel.check()?;
                let Some(input) = self.block_input(cfg, id, entry, &outputs) else {
                    continue;
                };
                if inputs[id].as_ref() != Some(&input) {
                    changed = true;
                    inputs[id] = Some(input.clone());
                }
                outputs[id] = Some(self.run_block(cfg.block(id), input, entry, &mut |_| {}));
            }
            if !changed {
                trace!(method = %self.name, rounds = round + 1, "fixed point reached");
                stable = true;
                break;
            }
        }

        if !stable {
            debug!(method = %self.name, "fixed point not reached, widening loop headers");
            let position: BTreeMap<usize, usize> = order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
            for &id in order {
                self.cancel.check()?;
                let is_header = cfg
                    .predecessors(id)
                    .iter()
                    .any(|p| position.get(p).is_some_and(|pp| *pp >= position[&id]));
                let Some(mut input) = self.block_input(cfg, id, entry, &outputs) else {
                    continue;
                };
                if is_header {
                    input = input.widen(&format!("b{id}"));
                }
                inputs[id] = Some(input.clone());
                outputs[id] = Some(self.run_block(cfg.block(id), input, entry, &mut |_| {}));
            }
        }
        Ok(inputs)
    }

    fn block_input(
        &self,
        cfg: &ControlFlowGraph,
        id: usize,
        entry: &Env,
        outputs: &[Option<Env>],
    ) -> Option<Env> {
        if id == ControlFlowGraph::ENTRY {
            return Some(entry.clone());
        }
        let incoming: Vec<&Env> = cfg
            .predecessors(id)
            .iter()
            .filter_map(|p| outputs[*p].as_ref())
            .collect();
        if incoming.is_empty() {
            return None;
        }
        Some(join(&incoming, &format!("b{id}")))
    }

    fn run_block(&self, block: &BasicBlock, input: Env, entry: &Env, emit: &mut dyn FnMut(Event)) -> Env {
        let mut env = input;
        for (index, instr) in block.instrs.iter().enumerate() {
            let point = format!("b{}.{index}", block.id);
            match instr {
                Instr::Declare { name, ty, .. } => {
                    let value = match scalar_sort(ty.value_kind(&TypeBindings::new())) {
                        Some(sort) => Value::Scalar(Term::var(format!("{name}@{point}"), sort)),
                        None => Value::Opaque,
                    };
                    env.vars.insert(name.clone(), value);
                }
                Instr::Assign {
                    dest,
                    value,
                    declared,
                    loc,
                } => {
                    let value = self.eval(value, &mut env);
                    let value = self.check_local(dest, value, declared.as_ref(), *loc, &mut env, &point, emit);
                    env.vars.insert(dest.clone(), value);
                }
                Instr::Call { dest, call } => self.call(call, dest.as_deref(), &mut env, &point, emit),
            }
        }
        if let Terminator::Return { value, loc } = &block.terminator {
            let point = format!("b{}.ret", block.id);
            self.exit(value.as_ref(), *loc, &mut env, entry, &point, emit);
        }
        env
    }

    // ========================================================================
    // Method entry and exit
    // ========================================================================

    fn entry_env(&self) -> Env {
        let mut env = Env::default();
        let none = TypeBindings::new();
        for param in &self.method.params {
            let value = match param.ty.value_kind(&none) {
                ValueKind::Object => {
                    let state = self.unknown_state_of(&param.ty.name);
                    self.materialize(&mut env, param.name.clone(), &param.ty, state, "entry");
                    Value::Object(param.name.clone())
                }
                kind => match scalar_sort(kind) {
                    Some(sort) => Value::Scalar(Term::var(param.name.clone(), sort)),
                    None => Value::Opaque,
                },
            };
            env.vars.insert(param.name.clone(), value);
        }

        if self.method.kind != MethodKind::Static {
            let ty = TypeRef::simple(self.method.owner.clone());
            let state = match (self.owner.and_then(|t| t.states.as_ref()), self.method.kind) {
                (None, _) => StateValue::Stateless,
                (Some(_), MethodKind::Constructor) => StateValue::Unknown,
                (Some(states), _) => match self.contract.and_then(|c| c.from.as_ref()) {
                    Some(from) if from.mentions_state() => {
                        let bindings = self.param_bindings(&env, Bindings::new(&env)).with_this(Some(THIS.into()));
                        match admitted_states(&from.expr, &bindings, THIS, &states.all()) {
                            Some(admitted) if !admitted.is_empty() => StateValue::Known(admitted),
                            _ => StateValue::Unknown,
                        }
                    }
                    _ => StateValue::Known(states.all()),
                },
            };
            let mut obj = ObjState::new(ty, state);
            if let Some(owner) = self.owner {
                for ghost in owner.ghosts.values() {
                    let sort = scalar_sort(ghost.sort.value_kind(&none)).unwrap_or(Sort::Int);
                    obj.ghosts.insert(ghost.name.clone(), Term::var(format!("{}({THIS})", ghost.name), sort));
                }
            }
            env.objects.insert(THIS.into(), obj);
            env.vars.insert(THIS.into(), Value::Object(THIS.into()));
        }

        // The method may rely on its own preconditions
        if let Some(contract) = self.contract {
            let mut facts = Vec::new();
            for param in &contract.params {
                let (Some(pred), Some(value)) = (&param.refinement, env.vars.get(&param.name)) else {
                    continue;
                };
                let sort = scalar_sort(param.ty.value_kind(&none));
                let bindings = self
                    .param_bindings(&env, Bindings::new(&env))
                    .with_this(self.this_id(&env))
                    .with_value(Some(value.clone()), sort);
                facts.extend(assumable(&pred.expr, &bindings));
            }
            if let Some(from) = &contract.from {
                let bindings = self.param_bindings(&env, Bindings::new(&env)).with_this(self.this_id(&env));
                for conjunct in from.conjuncts() {
                    facts.extend(assumable(conjunct, &bindings));
                }
            }
            facts.into_iter().for_each(|f| env.assume(f));
        }
        env
    }

    /// Obligations at a `return` or at the fall-through exit
    fn exit(
        &self,
        value: Option<&Expr>,
        loc: Location,
        env: &mut Env,
        entry: &Env,
        point: &str,
        emit: &mut dyn FnMut(Event),
    ) {
        let Some(contract) = self.contract else {
            return;
        };
        let loc = if loc.is_known() { loc } else { contract.loc };
        let returned = value.map(|v| self.eval(v, env));
        let this = self.this_id(env);
        let labels = labels(env);
        let label = |id: &str, old: bool| label_of(&labels, id, old);
        let base = || {
            self.param_bindings(entry, Bindings::new(env))
                .with_old(entry)
                .with_this(this.clone())
        };

        if let (Some(pred), Some(value)) = (&contract.ret_refinement, returned) {
            let sort = scalar_sort(contract.ret_ty.value_kind(&TypeBindings::new()));
            let bindings = base().with_value(Some(value), sort);
            let origin = self.origin(ObligationKind::PostconditionMismatch, loc, None, &pred.source);
            let vc = obligation(origin, &pred.expr, &bindings, &env.facts, &label);
            emit(Event::Obligation {
                vc,
                labels: labels.clone(),
            });
        }

        if !env.receiver_touched {
            return;
        }
        let Some(to) = &contract.to else {
            return;
        };
        for conjunct in to.conjuncts() {
            let kind = if conjunct.node.any(&|e| matches!(e, PredExpr::State { .. })) {
                ObligationKind::StateTransitionIllegal
            } else {
                ObligationKind::GhostMismatch
            };
            let origin = self.origin(kind, loc, None, &conjunct.node.to_string());
            let vc = obligation(origin, conjunct, &base(), &env.facts, &label);
            emit(Event::Obligation {
                vc,
                labels: labels.clone(),
            });
        }
        trace!(method = %self.name, point, "exit obligations emitted");
    }

    // ========================================================================
    // Call sites
    // ========================================================================

    fn call(&self, call: &CallSite, dest: Option<&str>, env: &mut Env, point: &str, emit: &mut dyn FnMut(Event)) {
        let is_ctor = matches!(call.target, CallTarget::Constructor { .. });
        let (receiver, static_ty) = self.resolve_receiver(call, env, point);
        let args: Vec<Value> = call.args.iter().map(|a| self.eval(a, env)).collect();

        let Some(ty) = static_ty else {
            trace!(call = %call, "receiver type unknown, result untracked");
            if let Some(dest) = dest {
                env.vars.insert(dest.to_string(), Value::Opaque);
            }
            return;
        };
        let type_contracts = self.registry.type_contracts(&ty.name);
        let member = (!is_ctor).then_some(call.method.as_str());

        if self.registry.is_call_excluded(&ty.name, member) {
            let callee = match member {
                Some(name) => format!("{}.{name}", ty.simple_name()),
                None => format!("{}.<init>", ty.simple_name()),
            };
            emit(Event::ExcludedCall { callee, loc: call.loc });
            if let Some(id) = &receiver {
                env.havoc_object(id, point);
            }
            if let Some(dest) = dest {
                let value = if is_ctor {
                    let id = format!("{}#{point}", ty.simple_name());
                    let state = self.unknown_state_of(&ty.name);
                    self.materialize(env, id.clone(), &ty, state, point);
                    Value::Object(id)
                } else {
                    Value::Opaque
                };
                env.vars.insert(dest.to_string(), value);
            }
            return;
        }

        let contract = match member {
            Some(name) => self.registry.method(&ty.name, name, args.len()),
            None => self.registry.constructor(&ty.name, args.len()),
        };
        let (Some(contract), Some(tc)) = (contract, type_contracts) else {
            if let Some(dest) = dest {
                let value = if is_ctor {
                    let id = format!("{}#{point}", ty.simple_name());
                    let state = self.unknown_state_of(&ty.name);
                    self.materialize(env, id.clone(), &ty, state, point);
                    Value::Object(id)
                } else {
                    Value::Opaque
                };
                env.vars.insert(dest.to_string(), value);
            }
            return;
        };

        let type_args = ty.bindings_for(&tc.type_params);
        let receiver = if contract.has_receiver() && !is_ctor { receiver } else { None };
        self.check_preconditions(call, contract, tc, &receiver, &args, &type_args, env, emit);
        self.apply_postcondition(call, contract, tc, &ty, receiver, &args, &type_args, dest, env, point);
    }

    /// Receiver object (materialised if needed) and the static type to look up
    fn resolve_receiver(&self, call: &CallSite, env: &mut Env, point: &str) -> (Option<ObjectId>, Option<TypeRef>) {
        match &call.target {
            CallTarget::Instance {
                receiver,
                receiver_type,
            } => {
                let id = match self.eval(receiver, env) {
                    Value::Object(id) => Some(id),
                    _ => match (receiver, receiver_type) {
                        // An untracked local gets an object of its static type
                        (Expr::Var { name }, Some(ty)) => {
                            let id = format!("{name}@{point}");
                            let state = self.unknown_state_of(&ty.name);
                            self.materialize(env, id.clone(), ty, state, point);
                            env.vars.insert(name.clone(), Value::Object(id.clone()));
                            Some(id)
                        }
                        _ => None,
                    },
                };
                let ty = receiver_type
                    .clone()
                    .or_else(|| id.as_ref().and_then(|id| env.object(id)).map(|o| o.ty.clone()));
                (id, ty)
            }
            CallTarget::Implicit => (self.this_id(env), Some(TypeRef::simple(self.method.owner.clone()))),
            CallTarget::Static { class } => (None, Some(TypeRef::simple(class.clone()))),
            CallTarget::Constructor { ty } => (None, Some(ty.clone())),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn check_preconditions(
        &self,
        call: &CallSite,
        contract: &MethodContract,
        tc: &TypeContracts,
        receiver: &Option<ObjectId>,
        args: &[Value],
        type_args: &TypeBindings,
        env: &Env,
        emit: &mut dyn FnMut(Event),
    ) {
        let labels = labels(env);
        let label = |id: &str, old: bool| label_of(&labels, id, old);
        let callee = contract.display_name();
        let bindings = callee_bindings(env, contract, args, type_args).with_this(receiver.clone());

        for (param, value) in contract.params.iter().zip(args) {
            let Some(pred) = &param.refinement else {
                continue;
            };
            let sort = scalar_sort(param.ty.value_kind(type_args));
            let b = bindings.clone().with_value(Some(value.clone()), sort);
            let origin = self.origin(ObligationKind::Precondition, call.loc, Some(&callee), &pred.source);
            let vc = obligation(origin, &pred.expr, &b, &env.facts, &label);
            trace!(callee = %callee, param = %param.name, "precondition");
            emit(Event::Obligation {
                vc,
                labels: labels.clone(),
            });
        }

        if contract.kind == MethodKind::Constructor {
            return;
        }
        if let Some(from) = &contract.from {
            let kind = if from.mentions_state() && !tc.is_retrofit {
                ObligationKind::StateTransitionIllegal
            } else {
                ObligationKind::Precondition
            };
            let origin = self.origin(kind, call.loc, Some(&callee), &from.source);
            let vc = obligation(origin, &from.expr, &bindings, &env.facts, &label);
            emit(Event::Obligation {
                vc,
                labels: labels.clone(),
            });
        }
    }

    /// Continue with the declared postcondition, whether or not the
    /// preconditions were proved. Preconditions are not assumed: a violated
    /// one would make every later obligation hold vacuously.
    #[allow(clippy::too_many_arguments)]
    fn apply_postcondition(
        &self,
        call: &CallSite,
        contract: &MethodContract,
        tc: &TypeContracts,
        ty: &TypeRef,
        receiver: Option<ObjectId>,
        args: &[Value],
        type_args: &TypeBindings,
        dest: Option<&str>,
        env: &mut Env,
        point: &str,
    ) {
        let snapshot = env.clone();
        let mut facts = Vec::new();

        // Result
        let result_id = format!("{}#{point}", ty.simple_name());
        let this = match contract.kind {
            MethodKind::Constructor => {
                self.materialize(env, result_id.clone(), ty, StateValue::Unknown, point);
                Some(result_id.clone())
            }
            _ => receiver.clone(),
        };
        let result = match contract.kind {
            MethodKind::Constructor => Some(Value::Object(result_id.clone())),
            _ => match contract.ret_ty.value_kind(type_args) {
                ValueKind::Void => None,
                ValueKind::Object => {
                    let ret_ty = resolve_type(&contract.ret_ty, type_args);
                    let id = format!("{}#{point}", ret_ty.simple_name());
                    let state = self.unknown_state_of(&ret_ty.name);
                    self.materialize(env, id.clone(), &ret_ty, state, point);
                    Some(Value::Object(id))
                }
                kind => scalar_sort(kind)
                    .map(|sort| Value::Scalar(Term::var(format!("{}()@{point}", contract.name), sort))),
            },
        };

        // Receiver (or new object) state
        if let Some(id) = &this {
            let states = tc.states.as_ref().map(|s| s.all());
            let new_state = match (&contract.to, states) {
                (_, None) => StateValue::Stateless,
                (None, Some(_)) if contract.kind == MethodKind::Constructor => StateValue::Unknown,
                (None, Some(_)) => snapshot.object(id).map_or(StateValue::Unknown, |o| o.state.clone()),
                (Some(to), Some(all)) if !to.mentions_state() => StateValue::Known(all),
                (Some(to), Some(all)) => {
                    let bindings = callee_bindings(env, contract, args, type_args)
                        .with_old(&snapshot)
                        .with_this(Some(id.clone()));
                    match admitted_states(&to.expr, &bindings, id, &all) {
                        Some(admitted) if !admitted.is_empty() => StateValue::Known(admitted),
                        _ => StateValue::Unknown,
                    }
                }
            };
            let ghosts = contract.to.as_ref().map(Predicate::ghosts_on_this).unwrap_or_default();
            if let Some(obj) = env.object_mut(id) {
                obj.state = new_state;
                for ghost in &ghosts {
                    if let Some(term) = obj.ghosts.get_mut(ghost) {
                        *term = Term::var(format!("{ghost}({id})@{point}"), term.sort());
                    }
                }
            }
        }

        // Return value state from state atoms on `_`
        if let (Some(Value::Object(id)), Some(pred), false) =
            (&result, &contract.ret_refinement, contract.kind == MethodKind::Constructor)
        {
            let all = self
                .registry
                .type_contracts(&env.object(id).map(|o| o.ty.name.clone()).unwrap_or_default())
                .and_then(|t| t.states.as_ref())
                .map(|s| s.all());
            if let Some(all) = all.filter(|_| pred.mentions_state()) {
                let bindings = callee_bindings(env, contract, args, type_args)
                    .with_old(&snapshot)
                    .with_this(this.clone())
                    .with_value(Some(Value::Object(id.clone())), None);
                let state = match admitted_states(&pred.expr, &bindings, id, &all) {
                    Some(admitted) if !admitted.is_empty() => StateValue::Known(admitted),
                    _ => StateValue::Unknown,
                };
                if let Some(obj) = env.object_mut(id) {
                    obj.state = state;
                }
            }
        }

        // Ghost equalities and scalar facts of the postcondition
        {
            let bindings = callee_bindings(env, contract, args, type_args)
                .with_old(&snapshot)
                .with_this(this.clone());
            if let Some(to) = &contract.to {
                for conjunct in to.conjuncts() {
                    facts.extend(assumable(conjunct, &bindings));
                }
            }
            if let (Some(pred), Some(value)) = (&contract.ret_refinement, &result) {
                let sort = match value {
                    Value::Scalar(t) => Some(t.sort()),
                    _ => None,
                };
                let b = bindings.clone().with_value(Some(value.clone()), sort);
                facts.extend(assumable(&pred.expr, &b));
            }
        }
        facts.into_iter().for_each(|f| env.assume(f));

        if receiver.as_deref() == Some(THIS) {
            env.receiver_touched = true;
        }
        if let (Some(dest), Some(value)) = (dest, result) {
            env.vars.insert(dest.to_string(), value);
        }
        trace!(call = %call, point, "postcondition applied");
    }

    // ========================================================================
    // Locals and expressions
    // ========================================================================

    /// Checks a refined local and returns the value to bind. A scalar is
    /// rebound to a fresh symbol that carries only the refinement, so a
    /// violated refinement never becomes an assumption about the old value.
    #[allow(clippy::too_many_arguments)]
    fn check_local(
        &self,
        name: &str,
        value: Value,
        declared: Option<&TypeRef>,
        loc: Location,
        env: &mut Env,
        point: &str,
        emit: &mut dyn FnMut(Event),
    ) -> Value {
        let Some(pred) = self.contract.and_then(|c| c.locals.get(name)) else {
            return value;
        };
        let sort = match (declared, &value) {
            (Some(ty), _) => scalar_sort(ty.value_kind(&TypeBindings::new())),
            (None, Value::Scalar(t)) => Some(t.sort()),
            _ => None,
        };
        {
            let labels = labels(env);
            let label = |id: &str, old: bool| label_of(&labels, id, old);
            let bindings = Bindings::new(env)
                .with_env_vars()
                .with_this(self.this_id(env))
                .bind(name, value.clone(), sort)
                .with_value(Some(value.clone()), sort);
            let origin = self.origin(ObligationKind::Precondition, loc, None, &pred.source);
            let vc = obligation(origin, &pred.expr, &bindings, &env.facts, &label);
            emit(Event::Obligation {
                vc,
                labels: labels.clone(),
            });
        }
        let (Value::Scalar(_), Some(sort)) = (&value, sort) else {
            return value;
        };
        let fresh = Value::Scalar(Term::var(format!("{name}@{point}"), sort));
        let facts = {
            let bindings = Bindings::new(env)
                .with_env_vars()
                .with_this(self.this_id(env))
                .bind(name, fresh.clone(), Some(sort))
                .with_value(Some(fresh.clone()), Some(sort));
            assumable(&pred.expr, &bindings)
        };
        facts.into_iter().for_each(|f| env.assume(f));
        fresh
    }

    fn eval(&self, expr: &Expr, env: &mut Env) -> Value {
        stacker::maybe_grow(crate::STACK_RED_ZONE, crate::STACK_GROW_SIZE, || self.eval_inner(expr, env))
    }

    fn eval_inner(&self, expr: &Expr, env: &mut Env) -> Value {
        match expr {
            Expr::Int { value } => Value::Scalar(Term::Int(*value as i128)),
            Expr::Real { value } => match Rational::parse_decimal(value) {
                Some(r) => Value::Scalar(Term::Real(r)),
                None => Value::Opaque,
            },
            Expr::Bool { value } => Value::Scalar(Term::Bool(*value)),
            Expr::Str { .. } | Expr::Null | Expr::Opaque { .. } => Value::Opaque,
            Expr::Var { name } => env.vars.get(name).cloned().unwrap_or(Value::Opaque),
            Expr::Unary { op, operand } => match (op, self.eval(operand, env)) {
                (UnOp::Neg, Value::Scalar(t)) => Value::Scalar(Term::neg(t)),
                (UnOp::Not, Value::Scalar(t)) => Value::Scalar(Term::not(t)),
                _ => Value::Opaque,
            },
            Expr::Binary { op, lhs, rhs } => {
                let a = self.eval(lhs, env);
                let b = self.eval(rhs, env);
                binary(*op, a, b)
            }
            Expr::Cond {
                cond,
                then_expr,
                else_expr,
            } => {
                let c = self.eval(cond, env);
                let t = self.eval(then_expr, env);
                let e = self.eval(else_expr, env);
                match (c, t, e) {
                    (Value::Scalar(c), Value::Scalar(t), Value::Scalar(e)) => Value::Scalar(Term::ite(c, t, e)),
                    (Value::Scalar(Term::Bool(true)), t, _) => t,
                    (Value::Scalar(Term::Bool(false)), _, e) => e,
                    _ => Value::Opaque,
                }
            }
            Expr::Field { owner, name, .. } => self.read_field(owner, name, env),
            // Lowered into call instructions before the walk
            Expr::Call { .. } | Expr::New { .. } => Value::Opaque,
        }
    }

    /// A static field read; its refinement is assumed
    fn read_field(&self, owner: &str, name: &str, env: &mut Env) -> Value {
        let Some(field) = self.registry.field(owner, name) else {
            return Value::Opaque;
        };
        let Some(sort) = scalar_sort(field.ty.value_kind(&TypeBindings::new())) else {
            return Value::Opaque;
        };
        let value = Value::Scalar(Term::var(format!("{}.{name}", simple_name(owner)), sort));
        if let Some(pred) = &field.refinement {
            let facts = {
                let bindings = Bindings::new(env).with_value(Some(value.clone()), Some(sort));
                assumable(&pred.expr, &bindings)
            };
            facts.into_iter().for_each(|f| env.assume(f));
        }
        value
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn this_id(&self, env: &Env) -> Option<ObjectId> {
        env.objects.contains_key(THIS).then(|| THIS.to_string())
    }

    fn origin(&self, kind: ObligationKind, loc: Location, callee: Option<&str>, declared: &str) -> VcOrigin {
        VcOrigin {
            kind,
            method: self.name.clone(),
            loc,
            callee: callee.map(str::to_string),
            declared: declared.to_string(),
        }
    }

    /// Bind the method's own parameters to their values in `env`
    fn param_bindings<'b>(&self, env: &'b Env, bindings: Bindings<'b>) -> Bindings<'b> {
        let none = TypeBindings::new();
        self.method.params.iter().fold(bindings, |b, p| {
            let value = env.vars.get(&p.name).cloned().unwrap_or(Value::Opaque);
            b.bind(&p.name, value, scalar_sort(p.ty.value_kind(&none)))
        })
    }

    /// State of an object nothing is known about
    fn unknown_state_of(&self, ty: &str) -> StateValue {
        match self.registry.type_contracts(ty).and_then(|t| t.states.as_ref()) {
            Some(_) => StateValue::Unknown,
            None => StateValue::Stateless,
        }
    }

    /// Add an object with unconstrained ghosts
    fn materialize(&self, env: &mut Env, id: ObjectId, ty: &TypeRef, state: StateValue, point: &str) {
        let mut obj = ObjState::new(ty.clone(), state);
        if let Some(tc) = self.registry.type_contracts(&ty.name) {
            let type_args = ty.bindings_for(&tc.type_params);
            for ghost in tc.ghosts.values() {
                let sort = scalar_sort(ghost.sort.value_kind(&type_args)).unwrap_or(Sort::Int);
                obj.ghosts.insert(ghost.name.clone(), Term::var(format!("{}({id})@{point}", ghost.name), sort));
            }
        }
        env.objects.insert(id, obj);
    }
}

/// Callee parameters bound to the argument values
fn callee_bindings<'b>(env: &'b Env, contract: &MethodContract, args: &[Value], type_args: &TypeBindings) -> Bindings<'b> {
    contract
        .params
        .iter()
        .zip(args)
        .fold(Bindings::new(env), |b, (param, value)| {
            b.bind(&param.name, value.clone(), scalar_sort(param.ty.value_kind(type_args)))
        })
}

/// Apply type-argument bindings to a bare type parameter
fn resolve_type(ty: &TypeRef, type_args: &TypeBindings) -> TypeRef {
    if ty.args.is_empty()
        && let Some(bound) = type_args.get(&ty.name)
    {
        return bound.clone();
    }
    ty.clone()
}

/// Facts a predicate contributes once it is known to hold; predicates that
/// needed abstractions contribute nothing
fn assumable(pred: &Pred, bindings: &Bindings<'_>) -> Vec<Term> {
    let inst = instantiate(pred, bindings);
    if !inst.abstracted.is_empty() || inst.term == Term::Bool(true) {
        return Vec::new();
    }
    vec![inst.term]
}

fn binary(op: BinOp, a: Value, b: Value) -> Value {
    match (a, b) {
        (Value::Object(x), Value::Object(y)) if x == y && matches!(op, BinOp::Eq | BinOp::Ne) => {
            Value::Scalar(Term::Bool(op == BinOp::Eq))
        }
        (Value::Scalar(a), Value::Scalar(b)) => {
            let arith = |o| Value::Scalar(Term::arith(o, a.clone(), b.clone()));
            let cmp = |o| Value::Scalar(Term::cmp(o, a.clone(), b.clone()));
            match op {
                BinOp::Add => arith(ArithOp::Add),
                BinOp::Sub => arith(ArithOp::Sub),
                BinOp::Mul => arith(ArithOp::Mul),
                BinOp::Div => arith(ArithOp::Div),
                BinOp::Rem => arith(ArithOp::Rem),
                BinOp::Eq => cmp(CmpOp::Eq),
                BinOp::Ne => cmp(CmpOp::Ne),
                BinOp::Lt => cmp(CmpOp::Lt),
                BinOp::Le => cmp(CmpOp::Le),
                BinOp::Gt => cmp(CmpOp::Gt),
                BinOp::Ge => cmp(CmpOp::Ge),
                BinOp::And => Value::Scalar(Term::and([a, b])),
                BinOp::Or => Value::Scalar(Term::or([a, b])),
            }
        }
        _ => Value::Opaque,
    }
}

/// Display name per object: the first bound variable that is not a temporary
pub fn labels(env: &Env) -> BTreeMap<ObjectId, String> {
    let mut out: BTreeMap<ObjectId, String> = BTreeMap::new();
    let mut temps: BTreeMap<ObjectId, String> = BTreeMap::new();
    for (name, value) in &env.vars {
        let Value::Object(id) = value else {
            continue;
        };
        let target = if name.starts_with('$') { &mut temps } else { &mut out };
        target.entry(id.clone()).or_insert_with(|| name.clone());
    }
    for (id, name) in temps {
        out.entry(id).or_insert(name);
    }
    out
}

fn label_of(labels: &BTreeMap<ObjectId, String>, id: &str, old: bool) -> String {
    let base = labels.get(id).cloned().unwrap_or_else(|| id.to_string());
    if old { format!("old({base})") } else { base }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{CompilationUnit, ParamDecl, StateAnnotation, Stmt, TypeDecl};
    use crate::cfg::build_cfg;
    use crate::contract::{load_units, KnownTypes};

    fn method(owner: &str, name: &str) -> MethodDecl {
        MethodDecl {
            owner: owner.to_string(),
            name: name.to_string(),
            kind: MethodKind::Method,
            params: Vec::new(),
            ret_ty: TypeRef::void(),
            refinement: None,
            state: None,
            body: None,
            loc: Location::new(1, 1),
        }
    }

    fn bulb_unit(main_body: Vec<Stmt>) -> CompilationUnit {
        let mut ctor = method("LightBulb", "LightBulb");
        ctor.kind = MethodKind::Constructor;
        ctor.state = Some(StateAnnotation::new(None, Some("off(this)")));
        let mut on = method("LightBulb", "turnOn");
        on.state = Some(StateAnnotation::new(Some("off(this)"), Some("on(this)")));
        let mut off = method("LightBulb", "turnOff");
        off.state = Some(StateAnnotation::new(Some("on(this)"), Some("off(this)")));
        let mut main = method("Main", "main");
        main.kind = MethodKind::Static;
        main.body = Some(main_body);
        CompilationUnit {
            file: "Main.java".into(),
            types: vec![
                TypeDecl {
                    name: "LightBulb".into(),
                    state_set: vec!["on".into(), "off".into()],
                    ..Default::default()
                },
                TypeDecl {
                    name: "Main".into(),
                    ..Default::default()
                },
            ],
            methods: vec![ctor, on, off, main],
            ..Default::default()
        }
    }

    fn call_stmt(receiver: &str, name: &str, line: u32) -> Stmt {
        Stmt::Expr {
            expr: Expr::call(receiver, name, Vec::new(), Location::new(line, 9)),
            loc: Location::new(line, 9),
        }
    }

    fn let_new(name: &str, ty: &str, line: u32) -> Stmt {
        Stmt::Let {
            name: name.into(),
            ty: TypeRef::simple(ty),
            init: Some(Expr::new_object(ty, Vec::new(), Location::new(line, 20))),
            refinement: None,
            loc: Location::new(line, 9),
        }
    }

    fn run(unit: &CompilationUnit, owner: &str, name: &str) -> Vec<Event> {
        let loaded = load_units(std::slice::from_ref(unit), &KnownTypes::from_units(std::slice::from_ref(unit)));
        assert!(loaded.errors.is_empty(), "{:?}", loaded.errors);
        let decl = unit
            .methods
            .iter()
            .find(|m| m.owner == owner && m.name == name)
            .unwrap();
        let cfg = build_cfg(decl).unwrap();
        let cancel = CancellationToken::new();
        let mut events = Vec::new();
        Tracker::new(&loaded.registry, decl, &cancel)
            .walk(&cfg, &mut |e| events.push(e))
            .unwrap();
        events
    }

    fn state_cases(events: &[Event]) -> Vec<(Location, bool, String)> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Obligation { vc: Vc::State(vc), .. } => Some((
                    vc.origin.loc,
                    vc.is_determined() && vc.cases.iter().any(|c| c.residual == Term::Bool(false)),
                    vc.describe_current(),
                )),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_state_follows_transitions() {
        let unit = bulb_unit(vec![
            let_new("bulb", "LightBulb", 3),
            call_stmt("bulb", "turnOn", 4),
            call_stmt("bulb", "turnOff", 5),
            call_stmt("bulb", "turnOff", 6),
        ]);
        let cases = state_cases(&run(&unit, "Main", "main"));
        assert_eq!(cases.len(), 3);
        assert!(!cases[0].1 && !cases[1].1);
        assert_eq!(cases[2], (Location::new(6, 9), true, "bulb = off".to_string()));
    }

    #[test]
    fn test_branch_disagreement_is_unknown() {
        let unit = bulb_unit(vec![
            let_new("bulb", "LightBulb", 3),
            Stmt::If {
                cond: Expr::var("flag"),
                then_branch: vec![call_stmt("bulb", "turnOn", 5)],
                else_branch: Vec::new(),
                loc: Location::new(4, 9),
            },
            call_stmt("bulb", "turnOff", 7),
        ]);
        let events = run(&unit, "Main", "main");
        let last = events.last().unwrap();
        let Event::Obligation { vc: Vc::State(vc), .. } = last else {
            panic!("expected a state obligation, got {last:?}");
        };
        assert!(!vc.is_determined());
        assert_eq!(vc.describe_current(), "bulb = unknown");
    }

    #[test]
    fn test_loop_reaches_fixed_point() {
        // while (c) { bulb.turnOn(); bulb.turnOff(); }
        let unit = bulb_unit(vec![
            let_new("bulb", "LightBulb", 3),
            Stmt::While {
                cond: Expr::var("c"),
                body: vec![call_stmt("bulb", "turnOn", 5), call_stmt("bulb", "turnOff", 6)],
                loc: Location::new(4, 9),
            },
        ]);
        let cases = state_cases(&run(&unit, "Main", "main"));
        assert_eq!(cases.len(), 2);
        assert!(cases.iter().all(|(_, violated, _)| !violated));
        assert_eq!(cases[0].2, "bulb = off");
    }

    #[test]
    fn test_entry_state_from_own_precondition() {
        let mut unit = bulb_unit(Vec::new());
        let mut toggle = method("LightBulb", "cycle");
        toggle.state = Some(StateAnnotation::new(Some("off(this)"), Some("off(this)")));
        toggle.body = Some(vec![
            Stmt::Expr {
                expr: Expr::Call {
                    receiver: None,
                    class: None,
                    method: "turnOn".into(),
                    args: Vec::new(),
                    receiver_type: None,
                    loc: Location::new(10, 9),
                },
                loc: Location::new(10, 9),
            },
        ]);
        unit.methods.push(toggle);
        let events = run(&unit, "LightBulb", "cycle");
        // turnOn is legal from `off`; the exit leaves `on`, which `to` rejects
        let cases = state_cases(&events);
        assert_eq!(cases.len(), 2);
        assert!(!cases[0].1);
        assert!(cases[1].1);
        let Event::Obligation { vc, .. } = &events[1] else {
            panic!("expected an obligation");
        };
        assert_eq!(vc.origin().kind, ObligationKind::StateTransitionIllegal);
        assert_eq!(vc.origin().callee, None);
    }

    #[test]
    fn test_scalar_precondition_and_param_facts() {
        let mut unit = bulb_unit(Vec::new());
        let mut dim = method("LightBulb", "dim");
        dim.kind = MethodKind::Static;
        dim.params = vec![ParamDecl::refined("level", "int", "_ >= 0 && _ <= 10")];
        let mut caller = method("LightBulb", "caller");
        caller.kind = MethodKind::Static;
        caller.params = vec![ParamDecl::refined("x", "int", "_ > 2 && _ < 5")];
        caller.body = Some(vec![Stmt::Expr {
            expr: Expr::static_call("LightBulb", "dim", vec![Expr::var("x")], Location::new(20, 9)),
            loc: Location::new(20, 9),
        }]);
        unit.methods.extend([dim, caller]);
        let events = run(&unit, "LightBulb", "caller");
        let [Event::Obligation { vc: Vc::Scalar(vc), .. }] = events.as_slice() else {
            panic!("expected one scalar obligation, got {events:?}");
        };
        assert_eq!(vc.goal.to_string(), "x >= 0 && x <= 10");
        assert_eq!(vc.assumptions.len(), 2);
    }

    #[test]
    fn test_cancellation_stops_the_walk() {
        let unit = bulb_unit(vec![let_new("bulb", "LightBulb", 3)]);
        let loaded = load_units(std::slice::from_ref(&unit), &KnownTypes::from_units(std::slice::from_ref(&unit)));
        let decl = &unit.methods[3];
        let cfg = build_cfg(decl).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = Tracker::new(&loaded.registry, decl, &cancel).walk(&cfg, &mut |_| {});
        assert_eq!(result, Err(Cancelled));
    }

    #[test]
    fn test_labels_prefer_named_variables() {
        let mut env = Env::default();
        env.vars.insert("$t0".into(), Value::Object("o1".into()));
        env.vars.insert("list".into(), Value::Object("o1".into()));
        env.vars.insert("$t1".into(), Value::Object("o2".into()));
        let labels = labels(&env);
        assert_eq!(labels["o1"], "list");
        assert_eq!(labels["o2"], "$t1");
        assert_eq!(label_of(&labels, "o1", true), "old(list)");
    }
}
