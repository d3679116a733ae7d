//! Built-in decision procedure for linear arithmetic
//!
//! The negated obligation is put in negation normal form (lifting
//! if-then-else out of atoms), expanded to DNF, and every clause is decided
//! by Fourier–Motzkin elimination over exact rationals. Equalities are
//! eliminated by substitution first; constraints over integer variables are
//! tightened after every step. A satisfiable clause yields a witness by
//! back-substitution, which is re-checked against the clause before it is
//! reported. Non-linear subterms become abstraction symbols.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::vcgen::{ArithOp, CmpOp, ScalarVc, Sort, Term};

use super::rational::{gcd, lcm, Rational};
use super::{Outcome, ScalarBackend, SolverError, UnknownReason, Witness};

/// Fourier–Motzkin backend
#[derive(Debug, Clone)]
pub struct LinearSolver {
    timeout: Option<Duration>,
    max_dnf_clauses: usize,
    max_constraints: usize,
}

impl Default for LinearSolver {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_millis(2000)),
            max_dnf_clauses: 256,
            max_constraints: 512,
        }
    }
}

impl LinearSolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-query budget; `None` means unbounded
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_limits(mut self, max_dnf_clauses: usize, max_constraints: usize) -> Self {
        self.max_dnf_clauses = max_dnf_clauses;
        self.max_constraints = max_constraints;
        self
    }

    /// Decide satisfiability of a boolean term
    pub fn check_sat(&self, formula: &Term) -> Outcome {
        let mut ctx = Context {
            solver: self,
            deadline: self.timeout.map(|t| Instant::now() + t),
            sorts: BTreeMap::new(),
        };
        match ctx.decide(formula) {
            Ok(Decision::Unsat) => Outcome::Proved,
            Ok(Decision::Sat(witness)) => Outcome::Disproved(witness),
            Ok(Decision::NoWitness(reason)) => Outcome::Unknown(UnknownReason::Solver(reason)),
            Err(abort) => Outcome::Unknown(UnknownReason::Solver(abort.reason())),
        }
    }
}

impl ScalarBackend for LinearSolver {
    fn name(&self) -> &'static str {
        "builtin"
    }

    fn check(&self, vc: &ScalarVc) -> Result<Outcome, SolverError> {
        Ok(self.check_sat(&vc.negated_query()))
    }
}

#[derive(Debug)]
enum Abort {
    Timeout,
    Overflow,
    TooLarge(&'static str),
    Unsupported(String),
}

impl Abort {
    fn reason(&self) -> String {
        match self {
            Abort::Timeout => "timeout".to_string(),
            Abort::Overflow => "arithmetic overflow in exact rationals".to_string(),
            Abort::TooLarge(what) => format!("too many {what}"),
            Abort::Unsupported(what) => format!("unsupported term `{what}`"),
        }
    }
}

type Step<T> = Result<T, Abort>;

fn checked(value: Option<Rational>) -> Step<Rational> {
    value.ok_or(Abort::Overflow)
}

/// `sum(coeffs[x] * x) + constant`
#[derive(Debug, Clone, PartialEq)]
struct LinExpr {
    coeffs: BTreeMap<String, Rational>,
    constant: Rational,
}

impl LinExpr {
    fn constant(value: Rational) -> Self {
        Self {
            coeffs: BTreeMap::new(),
            constant: value,
        }
    }

    fn var(name: &str) -> Self {
        Self {
            coeffs: BTreeMap::from([(name.to_string(), Rational::ONE)]),
            constant: Rational::ZERO,
        }
    }

    fn is_constant(&self) -> bool {
        self.coeffs.is_empty()
    }

    fn add(&self, other: &LinExpr) -> Step<LinExpr> {
        let mut out = self.clone();
        for (var, c) in &other.coeffs {
            let sum = checked(out.coeffs.get(var).copied().unwrap_or_default().checked_add(*c))?;
            if sum.is_zero() {
                out.coeffs.remove(var);
            } else {
                out.coeffs.insert(var.clone(), sum);
            }
        }
        out.constant = checked(out.constant.checked_add(other.constant))?;
        Ok(out)
    }

    fn scale(&self, k: Rational) -> Step<LinExpr> {
        if k.is_zero() {
            return Ok(LinExpr::constant(Rational::ZERO));
        }
        let mut coeffs = BTreeMap::new();
        for (var, c) in &self.coeffs {
            coeffs.insert(var.clone(), checked(c.checked_mul(k))?);
        }
        Ok(LinExpr {
            coeffs,
            constant: checked(self.constant.checked_mul(k))?,
        })
    }

    fn sub(&self, other: &LinExpr) -> Step<LinExpr> {
        self.add(&other.scale(Rational::integer(-1))?)
    }

    fn substitute(&self, var: &str, def: &LinExpr) -> Step<LinExpr> {
        match self.coeffs.get(var) {
            None => Ok(self.clone()),
            Some(c) => {
                let mut rest = self.clone();
                rest.coeffs.remove(var);
                rest.add(&def.scale(*c)?)
            }
        }
    }

    fn eval(&self, values: &BTreeMap<String, Rational>) -> Step<Rational> {
        let mut acc = self.constant;
        for (var, c) in &self.coeffs {
            let v = values.get(var).copied().unwrap_or_default();
            acc = checked(acc.checked_add(checked(c.checked_mul(v))?))?;
        }
        Ok(acc)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rel {
    Le,
    Lt,
    Eq,
}

impl Rel {
    fn holds(self, value: Rational) -> bool {
        match self {
            Rel::Le => value.signum() <= 0,
            Rel::Lt => value.signum() < 0,
            Rel::Eq => value.is_zero(),
        }
    }
}

/// `expr rel 0`
#[derive(Debug, Clone, PartialEq)]
struct Constraint {
    expr: LinExpr,
    rel: Rel,
}

impl Constraint {
    fn substitute(&self, var: &str, def: &LinExpr) -> Step<Constraint> {
        Ok(Constraint {
            expr: self.expr.substitute(var, def)?,
            rel: self.rel,
        })
    }
}

#[derive(Debug, Clone)]
enum Literal {
    Lin(Constraint),
    Bool(String, bool),
}

#[derive(Debug, Clone)]
enum Nnf {
    Const(bool),
    Lit(Literal),
    And(Vec<Nnf>),
    Or(Vec<Nnf>),
}

#[derive(Debug, Clone)]
struct Bound {
    expr: LinExpr,
    strict: bool,
}

#[derive(Debug)]
enum Elim {
    Subst { var: String, def: LinExpr },
    Bounds { var: String, lowers: Vec<Bound>, uppers: Vec<Bound> },
}

enum Norm {
    True,
    False,
    Keep(Constraint),
}

enum Decision {
    Unsat,
    Sat(Witness),
    NoWitness(String),
}

struct Context<'a> {
    solver: &'a LinearSolver,
    deadline: Option<Instant>,
    sorts: BTreeMap<String, Sort>,
}

impl Context<'_> {
    fn tick(&self) -> Step<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Abort::Timeout),
            _ => Ok(()),
        }
    }

    fn decide(&mut self, formula: &Term) -> Step<Decision> {
        self.tick()?;
        let nnf = self.nnf(formula, true)?;
        let clauses = self.dnf(&nnf)?;
        trace!(clauses = clauses.len(), "linear: expanded to DNF");
        let mut undecided = None;
        for clause in &clauses {
            self.tick()?;
            match self.solve_clause(clause)? {
                Decision::Unsat => {}
                Decision::Sat(witness) => return Ok(Decision::Sat(witness)),
                Decision::NoWitness(reason) => undecided = undecided.or(Some(reason)),
            }
        }
        Ok(match undecided {
            Some(reason) => Decision::NoWitness(reason),
            None => Decision::Unsat,
        })
    }

    fn nnf(&mut self, term: &Term, positive: bool) -> Step<Nnf> {
        stacker::maybe_grow(crate::STACK_RED_ZONE, crate::STACK_GROW_SIZE, || self.nnf_inner(term, positive))
    }

    fn nnf_inner(&mut self, term: &Term, positive: bool) -> Step<Nnf> {
        match term {
            Term::Bool(b) => Ok(Nnf::Const(*b == positive)),
            Term::Var(sym) if sym.sort == Sort::Bool => Ok(Nnf::Lit(Literal::Bool(sym.name.clone(), positive))),
            Term::Not(inner) => self.nnf(inner, !positive),
            Term::And(parts) | Term::Or(parts) => {
                let conjunctive = matches!(term, Term::And(_)) == positive;
                let children = parts
                    .iter()
                    .map(|p| self.nnf(p, positive))
                    .collect::<Step<Vec<_>>>()?;
                Ok(if conjunctive { Nnf::And(children) } else { Nnf::Or(children) })
            }
            Term::Implies(a, b) => {
                let as_or = Term::or([Term::not((**a).clone()), (**b).clone()]);
                self.nnf(&as_or, positive)
            }
            Term::Ite(c, a, b) if term.sort() == Sort::Bool => {
                Ok(Nnf::Or(vec![
                    Nnf::And(vec![self.nnf(c, true)?, self.nnf(a, positive)?]),
                    Nnf::And(vec![self.nnf(c, false)?, self.nnf(b, positive)?]),
                ]))
            }
            Term::Cmp(op, a, b) => {
                let op = if positive { *op } else { op.negate() };
                self.atom(op, a, b)
            }
            other => Err(Abort::Unsupported(other.to_string())),
        }
    }

    fn atom(&mut self, op: CmpOp, a: &Term, b: &Term) -> Step<Nnf> {
        if let Some((c, a1, a2)) = split_ite(a) {
            return Ok(Nnf::Or(vec![
                Nnf::And(vec![self.nnf(&c, true)?, self.atom(op, &a1, b)?]),
                Nnf::And(vec![self.nnf(&c, false)?, self.atom(op, &a2, b)?]),
            ]));
        }
        if let Some((c, b1, b2)) = split_ite(b) {
            return Ok(Nnf::Or(vec![
                Nnf::And(vec![self.nnf(&c, true)?, self.atom(op, a, &b1)?]),
                Nnf::And(vec![self.nnf(&c, false)?, self.atom(op, a, &b2)?]),
            ]));
        }
        let diff = self.linearize(a)?.sub(&self.linearize(b)?)?;
        let neg = || diff.scale(Rational::integer(-1));
        let lit = |expr, rel| Nnf::Lit(Literal::Lin(Constraint { expr, rel }));
        Ok(match op {
            CmpOp::Lt => lit(diff.clone(), Rel::Lt),
            CmpOp::Le => lit(diff.clone(), Rel::Le),
            CmpOp::Gt => lit(neg()?, Rel::Lt),
            CmpOp::Ge => lit(neg()?, Rel::Le),
            CmpOp::Eq => lit(diff.clone(), Rel::Eq),
            CmpOp::Ne => Nnf::Or(vec![lit(diff.clone(), Rel::Lt), lit(neg()?, Rel::Lt)]),
        })
    }

    fn linearize(&mut self, term: &Term) -> Step<LinExpr> {
        stacker::maybe_grow(crate::STACK_RED_ZONE, crate::STACK_GROW_SIZE, || self.linearize_inner(term))
    }

    fn linearize_inner(&mut self, term: &Term) -> Step<LinExpr> {
        match term {
            Term::Int(n) => Ok(LinExpr::constant(Rational::integer(*n))),
            Term::Real(r) => Ok(LinExpr::constant(*r)),
            Term::Var(sym) => {
                self.sorts.insert(sym.name.clone(), sym.sort);
                Ok(LinExpr::var(&sym.name))
            }
            Term::Neg(inner) => self.linearize(inner)?.scale(Rational::integer(-1)),
            Term::Arith(ArithOp::Add, a, b) => self.linearize(a)?.add(&self.linearize(b)?),
            Term::Arith(ArithOp::Sub, a, b) => self.linearize(a)?.sub(&self.linearize(b)?),
            Term::Arith(ArithOp::Mul, a, b) => {
                let x = self.linearize(a)?;
                let y = self.linearize(b)?;
                if x.is_constant() {
                    y.scale(x.constant)
                } else if y.is_constant() {
                    x.scale(y.constant)
                } else {
                    Ok(self.abstraction(term))
                }
            }
            Term::Arith(ArithOp::Div, a, b) if term.sort() == Sort::Real => {
                let y = self.linearize(b)?;
                if y.is_constant() && !y.constant.is_zero() {
                    let inverse = checked(Rational::ONE.checked_div(y.constant))?;
                    self.linearize(a)?.scale(inverse)
                } else {
                    Ok(self.abstraction(term))
                }
            }
            _ => Ok(self.abstraction(term)),
        }
    }

    /// Treat a non-linear subterm as an opaque variable
    fn abstraction(&mut self, term: &Term) -> LinExpr {
        let name = format!("?({term})");
        let sort = match term.sort() {
            Sort::Bool => Sort::Real,
            other => other,
        };
        self.sorts.insert(name.clone(), sort);
        LinExpr::var(&name)
    }

    fn dnf(&self, formula: &Nnf) -> Step<Vec<Vec<Literal>>> {
        stacker::maybe_grow(crate::STACK_RED_ZONE, crate::STACK_GROW_SIZE, || self.dnf_inner(formula))
    }

    fn dnf_inner(&self, formula: &Nnf) -> Step<Vec<Vec<Literal>>> {
        let limit = self.solver.max_dnf_clauses;
        match formula {
            Nnf::Const(true) => Ok(vec![Vec::new()]),
            Nnf::Const(false) => Ok(Vec::new()),
            Nnf::Lit(lit) => Ok(vec![vec![lit.clone()]]),
            Nnf::Or(parts) => {
                let mut out = Vec::new();
                for part in parts {
                    out.extend(self.dnf(part)?);
                    if out.len() > limit {
                        return Err(Abort::TooLarge("DNF clauses"));
                    }
                }
                Ok(out)
            }
            Nnf::And(parts) => {
                let mut acc: Vec<Vec<Literal>> = vec![Vec::new()];
                for part in parts {
                    let rhs = self.dnf(part)?;
                    let mut next = Vec::with_capacity(acc.len() * rhs.len());
                    for left in &acc {
                        for right in &rhs {
                            let mut clause = left.clone();
                            clause.extend(right.iter().cloned());
                            next.push(clause);
                        }
                    }
                    if next.len() > limit {
                        return Err(Abort::TooLarge("DNF clauses"));
                    }
                    acc = next;
                    if acc.is_empty() {
                        break;
                    }
                }
                Ok(acc)
            }
        }
    }

    fn solve_clause(&self, clause: &[Literal]) -> Step<Decision> {
        let mut bools: BTreeMap<String, bool> = BTreeMap::new();
        let mut constraints = Vec::new();
        for lit in clause {
            match lit {
                Literal::Bool(name, polarity) => {
                    if bools.insert(name.clone(), *polarity).is_some_and(|prev| prev != *polarity) {
                        return Ok(Decision::Unsat);
                    }
                }
                Literal::Lin(c) => constraints.push(c.clone()),
            }
        }
        if constraints.len() > self.solver.max_constraints {
            return Err(Abort::TooLarge("constraints"));
        }

        let Some(values) = self.eliminate(constraints.clone())? else {
            return Ok(Decision::Unsat);
        };
        let Some(values) = values else {
            return Ok(Decision::NoWitness("no integer solution found for a real-feasible clause".to_string()));
        };
        for c in &constraints {
            if !c.rel.holds(c.expr.eval(&values)?) {
                return Ok(Decision::NoWitness("witness does not satisfy the integer constraints".to_string()));
            }
        }

        let mut witness = Witness::new();
        for c in &constraints {
            for var in c.expr.coeffs.keys() {
                let value = values.get(var).copied().unwrap_or_default();
                witness.insert(var.clone(), value.to_string());
            }
        }
        for (name, value) in bools {
            witness.insert(name, value.to_string());
        }
        if let Some(name) = witness.keys().find(|k| k.starts_with('?')) {
            return Ok(Decision::NoWitness(format!(
                "counterexample depends on abstracted term `{}`",
                name.trim_start_matches('?')
            )));
        }
        Ok(Decision::Sat(witness))
    }

    fn is_integral(&self, expr: &LinExpr) -> bool {
        expr.coeffs
            .keys()
            .all(|v| self.sorts.get(v).copied().unwrap_or(Sort::Int) == Sort::Int)
    }

    /// Fold constants and tighten constraints over integers
    fn normalize(&self, c: Constraint) -> Step<Norm> {
        if c.expr.is_constant() {
            return Ok(if c.rel.holds(c.expr.constant) { Norm::True } else { Norm::False });
        }
        if !self.is_integral(&c.expr) {
            return Ok(Norm::Keep(c));
        }
        // Clear denominators
        let mut l = c.expr.constant.denom();
        for coeff in c.expr.coeffs.values() {
            l = lcm(l, coeff.denom()).ok_or(Abort::Overflow)?;
        }
        let mut expr = c.expr.scale(Rational::integer(l))?;
        let mut rel = c.rel;
        if rel == Rel::Lt {
            expr.constant = checked(expr.constant.checked_add(Rational::ONE))?;
            rel = Rel::Le;
        }
        let g = expr.coeffs.values().fold(0, |g, c| gcd(g, c.numer()));
        if g > 1 {
            let divisor = Rational::integer(g);
            let scaled = checked(expr.constant.checked_div(divisor))?;
            match rel {
                Rel::Eq if !scaled.is_integer() => return Ok(Norm::False),
                Rel::Le => {
                    expr = expr.scale(checked(Rational::ONE.checked_div(divisor))?)?;
                    expr.constant = Rational::integer(scaled.ceil());
                }
                _ => expr = expr.scale(checked(Rational::ONE.checked_div(divisor))?)?,
            }
        }
        Ok(Norm::Keep(Constraint { expr, rel }))
    }

    fn normalize_all(&self, system: Vec<Constraint>) -> Step<Option<Vec<Constraint>>> {
        let mut out: Vec<Constraint> = Vec::with_capacity(system.len());
        for c in system {
            match self.normalize(c)? {
                Norm::True => {}
                Norm::False => return Ok(None),
                Norm::Keep(c) => {
                    if !out.contains(&c) {
                        out.push(c);
                    }
                }
            }
        }
        Ok(Some(out))
    }

    /// `Ok(None)`: infeasible. `Ok(Some(None))`: feasible over the reals but
    /// back-substitution found no integer point.
    #[allow(clippy::type_complexity)]
    fn eliminate(&self, system: Vec<Constraint>) -> Step<Option<Option<BTreeMap<String, Rational>>>> {
        let mut system = system;
        let mut steps = Vec::new();
        loop {
            self.tick()?;
            let Some(normalized) = self.normalize_all(system)? else {
                return Ok(None);
            };
            system = normalized;
            let vars: BTreeSet<String> = system
                .iter()
                .flat_map(|c| c.expr.coeffs.keys().cloned())
                .collect();
            if vars.is_empty() {
                break;
            }

            system = self.pair_bounds(system)?;
            let pivot = system
                .iter()
                .enumerate()
                .filter(|(_, c)| c.rel == Rel::Eq)
                .find_map(|(pos, c)| self.pick_pivot(&c.expr).transpose().map(|p| (pos, p)));
            if let Some((pos, pivot)) = pivot {
                let (var, coeff) = pivot?;
                let eq = system.remove(pos);
                let mut rest = eq.expr.clone();
                rest.coeffs.remove(&var);
                let def = rest.scale(checked(Rational::integer(-1).checked_div(coeff))?)?;
                system = system
                    .iter()
                    .map(|c| c.substitute(&var, &def))
                    .collect::<Step<Vec<_>>>()?;
                steps.push(Elim::Subst { var, def });
                continue;
            }
            // Integer equalities without a unit pivot become two bounds
            if system.iter().any(|c| c.rel == Rel::Eq) {
                let mut split = Vec::with_capacity(system.len() + 1);
                for c in system {
                    if c.rel == Rel::Eq {
                        split.push(Constraint {
                            expr: c.expr.scale(Rational::integer(-1))?,
                            rel: Rel::Le,
                        });
                        split.push(Constraint { rel: Rel::Le, ..c });
                    } else {
                        split.push(c);
                    }
                }
                system = split;
                continue;
            }

            let var = self.pick_elimination_var(&system, &vars);
            let mut lowers = Vec::new();
            let mut uppers = Vec::new();
            let mut rest = Vec::new();
            for c in system {
                let Some(a) = c.expr.coeffs.get(&var).copied() else {
                    rest.push(c);
                    continue;
                };
                let mut r = c.expr.clone();
                r.coeffs.remove(&var);
                // a*x + r rel 0  <=>  x rel' -r/a
                let bound = Bound {
                    expr: r.scale(checked(Rational::integer(-1).checked_div(a))?)?,
                    strict: c.rel == Rel::Lt,
                };
                if a.signum() > 0 {
                    uppers.push(bound);
                } else {
                    lowers.push(bound);
                }
            }
            for l in &lowers {
                for u in &uppers {
                    rest.push(Constraint {
                        expr: l.expr.sub(&u.expr)?,
                        rel: if l.strict || u.strict { Rel::Lt } else { Rel::Le },
                    });
                }
                if rest.len() > self.solver.max_constraints {
                    return Err(Abort::TooLarge("constraints"));
                }
            }
            steps.push(Elim::Bounds { var, lowers, uppers });
            system = rest;
        }

        let mut values = BTreeMap::new();
        for step in steps.iter().rev() {
            match step {
                Elim::Subst { var, def } => {
                    let value = def.eval(&values)?;
                    let integral = self.sorts.get(var).copied().unwrap_or(Sort::Int) == Sort::Int;
                    if integral && !value.is_integer() {
                        return Ok(Some(None));
                    }
                    values.insert(var.clone(), value);
                }
                Elim::Bounds { var, lowers, uppers } => {
                    let integral = self.sorts.get(var).copied().unwrap_or(Sort::Int) == Sort::Int;
                    match pick_value(lowers, uppers, &values, integral)? {
                        Some(v) => {
                            values.insert(var.clone(), v);
                        }
                        None => return Ok(Some(None)),
                    }
                }
            }
        }
        Ok(Some(Some(values)))
    }

    /// Variable of an equality with the smallest coefficient magnitude.
    /// Integer variables qualify only with a unit coefficient, so the
    /// substituted definition stays integral.
    fn pick_pivot(&self, expr: &LinExpr) -> Step<Option<(String, Rational)>> {
        let mut best: Option<(Rational, &String, Rational)> = None;
        for (var, c) in &expr.coeffs {
            let magnitude = checked(c.abs())?;
            let integral = self.sorts.get(var).copied().unwrap_or(Sort::Int) == Sort::Int;
            if integral && magnitude != Rational::ONE {
                continue;
            }
            if best.as_ref().is_none_or(|(m, _, _)| magnitude < *m) {
                best = Some((magnitude, var, *c));
            }
        }
        Ok(best.map(|(_, v, c)| (v.clone(), c)))
    }

    /// `e <= 0 && -e <= 0` becomes `e == 0` when it has a usable pivot
    fn pair_bounds(&self, system: Vec<Constraint>) -> Step<Vec<Constraint>> {
        let mut out: Vec<Constraint> = Vec::with_capacity(system.len());
        for c in system {
            if c.rel == Rel::Le {
                let negated = c.expr.scale(Rational::integer(-1))?;
                let opposite = out.iter().position(|o| o.rel == Rel::Le && o.expr == negated);
                if let Some(pos) = opposite
                    && self.pick_pivot(&c.expr)?.is_some()
                {
                    out[pos] = Constraint { expr: c.expr, rel: Rel::Eq };
                    continue;
                }
            }
            out.push(c);
        }
        Ok(out)
    }

    /// Variable whose elimination creates the fewest new constraints
    fn pick_elimination_var(&self, system: &[Constraint], vars: &BTreeSet<String>) -> String {
        let mut best: Option<(usize, &String)> = None;
        for var in vars {
            let (mut pos, mut neg) = (0usize, 0usize);
            for c in system {
                match c.expr.coeffs.get(var).map(Rational::signum) {
                    Some(s) if s > 0 => pos += 1,
                    Some(_) => neg += 1,
                    None => {}
                }
            }
            let cost = pos * neg;
            if best.is_none_or(|(b, _)| cost < b) {
                best = Some((cost, var));
            }
        }
        best.map(|(_, v)| v.clone()).unwrap_or_default()
    }
}

/// Choose a value between the tightest bounds, preferring small integers
fn pick_value(
    lowers: &[Bound],
    uppers: &[Bound],
    values: &BTreeMap<String, Rational>,
    integral: bool,
) -> Step<Option<Rational>> {
    let mut lo: Option<(Rational, bool)> = None;
    for b in lowers {
        let v = b.expr.eval(values)?;
        if lo.is_none_or(|(cur, strict)| v > cur || (v == cur && b.strict && !strict)) {
            lo = Some((v, b.strict));
        }
    }
    let mut hi: Option<(Rational, bool)> = None;
    for b in uppers {
        let v = b.expr.eval(values)?;
        if hi.is_none_or(|(cur, strict)| v < cur || (v == cur && b.strict && !strict)) {
            hi = Some((v, b.strict));
        }
    }

    let fits = |x: Rational| {
        lo.is_none_or(|(l, s)| if s { x > l } else { x >= l })
            && hi.is_none_or(|(h, s)| if s { x < h } else { x <= h })
    };
    if fits(Rational::ZERO) {
        return Ok(Some(Rational::ZERO));
    }
    let mut candidates = Vec::new();
    if let Some((l, s)) = lo {
        let first = if s { l.floor() + 1 } else { l.ceil() };
        candidates.push(Rational::integer(first));
    }
    if let Some((h, s)) = hi {
        let last = if s { h.ceil() - 1 } else { h.floor() };
        candidates.push(Rational::integer(last));
    }
    if let Some(c) = candidates.into_iter().find(|c| fits(*c)) {
        return Ok(Some(c));
    }
    if integral {
        return Ok(None);
    }
    match (lo, hi) {
        (Some((l, _)), Some((h, _))) => {
            let mid = checked(checked(l.checked_add(h))?.checked_div(Rational::integer(2)))?;
            Ok(fits(mid).then_some(mid))
        }
        (Some((l, _)), None) => Ok(Some(checked(l.checked_add(Rational::ONE))?)),
        (None, Some((h, _))) => Ok(Some(checked(h.checked_sub(Rational::ONE))?)),
        (None, None) => Ok(Some(Rational::ZERO)),
    }
}

/// Split the first arithmetic if-then-else: `(cond, term[then], term[else])`
fn split_ite(term: &Term) -> Option<(Term, Term, Term)> {
    match term {
        Term::Ite(c, a, b) if term.sort() != Sort::Bool => Some(((**c).clone(), (**a).clone(), (**b).clone())),
        Term::Neg(inner) => split_ite(inner).map(|(c, a, b)| (c, Term::neg(a), Term::neg(b))),
        Term::Arith(op, x, y) => match split_ite(x) {
            Some((c, a, b)) => Some((c, Term::arith(*op, a, (**y).clone()), Term::arith(*op, b, (**y).clone()))),
            None => split_ite(y)
                .map(|(c, a, b)| (c, Term::arith(*op, (**x).clone(), a), Term::arith(*op, (**x).clone(), b))),
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(name: &str) -> Term {
        Term::var(name, Sort::Int)
    }

    fn real(name: &str) -> Term {
        Term::var(name, Sort::Real)
    }

    fn cmp(op: CmpOp, a: Term, b: Term) -> Term {
        Term::cmp(op, a, b)
    }

    fn solver() -> LinearSolver {
        LinearSolver::new().with_timeout(None)
    }

    #[test]
    fn test_unsat_bounds() {
        // x > 3 && x < 2
        let f = Term::and([cmp(CmpOp::Gt, int("x"), Term::Int(3)), cmp(CmpOp::Lt, int("x"), Term::Int(2))]);
        assert_eq!(solver().check_sat(&f), Outcome::Proved);
    }

    #[test]
    fn test_sat_with_witness() {
        // size == 1 && !(1 < size)
        let f = Term::and([
            cmp(CmpOp::Eq, int("size"), Term::Int(1)),
            Term::not(cmp(CmpOp::Lt, Term::Int(1), int("size"))),
        ]);
        match solver().check_sat(&f) {
            Outcome::Disproved(w) => assert_eq!(w.get("size").map(String::as_str), Some("1")),
            other => panic!("expected witness, got {other:?}"),
        }
    }

    #[test]
    fn test_integer_tightening() {
        // 2x == 1 has no integer solution
        let f = cmp(CmpOp::Eq, Term::arith(ArithOp::Mul, Term::Int(2), int("x")), Term::Int(1));
        assert_eq!(solver().check_sat(&f), Outcome::Proved);
        // 0 < 2x < 2 has none either
        let g = Term::and([
            cmp(CmpOp::Lt, Term::Int(0), Term::arith(ArithOp::Mul, Term::Int(2), int("x"))),
            cmp(CmpOp::Lt, Term::arith(ArithOp::Mul, Term::Int(2), int("x")), Term::Int(2)),
        ]);
        assert_eq!(solver().check_sat(&g), Outcome::Proved);
    }

    #[test]
    fn test_integer_equality_without_unit_pivot() {
        // 2x == 3y + 1 && 0 <= y <= 0 has no integer solution
        let two_x = Term::arith(ArithOp::Mul, Term::Int(2), int("x"));
        let three_y = Term::arith(ArithOp::Mul, Term::Int(3), int("y"));
        let f = Term::and([
            cmp(CmpOp::Eq, two_x, Term::arith(ArithOp::Add, three_y, Term::Int(1))),
            cmp(CmpOp::Le, Term::Int(0), int("y")),
            cmp(CmpOp::Le, int("y"), Term::Int(0)),
        ]);
        assert_eq!(solver().check_sat(&f), Outcome::Proved);
    }

    #[test]
    fn test_integer_witness_is_never_fractional() {
        // 2x == 3y + 1 && 0 <= y <= 3: y = 1, x = 2 is a solution
        let two_x = Term::arith(ArithOp::Mul, Term::Int(2), int("x"));
        let three_y = Term::arith(ArithOp::Mul, Term::Int(3), int("y"));
        let f = Term::and([
            cmp(CmpOp::Eq, two_x, Term::arith(ArithOp::Add, three_y, Term::Int(1))),
            cmp(CmpOp::Le, Term::Int(0), int("y")),
            cmp(CmpOp::Le, int("y"), Term::Int(3)),
        ]);
        match solver().check_sat(&f) {
            Outcome::Disproved(w) => assert!(w.values().all(|v| !v.contains('/')), "{w:?}"),
            Outcome::Unknown(_) => {}
            Outcome::Proved => panic!("satisfiable query reported as proved"),
        }
    }

    #[test]
    fn test_reals_are_dense() {
        // 0 < 2r < 2 is satisfiable over the reals
        let two_r = Term::arith(ArithOp::Mul, Term::Int(2), real("r"));
        let f = Term::and([cmp(CmpOp::Lt, Term::Int(0), two_r.clone()), cmp(CmpOp::Lt, two_r, Term::Int(2))]);
        match solver().check_sat(&f) {
            Outcome::Disproved(w) => assert_eq!(w["r"], "1/2"),
            other => panic!("expected witness, got {other:?}"),
        }
    }

    #[test]
    fn test_chained_equalities() {
        // s1 == s0 + 1 && s0 == 0 && !(0 < s1)
        let f = Term::and([
            cmp(CmpOp::Eq, int("s1"), Term::arith(ArithOp::Add, int("s0"), Term::Int(1))),
            cmp(CmpOp::Eq, int("s0"), Term::Int(0)),
            Term::not(cmp(CmpOp::Lt, Term::Int(0), int("s1"))),
        ]);
        assert_eq!(solver().check_sat(&f), Outcome::Proved);
    }

    #[test]
    fn test_fourier_motzkin_transitivity() {
        // x < y && y < z && z <= x
        let f = Term::and([
            cmp(CmpOp::Lt, int("x"), int("y")),
            cmp(CmpOp::Lt, int("y"), int("z")),
            cmp(CmpOp::Le, int("z"), int("x")),
        ]);
        assert_eq!(solver().check_sat(&f), Outcome::Proved);
    }

    #[test]
    fn test_disequality_splits() {
        // x != 0 && x >= 0 && x <= 0
        let f = Term::and([
            cmp(CmpOp::Ne, int("x"), Term::Int(0)),
            cmp(CmpOp::Ge, int("x"), Term::Int(0)),
            cmp(CmpOp::Le, int("x"), Term::Int(0)),
        ]);
        assert_eq!(solver().check_sat(&f), Outcome::Proved);
    }

    #[test]
    fn test_ite_is_lifted() {
        // abs = (x >= 0 ? x : -x) && abs < 0
        let abs = Term::ite(cmp(CmpOp::Ge, int("x"), Term::Int(0)), int("x"), Term::neg(int("x")));
        let f = cmp(CmpOp::Lt, abs, Term::Int(0));
        assert_eq!(solver().check_sat(&f), Outcome::Proved);
    }

    #[test]
    fn test_boolean_literals() {
        let b = Term::var("b", Sort::Bool);
        let f = Term::and([b.clone(), Term::not(b)]);
        assert_eq!(solver().check_sat(&f), Outcome::Proved);
    }

    #[test]
    fn test_nonlinear_counterexample_is_unknown() {
        // x * y > 0 is satisfiable only through the abstraction
        let f = cmp(CmpOp::Gt, Term::arith(ArithOp::Mul, int("x"), int("y")), Term::Int(0));
        assert!(matches!(solver().check_sat(&f), Outcome::Unknown(_)));
    }

    #[test]
    fn test_nonlinear_refutation_is_still_proved() {
        // x * y > 0 && x * y < 0
        let xy = Term::arith(ArithOp::Mul, int("x"), int("y"));
        let f = Term::and([cmp(CmpOp::Gt, xy.clone(), Term::Int(0)), cmp(CmpOp::Lt, xy, Term::Int(0))]);
        assert_eq!(solver().check_sat(&f), Outcome::Proved);
    }

    #[test]
    fn test_timeout_is_unknown() {
        let f = cmp(CmpOp::Lt, int("x"), int("y"));
        let out = LinearSolver::new().with_timeout(Some(Duration::ZERO)).check_sat(&f);
        assert_eq!(out, Outcome::Unknown(UnknownReason::Solver("timeout".to_string())));
    }

    #[test]
    fn test_dnf_limit() {
        // Four independent disequalities expand to 16 clauses
        let f = Term::and((0..4).map(|i| cmp(CmpOp::Ne, int(&format!("x{i}")), Term::Int(0))));
        let out = LinearSolver::new().with_timeout(None).with_limits(8, 512).check_sat(&f);
        assert_eq!(out, Outcome::Unknown(UnknownReason::Solver("too many DNF clauses".to_string())));
    }
}
