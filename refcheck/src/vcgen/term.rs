//! Solver terms
//!
//! Terms are built through smart constructors that fold constants, so an
//! obligation whose truth is decided syntactically never reaches a backend.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::solver::Rational;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Sort {
    Int,
    Real,
    Bool,
}

impl Sort {
    pub fn smt_name(self) -> &'static str {
        match self {
            Sort::Int => "Int",
            Sort::Real => "Real",
            Sort::Bool => "Bool",
        }
    }
}

/// A free symbol of the query
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Symbol {
    pub name: String,
    pub sort: Sort,
}

impl Symbol {
    pub fn new(name: impl Into<String>, sort: Sort) -> Self {
        Self {
            name: name.into(),
            sort,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn negate(self) -> CmpOp {
        match self {
            CmpOp::Eq => CmpOp::Ne,
            CmpOp::Ne => CmpOp::Eq,
            CmpOp::Lt => CmpOp::Ge,
            CmpOp::Le => CmpOp::Gt,
            CmpOp::Gt => CmpOp::Le,
            CmpOp::Ge => CmpOp::Lt,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }

    fn holds(self, ord: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CmpOp::Eq => ord == Equal,
            CmpOp::Ne => ord != Equal,
            CmpOp::Lt => ord == Less,
            CmpOp::Le => ord != Greater,
            CmpOp::Gt => ord == Greater,
            CmpOp::Ge => ord != Less,
        }
    }
}

impl ArithOp {
    fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Rem => "%",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Term {
    Bool(bool),
    Int(i128),
    Real(Rational),
    Var(Symbol),
    Not(Box<Term>),
    Neg(Box<Term>),
    Arith(ArithOp, Box<Term>, Box<Term>),
    Cmp(CmpOp, Box<Term>, Box<Term>),
    And(Vec<Term>),
    Or(Vec<Term>),
    Implies(Box<Term>, Box<Term>),
    Ite(Box<Term>, Box<Term>, Box<Term>),
}

impl Term {
    pub fn var(name: impl Into<String>, sort: Sort) -> Term {
        Term::Var(Symbol::new(name, sort))
    }

    pub fn sort(&self) -> Sort {
        match self {
            Term::Bool(_)
            | Term::Not(_)
            | Term::Cmp(..)
            | Term::And(_)
            | Term::Or(_)
            | Term::Implies(..) => Sort::Bool,
            Term::Int(_) => Sort::Int,
            Term::Real(_) => Sort::Real,
            Term::Var(sym) => sym.sort,
            Term::Neg(inner) => inner.sort(),
            Term::Arith(_, a, b) => {
                if a.sort() == Sort::Real || b.sort() == Sort::Real {
                    Sort::Real
                } else {
                    Sort::Int
                }
            }
            Term::Ite(_, then_term, _) => then_term.sort(),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Term::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<Rational> {
        match self {
            Term::Int(n) => Some(Rational::integer(*n)),
            Term::Real(r) => Some(*r),
            _ => None,
        }
    }

    fn number(value: Rational, sort: Sort) -> Term {
        if sort == Sort::Int && value.is_integer() {
            Term::Int(value.numer())
        } else {
            Term::Real(value)
        }
    }

    pub fn not(term: Term) -> Term {
        match term {
            Term::Bool(b) => Term::Bool(!b),
            Term::Not(inner) => *inner,
            Term::Cmp(op, a, b) => Term::Cmp(op.negate(), a, b),
            other => Term::Not(Box::new(other)),
        }
    }

    pub fn and(terms: impl IntoIterator<Item = Term>) -> Term {
        let mut out = Vec::new();
        for term in terms {
            match term {
                Term::Bool(true) => {}
                Term::Bool(false) => return Term::Bool(false),
                Term::And(inner) => out.extend(inner),
                other => {
                    if !out.contains(&other) {
                        out.push(other);
                    }
                }
            }
        }
        match out.len() {
            0 => Term::Bool(true),
            1 => out.pop().unwrap_or(Term::Bool(true)),
            _ => Term::And(out),
        }
    }

    pub fn or(terms: impl IntoIterator<Item = Term>) -> Term {
        let mut out = Vec::new();
        for term in terms {
            match term {
                Term::Bool(false) => {}
                Term::Bool(true) => return Term::Bool(true),
                Term::Or(inner) => out.extend(inner),
                other => {
                    if !out.contains(&other) {
                        out.push(other);
                    }
                }
            }
        }
        match out.len() {
            0 => Term::Bool(false),
            1 => out.pop().unwrap_or(Term::Bool(false)),
            _ => Term::Or(out),
        }
    }

    pub fn implies(lhs: Term, rhs: Term) -> Term {
        match (lhs.as_bool(), rhs.as_bool()) {
            (Some(false), _) | (_, Some(true)) => Term::Bool(true),
            (Some(true), _) => rhs,
            (_, Some(false)) => Term::not(lhs),
            _ => Term::Implies(Box::new(lhs), Box::new(rhs)),
        }
    }

    pub fn ite(cond: Term, then_term: Term, else_term: Term) -> Term {
        match cond.as_bool() {
            Some(true) => then_term,
            Some(false) => else_term,
            None if then_term == else_term => then_term,
            None => Term::Ite(Box::new(cond), Box::new(then_term), Box::new(else_term)),
        }
    }

    pub fn neg(term: Term) -> Term {
        match term {
            Term::Int(n) => match n.checked_neg() {
                Some(m) => Term::Int(m),
                None => Term::Neg(Box::new(Term::Int(n))),
            },
            Term::Real(r) => match r.checked_neg() {
                Some(m) => Term::Real(m),
                None => Term::Neg(Box::new(Term::Real(r))),
            },
            Term::Neg(inner) => *inner,
            other => Term::Neg(Box::new(other)),
        }
    }

    pub fn arith(op: ArithOp, lhs: Term, rhs: Term) -> Term {
        let sort = if lhs.sort() == Sort::Real || rhs.sort() == Sort::Real {
            Sort::Real
        } else {
            Sort::Int
        };
        if let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number())
            && let Some(folded) = fold_arith(op, a, b, sort)
        {
            return Term::number(folded, sort);
        }
        let zero = |t: &Term| t.as_number().is_some_and(|n| n.is_zero());
        let one = |t: &Term| t.as_number() == Some(Rational::ONE);
        match op {
            ArithOp::Add if zero(&lhs) => rhs,
            ArithOp::Add | ArithOp::Sub if zero(&rhs) => lhs,
            ArithOp::Mul | ArithOp::Div if one(&rhs) => lhs,
            ArithOp::Mul if one(&lhs) => rhs,
            _ => Term::Arith(op, Box::new(lhs), Box::new(rhs)),
        }
    }

    pub fn cmp(op: CmpOp, lhs: Term, rhs: Term) -> Term {
        if let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number()) {
            return Term::Bool(op.holds(a.cmp(&b)));
        }
        if lhs.sort() == Sort::Bool || rhs.sort() == Sort::Bool {
            return bool_cmp(op, lhs, rhs);
        }
        if lhs == rhs {
            return Term::Bool(matches!(op, CmpOp::Eq | CmpOp::Le | CmpOp::Ge));
        }
        Term::Cmp(op, Box::new(lhs), Box::new(rhs))
    }

    /// Free symbols, ordered by name
    pub fn symbols(&self) -> BTreeSet<Symbol> {
        let mut out = BTreeSet::new();
        self.collect_symbols(&mut out);
        out
    }

    fn collect_symbols(&self, out: &mut BTreeSet<Symbol>) {
        match self {
            Term::Bool(_) | Term::Int(_) | Term::Real(_) => {}
            Term::Var(sym) => {
                out.insert(sym.clone());
            }
            Term::Not(t) | Term::Neg(t) => t.collect_symbols(out),
            Term::Arith(_, a, b) | Term::Cmp(_, a, b) | Term::Implies(a, b) => {
                a.collect_symbols(out);
                b.collect_symbols(out);
            }
            Term::And(ts) | Term::Or(ts) => ts.iter().for_each(|t| t.collect_symbols(out)),
            Term::Ite(c, a, b) => {
                c.collect_symbols(out);
                a.collect_symbols(out);
                b.collect_symbols(out);
            }
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Term::Ite(..) => 0,
            Term::Implies(..) => 1,
            Term::Or(_) => 2,
            Term::And(_) => 3,
            Term::Cmp(CmpOp::Eq | CmpOp::Ne, ..) => 4,
            Term::Cmp(..) => 5,
            Term::Arith(ArithOp::Add | ArithOp::Sub, ..) => 6,
            Term::Arith(..) => 7,
            Term::Not(_) | Term::Neg(_) => 8,
            _ => 9,
        }
    }
}

fn fold_arith(op: ArithOp, a: Rational, b: Rational, sort: Sort) -> Option<Rational> {
    match op {
        ArithOp::Add => a.checked_add(b),
        ArithOp::Sub => a.checked_sub(b),
        ArithOp::Mul => a.checked_mul(b),
        // Integer division truncates toward zero like the host language
        ArithOp::Div if sort == Sort::Int => {
            let (x, y) = (a.numer(), b.numer());
            x.checked_div(y).map(Rational::integer)
        }
        ArithOp::Div => a.checked_div(b),
        ArithOp::Rem if sort == Sort::Int => {
            let (x, y) = (a.numer(), b.numer());
            x.checked_rem(y).map(Rational::integer)
        }
        ArithOp::Rem => None,
    }
}

fn bool_cmp(op: CmpOp, lhs: Term, rhs: Term) -> Term {
    let iff = match (lhs.as_bool(), rhs.as_bool()) {
        (Some(a), Some(b)) => Term::Bool(a == b),
        (Some(true), None) => rhs,
        (None, Some(true)) => lhs,
        (Some(false), None) => Term::not(rhs),
        (None, Some(false)) => Term::not(lhs),
        (None, None) if lhs == rhs => Term::Bool(true),
        (None, None) => Term::or([
            Term::and([lhs.clone(), rhs.clone()]),
            Term::and([Term::not(lhs), Term::not(rhs)]),
        ]),
    };
    match op {
        CmpOp::Eq => iff,
        CmpOp::Ne => Term::not(iff),
        // Ordering on booleans is not meaningful; keep the atom for the backend
        _ => Term::Bool(false),
    }
}

fn write_operand(f: &mut std::fmt::Formatter<'_>, term: &Term, min: u8) -> std::fmt::Result {
    if term.precedence() < min {
        write!(f, "({term})")
    } else {
        write!(f, "{term}")
    }
}

fn write_joined(f: &mut std::fmt::Formatter<'_>, terms: &[Term], sep: &str, prec: u8) -> std::fmt::Result {
    for (i, term) in terms.iter().enumerate() {
        if i > 0 {
            write!(f, " {sep} ")?;
        }
        write_operand(f, term, prec + 1)?;
    }
    Ok(())
}

impl std::fmt::Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Term::Bool(b) => write!(f, "{b}"),
            Term::Int(n) => write!(f, "{n}"),
            Term::Real(r) => write!(f, "{r}"),
            Term::Var(sym) => write!(f, "{}", sym.name),
            Term::Not(inner) => {
                write!(f, "!")?;
                write_operand(f, inner, 8)
            }
            Term::Neg(inner) => {
                write!(f, "-")?;
                write_operand(f, inner, 8)
            }
            Term::Arith(op, a, b) => {
                let prec = self.precedence();
                write_operand(f, a, prec)?;
                write!(f, " {} ", op.symbol())?;
                write_operand(f, b, prec + 1)
            }
            Term::Cmp(op, a, b) => {
                let prec = self.precedence();
                write_operand(f, a, prec + 1)?;
                write!(f, " {} ", op.symbol())?;
                write_operand(f, b, prec + 1)
            }
            Term::And(ts) => write_joined(f, ts, "&&", 3),
            Term::Or(ts) => write_joined(f, ts, "||", 2),
            Term::Implies(a, b) => {
                write_operand(f, a, 2)?;
                write!(f, " --> ")?;
                write_operand(f, b, 1)
            }
            Term::Ite(c, a, b) => {
                write_operand(f, c, 1)?;
                write!(f, " ? ")?;
                write_operand(f, a, 1)?;
                write!(f, " : {b}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x() -> Term {
        Term::var("x", Sort::Int)
    }

    #[test]
    fn test_constant_folding() {
        let sum = Term::arith(ArithOp::Add, Term::Int(2), Term::Int(3));
        assert_eq!(sum, Term::Int(5));
        assert_eq!(Term::cmp(CmpOp::Lt, Term::Int(1), Term::Int(2)), Term::Bool(true));
        assert_eq!(Term::arith(ArithOp::Div, Term::Int(-7), Term::Int(2)), Term::Int(-3));
        assert_eq!(Term::arith(ArithOp::Rem, Term::Int(-7), Term::Int(2)), Term::Int(-1));
    }

    #[test]
    fn test_division_by_zero_is_not_folded() {
        let div = Term::arith(ArithOp::Div, Term::Int(1), Term::Int(0));
        assert!(matches!(div, Term::Arith(ArithOp::Div, ..)));
    }

    #[test]
    fn test_identities() {
        assert_eq!(Term::arith(ArithOp::Add, Term::Int(0), x()), x());
        assert_eq!(Term::arith(ArithOp::Mul, x(), Term::Int(1)), x());
        assert_eq!(Term::cmp(CmpOp::Le, x(), x()), Term::Bool(true));
    }

    #[test]
    fn test_and_or_flatten() {
        let a = Term::cmp(CmpOp::Gt, x(), Term::Int(0));
        let t = Term::and([Term::Bool(true), a.clone(), Term::and([a.clone()])]);
        assert_eq!(t, a);
        assert_eq!(Term::or([Term::Bool(false), Term::Bool(true)]), Term::Bool(true));
        assert_eq!(Term::and(Vec::new()), Term::Bool(true));
    }

    #[test]
    fn test_not_flips_comparisons() {
        let t = Term::not(Term::cmp(CmpOp::Lt, x(), Term::Int(3)));
        assert_eq!(t, Term::cmp(CmpOp::Ge, x(), Term::Int(3)));
    }

    #[test]
    fn test_bool_equality_is_iff() {
        let b = Term::var("b", Sort::Bool);
        assert_eq!(Term::cmp(CmpOp::Eq, b.clone(), Term::Bool(true)), b);
        assert_eq!(Term::cmp(CmpOp::Ne, b.clone(), Term::Bool(true)), Term::not(b));
    }

    #[test]
    fn test_sort_inference() {
        let r = Term::var("r", Sort::Real);
        assert_eq!(Term::arith(ArithOp::Add, x(), r).sort(), Sort::Real);
        assert_eq!(Term::arith(ArithOp::Mul, x(), Term::Int(2)).sort(), Sort::Int);
    }

    #[test]
    fn test_display() {
        let size = Term::var("size(list)", Sort::Int);
        let t = Term::and([
            Term::cmp(CmpOp::Le, Term::Int(0), Term::Int(1)),
            Term::cmp(CmpOp::Lt, x(), size.clone()),
            Term::cmp(
                CmpOp::Eq,
                size,
                Term::arith(ArithOp::Sub, x(), Term::arith(ArithOp::Sub, Term::var("y", Sort::Int), Term::Int(1))),
            ),
        ]);
        assert_eq!(t.to_string(), "x < size(list) && size(list) == x - (y - 1)");
    }
}
