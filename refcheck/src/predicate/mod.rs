//! Refinement predicate AST
//!
//! Predicates are parsed from annotation text into `PredExpr` trees. Right
//! after parsing, every function application is a generic `App`; the contract
//! loader resolves each one into a ghost read, a state atom, or an expanded
//! alias, so a loaded predicate never contains `App`.

mod parser;

pub use parser::{parse_alias, parse_predicate, AliasDef};

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::ast::{Span, Spanned};

/// A predicate node with its span inside the annotation text
pub type Pred = Spanned<PredExpr>;

/// Predicate expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PredExpr {
    Int(i64),
    Real(String),
    Bool(bool),
    /// `_`: the refined value (parameter, return value, field, local)
    Value,
    This,
    /// `old(e)`: `e` evaluated in the pre-call snapshot
    Old(Box<Pred>),
    /// Parameter or local name
    Var(String),
    /// `#n`: positional parameter reference
    Positional(usize),
    /// Unresolved application `f(args)`
    App { name: String, args: Vec<Pred> },
    /// Ghost read `g(target)`
    Ghost { name: String, target: Box<Pred> },
    /// State membership atom `s(target)`
    State { name: String, target: Box<Pred> },
    Unary { op: PredUnOp, operand: Box<Pred> },
    Binary { op: PredBinOp, lhs: Box<Pred>, rhs: Box<Pred> },
    Ite { cond: Box<Pred>, then_branch: Box<Pred>, else_branch: Box<Pred> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PredUnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PredBinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Implies,
}

impl PredBinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            PredBinOp::Add => "+",
            PredBinOp::Sub => "-",
            PredBinOp::Mul => "*",
            PredBinOp::Div => "/",
            PredBinOp::Rem => "%",
            PredBinOp::Eq => "==",
            PredBinOp::Ne => "!=",
            PredBinOp::Lt => "<",
            PredBinOp::Le => "<=",
            PredBinOp::Gt => ">",
            PredBinOp::Ge => ">=",
            PredBinOp::And => "&&",
            PredBinOp::Or => "||",
            PredBinOp::Implies => "-->",
        }
    }

    /// Binding strength, higher binds tighter
    pub fn precedence(self) -> u8 {
        match self {
            PredBinOp::Implies => 1,
            PredBinOp::Or => 2,
            PredBinOp::And => 3,
            PredBinOp::Eq | PredBinOp::Ne => 4,
            PredBinOp::Lt | PredBinOp::Le | PredBinOp::Gt | PredBinOp::Ge => 5,
            PredBinOp::Add | PredBinOp::Sub => 6,
            PredBinOp::Mul | PredBinOp::Div | PredBinOp::Rem => 7,
        }
    }
}

/// A loaded predicate together with the annotation text it came from
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub source: String,
    pub expr: Pred,
}

impl Predicate {
    pub fn new(source: impl Into<String>, expr: Pred) -> Self {
        Self {
            source: source.into(),
            expr,
        }
    }

    /// The literal `true`
    pub fn is_trivially_true(&self) -> bool {
        matches!(self.expr.node, PredExpr::Bool(true))
    }

    pub fn mentions_state(&self) -> bool {
        self.expr.node.any(&|e| matches!(e, PredExpr::State { .. }))
    }

    /// Names of ghosts read on `this` (not under `old`)
    pub fn ghosts_on_this(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        collect_ghosts_on_this(&self.expr, false, &mut out);
        out
    }

    /// Split top-level `&&` into conjuncts
    pub fn conjuncts(&self) -> Vec<&Pred> {
        let mut out = Vec::new();
        flatten_and(&self.expr, &mut out);
        out
    }
}

impl Serialize for Predicate {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.expr.node)
    }
}

fn flatten_and<'a>(pred: &'a Pred, out: &mut Vec<&'a Pred>) {
    match &pred.node {
        PredExpr::Binary { op: PredBinOp::And, lhs, rhs } => {
            flatten_and(lhs, out);
            flatten_and(rhs, out);
        }
        _ => out.push(pred),
    }
}

fn collect_ghosts_on_this(pred: &Pred, under_old: bool, out: &mut BTreeSet<String>) {
    match &pred.node {
        PredExpr::Ghost { name, target } => {
            if !under_old && matches!(target.node, PredExpr::This) {
                out.insert(name.clone());
            }
            collect_ghosts_on_this(target, under_old, out);
        }
        PredExpr::Old(inner) => collect_ghosts_on_this(inner, true, out),
        _ => pred.node.for_each_child(|child| collect_ghosts_on_this(child, under_old, out)),
    }
}

impl PredExpr {
    /// Visit direct children
    pub fn for_each_child<'a>(&'a self, mut f: impl FnMut(&'a Pred)) {
        match self {
            PredExpr::Int(_)
            | PredExpr::Real(_)
            | PredExpr::Bool(_)
            | PredExpr::Value
            | PredExpr::This
            | PredExpr::Var(_)
            | PredExpr::Positional(_) => {}
            PredExpr::Old(inner) => f(inner),
            PredExpr::App { args, .. } => args.iter().for_each(f),
            PredExpr::Ghost { target, .. } | PredExpr::State { target, .. } => f(target),
            PredExpr::Unary { operand, .. } => f(operand),
            PredExpr::Binary { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            PredExpr::Ite { cond, then_branch, else_branch } => {
                f(cond);
                f(then_branch);
                f(else_branch);
            }
        }
    }

    /// True if any node in the tree satisfies `pred`
    pub fn any(&self, pred: &dyn Fn(&PredExpr) -> bool) -> bool {
        if pred(self) {
            return true;
        }
        let mut found = false;
        self.for_each_child(|child| {
            if !found {
                found = child.node.any(pred);
            }
        });
        found
    }

    /// Rebuild this node with every direct child replaced by `f(child)`
    pub fn map_children(&self, mut f: impl FnMut(&Pred) -> Pred) -> PredExpr {
        let mut boxed = |p: &Pred| Box::new(f(p));
        match self {
            PredExpr::Int(_)
            | PredExpr::Real(_)
            | PredExpr::Bool(_)
            | PredExpr::Value
            | PredExpr::This
            | PredExpr::Var(_)
            | PredExpr::Positional(_) => self.clone(),
            PredExpr::Old(inner) => PredExpr::Old(boxed(inner)),
            PredExpr::App { name, args } => PredExpr::App {
                name: name.clone(),
                args: args.iter().map(|a| *boxed(a)).collect(),
            },
            PredExpr::Ghost { name, target } => PredExpr::Ghost {
                name: name.clone(),
                target: boxed(target),
            },
            PredExpr::State { name, target } => PredExpr::State {
                name: name.clone(),
                target: boxed(target),
            },
            PredExpr::Unary { op, operand } => PredExpr::Unary {
                op: *op,
                operand: boxed(operand),
            },
            PredExpr::Binary { op, lhs, rhs } => PredExpr::Binary {
                op: *op,
                lhs: boxed(lhs),
                rhs: boxed(rhs),
            },
            PredExpr::Ite { cond, then_branch, else_branch } => PredExpr::Ite {
                cond: boxed(cond),
                then_branch: boxed(then_branch),
                else_branch: boxed(else_branch),
            },
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            PredExpr::Ite { .. } => 0,
            PredExpr::Binary { op, .. } => op.precedence(),
            PredExpr::Unary { .. } => 8,
            _ => 9,
        }
    }
}

/// Shorthand constructor used by the loader and tests
pub fn node(expr: PredExpr) -> Pred {
    Spanned::new(expr, Span::default())
}

/// Replace variables by the given predicates
pub fn substitute_vars(pred: &Pred, map: &BTreeMap<String, Pred>) -> Pred {
    stacker::maybe_grow(crate::STACK_RED_ZONE, crate::STACK_GROW_SIZE, || match &pred.node {
        PredExpr::Var(name) => match map.get(name) {
            Some(replacement) => replacement.clone(),
            None => pred.clone(),
        },
        other => Spanned::new(other.map_children(|c| substitute_vars(c, map)), pred.span),
    })
}

/// Give every node of `pred` the same span
pub fn respan(pred: &Pred, span: Span) -> Pred {
    Spanned::new(pred.node.map_children(|c| respan(c, span)), span)
}

fn write_operand(f: &mut std::fmt::Formatter<'_>, operand: &PredExpr, min: u8) -> std::fmt::Result {
    if operand.precedence() < min {
        write!(f, "({operand})")
    } else {
        write!(f, "{operand}")
    }
}

impl std::fmt::Display for PredExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PredExpr::Int(n) => write!(f, "{n}"),
            PredExpr::Real(s) => write!(f, "{s}"),
            PredExpr::Bool(b) => write!(f, "{b}"),
            PredExpr::Value => write!(f, "_"),
            PredExpr::This => write!(f, "this"),
            PredExpr::Old(inner) => write!(f, "old({})", inner.node),
            PredExpr::Var(name) => write!(f, "{name}"),
            PredExpr::Positional(i) => write!(f, "#{i}"),
            PredExpr::App { name, args } => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg.node)?;
                }
                write!(f, ")")
            }
            PredExpr::Ghost { name, target } | PredExpr::State { name, target } => {
                write!(f, "{name}({})", target.node)
            }
            PredExpr::Unary { op, operand } => {
                let symbol = match op {
                    PredUnOp::Neg => "-",
                    PredUnOp::Not => "!",
                };
                write!(f, "{symbol}")?;
                write_operand(f, &operand.node, 8)
            }
            PredExpr::Binary { op, lhs, rhs } => {
                let prec = op.precedence();
                // Implication is right-associative, everything else left
                let (lmin, rmin) = if *op == PredBinOp::Implies {
                    (prec + 1, prec)
                } else {
                    (prec, prec + 1)
                };
                write_operand(f, &lhs.node, lmin)?;
                write!(f, " {} ", op.symbol())?;
                write_operand(f, &rhs.node, rmin)
            }
            PredExpr::Ite { cond, then_branch, else_branch } => {
                write_operand(f, &cond.node, 1)?;
                write!(f, " ? ")?;
                write_operand(f, &then_branch.node, 1)?;
                write!(f, " : ")?;
                write!(f, "{}", else_branch.node)
            }
        }
    }
}
