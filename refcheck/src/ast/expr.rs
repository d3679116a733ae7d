//! Method body AST nodes
//!
//! This is the shape the front end hands over after parsing and name
//! resolution. Statements and expressions are tagged by `kind` in JSON.

use serde::{Deserialize, Serialize};

use super::{Annotation, Location, TypeRef};

/// Statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Stmt {
    /// Local declaration: `ty name = init;`
    Let {
        name: String,
        ty: TypeRef,
        #[serde(default)]
        init: Option<Expr>,
        /// Refinement attached to the local variable
        #[serde(default)]
        refinement: Option<Annotation>,
        #[serde(default)]
        loc: Location,
    },

    /// Assignment to a local: `name = value;`
    Assign {
        target: String,
        value: Expr,
        #[serde(default)]
        loc: Location,
    },

    /// Expression evaluated for its effect
    Expr {
        expr: Expr,
        #[serde(default)]
        loc: Location,
    },

    If {
        cond: Expr,
        #[serde(rename = "then")]
        then_branch: Vec<Stmt>,
        #[serde(rename = "else", default)]
        else_branch: Vec<Stmt>,
        #[serde(default)]
        loc: Location,
    },

    While {
        cond: Expr,
        body: Vec<Stmt>,
        #[serde(default)]
        loc: Location,
    },

    Break {
        #[serde(default)]
        loc: Location,
    },

    Continue {
        #[serde(default)]
        loc: Location,
    },

    Return {
        #[serde(default)]
        value: Option<Expr>,
        #[serde(default)]
        loc: Location,
    },

    /// A construct the front end recognised but the analysis does not model
    /// (exception handlers, labelled jumps, switch fallthrough, ...)
    Unsupported {
        construct: String,
        #[serde(default)]
        loc: Location,
    },
}

impl Stmt {
    pub fn loc(&self) -> Location {
        match self {
            Stmt::Let { loc, .. }
            | Stmt::Assign { loc, .. }
            | Stmt::Expr { loc, .. }
            | Stmt::If { loc, .. }
            | Stmt::While { loc, .. }
            | Stmt::Break { loc }
            | Stmt::Continue { loc }
            | Stmt::Return { loc, .. }
            | Stmt::Unsupported { loc, .. } => *loc,
        }
    }
}

/// Expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    Int {
        value: i64,
    },

    /// Real literal, kept textual so the solver sees the exact decimal
    Real {
        value: String,
    },

    Bool {
        value: bool,
    },

    /// String literal (opaque to the verifier)
    Str {
        value: String,
    },

    Null,

    /// Local variable, parameter or `this`
    Var {
        name: String,
    },

    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },

    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },

    /// Conditional expression `cond ? then : else`
    Cond {
        cond: Box<Expr>,
        #[serde(rename = "then")]
        then_expr: Box<Expr>,
        #[serde(rename = "else")]
        else_expr: Box<Expr>,
    },

    /// Method invocation.
    ///
    /// `receiver` is absent for static calls (`class` names the owner) and
    /// for implicit calls on the enclosing class. `receiver_type` is the
    /// static type resolved by the front end, if it supplied one.
    Call {
        #[serde(default)]
        receiver: Option<Box<Expr>>,
        #[serde(default)]
        class: Option<String>,
        method: String,
        #[serde(default)]
        args: Vec<Expr>,
        #[serde(default)]
        receiver_type: Option<TypeRef>,
        #[serde(default)]
        loc: Location,
    },

    /// Object creation `new T(args)`
    New {
        ty: TypeRef,
        #[serde(default)]
        args: Vec<Expr>,
        #[serde(default)]
        loc: Location,
    },

    /// Static field read `Owner.NAME`
    Field {
        owner: String,
        name: String,
        #[serde(default)]
        loc: Location,
    },

    /// Anything the front end could not express; evaluates to an unknown value
    Opaque {
        #[serde(default)]
        description: String,
    },
}

impl Expr {
    pub fn int(value: i64) -> Self {
        Expr::Int { value }
    }

    pub fn bool(value: bool) -> Self {
        Expr::Bool { value }
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var { name: name.into() }
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Instance call on a named local
    pub fn call(receiver: &str, method: &str, args: Vec<Expr>, loc: Location) -> Self {
        Expr::Call {
            receiver: Some(Box::new(Expr::var(receiver))),
            class: None,
            method: method.to_string(),
            args,
            receiver_type: None,
            loc,
        }
    }

    /// Static call `Class.method(args)`
    pub fn static_call(class: &str, method: &str, args: Vec<Expr>, loc: Location) -> Self {
        Expr::Call {
            receiver: None,
            class: Some(class.to_string()),
            method: method.to_string(),
            args,
            receiver_type: None,
            loc,
        }
    }

    pub fn new_object(ty: &str, args: Vec<Expr>, loc: Location) -> Self {
        Expr::New {
            ty: TypeRef::parse(ty).unwrap_or_else(|_| TypeRef::simple(ty)),
            args,
            loc,
        }
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Int { value } => write!(f, "{value}"),
            Expr::Real { value } => write!(f, "{value}"),
            Expr::Bool { value } => write!(f, "{value}"),
            Expr::Str { value } => write!(f, "{value:?}"),
            Expr::Null => write!(f, "null"),
            Expr::Var { name } => write!(f, "{name}"),
            Expr::Unary { op, operand } => write!(f, "{}({operand})", op.symbol()),
            Expr::Binary { op, lhs, rhs } => write!(f, "({lhs} {} {rhs})", op.symbol()),
            Expr::Cond {
                cond,
                then_expr,
                else_expr,
            } => write!(f, "({cond} ? {then_expr} : {else_expr})"),
            Expr::Call {
                receiver,
                class,
                method,
                args,
                ..
            } => {
                match (receiver, class) {
                    (Some(receiver), _) => write!(f, "{receiver}.")?,
                    (None, Some(class)) => write!(f, "{class}.")?,
                    (None, None) => {}
                }
                write!(f, "{method}(")?;
                write_args(f, args)?;
                write!(f, ")")
            }
            Expr::New { ty, args, .. } => {
                write!(f, "new {ty}(")?;
                write_args(f, args)?;
                write!(f, ")")
            }
            Expr::Field { owner, name, .. } => write!(f, "{owner}.{name}"),
            Expr::Opaque { description } => write!(f, "<{description}>"),
        }
    }
}

pub(crate) fn write_args(f: &mut std::fmt::Formatter<'_>, args: &[Expr]) -> std::fmt::Result {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{arg}")?;
    }
    Ok(())
}

/// Binary operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    #[serde(rename = "+")]
    Add,
    #[serde(rename = "-")]
    Sub,
    #[serde(rename = "*")]
    Mul,
    #[serde(rename = "/")]
    Div,
    #[serde(rename = "%")]
    Rem,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "&&")]
    And,
    #[serde(rename = "||")]
    Or,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }
}

/// Unary operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnOp {
    #[serde(rename = "-")]
    Neg,
    #[serde(rename = "!")]
    Not,
}

impl UnOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnOp::Neg => "-",
            UnOp::Not => "!",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stmt_json_shape() {
        let json = r#"{
            "kind": "let", "name": "bulb", "ty": "LightBulb",
            "init": {"kind": "new", "ty": "LightBulb", "loc": {"line": 3, "column": 9}},
            "loc": {"line": 3, "column": 1}
        }"#;
        let stmt: Stmt = serde_json::from_str(json).unwrap();
        match &stmt {
            Stmt::Let { name, ty, init: Some(Expr::New { .. }), .. } => {
                assert_eq!(name, "bulb");
                assert_eq!(ty.name, "LightBulb");
            }
            other => panic!("unexpected statement {other:?}"),
        }
        assert_eq!(stmt.loc(), Location::new(3, 1));
    }

    #[test]
    fn test_if_uses_then_else_keys() {
        let json = r#"{
            "kind": "if", "cond": {"kind": "bool", "value": true},
            "then": [{"kind": "break"}]
        }"#;
        let stmt: Stmt = serde_json::from_str(json).unwrap();
        match stmt {
            Stmt::If { then_branch, else_branch, .. } => {
                assert_eq!(then_branch.len(), 1);
                assert!(else_branch.is_empty());
            }
            other => panic!("unexpected statement {other:?}"),
        }
    }

    #[test]
    fn test_binary_operator_symbols() {
        let json = r#"{"kind": "binary", "op": "<=", "lhs": {"kind": "var", "name": "x"}, "rhs": {"kind": "int", "value": 3}}"#;
        let expr: Expr = serde_json::from_str(json).unwrap();
        assert_eq!(expr, Expr::binary(BinOp::Le, Expr::var("x"), Expr::int(3)));
    }

    #[test]
    fn test_display() {
        let call = Expr::call(
            "list",
            "get",
            vec![Expr::binary(BinOp::Add, Expr::var("i"), Expr::int(1))],
            Location::default(),
        );
        assert_eq!(call.to_string(), "list.get((i + 1))");
        let ctor = Expr::new_object("java.util.ArrayList<Integer>", vec![], Location::default());
        assert_eq!(ctor.to_string(), "new java.util.ArrayList<Integer>()");
    }

    #[test]
    fn test_call_defaults() {
        let json = r#"{"kind": "call", "receiver": {"kind": "var", "name": "s"}, "method": "close"}"#;
        let expr: Expr = serde_json::from_str(json).unwrap();
        assert_eq!(expr, Expr::call("s", "close", vec![], Location::default()));
    }
}
