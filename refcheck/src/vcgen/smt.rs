//! SMT-LIB2 rendering of scalar obligations

use std::collections::BTreeSet;
use std::fmt::Write;

use super::term::{ArithOp, CmpOp, Sort, Symbol, Term};
use super::ScalarVc;

/// SMT-LIB2 script builder
#[derive(Debug, Default)]
pub struct SmtScript {
    logic: String,
    declarations: Vec<String>,
    assertions: Vec<String>,
    trailer: Vec<String>,
}

impl SmtScript {
    pub fn new(logic: &str) -> Self {
        Self {
            logic: logic.to_string(),
            ..Self::default()
        }
    }

    pub fn declare_const(&mut self, symbol: &Symbol) {
        self.declarations.push(format!(
            "(declare-const {} {})",
            smt_symbol(&symbol.name),
            symbol.sort.smt_name()
        ));
    }

    pub fn assert(&mut self, term: &Term) {
        self.assertions.push(format!("(assert {})", to_smt(term)));
    }

    pub fn command(&mut self, command: &str) {
        self.trailer.push(command.to_string());
    }

    pub fn generate(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "(set-logic {})", self.logic);
        for line in self.declarations.iter().chain(&self.assertions) {
            let _ = writeln!(out, "{line}");
        }
        out.push_str("(check-sat)\n");
        for line in &self.trailer {
            let _ = writeln!(out, "{line}");
        }
        out
    }
}

/// Query whose unsatisfiability proves the obligation
pub fn render_query(vc: &ScalarVc, with_model: bool) -> String {
    let query = vc.negated_query();
    let mut script = SmtScript::new(&logic_for(&query));
    for symbol in query.symbols() {
        script.declare_const(&symbol);
    }
    for assumption in &vc.assumptions {
        script.assert(assumption);
    }
    script.assert(&Term::not(vc.goal.clone()));
    if with_model {
        script.command("(get-model)");
    }
    script.generate()
}

fn logic_for(term: &Term) -> String {
    let sorts: BTreeSet<Sort> = term.symbols().iter().map(|s| s.sort).collect();
    let arith = match (sorts.contains(&Sort::Int), sorts.contains(&Sort::Real) || has_real_literal(term)) {
        (true, true) => "IRA",
        (false, true) => "RA",
        _ => "IA",
    };
    let kind = if is_linear(term) { "L" } else { "N" };
    format!("QF_{kind}{arith}")
}

fn has_real_literal(term: &Term) -> bool {
    match term {
        Term::Real(_) => true,
        Term::Not(t) | Term::Neg(t) => has_real_literal(t),
        Term::Arith(_, a, b) | Term::Cmp(_, a, b) | Term::Implies(a, b) => {
            has_real_literal(a) || has_real_literal(b)
        }
        Term::And(ts) | Term::Or(ts) => ts.iter().any(has_real_literal),
        Term::Ite(c, a, b) => has_real_literal(c) || has_real_literal(a) || has_real_literal(b),
        _ => false,
    }
}

fn is_linear(term: &Term) -> bool {
    match term {
        Term::Arith(ArithOp::Mul, a, b) => {
            (a.as_number().is_some() || b.as_number().is_some()) && is_linear(a) && is_linear(b)
        }
        Term::Arith(ArithOp::Div | ArithOp::Rem, a, b) => b.as_number().is_some() && is_linear(a),
        Term::Arith(_, a, b) | Term::Cmp(_, a, b) | Term::Implies(a, b) => is_linear(a) && is_linear(b),
        Term::Not(t) | Term::Neg(t) => is_linear(t),
        Term::And(ts) | Term::Or(ts) => ts.iter().all(is_linear),
        Term::Ite(c, a, b) => is_linear(c) && is_linear(a) && is_linear(b),
        _ => true,
    }
}

/// Quote a symbol name unless it is already a simple SMT-LIB symbol
pub fn smt_symbol(name: &str) -> String {
    let simple = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.'));
    if simple {
        name.to_string()
    } else {
        let cleaned: String = name.chars().map(|c| if matches!(c, '|' | '\\') { '_' } else { c }).collect();
        format!("|{cleaned}|")
    }
}

fn number(n: i128) -> String {
    if n < 0 { format!("(- {})", n.unsigned_abs()) } else { n.to_string() }
}

fn to_smt(term: &Term) -> String {
    stacker::maybe_grow(crate::STACK_RED_ZONE, crate::STACK_GROW_SIZE, || match term {
        Term::Bool(b) => b.to_string(),
        Term::Int(n) => number(*n),
        Term::Real(r) => {
            let body = format!("(/ {}.0 {}.0)", r.numer().unsigned_abs(), r.denom());
            if r.numer() < 0 { format!("(- {body})") } else { body }
        }
        Term::Var(sym) => smt_symbol(&sym.name),
        Term::Not(t) => format!("(not {})", to_smt(t)),
        Term::Neg(t) => format!("(- {})", to_smt(t)),
        Term::Arith(op, a, b) => {
            let name = match op {
                ArithOp::Add => "+",
                ArithOp::Sub => "-",
                ArithOp::Mul => "*",
                ArithOp::Div if term.sort() == Sort::Int => "div",
                ArithOp::Div => "/",
                ArithOp::Rem => "rem",
            };
            format!("({name} {} {})", to_smt(a), to_smt(b))
        }
        Term::Cmp(op, a, b) => {
            let (a, b) = (to_smt(a), to_smt(b));
            match op {
                CmpOp::Eq => format!("(= {a} {b})"),
                CmpOp::Ne => format!("(not (= {a} {b}))"),
                CmpOp::Lt => format!("(< {a} {b})"),
                CmpOp::Le => format!("(<= {a} {b})"),
                CmpOp::Gt => format!("(> {a} {b})"),
                CmpOp::Ge => format!("(>= {a} {b})"),
            }
        }
        Term::And(ts) => format!("(and {})", ts.iter().map(to_smt).collect::<Vec<_>>().join(" ")),
        Term::Or(ts) => format!("(or {})", ts.iter().map(to_smt).collect::<Vec<_>>().join(" ")),
        Term::Implies(a, b) => format!("(=> {} {})", to_smt(a), to_smt(b)),
        Term::Ite(c, a, b) => format!("(ite {} {} {})", to_smt(c), to_smt(a), to_smt(b)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Location;
    use crate::vcgen::{ObligationKind, VcOrigin};

    fn vc(assumptions: Vec<Term>, goal: Term) -> ScalarVc {
        ScalarVc {
            origin: VcOrigin {
                kind: ObligationKind::Precondition,
                method: "Main.main".into(),
                loc: Location::new(5, 9),
                callee: Some("ArrayList.get".into()),
                declared: "0 <= _ && _ < size(this)".into(),
            },
            assumptions,
            goal,
            abstracted: Default::default(),
        }
    }

    #[test]
    fn test_symbol_quoting() {
        assert_eq!(smt_symbol("x"), "x");
        assert_eq!(smt_symbol("size(list)@b0.2"), "|size(list)@b0.2|");
        assert_eq!(smt_symbol("$t0"), "|$t0|");
        assert_eq!(smt_symbol("0abc"), "|0abc|");
    }

    #[test]
    fn test_negative_literals() {
        assert_eq!(to_smt(&Term::Int(-5)), "(- 5)");
        let half = crate::solver::Rational::new(-1, 2).unwrap();
        assert_eq!(to_smt(&Term::Real(half)), "(- (/ 1.0 2.0))");
    }

    #[test]
    fn test_render_query() {
        let size = Term::var("size", Sort::Int);
        let q = vc(
            vec![Term::cmp(CmpOp::Eq, size.clone(), Term::Int(1))],
            Term::cmp(CmpOp::Lt, Term::Int(1), size),
        );
        insta::assert_snapshot!(render_query(&q, true), @r"
        (set-logic QF_LIA)
        (declare-const size Int)
        (assert (= size 1))
        (assert (>= 1 size))
        (check-sat)
        (get-model)
        ");
    }

    #[test]
    fn test_logic_selection() {
        let x = Term::var("x", Sort::Int);
        let r = Term::var("r", Sort::Real);
        assert_eq!(logic_for(&Term::cmp(CmpOp::Lt, x.clone(), Term::Int(3))), "QF_LIA");
        assert_eq!(logic_for(&Term::cmp(CmpOp::Lt, r.clone(), x.clone())), "QF_LIRA");
        let square = Term::arith(ArithOp::Mul, x.clone(), x);
        assert_eq!(logic_for(&Term::cmp(CmpOp::Gt, square, Term::Int(0))), "QF_NIA");
    }
}
