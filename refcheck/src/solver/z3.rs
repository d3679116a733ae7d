//! External Z3 backend
//!
//! The negated query is rendered as SMT-LIB2 and piped to `z3 -in`. The
//! first line of the answer is `sat`, `unsat` or `unknown`; a `sat` answer is
//! followed by the model, whose nullary `define-fun` entries become the
//! witness.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::debug;

use super::{Outcome, Rational, ScalarBackend, SolverError, UnknownReason, Witness};
use crate::vcgen::{render_query, ScalarVc};

#[derive(Debug, Clone)]
pub struct Z3Process {
    path: PathBuf,
    timeout: Option<Duration>,
}

impl Z3Process {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: Some(Duration::from_millis(2000)),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Version string reported by the binary, if it can be started
    pub fn probe(&self) -> Option<String> {
        let output = Command::new(&self.path).arg("-version").output().ok()?;
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn run(&self, script: &str) -> Result<(String, String), SolverError> {
        let mut args = vec!["-in".to_string(), "-smt2".to_string()];
        if let Some(timeout) = self.timeout {
            args.push(format!("-t:{}", timeout.as_millis()));
        }
        let mut child = Command::new(&self.path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SolverError::Spawn {
                path: self.path.clone(),
                source,
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        Ok((
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }
}

impl ScalarBackend for Z3Process {
    fn name(&self) -> &'static str {
        "z3"
    }

    fn check(&self, vc: &ScalarVc) -> Result<Outcome, SolverError> {
        let script = render_query(vc, true);
        let (stdout, stderr) = self.run(&script)?;
        debug!(solver = %self.path.display(), answer = stdout.lines().next().unwrap_or(""), "z3 finished");
        parse_answer(&stdout, &stderr)
    }
}

fn parse_answer(stdout: &str, stderr: &str) -> Result<Outcome, SolverError> {
    if stderr.contains("timeout") || stdout.trim() == "timeout" {
        return Ok(Outcome::Unknown(UnknownReason::Solver("timeout".to_string())));
    }
    let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    let first = lines.next().unwrap_or("");
    match first {
        "unsat" => Ok(Outcome::Proved),
        "sat" => {
            let rest: Vec<&str> = lines.collect();
            Ok(Outcome::Disproved(parse_model(&rest.join("\n"))?))
        }
        "unknown" => {
            let reason = stdout
                .lines()
                .map(str::trim)
                .skip_while(|l| *l != "unknown")
                .nth(1)
                .filter(|l| !l.starts_with("(error"))
                .map(|l| l.trim_matches(|c| c == '(' || c == ')').to_string())
                .unwrap_or_else(|| "z3 returned unknown".to_string());
            Ok(Outcome::Unknown(UnknownReason::Solver(reason)))
        }
        "" => Err(SolverError::Parse(format!("empty output; stderr: {}", stderr.trim()))),
        other => Err(SolverError::Parse(other.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Sexp {
    Atom(String),
    List(Vec<Sexp>),
}

fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '(' | ')' => tokens.push(c.to_string()),
            '|' => {
                let quoted: String = chars.by_ref().take_while(|c| *c != '|').collect();
                tokens.push(quoted);
            }
            c if c.is_whitespace() => {}
            c => {
                let mut atom = c.to_string();
                while let Some(&next) = chars.peek() {
                    if next.is_whitespace() || next == '(' || next == ')' {
                        break;
                    }
                    atom.push(next);
                    chars.next();
                }
                tokens.push(atom);
            }
        }
    }
    tokens
}

fn parse_sexps(tokens: &[String]) -> Result<Vec<Sexp>, SolverError> {
    let mut stack: Vec<Vec<Sexp>> = vec![Vec::new()];
    for token in tokens {
        match token.as_str() {
            "(" => stack.push(Vec::new()),
            ")" => {
                let done = stack.pop().ok_or_else(|| SolverError::Parse("unbalanced model".into()))?;
                stack
                    .last_mut()
                    .ok_or_else(|| SolverError::Parse("unbalanced model".into()))?
                    .push(Sexp::List(done));
            }
            atom => {
                if let Some(top) = stack.last_mut() {
                    top.push(Sexp::Atom(atom.to_string()));
                }
            }
        }
    }
    match stack.pop() {
        Some(top) if stack.is_empty() => Ok(top),
        _ => Err(SolverError::Parse("unbalanced model".into())),
    }
}

/// Nullary `define-fun` entries of a model, in either `(model ...)` or bare form
fn parse_model(text: &str) -> Result<Witness, SolverError> {
    let mut witness = Witness::new();
    let mut pending = parse_sexps(&tokenize(text))?;
    while let Some(sexp) = pending.pop() {
        let Sexp::List(items) = sexp else {
            continue;
        };
        match items.as_slice() {
            [Sexp::Atom(kw), Sexp::Atom(name), Sexp::List(params), _sort, value]
                if kw == "define-fun" && params.is_empty() =>
            {
                if let Some(value) = render_value(value) {
                    witness.insert(name.clone(), value);
                }
            }
            _ => pending.extend(items),
        }
    }
    Ok(witness)
}

fn render_value(value: &Sexp) -> Option<String> {
    match value {
        Sexp::Atom(atom) => match atom.as_str() {
            "true" | "false" => Some(atom.clone()),
            _ => Rational::parse_decimal(atom).map(|r| r.to_string()),
        },
        Sexp::List(items) => match items.as_slice() {
            [Sexp::Atom(op), inner] if op == "-" => {
                let inner = render_value(inner)?;
                Some(match inner.strip_prefix('-') {
                    Some(positive) => positive.to_string(),
                    None => format!("-{inner}"),
                })
            }
            [Sexp::Atom(op), num, den] if op == "/" => {
                let num = Rational::parse_decimal(&render_value(num)?)?;
                let den = Rational::parse_decimal(&render_value(den)?)?;
                num.checked_div(den).map(|r| r.to_string())
            }
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsat_is_proved() {
        assert_eq!(parse_answer("unsat\n", "").unwrap(), Outcome::Proved);
    }

    #[test]
    fn test_sat_model_values() {
        let out = "sat\n(\n  (define-fun |size(list)@b0.2| () Int\n    1)\n  (define-fun x () Int\n    (- 5))\n  (define-fun r () Real\n    (/ 1.0 2.0))\n  (define-fun b () Bool\n    true)\n)\n";
        let Outcome::Disproved(witness) = parse_answer(out, "").unwrap() else {
            panic!("expected a model");
        };
        assert_eq!(witness["size(list)@b0.2"], "1");
        assert_eq!(witness["x"], "-5");
        assert_eq!(witness["r"], "1/2");
        assert_eq!(witness["b"], "true");
    }

    #[test]
    fn test_legacy_model_form() {
        let out = "sat\n(model\n  (define-fun n () Int 3)\n)\n";
        let Outcome::Disproved(witness) = parse_answer(out, "").unwrap() else {
            panic!("expected a model");
        };
        assert_eq!(witness["n"], "3");
    }

    #[test]
    fn test_timeout_and_unknown() {
        assert_eq!(
            parse_answer("timeout\n", "").unwrap(),
            Outcome::Unknown(UnknownReason::Solver("timeout".into()))
        );
        assert_eq!(
            parse_answer("unknown\n(incomplete quantifiers)\n", "").unwrap(),
            Outcome::Unknown(UnknownReason::Solver("incomplete quantifiers".into()))
        );
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(matches!(parse_answer("segfault", ""), Err(SolverError::Parse(_))));
        assert!(matches!(parse_answer("", "boom"), Err(SolverError::Parse(_))));
    }

    #[test]
    fn test_missing_binary_fails_to_spawn() {
        let z3 = Z3Process::new("/nonexistent/z3-binary");
        assert!(z3.probe().is_none());
        assert!(matches!(z3.run("(check-sat)"), Err(SolverError::Spawn { .. })));
    }
}
