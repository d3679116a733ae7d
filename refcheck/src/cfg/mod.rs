//! Control-flow graphs of method bodies
//!
//! Lowering flattens every call nested inside an expression into a temporary
//! (`$t0`, `$t1`, ...), so each block exposes its call sites in evaluation
//! order and every remaining expression is call-free. Short-circuit operators
//! and conditionals whose later operands contain calls are lowered to
//! branches, keeping those calls conditional.

use std::fmt::Write;

use serde::Serialize;
use thiserror::Error;

use crate::ast::{write_args, BinOp, Expr, Location, MethodDecl, Stmt, TypeRef};

pub type BlockId = usize;

/// CFG construction error
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CfgError {
    #[error("unsupported construct `{construct}` at {loc}")]
    UnsupportedConstruct { construct: String, loc: Location },
}

impl CfgError {
    fn unsupported(construct: impl Into<String>, loc: Location) -> Self {
        Self::UnsupportedConstruct {
            construct: construct.into(),
            loc,
        }
    }

    pub fn location(&self) -> Location {
        match self {
            Self::UnsupportedConstruct { loc, .. } => *loc,
        }
    }
}

/// Callee of a call site
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallTarget {
    /// `receiver.m(..)`
    Instance {
        receiver: Expr,
        #[serde(skip_serializing_if = "Option::is_none")]
        receiver_type: Option<TypeRef>,
    },
    /// Unqualified call on the enclosing instance
    Implicit,
    /// `Class.m(..)`
    Static { class: String },
    /// `new T(..)`
    Constructor { ty: TypeRef },
}

/// A call with call-free receiver and arguments
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSite {
    pub target: CallTarget,
    pub method: String,
    pub args: Vec<Expr>,
    pub loc: Location,
}

impl std::fmt::Display for CallSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.target {
            CallTarget::Instance { receiver, .. } => write!(f, "{receiver}.{}(", self.method)?,
            CallTarget::Implicit => write!(f, "{}(", self.method)?,
            CallTarget::Static { class } => write!(f, "{class}.{}(", self.method)?,
            CallTarget::Constructor { ty } => write!(f, "new {ty}(")?,
        }
        write_args(f, &self.args)?;
        write!(f, ")")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Instr {
    /// Local declared without initialiser
    Declare {
        name: String,
        ty: TypeRef,
        loc: Location,
    },
    /// `dest = value`; `declared` is set for the initialising assignment
    Assign {
        dest: String,
        value: Expr,
        #[serde(skip_serializing_if = "Option::is_none")]
        declared: Option<TypeRef>,
        loc: Location,
    },
    Call {
        #[serde(skip_serializing_if = "Option::is_none")]
        dest: Option<String>,
        call: CallSite,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Terminator {
    Goto { target: BlockId },
    Branch {
        cond: Expr,
        then_block: BlockId,
        else_block: BlockId,
    },
    /// Explicit `return`, or the fall-through exit of the method
    Return {
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<Expr>,
        loc: Location,
    },
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Goto { target } => vec![*target],
            Terminator::Branch {
                then_block,
                else_block,
                ..
            } => vec![*then_block, *else_block],
            Terminator::Return { .. } => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BasicBlock {
    pub id: BlockId,
    pub instrs: Vec<Instr>,
    pub terminator: Terminator,
}

impl BasicBlock {
    /// Call sites of this block in evaluation order
    pub fn call_sites(&self) -> impl Iterator<Item = &CallSite> {
        self.instrs.iter().filter_map(|i| match i {
            Instr::Call { call, .. } => Some(call),
            _ => None,
        })
    }
}

/// Control-flow graph of one method body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlFlowGraph {
    pub method: String,
    pub blocks: Vec<BasicBlock>,
    #[serde(skip)]
    preds: Vec<Vec<BlockId>>,
}

impl ControlFlowGraph {
    pub const ENTRY: BlockId = 0;

    fn new(method: String, blocks: Vec<BasicBlock>) -> Self {
        let mut preds = vec![Vec::new(); blocks.len()];
        for block in &blocks {
            for succ in block.terminator.successors() {
                if !preds[succ].contains(&block.id) {
                    preds[succ].push(block.id);
                }
            }
        }
        Self {
            method,
            blocks,
            preds,
        }
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id]
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn predecessors(&self, id: BlockId) -> &[BlockId] {
        &self.preds[id]
    }

    pub fn successors(&self, id: BlockId) -> Vec<BlockId> {
        self.blocks[id].terminator.successors()
    }

    /// Reachable blocks in reverse postorder, then-branches before else-branches
    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        let mut visited = vec![false; self.blocks.len()];
        let mut postorder = Vec::with_capacity(self.blocks.len());
        // Iterative DFS; the last successor is explored first, so the first one comes earliest in RPO
        let mut stack: Vec<(BlockId, bool)> = vec![(Self::ENTRY, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                postorder.push(id);
                continue;
            }
            if visited[id] {
                continue;
            }
            visited[id] = true;
            stack.push((id, true));
            for succ in self.successors(id) {
                if !visited[succ] {
                    stack.push((succ, false));
                }
            }
        }
        postorder.reverse();
        postorder
    }

    /// Number of back edges (edges into a block that does not come later in RPO)
    pub fn back_edges(&self) -> usize {
        let order = self.reverse_postorder();
        let mut position = vec![usize::MAX; self.blocks.len()];
        for (i, id) in order.iter().enumerate() {
            position[*id] = i;
        }
        order
            .iter()
            .flat_map(|id| self.successors(*id).into_iter().map(move |s| (*id, s)))
            .filter(|(from, to)| position[*to] <= position[*from])
            .count()
    }
}

impl std::fmt::Display for ControlFlowGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "cfg {} {{", self.method)?;
        for block in &self.blocks {
            let preds: Vec<String> = self.preds[block.id].iter().map(|p| format!("bb{p}")).collect();
            if preds.is_empty() {
                writeln!(f, "bb{}:", block.id)?;
            } else {
                writeln!(f, "bb{}:  ; preds {}", block.id, preds.join(", "))?;
            }
            for instr in &block.instrs {
                writeln!(f, "  {}", format_instr(instr))?;
            }
            let term = match &block.terminator {
                Terminator::Goto { target } => format!("goto bb{target}"),
                Terminator::Branch {
                    cond,
                    then_block,
                    else_block,
                } => format!("if {cond} then bb{then_block} else bb{else_block}"),
                Terminator::Return { value: Some(v), .. } => format!("return {v}"),
                Terminator::Return { value: None, .. } => "return".to_string(),
            };
            writeln!(f, "  {term}")?;
        }
        write!(f, "}}")
    }
}

fn format_instr(instr: &Instr) -> String {
    let mut out = String::new();
    let _ = match instr {
        Instr::Declare { name, ty, .. } => write!(out, "let {name}: {ty}"),
        Instr::Assign {
            dest,
            value,
            declared: Some(ty),
            ..
        } => write!(out, "let {dest}: {ty} = {value}"),
        Instr::Assign { dest, value, .. } => write!(out, "{dest} = {value}"),
        Instr::Call {
            dest: Some(dest),
            call,
        } => write!(out, "{dest} = call {call}  @{}", call.loc),
        Instr::Call { dest: None, call } => write!(out, "call {call}  @{}", call.loc),
    };
    out
}

/// Build the CFG of a method; methods without a body get a single exit block
pub fn build_cfg(method: &MethodDecl) -> Result<ControlFlowGraph, CfgError> {
    let mut ctx = LoweringContext::new();
    if let Some(body) = &method.body {
        ctx.lower_block(body)?;
    }
    ctx.finish_block(Terminator::Return {
        value: None,
        loc: method.loc,
    });
    Ok(ControlFlowGraph::new(method.qualified_name(), ctx.into_blocks()))
}

struct PartialBlock {
    instrs: Vec<Instr>,
    terminator: Option<Terminator>,
}

struct LoweringContext {
    blocks: Vec<PartialBlock>,
    current: BlockId,
    temp_counter: usize,
    /// (continue target, break target) of each enclosing loop
    loop_context_stack: Vec<(BlockId, BlockId)>,
}

impl LoweringContext {
    fn new() -> Self {
        Self {
            blocks: vec![PartialBlock {
                instrs: Vec::new(),
                terminator: None,
            }],
            current: ControlFlowGraph::ENTRY,
            temp_counter: 0,
            loop_context_stack: Vec::new(),
        }
    }

    fn fresh_temp(&mut self) -> String {
        let name = format!("$t{}", self.temp_counter);
        self.temp_counter += 1;
        name
    }

    fn fresh_block(&mut self) -> BlockId {
        self.blocks.push(PartialBlock {
            instrs: Vec::new(),
            terminator: None,
        });
        self.blocks.len() - 1
    }

    fn push_inst(&mut self, instr: Instr) {
        self.blocks[self.current].instrs.push(instr);
    }

    /// Terminate the current block; code after a jump lands in an unreachable block
    fn finish_block(&mut self, terminator: Terminator) {
        let block = &mut self.blocks[self.current];
        if block.terminator.is_none() {
            block.terminator = Some(terminator);
        }
    }

    fn start_block(&mut self, id: BlockId) {
        self.current = id;
    }

    fn diverge(&mut self, terminator: Terminator) {
        self.finish_block(terminator);
        let dead = self.fresh_block();
        self.start_block(dead);
    }

    fn into_blocks(self) -> Vec<BasicBlock> {
        self.blocks
            .into_iter()
            .enumerate()
            .map(|(id, b)| BasicBlock {
                id,
                instrs: b.instrs,
                // Every block is finished before this point; a missing terminator is a dead tail
                terminator: b.terminator.unwrap_or(Terminator::Return {
                    value: None,
                    loc: Location::default(),
                }),
            })
            .collect()
    }

    fn lower_block(&mut self, stmts: &[Stmt]) -> Result<(), CfgError> {
        for stmt in stmts {
            self.lower_stmt(stmt)?;
        }
        Ok(())
    }

    fn lower_stmt(&mut self, stmt: &Stmt) -> Result<(), CfgError> {
        match stmt {
            Stmt::Let {
                name, ty, init, loc, ..
            } => match init {
                Some(init) => {
                    let value = self.lower_expr(init)?;
                    self.push_inst(Instr::Assign {
                        dest: name.clone(),
                        value,
                        declared: Some(ty.clone()),
                        loc: *loc,
                    });
                }
                None => self.push_inst(Instr::Declare {
                    name: name.clone(),
                    ty: ty.clone(),
                    loc: *loc,
                }),
            },

            Stmt::Assign { target, value, loc } => {
                let value = self.lower_expr(value)?;
                self.push_inst(Instr::Assign {
                    dest: target.clone(),
                    value,
                    declared: None,
                    loc: *loc,
                });
            }

            Stmt::Expr { expr, .. } => match expr {
                Expr::Call { .. } | Expr::New { .. } => {
                    let call = self.lower_call(expr)?;
                    self.push_inst(Instr::Call { dest: None, call });
                }
                other => {
                    self.lower_expr(other)?;
                }
            },

            Stmt::If {
                cond,
                then_branch,
                else_branch,
                ..
            } => {
                let cond = self.lower_expr(cond)?;
                let then_block = self.fresh_block();
                let else_block = self.fresh_block();
                let join = self.fresh_block();
                self.finish_block(Terminator::Branch {
                    cond,
                    then_block,
                    else_block,
                });

                self.start_block(then_block);
                self.lower_block(then_branch)?;
                self.finish_block(Terminator::Goto { target: join });

                self.start_block(else_block);
                self.lower_block(else_branch)?;
                self.finish_block(Terminator::Goto { target: join });

                self.start_block(join);
            }

            Stmt::While { cond, body, .. } => {
                let header = self.fresh_block();
                let body_block = self.fresh_block();
                let exit = self.fresh_block();
                self.finish_block(Terminator::Goto { target: header });

                // The condition is re-evaluated in the header on every iteration
                self.start_block(header);
                let cond = self.lower_expr(cond)?;
                self.finish_block(Terminator::Branch {
                    cond,
                    then_block: body_block,
                    else_block: exit,
                });

                self.loop_context_stack.push((header, exit));
                self.start_block(body_block);
                let lowered = self.lower_block(body);
                self.loop_context_stack.pop();
                lowered?;
                self.finish_block(Terminator::Goto { target: header });

                self.start_block(exit);
            }

            Stmt::Break { loc } => match self.loop_context_stack.last() {
                Some(&(_, exit)) => self.diverge(Terminator::Goto { target: exit }),
                None => return Err(CfgError::unsupported("break outside a loop", *loc)),
            },

            Stmt::Continue { loc } => match self.loop_context_stack.last() {
                Some(&(header, _)) => self.diverge(Terminator::Goto { target: header }),
                None => return Err(CfgError::unsupported("continue outside a loop", *loc)),
            },

            Stmt::Return { value, loc } => {
                let value = value.as_ref().map(|v| self.lower_expr(v)).transpose()?;
                self.diverge(Terminator::Return { value, loc: *loc });
            }

            Stmt::Unsupported { construct, loc } => {
                return Err(CfgError::unsupported(construct.clone(), *loc));
            }
        }
        Ok(())
    }

    /// Lower an expression to a call-free one, emitting its calls first
    fn lower_expr(&mut self, expr: &Expr) -> Result<Expr, CfgError> {
        stacker::maybe_grow(crate::STACK_RED_ZONE, crate::STACK_GROW_SIZE, || self.lower_expr_inner(expr))
    }

    fn lower_expr_inner(&mut self, expr: &Expr) -> Result<Expr, CfgError> {
        match expr {
            Expr::Int { .. }
            | Expr::Real { .. }
            | Expr::Bool { .. }
            | Expr::Str { .. }
            | Expr::Null
            | Expr::Var { .. }
            | Expr::Field { .. }
            | Expr::Opaque { .. } => Ok(expr.clone()),

            Expr::Unary { op, operand } => Ok(Expr::Unary {
                op: *op,
                operand: Box::new(self.lower_expr(operand)?),
            }),

            Expr::Binary { op, lhs, rhs } if matches!(op, BinOp::And | BinOp::Or) && has_call(rhs) => {
                self.lower_short_circuit(*op, lhs, rhs)
            }

            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.lower_expr(lhs)?;
                let rhs = self.lower_expr(rhs)?;
                Ok(Expr::binary(*op, lhs, rhs))
            }

            Expr::Cond {
                cond,
                then_expr,
                else_expr,
            } if has_call(then_expr) || has_call(else_expr) => {
                let cond = self.lower_expr(cond)?;
                let temp = self.fresh_temp();
                self.lower_choice(cond, &temp, then_expr, else_expr)?;
                Ok(Expr::var(temp))
            }

            Expr::Cond {
                cond,
                then_expr,
                else_expr,
            } => Ok(Expr::Cond {
                cond: Box::new(self.lower_expr(cond)?),
                then_expr: Box::new(self.lower_expr(then_expr)?),
                else_expr: Box::new(self.lower_expr(else_expr)?),
            }),

            Expr::Call { .. } | Expr::New { .. } => {
                let call = self.lower_call(expr)?;
                let temp = self.fresh_temp();
                self.push_inst(Instr::Call {
                    dest: Some(temp.clone()),
                    call,
                });
                Ok(Expr::var(temp))
            }
        }
    }

    /// `a && b` as `t = a; if t { t = b }`, `a || b` as `t = a; if !t { t = b }`
    fn lower_short_circuit(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Result<Expr, CfgError> {
        let lhs = self.lower_expr(lhs)?;
        let temp = self.fresh_temp();
        self.push_inst(Instr::Assign {
            dest: temp.clone(),
            value: lhs,
            declared: None,
            loc: Location::default(),
        });
        let eval_rhs = self.fresh_block();
        let join = self.fresh_block();
        let (then_block, else_block) = match op {
            BinOp::And => (eval_rhs, join),
            _ => (join, eval_rhs),
        };
        self.finish_block(Terminator::Branch {
            cond: Expr::var(&temp),
            then_block,
            else_block,
        });
        self.start_block(eval_rhs);
        let rhs = self.lower_expr(rhs)?;
        self.push_inst(Instr::Assign {
            dest: temp.clone(),
            value: rhs,
            declared: None,
            loc: Location::default(),
        });
        self.finish_block(Terminator::Goto { target: join });
        self.start_block(join);
        Ok(Expr::var(temp))
    }

    fn lower_choice(&mut self, cond: Expr, temp: &str, then_expr: &Expr, else_expr: &Expr) -> Result<(), CfgError> {
        let then_block = self.fresh_block();
        let else_block = self.fresh_block();
        let join = self.fresh_block();
        self.finish_block(Terminator::Branch {
            cond,
            then_block,
            else_block,
        });
        for (block, branch) in [(then_block, then_expr), (else_block, else_expr)] {
            self.start_block(block);
            let value = self.lower_expr(branch)?;
            self.push_inst(Instr::Assign {
                dest: temp.to_string(),
                value,
                declared: None,
                loc: Location::default(),
            });
            self.finish_block(Terminator::Goto { target: join });
        }
        self.start_block(join);
        Ok(())
    }

    fn lower_call(&mut self, expr: &Expr) -> Result<CallSite, CfgError> {
        match expr {
            Expr::Call {
                receiver,
                class,
                method,
                args,
                receiver_type,
                loc,
            } => {
                let target = match (receiver, class) {
                    (Some(receiver), _) => CallTarget::Instance {
                        receiver: self.lower_expr(receiver)?,
                        receiver_type: receiver_type.clone(),
                    },
                    (None, Some(class)) => CallTarget::Static {
                        class: class.clone(),
                    },
                    (None, None) => CallTarget::Implicit,
                };
                let args = self.lower_args(args)?;
                Ok(CallSite {
                    target,
                    method: method.clone(),
                    args,
                    loc: *loc,
                })
            }
            Expr::New { ty, args, loc } => {
                let args = self.lower_args(args)?;
                Ok(CallSite {
                    target: CallTarget::Constructor { ty: ty.clone() },
                    method: "<init>".to_string(),
                    args,
                    loc: *loc,
                })
            }
            other => Err(CfgError::unsupported(
                format!("`{other}` is not a call"),
                Location::default(),
            )),
        }
    }

    fn lower_args(&mut self, args: &[Expr]) -> Result<Vec<Expr>, CfgError> {
        args.iter().map(|a| self.lower_expr(a)).collect()
    }
}

fn has_call(expr: &Expr) -> bool {
    match expr {
        Expr::Call { .. } | Expr::New { .. } => true,
        Expr::Unary { operand, .. } => has_call(operand),
        Expr::Binary { lhs, rhs, .. } => has_call(lhs) || has_call(rhs),
        Expr::Cond {
            cond,
            then_expr,
            else_expr,
        } => has_call(cond) || has_call(then_expr) || has_call(else_expr),
        _ => false,
    }
}
