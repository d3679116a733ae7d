//! refcheck: static checking of refinement, typestate and ghost-variable
//! contracts.
//!
//! The front end hands over parsed compilation units; the contracts are
//! loaded into a registry, each method body is lowered to a CFG, walked
//! symbolically, and every obligation is discharged by a solver backend.

pub mod ast;
pub mod cfg;
pub mod config;
pub mod contract;
pub mod diagnostics;
pub mod error;
pub mod lexer;
pub mod predicate;
pub mod solver;
pub mod symbolic;
pub mod vcgen;
pub mod verify;

pub use ast::{CompilationUnit, Location, Span};
pub use config::VerifierConfig;
pub use diagnostics::{Diagnostic, DiagnosticKind, Report, Severity};
pub use error::{Error, Result};
pub use verify::{CancellationToken, Verifier};

/// Stack growth for the recursive walks over predicates, terms and bodies
pub(crate) const STACK_RED_ZONE: usize = 32 * 1024;
pub(crate) const STACK_GROW_SIZE: usize = 1024 * 1024;
