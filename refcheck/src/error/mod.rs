//! Top-level errors
//!
//! Violations found by the analysis are diagnostics, not errors; this type
//! covers what stops a run from producing a report at all.

use std::path::PathBuf;

use thiserror::Error;

use crate::cfg::CfgError;
use crate::config::ConfigError;
use crate::contract::LoadError;
use crate::solver::SolverError;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid compilation unit {}: {source}", path.display())]
    Unit {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cfg(#[from] CfgError),

    /// A predicate given on the command line failed to parse
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Solver(#[from] SolverError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("failed to start worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    /// Loading failed and `strict_load` is set
    #[error("{} contract declaration(s) failed to load", errors.len())]
    StrictLoad { errors: Vec<LoadError> },
}
