//! Verifier configuration
//!
//! Defaults, overridden by a `refcheck.toml` file, overridden in turn by
//! command-line flags. Every key is optional in the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the configuration file looked up next to the inputs
pub const CONFIG_FILE: &str = "refcheck.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Scalar decision procedure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SolverKind {
    /// Built-in Fourier–Motzkin procedure
    #[default]
    Builtin,
    /// External `z3` process
    Z3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerifierConfig {
    /// Worker threads; 0 uses the available parallelism
    pub jobs: usize,
    /// Per-obligation budget in milliseconds; 0 disables the timeout
    pub timeout_ms: u64,
    pub solver: SolverKind,
    pub z3_path: PathBuf,
    /// Abort before verification if any declaration failed to load
    pub strict_load: bool,
    /// Treat warnings as failures
    pub deny_warnings: bool,
    pub max_dnf_clauses: usize,
    pub max_constraints: usize,
    /// Attach the SMT-LIB2 query to scalar diagnostics
    pub emit_smt: bool,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            jobs: 0,
            timeout_ms: 2000,
            solver: SolverKind::Builtin,
            z3_path: PathBuf::from("z3"),
            strict_load: false,
            deny_warnings: false,
            max_dnf_clauses: 256,
            max_constraints: 512,
            emit_smt: false,
        }
    }
}

impl VerifierConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml_str(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text, path)
    }

    /// `refcheck.toml` in `dir`, or the defaults if there is none
    pub fn discover(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE);
        if path.is_file() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_dnf_clauses == 0 {
            return Err(ConfigError::Invalid("max_dnf_clauses must be positive".into()));
        }
        if self.max_constraints == 0 {
            return Err(ConfigError::Invalid("max_constraints must be positive".into()));
        }
        if self.solver == SolverKind::Z3 && self.z3_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("z3_path must not be empty".into()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    pub fn effective_jobs(&self) -> usize {
        if self.jobs > 0 {
            self.jobs
        } else {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        }
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_solver(mut self, solver: SolverKind) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_z3_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.z3_path = path.into();
        self
    }

    pub fn with_strict_load(mut self, strict: bool) -> Self {
        self.strict_load = strict;
        self
    }

    pub fn with_deny_warnings(mut self, deny: bool) -> Self {
        self.deny_warnings = deny;
        self
    }

    pub fn with_emit_smt(mut self, emit: bool) -> Self {
        self.emit_smt = emit;
        self
    }
}
