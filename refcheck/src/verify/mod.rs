//! Verification driver
//!
//! Loads every unit's contracts into one registry, then verifies each method
//! body on a rayon pool. Workers share the registry and the diagnostic sink;
//! everything else they own.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::ast::{CompilationUnit, MethodDecl, MethodKind};
use crate::cfg::build_cfg;
use crate::config::VerifierConfig;
use crate::contract::{load_units, ContractRegistry, KnownTypes};
use crate::diagnostics::{Diagnostic, DiagnosticSink, Report, Stats};
use crate::error::{Error, Result};
use crate::solver::{Outcome, SolverAdapter};
use crate::symbolic::{Event, Tracker};
use crate::vcgen::{render_query, Term, Vc};

/// Cooperative cancellation flag shared with the workers
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> std::result::Result<(), Cancelled> {
        if self.is_cancelled() { Err(Cancelled) } else { Ok(()) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("verification cancelled")]
pub struct Cancelled;

/// Read a compilation unit from a JSON file
pub fn read_unit(path: &Path) -> Result<CompilationUnit> {
    let text = std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;
    CompilationUnit::from_json(&text).map_err(|source| Error::Unit {
        path: path.to_path_buf(),
        source,
    })
}

pub fn read_units(paths: &[PathBuf]) -> Result<Vec<CompilationUnit>> {
    paths.iter().map(|p| read_unit(p)).collect()
}

struct Job<'a> {
    index: usize,
    file: &'a str,
    method: &'a MethodDecl,
}

#[derive(Default)]
struct Counters {
    methods: AtomicUsize,
    skipped: AtomicUsize,
    obligations: AtomicUsize,
    proved: AtomicUsize,
}

pub struct Verifier {
    config: VerifierConfig,
    cancel: CancellationToken,
}

impl Verifier {
    pub fn new(config: VerifierConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn verify_paths(&self, paths: &[PathBuf]) -> Result<Report> {
        self.verify_units(&read_units(paths)?)
    }

    pub fn verify_units(&self, units: &[CompilationUnit]) -> Result<Report> {
        let started = Instant::now();
        info!(units = units.len(), "loading contracts");

        let loaded = load_units(units, &KnownTypes::from_units(units));
        if !loaded.errors.is_empty() {
            warn!(errors = loaded.errors.len(), "some declarations failed to load");
            if self.config.strict_load {
                return Err(Error::StrictLoad { errors: loaded.errors });
            }
        }
        let registry = Arc::new(loaded.registry);

        let sink = DiagnosticSink::new();
        sink.push_batch(0, loaded.errors.iter().map(Diagnostic::from_load_error).collect());

        let counters = Counters::default();
        let jobs: Vec<Job<'_>> = units
            .iter()
            .flat_map(|unit| unit.methods.iter().map(move |m| (unit.file.as_str(), m)))
            .filter(|(_, m)| m.body.is_some())
            .enumerate()
            .map(|(i, (file, method))| Job {
                index: i + 1,
                file,
                method,
            })
            .filter(|job| {
                let member = (job.method.kind != MethodKind::Constructor).then_some(job.method.name.as_str());
                let excluded = registry.is_call_excluded(&job.method.owner, member);
                if excluded {
                    debug!(method = %job.method.qualified_name(), "skipping excluded declaration");
                    counters.skipped.fetch_add(1, Ordering::Relaxed);
                }
                !excluded
            })
            .collect();

        let adapter = SolverAdapter::from_config(&self.config);
        info!(jobs = jobs.len(), backend = adapter.backend_name(), "verifying methods");
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.effective_jobs())
            .build()?;
        pool.install(|| {
            jobs.par_iter().for_each(|job| {
                if self.cancel.is_cancelled() {
                    return;
                }
                if let Some(batch) = self.verify_method(job, &registry, &adapter, &counters) {
                    sink.push_batch(job.index, batch);
                }
            })
        });

        let cancelled = self.cancel.is_cancelled();
        let stats = Stats {
            units: units.len(),
            methods: counters.methods.load(Ordering::Relaxed),
            skipped_methods: counters.skipped.load(Ordering::Relaxed),
            obligations: counters.obligations.load(Ordering::Relaxed),
            proved: counters.proved.load(Ordering::Relaxed),
            ..Stats::default()
        };
        let report = Report::new(sink.into_sorted(), stats, self.config.deny_warnings, cancelled);
        info!(
            success = report.success,
            errors = report.stats.errors,
            warnings = report.stats.warnings,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "verification finished"
        );
        Ok(report)
    }

    /// Diagnostics of one method in program order; `None` if cancelled midway
    fn verify_method(
        &self,
        job: &Job<'_>,
        registry: &ContractRegistry,
        adapter: &SolverAdapter,
        counters: &Counters,
    ) -> Option<Vec<Diagnostic>> {
        let name = job.method.qualified_name();
        let cfg = match build_cfg(job.method) {
            Ok(cfg) => cfg,
            Err(e) => {
                debug!(method = %name, error = %e, "skipping method");
                counters.skipped.fetch_add(1, Ordering::Relaxed);
                return Some(vec![Diagnostic::from_cfg_error(job.file, &name, &e)]);
            }
        };
        debug!(method = %name, blocks = cfg.len(), "verifying");

        let mut events = Vec::new();
        if Tracker::new(registry, job.method, &self.cancel)
            .walk(&cfg, &mut |e| events.push(e))
            .is_err()
        {
            debug!(method = %name, "cancelled, discarding partial results");
            return None;
        }

        let mut batch = Vec::new();
        for event in events {
            match event {
                Event::Obligation { vc, .. } => {
                    counters.obligations.fetch_add(1, Ordering::Relaxed);
                    let outcome = adapter.discharge(&vc);
                    trace!(method = %name, kind = %vc.origin().kind, loc = %vc.origin().loc, ?outcome, "obligation");
                    if outcome == Outcome::Proved {
                        counters.proved.fetch_add(1, Ordering::Relaxed);
                    }
                    if let Some(diag) = Diagnostic::from_outcome(job.file, &vc, &outcome) {
                        batch.push(diag.with_smt(self.smt_for(&vc)));
                    }
                }
                Event::ExcludedCall { callee, loc } => {
                    batch.push(Diagnostic::unchecked_call(job.file, &name, &callee, loc));
                }
            }
        }
        counters.methods.fetch_add(1, Ordering::Relaxed);
        Some(batch)
    }

    fn smt_for(&self, vc: &Vc) -> Option<String> {
        if !self.config.emit_smt {
            return None;
        }
        match vc {
            Vc::Scalar(vc) => Some(render_query(vc, false)),
            Vc::State(vc) if vc.cases.iter().any(|c| c.residual == Term::Bool(false)) => None,
            Vc::State(vc) => vc.residual_vc().map(|r| render_query(&r, false)),
        }
    }
}
