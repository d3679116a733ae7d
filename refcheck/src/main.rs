//! refcheck CLI

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use refcheck::config::{SolverKind, VerifierConfig};
use refcheck::diagnostics::{render_json, render_pretty, render_text};
use refcheck::verify::{read_unit, read_units};
use refcheck::{Error, Verifier};

#[derive(Parser)]
#[command(name = "refcheck", version, about = "Refinement and typestate contract checker")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
    /// Source snippets where the host file can be read
    Pretty,
}

#[derive(Subcommand)]
enum Command {
    /// Verify compilation units
    Verify {
        /// Compilation unit files (JSON)
        #[arg(required = true)]
        units: Vec<PathBuf>,
        /// Configuration file; defaults to ./refcheck.toml if present
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        jobs: Option<usize>,
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[arg(long, value_enum)]
        solver: Option<SolverKind>,
        #[arg(long)]
        z3_path: Option<PathBuf>,
        #[arg(long, value_enum, default_value = "text")]
        format: Format,
        #[arg(long)]
        deny_warnings: bool,
        #[arg(long)]
        strict_load: bool,
        /// Attach SMT-LIB2 queries to scalar diagnostics
        #[arg(long)]
        emit_smt: bool,
    },
    /// Dump the loaded contract registry (debug)
    Contracts {
        #[arg(required = true)]
        units: Vec<PathBuf>,
    },
    /// Dump control-flow graphs (debug)
    Cfg {
        unit: PathBuf,
        /// Only this method (`name` or `Owner.name`)
        #[arg(long)]
        method: Option<String>,
    },
    /// Tokenize a predicate and dump tokens (debug)
    Tokens { predicate: String },
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Command::Verify {
            units,
            config,
            jobs,
            timeout_ms,
            solver,
            z3_path,
            format,
            deny_warnings,
            strict_load,
            emit_smt,
        } => resolve_config(config.as_deref()).and_then(|mut cfg| {
            if let Some(jobs) = jobs {
                cfg = cfg.with_jobs(jobs);
            }
            if let Some(ms) = timeout_ms {
                cfg = cfg.with_timeout_ms(ms);
            }
            if let Some(solver) = solver {
                cfg = cfg.with_solver(solver);
            }
            if let Some(path) = z3_path {
                cfg = cfg.with_z3_path(path);
            }
            let deny_warnings = cfg.deny_warnings || deny_warnings;
            let strict_load = cfg.strict_load || strict_load;
            let emit_smt = cfg.emit_smt || emit_smt;
            cfg = cfg
                .with_deny_warnings(deny_warnings)
                .with_strict_load(strict_load)
                .with_emit_smt(emit_smt);
            verify(&units, cfg, format)
        }),
        Command::Contracts { units } => dump_contracts(&units).map(|()| true),
        Command::Cfg { unit, method } => dump_cfg(&unit, method.as_deref()).map(|()| true),
        Command::Tokens { predicate } => dump_tokens(&predicate).map(|()| true),
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            if let Error::StrictLoad { errors } = &e {
                for err in errors {
                    eprintln!("{}", err.render());
                }
            }
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}

fn resolve_config(path: Option<&Path>) -> refcheck::Result<VerifierConfig> {
    let config = match path {
        Some(path) => VerifierConfig::load(path)?,
        None => VerifierConfig::discover(Path::new("."))?,
    };
    Ok(config)
}

fn verify(units: &[PathBuf], config: VerifierConfig, format: Format) -> refcheck::Result<bool> {
    let report = Verifier::new(config).verify_paths(units)?;
    let rendered = match format {
        Format::Text => render_text(&report),
        Format::Json => render_json(&report)? + "\n",
        Format::Pretty => render_pretty(&report, &|file| std::fs::read_to_string(file).ok()),
    };
    print!("{rendered}");
    Ok(report.success)
}

fn dump_contracts(paths: &[PathBuf]) -> refcheck::Result<()> {
    let units = read_units(paths)?;
    let loaded = refcheck::contract::load_units(&units, &refcheck::contract::KnownTypes::from_units(&units));
    for err in &loaded.errors {
        eprintln!("{}", err.render());
    }
    println!("{}", serde_json::to_string_pretty(&loaded.registry)?);
    Ok(())
}

fn dump_cfg(path: &Path, only: Option<&str>) -> refcheck::Result<()> {
    let unit = read_unit(path)?;
    for method in unit.methods.iter().filter(|m| m.body.is_some()) {
        let qualified = method.qualified_name();
        if only.is_some_and(|name| name != method.name && name != qualified) {
            continue;
        }
        let cfg = refcheck::cfg::build_cfg(method)?;
        println!("{cfg}");
    }
    Ok(())
}

fn dump_tokens(predicate: &str) -> refcheck::Result<()> {
    for (token, span) in refcheck::lexer::tokenize(predicate)? {
        println!("{token:?} @ {span}");
    }
    Ok(())
}
