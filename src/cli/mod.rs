//! CLI subcommands — init, validate, compile, deploy.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Subcommand;
use tokio_util::sync::CancellationToken;

use crate::core::executor::{Executor, ExecutorOptions};
use crate::core::types::{Plan, Topology};
use crate::core::{compiler, parser};
use crate::sql::postgres::PgSession;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new replicar project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate replicar.yaml without connecting to instances
    Validate {
        /// Path to replicar.yaml
        #[arg(short, long, default_value = "replicar.yaml")]
        file: PathBuf,
    },

    /// Compile the manifest and print the plan
    Compile {
        /// Path to replicar.yaml
        #[arg(short, long, default_value = "replicar.yaml")]
        file: PathBuf,

        /// Targets to show (default: all)
        targets: Vec<String>,

        /// Argument overrides, name=value (value defaults to empty)
        #[arg(short = 'a', long = "arg", value_name = "NAME=VALUE")]
        args: Vec<String>,
    },

    /// Compile and execute targets against live instances
    Deploy {
        /// Path to replicar.yaml
        #[arg(short, long, default_value = "replicar.yaml")]
        file: PathBuf,

        /// Targets to deploy (default: all, in plan order)
        targets: Vec<String>,

        /// Argument overrides, name=value (value defaults to empty)
        #[arg(short = 'a', long = "arg", value_name = "NAME=VALUE")]
        args: Vec<String>,

        /// Deployment event log directory
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Lock acquisition timeout in seconds
        #[arg(long, default_value_t = 30)]
        lock_timeout: u64,
    },
}

/// Install the tracing subscriber for the process.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("replicar=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Compile {
            file,
            targets,
            args,
        } => cmd_compile(&file, &targets, &parse_args(&args)),
        Commands::Deploy {
            file,
            targets,
            args,
            log_dir,
            lock_timeout,
        } => cmd_deploy(
            &file,
            &targets,
            &parse_args(&args),
            log_dir,
            Duration::from_secs(lock_timeout),
        ),
    }
}

/// Parse `name=value` pairs; a bare `name` maps to the empty string.
pub fn parse_args(pairs: &[String]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((name, value)) => (name.to_string(), value.to_string()),
            None => (pair.clone(), String::new()),
        })
        .collect()
}

fn cmd_init(path: &Path) -> Result<(), String> {
    let manifest_path = path.join("replicar.yaml");
    if manifest_path.exists() {
        return Err(format!("{} already exists", manifest_path.display()));
    }

    let template = r#"version: "1.0"
name: my-topology
description: "Managed by replicar"

args: {}

instances: {}

targets: {}
"#;
    std::fs::write(&manifest_path, template)
        .map_err(|e| format!("cannot write {}: {}", manifest_path.display(), e))?;

    println!("Initialized replicar project at {}", path.display());
    println!("  Created: {}", manifest_path.display());
    Ok(())
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let topology = parser::parse_manifest_file(file).map_err(|e| e.to_string())?;
    let errors = parser::validate_topology(&topology);

    if errors.is_empty() {
        println!(
            "OK: {} ({} instances, {} targets)",
            topology.name,
            topology.instances.len(),
            topology.targets.len()
        );
        Ok(())
    } else {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        Err(format!("{} validation error(s)", errors.len()))
    }
}

fn cmd_compile(
    file: &Path,
    targets: &[String],
    overrides: &HashMap<String, String>,
) -> Result<(), String> {
    let (topology, base_path) = load_and_validate(file)?;
    let plan =
        compiler::compile(&topology, overrides, &base_path).map_err(|e| e.to_string())?;

    print_plan(&plan, targets);
    Ok(())
}

fn cmd_deploy(
    file: &Path,
    targets: &[String],
    overrides: &HashMap<String, String>,
    log_dir: Option<PathBuf>,
    lock_timeout: Duration,
) -> Result<(), String> {
    let (topology, base_path) = load_and_validate(file)?;
    let plan =
        compiler::compile(&topology, overrides, &base_path).map_err(|e| e.to_string())?;

    let runtime =
        tokio::runtime::Runtime::new().map_err(|e| format!("cannot start runtime: {}", e))?;
    runtime.block_on(async {
        let session = Arc::new(PgSession::new());
        let options = ExecutorOptions {
            lock_timeout,
            log_dir,
        };
        let executor = Executor::new(plan, session, options);

        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received; canceling deployment");
                    cancel.cancel();
                }
            });
        }

        let summary = executor
            .deploy(targets, &cancel)
            .await
            .map_err(|e| e.to_string())?;

        for outcome in &summary.outcomes {
            println!(
                "{}: {} action(s) in {:.1}s",
                outcome.target,
                outcome.actions_executed,
                outcome.duration.as_secs_f64()
            );
        }
        println!();
        println!(
            "Deploy complete: {} target(s) in {:.1}s.",
            summary.outcomes.len(),
            summary.duration.as_secs_f64()
        );
        Ok(())
    })
}

/// Parse and validate a manifest, returning it with its base path.
fn load_and_validate(file: &Path) -> Result<(Topology, PathBuf), String> {
    let topology = parser::parse_manifest_file(file).map_err(|e| e.to_string())?;
    let errors = parser::validate_topology(&topology);
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        return Err("validation failed".to_string());
    }

    let base_path = file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();
    Ok((topology, base_path))
}

/// Display a plan to stdout.
fn print_plan(plan: &Plan, filter: &[String]) {
    println!("Topology: {} ({} targets)", plan.name, plan.targets.len());
    println!();

    let mut shown_targets = 0usize;
    let mut shown_actions = 0usize;
    for (name, target) in &plan.targets {
        if !filter.is_empty() && !filter.contains(name) {
            continue;
        }
        shown_targets += 1;
        println!("{} @ {}:", name, target.instance);
        if !target.depends_on.is_empty() {
            println!("  depends on: {}", target.depends_on.join(", "));
        }
        for action in &target.actions {
            shown_actions += 1;
            println!("  + {}", action.describe());
        }
        println!();
    }

    println!(
        "Plan: {} target(s), {} action(s).",
        shown_targets, shown_actions
    );
}
