//! Pipewright CLI Entry Point
//!
//! Runs a resolved plan with the built-in steps and reports the outcome.
//!
//! # Usage
//!
//! ```bash
//! # Run a plan
//! pipewright plan.yaml
//!
//! # With an engine config file
//! pipewright plan.yaml --config engine.yaml
//!
//! # Override workers and snapshot directory
//! pipewright plan.yaml --workers 8 --state-dir /var/lib/pipewright
//! ```

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use colored::Colorize;
use log::{error, info};

use pipewright::execution::{EngineBuilder, NodeExecution, Status};
use pipewright::waiter::spawn_executor;
use pipewright::config::DEFAULT_STATE_DIR;
use pipewright::{load_plan, EngineConfig, APP_NAME, VERSION};

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Cli {
    plan_path: Option<String>,
    config_path: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    no_state: bool,
    workers: Option<usize>,
    setup: HashMap<String, String>,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Resumable Pipeline Orchestration Engine");
    println!();
}

fn print_usage() {
    println!("Usage: pipewright [OPTIONS] <PLAN_FILE>");
    println!();
    println!("Arguments:");
    println!("  <PLAN_FILE>          Path to a resolved plan YAML file");
    println!();
    println!("Options:");
    println!("  --config FILE        Engine configuration YAML");
    println!("  --state-dir DIR      Directory for execution snapshots (default .pipewright)");
    println!("  --no-state           Do not write execution snapshots");
    println!("  --workers N          Concurrent engine jobs (default: CPU count)");
    println!("  --set KEY=VALUE      Setup abstraction passed to the plan (repeatable)");
    println!("  --verbose            Enable debug logging");
    println!("  --help               Show this help message");
    println!("  --version            Show version information");
    println!();
    println!("Examples:");
    println!("  pipewright release.yaml");
    println!("  pipewright release.yaml --set accountId=acme --workers 8");
}

fn parse_arguments(args: &[String]) -> Result<Cli, String> {
    let mut cli = Cli::default();
    let mut i = 1;

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => cli.verbose = true,
            "--no-state" => cli.no_state = true,
            "--config" => {
                cli.config_path = Some(PathBuf::from(value_for(args, &mut i, "--config")?));
            }
            "--state-dir" => {
                cli.state_dir = Some(PathBuf::from(value_for(args, &mut i, "--state-dir")?));
            }
            "--workers" => {
                let value = value_for(args, &mut i, "--workers")?;
                cli.workers = Some(
                    value
                        .parse()
                        .map_err(|_| format!("Invalid workers value: {}", value))?,
                );
            }
            "--set" => {
                let value = value_for(args, &mut i, "--set")?;
                let (key, val) = value
                    .split_once('=')
                    .ok_or_else(|| format!("--set expects KEY=VALUE, got '{}'", value))?;
                cli.setup.insert(key.to_string(), val.to_string());
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if cli.plan_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                cli.plan_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    Ok(cli)
}

fn value_for<'a>(args: &'a [String], i: &mut usize, option: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires a value", option))
}

fn engine_config(cli: &Cli) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(dir) = &cli.state_dir {
        config.state_dir = Some(dir.clone());
    }
    if cli.no_state {
        config.state_dir = None;
    } else if config.state_dir.is_none() {
        config.state_dir = Some(PathBuf::from(DEFAULT_STATE_DIR));
    }
    config.validate()?;
    Ok(config)
}

fn colored_status(status: Status) -> String {
    let label = status.to_string();
    match status {
        Status::Succeeded => label.green().to_string(),
        Status::Skipped | Status::IgnoreFailed => label.cyan().to_string(),
        Status::Failed | Status::Errored => label.red().to_string(),
        Status::Expired | Status::Aborted => label.yellow().to_string(),
        _ => label.dimmed().to_string(),
    }
}

fn print_summary(nodes: &mut [NodeExecution]) {
    nodes.sort_by_key(|ne| ne.created_at);

    println!();
    println!("{}", "Node Summary:".bold());
    for ne in nodes.iter() {
        let indent = "  ".repeat(ne.ambiance.levels().len());
        let retry = if ne.retry_index > 0 {
            format!(" (attempt {})", ne.retry_index + 1)
        } else {
            String::new()
        };
        let duration = ne
            .duration()
            .map(|d| format!(" {} ms", d.num_milliseconds()))
            .unwrap_or_default();
        println!(
            "{}{} {}{}{}",
            indent,
            colored_status(ne.status),
            ne.identifier,
            retry.dimmed(),
            duration.dimmed()
        );
        if let Some(failure) = &ne.failure_info {
            println!("{}    {}", indent, failure.message.red());
        }
    }
}

async fn execute(cli: Cli, config: EngineConfig) -> Result<Status, Box<dyn std::error::Error>> {
    let plan_path = cli.plan_path.as_deref().ok_or("No plan file given")?;

    info!("Loading plan: {}", plan_path);
    let plan = load_plan(plan_path).map_err(|e| {
        error!("Failed to load plan: {}", e);
        format!("Could not load plan from '{}': {}", plan_path, e)
    })?;
    let plan_id = plan.id.clone();
    info!("Plan '{}' loaded: {} nodes", plan_id, plan.len());

    let engine = EngineBuilder::new(config).build()?;
    let executor = spawn_executor(engine.clone())?;

    engine.register_plan(plan)?;
    let execution_id = engine.start_plan(&plan_id, cli.setup)?;
    let status = engine.wait_for_plan(&execution_id).await?;

    executor.shutdown().await;

    let mut nodes = engine
        .node_executions()
        .find_by_plan_execution(&execution_id);
    print_summary(&mut nodes);
    if let Some(timeline) = engine.timeline(&execution_id) {
        print!("{}", timeline.gantt_chart());
    }

    println!();
    println!(
        "Plan execution {} finished {}",
        execution_id,
        colored_status(status)
    );
    Ok(status)
}

fn run() -> Result<Status, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let cli = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(cli.verbose);
    print_banner();

    let config = engine_config(&cli)?;
    info!("Engine workers: {}", config.workers);
    if let Some(dir) = &config.state_dir {
        info!("Snapshots: {}", dir.display());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(execute(cli, config))
}

fn main() -> ExitCode {
    match run() {
        Ok(Status::Succeeded) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("pipewright")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_arguments() {
        let cli = parse_arguments(&args(&[
            "plan.yaml",
            "--workers",
            "3",
            "--state-dir",
            "/tmp/pw",
            "--set",
            "accountId=acme",
            "--verbose",
        ]))
        .unwrap();

        assert_eq!(cli.plan_path.as_deref(), Some("plan.yaml"));
        assert_eq!(cli.workers, Some(3));
        assert_eq!(cli.state_dir, Some(PathBuf::from("/tmp/pw")));
        assert_eq!(cli.setup["accountId"], "acme");
        assert!(cli.verbose);
    }

    #[test]
    fn test_parse_arguments_errors() {
        assert!(parse_arguments(&args(&["--workers"])).is_err());
        assert!(parse_arguments(&args(&["--workers", "many"])).is_err());
        assert!(parse_arguments(&args(&["--set", "novalue"])).is_err());
        assert!(parse_arguments(&args(&["--bogus"])).is_err());
        assert!(parse_arguments(&args(&["a.yaml", "b.yaml"])).is_err());
    }

    #[test]
    fn test_engine_config_overrides() {
        let cli = parse_arguments(&args(&["plan.yaml", "--workers", "2", "--no-state"])).unwrap();
        let config = engine_config(&cli).unwrap();
        assert_eq!(config.workers, 2);
        assert!(config.state_dir.is_none());
    }

    #[test]
    fn test_engine_config_state_dir() {
        let cli = parse_arguments(&args(&["plan.yaml"])).unwrap();
        assert_eq!(
            engine_config(&cli).unwrap().state_dir,
            Some(PathBuf::from(DEFAULT_STATE_DIR))
        );

        let cli = parse_arguments(&args(&["plan.yaml", "--state-dir", "/tmp/pw"])).unwrap();
        assert_eq!(
            engine_config(&cli).unwrap().state_dir,
            Some(PathBuf::from("/tmp/pw"))
        );
    }
}
