//! cwlrunner CLI Entry Point
//!
//! # Usage
//!
//! ```bash
//! # Run a workflow with inputs from the command line
//! cwlrunner run water-bodies.cwl --input item=S2B_10TFK_20210713 \
//!     --input bands=green --input bands=nir
//!
//! # Select a process from a $graph document and use a job file
//! cwlrunner run app.cwl --entrypoint detect_water_body --inputs job.yaml
//!
//! # Preview the execution plan
//! cwlrunner run app.cwl --inputs job.yaml --dry-run
//!
//! # Describe a workflow without running it
//! cwlrunner inspect app.cwl
//! ```
//!
//! Workflow outputs are printed as JSON on stdout; logs and the run
//! summary go to stderr.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use colored::Colorize;
use log::{error, info};

use cwlrunner::environment::ContainerMode;
use cwlrunner::execution::{Engine, EngineConfig, FailurePolicy, RunOutcome, ScatterFailurePolicy};
use cwlrunner::workflow::job::{apply_assignments, load_job_file, parse_assignment, resolve_inputs};
use cwlrunner::workflow::state::InstanceStatus;
use cwlrunner::workflow::types::map_to_json;
use cwlrunner::workflow::{load_workflow, topological_order, ValueMap, WorkflowDefinition};
use cwlrunner::{APP_NAME, VERSION};

/// Sub-command selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Run,
    Inspect,
}

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    command: Command,
    workflow_path: String,
    entrypoint: Option<String>,
    inputs: Vec<(String, String)>,
    job_file: Option<PathBuf>,
    engine: EngineConfig,
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
    eprintln!();
    eprintln!("{} v{}", APP_NAME, VERSION);
    eprintln!("CWL DAG and scatter runner");
    eprintln!();
}

fn print_usage() {
    println!("Usage:");
    println!("  cwlrunner run <WORKFLOW_FILE> [OPTIONS]");
    println!("  cwlrunner inspect <WORKFLOW_FILE> [--entrypoint ID]");
    println!();
    println!("Options:");
    println!("  --entrypoint ID          Process to run from a $graph document");
    println!("  --input NAME=VALUE       Workflow input; repeat to build arrays");
    println!("  --inputs JOB.yaml        CWL job file with workflow inputs");
    println!(
        "  --parallel N             Maximum parallel instances (default: {})",
        num_cpus::get()
    );
    println!("  --fail-fast              Cancel everything on the first failure (default)");
    println!("  --best-effort            Keep running branches unaffected by a failure");
    println!("  --scatter-failure MODE   step (default) or index");
    println!("  --container MODE         auto (default), always or never");
    println!("  --working-dir PATH       Root of step working directories (default: cwl-work)");
    println!("  --dry-run                Print the execution plan without running");
    println!("  --verbose                Enable debug logging");
    println!("  --help                   Show this help message");
    println!("  --version                Show version information");
    println!();
    println!("Examples:");
    println!("  cwlrunner run water-bodies.cwl --inputs job.yaml --parallel 4");
    println!("  cwlrunner run water-bodies.cwl --input bands=green --input bands=nir --dry-run");
}

/// Returns the value following an option, advancing the cursor.
fn option_value<'a>(args: &'a [String], i: &mut usize, option: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires a value", option))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut command = None;
    let mut workflow_path = None;
    let mut entrypoint = None;
    let mut inputs = Vec::new();
    let mut job_file = None;
    let mut engine = EngineConfig::default();
    let mut verbose = false;
    let mut i = 1; // Skip program name

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
            "--entrypoint" => {
                entrypoint = Some(option_value(args, &mut i, arg)?.to_string());
            }
            "--input" => {
                let raw = option_value(args, &mut i, arg)?;
                inputs.push(parse_assignment(raw).map_err(|e| e.to_string())?);
            }
            "--inputs" => {
                job_file = Some(PathBuf::from(option_value(args, &mut i, arg)?));
            }
            "--parallel" => {
                let raw = option_value(args, &mut i, arg)?;
                engine.max_parallel = match raw.parse() {
                    Ok(n) if n > 0 => n,
                    _ => return Err(format!("Invalid parallel value: {}", raw)),
                };
            }
            "--fail-fast" => engine.failure_policy = FailurePolicy::FailFast,
            "--best-effort" => engine.failure_policy = FailurePolicy::BestEffort,
            "--scatter-failure" => {
                let raw = option_value(args, &mut i, arg)?;
                engine.scatter_failure = ScatterFailurePolicy::parse(raw).ok_or_else(|| {
                    format!("Invalid scatter failure mode: {} (expected step or index)", raw)
                })?;
            }
            "--container" => {
                let raw = option_value(args, &mut i, arg)?;
                engine.container_mode = ContainerMode::parse(raw).ok_or_else(|| {
                    format!("Invalid container mode: {} (expected auto, always or never)", raw)
                })?;
            }
            "--working-dir" => {
                engine.working_dir = PathBuf::from(option_value(args, &mut i, arg)?);
            }
            "--dry-run" => engine.dry_run = true,
            "--verbose" | "-v" => verbose = true,
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            positional => match (command, workflow_path.is_none()) {
                (None, _) => {
                    command = Some(match positional {
                        "run" => Command::Run,
                        "inspect" => Command::Inspect,
                        other => return Err(format!("Unknown command: {}", other)),
                    });
                }
                (Some(_), true) => workflow_path = Some(positional.to_string()),
                _ => return Err(format!("Unexpected argument: {}", positional)),
            },
        }
        i += 1;
    }

    let command = command.ok_or("Missing command (run or inspect)")?;
    let workflow_path = workflow_path.ok_or("Missing workflow file")?;
    Ok(Config {
        command,
        workflow_path,
        entrypoint,
        inputs,
        job_file,
        engine,
        verbose,
    })
}

/// Prints inputs, outputs and steps of a workflow.
fn inspect(workflow: &WorkflowDefinition) -> Result<(), Box<dyn std::error::Error>> {
    println!("Workflow: {}", workflow.id.bold());
    if let Some(label) = &workflow.label {
        println!("  {}", label);
    }

    println!();
    println!("Inputs:");
    for input in &workflow.inputs {
        match &input.default {
            Some(default) => println!("  {}: {} (default: {})", input.id, input.ty, default),
            None => println!("  {}: {}", input.id, input.ty),
        }
    }

    println!();
    println!("Outputs:");
    for output in &workflow.outputs {
        let sources: Vec<String> = output.sources.iter().map(ToString::to_string).collect();
        println!("  {}: {} <- {}", output.id, output.ty, sources.join(", "));
    }

    println!();
    println!("Steps (execution order):");
    for step_id in topological_order(workflow)? {
        let Some(step) = workflow.get_step(&step_id) else {
            continue;
        };
        let scatter = match &step.scatter {
            Some(s) => format!("  scatter [{}] ({})", s.inputs.join(", "), s.method),
            None => String::new(),
        };
        println!("  {}: {} '{}'{}", step.id, step.run.kind(), step.run.id(), scatter);
    }
    Ok(())
}

/// Prints a coloured summary of a finished run to stderr.
fn print_summary(workflow: &WorkflowDefinition, outcome: &RunOutcome) {
    let total = outcome.records.len();
    let succeeded = outcome
        .records
        .iter()
        .filter(|r| r.status == InstanceStatus::Succeeded)
        .count();

    eprintln!();
    match &outcome.result {
        Ok(_) => eprintln!(
            "{} Workflow '{}' completed ({}/{} instances succeeded)",
            "✓".green().bold(),
            workflow.id,
            succeeded,
            total
        ),
        Err(e) => {
            eprintln!(
                "{} Workflow '{}' failed ({}/{} instances succeeded)",
                "✗".red().bold(),
                workflow.id,
                succeeded,
                total
            );
            eprintln!("  {}", e.to_string().red());
        }
    }

    for record in outcome
        .records
        .iter()
        .filter(|r| r.status == InstanceStatus::Failed)
    {
        let error = record.error.as_deref().unwrap_or("failed");
        eprintln!("  {} {}", record.label().yellow(), error);
        for line in record.diagnostics.lines() {
            eprintln!("      {}", line.dimmed());
        }
    }

    if let Some(path) = &outcome.report_path {
        eprintln!("  Report: {}", path.display());
    }
}

/// Main application entry point. Returns whether the run succeeded.
fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let workflow = load_workflow(&config.workflow_path, config.entrypoint.as_deref()).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        format!("Could not load workflow from '{}': {}", config.workflow_path, e)
    })?;

    if config.command == Command::Inspect {
        inspect(&workflow)?;
        return Ok(true);
    }

    let cwd = env::current_dir()?;
    let mut values = match &config.job_file {
        Some(path) => load_job_file(path)?,
        None => ValueMap::new(),
    };
    apply_assignments(&workflow, &mut values, &config.inputs, &cwd)?;
    let inputs = resolve_inputs(&workflow, values, &cwd)?;

    if config.engine.dry_run {
        info!("Mode: DRY RUN (nothing will execute)");
    }
    info!("Working directory: {}", config.engine.working_dir.display());

    let engine = Engine::new(config.engine);
    let outcome = engine.run(workflow.clone(), inputs);
    if engine.config().dry_run {
        return Ok(outcome.is_success());
    }

    if config.verbose {
        eprintln!("{}", outcome.timeline.gantt_chart());
    }
    print_summary(&workflow, &outcome);

    if let Ok(outputs) = &outcome.result {
        println!("{}", serde_json::to_string_pretty(&map_to_json(outputs))?);
    }
    Ok(outcome.is_success())
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
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
        std::iter::once("cwlrunner")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_parse_run_arguments() {
        let config = parse_arguments(&args(&[
            "run",
            "app.cwl",
            "--entrypoint",
            "detect_water_body",
            "--input",
            "bands=green",
            "--input",
            "bands=nir",
            "--parallel",
            "3",
            "--best-effort",
            "--scatter-failure",
            "index",
            "--container",
            "never",
            "--working-dir",
            "/tmp/run",
        ]))
        .unwrap();

        assert_eq!(config.command, Command::Run);
        assert_eq!(config.workflow_path, "app.cwl");
        assert_eq!(config.entrypoint.as_deref(), Some("detect_water_body"));
        assert_eq!(config.inputs.len(), 2);
        assert_eq!(config.inputs[1], ("bands".to_string(), "nir".to_string()));
        assert_eq!(config.engine.max_parallel, 3);
        assert_eq!(config.engine.failure_policy, FailurePolicy::BestEffort);
        assert_eq!(config.engine.scatter_failure, ScatterFailurePolicy::IsolateIndex);
        assert_eq!(config.engine.container_mode, ContainerMode::Never);
        assert_eq!(config.engine.working_dir, PathBuf::from("/tmp/run"));
    }

    #[test]
    fn test_parse_inspect_defaults() {
        let config = parse_arguments(&args(&["inspect", "app.cwl"])).unwrap();
        assert_eq!(config.command, Command::Inspect);
        assert!(config.inputs.is_empty());
        assert!(!config.engine.dry_run);
        assert_eq!(config.engine.failure_policy, FailurePolicy::FailFast);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_arguments(&args(&[])).is_err());
        assert!(parse_arguments(&args(&["run"])).is_err());
        assert!(parse_arguments(&args(&["execute", "app.cwl"])).is_err());
        assert!(parse_arguments(&args(&["run", "app.cwl", "--parallel", "0"])).is_err());
        assert!(parse_arguments(&args(&["run", "app.cwl", "--input", "novalue"])).is_err());
        assert!(parse_arguments(&args(&["run", "app.cwl", "--container", "sometimes"])).is_err());
        assert!(parse_arguments(&args(&["run", "app.cwl", "--bogus"])).is_err());
        assert!(parse_arguments(&args(&["run", "app.cwl", "extra"])).is_err());
        assert!(parse_arguments(&args(&["run", "app.cwl", "--working-dir"])).is_err());
    }
}
