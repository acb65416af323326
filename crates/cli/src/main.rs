mod executors;

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Arg, ArgAction, ArgMatches, Command};
use indexmap::IndexMap;
use serde_json::Value;
use stepflow_engine::{Engine, EngineConfig, RunRequest, WorkflowBundle, drive_run, parse_workflow_file};
use stepflow_types::{EnvironmentVariable, RunControl, RunEvent, RunStatus, RunTrace, StepStatus, workflow::validate_workflow};
use tokio::sync::mpsc::unbounded_channel;
use tracing::{Level, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let matches = build_cli().get_matches();
    match matches.subcommand() {
        Some(("run", sub)) => run_workflow_cmd(sub).await,
        Some(("validate", sub)) => validate_cmd(sub),
        _ => bail!("expected a subcommand: run or validate"),
    }
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::TRACE)
        .with_writer(std::io::stderr)
        .try_init();
}

fn build_cli() -> Command {
    let file_arg = || {
        Arg::new("file")
            .long("file")
            .short('f')
            .required(true)
            .action(ArgAction::Set)
            .help("Path to workflow YAML/JSON")
    };
    Command::new("stepflow")
        .about("Runs workflow step trees and reports an execution trace")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("run")
                .about("Run a workflow")
                .arg(file_arg())
                .arg(
                    Arg::new("workflow")
                        .long("workflow")
                        .short('w')
                        .action(ArgAction::Set)
                        .help("Workflow id within the file (defaults to the first)"),
                )
                .arg(
                    Arg::new("var")
                        .long("var")
                        .action(ArgAction::Append)
                        .value_name("NAME=VALUE")
                        .help("Case variable; JSON values are decoded"),
                )
                .arg(
                    Arg::new("secret")
                        .long("secret")
                        .action(ArgAction::Append)
                        .value_name("NAME=VALUE")
                        .help("Secret environment variable, masked in all output"),
                )
                .arg(
                    Arg::new("env-file")
                        .long("env-file")
                        .action(ArgAction::Set)
                        .help("YAML/JSON list of environment variables ({name, value, secret})"),
                )
                .arg(
                    Arg::new("config")
                        .long("config")
                        .action(ArgAction::Set)
                        .help("Engine configuration file"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the full execution trace as JSON"),
                ),
        )
        .subcommand(Command::new("validate").about("Validate a workflow document").arg(file_arg()))
}

async fn run_workflow_cmd(matches: &ArgMatches) -> Result<()> {
    let file = matches.get_one::<String>("file").context("missing --file")?;
    let bundle = parse_workflow_file(file)?;
    let workflow = select_workflow(&bundle, matches.get_one::<String>("workflow").map(String::as_str))?.clone();

    let config = match matches.get_one::<String>("config") {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    }
    .with_env_overrides()?;

    let mut environment = match matches.get_one::<String>("env-file") {
        Some(path) => load_environment(path)?,
        None => Vec::new(),
    };
    for raw in matches.get_many::<String>("secret").into_iter().flatten() {
        let (name, value) = parse_assignment(raw)?;
        environment.push(EnvironmentVariable { name, value, secret: true });
    }
    let mut variables = IndexMap::new();
    for raw in matches.get_many::<String>("var").into_iter().flatten() {
        let (name, value) = parse_assignment(raw)?;
        variables.insert(name, value);
    }

    let engine = Engine::new(Arc::new(executors::default_router()))
        .with_config(config)
        .with_library(bundle.library()?);
    let mut request = RunRequest::new(workflow);
    request.environment = environment;
    request.variables = variables;

    let (control_tx, control_rx) = unbounded_channel();
    let (event_tx, mut event_rx) = unbounded_channel();
    let run = tokio::spawn(drive_run(request, Arc::new(engine), Some(control_rx), Some(event_tx)));

    let json_output = matches.get_flag("json");
    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if !json_output {
                print_event(&event);
            }
        }
    });
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling run");
            let _ = control_tx.send(RunControl::Cancel);
        }
    });

    let trace = run.await.context("workflow run task panicked")??;
    interrupt.abort();
    let _ = printer.await;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&trace)?);
    } else {
        print_summary(&trace);
    }
    match trace.status {
        RunStatus::Passed => Ok(()),
        RunStatus::Failed => Err(anyhow!("workflow run failed")),
        RunStatus::Cancelled => Err(anyhow!("workflow run cancelled")),
    }
}

fn validate_cmd(matches: &ArgMatches) -> Result<()> {
    let file = matches.get_one::<String>("file").context("missing --file")?;
    let bundle = parse_workflow_file(file)?;
    bundle.library()?;

    let mut invalid = 0usize;
    for (key, workflow) in &bundle.workflows {
        match validate_workflow(workflow) {
            Ok(()) => println!("{key}: ok ({} root steps)", workflow.steps.len()),
            Err(issues) => {
                invalid += 1;
                println!("{key}: {} issue(s)", issues.len());
                for issue in issues {
                    println!("  - {issue}");
                }
            }
        }
    }
    if invalid > 0 {
        bail!("{invalid} workflow(s) failed validation");
    }
    info!(workflows = bundle.workflows.len(), "validation passed");
    Ok(())
}

fn select_workflow<'a>(bundle: &'a WorkflowBundle, requested: Option<&str>) -> Result<&'a stepflow_types::WorkflowDefinition> {
    match requested {
        Some(id) => bundle.get(id).ok_or_else(|| anyhow!("workflow '{id}' not found in file")),
        None => bundle.first().ok_or_else(|| anyhow!("file declares no workflows")),
    }
}

/// Splits `NAME=VALUE`. Values that parse as JSON are decoded; anything else stays a string.
fn parse_assignment(raw: &str) -> Result<(String, Value)> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected NAME=VALUE, got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        bail!("variable name cannot be empty in '{raw}'");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

fn load_environment(path: impl AsRef<Path>) -> Result<Vec<EnvironmentVariable>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read environment file: {}", path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("Invalid environment file: {}", path.display()))
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::StepStarted { step_id, step_name, .. } => println!("▶ {step_name} ({step_id})"),
        RunEvent::StepFinished {
            step_id,
            status,
            duration_ms,
            error,
            ..
        } => match (status, error) {
            (StepStatus::Failed, Some(error)) => println!("✗ {step_id} failed after {duration_ms} ms: {error}"),
            (StepStatus::Failed, None) => println!("✗ {step_id} failed after {duration_ms} ms"),
            (StepStatus::Skipped, _) => println!("- {step_id} skipped"),
            _ => println!("✓ {step_id} passed in {duration_ms} ms"),
        },
        RunEvent::LoopFinished {
            step_id,
            exit_reason,
            completed_iterations,
        } => println!("↻ {step_id}: {completed_iterations} iteration(s), exit {exit_reason:?}"),
        RunEvent::BranchSelected { step_id, label, .. } => println!("⎇ {step_id}: took {label}"),
        RunEvent::RunStatusChanged { phase, message } => match message {
            Some(message) => println!("run {phase:?}: {message}"),
            None => println!("run {phase:?}"),
        },
        _ => {}
    }
}

fn print_summary(trace: &RunTrace) {
    let summary = trace.summary;
    println!(
        "\n{:?}: {} passed, {} failed, {} skipped of {} steps in {} ms",
        trace.status, summary.passed, summary.failed, summary.skipped, summary.total, trace.duration_ms
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn assignments_decode_json_and_keep_plain_strings() {
        assert_eq!(parse_assignment("count=3").unwrap(), ("count".to_string(), json!(3)));
        assert_eq!(parse_assignment("name=ada lovelace").unwrap(), ("name".to_string(), json!("ada lovelace")));
        assert_eq!(parse_assignment("url=http://x/?a=b").unwrap(), ("url".to_string(), json!("http://x/?a=b")));
        assert!(parse_assignment("novalue").is_err());
        assert!(parse_assignment("=1").is_err());
    }

    #[test]
    fn environment_file_lists_secret_flags() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("env.yaml");
        std::fs::write(&path, "- name: base_url\n  value: http://localhost\n- name: token\n  value: abc\n  secret: true\n").unwrap();

        let environment = load_environment(&path).expect("environment");
        assert_eq!(environment.len(), 2);
        assert!(!environment[0].secret);
        assert!(environment[1].secret);
    }

    #[test]
    fn cli_requires_a_file_for_run() {
        let result = build_cli().try_get_matches_from(["stepflow", "run"]);
        assert!(result.is_err());
        let matches = build_cli()
            .try_get_matches_from(["stepflow", "run", "-f", "flow.yaml", "--var", "a=1", "--var", "b=2"])
            .expect("matches");
        let (_, sub) = matches.subcommand().expect("subcommand");
        assert_eq!(sub.get_many::<String>("var").map(|values| values.count()), Some(2));
    }
}
