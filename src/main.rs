use std::io::{BufRead, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Map, Value};
use tracing::{info, warn};

use handover::cli::{Cli, Command};
use handover::config::RunnerConfig;
use handover::executor::{ExecutorError, ExecutorService};
use handover::factory::DefaultFactory;
use handover::paths;
use handover::planner::parse_directive;
use handover::runner::{Task, TaskStatus};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const OPERATOR_PAUSE_INSTRUCTIONS: &str = "Take over, then type 'resume' when you are done.";

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults, no .handover/config.toml found)".to_string())
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<20} {value}\n"));
}

fn or_none(value: Option<&str>) -> &str {
    value.unwrap_or("(none)")
}

fn render_config_human(config: &RunnerConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    output.push_str("Task\n");
    push_kv(&mut output, "description", &config.task.description);
    push_kv(&mut output, "goal", or_none(config.task.goal.as_deref()));
    output.push('\n');

    output.push_str("Planner\n");
    push_kv(&mut output, "provider", &config.planner.provider);
    push_kv(&mut output, "program", or_none(config.planner.program.as_deref()));
    if config.planner.args.is_empty() {
        push_kv(&mut output, "args", "(none)");
    } else {
        push_kv(&mut output, "args", config.planner.args.join(", "));
    }
    push_kv(&mut output, "timeout_secs", config.planner.timeout_secs);
    push_kv(&mut output, "responses", config.planner.responses.len());
    output.push('\n');

    output.push_str("Environment\n");
    push_kv(&mut output, "driver", &config.environment.driver);
    push_kv(
        &mut output,
        "start_location",
        or_none(config.environment.start_location.as_deref()),
    );
    push_kv(&mut output, "screenshots", config.environment.screenshots);
    output.push('\n');

    output.push_str("Notifications\n");
    push_kv(&mut output, "channel", &config.notifications.channel);
    push_kv(&mut output, "target", or_none(config.notifications.target.as_deref()));
    output.push('\n');

    output.push_str("Remote Display\n");
    push_kv(&mut output, "enabled", config.display.enabled);
    push_kv(&mut output, "program", &config.display.program);
    push_kv(
        &mut output,
        "address",
        format!("{}:{}", config.display.host, config.display.port),
    );
    push_kv(&mut output, "display", &config.display.display);
    output.push('\n');

    output.push_str("Runner\n");
    push_kv(
        &mut output,
        "wait_for_user",
        config
            .wait_for_user_timeout_secs
            .map(|secs| format!("{secs}s"))
            .unwrap_or_else(|| "(forever)".to_string()),
    );
    push_kv(&mut output, "memory_max_entries", config.memory_max_entries);
    push_kv(&mut output, "history_limit", config.history_limit);
    push_kv(&mut output, "capture_artifacts", config.capture_artifacts);
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

fn render_config_json(config: &RunnerConfig, config_path: Option<&Path>) -> Result<String> {
    let mut payload = serde_json::to_value(config).context("failed to serialize config to JSON")?;
    if let Value::Object(map) = &mut payload {
        map.insert(
            "source_path".to_string(),
            Value::String(config_source_label(config_path)),
        );
    }
    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

/// Collect the `run` flags into an override tree for the loader.
fn cli_overrides(
    task: Option<String>,
    goal: Option<String>,
    planner: Option<String>,
    timeout: Option<f64>,
    memory_max: Option<usize>,
) -> Value {
    let mut root = Map::new();
    let mut task_section = Map::new();
    if let Some(description) = task {
        task_section.insert("description".to_string(), Value::String(description));
    }
    if let Some(goal) = goal {
        task_section.insert("goal".to_string(), Value::String(goal));
    }
    if !task_section.is_empty() {
        root.insert("task".to_string(), Value::Object(task_section));
    }
    if let Some(provider) = planner {
        root.insert("planner".to_string(), serde_json::json!({ "provider": provider }));
    }
    if let Some(secs) = timeout {
        root.insert("wait_for_user_timeout_secs".to_string(), Value::from(secs));
    }
    if let Some(max) = memory_max {
        root.insert("memory_max_entries".to_string(), Value::from(max));
    }
    Value::Object(root)
}

fn announce(message: impl std::fmt::Display) {
    println!("\x1b[36m[handover]\x1b[0m {message}");
}

fn describe_intervention(task: &Task) {
    if let Some(active) = &task.current_request {
        announce(format!("reason: {}", active.request.reason));
        announce(format!("instructions: {}", active.request.instructions));
        if let Some(info) = &active.connection_info {
            announce(format!(
                "remote display: {}:{} ({})",
                info.host, info.port, info.display
            ));
        }
        announce("type 'resume' when done");
    }
}

/// Read operator commands from stdin until EOF.
fn spawn_operator_console(service: Arc<ExecutorService>, task_id: String) {
    let spawned = thread::Builder::new()
        .name("operator-console".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                let line = line.trim();
                let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
                let outcome = match command {
                    "" => continue,
                    "pause" => {
                        let reason = match rest.trim() {
                            "" => "Operator requested a pause",
                            reason => reason,
                        };
                        service
                            .pause(&task_id, reason, OPERATOR_PAUSE_INSTRUCTIONS)
                            .map(|()| "pause requested".to_string())
                    }
                    "resume" => service.resume(&task_id).map(|()| "resumed".to_string()),
                    "status" => service.task(&task_id).map(|task| {
                        format!(
                            "status: {} ({} actions, {} notes)",
                            task.status,
                            task.actions.len(),
                            task.notes.len()
                        )
                    }),
                    other => Ok(format!(
                        "unknown command '{other}' (expected pause [reason], resume, status)"
                    )),
                };
                match outcome {
                    Ok(message) => announce(message),
                    Err(e) => announce(e),
                }
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "operator console unavailable");
    }
}

fn print_summary(task: &Task, artifacts: &[String]) {
    announce(format!("task {} {}", task.id, task.status));
    if let Some(goal) = &task.goal {
        announce(format!("goal: {goal}"));
    }
    announce(format!(
        "{} actions, {} notes, {} events",
        task.actions.len(),
        task.notes.len(),
        task.logs.len()
    ));
    if let Some(error) = &task.error {
        announce(format!("error: {error}"));
    }
    if !artifacts.is_empty() {
        announce(format!("artifacts: {}", artifacts.join(", ")));
    }
}

fn run_task(
    cwd: &Path,
    config_path: Option<PathBuf>,
    overrides: Value,
    artifacts: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let (config, source) = RunnerConfig::load(config_path.as_deref(), cwd, overrides)?;
    match source {
        Some(ref p) => info!("loaded config from {}", p.display()),
        None => info!("no .handover/config.toml found, using defaults"),
    }

    let artifact_root = paths::resolve_artifact_root(artifacts.as_deref(), cwd);
    let service = Arc::new(ExecutorService::new(
        artifact_root,
        Arc::new(DefaultFactory),
    )?);
    let task_id = service.create_task(config)?;
    announce(format!("task {task_id} started"));

    let interrupt_service = Arc::clone(&service);
    let interrupt_id = task_id.clone();
    ctrlc::set_handler(move || {
        match interrupt_service.pause(
            &interrupt_id,
            "Interrupted from the terminal",
            OPERATOR_PAUSE_INSTRUCTIONS,
        ) {
            Ok(()) => announce("pause requested (Ctrl-C again to abort)"),
            Err(ExecutorError::PauseConflict(_)) => {
                announce("aborting");
                std::process::exit(130);
            }
            Err(e) => announce(e),
        }
    })
    .ok();

    spawn_operator_console(Arc::clone(&service), task_id.clone());

    let mut last_status = TaskStatus::Pending;
    loop {
        let task = service.task(&task_id)?;
        if task.status != last_status {
            announce(format!("status: {last_status} -> {}", task.status));
            if matches!(task.status, TaskStatus::Paused | TaskStatus::WaitingForUser) {
                describe_intervention(&task);
            }
            last_status = task.status;
        }
        if task.is_terminal() {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }

    service.join(&task_id)?;
    let task = service.task(&task_id)?;
    let artifacts = service.list_artifacts(&task_id)?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&task).context("failed to serialize task to JSON")?
        );
    } else {
        print_summary(&task, &artifacts);
    }

    if task.status == TaskStatus::Failed {
        anyhow::bail!(
            "task {} failed: {}",
            task.id,
            task.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let is_config_command = matches!(&cli.command, Command::Config { .. });

    let filter = match cli.verbose {
        0 if is_config_command => "handover=warn",
        0 => "handover=info",
        1 => "handover=debug",
        _ => "handover=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;

    match cli.command {
        Command::Run {
            config,
            task,
            goal,
            planner,
            timeout,
            memory_max,
            artifacts,
            json,
        } => {
            let overrides = cli_overrides(task, goal, planner, timeout, memory_max);
            run_task(&cwd, config, overrides, artifacts, json)
        }
        Command::Config { config, json } => {
            let (loaded, source) =
                RunnerConfig::load(config.as_deref(), &cwd, Value::Object(Map::new()))?;
            if json {
                println!("{}", render_config_json(&loaded, source.as_deref())?);
            } else {
                print!("{}", render_config_human(&loaded, source.as_deref()));
            }
            Ok(())
        }
        Command::ParseDirective { file } => {
            let text = match file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                None => {
                    let mut text = String::new();
                    std::io::stdin()
                        .read_to_string(&mut text)
                        .context("failed to read stdin")?;
                    text
                }
            };
            let directive = parse_directive(&text)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&directive)
                    .context("failed to serialize directive to JSON")?
            );
            Ok(())
        }
    }
}
