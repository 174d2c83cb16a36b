mod config;
mod executor;
mod guardrail;
mod sandbox;
mod session;

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::executor::registry::ExecutionRegistry;
use crate::executor::{
    AgentConfig, ExecutionOrchestrator, ExecutionRequest, ResourceLimits, TaskSource,
};
use crate::guardrail::GuardrailAnalyzer;
use crate::sandbox::docker::DockerRuntime;
use crate::session::SessionStore;

/// System prompt used when no agent definition supplies one.
const DEFAULT_SYSTEM_PROMPT: &str = "\
You are an autonomous task agent. You receive one task from a trusted \
sender and execute it inside your sandbox. Work carefully, commit your \
changes when the task touches a repository, and finish with a short \
summary of what you did.";

fn print_help() {
    println!(
        "\
courier-agent v{}

An agent runtime that executes mailed-in tasks inside sandboxed containers.
Reads one task from stdin, screens it, and runs it to completion.

USAGE:
    courier-agent [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/agent.toml]

OPTIONS:
    --sender <ADDR>      Submitting identity [default: api@localhost]
    --session <ID>       Run inside an existing session
    --source <CHANNEL>   Reply channel: api or email [default: api]
    --no-safety          Skip the guardrail stage (trusted callers only)
    -h, --help           Print this help message and exit
    -V, --version        Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG              Log level filter for tracing
                          (e.g. debug, courier_agent=debug,warn)
    ANTHROPIC_API_KEY     API key for the guardrail classifier and the
                          sandbox fallback credential
                          (from https://console.anthropic.com/)

EXAMPLES:
    echo \"Summarize last week's tickets\" | courier-agent
    echo \"Fix the failing test\" | courier-agent --session a1b2c3d4
    RUST_LOG=debug courier-agent /etc/courier/agent.toml",
        env!("CARGO_PKG_VERSION"),
    );
}

struct CliArgs {
    config_path: String,
    sender: String,
    session: Option<String>,
    source: TaskSource,
    skip_safety: bool,
}

fn parse_args() -> Result<CliArgs> {
    let mut parsed = CliArgs {
        config_path: "config/agent.toml".to_string(),
        sender: "api@localhost".to_string(),
        session: None,
        source: TaskSource::Api,
        skip_safety: false,
    };

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("courier-agent v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--sender" => {
                parsed.sender = args
                    .next()
                    .ok_or_else(|| anyhow!("--sender requires a value"))?;
            }
            "--session" => {
                parsed.session = Some(
                    args.next()
                        .ok_or_else(|| anyhow!("--session requires a value"))?,
                );
            }
            "--source" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow!("--source requires a value"))?;
                parsed.source = match value.as_str() {
                    "api" => TaskSource::Api,
                    "email" => TaskSource::Email,
                    other => return Err(anyhow!("unknown source: {other}")),
                };
            }
            "--no-safety" => parsed.skip_safety = true,
            other if other.starts_with('-') => {
                return Err(anyhow!("unknown option: {other} (see --help)"));
            }
            other => parsed.config_path = other.to_string(),
        }
    }

    Ok(parsed)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("courier_agent=info")),
        )
        .init();

    info!("Loading configuration from {}", args.config_path);
    let config = Config::load(&args.config_path)?;

    info!("Agent: {}", config.agent.name);
    info!("Sandbox image: {}", config.sandbox.image);
    info!(
        "Allowed senders: {}",
        config.agent.allowed_senders.join(", ")
    );

    if !config.is_allowed(&args.sender) {
        return Err(anyhow!("sender {} is not allowed", args.sender));
    }

    // The task arrives on stdin — the API channel's simplest form
    let mut task = String::new();
    std::io::stdin().read_to_string(&mut task)?;
    let task = task.trim().to_string();
    if task.is_empty() {
        return Err(anyhow!("no task text on stdin (see --help)"));
    }

    // Components that persist across executions
    let guardrail = GuardrailAnalyzer::new(&config.guardrail)?;
    info!("Guardrail: {}", guardrail.description());
    let sessions = Arc::new(SessionStore::open(&config.sessions)?);
    let registry = Arc::new(ExecutionRegistry::new(Duration::from_secs(
        config.sandbox.registry_retention_secs,
    )));
    let runtime = Arc::new(DockerRuntime::connect()?);
    let orchestrator = ExecutionOrchestrator::new(
        runtime,
        sessions.clone(),
        registry.clone(),
        config.sandbox.clone(),
    );

    // ── Guardrail ──────────────────────────────────────────
    if args.skip_safety {
        warn!("Guardrail skipped (--no-safety)");
    } else {
        let verdict = guardrail.analyze(&task).await;
        info!(
            "Guardrail: {:?} ({:.2}, {:?}, {}ms)",
            verdict.decision, verdict.confidence, verdict.method, verdict.duration_ms
        );
        if !verdict.is_approved() {
            println!("Task not executed: {:?}", verdict.decision);
            if let Some(reason) = verdict.reason {
                println!("Reason: {}", reason.as_str());
            }
            println!("{}", verdict.explanation);
            return Ok(());
        }
    }

    // ── Session resolution ─────────────────────────────────
    let agent_id = config.agent.name.to_lowercase().replace(' ', "-");
    let message_id = format!("<api-{}@courier>", uuid::Uuid::new_v4());

    let session = match &args.session {
        Some(id) => sessions
            .get(id)
            .await?
            .ok_or_else(|| anyhow!("unknown session: {id}"))?,
        None => match sessions.resolve(None, Some(&task)).await? {
            Some(session) => session,
            None => {
                let subject = task.lines().next().unwrap_or("(task)").to_string();
                sessions
                    .create(&agent_id, &message_id, &subject, &args.sender)
                    .await?
            }
        },
    };
    if session.thread.original_message_id != message_id {
        sessions.add_message(&session.id, &message_id).await?;
    }
    info!("Session: {} (agent: {})", session.id, session.agent_id);

    // ── Execution ──────────────────────────────────────────
    let request = ExecutionRequest {
        execution_id: uuid::Uuid::new_v4().to_string(),
        prompt: task,
        agent: AgentConfig {
            id: session.agent_id.clone(),
            name: config.agent.name.clone(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            env: Default::default(),
            services: None,
            allowed_tools: Vec::new(),
            model: None,
        },
        session_id: Some(session.id.clone()),
        use_resume: true,
        limits: ResourceLimits {
            memory_mb: config.sandbox.memory_mb,
            cpu_cores: config.sandbox.cpu_cores,
            timeout_ms: config.sandbox.timeout_secs * 1000,
            max_turns: config.sandbox.max_turns,
        },
        skip_safety_check: args.skip_safety,
        source: args.source,
        services: None,
    };

    let result = orchestrator.execute(&request).await?;

    if let Some(status) = registry.get(&request.execution_id).await {
        debug!(
            "Registry: {:?} ({} entries tracked)",
            status.state,
            registry.list().await.len()
        );
    }

    // ── Reply ──────────────────────────────────────────────
    println!();
    if result.success {
        println!("{}", result.summary);
    } else {
        println!("The task could not be completed.");
        println!("{}", result.summary);
    }
    if !result.files_modified.is_empty() {
        println!("\nFiles modified:");
        for file in &result.files_modified {
            println!("  {file}");
        }
    }
    if let Some(commit) = &result.commit_hash {
        println!("Commit: {commit}");
    }
    if !result.models_used.is_empty() {
        println!("Models: {}", result.models_used.join(", "));
    }
    if let Some(cost) = result.cost_usd {
        println!("Cost: ${cost:.2}");
    }
    println!("Session tag: {}", session.tag());

    Ok(())
}
