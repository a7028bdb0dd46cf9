use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use conductor_core::config::AppConfig;
use conductor_core::event::EventBus;
use conductor_core::traits::{ExecutionStore, WorkerInvoker};
use conductor_core::types::{
    EngineEvent, ExecutionId, ExecutionMode, ExecutionProgress, ExecutionStatus,
};
use conductor_core::workflow::WorkflowDefinition;

use conductor_agent::{EngineDeps, StartRequest, StaticCatalog, WorkflowEngine};
use conductor_llm::EchoInvoker;
use conductor_memory::SqliteStore;

#[derive(Parser)]
#[command(name = "conductor", version, about = "Multi-agent workflow execution engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conductor.toml", env = "CONDUCTOR_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow and wait for it to finish
    Run {
        /// Workflow definition (TOML or JSON)
        workflow: PathBuf,
        /// Run input as a JSON document
        #[arg(long)]
        input: Option<String>,
        /// automated, semi-automated or manual
        #[arg(long, default_value = "automated")]
        mode: ExecutionMode,
        /// Caller identity recorded on the run
        #[arg(long, default_value = "cli")]
        caller: String,
        /// Pin a step to an agent: STEP=AGENT (step id or position)
        #[arg(long = "agent", value_name = "STEP=AGENT")]
        agents: Vec<String>,
        /// Answer every step locally instead of calling the model
        #[arg(long)]
        dry_run: bool,
    },
    /// Check a workflow definition and print its entry steps
    Validate {
        workflow: PathBuf,
    },
    /// List the configured agent catalog
    Agents,
    /// Show current configuration
    Config,
    /// List stored executions
    History {
        /// Only show runs with this status
        #[arg(long)]
        status: Option<String>,
        /// Show the full progress of one execution
        #[arg(long)]
        id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("conductor=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    // Validation needs no config
    if let Commands::Validate { workflow } = &cli.command {
        return validate_workflow(workflow);
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Validate { .. } => Ok(()),
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Agents => {
            print_agents(&config);
            Ok(())
        }
        Commands::History { status, id } => show_history(&config, status, id).await,
        Commands::Run {
            workflow,
            input,
            mode,
            caller,
            agents,
            dry_run,
        } => {
            let input = match input {
                Some(raw) => serde_json::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("invalid --input JSON: {}", e))?,
                None => serde_json::Value::Null,
            };
            let mut request = StartRequest::new(String::new(), caller)
                .with_mode(mode)
                .with_input(input);
            for pin in &agents {
                let (step, agent) = pin
                    .split_once('=')
                    .ok_or_else(|| anyhow::anyhow!("expected STEP=AGENT, got '{}'", pin))?;
                request = request.with_agent_override(step.trim(), agent.trim());
            }
            run_workflow(config, &workflow, request, dry_run).await
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }

    // Check for config in the home workspace
    if let Some(home) = dirs_home().map(|h| h.join(".conductor").join("config.toml")) {
        if home.exists() {
            info!(path = %home.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home)?);
        }
    }

    warn!(path = %path.display(), "No config file found, using defaults");
    Ok(AppConfig::default())
}

fn validate_workflow(path: &Path) -> anyhow::Result<()> {
    let workflow = WorkflowDefinition::load(path)?;
    workflow.validate()?;

    println!("{} ({})", workflow.name, workflow.id);
    println!("  Steps: {}", workflow.steps.len());
    println!("  Entry: {}", workflow.entry_steps().join(", "));
    for step in workflow.ordered_steps() {
        let mut flags = Vec::new();
        if step.parallel {
            flags.push("parallel");
        }
        if step.requires_user_input {
            flags.push("user input");
        }
        if step.optional {
            flags.push("optional");
        }
        let flags = if flags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", flags.join(", "))
        };
        println!("  {:>3}. {}{}", step.position, step.id, flags);
    }
    Ok(())
}

fn print_agents(config: &AppConfig) {
    if config.agents.is_empty() {
        println!("No agents configured. Add [[agents]] entries to the config file.");
        return;
    }
    for agent in &config.agents {
        println!(
            "{} ({}) tier {} {:?} {:?}",
            agent.id, agent.name, agent.tier, agent.cost_class, agent.status
        );
        if !agent.capabilities.is_empty() {
            println!("    capabilities: {}", agent.capabilities.join(", "));
        }
        if !agent.specializations.is_empty() {
            println!("    specializations: {}", agent.specializations.join(", "));
        }
    }
}

async fn show_history(
    config: &AppConfig,
    status: Option<String>,
    id: Option<String>,
) -> anyhow::Result<()> {
    let store = SqliteStore::open(&config.database_path())?;

    if let Some(id) = id {
        match store.load_execution(&id).await? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record.progress)?),
            None => anyhow::bail!("execution not found: {}", id),
        }
        return Ok(());
    }

    let filter = match status.as_deref() {
        Some(s) => Some(
            ExecutionStatus::parse(s).ok_or_else(|| anyhow::anyhow!("unknown status '{}'", s))?,
        ),
        None => None,
    };
    let records = store.list_executions(filter).await?;
    if records.is_empty() {
        println!("No executions recorded.");
    }
    for record in records {
        let p = &record.progress;
        println!(
            "{}  {:<9}  {:<20}  {}/{} steps  {}",
            record.execution_id,
            record.status.as_str(),
            p.workflow_id,
            p.completed_steps,
            p.total_steps,
            record.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn run_workflow(
    config: AppConfig,
    path: &Path,
    mut request: StartRequest,
    dry_run: bool,
) -> anyhow::Result<()> {
    let workflow = WorkflowDefinition::load(path)?;
    request.workflow_id = workflow.id.clone();

    let invoker: Arc<dyn WorkerInvoker> = if dry_run {
        Arc::new(EchoInvoker::new())
    } else {
        match &config.model {
            Some(model) => conductor_llm::create_invoker(model),
            None => anyhow::bail!("No [model] configured. Add one or pass --dry-run."),
        }
    };

    let db_path = config.database_path();
    let store = Arc::new(SqliteStore::open(&db_path)?);
    let events = Arc::new(EventBus::default());

    let deps = EngineDeps {
        catalog: Arc::new(StaticCatalog::new(config.agents.clone())),
        metrics: store.clone(),
        executions: store,
        invoker,
        events: events.clone(),
    };
    let engine = WorkflowEngine::new(config, deps);
    let closed = engine.recover_interrupted().await?;
    if !closed.is_empty() {
        warn!(count = closed.len(), "Closed executions interrupted by a previous process");
    }
    engine.register_workflow(workflow).await?;

    // Spawn event printer
    let mut rx = events.subscribe();
    let print_handle = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            print_event(&event);
        }
    });

    let id = engine.start_execution(request).await?;
    eprintln!("Execution {}", id);

    let outcome = drive(&engine, &id).await;
    engine.shutdown().await;
    print_handle.abort();

    let progress = outcome?;
    print_summary(&progress);

    match progress.status {
        ExecutionStatus::Completed => Ok(()),
        status => anyhow::bail!(
            "execution {}: {}",
            status,
            progress.error.as_deref().unwrap_or("no error recorded")
        ),
    }
}

/// Wait for the run, answering pauses interactively until it finishes.
async fn drive(engine: &WorkflowEngine, id: &ExecutionId) -> anyhow::Result<ExecutionProgress> {
    loop {
        let progress = engine.wait(id).await?;
        if progress.status != ExecutionStatus::Paused {
            return Ok(progress);
        }

        let prompt = if progress.paused_steps.is_empty() {
            "Run paused. Press enter to resume, or type 'cancel': ".to_string()
        } else {
            format!(
                "Input for {} (or 'cancel'): ",
                progress.paused_steps.join(", ")
            )
        };

        let line = read_line(prompt).await?;
        match line.trim() {
            "cancel" | "/quit" => {
                engine.cancel_execution(id).await?;
            }
            "" => engine.resume_execution(id, None).await?,
            text => {
                let value = serde_json::from_str(text)
                    .unwrap_or_else(|_| serde_json::Value::String(text.to_string()));
                engine.resume_execution(id, Some(value)).await?;
            }
        }
    }
}

async fn read_line(prompt: String) -> anyhow::Result<String> {
    let line = tokio::task::spawn_blocking(move || -> io::Result<String> {
        eprint!("{}", prompt);
        io::stderr().flush()?;
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok(line)
    })
    .await??;
    Ok(line)
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::StepStarted {
            step_id, attempt, ..
        } => {
            if *attempt > 1 {
                eprintln!("[{}] attempt {}", step_id, attempt);
            } else {
                eprintln!("[{}] started", step_id);
            }
        }
        EngineEvent::AgentSelected {
            step_id,
            agent_id,
            strategy,
            ..
        } => eprintln!("[{}] agent {} ({})", step_id, agent_id, strategy),
        EngineEvent::StepFinished {
            step_id,
            status,
            duration_ms,
            ..
        } => eprintln!("[{}] {} in {}ms", step_id, status, duration_ms),
        EngineEvent::StepRetryScheduled {
            step_id, delay_ms, ..
        } => eprintln!("[{}] retrying in {}ms", step_id, delay_ms),
        EngineEvent::UserInputRequired {
            step_id, prompt, ..
        } => match prompt {
            Some(q) => eprintln!("[{}] needs input: {}", step_id, q),
            None => eprintln!("[{}] needs input", step_id),
        },
        EngineEvent::ErrorStrategyTriggered {
            strategy,
            error_count,
            ..
        } => eprintln!("[strategy] {} fired after {} error(s)", strategy, error_count),
        EngineEvent::RunPaused { reason, .. } => eprintln!("[paused] {}", reason),
        EngineEvent::RunError { error, .. } => eprintln!("[error] {}", error),
        EngineEvent::RunStarted { .. } | EngineEvent::RunComplete { .. } => {}
    }
}

fn print_summary(progress: &ExecutionProgress) {
    println!();
    println!(
        "Execution {}: {} ({}/{} steps, {} failed, {:.0}%)",
        progress.execution_id,
        progress.status,
        progress.completed_steps,
        progress.total_steps,
        progress.failed_steps,
        progress.percent_complete() * 100.0
    );

    for result in &progress.step_results {
        let agent = result.agent_id.as_deref().unwrap_or("-");
        let confidence = result
            .confidence
            .map(|c| format!(" conf {:.2}", c))
            .unwrap_or_default();
        println!(
            "  {:<20} {:<20} {:<10} attempt {}{}",
            result.step_id,
            agent,
            result.status.as_str(),
            result.attempt,
            confidence
        );
        if let Some(err) = &result.error {
            println!("      error: {}", truncate(err, 200));
        } else if result.succeeded() {
            println!("      {}", truncate(&result.output_text(), 200));
        }
    }

    let analytics = &progress.analytics;
    if !analytics.bottlenecks.is_empty() {
        println!("  Bottlenecks:");
        for b in &analytics.bottlenecks {
            println!(
                "    {} on {}: {}ms",
                b.step_id,
                b.agent_id.as_deref().unwrap_or("-"),
                b.duration_ms
            );
        }
    }
    if let Some(error) = &progress.error {
        println!("  Error: {}", error);
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
