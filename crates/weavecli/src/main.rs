mod demos;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use demos::Template;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use weavecore::{ExecutionEvent, LoopOutcome, SharedState, StepEvent, Value, WorkflowDefinition};
use weavenodes::{GeminiClient, GeminiConfig, ModelClient, ScriptedModel};
use weaveruntime::{read_definition, DataflowGraph, RuntimeConfig, StepRegistry, WeaveRuntime};

#[derive(Parser)]
#[command(name = "weave")]
#[command(about = "Multi-step agent workflow runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Initial state as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// User query, stored under `user_query`
        #[arg(short, long)]
        query: Option<String>,

        /// Use the scripted offline model instead of Gemini
        #[arg(long)]
        offline: bool,

        /// Runtime config JSON file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// Print the producer/consumer graph of a workflow as DOT
    Graph {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List available step types
    Steps,

    /// Write one of the built-in pipelines to a file
    Init {
        #[arg(short, long, value_enum, default_value = "blog")]
        template: Template,

        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            input,
            query,
            offline,
            config,
            verbose,
        } => {
            init_logging(verbose);
            run_workflow(&file, input, query, offline, config).await?;
        }

        Commands::Validate { file } => {
            init_logging(false);
            validate_workflow(&file)?;
        }

        Commands::Graph { file } => {
            init_logging(false);
            print_graph(&file)?;
        }

        Commands::Steps => {
            list_steps();
        }

        Commands::Init { template, output } => {
            create_workflow(template, &output)?;
        }
    }

    Ok(())
}

fn build_runtime(model: Arc<dyn ModelClient>, config: RuntimeConfig) -> WeaveRuntime {
    let mut registry = StepRegistry::new();
    weavenodes::register_all(&mut registry, model);
    WeaveRuntime::with_registry(Arc::new(registry), config)
}

/// Runtime for commands that only build workflows and never call a model.
fn offline_runtime() -> WeaveRuntime {
    build_runtime(Arc::new(ScriptedModel::new()), RuntimeConfig::default())
}

fn model_client(offline: bool) -> Result<Arc<dyn ModelClient>> {
    if offline {
        return Ok(Arc::new(ScriptedModel::new()));
    }
    let config = GeminiConfig::from_env().context("set GOOGLE_API_KEY or pass --offline")?;
    Ok(Arc::new(GeminiClient::new(config)?))
}

fn initial_state(input: Option<String>, query: Option<String>) -> Result<SharedState> {
    let mut state = match input {
        Some(input_str) => {
            let json: serde_json::Value = serde_json::from_str(&input_str)?;
            match Value::from(json) {
                Value::Object(map) => SharedState::from(map),
                _ => bail!("Input must be a JSON object"),
            }
        }
        None => SharedState::new(),
    };
    if let Some(query) = query {
        state.insert(weavecore::QUERY_KEY, Value::String(query));
    }
    Ok(state)
}

async fn run_workflow(
    file: &Path,
    input: Option<String>,
    query: Option<String>,
    offline: bool,
    config: Option<PathBuf>,
) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());

    let definition = read_definition(file)?;
    let config = match config {
        Some(path) => RuntimeConfig::from_file(&path)?,
        None => RuntimeConfig::default(),
    };
    let runtime = build_runtime(model_client(offline)?, config);
    let workflow = runtime.load(&definition)?;

    println!("📋 Workflow: {}", workflow.name);
    println!("   Steps: {}", workflow.steps().len());
    println!();

    let state = initial_state(input, query)?;
    for key in &definition.initial_keys {
        if !state.contains(key) {
            tracing::warn!("Initial key '{}' not supplied", key);
        }
    }

    let mut events = runtime.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(event);
        }
    });

    let cancellation = CancellationToken::new();
    let on_interrupt = cancellation.clone();
    let interrupt_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("⏹️  Interrupted, stopping after the current step");
            on_interrupt.cancel();
        }
    });

    let result = runtime
        .execute_with_cancellation(&workflow, state, cancellation)
        .await;
    interrupt_task.abort();

    // Wait for events to finish printing
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();

    let report = result?;

    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", report.execution_id);
    println!("   Steps executed: {}", report.steps_executed);
    for lp in &report.loops {
        let how = match &lp.outcome {
            LoopOutcome::TerminatedBySignal { .. } => "terminated by signal",
            LoopOutcome::TerminatedByCap => "hit iteration cap",
        };
        println!("   Loop {}: {} iteration(s), {}", lp.node, lp.iterations, how);
    }

    println!();
    println!("📤 Final state:");
    for (key, value) in report.state.iter() {
        match value {
            Value::String(text) => println!("   {}:\n{}\n", key, indent(text)),
            other => println!("   {}: {}", key, other),
        }
    }

    Ok(())
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("      {}", line))
        .collect::<Vec<_>>()
        .join("\n")
}

fn print_event(event: ExecutionEvent) {
    match event {
        ExecutionEvent::RunStarted { workflow, .. } => {
            println!("▶️  Workflow {} started", workflow);
        }
        ExecutionEvent::StepStarted { step, kind, .. } => {
            println!("  ⚡ Starting step: {} ({})", step, kind);
        }
        ExecutionEvent::StepCompleted {
            step,
            output_key,
            duration_ms,
            ..
        } => match output_key {
            Some(key) => println!("  ✅ Step {} wrote {} in {}ms", step, key, duration_ms),
            None => println!("  ✅ Step {} completed in {}ms", step, duration_ms),
        },
        ExecutionEvent::StepFailed { step, error, .. } => {
            println!("  ❌ Step {} failed: {}", step, error);
        }
        ExecutionEvent::LoopIteration {
            node, iteration, ..
        } => {
            println!("  🔁 {} pass {}", node, iteration);
        }
        ExecutionEvent::LoopFinished {
            node,
            iterations,
            outcome,
            ..
        } => match outcome {
            LoopOutcome::TerminatedBySignal { message } => println!(
                "  🏁 {} stopped after {} pass(es): {}",
                node,
                iterations,
                message.unwrap_or_else(|| "signal".to_string())
            ),
            LoopOutcome::TerminatedByCap => {
                println!("  🏁 {} reached its cap of {} pass(es)", node, iterations)
            }
        },
        ExecutionEvent::BranchSelected { node, route, .. } => match route {
            Some(route) => println!("  🔀 {} took route {}", node, route),
            None => println!("  🔀 {} had no matching route", node),
        },
        ExecutionEvent::StepEvent { step, event, .. } => match event {
            StepEvent::Info { message } => {
                println!("     ℹ️  [{}] {}", step, message);
            }
            StepEvent::Warning { message } => {
                println!("     ⚠️  [{}] {}", step, message);
            }
            StepEvent::Progress { percent, message } => {
                if let Some(msg) = message {
                    println!("     📊 [{}] {}% - {}", step, percent, msg);
                } else {
                    println!("     📊 [{}] {}%", step, percent);
                }
            }
        },
        ExecutionEvent::RunCompleted {
            success,
            duration_ms,
            ..
        } => {
            if success {
                println!("✨ Workflow completed successfully in {}ms", duration_ms);
            } else {
                println!("💥 Workflow failed after {}ms", duration_ms);
            }
        }
    }
}

fn load_checked(file: &Path) -> Result<(WorkflowDefinition, DataflowGraph)> {
    let definition = read_definition(file)?;
    let workflow = offline_runtime()
        .load(&definition)
        .with_context(|| format!("building {}", file.display()))?;
    let graph = DataflowGraph::analyze(&workflow, &definition.initial_keys);
    Ok((definition, graph))
}

fn validate_workflow(file: &Path) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let (definition, graph) = load_checked(file)?;
    if !graph.is_satisfied() {
        for missing in graph.unresolved() {
            println!("   ❌ {} needs '{}', which nothing produces", missing.step, missing.key);
        }
        bail!("{} unresolved input(s)", graph.unresolved().len());
    }

    println!("✅ Workflow is valid:");
    println!("   Name: {}", definition.name);
    println!("   Nodes: {}", graph.node_count());

    Ok(())
}

fn print_graph(file: &Path) -> Result<()> {
    let (_, graph) = load_checked(file)?;
    for missing in graph.unresolved() {
        tracing::warn!("{} needs '{}', which nothing produces", missing.step, missing.key);
    }
    println!("{}", graph.to_dot());
    Ok(())
}

fn list_steps() {
    println!("📦 Available Step Types:");
    println!();

    let runtime = offline_runtime();
    let registry = runtime.registry();

    for kind in registry.list_kinds() {
        if let Some(metadata) = registry.metadata(&kind) {
            println!("  • {} ({})", kind, metadata.category);
            println!("    {}", metadata.description);
            for field in &metadata.config {
                let marker = if field.required { "*" } else { " " };
                println!("      {}{}: {}", marker, field.name, field.description);
            }
        } else {
            println!("  • {}", kind);
        }
    }
}

fn create_workflow(template: Template, output: &Path) -> Result<()> {
    let definition = template.definition();

    let json = serde_json::to_string_pretty(&definition)?;
    std::fs::write(output, json)?;

    println!("✨ Created {} workflow: {}", definition.name, output.display());
    println!();
    println!("Run it with:");
    println!(
        "  weave run --file {} --query \"{}\"",
        output.display(),
        template.sample_query()
    );

    Ok(())
}
