//! footprintd - aggregate footprint pipeline
//!
//! CLI entry point for starting products and draining the task queue.

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};

use footprintd::cli::{Cli, Command, OutputFormat, get_log_path};
use footprintd::config::Config;
use footprintd::domain::{Entity, EntityKind, Lifecycle, StageName, StageStatus};
use footprintd::events::{EventBus, EventLogger, JOURNAL_FILE, read_journal, spawn_event_logger};
use footprintd::llm::create_client;
use footprintd::pipeline::{Pipeline, StatusNode, status_tree};
use footprintd::queue::{TaskQueue, TaskStatus};
use footprintd::state::StateManager;

fn setup_logging(verbose: bool, config_level: Option<&str>) -> Result<()> {
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Write to the log file, not stdout/stderr
    let level = match (verbose, config_level) {
        (true, _) => tracing::Level::DEBUG,
        (false, Some(level)) => level.parse().unwrap_or(tracing::Level::INFO),
        (false, None) => tracing::Level::INFO,
    };
    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (verbose: {})", verbose);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config first: it carries the log level
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    setup_logging(cli.verbose, config.log_level.as_deref()).context("Failed to setup logging")?;

    info!(
        "footprintd loaded config: provider={}, model={}",
        config.llm.provider, config.llm.model
    );

    match cli.command {
        Some(Command::Run {
            name,
            description,
            mass,
        }) => cmd_run(&config, &name, description.as_deref(), mass).await,
        Some(Command::Start {
            name,
            description,
            mass,
        }) => cmd_start(&config, &name, description.as_deref(), mass).await,
        Some(Command::Worker) => cmd_worker(&config).await,
        Some(Command::Status { id, format }) => cmd_status(&config, id.as_deref(), format).await,
        Some(Command::Tasks { status }) => cmd_tasks(&config, status).await,
        Some(Command::Resume { stage }) => cmd_resume(&config, stage).await,
        Some(Command::Events { lines }) => cmd_events(&config, lines),
        None => {
            println!("No command given. Try {}", "pd --help".yellow());
            Ok(())
        }
    }
}

fn open_state(config: &Config) -> Result<StateManager> {
    let store_dir = &config.storage.store_dir;
    fs::create_dir_all(store_dir).context("Failed to create store directory")?;
    StateManager::spawn(store_dir).context("Failed to spawn StateManager")
}

/// Pipeline with a live reasoning client and the event journal attached
fn open_pipeline(config: &Config) -> Result<Pipeline> {
    config.validate()?;
    let state = open_state(config)?;
    let llm = create_client(&config.llm).context("Failed to create reasoning client")?;

    let events = EventBus::default();
    let journal = EventLogger::open(config.storage.store_dir.join(JOURNAL_FILE))?;
    spawn_event_logger(&events, journal);

    Ok(Pipeline::with_events(config.clone(), state, llm, events))
}

/// Start a product and drain the queue
async fn cmd_run(config: &Config, name: &str, description: Option<&str>, mass: Option<f64>) -> Result<()> {
    let pipeline = open_pipeline(config)?;
    let product = pipeline.start(name, description, mass).await?;
    println!("{} {} ({})", "Started".green(), product.name.bold(), product.id.dimmed());

    let stats = pipeline.run_until_idle().await?;
    println!(
        "Processed {} tasks: {} succeeded, {} skipped, {} requeued, {} failed",
        stats.processed(),
        stats.succeeded,
        stats.skipped,
        stats.requeued,
        stats.failed
    );

    let tree = pipeline.status(&product.id).await?;
    print_tree(&tree, 0);
    pipeline.state().shutdown().await?;
    Ok(())
}

async fn cmd_start(config: &Config, name: &str, description: Option<&str>, mass: Option<f64>) -> Result<()> {
    let pipeline = open_pipeline(config)?;
    let product = pipeline.start(name, description, mass).await?;
    println!("{} {} ({})", "Queued".green(), product.name.bold(), product.id.dimmed());
    pipeline.state().shutdown().await?;
    Ok(())
}

/// Drain the queue until Ctrl+C
async fn cmd_worker(config: &Config) -> Result<()> {
    let pipeline = open_pipeline(config)?;
    let worker = pipeline.worker();
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, stopping worker");
            let _ = shutdown_tx.send(()).await;
        }
    });

    println!("Worker running (Ctrl+C to stop)");
    let stats = worker.run(shutdown_rx).await?;
    println!("Processed {} tasks ({} failed)", stats.processed(), stats.failed);
    pipeline.state().shutdown().await?;
    Ok(())
}

async fn cmd_status(config: &Config, id: Option<&str>, format: OutputFormat) -> Result<()> {
    let state = open_state(config)?;

    let Some(id) = id else {
        let products = state.list_entities(EntityKind::Product).await?;
        if products.is_empty() {
            println!("{}", "No products yet.".dimmed());
        }
        for product in &products {
            println!(
                "{:<28} {:<32} {:>12.3} kg CO2e  {}",
                product.id.dimmed(),
                product.name,
                product.estimated_cf,
                lifecycle_label(product.lifecycle)
            );
        }
        state.shutdown().await?;
        return Ok(());
    };

    // Status only reads, so it needs no reasoning client
    let tree = status_tree(&state, id).await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&tree)?),
        OutputFormat::Text => print_tree(&tree, 0),
    }
    state.shutdown().await?;
    Ok(())
}

async fn cmd_tasks(config: &Config, status: Option<TaskStatus>) -> Result<()> {
    let state = open_state(config)?;
    let queue = TaskQueue::new(state.clone(), EventBus::default(), &config.dispatch);

    let tasks = queue.list(status).await?;
    if tasks.is_empty() {
        println!("{}", "No tasks.".dimmed());
    }
    for task in &tasks {
        let label = match task.status {
            TaskStatus::Queued => task.status.to_string().cyan(),
            TaskStatus::Running => task.status.to_string().yellow(),
            TaskStatus::Succeeded => task.status.to_string().green(),
            TaskStatus::Failed => task.status.to_string().red(),
        };
        println!(
            "{:<10} {:<48} attempts={} {}",
            label,
            task.key,
            task.attempts,
            task.last_error.as_deref().unwrap_or("").dimmed()
        );
    }
    state.shutdown().await?;
    Ok(())
}

async fn cmd_resume(config: &Config, stage: Option<StageName>) -> Result<()> {
    let state = open_state(config)?;
    let queue = TaskQueue::new(state.clone(), EventBus::default(), &config.dispatch);
    let resumed = queue.resume_failed(stage).await?;
    println!("Requeued {} failed tasks", resumed);
    state.shutdown().await?;
    Ok(())
}

fn cmd_events(config: &Config, lines: usize) -> Result<()> {
    let path: PathBuf = config.storage.store_dir.join(JOURNAL_FILE);
    if !path.exists() {
        println!("No event journal at: {}", path.display());
        return Ok(());
    }
    let entries = read_journal(&path)?;
    let start = entries.len().saturating_sub(lines);
    for entry in &entries[start..] {
        let entity = entry.event.entity().map(|e| e.to_string()).unwrap_or_default();
        println!(
            "{} {:<16} {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            entry.event.event_type().cyan(),
            entity
        );
    }
    Ok(())
}

fn lifecycle_label(lifecycle: Lifecycle) -> colored::ColoredString {
    match lifecycle {
        Lifecycle::Done => lifecycle.to_string().green(),
        Lifecycle::AwaitingChildren => lifecycle.to_string().yellow(),
        Lifecycle::Created | Lifecycle::Processing => lifecycle.to_string().cyan(),
    }
}

fn stage_summary(entity: &Entity) -> String {
    StageName::ALL
        .iter()
        .filter_map(|stage| match entity.stage_status(*stage) {
            StageStatus::Done => Some(stage.as_str().to_string()),
            StageStatus::Degraded => Some(format!("{}!", stage.as_str())),
            StageStatus::Started => Some(format!("{}…", stage.as_str())),
            StageStatus::Pending => None,
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn print_tree(node: &StatusNode, depth: usize) {
    let entity = &node.entity;
    let supplier = entity
        .supplier_name
        .as_deref()
        .map(|s| format!(" [{}]", s))
        .unwrap_or_default();
    println!(
        "{}{}{} {:.3} kg CO2e {} {}",
        "  ".repeat(depth),
        entity.name.bold(),
        supplier,
        entity.estimated_cf,
        lifecycle_label(entity.lifecycle),
        stage_summary(entity).dimmed()
    );
    if depth == 0 && (node.own_total() - entity.estimated_cf).abs() > 1e-6 {
        warn!(
            entity_id = %entity.id,
            aggregate = entity.estimated_cf,
            sum = node.own_total(),
            "Aggregate differs from the sum of node outputs"
        );
    }
    for child in &node.children {
        print_tree(child, depth + 1);
    }
}
