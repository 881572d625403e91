use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use timeslicer::config::{ProcessRegistry, TimeslicerConfig, load_config};
use timeslicer::domain::JobState;
use timeslicer::scheduler::Scheduler;
use timeslicer::storage;
use timeslicer::transport::MemoryTransport;

mod cli;

use cli::Cli;
use cli::commands::{Commands, GcCommands};

fn setup_logging() -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("timeslicer")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("timeslicer.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn run_application(cli: &Cli, config: &TimeslicerConfig) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Start => handle_start_command(config),
        Commands::Check => handle_check_command(config),
        Commands::Tree { process } => handle_tree_command(process, config),
        Commands::Reprocess { process, timeperiod } => handle_reprocess_command(process, timeperiod, config),
        Commands::Skip { process, timeperiod } => handle_skip_command(process, timeperiod, config),
        Commands::Gc { command } => handle_gc_command(command, config),
    }
}

/// Scheduler over the configured storage, with trees grown up to now
fn open_scheduler(config: &TimeslicerConfig) -> Result<Scheduler> {
    let storage = storage::open(&config.storage).context("Failed to open storage")?;
    let scheduler = Scheduler::new(config, storage, Arc::new(MemoryTransport::new()))
        .context("Failed to construct scheduler")?;
    scheduler.boot(Utc::now()).context("Failed to load timetable")?;
    Ok(scheduler)
}

fn handle_start_command(config: &TimeslicerConfig) -> Result<()> {
    println!("{}", "Starting scheduler...".cyan());
    let scheduler = Arc::new(open_scheduler(config)?);

    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    runtime.block_on(async {
        scheduler.start().context("Failed to start timers")?;
        println!("{} {} handlers", "Running:".green(), scheduler.handlers()?.len());

        tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
        println!("{}", "Shutting down...".cyan());
        scheduler.shutdown().await.context("Failed to stop scheduler")
    })
}

fn handle_check_command(config: &TimeslicerConfig) -> Result<()> {
    let registry = ProcessRegistry::from_config(config).context("Invalid start timeperiod")?;
    println!("{} {}", "Start timeperiod:".bold(), registry.start_timeperiod());

    println!("{}", "Processes:".bold());
    for p in registry.processes() {
        println!(
            "  {} {} {} {} {}",
            p.process_name.green(),
            p.time_qualifier.as_str(),
            p.state_machine,
            p.blocking_type,
            if p.is_on { "on".normal() } else { "off".dimmed() }
        );
    }

    println!("{}", "Trees:".bold());
    for tree in registry.trees() {
        let levels: Vec<&str> = tree.hierarchy.iter().map(|e| e.process_name.as_str()).collect();
        println!("  {} [{}]", tree.tree_name.green(), levels.join(" > "));
        if !tree.dependent_on.is_empty() {
            println!("    depends on: {}", tree.dependent_on.join(", "));
        }
    }

    println!("{}", "Freerun:".bold());
    for entry in registry.freerun_entries() {
        println!("  {} {}", entry.schedulable_name.green(), entry.trigger_frequency);
    }

    if registry.rejected().is_empty() {
        println!("{}", "Configuration OK".green());
        Ok(())
    } else {
        for rejection in registry.rejected() {
            println!("  {} {}: {}", "rejected".red(), rejection.name, rejection.reason);
        }
        eyre::bail!("{} entries rejected", registry.rejected().len())
    }
}

fn handle_tree_command(process: &str, config: &TimeslicerConfig) -> Result<()> {
    let scheduler = open_scheduler(config)?;
    let tree = scheduler
        .timetable()
        .get_tree_for_process(process)
        .with_context(|| format!("No tree for {}", process))?;

    println!("{} {}", "Tree:".bold(), tree.tree_name);
    for node in tree.nodes(process) {
        let state = match node.job.state {
            JobState::Processed => node.job.state.as_str().green(),
            JobState::Skipped => node.job.state.as_str().red(),
            JobState::Noop => node.job.state.as_str().dimmed(),
            _ => node.job.state.as_str().yellow(),
        };
        println!("  {} {} ({} children)", node.timeperiod, state, node.children.len());
    }
    println!(
        "{} {}",
        "Next timeperiod:".bold(),
        scheduler.next_timeperiod(process)?
    );
    Ok(())
}

fn handle_reprocess_command(process: &str, timeperiod: &str, config: &TimeslicerConfig) -> Result<()> {
    let scheduler = open_scheduler(config)?;
    scheduler
        .reprocess_tree_node(process, timeperiod)
        .with_context(|| format!("Failed to reprocess {}@{}", process, timeperiod))?;
    println!("{} {}@{}", "Reprocessing:".yellow(), process, timeperiod);
    Ok(())
}

fn handle_skip_command(process: &str, timeperiod: &str, config: &TimeslicerConfig) -> Result<()> {
    let scheduler = open_scheduler(config)?;
    scheduler
        .skip_tree_node(process, timeperiod)
        .with_context(|| format!("Failed to skip {}@{}", process, timeperiod))?;
    println!("{} {}@{}", "Skipped:".red(), process, timeperiod);
    Ok(())
}

fn handle_gc_command(command: &GcCommands, config: &TimeslicerConfig) -> Result<()> {
    info!("Handling gc command: {:?}", command);
    let scheduler = open_scheduler(config)?;
    let now = Utc::now();
    match command {
        GcCommands::Scan => {
            let stats = scheduler.gc().scan_uow_candidates(now)?;
            println!(
                "{} {} enlisted, {} canceled",
                "Scanned:".cyan(),
                stats.enlisted,
                stats.canceled
            );
        }
        GcCommands::Flush { process } => {
            scheduler.gc().scan_uow_candidates(now)?;
            let flushed = match process {
                Some(p) => scheduler.flush_one(p, now)?,
                None => scheduler.flush_all(now)?,
            };
            println!("{} {} units of work reposted", "Flushed:".cyan(), flushed);
        }
        GcCommands::Queue => {
            scheduler.gc().scan_uow_candidates(now)?;
            for (process, entries) in scheduler.gc_queue()? {
                println!("{}", process.green());
                for entry in entries {
                    println!("  {} release at {}", entry.timeperiod, entry.release_time);
                }
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    // Setup logging first
    setup_logging().context("Failed to setup logging")?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = load_config(cli.config.as_ref()).context("Failed to load configuration")?;

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    run_application(&cli, &config).context("Application failed")?;

    Ok(())
}
