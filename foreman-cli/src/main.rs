//! Foreman CLI - run supervisors and send them commands

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use foreman_core::prelude::*;
use foreman_supervisor::Supervisor;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(about = "Queue worker supervisor", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to foreman.toml plus FOREMAN_* variables)
    #[arg(short, long, global = true, env = "FOREMAN_CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a configured supervisor in the foreground
    Supervise {
        /// Supervisor name
        name: String,
        /// Terminate when this process is no longer the parent
        #[arg(long)]
        parent: Option<u32>,
    },
    /// Distribute N processes evenly over a supervisor's pools
    Scale {
        /// Supervisor name
        name: String,
        /// Total process count
        processes: usize,
    },
    /// Set process counts for individual queues
    Balance {
        /// Supervisor name
        name: String,
        /// Targets as QUEUE=N
        #[arg(required = true, value_parser = parse_queue_target)]
        targets: Vec<(String, usize)>,
    },
    /// Pause a supervisor's workers
    Pause {
        /// Supervisor name
        name: String,
    },
    /// Continue a paused supervisor
    Continue {
        /// Supervisor name
        name: String,
    },
    /// Restart a supervisor's workers
    Restart {
        /// Supervisor name
        name: String,
    },
    /// Drain a supervisor and stop it
    Terminate {
        /// Supervisor name
        name: String,
        /// Exit status for the supervisor process
        #[arg(long, default_value_t = 0)]
        status: i32,
    },
    /// List running supervisors
    List,
    /// Show one supervisor's record
    Status {
        /// Supervisor name
        name: String,
    },
    /// Version information
    Version,
}

fn parse_queue_target(s: &str) -> std::result::Result<(String, usize), String> {
    let (queue, processes) = s
        .split_once('=')
        .ok_or_else(|| format!("expected QUEUE=N, got {}", s))?;
    let processes = processes
        .parse()
        .map_err(|e| format!("invalid process count in {}: {}", s, e))?;
    Ok((queue.to_string(), processes))
}

fn load_config(path: Option<&PathBuf>) -> Result<ForemanConfig> {
    let config = match path {
        Some(path) => ForemanConfig::from_file(path),
        None => ForemanConfig::load(),
    };
    config.context("Failed to load configuration")
}

async fn send(store: &RedisStore, command: Command) -> Result<()> {
    let kind = command.kind.name();
    let supervisor = command.supervisor.clone();
    store.command_queue().push(command).await?;
    println!("Sent {} to {}", kind, supervisor);
    Ok(())
}

async fn supervise(config: &ForemanConfig, name: &str, parent: Option<u32>) -> Result<i32> {
    let mut options = config.supervisor(name)?;
    if parent.is_some() {
        options.parent_id = parent;
    }

    let store = RedisStore::connect(&config.store.url, &config.store.prefix).await?;
    let supervisor = Supervisor::builder(options)
        .command_queue(Arc::new(store.command_queue()))
        .repository(Arc::new(store.repository()))
        .metrics(Arc::new(store.metrics()))
        .build()
        .await?;

    Ok(supervisor.monitor().await?)
}

async fn list(store: &RedisStore) -> Result<()> {
    let repository = store.repository();
    repository.flush_expired(Duration::from_secs(30)).await?;

    let names = repository.names().await?;
    if names.is_empty() {
        println!("No supervisors running");
        return Ok(());
    }

    println!("{:<30} {:<10} {:>8} {:>10}", "NAME", "STATUS", "PID", "PROCESSES");
    for name in names {
        if let Some(record) = repository.find(&name).await? {
            println!(
                "{:<30} {:<10} {:>8} {:>10}",
                record.name,
                record.status.to_string(),
                record.pid,
                record.total_processes()
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("foreman {}", env!("CARGO_PKG_VERSION"));
        println!("foreman-core {}", foreman_core::VERSION);
        return Ok(());
    }

    let config = load_config(cli.config.as_ref())?;

    if let Commands::Supervise { name, parent } = &cli.command {
        let status = supervise(&config, name, *parent).await?;
        std::process::exit(status);
    }

    let store = RedisStore::connect(&config.store.url, &config.store.prefix)
        .await
        .with_context(|| format!("Failed to connect to {}", config.store.url))?;

    match cli.command {
        Commands::Scale { name, processes } => {
            send(&store, Command::scale(name, processes)).await?
        }
        Commands::Balance { name, targets } => {
            let queues: BTreeMap<String, usize> = targets.into_iter().collect();
            send(&store, Command::balance(name, queues)).await?
        }
        Commands::Pause { name } => send(&store, Command::new(name, CommandKind::Pause)).await?,
        Commands::Continue { name } => {
            send(&store, Command::new(name, CommandKind::Continue)).await?
        }
        Commands::Restart { name } => {
            send(&store, Command::new(name, CommandKind::Restart)).await?
        }
        Commands::Terminate { name, status } => {
            send(&store, Command::terminate(name, status)).await?
        }
        Commands::List => list(&store).await?,
        Commands::Status { name } => match store.repository().find(&name).await? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => anyhow::bail!("No supervisor named {} is running", name),
        },
        Commands::Supervise { .. } | Commands::Version => {}
    }

    Ok(())
}
