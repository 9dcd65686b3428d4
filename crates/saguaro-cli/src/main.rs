use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use saguaro_config::{find_config_path, load_config, resolve_path, save_config, Config, ModelRef};
use saguaro_core::agent::binding::{api_key_env, resolve_api_key};
use saguaro_core::{
    stdin_lines, FileSnapshotSensor, Kernel, LoopOutcome, LoopReport, MemoryStore,
    ProviderFactory,
};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "saguaro", about = "Proactive cognitive kernel", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proactive loop over stdin lines or a watched file
    Run(RunArgs),
    /// Inspect or reset the memory file
    Memory {
        #[command(subcommand)]
        action: MemoryCommands,
    },
    /// Write a default config and memory file
    Init,
    /// Show configuration, models and memory status
    Status,
}

#[derive(Args)]
struct RunArgs {
    /// Cortex model, as `provider/model` or a bare model name
    #[arg(long)]
    cortex_model: Option<String>,

    /// Neocortex model, as `provider/model` or a bare model name
    #[arg(long)]
    neocortex_model: Option<String>,

    /// Memory file path
    #[arg(short, long)]
    memory: Option<String>,

    /// Watch a file kept up to date by a capture tool instead of reading stdin
    #[arg(short, long)]
    watch: Option<String>,

    /// Polling interval in seconds for --watch
    #[arg(short, long)]
    interval: Option<f64>,
}

#[derive(Subcommand)]
enum MemoryCommands {
    /// Print the memory document
    Show,
    /// Print the resolved memory file path
    Path,
    /// Reset the memory document to empty regions
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let base_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = format!("{base_filter},saguaro_core::kernel=debug");
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(find_config_path);

    match cli.command {
        Commands::Init => run_init(&config_path).await,
        Commands::Status => run_status(&config_path),
        Commands::Memory { action } => {
            let config = load_config(&config_path)?;
            run_memory_command(action, &config).await
        }
        Commands::Run(args) => {
            let mut config = load_config(&config_path)?;
            apply_run_args(&mut config, args);
            run_kernel(config).await
        }
    }
}

fn apply_run_args(config: &mut Config, args: RunArgs) {
    if let Some(id) = args.cortex_model {
        config.models.cortex = ModelRef::parse(&id, &config.models.cortex.provider);
    }
    if let Some(id) = args.neocortex_model {
        config.models.neocortex = ModelRef::parse(&id, &config.models.neocortex.provider);
    }
    if let Some(path) = args.memory {
        config.kernel.memory_path = path;
    }
    if let Some(path) = args.watch {
        config.senses.watch_path = Some(path);
    }
    if let Some(secs) = args.interval {
        config.senses.interval_secs = secs;
    }
}

/// Warn (without failing) about providers whose API key is nowhere to be found.
fn warn_missing_keys(config: &Config) {
    let mut checked: Vec<&str> = Vec::new();
    for model in [&config.models.cortex, &config.models.neocortex] {
        let provider = model.provider.as_str();
        if checked.contains(&provider) {
            continue;
        }
        checked.push(provider);
        if let Some(env_var) = api_key_env(provider) {
            if resolve_api_key(config.providers.get(provider), env_var).is_none() {
                eprintln!("WARNING: {env_var} not found in environment.");
            }
        }
    }
}

async fn run_kernel(config: Config) -> Result<()> {
    let watch = match config.senses.watch_path.as_deref() {
        Some(path) => Some((resolve_path(path), watch_interval(config.senses.interval_secs)?)),
        None => None,
    };
    warn_missing_keys(&config);

    let factory = ProviderFactory::new(config.providers.clone());
    let kernel = match Kernel::new(&config, &factory).await {
        Ok(kernel) => kernel,
        Err(e) => {
            tracing::error!("Initialization failed: {e}");
            eprintln!("Critical error: {e}");
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });

    tracing::info!(
        "Saguaro started. Cortex: {}, Neocortex: {}",
        config.models.cortex,
        config.models.neocortex
    );

    let report = match watch {
        Some((path, interval)) => {
            println!("Saguaro OS online. Watching {}...", path.display());
            let sensor = FileSnapshotSensor::new(path, interval);
            kernel.run_proactive_loop(sensor.stream(), cancel).await?
        }
        None => {
            println!("Saguaro OS online. Reading context from stdin...");
            kernel.run_proactive_loop(stdin_lines(), cancel).await?
        }
    };

    print_report(&report);
    // The stdin reader thread cannot be interrupted; leave without waiting on it.
    std::process::exit(0);
}

/// Polling interval for the file sensor, floored at 100ms.
fn watch_interval(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs.max(0.1))
        .with_context(|| format!("invalid senses.intervalSecs: {secs}"))
}

fn print_report(report: &LoopReport) {
    match report.outcome {
        LoopOutcome::Cancelled => println!("\nSaguaro OS shutting down..."),
        LoopOutcome::Exhausted => println!("Context stream ended."),
    }
    println!(
        "Processed {} observation(s), {} failed.",
        report.ticks_completed + report.ticks_failed,
        report.ticks_failed
    );
    println!("Goodbye.");
}

async fn run_memory_command(action: MemoryCommands, config: &Config) -> Result<()> {
    let path = resolve_path(&config.kernel.memory_path);
    match action {
        MemoryCommands::Path => println!("{}", path.display()),
        MemoryCommands::Show => {
            let store = MemoryStore::open(&path).await?;
            print!("{}", store.read().await);
        }
        MemoryCommands::Clear => {
            let store = MemoryStore::open(&path).await?;
            store.write(&MemoryStore::default_document()).await?;
            println!("Cleared memory: {}", path.display());
        }
    }
    Ok(())
}

async fn run_init(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("Config already exists: {}", config_path.display());
        println!("To reset, delete it and run `saguaro init` again.");
    } else {
        save_config(config_path, &Config::default())?;
        println!("Created config: {}", config_path.display());
    }

    let config = load_config(config_path)?;
    let memory_path = resolve_path(&config.kernel.memory_path);
    if memory_path.exists() {
        println!("Memory file already exists: {}", memory_path.display());
    } else {
        let store = MemoryStore::open(&memory_path).await?;
        store.write(&MemoryStore::default_document()).await?;
        println!("Created memory file: {}", memory_path.display());
    }

    println!();
    println!("Next: set the API key for your provider and run `saguaro run`.");
    Ok(())
}

fn run_status(config_path: &Path) -> Result<()> {
    println!("saguaro status");
    println!();

    if config_path.exists() {
        println!("  Config:    {} (found)", config_path.display());
    } else {
        println!(
            "  Config:    {} (not found, using defaults; run `saguaro init`)",
            config_path.display()
        );
    }
    let config = load_config(config_path)?;

    let memory_path = resolve_path(&config.kernel.memory_path);
    match std::fs::metadata(&memory_path) {
        Ok(meta) => println!(
            "  Memory:    {} ({} bytes)",
            memory_path.display(),
            meta.len()
        ),
        Err(_) => println!("  Memory:    {} (not created yet)", memory_path.display()),
    }
    println!(
        "  Session:   {}:{}:{}",
        config.kernel.app_name, config.kernel.user_id, config.kernel.session_id
    );
    println!();

    println!("  Models:");
    for (tier, model) in [
        ("Cortex", &config.models.cortex),
        ("Neocortex", &config.models.neocortex),
    ] {
        let key_status = match api_key_env(&model.provider) {
            Some(env_var) => {
                if resolve_api_key(config.providers.get(&model.provider), env_var).is_some() {
                    "key configured".to_string()
                } else {
                    format!("no key, set {env_var}")
                }
            }
            None => "no key needed".to_string(),
        };
        println!("    {tier:<10} {model} ({key_status})");
    }
    println!();

    println!("  Senses:");
    match config.senses.watch_path.as_deref() {
        Some(path) => println!(
            "    Watch: {} every {}s",
            resolve_path(path).display(),
            config.senses.interval_secs
        ),
        None => println!("    Watch: (not set, reading stdin)"),
    }

    Ok(())
}
