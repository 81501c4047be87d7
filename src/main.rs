//! netverify CLI - concurrent network verification runner.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use netverify::config::{self, Config};
use netverify::discovery::{self, Categorized};
use netverify::orchestrator::{Orchestrator, RunSummary};
use netverify::transport::{ShellCheckRunner, ShellTransport};

#[derive(Parser)]
#[command(name = "netverify")]
#[command(about = "Concurrent network verification runner", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "netverify.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run verification checks
    Run {
        /// Override the output directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Retain command executions only for failed units
        #[arg(long)]
        failed_only: bool,

        /// Fail on uncategorizable check files instead of defaulting to API
        #[arg(long)]
        strict: bool,

        /// Override the whole-run deadline in seconds
        #[arg(long)]
        run_timeout: Option<u64>,
    },

    /// Discover check files without running them
    Collect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            output,
            failed_only,
            strict,
            run_timeout,
        } => run_checks(&cli.config, output, failed_only, strict, run_timeout).await,
        Commands::Collect { format } => collect_checks(&cli.config, &format),
        Commands::Validate => validate_config(&cli.config),
        Commands::Init => init_config(),
    }
}

fn discover_units(config: &Config, strict: bool) -> Result<Categorized> {
    let mut paths = Vec::new();
    for root in &config.discovery.paths {
        if !root.exists() {
            warn!("Check path '{}' does not exist, skipping", root.display());
            continue;
        }
        paths.extend(discovery::discover(root)?);
    }
    Ok(discovery::categorize(&paths, strict)?)
}

async fn run_checks(
    config_path: &Path,
    output_override: Option<PathBuf>,
    failed_only: bool,
    strict: bool,
    run_timeout: Option<u64>,
) -> Result<()> {
    // Load configuration
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    // Apply overrides
    if let Some(output) = output_override {
        config.report.output_dir = output;
    }
    if failed_only {
        config.report.failed_only = true;
    }
    if let Some(secs) = run_timeout {
        config.runner.run_timeout_secs = Some(secs);
    }

    info!("Loaded configuration from {}", config_path.display());

    let split = discover_units(&config, strict || config.discovery.strict)?;
    info!(
        "Discovered {} units: {} api, {} device-to-device",
        split.len(),
        split.api.len(),
        split.d2d.len()
    );
    let units = split.into_units();

    let transport = ShellTransport::new(&config.transport.connector)
        .with_timeout(std::time::Duration::from_secs(config.transport.timeout_secs));
    let transport = match &config.transport.working_dir {
        Some(dir) => transport.with_working_dir(dir.clone()),
        None => transport,
    };
    let runner = match &config.transport.working_dir {
        Some(dir) => {
            ShellCheckRunner::new(&config.transport.check_command).with_working_dir(dir.clone())
        }
        None => ShellCheckRunner::new(&config.transport.check_command),
    };

    let orchestrator = Orchestrator::new(config, transport, runner);

    // Ctrl-C cancels in-flight units; they record a `cancelled` status.
    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let summary = orchestrator.run(&units).await?;
    print_summary(&summary);
    std::process::exit(summary.exit_code());
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!(
        "{}",
        style(format!(
            "Run finished in {:.1}s",
            summary.duration.as_secs_f64()
        ))
        .bold()
    );
    println!("  {} {}", style(summary.passed).green(), "passed");
    println!("  {} {}", style(summary.failed).red(), "failed");
    println!("  {} {}", style(summary.skipped).yellow(), "skipped");
    println!("  {} {}", style(summary.errored).red(), "errored");
    if summary.cancelled > 0 {
        println!("  {} {}", style(summary.cancelled).red(), "cancelled");
    }
    if summary.not_run > 0 {
        println!(
            "  {} {}",
            style(summary.not_run).red(),
            "units produced no results"
        );
    }
    if summary.orphaned_commands > 0 {
        println!(
            "  {} {}",
            style(summary.orphaned_commands).yellow(),
            "orphaned command records"
        );
    }
}

fn collect_checks(config_path: &Path, format: &str) -> Result<()> {
    let config = config::load_config(config_path)?;
    let split = discover_units(&config, config.discovery.strict)?;

    match format {
        "json" => {
            let units = split.into_units();
            let json = serde_json::to_string_pretty(&units)?;
            println!("{}", json);
        }
        _ => {
            println!("Discovered {} units:", split.len());
            for unit in &split.api {
                println!("  [api] {} ({})", unit.path.display(), unit.controller);
            }
            for unit in &split.d2d {
                println!("  [d2d] {} ({})", unit.path.display(), unit.controller);
            }
            if !split.fallbacks.is_empty() {
                println!();
                println!("{} uncategorized (defaulted to api):", split.fallbacks.len());
                for path in &split.fallbacks {
                    println!("  {}", path.display());
                }
            }
        }
    }

    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  API concurrency: {}", config.runner.max_api_concurrency);
            println!(
                "  Device concurrency: {}",
                config.runner.max_device_concurrency
            );
            println!("  Check timeout: {}s", config.runner.check_timeout_secs);
            println!("  Session TTL: {}s", config.auth.ttl_secs);
            println!("  Pool size per identity: {}", config.pool.max_per_identity);
            println!("  Output directory: {}", config.report.output_dir.display());
            println!("  Failed-only streaming: {}", config.report.failed_only);
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

fn init_config() -> Result<()> {
    let path = PathBuf::from("netverify.toml");
    if path.exists() {
        eprintln!("netverify.toml already exists. Remove it first or edit manually.");
        std::process::exit(1);
    }

    std::fs::write(&path, config::example_config())?;
    println!("Created netverify.toml");
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  netverify run");

    Ok(())
}
