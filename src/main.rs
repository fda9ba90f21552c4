use anyhow::Result;
use clap::{Parser, Subcommand};
use padserve::logging::LogLevel;
use padserve::{Orchestrator, ServiceConfig};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[clap(
    author,
    version,
    about = "padserve - workspace and worker orchestration for a code toolchain"
)]
struct Args {
    /// Path to a TOML configuration file
    #[clap(short, long, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the workers and run until interrupted (default)
    Serve,
    /// Print service, toolchain and runtime versions
    Version,
    /// Validate the configuration and print it
    CheckConfig,
}

fn setup_crash_logging() -> PathBuf {
    let crash_log_path = dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("padserve")
        .join("crashes.log");

    if let Some(parent) = crash_log_path.parent() {
        let _ = fs::create_dir_all(parent);
    }

    let log_path_for_hook = crash_log_path.clone();
    std::panic::set_hook(Box::new(move |panic_info| {
        let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f UTC");
        let backtrace = std::backtrace::Backtrace::force_capture();
        let crash_message = format!(
            "\n=== PADSERVE CRASH ===\nTimestamp: {}\nPanic: {}\nBacktrace:\n{}\n======================\n\n",
            timestamp, panic_info, backtrace
        );

        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path_for_hook)
        {
            let _ = file.write_all(crash_message.as_bytes());
            let _ = file.flush();
        }

        eprintln!("{}", crash_message);
    }));

    crash_log_path
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = ServiceConfig::load(args.config.as_deref())?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Version => {
            let versions = &config.versions;
            println!("service:   {}", versions.service);
            println!("toolchain: {}", versions.toolchain);
            println!("runtime:   {}", versions.runtime);
            Ok(())
        }
        Command::CheckConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Serve => serve(config).await,
    }
}

async fn serve(config: ServiceConfig) -> Result<()> {
    let crash_log_path = setup_crash_logging();
    let log_buffer = padserve::logging::init(&config.log_level)?;

    info!("Starting padserve v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Crash logs will be written to: {}",
        crash_log_path.display()
    );

    let orchestrator = Arc::new(Orchestrator::start(config).await?);
    info!(
        "Ready with worker pool generation {}",
        orchestrator.pool_generation().await
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
    }

    info!("Interrupt received, shutting down");
    orchestrator.shutdown().await;

    let problems = log_buffer.get_by_level(LogLevel::Warn);
    if let Some(last) = problems.last() {
        info!(
            "{} warnings or errors logged during this run, last: {}",
            problems.len(),
            last.message
        );
    }
    info!("Shutdown complete");
    Ok(())
}
