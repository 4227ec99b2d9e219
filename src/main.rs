//! pkgops - Main entry point

use pkgops::cli::{Cli, Commands};
use pkgops::progress::{JsonLinesSink, LogSink, ProgressSink};
use pkgops::runner::SystemRunner;
use pkgops::{load_operations, process_guard, run_job, JobConfig, RunContext, RunOutcome};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Initialize logging; `RUST_LOG` overrides the default `info` level.
///
/// Logs go to stderr so `--progress-json` output on stdout stays parseable.
fn init_logger() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    init_logger();
    info!("pkgops starting up");

    // Terminates any backend still running if we receive SIGINT/SIGTERM
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("Failed to initialize signal handlers: {}", e);
    }
    // Dropped when main returns, stopping any backend still running
    let _guard = process_guard::ProcessGuard::new();

    let cli = Cli::parse_args();
    debug!("CLI arguments parsed");

    match cli.command {
        Commands::Validate { config } => validate(&config),
        Commands::Run {
            config,
            operations,
            locale,
            online,
            offline: _,
            root,
            progress_json,
        } => run(config, operations, locale, online, root, progress_json).unwrap_or_else(|e| {
            error!("{:#}", e);
            eprintln!("✗ {:#}", e);
            ExitCode::FAILURE
        }),
    }
}

fn validate(path: &Path) -> ExitCode {
    info!("Validating configuration file: {:?}", path);
    let config = match JobConfig::load_from_file(path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration file: {:#}", e);
            eprintln!("✗ Failed to load configuration file: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match config.validate() {
        Ok(()) => {
            println!(
                "✓ Configuration file is valid: {} operation(s) for {}",
                config.operations.len(),
                config.backend
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Configuration validation failed: {:#}", e);
            eprintln!("✗ Configuration validation failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(
    config_path: PathBuf,
    operations_path: Option<PathBuf>,
    locale: String,
    online: bool,
    root: Option<PathBuf>,
    progress_json: bool,
) -> anyhow::Result<ExitCode> {
    let config = JobConfig::load_from_file(&config_path)?;

    let mut ctx = RunContext::new(locale, online);
    if let Some(path) = operations_path {
        ctx = ctx.with_dynamic_operations(load_operations(&path)?);
    }

    let runner = Arc::new(SystemRunner::new(root));
    let sink: Box<dyn ProgressSink> = if progress_json {
        Box::new(JsonLinesSink)
    } else {
        Box::new(LogSink::default())
    };

    match run_job(&config, &ctx, runner, sink) {
        Ok(RunOutcome::Completed { total, completed }) => {
            info!("Done: {} of {} package(s) processed", completed, total);
            Ok(ExitCode::SUCCESS)
        }
        Ok(RunOutcome::Skipped) => {
            info!("Skipped: no internet");
            Ok(ExitCode::SUCCESS)
        }
        Err(failure) => {
            error!("{}", failure);
            eprintln!("✗ {}\n{}", failure.title, failure.message);
            Ok(ExitCode::FAILURE)
        }
    }
}
