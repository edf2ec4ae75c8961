//! CLI entry point for reframe
//!
//! Loads configuration, runs startup checks, then drives the batch run until
//! it finishes or Ctrl-C requests a stop.

use clap::Parser;
use reframe::config::ConfigError;
use reframe::{
    run_startup_checks, run_status_server, BuiltinPlans, BuiltinTemplates, CommandTranscriber,
    Config, Orchestrator, PlanCatalog,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Batch video transcoder with GPU-aware worker scheduling
#[derive(Parser, Debug)]
#[command(name = "reframe")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Input directory to scan (repeatable); replaces the configured list
    #[arg(short, long = "dir")]
    dirs: Vec<PathBuf>,

    /// Plan id to apply (repeatable); replaces the configured selection
    #[arg(short, long = "plan")]
    plans: Vec<u32>,

    /// Output directory
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Worker pool size (0 = one per CPU)
    #[arg(short, long)]
    workers: Option<u32>,

    /// Keep rescanning until no input remains
    #[arg(long = "loop", conflicts_with = "once")]
    loop_mode: bool,

    /// Run a single pass even if loop mode is configured
    #[arg(long)]
    once: bool,

    /// Delete each source after its outputs are verified
    #[arg(long)]
    delete_source: bool,

    /// Never use GPU encoding
    #[arg(long)]
    no_gpu: bool,

    /// Skip startup checks (encoder, directories, templates)
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if !self.dirs.is_empty() {
            config.input.directories = self.dirs.clone();
        }
        if !self.plans.is_empty() {
            config.plans.selected = self.plans.clone();
        }
        if let Some(output) = &self.output {
            config.output.directory = output.clone();
        }
        if let Some(workers) = self.workers {
            config.pipeline.workers = workers;
        }
        if self.loop_mode {
            config.pipeline.loop_mode = true;
        }
        if self.once {
            config.pipeline.loop_mode = false;
        }
        if self.delete_source {
            config.pipeline.delete_source = true;
        }
        if self.no_gpu {
            config.pipeline.use_gpu = false;
        }
    }
}

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("reframe=info,info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(false))
            .with(env_filter)
            .init();
    }
}

/// A missing file at the default path means "defaults plus environment".
fn load_config(args: &Args) -> Result<Config, ConfigError> {
    if args.config.exists() {
        return Config::load(&args.config);
    }
    let mut config = Config::default();
    config.apply_env_overrides();
    warn!(path = %args.config.display(), "Config file not found, using defaults");
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();

    let mut config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    args.apply(&mut config);

    let catalog = match PlanCatalog::fetch(&BuiltinPlans).await {
        Ok(catalog) => {
            info!(plans = catalog.len(), "Plans loaded");
            catalog
        }
        Err(e) => {
            error!("Failed to load plans: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let templates = Arc::new(BuiltinTemplates::with_program(&config.encoder.program));

    if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
    } else if let Err(e) = run_startup_checks(&config, &catalog, templates.as_ref()).await {
        error!("Startup check failed: {}", e);
        return ExitCode::FAILURE;
    }

    let transcriber = Arc::new(CommandTranscriber::new(
        config.encoder.program.clone(),
        config.transcription.clone(),
    ));
    let status_server = config.status_server.clone();
    let orchestrator = match Orchestrator::new(config, catalog, templates, transcriber) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!("Failed to initialize: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal, finishing running jobs");
                cancel.cancel();
            }
        });
    }

    let server_shutdown = CancellationToken::new();
    let server = status_server.enabled.then(|| {
        let status = orchestrator.status();
        let shutdown = server_shutdown.clone();
        let bind = status_server.bind.clone();
        tokio::spawn(async move {
            if let Err(e) = run_status_server(status, &bind, shutdown).await {
                error!("Status server error: {}", e);
            }
        })
    });

    let result = orchestrator.run(cancel).await;

    server_shutdown.cancel();
    if let Some(server) = server {
        if let Err(e) = server.await {
            warn!(error = %e, "Status server stopped abnormally");
        }
    }

    match result {
        Ok(report) => {
            println!("{}", report.summary_line());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Run failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
