mod config;
mod ingest_service;
mod run;

use clap::{Args, Parser};
use config::{Config, LoggingConfig, MetricsConfig};
use run::TransferError;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Args)]
struct ConfigArgs {
    /// Path to the YAML config file
    #[arg(long)]
    config: PathBuf,
}

#[derive(Parser)]
enum CliCommand {
    /// Route incoming samples to the downstream clusters
    Run(ConfigArgs),
    /// Load and validate a config file, then exit
    CheckConfig(ConfigArgs),
}

/// `RUST_LOG` wins over the configured level.
fn init_logging(config: &LoggingConfig) -> Option<sentry::ClientInitGuard> {
    let directive = std::env::var("RUST_LOG").unwrap_or_else(|_| config.level.clone());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

    let guard = config.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .with(filter)
        .init();

    guard
}

fn init_metrics(config: &MetricsConfig) -> Result<(), TransferError> {
    let recorder = metrics_exporter_statsd::StatsdBuilder::from(
        config.statsd_host.as_str(),
        config.statsd_port,
    )
    .build(Some("transfer"))
    .map_err(|e| TransferError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| TransferError::Metrics(e.to_string()))?;

    shared::metrics_defs::describe_all(sender::metrics_defs::ALL_METRICS);
    tracing::info!(
        host = %config.statsd_host,
        port = config.statsd_port,
        "statsd exporter installed"
    );
    Ok(())
}

fn start(path: PathBuf) -> Result<(), TransferError> {
    let config = Config::load(&path)?;
    let _sentry = init_logging(&config.common.logging);

    if let Some(metrics) = &config.common.metrics {
        init_metrics(metrics)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run::run(path, config))
}

fn main() -> ExitCode {
    let cli = CliCommand::parse();

    let result = match cli {
        CliCommand::Run(args) => start(args.config),
        CliCommand::CheckConfig(args) => match Config::load(&args.config) {
            Ok(_) => {
                println!("{}: ok", args.config.display());
                Ok(())
            }
            Err(e) => Err(e.into()),
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "transfer failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
