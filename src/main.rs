//! promstatus - request and worker metrics for web servers, exposed for
//! Prometheus.

use anyhow::{Context, Result};
use clap::Parser;
use promstatus::{
    app::{check_formats, App},
    cli::{Cli, Command},
    config::{CollectorMode, Config},
    format::ExtractorRegistry,
};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli).context("failed to load configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command() {
        Command::Check => {
            for line in check_formats(&config, &ExtractorRegistry::builtin())? {
                println!("{line}");
            }
            Ok(())
        }
        command => run(config, command).await,
    }
}

async fn run(config: Config, command: Command) -> Result<()> {
    info!("promstatus {} starting up...", env!("CARGO_PKG_VERSION"));
    info!("-------------------- Configuration --------------------");
    info!("Namespace: {}", config.namespace);
    info!("Label Format: {}", config.label_format);
    info!("Label Names: {}", config.label_names.join(";"));
    info!("Collector Mode: {:?}", config.collector.mode);
    if command == Command::Collector || config.collector.mode == CollectorMode::Socket {
        info!("Collector Socket: {}", config.collector.socket_path.display());
    }
    if config.http.enabled && command == Command::Serve {
        info!("HTTP Endpoint: {}{}", config.http.listen_address, config.http.path);
    }
    info!("-------------------------------------------------------");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let grace = config.reload_grace();
    let builder = App::builder(config);
    let app = match command {
        Command::Collector => builder.build_collector(shutdown_rx).await?,
        _ => builder.build(shutdown_rx).await?,
    };

    tokio::spawn(async move {
        wait_for_signal(grace).await;
        let _ = shutdown_tx.send(true);
    });

    app.run().await?;
    info!("promstatus shut down.");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM at once, and on SIGHUP after the reload
/// grace period.
async fn wait_for_signal(grace: Duration) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut terminate, mut hangup) =
        match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
            (Ok(terminate), Ok(hangup)) => (terminate, hangup),
            _ => {
                warn!("Failed to install signal handlers, only ctrl-c will stop the process");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received ctrl-c, shutting down."),
        _ = terminate.recv() => info!("Received SIGTERM, shutting down."),
        _ = hangup.recv() => {
            info!(grace_seconds = grace.as_secs(), "Received SIGHUP, serving out the grace period.");
            tokio::time::sleep(grace).await;
        }
    }
}
