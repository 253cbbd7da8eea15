//! The application wiring, decoupled from the entry point.

use crate::{
    collector::{wait_for_socket, CollectorService},
    config::{CollectorMode, Config},
    exporter::{MetricsRegistry, MetricsServer},
    format::{self, ExtractorRegistry},
    module::{CollectorBackend, InProcessBackend, MetricsBackend, StatusModule},
    scoreboard::{LocalStatus, StatusSource},
    task_manager::TaskManager,
};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, instrument};

/// A running exporter or collector and the tasks it owns.
pub struct App {
    task_manager: TaskManager,
    module: Option<Arc<StatusModule>>,
    http_addr: Option<SocketAddr>,
    collector_path: Option<PathBuf>,
}

impl App {
    pub fn builder(config: Config) -> AppBuilder {
        AppBuilder::new(config)
    }

    /// Address the HTTP endpoint is bound to, if it is enabled.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    /// The request accounting facade. `None` for a standalone collector.
    pub fn module(&self) -> Option<Arc<StatusModule>> {
        self.module.clone()
    }

    /// Socket of the collector this app serves or talks to.
    pub fn collector_path(&self) -> Option<&Path> {
        self.collector_path.as_deref()
    }

    /// Waits for the shutdown signal and then for every task to finish.
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.task_manager.get_shutdown_rx();
        if !*shutdown_rx.borrow() {
            shutdown_rx.changed().await.ok();
        }
        info!("Shutdown signal received. Waiting for tasks to complete...");
        self.task_manager.shutdown().await;
        Ok(())
    }
}

/// Builds an [`App`], with hooks to swap the extractor table and the
/// scoreboard source.
pub struct AppBuilder {
    config: Config,
    extractors: Option<ExtractorRegistry>,
    status_source: Option<Arc<dyn StatusSource>>,
}

impl AppBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            extractors: None,
            status_source: None,
        }
    }

    /// Uses `extractors` instead of the built-in table, e.g. to add custom
    /// directives.
    pub fn extractor_registry(mut self, extractors: ExtractorRegistry) -> Self {
        self.extractors = Some(extractors);
        self
    }

    /// Uses `source` for scoreboard snapshots instead of [`LocalStatus`].
    pub fn status_source(mut self, source: Arc<dyn StatusSource>) -> Self {
        self.status_source = Some(source);
        self
    }

    /// Builds the exporter: the backend chosen by `collector.mode` (starting
    /// the collector when it is ours to spawn), the tick task and the HTTP
    /// endpoint.
    #[instrument(skip_all)]
    pub async fn build(self, shutdown_rx: watch::Receiver<bool>) -> Result<App> {
        let config = self.config;
        let task_manager = TaskManager::new(shutdown_rx);

        let (backend, collector_path): (Arc<dyn MetricsBackend>, Option<PathBuf>) =
            match config.collector.mode {
                CollectorMode::InProcess => {
                    let backend: Arc<dyn MetricsBackend> =
                        Arc::new(InProcessBackend::new(registry(&config)?));
                    (backend, None)
                }
                CollectorMode::Socket => {
                    let path = config.collector.socket_path.clone();
                    if config.collector.spawn {
                        spawn_collector(&config, &task_manager).await?;
                    }
                    wait_for_socket(
                        &path,
                        config.collector.startup_attempts,
                        config.collector.startup_interval(),
                    )
                    .await
                    .context("collector did not start")?;
                    let backend: Arc<dyn MetricsBackend> =
                        Arc::new(CollectorBackend::new(&path, config.collector.timeout()));
                    (backend, Some(path))
                }
            };
        info!(backend = backend.name(), "Metrics backend ready");

        let extractors = self.extractors.unwrap_or_else(ExtractorRegistry::builtin);
        let module = Arc::new(
            StatusModule::new(&config, extractors, backend)
                .context("invalid label format configuration")?,
        );
        let status = self
            .status_source
            .unwrap_or_else(|| Arc::new(LocalStatus::new()) as Arc<dyn StatusSource>);

        let ticker_module = module.clone();
        let ticker_status = status.clone();
        let mut ticker_shutdown = task_manager.get_shutdown_rx();
        let tick_interval = config.tick_interval();
        task_manager.spawn("Ticker", async move {
            let mut interval = tokio::time::interval(tick_interval);
            loop {
                tokio::select! {
                    biased;
                    _ = ticker_shutdown.changed() => break,
                    _ = interval.tick() => {
                        ticker_module.on_periodic_tick(&ticker_status.snapshot()).await;
                    }
                }
            }
            debug!("Ticker stopped");
        });

        let http_addr = if config.http.enabled {
            let listener = TcpListener::bind(config.http.listen_address)
                .await
                .with_context(|| {
                    format!("failed to bind metrics endpoint {}", config.http.listen_address)
                })?;
            let server = MetricsServer::new(
                listener,
                config.http.path.clone(),
                &config.server_name,
                module.clone(),
                status,
                task_manager.get_shutdown_rx(),
            )?;
            let addr = server.local_addr();
            task_manager.spawn("MetricsServer", server.run());
            Some(addr)
        } else {
            None
        };

        Ok(App {
            task_manager,
            module: Some(module),
            http_addr,
            collector_path,
        })
    }

    /// Builds a standalone collector on `collector.socket_path`.
    #[instrument(skip_all)]
    pub async fn build_collector(self, shutdown_rx: watch::Receiver<bool>) -> Result<App> {
        let task_manager = TaskManager::new(shutdown_rx);
        let path = spawn_collector(&self.config, &task_manager).await?;
        Ok(App {
            task_manager,
            module: None,
            http_addr: None,
            collector_path: Some(path),
        })
    }
}

fn registry(config: &Config) -> Result<Arc<MetricsRegistry>> {
    let registry = MetricsRegistry::new(config).context("failed to build the metrics registry")?;
    Ok(Arc::new(registry))
}

async fn spawn_collector(config: &Config, task_manager: &TaskManager) -> Result<PathBuf> {
    let path = config.collector.socket_path.clone();
    let service = CollectorService::bind(&path, registry(config)?, config.collector.timeout())
        .await
        .context("failed to start the collector")?;
    task_manager.spawn("CollectorService", service.run(task_manager.get_shutdown_rx()));
    Ok(path)
}

/// Compiles the global label format and every scope override, returning a
/// line per format. Fails on the first invalid one.
pub fn check_formats(config: &Config, extractors: &ExtractorRegistry) -> Result<Vec<String>> {
    let mut report = Vec::new();
    let formats = std::iter::once(("(global)", config.label_format.as_str())).chain(
        config
            .scopes
            .iter()
            .filter_map(|scope| Some((scope.path.as_str(), scope.label_format.as_deref()?))),
    );
    for (path, source) in formats {
        let compiled = format::compile(source, extractors)
            .with_context(|| format!("invalid label format for {path}: {source:?}"))?;
        let directives = compiled
            .tokens()
            .iter()
            .filter(|token| matches!(token, format::Token::Directive(_)))
            .count();
        report.push(format!("{path}: {source:?} ({directives} directives)"));
    }
    Ok(report)
}
