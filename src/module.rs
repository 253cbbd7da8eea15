//! The host-facing facade.
//!
//! A host calls [`StatusModule::on_request_complete`] after every response,
//! [`StatusModule::on_periodic_tick`] with scoreboard snapshots and
//! [`StatusModule::on_scrape`] to answer a metrics request. Where updates go
//! is decided by the [`MetricsBackend`]: straight into a registry of this
//! process, or to a collector over its socket.

use crate::collector::protocol::{Command, Update};
use crate::collector::{CollectorClient, TransportError};
use crate::config::Config;
use crate::exporter::{names, qualified, MetricsRegistry};
use crate::format::{self, CompiledFormat, ExtractorRegistry, FormatError};
use crate::request::Request;
use crate::scope::{FormatScopes, ScopeError};
use crate::scoreboard::ServerSnapshot;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum BackendError {
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Destination of metric updates and source of dumps.
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    /// A short name for logs.
    fn name(&self) -> &'static str;

    /// Folds `updates` in arrival order. Updates the registry rejects are
    /// logged and dropped.
    async fn submit(&self, updates: &[Update]) -> Result<(), BackendError>;

    /// The rendered registry.
    async fn scrape(&self) -> Result<String, BackendError>;
}

/// Folds updates into a registry owned by this process.
#[derive(Debug, Clone)]
pub struct InProcessBackend {
    registry: Arc<MetricsRegistry>,
}

impl InProcessBackend {
    pub fn new(registry: Arc<MetricsRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }
}

#[async_trait]
impl MetricsBackend for InProcessBackend {
    fn name(&self) -> &'static str {
        "in_process"
    }

    async fn submit(&self, updates: &[Update]) -> Result<(), BackendError> {
        for update in updates {
            if let Err(e) = self.registry.apply(update) {
                warn!(metric = %update.name, "Dropping update: {}", e);
            }
        }
        Ok(())
    }

    async fn scrape(&self) -> Result<String, BackendError> {
        self.registry.clone().refresh_process_stats_async().await;
        Ok(self.registry.render())
    }
}

/// Sends updates to a collector, one short-lived connection per call.
#[derive(Debug, Clone)]
pub struct CollectorBackend {
    path: PathBuf,
    timeout: Duration,
}

impl CollectorBackend {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    /// Sends `payload`, reconnecting once if the first attempt fails.
    async fn send_with_retry(
        &self,
        client: &mut CollectorClient,
        payload: &str,
    ) -> Result<(), TransportError> {
        match client.send(payload).await {
            Ok(()) => Ok(()),
            Err(first) => {
                debug!("Collector send failed, reconnecting once: {}", first);
                client.send(payload).await
            }
        }
    }
}

#[async_trait]
impl MetricsBackend for CollectorBackend {
    fn name(&self) -> &'static str {
        "socket"
    }

    async fn submit(&self, updates: &[Update]) -> Result<(), BackendError> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut batch: String = updates.iter().map(Update::encode).collect();
        // An empty line ends the batch.
        batch.push('\n');

        let mut client = CollectorClient::new(&self.path, self.timeout);
        let result = self.send_with_retry(&mut client, &batch).await;
        client.close().await;
        result.map_err(BackendError::from)
    }

    async fn scrape(&self) -> Result<String, BackendError> {
        let mut client = CollectorClient::new(&self.path, self.timeout);
        let result = match self
            .send_with_retry(&mut client, &Command::Metrics.encode())
            .await
        {
            Ok(()) => client.receive_until_sentinel().await,
            Err(e) => Err(e),
        };
        client.close().await;
        result.map_err(BackendError::from)
    }
}

/// The request accounting entry points.
pub struct StatusModule {
    extractors: ExtractorRegistry,
    scopes: FormatScopes,
    namespace: String,
    backend: Arc<dyn MetricsBackend>,
}

impl std::fmt::Debug for StatusModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusModule")
            .field("namespace", &self.namespace)
            .field("backend", &self.backend.name())
            .finish_non_exhaustive()
    }
}

impl StatusModule {
    /// Compiles the configured label formats and wires the backend.
    pub fn new(
        config: &Config,
        extractors: ExtractorRegistry,
        backend: Arc<dyn MetricsBackend>,
    ) -> Result<Self, ScopeError> {
        let scopes = FormatScopes::build(
            &config.label_format,
            config.enabled,
            &config.scopes,
            &extractors,
        )?;
        Ok(Self {
            extractors,
            scopes,
            namespace: config.namespace.clone(),
            backend,
        })
    }

    pub fn compile_format(&self, source: &str) -> Result<CompiledFormat, FormatError> {
        format::compile(source, &self.extractors)
    }

    pub fn scopes(&self) -> &FormatScopes {
        &self.scopes
    }

    pub fn backend(&self) -> &Arc<dyn MetricsBackend> {
        &self.backend
    }

    /// The updates accounting `request`, or `None` when its scope is
    /// disabled.
    pub fn request_updates(&self, request: &Request) -> Option<Vec<Update>> {
        let final_request = request.final_request();
        let scope = self.scopes.resolve(&final_request.uri);
        if !scope.enabled {
            return None;
        }
        let labels: Vec<String> = scope
            .format
            .evaluate(request)
            .split(';')
            .map(str::to_string)
            .collect();
        let elapsed = request.original().elapsed().as_secs_f64();

        Some(vec![
            Update::request(qualified(&self.namespace, names::REQUESTS_TOTAL), 1.0, labels.clone()),
            Update::request(qualified(&self.namespace, names::RESPONSE_TIME), elapsed, labels.clone()),
            Update::request(
                qualified(&self.namespace, names::RESPONSE_SIZE),
                final_request.bytes_sent as f64,
                labels,
            ),
        ])
    }

    /// Accounts a finished request. Failures are logged, never returned.
    pub async fn on_request_complete(&self, request: &Request) {
        let Some(updates) = self.request_updates(request) else {
            return;
        };
        if let Err(e) = self.backend.submit(&updates).await {
            warn!(backend = self.backend.name(), "Failed to account request: {}", e);
        }
    }

    /// Folds a scoreboard snapshot. Failures are logged.
    pub async fn on_periodic_tick(&self, snapshot: &ServerSnapshot) {
        let updates = snapshot.updates(&self.namespace);
        if let Err(e) = self.backend.submit(&updates).await {
            warn!(backend = self.backend.name(), "Failed to submit server metrics: {}", e);
        }
    }

    pub async fn on_scrape(&self) -> Result<String, BackendError> {
        self.backend.scrape().await
    }
}
