#![allow(dead_code)]

use anyhow::Result;
use promstatus::{
    app::AppBuilder,
    config::{CollectorMode, Config},
    module::StatusModule,
    scoreboard::StatusSource,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::{sync::watch, task::JoinHandle, time::timeout};

pub struct TestApp {
    pub shutdown_tx: watch::Sender<bool>,
    app_handle: Option<JoinHandle<Result<()>>>,
    http_addr: Option<SocketAddr>,
    collector_path: Option<PathBuf>,
    module: Option<Arc<StatusModule>>,
    _dir: Option<TempDir>,
}

impl TestApp {
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
            .expect("the HTTP endpoint must be enabled to get its address")
    }

    pub fn metrics_url(&self) -> String {
        format!("http://{}/metrics", self.http_addr())
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.http_addr(), path)
    }

    pub fn collector_path(&self) -> &Path {
        self.collector_path
            .as_deref()
            .expect("the app has no collector socket")
    }

    pub fn module(&self) -> Arc<StatusModule> {
        self.module.clone().expect("a standalone collector has no module")
    }

    pub async fn shutdown(self, timeout_duration: Duration) -> Result<()> {
        self.shutdown_tx
            .send(true)
            .expect("Failed to send shutdown signal");

        if let Some(handle) = self.app_handle {
            match timeout(timeout_duration, handle).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(anyhow::anyhow!("App failed to shut down within the timeout")),
            }
        } else {
            Ok(())
        }
    }
}

pub struct TestAppBuilder {
    pub config: Config,
    dir: TempDir,
    status_source: Option<Arc<dyn StatusSource>>,
}

impl TestAppBuilder {
    /// In-process mode, HTTP on an ephemeral port, the collector socket in a
    /// private temporary directory and no process statistics.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create a temporary directory");
        let mut config = Config::default();
        config.http.listen_address = "127.0.0.1:0".parse().unwrap();
        config.process.enabled = false;
        config.collector.socket_path = dir.path().join("collector.sock");
        config.collector.timeout_ms = 500;
        config.tick_interval_seconds = 1;
        Self {
            config,
            dir,
            status_source: None,
        }
    }

    /// Routes updates through a collector spawned by the app.
    pub fn socket_mode(mut self) -> Self {
        self.config.collector.mode = CollectorMode::Socket;
        self.config.collector.spawn = true;
        self
    }

    /// Talks to a collector at `path` that someone else runs.
    pub fn external_collector(mut self, path: &Path) -> Self {
        self.config.collector.mode = CollectorMode::Socket;
        self.config.collector.spawn = false;
        self.config.collector.socket_path = path.to_path_buf();
        self
    }

    pub fn with_label_format(mut self, format: &str) -> Self {
        self.config.label_format = format.to_string();
        self
    }

    pub fn with_status_source(mut self, source: Arc<dyn StatusSource>) -> Self {
        self.status_source = Some(source);
        self
    }

    pub fn socket_path(&self) -> PathBuf {
        self.config.collector.socket_path.clone()
    }

    pub async fn build(self) -> Result<TestApp> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut builder = AppBuilder::new(self.config);
        if let Some(source) = self.status_source {
            builder = builder.status_source(source);
        }
        let app = builder.build(shutdown_rx).await?;
        Ok(Self::start(app, shutdown_tx, self.dir))
    }

    pub async fn build_collector(self) -> Result<TestApp> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let app = AppBuilder::new(self.config)
            .build_collector(shutdown_rx)
            .await?;
        Ok(Self::start(app, shutdown_tx, self.dir))
    }

    fn start(app: promstatus::App, shutdown_tx: watch::Sender<bool>, dir: TempDir) -> TestApp {
        let http_addr = app.http_addr();
        let collector_path = app.collector_path().map(Path::to_path_buf);
        let module = app.module();
        let app_handle = tokio::spawn(app.run());
        TestApp {
            shutdown_tx,
            app_handle: Some(app_handle),
            http_addr,
            collector_path,
            module,
            _dir: Some(dir),
        }
    }
}

impl Default for TestAppBuilder {
    fn default() -> Self {
        Self::new()
    }
}
