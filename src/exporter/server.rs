//! # Metrics Server
//!
//! An `axum` server that answers Prometheus scrapes on a single path. Every
//! request it serves, scrapes included, is accounted through the
//! [`StatusModule`] like any other request of the host would be.
//!
//! A scrape first folds a fresh scoreboard snapshot, then asks the backend
//! for the dump. When the backend cannot produce one (collector down, socket
//! timeout) the scrape fails with `503` instead of returning partial data.
//!
//! Finished requests are queued to an accounting loop that runs alongside
//! the listener. On shutdown the loop stops taking new records and folds
//! what is already queued before the server task returns.

use crate::module::StatusModule;
use crate::request::{Connection, Request, ServerRecord};
use crate::scoreboard::StatusSource;
use axum::body::HttpBody;
use axum::extract::{ConnectInfo, MatchedPath, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

/// Content type of the Prometheus text exposition format.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Finished requests waiting to be accounted before senders block.
const ACCOUNTING_QUEUE: usize = 1024;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("metrics path must start with '/': {0:?}")]
    InvalidPath(String),

    #[error("failed to read the listener address: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
struct ServerState {
    module: Arc<StatusModule>,
    status: Arc<dyn StatusSource>,
    server: Arc<ServerRecord>,
    local_addr: SocketAddr,
    accounting: mpsc::Sender<Request>,
}

/// Serves the metrics path until shutdown.
pub struct MetricsServer {
    listener: TcpListener,
    path: String,
    state: ServerState,
    accounting_rx: mpsc::Receiver<Request>,
    shutdown_rx: watch::Receiver<bool>,
}

impl MetricsServer {
    /// Creates the server on an already bound listener. Nothing is served
    /// until [`run`](Self::run) is polled.
    pub fn new(
        listener: TcpListener,
        path: impl Into<String>,
        server_name: &str,
        module: Arc<StatusModule>,
        status: Arc<dyn StatusSource>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self, ServerError> {
        let path = path.into();
        if !path.starts_with('/') {
            return Err(ServerError::InvalidPath(path));
        }
        let local_addr = listener.local_addr()?;
        let server = Arc::new(ServerRecord {
            hostname: server_name.to_string(),
            port: Some(local_addr.port()),
            ..ServerRecord::default()
        });
        let (accounting, accounting_rx) = mpsc::channel(ACCOUNTING_QUEUE);
        Ok(Self {
            listener,
            path,
            state: ServerState {
                module,
                status,
                server,
                local_addr,
                accounting,
            },
            accounting_rx,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.state.local_addr
    }

    /// Returns a future that runs the server until a shutdown signal is
    /// received and every queued request has been accounted.
    pub fn run(self) -> impl Future<Output = ()> {
        let Self {
            listener,
            path,
            state,
            accounting_rx,
            mut shutdown_rx,
        } = self;
        let app = Router::new()
            .route(&path, get(scrape))
            .fallback(not_found)
            .layer(middleware::from_fn_with_state(state.clone(), account))
            .with_state(state.clone());
        info!(addr = %state.local_addr, path = %path, "Metrics server listening");
        let accounting = run_accounting(state.module.clone(), accounting_rx, shutdown_rx.clone());

        let serve = async move {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    trace!("Metrics server received shutdown signal via select.");
                }
                result = axum::serve(
                    listener,
                    app.into_make_service_with_connect_info::<SocketAddr>(),
                ) => {
                    if let Err(e) = result {
                        error!("Metrics server error: {}", e);
                    }
                }
            }
            trace!("Metrics server task finished.");
        };
        async move {
            tokio::join!(serve, accounting);
        }
    }
}

/// Folds queued requests until shutdown, then drains the queue.
async fn run_accounting(
    module: Arc<StatusModule>,
    mut records: mpsc::Receiver<Request>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if !*shutdown_rx.borrow() {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                record = records.recv() => match record {
                    Some(record) => module.on_request_complete(&record).await,
                    None => return,
                },
            }
        }
    }
    records.close();
    let mut drained = 0u64;
    while let Some(record) = records.recv().await {
        module.on_request_complete(&record).await;
        drained += 1;
    }
    debug!(drained, "Request accounting stopped");
}

async fn scrape(State(state): State<ServerState>) -> Response {
    state.module.on_periodic_tick(&state.status.snapshot()).await;
    match state.module.on_scrape().await {
        Ok(body) => ([(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            warn!("Scrape failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("metrics unavailable: {e}"),
            )
                .into_response()
        }
    }
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Accounts every served request once its response is ready.
async fn account(
    State(state): State<ServerState>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let received_at = Instant::now();
    let client_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
        .unwrap_or(state.local_addr);
    let method = request.method().to_string();
    let uri = request.uri().path().to_string();
    let handler = request
        .extensions()
        .get::<MatchedPath>()
        .map(|_| "metrics".to_string());
    let protocol = format!("{:?}", request.version());
    let headers_in = request.headers().clone();

    let response = next.run(request).await;

    let hostname = headers_in
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(|host| host.split(':').next().unwrap_or(host).to_string());
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let connection = Arc::new(Connection {
        client_addr,
        local_addr: state.local_addr,
        ..Connection::default()
    });

    let mut record = Request::new(method, uri)
        .with_status(response.status().as_u16())
        .with_connection(connection)
        .with_server(state.server.clone());
    record.protocol = protocol;
    record.received_at = received_at;
    record.hostname = hostname;
    record.content_type = content_type;
    record.handler = handler;
    record.bytes_sent = response.body().size_hint().exact().unwrap_or(0);
    record.headers_in = headers_in;
    record.headers_out = response.headers().clone();

    if state.accounting.send(record).await.is_err() {
        warn!("Request finished after accounting stopped; not accounted");
    }
    response
}
