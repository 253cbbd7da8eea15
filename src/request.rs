//! Request records handed to the label-format engine by the host.
//!
//! A `Request` is read-only from the point of view of this crate. It carries
//! the per-request fields the built-in extractors need, plus links to the
//! redirect source (`previous`) and redirect target (`next`) so the evaluator
//! can resolve the original and the final request of an internal redirect or
//! subrequest chain.

use axum::http::HeaderMap;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The connection a request arrived on.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Address of the TCP peer.
    pub client_addr: SocketAddr,
    /// Address the server accepted the connection on.
    pub local_addr: SocketAddr,
    /// Reverse-resolved host name of the peer, when the host looked it up.
    pub remote_host: Option<String>,
    /// The connection was aborted before the response completed.
    pub aborted: bool,
    /// The host intends to keep the connection alive after this request.
    pub keepalive: bool,
    /// Number of requests already served on this connection.
    pub keepalives: u32,
}

impl Default for Connection {
    fn default() -> Self {
        let unspecified = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        Self {
            client_addr: unspecified,
            local_addr: unspecified,
            remote_host: None,
            aborted: false,
            keepalive: false,
            keepalives: 0,
        }
    }
}

/// The (virtual) server that handled a request.
#[derive(Debug, Clone)]
pub struct ServerRecord {
    /// Configured host name of the virtual host.
    pub hostname: String,
    /// Configured port, `None` when the server listens on the scheme default.
    pub port: Option<u16>,
    /// Report the configured host name instead of the client-supplied one.
    pub use_canonical_name: bool,
    /// Maximum requests per keep-alive connection, 0 for unlimited.
    pub keep_alive_max: u32,
    /// The server speaks TLS.
    pub is_https: bool,
}

impl Default for ServerRecord {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: None,
            use_canonical_name: false,
            keep_alive_max: 100,
            is_https: false,
        }
    }
}

impl ServerRecord {
    /// The port clients are expected to use: the configured one, or the
    /// scheme default.
    pub fn canonical_port(&self) -> u16 {
        match self.port {
            Some(port) if port != 0 => port,
            _ if self.is_https => 443,
            _ => 80,
        }
    }
}

/// One request record of a (possibly redirected) request chain.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub uri: String,
    pub protocol: String,
    /// Final HTTP status, 0 when not yet known.
    pub status: u16,
    pub bytes_sent: u64,
    pub handler: Option<String>,
    /// Authenticated user name.
    pub user: Option<String>,
    /// Host name requested by the client (from the `Host` header).
    pub hostname: Option<String>,
    pub content_type: Option<String>,
    /// Address of the user agent, which may differ from the TCP peer when a
    /// trusted proxy forwarded the request.
    pub useragent_addr: SocketAddr,
    pub headers_in: HeaderMap,
    pub headers_out: HeaderMap,
    /// Variables exported to subprocesses (`%{NAME}e`).
    pub env: HashMap<String, String>,
    pub received_at: Instant,
    pub connection: Arc<Connection>,
    pub server: Arc<ServerRecord>,
    previous: Option<Box<Request>>,
    next: Option<Box<Request>>,
}

impl Request {
    /// Creates a request record on a default connection and server.
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        let connection = Arc::new(Connection::default());
        Self {
            method: method.into(),
            uri: uri.into(),
            protocol: "HTTP/1.1".to_string(),
            status: 0,
            bytes_sent: 0,
            handler: None,
            user: None,
            hostname: None,
            content_type: None,
            useragent_addr: connection.client_addr,
            headers_in: HeaderMap::new(),
            headers_out: HeaderMap::new(),
            env: HashMap::new(),
            received_at: Instant::now(),
            connection,
            server: Arc::new(ServerRecord::default()),
            previous: None,
            next: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_connection(mut self, connection: Arc<Connection>) -> Self {
        self.useragent_addr = connection.client_addr;
        self.connection = connection;
        self
    }

    pub fn with_server(mut self, server: Arc<ServerRecord>) -> Self {
        self.server = server;
        self
    }

    /// Links the request this one was redirected from.
    pub fn with_previous(mut self, previous: Request) -> Self {
        self.previous = Some(Box::new(previous));
        self
    }

    /// Links the request this one was redirected to.
    pub fn with_next(mut self, next: Request) -> Self {
        self.next = Some(Box::new(next));
        self
    }

    pub fn previous(&self) -> Option<&Request> {
        self.previous.as_deref()
    }

    pub fn next(&self) -> Option<&Request> {
        self.next.as_deref()
    }

    /// The head of the redirect chain.
    pub fn original(&self) -> &Request {
        let mut current = self;
        while let Some(previous) = current.previous() {
            current = previous;
        }
        current
    }

    /// The tail of the redirect chain.
    pub fn final_request(&self) -> &Request {
        let mut current = self;
        while let Some(next) = current.next() {
            current = next;
        }
        current
    }

    /// Time since the request was received.
    pub fn elapsed(&self) -> Duration {
        self.received_at.elapsed()
    }
}
