//! # Out-of-process aggregation
//!
//! Web servers that fork workers cannot share an in-memory registry, so
//! every worker writes its updates to a single collector over a unix socket
//! and the scrape handler asks the collector for the rendered registry.
//!
//! - **`protocol`**: the line grammar and the framing of dumps.
//! - **`service`**: the collector itself (one connection at a time).
//! - **`client`**: the worker side, with timeouts on every operation.

pub mod client;
pub mod protocol;
pub mod service;

pub use client::{wait_for_socket, CollectorClient, TransportError};
pub use protocol::{frame_dump, Command, MetricScope, ProtocolError, Update, SENTINEL};
pub use service::{serve_connection, CollectorService, ServiceError, Session, Step};
