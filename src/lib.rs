/// promstatus - request and worker metrics for web servers
///
/// Labels request metrics with a configurable format mini-language, folds
/// them either into an in-process registry or into a collector service over
/// a unix socket, and serves the result to Prometheus.
pub mod app;
pub mod cli;
pub mod collector;
pub mod config;
pub mod exporter;
pub mod format;
pub mod module;
pub mod request;
pub mod scope;
pub mod scoreboard;
pub mod task_manager;

pub use app::{check_formats, App, AppBuilder};
pub use format::{compile, CompiledFormat, ExtractorRegistry, FormatError};
pub use module::{MetricsBackend, StatusModule};
pub use request::Request;
