//! # Metrics Exporter
//!
//! This module owns the metrics registry that updates are folded into and
//! that scrapes are rendered from.
//!
//! ## Components:
//!
//! - **`MetricsRegistry`**: The metric catalog (server, process and request
//!   metrics under a configurable namespace) on top of a private
//!   `PrometheusRecorder`. Each registry has its own recorder, so several can
//!   live in one process.
//!
//! - **`MetricsServer`**: (Defined in `server.rs`) An `axum`-based web server
//!   that exposes the `/metrics` endpoint for Prometheus to scrape.
//!
//! - **`ProcessCollector`**: (Defined in `system.rs`) Resource usage of the
//!   server process tree. Callers refresh it on the blocking pool with
//!   `refresh_process_stats_async` before rendering; `render` itself never
//!   touches the process table.

pub mod server;
pub mod system;

use crate::collector::protocol::{MetricScope, Update};
use crate::config::Config;
use metrics::{Key, KeyName, Label, Level, Metadata, Recorder, SharedString, Unit};
use metrics_exporter_prometheus::{
    BuildError, Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use system::{ProcessCollector, ProcessTotals};
use thiserror::Error;
use tracing::{debug, warn};

pub use server::{MetricsServer, ServerError};

/// Metric names without the namespace prefix.
pub mod names {
    pub const SERVER_INFO: &str = "server_info";
    pub const SERVER_NAME: &str = "server_name";
    pub const SERVER_UPTIME: &str = "server_uptime_seconds";
    pub const CPU_LOAD: &str = "cpu_load";
    pub const MPM_GENERATION: &str = "server_mpm_generation";
    pub const CONFIG_GENERATION: &str = "server_config_generation";
    pub const WORKERS: &str = "workers";
    pub const WORKERS_SCOREBOARD: &str = "workers_scoreboard";
    pub const PROCESS_COUNTER: &str = "process_counter";
    pub const PROCESS_RSS: &str = "process_total_rss_memory_bytes";
    pub const PROCESS_VIRT: &str = "process_total_virt_memory_bytes";
    pub const PROCESS_IO_READ: &str = "process_total_io_read_bytes";
    pub const PROCESS_IO_WRITE: &str = "process_total_io_write_bytes";
    pub const REQUESTS_TOTAL: &str = "requests_total";
    pub const RESPONSE_TIME: &str = "response_time_seconds";
    pub const RESPONSE_SIZE: &str = "response_size_bytes";
}

/// Joins the namespace and a metric name.
pub fn qualified(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}_{}", namespace, name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        })
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("invalid buckets for {metric}: {source}")]
    InvalidBuckets {
        metric: String,
        #[source]
        source: BuildError,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpdateError {
    #[error("unknown metric {0}")]
    UnknownMetric(String),

    #[error("{name} is a {expected} metric, got a {actual} update")]
    ScopeMismatch {
        name: String,
        expected: MetricScope,
        actual: MetricScope,
    },

    #[error("invalid value {value} for {kind} {name}")]
    InvalidValue {
        name: String,
        kind: MetricKind,
        value: f64,
    },
}

/// One entry of the metric catalog.
#[derive(Debug, Clone)]
pub struct MetricSpec {
    pub name: String,
    pub kind: MetricKind,
    pub scope: MetricScope,
    pub labels: Vec<String>,
    pub help: &'static str,
    pub unit: Option<Unit>,
}

fn metadata() -> Metadata<'static> {
    Metadata::new(module_path!(), Level::INFO, Some(module_path!()))
}

/// The metric catalog over a private Prometheus recorder.
pub struct MetricsRegistry {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
    namespace: String,
    catalog: HashMap<String, MetricSpec>,
    processes: Option<Mutex<ProcessCollector>>,
}

impl fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("namespace", &self.namespace)
            .field("metrics", &self.catalog.len())
            .finish_non_exhaustive()
    }
}

impl MetricsRegistry {
    /// Builds the registry described by `config` and seeds the metrics that
    /// exist before any update arrives.
    pub fn new(config: &Config) -> Result<Self, RegistryError> {
        let namespace = config.namespace.clone();
        let time_name = qualified(&namespace, names::RESPONSE_TIME);
        let size_name = qualified(&namespace, names::RESPONSE_SIZE);

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(Matcher::Full(time_name.clone()), &config.buckets.time)
            .map_err(|source| RegistryError::InvalidBuckets {
                metric: time_name.clone(),
                source,
            })?
            .set_buckets_for_metric(Matcher::Full(size_name.clone()), &config.buckets.size)
            .map_err(|source| RegistryError::InvalidBuckets {
                metric: size_name.clone(),
                source,
            })?;
        let recorder = builder.build_recorder();
        let handle = recorder.handle();

        let processes = config.process.enabled.then(|| {
            Mutex::new(ProcessCollector::new(
                config.process.match_names.clone(),
                config.process.refresh_interval(),
            ))
        });

        let mut registry = Self {
            recorder,
            handle,
            catalog: HashMap::new(),
            namespace,
            processes,
        };
        registry.register_catalog(&config.label_names);
        registry.seed(config);
        Ok(registry)
    }

    fn register_catalog(&mut self, request_labels: &[String]) {
        use MetricKind::{Counter, Gauge, Histogram};
        use MetricScope::{Request, Server};

        let state = vec!["state".to_string()];
        let server: [(&str, MetricKind, Vec<String>, &'static str, Option<Unit>); 13] = [
            (
                names::SERVER_INFO,
                Counter,
                vec!["server_description".to_string(), "mpm".to_string()],
                "information about the apache version",
                None,
            ),
            (
                names::SERVER_NAME,
                Counter,
                vec!["server_name".to_string()],
                "contains the server name",
                None,
            ),
            (names::SERVER_UPTIME, Gauge, vec![], "server uptime in seconds", Some(Unit::Seconds)),
            (names::CPU_LOAD, Gauge, vec![], "CPU Load 1", None),
            (names::MPM_GENERATION, Gauge, vec![], "current mpm generation", None),
            (names::CONFIG_GENERATION, Gauge, vec![], "current config generation", None),
            (
                names::WORKERS,
                Gauge,
                state.clone(),
                "is the total number of apache workers",
                Some(Unit::Count),
            ),
            (
                names::WORKERS_SCOREBOARD,
                Gauge,
                state,
                "is the total number of workers from the scoreboard",
                Some(Unit::Count),
            ),
            (names::PROCESS_COUNTER, Gauge, vec![], "number of apache processes", Some(Unit::Count)),
            (
                names::PROCESS_RSS,
                Gauge,
                vec![],
                "total rss bytes over all apache processes",
                Some(Unit::Bytes),
            ),
            (
                names::PROCESS_VIRT,
                Gauge,
                vec![],
                "total virt bytes over all apache processes",
                Some(Unit::Bytes),
            ),
            (
                names::PROCESS_IO_READ,
                Gauge,
                vec![],
                "total read bytes over all apache processes",
                Some(Unit::Bytes),
            ),
            (
                names::PROCESS_IO_WRITE,
                Gauge,
                vec![],
                "total write bytes over all apache processes",
                Some(Unit::Bytes),
            ),
        ];
        for (name, kind, labels, help, unit) in server {
            self.register(name, kind, Server, labels, help, unit);
        }

        let request: [(&str, MetricKind, &'static str, Option<Unit>); 3] = [
            (names::REQUESTS_TOTAL, Counter, "is the total number of http requests", Some(Unit::Count)),
            (names::RESPONSE_TIME, Histogram, "response time histogram", Some(Unit::Seconds)),
            (names::RESPONSE_SIZE, Histogram, "response size histogram", Some(Unit::Bytes)),
        ];
        for (name, kind, help, unit) in request {
            self.register(name, kind, Request, request_labels.to_vec(), help, unit);
        }
    }

    fn register(
        &mut self,
        name: &str,
        kind: MetricKind,
        scope: MetricScope,
        labels: Vec<String>,
        help: &'static str,
        unit: Option<Unit>,
    ) {
        let full_name = qualified(&self.namespace, name);
        let key_name = KeyName::from(full_name.clone());
        let description = SharedString::from(help);
        match kind {
            MetricKind::Counter => self.recorder.describe_counter(key_name, unit, description),
            MetricKind::Gauge => self.recorder.describe_gauge(key_name, unit, description),
            MetricKind::Histogram => self.recorder.describe_histogram(key_name, unit, description),
        }
        self.catalog.insert(
            full_name.clone(),
            MetricSpec {
                name: full_name,
                kind,
                scope,
                labels,
                help,
                unit,
            },
        );
    }

    /// Values every fresh registry starts with.
    fn seed(&self, config: &Config) {
        let mut seeds = vec![
            Update::server(self.name(names::SERVER_INFO), 1.0)
                .with_labels([config.server_description.as_str(), config.mpm_name.as_str()]),
            Update::server(self.name(names::SERVER_NAME), 1.0)
                .with_labels([config.server_name.as_str()]),
            Update::server(self.name(names::WORKERS), 0.0).with_labels(["ready"]),
            Update::server(self.name(names::WORKERS), 0.0).with_labels(["busy"]),
        ];
        for gauge in [
            names::SERVER_UPTIME,
            names::CPU_LOAD,
            names::MPM_GENERATION,
            names::CONFIG_GENERATION,
            names::PROCESS_COUNTER,
            names::PROCESS_RSS,
            names::PROCESS_VIRT,
            names::PROCESS_IO_READ,
            names::PROCESS_IO_WRITE,
        ] {
            seeds.push(Update::server(self.name(gauge), 0.0));
        }
        for update in &seeds {
            if let Err(e) = self.apply(update) {
                debug!("Failed to seed {}: {}", update.name, e);
            }
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The namespaced name of a catalog metric.
    pub fn name(&self, name: &str) -> String {
        qualified(&self.namespace, name)
    }

    pub fn spec(&self, name: &str) -> Option<&MetricSpec> {
        self.catalog.get(name)
    }

    /// Folds one update into the registry.
    ///
    /// Counters add the value rounded to a whole number, gauges take it and
    /// histograms observe it. Labels are truncated or padded with empty
    /// strings to the metric's label names.
    pub fn apply(&self, update: &Update) -> Result<(), UpdateError> {
        let spec = self
            .catalog
            .get(&update.name)
            .ok_or_else(|| UpdateError::UnknownMetric(update.name.clone()))?;
        if spec.scope != update.scope {
            return Err(UpdateError::ScopeMismatch {
                name: update.name.clone(),
                expected: spec.scope,
                actual: update.scope,
            });
        }
        let invalid = || UpdateError::InvalidValue {
            name: update.name.clone(),
            kind: spec.kind,
            value: update.value,
        };

        let labels: Vec<Label> = spec
            .labels
            .iter()
            .enumerate()
            .map(|(i, label_name)| {
                let value = update.labels.get(i).cloned().unwrap_or_default();
                Label::new(label_name.clone(), value)
            })
            .collect();
        let key = Key::from_parts(spec.name.clone(), labels);

        match spec.kind {
            MetricKind::Counter => {
                if !update.value.is_finite() || update.value < 0.0 {
                    return Err(invalid());
                }
                self.recorder
                    .register_counter(&key, &metadata())
                    .increment(update.value.round() as u64);
            }
            MetricKind::Gauge => {
                if update.value.is_nan() {
                    return Err(invalid());
                }
                self.recorder.register_gauge(&key, &metadata()).set(update.value);
            }
            MetricKind::Histogram => {
                if !update.value.is_finite() {
                    return Err(invalid());
                }
                self.recorder
                    .register_histogram(&key, &metadata())
                    .record(update.value);
            }
        }
        Ok(())
    }

    /// Refreshes stale process statistics.
    pub fn refresh_process_stats(&self) {
        let Some(processes) = &self.processes else {
            return;
        };
        let totals = {
            let mut collector = match processes.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            collector.refresh_if_stale()
        };
        if let Some(totals) = totals {
            self.apply_process_totals(&totals);
        }
    }

    /// Whether process statistics are enabled and due for a refresh.
    pub fn process_stats_stale(&self) -> bool {
        self.processes.as_ref().is_some_and(|processes| match processes.lock() {
            Ok(collector) => collector.is_stale(),
            Err(poisoned) => poisoned.into_inner().is_stale(),
        })
    }

    /// Runs [`refresh_process_stats`](Self::refresh_process_stats) on the
    /// blocking pool when the statistics are stale.
    pub async fn refresh_process_stats_async(self: Arc<Self>) {
        if !self.process_stats_stale() {
            return;
        }
        if let Err(e) = tokio::task::spawn_blocking(move || self.refresh_process_stats()).await {
            warn!("Process statistics refresh failed: {}", e);
        }
    }

    fn apply_process_totals(&self, totals: &ProcessTotals) {
        let values = [
            (names::PROCESS_COUNTER, totals.processes),
            (names::PROCESS_RSS, totals.rss_bytes),
            (names::PROCESS_VIRT, totals.virtual_bytes),
            (names::PROCESS_IO_READ, totals.read_bytes),
            (names::PROCESS_IO_WRITE, totals.written_bytes),
        ];
        for (name, value) in values {
            let update = Update::server(self.name(name), value as f64);
            if let Err(e) = self.apply(&update) {
                debug!("Failed to record {}: {}", update.name, e);
            }
        }
    }

    /// Renders the registry in the Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
