//! Configuration management for promstatus
//!
//! This module defines the main `Config` struct and its sub-structs. It uses
//! the `figment` crate to layer the built-in defaults, a `promstatus.toml`
//! file, `PROMSTATUS_` environment variables and command-line overrides.

use crate::cli::Cli;
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration file read when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "promstatus.toml";

/// The main configuration struct for the application.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    /// The logging level for the application.
    pub log_level: String,
    /// Set to false to disable request accounting everywhere.
    pub enabled: bool,
    /// Prefix of every exported metric name.
    pub namespace: String,
    /// Value of the `server_description` label of `<namespace>_server_info`.
    pub server_description: String,
    /// Value of the `server_name` label of `<namespace>_server_name`.
    pub server_name: String,
    /// Value of the `mpm` label of `<namespace>_server_info`.
    pub mpm_name: String,
    /// Label names of the request metrics, in the order the label format
    /// produces their values. Also accepted as a `;`-separated string.
    #[serde(deserialize_with = "deserialize_label_names")]
    pub label_names: Vec<String>,
    /// Global label format; evaluates to `;`-separated label values.
    pub label_format: String,
    /// Per-path overrides of `label_format` and `enabled`.
    #[serde(default)]
    pub scopes: Vec<ScopeConfig>,
    pub buckets: BucketsConfig,
    pub collector: CollectorConfig,
    pub http: HttpConfig,
    pub process: ProcessConfig,
    /// Seconds between two scoreboard folds.
    pub tick_interval_seconds: u64,
    /// Seconds the old instance keeps serving after a reload signal.
    pub reload_grace_seconds: u64,
}

/// A URI path prefix with its own label format or enabled flag.
///
/// Unset fields are inherited from the nearest configured ancestor path, and
/// from the global settings at the top.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub struct ScopeConfig {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

/// Histogram bucket boundaries.
///
/// Either a TOML array or the `;`-separated form (`"0.1;0.5;1"`) is accepted,
/// so the buckets can be overridden from the environment as well.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct BucketsConfig {
    /// Buckets of `<namespace>_response_time_seconds`.
    #[serde(deserialize_with = "deserialize_buckets")]
    pub time: Vec<f64>,
    /// Buckets of `<namespace>_response_size_bytes`.
    #[serde(deserialize_with = "deserialize_buckets")]
    pub size: Vec<f64>,
}

/// Where updates are folded.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CollectorMode {
    /// Directly into a registry owned by this process.
    InProcess,
    /// Into a collector service listening on `socket_path`.
    Socket,
}

/// Configuration of the aggregation service and its clients.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CollectorConfig {
    pub mode: CollectorMode,
    pub socket_path: PathBuf,
    /// Bound on every connect, read and write, in milliseconds.
    pub timeout_ms: u64,
    /// Run the collector service as a task of `serve` (socket mode only).
    pub spawn: bool,
    /// Socket polls before startup gives up on the collector.
    pub startup_attempts: u32,
    pub startup_interval_ms: u64,
}

/// Configuration of the HTTP `/metrics` endpoint.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct HttpConfig {
    pub enabled: bool,
    pub listen_address: SocketAddr,
    pub path: String,
}

/// Configuration of the server process-tree statistics.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ProcessConfig {
    pub enabled: bool,
    /// Process names that belong to the server. The tree rooted at the first
    /// match is accounted.
    pub match_names: Vec<String>,
    /// Statistics older than this are refreshed before a dump.
    pub refresh_interval_seconds: u64,
}

impl CollectorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn startup_interval(&self) -> Duration {
        Duration::from_millis(self.startup_interval_ms)
    }
}

impl ProcessConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_seconds)
    }
}

/// Default location of the collector socket.
pub fn default_socket_path() -> PathBuf {
    std::env::temp_dir().join(format!("promstatus-{}.sock", std::process::id()))
}

/// Parses the `;`-separated bucket notation, e.g. `"0.1;0.5;1; 10"`.
pub fn expand_buckets(input: &str) -> Result<Vec<f64>, std::num::ParseFloatError> {
    input.split(';').map(|s| s.trim().parse::<f64>()).collect()
}

fn deserialize_buckets<'de, D>(deserializer: D) -> Result<Vec<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Buckets {
        List(Vec<f64>),
        Single(f64),
        Text(String),
    }

    let buckets = match Buckets::deserialize(deserializer)? {
        Buckets::List(list) => list,
        Buckets::Single(value) => vec![value],
        Buckets::Text(text) => expand_buckets(&text).map_err(|e| {
            serde::de::Error::custom(format!("invalid bucket list {:?}: {}", text, e))
        })?,
    };
    if buckets.is_empty() {
        return Err(serde::de::Error::custom("bucket list must not be empty"));
    }
    Ok(buckets)
}

fn deserialize_label_names<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Names {
        List(Vec<String>),
        Text(String),
    }

    Ok(match Names::deserialize(deserializer)? {
        Names::List(list) => list,
        Names::Text(text) => text.split(';').map(|s| s.trim().to_string()).collect(),
    })
}

impl Config {
    /// Loads the application configuration by layering sources.
    ///
    /// The file named by `--config` must exist; the default
    /// `promstatus.toml` is read only when present.
    pub fn load(cli: &Cli) -> Result<Self> {
        let figment = match &cli.config {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("configuration file {} does not exist", path.display());
                }
                Self::figment(Some(path.as_path()))
            }
            None => Self::figment(Some(Path::new(DEFAULT_CONFIG_FILE))),
        };
        let config: Config = figment
            .merge(cli.clone())
            .extract()
            .context("failed to load configuration")?;
        Ok(config)
    }

    /// Loads defaults, the given file and the environment, without CLI
    /// overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Config = Self::figment(Some(path.as_ref()))
            .extract()
            .with_context(|| format!("failed to load {}", path.as_ref().display()))?;
        Ok(config)
    }

    fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        // e.g. PROMSTATUS_COLLECTOR__MODE=socket
        figment.merge(Env::prefixed("PROMSTATUS_").split("__"))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_seconds.max(1))
    }

    pub fn reload_grace(&self) -> Duration {
        Duration::from_secs(self.reload_grace_seconds)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            enabled: true,
            namespace: "apache".to_string(),
            server_description: format!("promstatus/{}", env!("CARGO_PKG_VERSION")),
            server_name: "localhost".to_string(),
            mpm_name: "event".to_string(),
            label_names: vec!["method".to_string(), "status".to_string()],
            label_format: "%m;%s".to_string(),
            scopes: Vec::new(),
            buckets: BucketsConfig {
                time: vec![0.01, 0.1, 1.0, 10.0, 30.0],
                size: vec![1e3, 1e4, 1e5, 1e6, 1e7, 1e8],
            },
            collector: CollectorConfig {
                mode: CollectorMode::InProcess,
                socket_path: default_socket_path(),
                timeout_ms: 1000,
                spawn: true,
                startup_attempts: 20,
                startup_interval_ms: 50,
            },
            http: HttpConfig {
                enabled: true,
                listen_address: SocketAddr::from(([127, 0, 0, 1], 9117)),
                path: "/metrics".to_string(),
            },
            process: ProcessConfig {
                enabled: true,
                match_names: vec!["httpd".to_string(), "apache".to_string()],
                refresh_interval_seconds: 3,
            },
            tick_interval_seconds: 5,
            reload_grace_seconds: 5,
        }
    }
}
