//! Command-Line Interface (CLI) argument parsing.
//!
//! This module defines the command-line arguments for the application using the
//! `clap` crate. These arguments are parsed at startup and then merged over
//! the configuration from the `promstatus.toml` file and environment variables.

use clap::{Parser, Subcommand};
use figment::{
    value::{Dict, Map, Value},
    Error, Metadata, Profile, Provider,
};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Request and worker metrics for web servers, exposed for Prometheus.
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Unix socket of the collector service. Switches to socket mode.
    #[arg(long, value_name = "PATH", global = true)]
    pub socket: Option<PathBuf>,

    /// Listen address of the HTTP metrics endpoint.
    #[arg(long, value_name = "ADDR", global = true)]
    pub listen: Option<SocketAddr>,

    /// Global label format, e.g. "%m;%s".
    #[arg(long, value_name = "FMT", global = true)]
    pub label_format: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Command {
    /// Run the metrics endpoint, and the collector when configured (default).
    #[default]
    Serve,
    /// Run only the aggregation service on the collector socket.
    Collector,
    /// Compile every configured label format and exit.
    Check,
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command.unwrap_or_default()
    }
}

impl Provider for Cli {
    fn metadata(&self) -> Metadata {
        Metadata::named("Command-Line Arguments")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        let mut dict = Dict::new();

        if let Some(socket) = &self.socket {
            let mut collector = Dict::new();
            collector.insert(
                "socket_path".into(),
                Value::from(socket.to_string_lossy().into_owned()),
            );
            collector.insert("mode".into(), Value::from("socket"));
            dict.insert("collector".into(), Value::from(collector));
        }

        if let Some(listen) = self.listen {
            let mut http = Dict::new();
            http.insert("listen_address".into(), Value::from(listen.to_string()));
            dict.insert("http".into(), Value::from(http));
        }

        if let Some(format) = &self.label_format {
            dict.insert("label_format".into(), Value::from(format.clone()));
        }

        if let Some(level) = &self.log_level {
            dict.insert("log_level".into(), Value::from(level.clone()));
        }

        let mut map = Map::new();
        map.insert(Profile::Default, dict);
        Ok(map)
    }
}
