//! Line protocol spoken between hosts and the collector.
//!
//! Every command is one newline-terminated line:
//!
//! ```text
//! [update:]server:<name>;<value>[;<label>...]
//! [update:]request:<name>;<value>[;<label>...]
//! metrics
//! ```
//!
//! `metrics` is answered with the rendered registry, terminated by an empty
//! line (see [`frame_dump`]).

use std::fmt;
use thiserror::Error;

/// Terminates a dump: the last line's newline followed by an empty line.
pub const SENTINEL: &str = "\n\n";

const UPDATE_PREFIX: &str = "update:";
const METRICS_COMMAND: &str = "metrics";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error("update without a metric name")]
    MissingName,

    #[error("update of {0} without a value")]
    MissingValue(String),

    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: String, value: String },

    #[error("command is not valid UTF-8")]
    InvalidUtf8,
}

/// Which label set an update targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricScope {
    /// Server-wide metrics with their own fixed labels.
    Server,
    /// Request metrics labelled with the configured request label names.
    Request,
}

impl MetricScope {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricScope::Server => "server",
            MetricScope::Request => "request",
        }
    }
}

impl fmt::Display for MetricScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One metric update: add to a counter, set a gauge or observe a histogram,
/// depending on the metric's kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub scope: MetricScope,
    pub name: String,
    pub value: f64,
    pub labels: Vec<String>,
}

impl Update {
    pub fn server(name: impl Into<String>, value: f64) -> Self {
        Self {
            scope: MetricScope::Server,
            name: name.into(),
            value,
            labels: Vec::new(),
        }
    }

    pub fn request(name: impl Into<String>, value: f64, labels: Vec<String>) -> Self {
        Self {
            scope: MetricScope::Request,
            name: name.into(),
            value,
            labels,
        }
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    /// Encodes the update as a protocol line, including the trailing newline.
    ///
    /// Line breaks inside labels are written as `\n` and `\r` so a label
    /// cannot split the command.
    pub fn encode(&self) -> String {
        let mut line = format!("{}{}:{};{}", UPDATE_PREFIX, self.scope, self.name, self.value);
        for label in &self.labels {
            line.push(';');
            line.push_str(&label.replace('\n', "\\n").replace('\r', "\\r"));
        }
        line.push('\n');
        line
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Update(Update),
    Metrics,
}

impl Command {
    /// Parses one line, without or with its line terminator.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim();
        if line == METRICS_COMMAND {
            return Ok(Command::Metrics);
        }

        let body = line.strip_prefix(UPDATE_PREFIX).unwrap_or(line);
        let (kind, update) = body
            .split_once(':')
            .ok_or_else(|| ProtocolError::UnknownCommand(line.to_string()))?;
        let scope = match kind {
            "server" => MetricScope::Server,
            "request" => MetricScope::Request,
            other => return Err(ProtocolError::UnknownCommand(other.to_string())),
        };

        let mut fields = update.split(';');
        let name = match fields.next() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => return Err(ProtocolError::MissingName),
        };
        let raw_value = fields
            .next()
            .ok_or_else(|| ProtocolError::MissingValue(name.clone()))?;
        let value = raw_value
            .trim()
            .parse::<f64>()
            .map_err(|_| ProtocolError::InvalidValue {
                name: name.clone(),
                value: raw_value.to_string(),
            })?;

        Ok(Command::Update(Update {
            scope,
            name,
            value,
            labels: fields.map(str::to_string).collect(),
        }))
    }

    /// Parses a raw line as read from the socket.
    pub fn parse_bytes(line: &[u8]) -> Result<Self, ProtocolError> {
        let line = std::str::from_utf8(line).map_err(|_| ProtocolError::InvalidUtf8)?;
        Self::parse(line)
    }

    pub fn encode(&self) -> String {
        match self {
            Command::Update(update) => update.encode(),
            Command::Metrics => format!("{}\n", METRICS_COMMAND),
        }
    }
}

/// Frames a rendered registry for the wire.
///
/// Empty lines are dropped so the only blank line is the one closing the
/// dump. An empty registry is sent as a bare [`SENTINEL`].
pub fn frame_dump(rendered: &str) -> String {
    let mut framed = String::with_capacity(rendered.len() + 2);
    for line in rendered.lines().filter(|line| !line.trim().is_empty()) {
        framed.push_str(line);
        framed.push('\n');
    }
    if framed.is_empty() {
        framed.push('\n');
    }
    framed.push('\n');
    framed
}
