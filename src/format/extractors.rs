//! The field extractor registry.
//!
//! An extractor maps a request and the directive's `{argument}` to a label
//! fragment. Built-in extractors are a closed set of [`Field`]s; hosts can add
//! their own closures with [`ExtractorRegistry::register`]. The compiler binds
//! the extractor into each directive, so evaluation never looks anything up.

use super::escape::escape_log_item;
use super::FormatError;
use crate::request::Request;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Signature of a host-supplied extractor. Implementations must escape their
/// output themselves (see [`escape_log_item`]).
pub type ExtractorFn = dyn Fn(&Request, &str) -> Option<String> + Send + Sync;

/// The built-in request fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    RemoteHost,
    RemoteAddress,
    LocalAddress,
    RemoteUser,
    HeaderIn,
    HeaderOut,
    EnvVar,
    Cookie,
    ServerName,
    VirtualHost,
    ServerPort,
    Protocol,
    Method,
    ConnectionStatus,
    Uri,
    Status,
    Handler,
}

impl Field {
    /// Every built-in field with its directive letter and whether it reads
    /// the original request by default.
    pub const ALL: [(char, Field, bool); 17] = [
        ('h', Field::RemoteHost, false),
        ('a', Field::RemoteAddress, false),
        ('A', Field::LocalAddress, false),
        ('u', Field::RemoteUser, false),
        ('i', Field::HeaderIn, false),
        ('o', Field::HeaderOut, false),
        ('e', Field::EnvVar, false),
        ('C', Field::Cookie, false),
        ('V', Field::ServerName, false),
        ('v', Field::VirtualHost, false),
        ('p', Field::ServerPort, false),
        ('H', Field::Protocol, false),
        ('m', Field::Method, false),
        ('X', Field::ConnectionStatus, false),
        ('U', Field::Uri, true),
        ('s', Field::Status, true),
        ('R', Field::Handler, true),
    ];

    /// Extracts this field from `request`. `None` renders as the placeholder.
    pub fn extract(self, request: &Request, arg: &str) -> Option<String> {
        match self {
            Field::RemoteHost => Some(escape_log_item(
                request
                    .connection
                    .remote_host
                    .clone()
                    .unwrap_or_else(|| request.connection.client_addr.ip().to_string())
                    .as_str(),
            )),
            Field::RemoteAddress => {
                let addr = if arg == "c" {
                    request.connection.client_addr
                } else {
                    request.useragent_addr
                };
                Some(addr.ip().to_string())
            }
            Field::LocalAddress => Some(request.connection.local_addr.ip().to_string()),
            Field::RemoteUser => Some(match request.user.as_deref() {
                None => "-".to_string(),
                Some("") => "\"\"".to_string(),
                Some(user) => escape_log_item(user),
            }),
            Field::HeaderIn => join_headers(&request.headers_in, arg).map(|v| escape_log_item(&v)),
            Field::HeaderOut => header_out(request, arg).map(|v| escape_log_item(&v)),
            Field::EnvVar => request.env.get(arg).map(|v| escape_log_item(v)),
            Field::Cookie => find_cookie(request, arg).map(|v| escape_log_item(&v)),
            Field::ServerName => {
                let name = if request.server.use_canonical_name {
                    request.server.hostname.as_str()
                } else {
                    request
                        .hostname
                        .as_deref()
                        .unwrap_or(request.server.hostname.as_str())
                };
                Some(escape_log_item(name))
            }
            Field::VirtualHost => Some(escape_log_item(&request.server.hostname)),
            Field::ServerPort => Some(server_port(request, arg)),
            Field::Protocol => Some(escape_log_item(&request.protocol)),
            Field::Method => Some(escape_log_item(&request.method)),
            Field::ConnectionStatus => Some(connection_status(request).to_string()),
            Field::Uri => Some(escape_log_item(&request.uri)),
            Field::Status => Some(match request.status {
                0 => "-".to_string(),
                status => status.to_string(),
            }),
            Field::Handler => request.handler.as_deref().map(escape_log_item),
        }
    }
}

fn join_headers(headers: &axum::http::HeaderMap, name: &str) -> Option<String> {
    let values: Vec<String> = headers
        .get_all(name)
        .iter()
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join(", "))
    }
}

fn header_out(request: &Request, name: &str) -> Option<String> {
    if name.eq_ignore_ascii_case("content-type") {
        if let Some(content_type) = &request.content_type {
            return Some(strip_params(content_type).to_string());
        }
    } else if name.eq_ignore_ascii_case("set-cookie") {
        return join_headers(&request.headers_out, name);
    }
    request
        .headers_out
        .get(name)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
}

/// `text/html; charset=utf-8` becomes `text/html`.
fn strip_params(value: &str) -> &str {
    match value.find(';') {
        Some(idx) => value[..idx].trim_end(),
        None => value,
    }
}

fn find_cookie(request: &Request, name: &str) -> Option<String> {
    for header in request.headers_in.get_all("cookie") {
        let header = String::from_utf8_lossy(header.as_bytes());
        for cookie in header.split(';') {
            let Some((cookie_name, value)) = cookie.split_once('=') else {
                continue;
            };
            let cookie_name: String = cookie_name.chars().filter(|c| !c.is_whitespace()).collect();
            if cookie_name.eq_ignore_ascii_case(name) {
                return Some(
                    value
                        .trim_start_matches([' ', '\t'])
                        .trim_end()
                        .to_string(),
                );
            }
        }
    }
    None
}

fn server_port(request: &Request, variant: &str) -> String {
    let port = if variant.is_empty() || variant.eq_ignore_ascii_case("canonical") {
        request.server.canonical_port()
    } else if variant.eq_ignore_ascii_case("remote") {
        request.useragent_addr.port()
    } else if variant.eq_ignore_ascii_case("local") {
        request.connection.local_addr.port()
    } else {
        return variant.to_string();
    };
    port.to_string()
}

fn connection_status(request: &Request) -> &'static str {
    let connection = &request.connection;
    if connection.aborted {
        return "X";
    }
    let max = request.server.keep_alive_max;
    if connection.keepalive && (max == 0 || max > connection.keepalives) {
        "+"
    } else {
        "-"
    }
}

#[derive(Clone)]
enum ExtractorKind {
    Builtin(Field),
    Custom(Arc<ExtractorFn>),
}

/// An extractor bound to a directive letter.
#[derive(Clone)]
pub struct Extractor {
    kind: ExtractorKind,
    prefers_original: bool,
}

impl fmt::Debug for Extractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Extractor");
        match &self.kind {
            ExtractorKind::Builtin(field) => s.field("field", field),
            ExtractorKind::Custom(_) => s.field("field", &"custom"),
        };
        s.field("prefers_original", &self.prefers_original)
            .finish()
    }
}

impl Extractor {
    pub fn builtin(field: Field, prefers_original: bool) -> Self {
        Self {
            kind: ExtractorKind::Builtin(field),
            prefers_original,
        }
    }

    pub fn custom(function: Arc<ExtractorFn>, prefers_original: bool) -> Self {
        Self {
            kind: ExtractorKind::Custom(function),
            prefers_original,
        }
    }

    /// Whether directives without `<`/`>` read the original request.
    pub fn prefers_original(&self) -> bool {
        self.prefers_original
    }

    pub fn field(&self) -> Option<Field> {
        match self.kind {
            ExtractorKind::Builtin(field) => Some(field),
            ExtractorKind::Custom(_) => None,
        }
    }

    pub fn extract(&self, request: &Request, arg: &str) -> Option<String> {
        match &self.kind {
            ExtractorKind::Builtin(field) => field.extract(request, arg),
            ExtractorKind::Custom(function) => function(request, arg),
        }
    }
}

/// Characters with a meaning inside a directive; they can never name one.
const RESERVED: &[char] = &['!', '<', '>', ',', '{', '%'];

/// Directive letter to extractor table, built once and passed to the compiler.
#[derive(Debug, Clone, Default)]
pub struct ExtractorRegistry {
    table: HashMap<char, Extractor>,
}

impl ExtractorRegistry {
    /// A registry without any extractor.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A registry holding every built-in [`Field`].
    pub fn builtin() -> Self {
        let table = Field::ALL
            .iter()
            .map(|&(key, field, prefers_original)| {
                (key, Extractor::builtin(field, prefers_original))
            })
            .collect();
        Self { table }
    }

    /// Registers (or replaces) the extractor for `key`.
    pub fn register<F>(
        &mut self,
        key: char,
        function: F,
        prefers_original: bool,
    ) -> Result<(), FormatError>
    where
        F: Fn(&Request, &str) -> Option<String> + Send + Sync + 'static,
    {
        if RESERVED.contains(&key) || key.is_ascii_digit() {
            return Err(FormatError::ReservedDirective { directive: key });
        }
        self.table
            .insert(key, Extractor::custom(Arc::new(function), prefers_original));
        Ok(())
    }

    pub fn lookup(&self, key: char) -> Option<&Extractor> {
        self.table.get(&key)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
