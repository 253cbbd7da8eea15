//! Per-path label-format scopes.
//!
//! Scopes are resolved once when the configuration is loaded: every
//! configured path inherits the label format and enabled flag it does not set
//! from its nearest configured ancestor, and the global settings sit at the
//! root. Request-time lookup is a longest-prefix match on path segments.

use crate::config::ScopeConfig;
use crate::format::{self, CompiledFormat, ExtractorRegistry, FormatError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScopeError {
    #[error("invalid label format for {path}: {source}")]
    InvalidFormat {
        path: String,
        #[source]
        source: FormatError,
    },

    #[error("scope path {0:?} must start with '/'")]
    InvalidPath(String),
}

/// The effective settings of one scope.
#[derive(Debug, Clone)]
pub struct ResolvedScope {
    pub path: String,
    pub enabled: bool,
    pub format: CompiledFormat,
}

/// All scopes, with inheritance already applied.
#[derive(Debug, Clone)]
pub struct FormatScopes {
    global: ResolvedScope,
    /// Sorted by descending path length so the first match is the longest.
    scopes: Vec<ResolvedScope>,
}

impl FormatScopes {
    pub fn build(
        global_format: &str,
        global_enabled: bool,
        scopes: &[ScopeConfig],
        registry: &ExtractorRegistry,
    ) -> Result<Self, ScopeError> {
        let global = ResolvedScope {
            path: "/".to_string(),
            enabled: global_enabled,
            format: compile_for("global label_format", global_format, registry)?,
        };

        let mut configured: Vec<(String, &ScopeConfig)> = Vec::with_capacity(scopes.len());
        for scope in scopes {
            if !scope.path.starts_with('/') {
                return Err(ScopeError::InvalidPath(scope.path.clone()));
            }
            configured.push((normalize(&scope.path), scope));
        }
        // Parents before children, so a child can read its parent's result.
        configured.sort_by_key(|(path, _)| path.len());

        let mut resolved: Vec<ResolvedScope> = Vec::with_capacity(configured.len());
        for (path, scope) in configured {
            let parent = resolved
                .iter()
                .filter(|candidate| covers(&candidate.path, &path))
                .max_by_key(|candidate| candidate.path.len())
                .unwrap_or(&global);

            let format = match &scope.label_format {
                Some(source) => compile_for(&path, source, registry)?,
                None => parent.format.clone(),
            };
            let enabled = scope.enabled.unwrap_or(parent.enabled);

            // A later entry for the same path wins.
            resolved.retain(|existing| existing.path != path);
            resolved.push(ResolvedScope {
                path,
                enabled,
                format,
            });
        }
        resolved.sort_by(|a, b| b.path.len().cmp(&a.path.len()));

        Ok(Self {
            global,
            scopes: resolved,
        })
    }

    /// The scope governing `uri`.
    pub fn resolve(&self, uri: &str) -> &ResolvedScope {
        let path = uri.split(['?', '#']).next().unwrap_or(uri);
        self.scopes
            .iter()
            .find(|scope| covers(&scope.path, path))
            .unwrap_or(&self.global)
    }

    pub fn global(&self) -> &ResolvedScope {
        &self.global
    }

    /// Every scope, global first.
    pub fn iter(&self) -> impl Iterator<Item = &ResolvedScope> {
        std::iter::once(&self.global).chain(self.scopes.iter())
    }
}

fn compile_for(
    path: &str,
    source: &str,
    registry: &ExtractorRegistry,
) -> Result<CompiledFormat, ScopeError> {
    format::compile(source, registry).map_err(|source| ScopeError::InvalidFormat {
        path: path.to_string(),
        source,
    })
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `/api` covers `/api` and `/api/v1` but not `/apis`.
fn covers(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
