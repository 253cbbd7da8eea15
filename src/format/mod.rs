//! The label-format mini-language.
//!
//! A label format is a string such as `%m;%>s;%{Host}i` in which `%`
//! directives are replaced by request fields. Formats are compiled once into a
//! [`CompiledFormat`] and evaluated for every completed request:
//!
//! ```text
//! %[!][<|>][{argument}][status,...]<letter>
//! ```
//!
//! * `!` negates the status condition.
//! * `<` reads the original request of a redirect chain, `>` the final one.
//! * `{...}` is handed to the extractor (a header name, a port variant, ...).
//! * A comma-separated list of status codes restricts the directive to those
//!   final statuses; other statuses render as `-`.
//! * `%%` is a literal percent sign. Outside directives `\\`, `\n`, `\r` and
//!   `\t` are decoded.

pub mod escape;
pub mod extractors;

pub use escape::escape_log_item;
pub use extractors::{Extractor, ExtractorFn, ExtractorRegistry, Field};

use crate::request::Request;
use std::fmt;
use std::iter::Peekable;
use std::str::CharIndices;
use std::sync::Arc;
use thiserror::Error;

/// Rendered in place of a value that is unavailable or filtered out.
pub const PLACEHOLDER: &str = "-";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("unrecognized label format directive '%{directive}' at offset {position}")]
    UnknownDirective { directive: char, position: usize },

    #[error("label format ends inside the directive starting at offset {position}")]
    UnterminatedDirective { position: usize },

    #[error("'{directive}' is part of the label format syntax and cannot name an extractor")]
    ReservedDirective { directive: char },
}

/// A `%` directive with its extractor already bound.
#[derive(Debug, Clone)]
pub struct Directive {
    pub key: char,
    pub argument: String,
    pub use_original: bool,
    pub negate: bool,
    pub conditions: Vec<u32>,
    extractor: Extractor,
}

impl Directive {
    fn render(&self, original: &Request, final_request: &Request) -> Option<String> {
        if !self.conditions.is_empty() {
            let matched = self.conditions.contains(&u32::from(final_request.status));
            if matched == self.negate {
                return None;
            }
        }
        let target = if self.use_original {
            original
        } else {
            final_request
        };
        self.extractor.extract(target, &self.argument)
    }
}

#[derive(Debug, Clone)]
pub enum Token {
    Literal(String),
    Directive(Directive),
}

/// An immutable, shareable compiled label format.
#[derive(Debug, Clone)]
pub struct CompiledFormat {
    tokens: Arc<[Token]>,
    source: Arc<str>,
}

impl CompiledFormat {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Renders the format for `request`.
    ///
    /// The original and final requests are resolved from the redirect chain
    /// once; every directive then reads whichever one it was compiled for.
    pub fn evaluate(&self, request: &Request) -> String {
        let original = request.original();
        let final_request = request.final_request();

        let mut rendered = String::new();
        for token in self.tokens.iter() {
            match token {
                Token::Literal(text) => rendered.push_str(text),
                Token::Directive(directive) => match directive.render(original, final_request) {
                    Some(value) => rendered.push_str(&value),
                    None => rendered.push_str(PLACEHOLDER),
                },
            }
        }
        rendered
    }
}

impl fmt::Display for CompiledFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Compiles `source` against the extractors in `registry`.
pub fn compile(source: &str, registry: &ExtractorRegistry) -> Result<CompiledFormat, FormatError> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut chars = source.char_indices().peekable();

    while let Some((offset, c)) = chars.next() {
        match c {
            '%' => {
                if chars.next_if(|&(_, next)| next == '%').is_some() {
                    literal.push('%');
                    continue;
                }
                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }
                let directive = parse_directive(&mut chars, offset, registry)?;
                tokens.push(Token::Directive(directive));
            }
            '\\' => match chars.peek().map(|&(_, next)| next) {
                Some('\\') => {
                    chars.next();
                    literal.push('\\');
                }
                Some('n') => {
                    chars.next();
                    literal.push('\n');
                }
                Some('r') => {
                    chars.next();
                    literal.push('\r');
                }
                Some('t') => {
                    chars.next();
                    literal.push('\t');
                }
                // `\%` leaves the percent sign to start a directive.
                Some('%') | None => literal.push('\\'),
                Some(other) => {
                    chars.next();
                    literal.push('\\');
                    literal.push(other);
                }
            },
            c => literal.push(c),
        }
    }
    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }

    Ok(CompiledFormat {
        tokens: tokens.into(),
        source: source.into(),
    })
}

fn parse_directive(
    chars: &mut Peekable<CharIndices<'_>>,
    start: usize,
    registry: &ExtractorRegistry,
) -> Result<Directive, FormatError> {
    let mut negate = false;
    let mut origin: Option<bool> = None;
    let mut argument = String::new();
    let mut conditions: Vec<u32> = Vec::new();

    loop {
        let Some((_, c)) = chars.next() else {
            return Err(FormatError::UnterminatedDirective { position: start });
        };
        match c {
            '!' => negate = !negate,
            '<' => origin = Some(true),
            '>' => origin = Some(false),
            ',' => {}
            '{' => {
                argument.clear();
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    argument.push(c);
                }
            }
            '0'..='9' => {
                let mut status = c.to_digit(10).unwrap_or(0);
                while let Some((_, digit)) = chars.next_if(|(_, d)| d.is_ascii_digit()) {
                    status = status
                        .saturating_mul(10)
                        .saturating_add(digit.to_digit(10).unwrap_or(0));
                }
                if !conditions.contains(&status) {
                    conditions.push(status);
                }
            }
            key => {
                let extractor = registry
                    .lookup(key)
                    .ok_or(FormatError::UnknownDirective {
                        directive: key,
                        position: start,
                    })?
                    .clone();
                return Ok(Directive {
                    key,
                    use_original: origin.unwrap_or_else(|| extractor.prefers_original()),
                    argument,
                    negate,
                    conditions,
                    extractor,
                });
            }
        }
    }
}
