//! Escaping of untrusted values before they become label text.

use std::fmt::Write;

/// Escapes a value the way access-log items are escaped.
///
/// `"` and `\` are backslash-escaped, the common control characters get their
/// C escape, and every other control or non-ASCII byte is written as `\xhh`.
pub fn escape_log_item(value: &str) -> String {
    if !value.bytes().any(needs_escape) {
        return value.to_string();
    }

    let mut escaped = String::with_capacity(value.len() + 8);
    for byte in value.bytes() {
        match byte {
            b'"' => escaped.push_str("\\\""),
            b'\\' => escaped.push_str("\\\\"),
            b'\x08' => escaped.push_str("\\b"),
            b'\n' => escaped.push_str("\\n"),
            b'\r' => escaped.push_str("\\r"),
            b'\t' => escaped.push_str("\\t"),
            b'\x0b' => escaped.push_str("\\v"),
            b if needs_escape(b) => {
                let _ = write!(escaped, "\\x{:02x}", b);
            }
            b => escaped.push(b as char),
        }
    }
    escaped
}

fn needs_escape(byte: u8) -> bool {
    byte < 0x20 || byte >= 0x7f || byte == b'"' || byte == b'\\'
}
