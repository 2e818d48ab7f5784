//! The `Log` capability (§6, §9).
//!
//! The original carries two parallel logging packages; this crate
//! consolidates to a single trait so every component takes one `&dyn Log`
//! and nothing else. The default implementation forwards to `tracing`,
//! matching the idiom used throughout the wider example pack (`snocat`'s
//! `tracing::error!`/`span!`, jetsocat's `#[macro_use] extern crate tracing`).

use std::collections::BTreeMap;
use std::fmt;

/// A structured field value attached to a log record.
#[derive(Debug, Clone)]
pub enum FieldValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Str(s) => write!(f, "{s}"),
            FieldValue::Int(i) => write!(f, "{i}"),
            FieldValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Str(s.to_string())
    }
}
impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Str(s)
    }
}
impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Int(i)
    }
}
impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

pub type Fields = BTreeMap<&'static str, FieldValue>;

/// Build a `Fields` map inline: `fields![("port", 22i64), ("host", host.as_str())]`.
#[macro_export]
macro_rules! fields {
    ($(($k:expr, $v:expr)),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut m = $crate::log::Fields::new();
        $( m.insert($k, $crate::log::FieldValue::from($v)); )*
        m
    }};
}

/// Structured logging capability consumed by every component (§6).
///
/// Implementations are shared (capability references, no ownership per §3)
/// and must be safe to call concurrently from any task.
pub trait Log: Send + Sync {
    fn debug(&self, message: &str, fields: &Fields);
    fn info(&self, message: &str, fields: &Fields);
    fn warn(&self, message: &str, fields: &Fields);
    fn error(&self, message: &str, fields: &Fields);
    fn fatal(&self, message: &str, fields: &Fields);
}

/// Discards every record. Used by tests and any caller with no logging needs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLog;

impl Log for NullLog {
    fn debug(&self, _message: &str, _fields: &Fields) {}
    fn info(&self, _message: &str, _fields: &Fields) {}
    fn warn(&self, _message: &str, _fields: &Fields) {}
    fn error(&self, _message: &str, _fields: &Fields) {}
    fn fatal(&self, _message: &str, _fields: &Fields) {}
}

fn render_fields(fields: &Fields) -> String {
    if fields.is_empty() {
        return String::new();
    }
    fields
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Default `Log` implementation, forwarding to the `tracing` crate.
///
/// The subscriber itself (formatting, colour, file output) is the excluded
/// "logging back-end" collaborator (§1); this type only emits `tracing`
/// events, which a caller-installed subscriber (see `src/cli.rs`) renders.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLog;

impl Log for TracingLog {
    fn debug(&self, message: &str, fields: &Fields) {
        tracing::debug!(fields = %render_fields(fields), "{message}");
    }
    fn info(&self, message: &str, fields: &Fields) {
        tracing::info!(fields = %render_fields(fields), "{message}");
    }
    fn warn(&self, message: &str, fields: &Fields) {
        tracing::warn!(fields = %render_fields(fields), "{message}");
    }
    fn error(&self, message: &str, fields: &Fields) {
        tracing::error!(fields = %render_fields(fields), "{message}");
    }
    fn fatal(&self, message: &str, fields: &Fields) {
        tracing::error!(fields = %render_fields(fields), severity = "fatal", "{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_log_accepts_any_fields() {
        let log = NullLog;
        log.info("hello", &fields![("n", 1i64)]);
    }

    #[test]
    fn render_fields_joins_entries() {
        let f = fields![("port", 22i64), ("host", "example.com")];
        let rendered = render_fields(&f);
        assert!(rendered.contains("port=22"));
        assert!(rendered.contains("host=example.com"));
    }
}
