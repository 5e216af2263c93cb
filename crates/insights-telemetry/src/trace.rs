//! Trace context captured when a stream is created and reactivated when it
//! completes, so the completion event lands in the originating trace even
//! though it is emitted from another task.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Carrier key for the W3C trace-context header.
pub const TRACEPARENT: &str = "traceparent";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TraceParseError {
    #[error("carrier has no traceparent entry")]
    Missing,
    #[error("malformed traceparent: {0}")]
    Malformed(String),
}

/// W3C trace id (32 hex) and parent span id (16 hex).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
}

impl TraceContext {
    /// Start a fresh trace.
    pub fn new_root() -> Self {
        let trace_id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            trace_id,
            span_id: new_span_id(),
        }
    }

    /// Same trace, new span id.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
        }
    }

    pub fn traceparent(&self) -> String {
        format!("00-{}-{}-01", self.trace_id, self.span_id)
    }

    pub fn parse_traceparent(value: &str) -> Result<Self, TraceParseError> {
        let malformed = || TraceParseError::Malformed(value.to_string());
        let mut parts = value.trim().split('-');
        let (Some(version), Some(trace_id), Some(span_id), Some(flags), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(malformed());
        };
        if version.len() != 2 || flags.len() != 2 || !is_hex(version) || !is_hex(flags) {
            return Err(malformed());
        }
        if trace_id.len() != 32 || !is_hex(trace_id) || trace_id.bytes().all(|b| b == b'0') {
            return Err(malformed());
        }
        if span_id.len() != 16 || !is_hex(span_id) || span_id.bytes().all(|b| b == b'0') {
            return Err(malformed());
        }
        Ok(Self {
            trace_id: trace_id.to_ascii_lowercase(),
            span_id: span_id.to_ascii_lowercase(),
        })
    }

    /// Serialize into a propagation carrier.
    pub fn to_carrier(&self) -> HashMap<String, String> {
        HashMap::from([(TRACEPARENT.to_string(), self.traceparent())])
    }

    pub fn from_carrier(carrier: &HashMap<String, String>) -> Result<Self, TraceParseError> {
        let value = carrier.get(TRACEPARENT).ok_or(TraceParseError::Missing)?;
        Self::parse_traceparent(value)
    }

    /// Span that re-establishes this context for events emitted inside it.
    /// It is a root span: whatever span is current at the call site does not
    /// leak its correlation ids into it.
    pub fn reactivate(&self) -> tracing::Span {
        tracing::info_span!(
            parent: None,
            "trace_context",
            trace_id = %self.trace_id,
            parent_span_id = %self.span_id,
        )
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.traceparent())
    }
}

fn new_span_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

fn is_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_has_w3c_shape() {
        let ctx = TraceContext::new_root();
        assert_eq!(ctx.trace_id.len(), 32);
        assert_eq!(ctx.span_id.len(), 16);
        let header = ctx.traceparent();
        assert!(header.starts_with("00-"));
        assert!(header.ends_with("-01"));
    }

    #[test]
    fn carrier_restores_context() {
        let ctx = TraceContext::new_root();
        let carrier = ctx.to_carrier();
        assert!(carrier.contains_key(TRACEPARENT));
        assert_eq!(TraceContext::from_carrier(&carrier).unwrap(), ctx);
    }

    #[test]
    fn child_keeps_trace() {
        let ctx = TraceContext::new_root();
        let child = ctx.child();
        assert_eq!(child.trace_id, ctx.trace_id);
        assert_ne!(child.span_id, ctx.span_id);
    }

    #[test]
    fn rejects_bad_headers() {
        assert_eq!(
            TraceContext::from_carrier(&HashMap::new()),
            Err(TraceParseError::Missing)
        );
        for bad in [
            "",
            "00-abc-def-01",
            "00-00000000000000000000000000000000-00f067aa0ba902b7-01",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-zzf067aa0ba902b7-01",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01-extra",
        ] {
            assert!(TraceContext::parse_traceparent(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn parses_reference_header() {
        let ctx = TraceContext::parse_traceparent(
            "00-4BF92F3577B34DA6A3CE929D0E0E4736-00f067aa0ba902b7-01",
        )
        .unwrap();
        assert_eq!(ctx.trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(ctx.span_id, "00f067aa0ba902b7");
    }
}
