// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope Types
//!
//! Typed payload wrapper, header values and the per-frame delivery outcome.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Application headers attached to a message.
pub type Headers = BTreeMap<String, HeaderValue>;

/// A transport-neutral header value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    String(String),
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Bool(v) => write!(f, "{v}"),
            HeaderValue::Int(v) => write!(f, "{v}"),
            HeaderValue::String(v) => f.write_str(v),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

/// Generates a fresh message or correlation identifier.
pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// A typed payload plus headers and tracing identifiers.
///
/// Both identifiers are always populated: absent or empty values are replaced
/// with freshly generated ones so every message stays traceable.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageContext<T> {
    pub payload: T,
    pub headers: Headers,
    pub correlation_id: String,
    pub message_id: String,
}

impl<T> MessageContext<T> {
    pub fn new(payload: T) -> Self {
        MessageContext::from_parts(payload, Headers::default(), None, None)
    }

    pub fn from_parts(
        payload: T,
        headers: Headers,
        correlation_id: Option<String>,
        message_id: Option<String>,
    ) -> Self {
        MessageContext {
            payload,
            headers,
            correlation_id: non_empty_or_new(correlation_id),
            message_id: non_empty_or_new(message_id),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = non_empty_or_new(Some(correlation_id.into()));
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = non_empty_or_new(Some(message_id.into()));
        self
    }

    pub fn into_payload(self) -> T {
        self.payload
    }
}

pub(crate) fn non_empty_or_new(value: Option<String>) -> String {
    match value {
        Some(v) if !v.trim().is_empty() => v,
        _ => new_message_id(),
    }
}

/// How an inbound frame was settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handler succeeded, the message is removed from the queue.
    Acknowledged,
    /// Handler failed, the broker redelivers the message.
    NackRequeue,
    /// Poison message, the broker drops or dead-letters it.
    NackDrop,
}

impl DeliveryOutcome {
    pub fn requeue(&self) -> bool {
        matches!(self, DeliveryOutcome::NackRequeue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_identifiers_are_generated() {
        let ctx = MessageContext::new("payload");
        assert!(Uuid::parse_str(&ctx.correlation_id).is_ok());
        assert!(Uuid::parse_str(&ctx.message_id).is_ok());
        assert_ne!(ctx.correlation_id, ctx.message_id);
    }

    #[test]
    fn supplied_identifiers_are_kept() {
        let ctx = MessageContext::from_parts(
            1u32,
            Headers::default(),
            Some("corr-1".to_owned()),
            Some("msg-1".to_owned()),
        );
        assert_eq!(ctx.correlation_id, "corr-1");
        assert_eq!(ctx.message_id, "msg-1");
    }

    #[test]
    fn blank_identifiers_are_replaced() {
        let ctx = MessageContext::new(()).with_message_id("  ");
        assert!(Uuid::parse_str(&ctx.message_id).is_ok());
    }

    #[test]
    fn header_values_render_as_text() {
        let ctx = MessageContext::new(())
            .with_header("tenant", "acme")
            .with_header("attempt", 3i64)
            .with_header("replay", true);
        let rendered: Vec<String> = ctx.headers.values().map(|v| v.to_string()).collect();
        assert_eq!(rendered, vec!["3", "true", "acme"]);
    }

    #[test]
    fn only_requeue_outcome_redelivers() {
        assert!(DeliveryOutcome::NackRequeue.requeue());
        assert!(!DeliveryOutcome::NackDrop.requeue());
        assert!(!DeliveryOutcome::Acknowledged.requeue());
    }
}
