// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Metrics
//!
//! Counters for leases, physical links and published messages. Every value is
//! kept in an atomic so it can be read back through [`BrokerMetrics::snapshot`],
//! and mirrored into OpenTelemetry instruments on the global meter provider.
//!
//! `connections.opened` / `connections.closed` count leases, so at any time
//! `opened - closed` equals the number of leases in flight. Physical handle
//! creation and disposal is tracked separately as `links.*`.

use opentelemetry::{
    global,
    metrics::{Counter, UpDownCounter},
};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub active_connections: i64,
    pub messages_published: u64,
    pub messages_failed: u64,
    pub messages_oversized: u64,
    pub links_opened: u64,
    pub links_closed: u64,
}

struct Instruments {
    connections_opened: Counter<u64>,
    connections_closed: Counter<u64>,
    active_connections: UpDownCounter<i64>,
    messages_published: Counter<u64>,
    messages_failed: Counter<u64>,
    messages_oversized: Counter<u64>,
    links_opened: Counter<u64>,
    links_closed: Counter<u64>,
}

/// Metrics for one transport, named after it (`rabbitmq`, `nats`, ...).
pub struct BrokerMetrics {
    name: &'static str,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    active_connections: AtomicI64,
    messages_published: AtomicU64,
    messages_failed: AtomicU64,
    messages_oversized: AtomicU64,
    links_opened: AtomicU64,
    links_closed: AtomicU64,
    instruments: Instruments,
}

impl BrokerMetrics {
    pub fn new(name: &'static str) -> Self {
        let meter = global::meter(name);
        let counter = |suffix: &str, description: &'static str| {
            meter
                .u64_counter(format!("{name}.{suffix}"))
                .with_description(description)
                .build()
        };

        let instruments = Instruments {
            connections_opened: counter("connections.opened", "Leases handed out by the pool"),
            connections_closed: counter("connections.closed", "Leases returned to the pool"),
            active_connections: meter
                .i64_up_down_counter(format!("{name}.connections.active"))
                .with_description("Leases currently in flight")
                .build(),
            messages_published: counter("messages.published", "Successfully published messages"),
            messages_failed: counter("messages.failed", "Messages that failed to publish"),
            messages_oversized: counter(
                "messages.oversized",
                "Messages above the configured size ceiling",
            ),
            links_opened: counter("links.opened", "Physical transport handles created"),
            links_closed: counter("links.closed", "Physical transport handles disposed"),
        };

        BrokerMetrics {
            name,
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            active_connections: AtomicI64::new(0),
            messages_published: AtomicU64::new(0),
            messages_failed: AtomicU64::new(0),
            messages_oversized: AtomicU64::new(0),
            links_opened: AtomicU64::new(0),
            links_closed: AtomicU64::new(0),
            instruments,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.instruments.connections_opened.add(1, &[]);
        self.instruments.active_connections.add(1, &[]);
    }

    pub(crate) fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        self.instruments.connections_closed.add(1, &[]);
        self.instruments.active_connections.add(-1, &[]);
    }

    pub(crate) fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
        self.instruments.messages_published.add(1, &[]);
    }

    pub(crate) fn message_failed(&self) {
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
        self.instruments.messages_failed.add(1, &[]);
    }

    pub(crate) fn message_oversized(&self) {
        self.messages_oversized.fetch_add(1, Ordering::Relaxed);
        self.instruments.messages_oversized.add(1, &[]);
    }

    pub(crate) fn link_opened(&self) {
        self.links_opened.fetch_add(1, Ordering::Relaxed);
        self.instruments.links_opened.add(1, &[]);
    }

    pub(crate) fn link_closed(&self) {
        self.links_closed.fetch_add(1, Ordering::Relaxed);
        self.instruments.links_closed.add(1, &[]);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            messages_published: self.messages_published.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            messages_oversized: self.messages_oversized.load(Ordering::Relaxed),
            links_opened: self.links_opened.load(Ordering::Relaxed),
            links_closed: self.links_closed.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for BrokerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerMetrics")
            .field("name", &self.name)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_connections_follow_leases() {
        let metrics = BrokerMetrics::new("test");
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_opened, 2);
        assert_eq!(snapshot.connections_closed, 1);
        assert_eq!(snapshot.active_connections, 1);
        assert_eq!(
            snapshot.connections_opened - snapshot.connections_closed,
            snapshot.active_connections as u64
        );
    }

    #[test]
    fn message_counters_are_independent() {
        let metrics = BrokerMetrics::new("test");
        metrics.message_published();
        metrics.message_failed();
        metrics.message_failed();
        metrics.message_oversized();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_published, 1);
        assert_eq!(snapshot.messages_failed, 2);
        assert_eq!(snapshot.messages_oversized, 1);
        assert_eq!(snapshot.links_opened, 0);
    }
}
