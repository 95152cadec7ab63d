// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Diagnostics
//!
//! Health probes for readiness checks: `ping` subscribes to a topic and
//! unsubscribes straight away, proving the broker is reachable without
//! consuming traffic; `report` describes the pool.

use crate::{
    errors::BrokerResult,
    message::new_message_id,
    metrics::MetricsSnapshot,
    pool::Pool,
    transport::{Channel, HandleFactory, Subscription},
};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Pool usage at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolReport {
    pub transport: &'static str,
    pub created: usize,
    pub idle: usize,
    pub max_size: usize,
    pub closed: bool,
    pub metrics: MetricsSnapshot,
}

pub struct Diagnostics<F: HandleFactory> {
    pool: Pool<F>,
}

impl<F: HandleFactory> Diagnostics<F> {
    pub fn new(pool: Pool<F>) -> Self {
        Diagnostics { pool }
    }

    /// Subscribes to `topic` and unsubscribes immediately.
    ///
    /// # Returns
    /// The round-trip time of the probe
    pub async fn ping(&self, topic: &str) -> BrokerResult<Duration> {
        let started = Instant::now();
        let lease = self.pool.acquire().await?;

        let consumer_tag = format!("ping-{}", new_message_id());
        let mut subscription = lease.subscribe(topic, &consumer_tag).await.map_err(|err| {
            error!(topic, error = err.to_string(), "ping failed to subscribe");
            err
        })?;
        subscription.unsubscribe().await.map_err(|err| {
            error!(topic, error = err.to_string(), "ping failed to unsubscribe");
            err
        })?;
        lease.release();

        let elapsed = started.elapsed();
        debug!(topic, elapsed_ms = elapsed.as_millis() as u64, "ping succeeded");
        Ok(elapsed)
    }

    /// Pool capacity, usage and a metrics snapshot, without touching the
    /// broker.
    pub fn report(&self) -> PoolReport {
        PoolReport {
            transport: self.pool.factory().transport(),
            created: self.pool.created(),
            idle: self.pool.idle(),
            max_size: self.pool.max_size(),
            closed: self.pool.is_closed(),
            metrics: self.pool.metrics().snapshot(),
        }
    }
}
