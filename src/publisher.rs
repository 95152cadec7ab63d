// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Pooled Message Producer
//!
//! Publishes JSON messages over leased channels. Each publish:
//!
//! 1. waits for a rate-limiter token when a rate is configured,
//! 2. serializes the payload and checks it against the soft size ceiling,
//! 3. through the resilience pipeline: leases a channel, arms confirms when
//!    enabled, publishes, waits for the broker confirm up to the configured
//!    timeout and hands the lease back on every path,
//! 4. records the outcome in the `messages.*` counters.
//!
//! OpenTelemetry trace context is injected into the message headers so
//! consumers can continue the trace.

use crate::{
    errors::{BrokerError, BrokerResult},
    message::{non_empty_or_new, Headers, MessageContext},
    otel,
    pool::Pool,
    resilience::ResiliencePipeline,
    settings::BrokerSettings,
    transport::{Channel, Envelope, HandleFactory},
};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use serde::Serialize;
use std::{num::NonZeroU32, sync::Arc};
use tracing::{error, info, warn};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Publishes messages through a [`Pool`].
///
/// Cloning is cheap; clones share the pool and the rate limiter.
pub struct Producer<F: HandleFactory> {
    pool: Pool<F>,
    settings: Arc<BrokerSettings>,
    limiter: Option<Arc<DirectLimiter>>,
    pipeline: ResiliencePipeline,
}

impl<F: HandleFactory> Clone for Producer<F> {
    fn clone(&self) -> Self {
        Producer {
            pool: self.pool.clone(),
            settings: self.settings.clone(),
            limiter: self.limiter.clone(),
            pipeline: self.pipeline.clone(),
        }
    }
}

impl<F: HandleFactory> Producer<F> {
    /// Creates a producer publishing through `pool`.
    ///
    /// # Parameters
    /// * `pool` - Channel pool shared with other producers and consumers
    /// * `settings` - Rate limit, size ceiling, confirm and retry settings
    pub fn new(pool: Pool<F>, settings: Arc<BrokerSettings>) -> Self {
        let limiter = NonZeroU32::new(settings.max_messages_per_second)
            .map(|rate| Arc::new(RateLimiter::direct(Quota::per_second(rate))));
        let pipeline = ResiliencePipeline::from_settings(
            format!("{}.publish", pool.factory().transport()),
            &settings,
        );

        Producer {
            pool,
            settings,
            limiter,
            pipeline,
        }
    }

    /// Publishes `message` as JSON.
    ///
    /// # Parameters
    /// * `exchange` - Exchange, or subject for transports without exchanges
    /// * `routing_key` - Routing key, may be empty
    /// * `message` - Payload, serialized with serde_json
    /// * `headers` - Optional application headers
    /// * `correlation_id` - Generated when absent or blank
    /// * `message_id` - Generated when absent or blank
    ///
    /// # Returns
    /// Ok(()) once the transport accepted the message, and the broker
    /// confirmed it when confirms are enabled
    pub async fn publish<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
        headers: Option<Headers>,
        correlation_id: Option<String>,
        message_id: Option<String>,
    ) -> BrokerResult<()>
    where
        T: Serialize + ?Sized,
    {
        let metrics = self.pool.metrics();

        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let body = serde_json::to_vec(message).map_err(|err| {
            metrics.message_failed();
            error!(
                exchange,
                routing_key,
                error = err.to_string(),
                "failure to serialize payload"
            );
            BrokerError::SerializePayloadError(err.to_string())
        })?;

        if let Some(ceiling) = self.settings.max_message_bytes() {
            if body.len() > ceiling {
                metrics.message_oversized();
                warn!(
                    exchange,
                    routing_key,
                    size = body.len(),
                    ceiling,
                    "message exceeds the size ceiling, publishing anyway"
                );
            }
        }

        let mut envelope = Envelope::new(exchange, routing_key);
        envelope.headers = headers.unwrap_or_default();
        envelope.correlation_id = non_empty_or_new(correlation_id);
        envelope.message_id = non_empty_or_new(message_id);
        otel::inject_context(&mut envelope.headers);

        let envelope = &envelope;
        let body = body.as_slice();
        match self
            .pipeline
            .execute(move || self.publish_once(envelope, body))
            .await
        {
            Ok(()) => {
                metrics.message_published();
                info!(
                    exchange,
                    routing_key,
                    message_id = envelope.message_id.as_str(),
                    correlation_id = envelope.correlation_id.as_str(),
                    "message published"
                );
                Ok(())
            }
            Err(err) => {
                metrics.message_failed();
                error!(
                    exchange,
                    routing_key,
                    message_id = envelope.message_id.as_str(),
                    error = err.to_string(),
                    "failure to publish message"
                );
                Err(err)
            }
        }
    }

    /// Publishes a [`MessageContext`], keeping its headers and identifiers.
    pub async fn publish_context<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        context: &MessageContext<T>,
    ) -> BrokerResult<()>
    where
        T: Serialize,
    {
        self.publish(
            exchange,
            routing_key,
            &context.payload,
            Some(context.headers.clone()),
            Some(context.correlation_id.clone()),
            Some(context.message_id.clone()),
        )
        .await
    }

    pub fn pool(&self) -> &Pool<F> {
        &self.pool
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    async fn publish_once(&self, envelope: &Envelope, body: &[u8]) -> BrokerResult<()> {
        let lease = self.pool.acquire().await?;
        let confirms = self.settings.publisher_confirms;

        if confirms {
            lease.enable_confirms().await?;
        }

        let pending = lease.publish(envelope, body).await?;

        let result = if confirms {
            let limit = self.settings.confirm_timeout();
            match tokio::time::timeout(limit, pending).await {
                Ok(confirmed) => confirmed,
                Err(_) => {
                    warn!(
                        destination = envelope.destination(),
                        timeout_secs = limit.as_secs(),
                        "publish confirm timed out"
                    );
                    Err(BrokerError::ConfirmTimeout(limit))
                }
            }
        } else {
            Ok(())
        };

        lease.release();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::{ConfirmMode, MemoryBroker, MemoryChannelFactory},
        message::HeaderValue,
        metrics::BrokerMetrics,
    };
    use serde::Deserialize;
    use std::{collections::BTreeMap, time::Duration};
    use uuid::Uuid;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct OrderPlaced {
        id: u32,
        sku: String,
    }

    fn producer(broker: &MemoryBroker, settings: BrokerSettings) -> Producer<MemoryChannelFactory> {
        let pool = Pool::new(
            broker.channel_factory(),
            &settings,
            Arc::new(BrokerMetrics::new("memory")),
        );
        Producer::new(pool, Arc::new(settings))
    }

    fn order() -> OrderPlaced {
        OrderPlaced {
            id: 7,
            sku: "sku-1".to_owned(),
        }
    }

    #[tokio::test]
    async fn publishes_json_with_generated_identifiers() {
        let broker = MemoryBroker::new();
        let producer = producer(&broker, BrokerSettings::default());

        producer
            .publish("orders", "orders.placed", &order(), None, None, None)
            .await
            .unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "orders.placed");
        let body: OrderPlaced = serde_json::from_slice(&published[0].body).unwrap();
        assert_eq!(body, order());
        assert!(Uuid::parse_str(published[0].message_id.as_deref().unwrap()).is_ok());
        assert!(Uuid::parse_str(published[0].correlation_id.as_deref().unwrap()).is_ok());

        let snapshot = producer.pool().metrics().snapshot();
        assert_eq!(snapshot.messages_published, 1);
        assert_eq!(snapshot.connections_opened, snapshot.connections_closed);
        assert_eq!(producer.pool().idle(), 1);
    }

    #[tokio::test]
    async fn context_headers_and_identifiers_are_kept() {
        let broker = MemoryBroker::new();
        let producer = producer(&broker, BrokerSettings::default());
        let context = MessageContext::new(order())
            .with_header("tenant", "acme")
            .with_correlation_id("corr-1")
            .with_message_id("msg-1");

        producer
            .publish_context("orders", "", &context)
            .await
            .unwrap();

        let published = &broker.published()[0];
        assert_eq!(published.topic, "orders");
        assert_eq!(published.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(published.message_id.as_deref(), Some("msg-1"));
        assert_eq!(published.headers.get("tenant"), Some(&HeaderValue::from("acme")));
    }

    #[tokio::test(start_paused = true)]
    async fn third_publish_waits_for_a_channel_when_pool_holds_two() {
        let broker = MemoryBroker::new();
        broker.set_publish_delay(Duration::from_millis(100));
        let producer = producer(
            &broker,
            BrokerSettings {
                max_connections: 2,
                ..Default::default()
            },
        );

        let (a, b, c) = tokio::join!(
            producer.publish("orders", "", &1, None, None, None),
            producer.publish("orders", "", &2, None, None, None),
            producer.publish("orders", "", &3, None, None, None),
        );

        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(broker.handles_created(), 2);
        assert_eq!(broker.published().len(), 3);
        assert_eq!(producer.pool().metrics().snapshot().messages_published, 3);
    }

    #[tokio::test]
    async fn oversized_payload_is_flagged_and_still_published() {
        let broker = MemoryBroker::new();
        let producer = producer(
            &broker,
            BrokerSettings {
                max_message_size_kb: 1,
                ..Default::default()
            },
        );
        // 2046 characters plus the JSON quotes
        let payload = "x".repeat(2046);

        producer
            .publish("orders", "", &payload, None, None, None)
            .await
            .unwrap();

        assert_eq!(broker.published()[0].body.len(), 2048);
        let snapshot = producer.pool().metrics().snapshot();
        assert_eq!(snapshot.messages_oversized, 1);
        assert_eq!(snapshot.messages_published, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_confirm_fails_after_the_timeout() {
        let broker = MemoryBroker::new();
        broker.set_confirm_mode(ConfirmMode::Never);
        let producer = producer(
            &broker,
            BrokerSettings {
                publisher_confirms: true,
                confirm_timeout_secs: 1,
                retry_count: 0,
                ..Default::default()
            },
        );
        let started = tokio::time::Instant::now();

        let err = producer
            .publish("orders", "", &order(), None, None, None)
            .await
            .unwrap_err();

        assert_eq!(err, BrokerError::ConfirmTimeout(Duration::from_secs(1)));
        assert!(started.elapsed() >= Duration::from_secs(1));
        let snapshot = producer.pool().metrics().snapshot();
        assert_eq!(snapshot.messages_failed, 1);
        assert_eq!(snapshot.connections_opened, snapshot.connections_closed);
    }

    #[tokio::test]
    async fn rejected_confirm_is_retried_then_surfaced() {
        let broker = MemoryBroker::new();
        broker.set_confirm_mode(ConfirmMode::Reject);
        let producer = producer(
            &broker,
            BrokerSettings {
                publisher_confirms: true,
                retry_count: 2,
                ..Default::default()
            },
        );

        let err = producer
            .publish("orders", "", &order(), None, None, None)
            .await
            .unwrap_err();

        assert_eq!(err, BrokerError::ConfirmNacked);
        assert_eq!(broker.published().len(), 3);
        assert_eq!(producer.pool().metrics().snapshot().messages_failed, 1);
    }

    #[tokio::test]
    async fn confirms_are_armed_on_the_leased_channel() {
        let broker = MemoryBroker::new();
        let producer = producer(
            &broker,
            BrokerSettings {
                publisher_confirms: true,
                ..Default::default()
            },
        );

        producer
            .publish("orders", "", &order(), None, None, None)
            .await
            .unwrap();

        let lease = producer.pool().acquire().await.unwrap();
        assert!(lease.confirms_enabled());
    }

    #[tokio::test]
    async fn transient_publish_failures_are_retried() {
        let broker = MemoryBroker::new();
        broker.fail_next_publishes(2);
        let producer = producer(&broker, BrokerSettings::default());

        producer
            .publish("orders", "", &order(), None, None, None)
            .await
            .unwrap();

        let snapshot = producer.pool().metrics().snapshot();
        assert_eq!(broker.published().len(), 1);
        assert_eq!(snapshot.messages_published, 1);
        assert_eq!(snapshot.messages_failed, 0);
        assert_eq!(snapshot.connections_opened, 3);
        assert_eq!(snapshot.connections_closed, 3);
    }

    #[tokio::test]
    async fn unserializable_payload_fails_without_leasing() {
        let broker = MemoryBroker::new();
        let producer = producer(&broker, BrokerSettings::default());
        let mut payload = BTreeMap::new();
        payload.insert((1u8, 2u8), 3u8);

        let err = producer
            .publish("orders", "", &payload, None, None, None)
            .await
            .unwrap_err();

        assert!(matches!(err, BrokerError::SerializePayloadError(_)));
        let snapshot = producer.pool().metrics().snapshot();
        assert_eq!(snapshot.messages_failed, 1);
        assert_eq!(snapshot.connections_opened, 0);
    }

    #[tokio::test]
    async fn rate_limit_spaces_out_publishes() {
        let broker = MemoryBroker::new();
        let producer = producer(
            &broker,
            BrokerSettings {
                max_messages_per_second: 2,
                ..Default::default()
            },
        );
        let started = std::time::Instant::now();

        for n in 0..3 {
            producer
                .publish("orders", "", &n, None, None, None)
                .await
                .unwrap();
        }

        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(broker.published().len(), 3);
    }
}
