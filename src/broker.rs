// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport-Agnostic Broker Facade
//!
//! [`Broker`] wires one transport's pool, producer, consumer and diagnostics
//! from a single [`BrokerSettings`]. Call sites that should not know which
//! transport is active depend on [`BrokerProducer`] and [`BrokerConsumer`]
//! only. The facade adapts arguments and nothing else: a topic is mapped to
//! the transport's addressing and string headers to message headers.

use crate::{
    consumer::{Consumer, SubscriptionHandle},
    diagnostics::Diagnostics,
    errors::{BrokerError, BrokerResult, HandlerError},
    message::{HeaderValue, Headers, MessageContext},
    metrics::BrokerMetrics,
    pool::Pool,
    publisher::Producer,
    settings::BrokerSettings,
    transport::HandleFactory,
};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::HashMap, future::Future, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Addressing and headers travelling with a facade message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerMetadata {
    pub topic: String,
    pub headers: HashMap<String, String>,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
}

impl BrokerMetadata {
    pub fn new(topic: impl Into<String>) -> Self {
        BrokerMetadata {
            topic: topic.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    fn from_context<T>(topic: &str, message: &MessageContext<T>) -> Self {
        BrokerMetadata {
            topic: topic.to_owned(),
            headers: message
                .headers
                .iter()
                .map(|(key, value)| (key.clone(), value.to_string()))
                .collect(),
            correlation_id: Some(message.correlation_id.clone()),
            message_id: Some(message.message_id.clone()),
        }
    }

    fn message_headers(&self) -> Headers {
        self.headers
            .iter()
            .map(|(key, value)| (key.clone(), HeaderValue::from(value.as_str())))
            .collect()
    }
}

#[async_trait]
pub trait BrokerProducer: Send + Sync {
    /// Publishes `message` to `metadata.topic`.
    async fn publish<T>(&self, message: &T, metadata: &BrokerMetadata) -> BrokerResult<()>
    where
        T: Serialize + Send + Sync;
}

#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// Subscribes `handler` to the configured queue until `token` fires.
    async fn subscribe<T, H, Fut>(
        &self,
        handler: H,
        token: CancellationToken,
    ) -> BrokerResult<SubscriptionHandle>
    where
        T: DeserializeOwned + Send + 'static,
        H: Fn(T, BrokerMetadata) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static;
}

/// Pool, producer and consumer of one transport.
pub struct Broker<F: HandleFactory> {
    settings: Arc<BrokerSettings>,
    pool: Pool<F>,
    producer: Producer<F>,
    consumer: Consumer<F>,
}

impl<F: HandleFactory> Clone for Broker<F> {
    fn clone(&self) -> Self {
        Broker {
            settings: self.settings.clone(),
            pool: self.pool.clone(),
            producer: self.producer.clone(),
            consumer: self.consumer.clone(),
        }
    }
}

impl<F: HandleFactory> Broker<F> {
    /// Builds the broker with metrics named after the transport.
    pub fn new(factory: F, settings: BrokerSettings) -> BrokerResult<Self> {
        let metrics = Arc::new(BrokerMetrics::new(factory.transport()));
        Broker::with_metrics(factory, settings, metrics)
    }

    /// Builds the broker around an existing metrics instance.
    ///
    /// # Parameters
    /// * `factory` - Transport handle factory backing the pool
    /// * `settings` - Validated before anything is built
    /// * `metrics` - Shared by the pool, producer and consumer
    ///
    /// # Returns
    /// The broker, or `ConfigError` when the settings are invalid
    pub fn with_metrics(
        factory: F,
        settings: BrokerSettings,
        metrics: Arc<BrokerMetrics>,
    ) -> BrokerResult<Self> {
        settings.validate()?;

        let transport = factory.transport();
        let settings = Arc::new(settings);
        let pool = Pool::new(factory, &settings, metrics);

        info!(
            transport,
            endpoint = settings.endpoint(),
            max_connections = settings.max_connections,
            "broker ready"
        );

        Ok(Broker {
            producer: Producer::new(pool.clone(), settings.clone()),
            consumer: Consumer::new(pool.clone(), settings.clone()),
            pool,
            settings,
        })
    }

    pub fn producer(&self) -> &Producer<F> {
        &self.producer
    }

    pub fn consumer(&self) -> &Consumer<F> {
        &self.consumer
    }

    pub fn pool(&self) -> &Pool<F> {
        &self.pool
    }

    pub fn metrics(&self) -> &Arc<BrokerMetrics> {
        self.pool.metrics()
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    /// Ping and pool report over the same pool.
    pub fn diagnostics(&self) -> Diagnostics<F> {
        Diagnostics::new(self.pool.clone())
    }

    /// Closes the pool, then whatever the transport keeps open.
    pub async fn close(&self) -> BrokerResult<()> {
        self.pool.close().await;
        self.pool.factory().shutdown().await
    }
}

#[async_trait]
impl<F: HandleFactory> BrokerProducer for Broker<F> {
    async fn publish<T>(&self, message: &T, metadata: &BrokerMetadata) -> BrokerResult<()>
    where
        T: Serialize + Send + Sync,
    {
        let (exchange, routing_key) = self.pool.factory().route(&metadata.topic);
        self.producer
            .publish(
                &exchange,
                &routing_key,
                message,
                Some(metadata.message_headers()),
                metadata.correlation_id.clone(),
                metadata.message_id.clone(),
            )
            .await
    }
}

#[async_trait]
impl<F: HandleFactory> BrokerConsumer for Broker<F> {
    async fn subscribe<T, H, Fut>(
        &self,
        handler: H,
        token: CancellationToken,
    ) -> BrokerResult<SubscriptionHandle>
    where
        T: DeserializeOwned + Send + 'static,
        H: Fn(T, BrokerMetadata) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let topic = self.settings.queue_name.clone();
        if topic.trim().is_empty() {
            error!("queue_name is required to subscribe through the broker facade");
            return Err(BrokerError::ConfigError(
                "queue_name must be set to subscribe through the broker facade".to_owned(),
            ));
        }

        let queue = topic.clone();
        self.consumer
            .subscribe(
                &topic,
                move |message: MessageContext<T>| {
                    let metadata = BrokerMetadata::from_context(&queue, &message);
                    handler(message.payload, metadata)
                },
                token,
            )
            .await
    }
}
