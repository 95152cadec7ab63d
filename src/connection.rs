// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Shared Broker Connection
//!
//! One physical link per process, created lazily and cached. Callers always get
//! the cached link while it is open. Once it closes, the next caller
//! reconnects through the resilience pipeline. Concurrent callers are
//! serialized on the cache, so a reconnect never produces two links.

use crate::{
    errors::BrokerResult,
    metrics::BrokerMetrics,
    resilience::ResiliencePipeline,
    settings::BrokerSettings,
    transport::{Connector, TransportHandle},
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Process-wide cached link, reconnected on demand.
pub struct BrokerConnection<C: Connector> {
    connector: C,
    link: Mutex<Option<C::Link>>,
    pipeline: ResiliencePipeline,
    metrics: Arc<BrokerMetrics>,
}

impl<C: Connector> BrokerConnection<C> {
    /// Creates the cache without connecting.
    ///
    /// # Parameters
    /// * `connector` - Opens and closes the underlying link
    /// * `settings` - Retry policy for connection attempts
    /// * `metrics` - Receives `links.opened` / `links.closed` for the link
    ///
    /// # Returns
    /// A connection whose first [`BrokerConnection::get_handle`] connects
    pub fn new(connector: C, settings: &BrokerSettings, metrics: Arc<BrokerMetrics>) -> Self {
        BrokerConnection {
            connector,
            link: Mutex::new(None),
            pipeline: ResiliencePipeline::from_settings(
                format!("{}.link", metrics.name()),
                settings,
            ),
            metrics,
        }
    }

    /// Returns the cached link, connecting first when there is none or it
    /// has closed.
    pub async fn get_handle(&self) -> BrokerResult<C::Link> {
        let mut cached = self.link.lock().await;

        if let Some(link) = cached.as_ref() {
            if link.is_open() {
                return Ok(link.clone());
            }
            debug!(endpoint = self.connector.endpoint(), "cached link closed, reconnecting");
            cached.take();
        }

        let connector = &self.connector;
        let link = self
            .pipeline
            .execute(move || connector.connect())
            .await
            .map_err(|err| {
                error!(
                    endpoint = self.connector.endpoint(),
                    error = err.to_string(),
                    "failure to connect to the broker"
                );
                err
            })?;

        let metrics = self.metrics.clone();
        let endpoint = self.connector.endpoint();
        self.connector.on_shutdown(
            &link,
            Box::new(move |reason| {
                warn!(
                    endpoint = endpoint.as_str(),
                    reason = reason.as_str(),
                    "broker link shut down"
                );
                metrics.link_closed();
            }),
        );
        self.metrics.link_opened();
        info!(endpoint = self.connector.endpoint(), "broker link established");

        *cached = Some(link.clone());
        Ok(link)
    }

    /// Disconnects the cached link, if any. The next [`Self::get_handle`]
    /// connects again.
    pub async fn close(&self) -> BrokerResult<()> {
        let Some(link) = self.link.lock().await.take() else {
            return Ok(());
        };

        if link.is_open() {
            self.connector.disconnect(&link).await?;
            self.metrics.link_closed();
            info!(endpoint = self.connector.endpoint(), "broker link closed");
        }
        Ok(())
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn metrics(&self) -> &Arc<BrokerMetrics> {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::BrokerError,
        memory::{MemoryBroker, MemoryConnector},
    };

    fn connection(broker: &MemoryBroker) -> BrokerConnection<MemoryConnector> {
        BrokerConnection::new(
            broker.connector(),
            &BrokerSettings::default(),
            Arc::new(BrokerMetrics::new("memory")),
        )
    }

    #[tokio::test]
    async fn open_link_is_shared() {
        let broker = MemoryBroker::new();
        let connection = connection(&broker);

        let first = connection.get_handle().await.unwrap();
        let second = connection.get_handle().await.unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(broker.links_created(), 1);
        assert_eq!(connection.metrics().snapshot().links_opened, 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_link() {
        let broker = MemoryBroker::new();
        let connection = Arc::new(connection(&broker));

        let (a, b, c) = tokio::join!(
            connection.get_handle(),
            connection.get_handle(),
            connection.get_handle()
        );

        assert_eq!(a.unwrap().id(), b.unwrap().id());
        assert!(c.is_ok());
        assert_eq!(broker.links_created(), 1);
    }

    #[tokio::test]
    async fn shutdown_is_observed_and_next_call_reconnects() {
        let broker = MemoryBroker::new();
        let connection = connection(&broker);

        let first = connection.get_handle().await.unwrap();
        first.sever("connection reset");
        assert_eq!(connection.metrics().snapshot().links_closed, 1);

        let second = connection.get_handle().await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(broker.links_created(), 2);
        assert_eq!(connection.metrics().snapshot().links_opened, 2);
    }

    #[tokio::test]
    async fn connect_failures_are_retried() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(3);
        let connection = connection(&broker);

        assert!(connection.get_handle().await.is_ok());
        assert_eq!(broker.links_created(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_connection_error() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(4);
        let connection = connection(&broker);

        let err = connection.get_handle().await.unwrap_err();
        assert!(matches!(err, BrokerError::ConnectionError(_)));
        assert_eq!(broker.links_created(), 0);
    }

    #[tokio::test]
    async fn close_disconnects_once() {
        let broker = MemoryBroker::new();
        let connection = connection(&broker);

        let link = connection.get_handle().await.unwrap();
        connection.close().await.unwrap();
        connection.close().await.unwrap();

        assert!(!link.is_open());
        assert_eq!(connection.metrics().snapshot().links_closed, 1);
    }
}
