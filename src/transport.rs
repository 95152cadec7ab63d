// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Abstraction
//!
//! The seams every broker transport plugs into. A transport provides:
//!
//! - a [`HandleFactory`] creating poolable [`Channel`] handles,
//! - optionally a [`Connector`] for a single shared link,
//! - a [`Subscription`] stream of [`InboundFrame`]s, each carrying an
//!   [`Acknowledger`] used to settle it.
//!
//! Pooling, retry, rate limiting and delivery discipline live above these
//! traits and are shared by all transports.

use crate::{
    errors::BrokerResult,
    message::{DeliveryOutcome, Headers, JSON_CONTENT_TYPE},
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;

/// Resolves once the broker confirmed (or rejected) a publish.
pub type PendingConfirm = BoxFuture<'static, BrokerResult<()>>;

/// Callback fired when a link shuts down unexpectedly, with the reason.
pub type ShutdownObserver = Box<dyn Fn(String) + Send + Sync>;

/// Anything the pool or connection cache can hold.
pub trait TransportHandle: Send + Sync + 'static {
    fn is_open(&self) -> bool;
}

/// Everything the producer hands to the transport besides the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub exchange: String,
    pub routing_key: String,
    pub headers: Headers,
    pub correlation_id: String,
    pub message_id: String,
    pub persistent: bool,
    pub content_type: &'static str,
}

impl Envelope {
    pub fn new(exchange: &str, routing_key: &str) -> Self {
        Envelope {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            headers: Headers::default(),
            correlation_id: String::new(),
            message_id: String::new(),
            persistent: true,
            content_type: JSON_CONTENT_TYPE,
        }
    }

    /// Address used by transports without exchanges: the routing key, or the
    /// exchange when no routing key was given.
    pub fn destination(&self) -> &str {
        if self.routing_key.is_empty() {
            &self.exchange
        } else {
            &self.routing_key
        }
    }
}

/// Settles one inbound frame with the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> BrokerResult<()>;
    async fn nack(&self, requeue: bool) -> BrokerResult<()>;
}

/// A raw message received from a subscription.
pub struct InboundFrame {
    pub topic: String,
    pub body: Vec<u8>,
    pub headers: Headers,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    pub redelivered: bool,
    pub acker: Box<dyn Acknowledger>,
}

impl InboundFrame {
    /// Settles the frame. Consumes it, so a frame is settled at most once.
    pub async fn settle(self, outcome: DeliveryOutcome) -> BrokerResult<()> {
        settle(self.acker.as_ref(), outcome).await
    }
}

pub(crate) async fn settle(acker: &dyn Acknowledger, outcome: DeliveryOutcome) -> BrokerResult<()> {
    match outcome {
        DeliveryOutcome::Acknowledged => acker.ack().await,
        DeliveryOutcome::NackRequeue => acker.nack(true).await,
        DeliveryOutcome::NackDrop => acker.nack(false).await,
    }
}

impl std::fmt::Debug for InboundFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundFrame")
            .field("topic", &self.topic)
            .field("len", &self.body.len())
            .field("correlation_id", &self.correlation_id)
            .field("message_id", &self.message_id)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// An active subscription on a leased channel.
#[async_trait]
pub trait Subscription: Send + 'static {
    /// Next frame, or `None` once the broker ended the subscription.
    async fn next_frame(&mut self) -> Option<BrokerResult<InboundFrame>>;

    /// Stops new deliveries. Frames already handed out can still be settled.
    async fn unsubscribe(&mut self) -> BrokerResult<()>;
}

/// A poolable channel over which publish and subscribe happen.
#[async_trait]
pub trait Channel: TransportHandle {
    type Subscription: Subscription;

    /// Arms publisher confirms on this channel. Must be idempotent.
    async fn enable_confirms(&self) -> BrokerResult<()>;

    /// Publishes `body`. The returned future resolves with the broker confirm;
    /// it may be dropped when confirms are not wanted.
    async fn publish(&self, envelope: &Envelope, body: &[u8]) -> BrokerResult<PendingConfirm>;

    /// Limits unacknowledged deliveries in flight on this channel.
    async fn set_prefetch(&self, prefetch: u16) -> BrokerResult<()>;

    /// Starts consuming `topic` on this channel.
    ///
    /// # Parameters
    /// * `topic` - Queue or subject to consume from
    /// * `consumer_tag` - Identifies the consumer to the broker
    ///
    /// # Returns
    /// The subscription delivering frames until it is unsubscribed
    async fn subscribe(&self, topic: &str, consumer_tag: &str) -> BrokerResult<Self::Subscription>;

    /// Closes the channel. A closed channel reports `is_open() == false` and
    /// is dropped by the pool instead of being reused.
    async fn close(&self) -> BrokerResult<()>;
}

/// Creates the handles a [`crate::pool::Pool`] manages.
#[async_trait]
pub trait HandleFactory: Send + Sync + 'static {
    type Handle: Channel;

    /// Short transport name, used for metrics and logs.
    fn transport(&self) -> &'static str;

    /// Opens a new handle. Called through the pool's resilience pipeline.
    async fn create(&self) -> BrokerResult<Self::Handle>;

    /// Maps a facade topic onto `(exchange, routing_key)`.
    fn route(&self, topic: &str) -> (String, String) {
        (topic.to_owned(), topic.to_owned())
    }

    /// Releases whatever the factory holds besides pooled handles.
    async fn shutdown(&self) -> BrokerResult<()> {
        Ok(())
    }
}

/// Establishes the single shared link cached by
/// [`crate::connection::BrokerConnection`].
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Link: TransportHandle + Clone;

    fn endpoint(&self) -> String;

    async fn connect(&self) -> BrokerResult<Self::Link>;

    /// Registers `observer` to run when `link` shuts down unexpectedly.
    fn on_shutdown(&self, link: &Self::Link, observer: ShutdownObserver);

    async fn disconnect(&self, link: &Self::Link) -> BrokerResult<()>;
}
