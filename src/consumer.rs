// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Pooled Message Consumer
//!
//! Subscribes handlers to topics over leased channels. `subscribe` returns as
//! soon as the subscription is registered; delivery runs on a background task
//! until the cancellation token fires or the broker ends the subscription.
//!
//! The task owns the lease. Whatever ends it, the subscription is cancelled
//! and the lease handed back exactly once. A handler already running when
//! cancellation fires is allowed to finish and its frame is settled normally.

use crate::{
    delivery,
    errors::{BrokerError, BrokerResult, HandlerError},
    message::{new_message_id, MessageContext},
    pool::{Lease, Pool},
    settings::{BrokerSettings, MalformedFramePolicy},
    transport::{Channel, HandleFactory, Subscription, TransportHandle},
};
use async_trait::async_trait;
use opentelemetry::global;
use serde::de::DeserializeOwned;
use std::{fmt, future::Future, marker::PhantomData, sync::Arc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Receives deserialized messages.
///
/// Implemented for every `Fn(MessageContext<T>) -> impl Future<Output =
/// Result<(), HandlerError>>`, so plain async closures can be subscribed.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync + 'static {
    async fn handle(&self, message: MessageContext<T>) -> Result<(), HandlerError>;
}

#[async_trait]
impl<T, F, Fut> MessageHandler<T> for F
where
    T: Send + 'static,
    F: Fn(MessageContext<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: MessageContext<T>) -> Result<(), HandlerError> {
        (self)(message).await
    }
}

/// Subscribes handlers through a [`Pool`].
pub struct Consumer<F: HandleFactory> {
    pool: Pool<F>,
    settings: Arc<BrokerSettings>,
}

impl<F: HandleFactory> Clone for Consumer<F> {
    fn clone(&self) -> Self {
        Consumer {
            pool: self.pool.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<F: HandleFactory> Consumer<F> {
    /// Creates a consumer leasing channels from `pool`.
    ///
    /// # Parameters
    /// * `pool` - Source of the channels subscriptions run on
    /// * `settings` - Prefetch, size ceiling, malformed frame policy and
    ///   connection name used in consumer tags
    ///
    /// # Returns
    /// A consumer that can be cloned and used concurrently
    pub fn new(pool: Pool<F>, settings: Arc<BrokerSettings>) -> Self {
        Consumer { pool, settings }
    }

    /// Subscribes `handler` to `topic`.
    ///
    /// # Parameters
    /// * `topic` - Queue or subject to consume
    /// * `handler` - Called once per deserialized message
    /// * `token` - Cancelling it (or [`SubscriptionHandle::cancel`]) stops
    ///   delivery and returns the channel to the pool
    ///
    /// # Returns
    /// A handle on the running subscription, once the broker registered it
    pub async fn subscribe<T, H>(
        &self,
        topic: &str,
        handler: H,
        token: CancellationToken,
    ) -> BrokerResult<SubscriptionHandle>
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T>,
    {
        let lease = self.pool.acquire().await?;

        if let Err(err) = lease.set_prefetch(self.settings.prefetch).await {
            error!(
                topic,
                prefetch = self.settings.prefetch,
                error = err.to_string(),
                "failure to configure prefetch"
            );
            return Err(err);
        }

        let consumer_tag = format!("{}-{}", self.settings.connection_name, new_message_id());
        let subscription = lease.subscribe(topic, &consumer_tag).await.map_err(|err| {
            error!(topic, error = err.to_string(), "failure to subscribe");
            err
        })?;

        info!(
            topic,
            consumer_tag = consumer_tag.as_str(),
            prefetch = self.settings.prefetch,
            "subscribed"
        );

        let token = token.child_token();
        let worker = DeliveryLoop {
            topic: topic.to_owned(),
            lease,
            subscription,
            handler,
            token: token.clone(),
            policy: self.settings.malformed_frames,
            ceiling: self.settings.max_message_bytes(),
            _message: PhantomData,
        };

        Ok(SubscriptionHandle {
            topic: topic.to_owned(),
            consumer_tag,
            token,
            task: tokio::spawn(worker.run()),
        })
    }

    /// Subscribes a handler that only needs the payload.
    pub async fn subscribe_payload<T, H, Fut>(
        &self,
        topic: &str,
        handler: H,
        token: CancellationToken,
    ) -> BrokerResult<SubscriptionHandle>
    where
        T: DeserializeOwned + Send + 'static,
        H: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.subscribe(
            topic,
            move |message: MessageContext<T>| handler(message.payload),
            token,
        )
        .await
    }

    /// The pool subscriptions lease their channels from.
    pub fn pool(&self) -> &Pool<F> {
        &self.pool
    }
}

type SubscriptionOf<F> = <<F as HandleFactory>::Handle as Channel>::Subscription;

struct DeliveryLoop<F: HandleFactory, T, H> {
    topic: String,
    lease: Lease<F>,
    subscription: SubscriptionOf<F>,
    handler: H,
    token: CancellationToken,
    policy: MalformedFramePolicy,
    ceiling: Option<usize>,
    _message: PhantomData<fn() -> T>,
}

impl<F, T, H> DeliveryLoop<F, T, H>
where
    F: HandleFactory,
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T>,
{
    async fn run(self) {
        let DeliveryLoop {
            topic,
            lease,
            mut subscription,
            handler,
            token,
            policy,
            ceiling,
            ..
        } = self;
        let tracer = global::tracer("brokerpool consumer");

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(topic = topic.as_str(), "subscription cancelled");
                    break;
                }
                next = subscription.next_frame() => next,
            };

            match next {
                Some(Ok(frame)) => {
                    if let Err(err) =
                        delivery::consume(&tracer, frame, &handler, policy, ceiling).await
                    {
                        error!(
                            topic = topic.as_str(),
                            error = err.to_string(),
                            "failure to consume frame"
                        );
                    }
                }
                Some(Err(err)) => {
                    error!(
                        topic = topic.as_str(),
                        error = err.to_string(),
                        "subscription stream error"
                    );
                    if !lease.is_open() {
                        break;
                    }
                }
                None => {
                    warn!(topic = topic.as_str(), "subscription ended by the broker");
                    break;
                }
            }
        }

        if let Err(err) = subscription.unsubscribe().await {
            warn!(
                topic = topic.as_str(),
                error = err.to_string(),
                "failure to unsubscribe"
            );
        }
        lease.release();
        info!(topic = topic.as_str(), "unsubscribed");
    }
}

/// A running subscription.
///
/// Dropping the handle leaves the subscription running; cancel it through
/// the handle or the token passed to [`Consumer::subscribe`].
pub struct SubscriptionHandle {
    topic: String,
    consumer_tag: String,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Stops delivery. Safe to call any number of times.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// True once the subscription was torn down and its channel returned.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the teardown to complete.
    pub async fn closed(self) -> BrokerResult<()> {
        self.task.await.map_err(|err| {
            error!(
                topic = self.topic.as_str(),
                error = err.to_string(),
                "subscription task failed"
            );
            BrokerError::ConsumerError(err.to_string())
        })
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("topic", &self.topic)
            .field("consumer_tag", &self.consumer_tag)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::{MemoryBroker, MemoryChannelFactory},
        message::DeliveryOutcome,
        metrics::BrokerMetrics,
    };
    use serde::Deserialize;
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };
    use tokio::sync::Notify;

    #[derive(Debug, Deserialize)]
    struct Job {
        id: u32,
    }

    fn consumer(broker: &MemoryBroker, settings: BrokerSettings) -> Consumer<MemoryChannelFactory> {
        let pool = Pool::new(
            broker.channel_factory(),
            &settings,
            Arc::new(BrokerMetrics::new("memory")),
        );
        Consumer::new(pool, Arc::new(settings))
    }

    async fn eventually(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn outcomes(broker: &MemoryBroker) -> Vec<DeliveryOutcome> {
        broker.settlements().into_iter().map(|s| s.outcome).collect()
    }

    #[tokio::test]
    async fn successful_handler_acks_each_message() {
        let broker = MemoryBroker::new();
        let consumer = consumer(&broker, BrokerSettings::default());
        let handled = Arc::new(AtomicU32::new(0));

        let counter = handled.clone();
        let handle = consumer
            .subscribe(
                "jobs",
                move |message: MessageContext<Job>| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(message.payload.id, Ordering::SeqCst);
                        Ok::<(), HandlerError>(())
                    }
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        broker.inject("jobs", br#"{"id":1}"#.to_vec());
        broker.inject("jobs", br#"{"id":2}"#.to_vec());
        eventually(|| broker.settlements().len() == 2).await;

        assert_eq!(handled.load(Ordering::SeqCst), 3);
        assert_eq!(
            outcomes(&broker),
            vec![DeliveryOutcome::Acknowledged, DeliveryOutcome::Acknowledged]
        );
        assert!(handle.consumer_tag().starts_with("brokerpool-"));
        assert_eq!(
            format!("{handle:?}"),
            format!(
                r#"SubscriptionHandle {{ topic: "jobs", consumer_tag: "{}", cancelled: false }}"#,
                handle.consumer_tag()
            )
        );
        handle.cancel();
        handle.closed().await.unwrap();
    }

    #[tokio::test]
    async fn failed_message_is_requeued_and_redelivered() {
        let broker = MemoryBroker::new();
        let consumer = consumer(&broker, BrokerSettings::default());
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let handle = consumer
            .subscribe(
                "jobs",
                move |_: MessageContext<Job>| {
                    let attempt = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt == 0 {
                            Err::<(), HandlerError>("transient".into())
                        } else {
                            Ok::<(), HandlerError>(())
                        }
                    }
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        broker.inject("jobs", br#"{"id":1}"#.to_vec());
        eventually(|| broker.settlements().len() == 2).await;

        assert_eq!(
            outcomes(&broker),
            vec![DeliveryOutcome::NackRequeue, DeliveryOutcome::Acknowledged]
        );
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        handle.cancel();
        handle.closed().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_frame_is_rejected_by_default() {
        let broker = MemoryBroker::new();
        let consumer = consumer(&broker, BrokerSettings::default());

        let handle = consumer
            .subscribe_payload(
                "jobs",
                |_: Job| async { Ok::<(), HandlerError>(()) },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        broker.inject("jobs", b"{broken".to_vec());
        eventually(|| !broker.settlements().is_empty()).await;

        assert_eq!(outcomes(&broker), vec![DeliveryOutcome::NackDrop]);
        assert_eq!(broker.backlog("jobs"), 0);
        handle.cancel();
        handle.closed().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_mid_handler_lets_it_finish_then_releases_once() {
        let broker = MemoryBroker::new();
        let consumer = consumer(&broker, BrokerSettings::default());
        let started = Arc::new(Notify::new());
        let proceed = Arc::new(Notify::new());

        let (on_start, gate) = (started.clone(), proceed.clone());
        let handle = consumer
            .subscribe(
                "jobs",
                move |_: MessageContext<Job>| {
                    let (on_start, gate) = (on_start.clone(), gate.clone());
                    async move {
                        on_start.notify_one();
                        gate.notified().await;
                        Ok::<(), HandlerError>(())
                    }
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        broker.inject("jobs", br#"{"id":1}"#.to_vec());
        started.notified().await;

        handle.cancel();
        handle.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        assert!(broker.settlements().is_empty());

        proceed.notify_one();
        handle.closed().await.unwrap();

        assert_eq!(outcomes(&broker), vec![DeliveryOutcome::Acknowledged]);
        assert_eq!(broker.unsubscribes(), 1);
        let snapshot = consumer.pool().metrics().snapshot();
        assert_eq!(snapshot.connections_opened, 1);
        assert_eq!(snapshot.connections_closed, 1);
        assert_eq!(consumer.pool().idle(), 1);
    }

    #[tokio::test]
    async fn parent_token_stops_delivery() {
        let broker = MemoryBroker::new();
        let consumer = consumer(&broker, BrokerSettings::default());
        let token = CancellationToken::new();

        let handle = consumer
            .subscribe_payload(
                "jobs",
                |_: Job| async { Ok::<(), HandlerError>(()) },
                token.clone(),
            )
            .await
            .unwrap();

        token.cancel();
        handle.closed().await.unwrap();

        broker.inject("jobs", br#"{"id":1}"#.to_vec());
        assert_eq!(broker.backlog("jobs"), 1);
        assert!(broker.settlements().is_empty());
        assert_eq!(broker.unsubscribes(), 1);
    }

    #[tokio::test]
    async fn prefetch_is_applied_to_the_leased_channel() {
        let broker = MemoryBroker::new();
        let consumer = consumer(
            &broker,
            BrokerSettings {
                prefetch: 25,
                ..Default::default()
            },
        );

        let handle = consumer
            .subscribe_payload(
                "jobs",
                |_: Job| async { Ok::<(), HandlerError>(()) },
                CancellationToken::new(),
            )
            .await
            .unwrap();
        handle.cancel();
        handle.closed().await.unwrap();

        let lease = consumer.pool().acquire().await.unwrap();
        assert_eq!(lease.prefetch(), 25);
    }

    #[tokio::test]
    async fn prefetch_bounds_frames_in_flight_while_handler_is_busy() {
        let broker = MemoryBroker::new();
        let consumer = consumer(
            &broker,
            BrokerSettings {
                prefetch: 1,
                ..Default::default()
            },
        );
        let started = Arc::new(Notify::new());
        let proceed = Arc::new(Notify::new());
        let calls = Arc::new(AtomicU32::new(0));

        let (on_start, gate, counter) = (started.clone(), proceed.clone(), calls.clone());
        let handle = consumer
            .subscribe(
                "jobs",
                move |_: MessageContext<Job>| {
                    let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
                    let (on_start, gate) = (on_start.clone(), gate.clone());
                    async move {
                        if first {
                            on_start.notify_one();
                            gate.notified().await;
                        }
                        Ok::<(), HandlerError>(())
                    }
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        for id in 1..=5 {
            broker.inject("jobs", format!(r#"{{"id":{id}}}"#));
        }
        started.notified().await;
        assert_eq!(broker.backlog("jobs"), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        proceed.notify_one();
        eventually(|| broker.settlements().len() == 5).await;
        assert_eq!(broker.backlog("jobs"), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        handle.cancel();
        handle.closed().await.unwrap();
    }

    #[tokio::test]
    async fn prefetch_failure_is_reported_as_is_and_returns_the_lease() {
        let broker = MemoryBroker::new();
        broker.fail_next_prefetches(1);
        let consumer = consumer(&broker, BrokerSettings::default());

        let err = consumer
            .subscribe_payload(
                "jobs",
                |_: Job| async { Ok::<(), HandlerError>(()) },
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(
            err,
            BrokerError::QoSDeclarationError("injected qos failure".to_owned())
        );
        assert_eq!(broker.subscriptions(), 0);
        assert_eq!(consumer.pool().idle(), 1);
    }

    #[tokio::test]
    async fn failed_subscribe_returns_the_lease() {
        let broker = MemoryBroker::new();
        broker.fail_next_subscribes(1);
        let consumer = consumer(&broker, BrokerSettings::default());

        let err = consumer
            .subscribe_payload(
                "jobs",
                |_: Job| async { Ok::<(), HandlerError>(()) },
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, BrokerError::SubscribeError(_, _)));
        let snapshot = consumer.pool().metrics().snapshot();
        assert_eq!(snapshot.connections_opened, snapshot.connections_closed);
        assert_eq!(consumer.pool().idle(), 1);
    }
}
