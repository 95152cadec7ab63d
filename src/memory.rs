// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Process Loopback Transport
//!
//! A broker living inside the process. Topics behave like queues: each
//! message goes to one subscriber (round-robin), waits in a backlog while no
//! one is subscribed, and is redelivered when negatively acknowledged with
//! requeue. A subscription opened on a channel with a prefetch limit holds at
//! most that many unsettled frames; the rest wait in the backlog.
//!
//! The broker records what was published and how every frame was settled,
//! and can be told to fail creates, connects, publishes or subscribes, to
//! delay publishes, or to never confirm. That makes it the test double for
//! the pool, producer and consumer.

use crate::{
    broker::Broker,
    errors::{BrokerError, BrokerResult},
    message::{DeliveryOutcome, Headers},
    settings::BrokerSettings,
    transport::{
        Acknowledger, Channel, Connector, Envelope, HandleFactory, InboundFrame, PendingConfirm,
        ShutdownObserver, Subscription, TransportHandle,
    },
};
use async_trait::async_trait;
use futures_util::{future, FutureExt};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::debug;

/// How the loopback broker answers publisher confirms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfirmMode {
    #[default]
    Immediate,
    /// The confirm never arrives.
    Never,
    /// The broker negatively confirms every publish.
    Reject,
}

/// A message as held by the loopback broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub topic: String,
    pub body: Vec<u8>,
    pub headers: Headers,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    pub redelivered: bool,
}

/// Record of one settled frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub message_id: Option<String>,
    pub outcome: DeliveryOutcome,
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<StoredMessage>,
    /// Unsettled frames allowed in flight, zero for no limit.
    prefetch: usize,
    in_flight: usize,
}

impl Subscriber {
    fn has_credit(&self) -> bool {
        self.prefetch == 0 || self.in_flight < self.prefetch
    }
}

#[derive(Default)]
struct Topic {
    subscribers: Vec<Subscriber>,
    backlog: VecDeque<StoredMessage>,
    cursor: usize,
}

impl Topic {
    /// Hands backlog frames to subscribers with prefetch credit, round-robin.
    fn pump(&mut self) {
        while !self.backlog.is_empty() {
            let Some(idx) = self.next_with_credit() else {
                return;
            };
            let Some(message) = self.backlog.pop_front() else {
                return;
            };
            match self.subscribers[idx].tx.send(message) {
                Ok(()) => self.subscribers[idx].in_flight += 1,
                Err(mpsc::error::SendError(returned)) => {
                    self.subscribers.remove(idx);
                    self.backlog.push_front(returned);
                }
            }
        }
    }

    fn next_with_credit(&mut self) -> Option<usize> {
        let count = self.subscribers.len();
        for _ in 0..count {
            let idx = self.cursor % count;
            self.cursor = self.cursor.wrapping_add(1);
            if self.subscribers[idx].has_credit() {
                return Some(idx);
            }
        }
        None
    }
}

#[derive(Default)]
struct State {
    topics: Mutex<HashMap<String, Topic>>,
    published: Mutex<Vec<StoredMessage>>,
    settlements: Mutex<Vec<Settlement>>,
    confirm_mode: Mutex<ConfirmMode>,
    publish_delay: Mutex<Duration>,
    channels: Mutex<Vec<Arc<AtomicBool>>>,
    fail_creates: AtomicU32,
    fail_connects: AtomicU32,
    fail_publishes: AtomicU32,
    fail_subscribes: AtomicU32,
    fail_prefetches: AtomicU32,
    handles_created: AtomicUsize,
    links_created: AtomicUsize,
    subscriptions: AtomicUsize,
    unsubscribes: AtomicUsize,
    next_id: AtomicU64,
}

/// Shared loopback broker. Clones talk to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<State>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        MemoryBroker::default()
    }

    /// Builds a pooled broker bundle on top of this loopback broker.
    pub fn connect(&self, settings: BrokerSettings) -> BrokerResult<Broker<MemoryChannelFactory>> {
        Broker::new(self.channel_factory(), settings)
    }

    pub fn channel_factory(&self) -> MemoryChannelFactory {
        MemoryChannelFactory {
            broker: self.clone(),
        }
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    pub fn set_confirm_mode(&self, mode: ConfirmMode) {
        *self.state.confirm_mode.lock() = mode;
    }

    pub fn set_publish_delay(&self, delay: Duration) {
        *self.state.publish_delay.lock() = delay;
    }

    pub fn fail_next_creates(&self, count: u32) {
        self.state.fail_creates.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.state.fail_connects.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_publishes(&self, count: u32) {
        self.state.fail_publishes.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_subscribes(&self, count: u32) {
        self.state.fail_subscribes.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_prefetches(&self, count: u32) {
        self.state.fail_prefetches.store(count, Ordering::SeqCst);
    }

    /// Simulates the broker closing every channel it handed out.
    pub fn sever_channels(&self) {
        for open in self.state.channels.lock().drain(..) {
            open.store(false, Ordering::SeqCst);
        }
    }

    /// Channels created through the factory.
    pub fn handles_created(&self) -> usize {
        self.state.handles_created.load(Ordering::SeqCst)
    }

    /// Links created through the connector.
    pub fn links_created(&self) -> usize {
        self.state.links_created.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> usize {
        self.state.subscriptions.load(Ordering::SeqCst)
    }

    pub fn unsubscribes(&self) -> usize {
        self.state.unsubscribes.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<StoredMessage> {
        self.state.published.lock().clone()
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.state.settlements.lock().clone()
    }

    /// Messages waiting for a subscriber on `topic`.
    pub fn backlog(&self, topic: &str) -> usize {
        self.state
            .topics
            .lock()
            .get(topic)
            .map(|t| t.backlog.len())
            .unwrap_or_default()
    }

    /// Pushes a raw frame onto `topic`, bypassing any producer.
    pub fn inject(&self, topic: &str, body: impl Into<Vec<u8>>) {
        self.route(StoredMessage {
            topic: topic.to_owned(),
            body: body.into(),
            headers: Headers::default(),
            correlation_id: None,
            message_id: None,
            redelivered: false,
        });
    }

    fn next_id(&self) -> u64 {
        self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn route(&self, message: StoredMessage) {
        let mut topics = self.state.topics.lock();
        let topic = topics.entry(message.topic.clone()).or_default();
        topic.backlog.push_back(message);
        topic.pump();
    }

    fn attach(
        &self,
        name: &str,
        prefetch: usize,
    ) -> (u64, mpsc::UnboundedReceiver<StoredMessage>) {
        let id = self.next_id();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut topics = self.state.topics.lock();
        let topic = topics.entry(name.to_owned()).or_default();
        topic.subscribers.push(Subscriber {
            id,
            tx,
            prefetch,
            in_flight: 0,
        });
        topic.pump();

        (id, rx)
    }

    fn detach(&self, name: &str, id: u64, mut rx: mpsc::UnboundedReceiver<StoredMessage>) {
        rx.close();
        let mut undelivered = vec![];
        while let Ok(message) = rx.try_recv() {
            undelivered.push(message);
        }

        let mut topics = self.state.topics.lock();
        let topic = topics.entry(name.to_owned()).or_default();
        topic.subscribers.retain(|sub| sub.id != id);
        for message in undelivered.into_iter().rev() {
            topic.backlog.push_front(message);
        }
        topic.pump();
    }

    /// Frees the subscriber's prefetch slot. A requeued frame goes back to
    /// the head of the queue.
    fn settle(&self, name: &str, subscriber: u64, requeue: Option<StoredMessage>) {
        let mut topics = self.state.topics.lock();
        let topic = topics.entry(name.to_owned()).or_default();
        if let Some(sub) = topic.subscribers.iter_mut().find(|sub| sub.id == subscriber) {
            sub.in_flight = sub.in_flight.saturating_sub(1);
        }
        if let Some(message) = requeue {
            topic.backlog.push_front(message);
        }
        topic.pump();
    }
}

/// Creates [`MemoryChannel`]s for the pool.
#[derive(Clone)]
pub struct MemoryChannelFactory {
    broker: MemoryBroker,
}

#[async_trait]
impl HandleFactory for MemoryChannelFactory {
    type Handle = MemoryChannel;

    fn transport(&self) -> &'static str {
        "memory"
    }

    async fn create(&self) -> BrokerResult<MemoryChannel> {
        if MemoryBroker::take_failure(&self.broker.state.fail_creates) {
            return Err(BrokerError::ChannelError("injected create failure".to_owned()));
        }

        self.broker.state.handles_created.fetch_add(1, Ordering::SeqCst);
        let id = self.broker.next_id();
        debug!(id, "memory channel created");

        let open = Arc::new(AtomicBool::new(true));
        self.broker.state.channels.lock().push(open.clone());

        Ok(MemoryChannel {
            id,
            broker: self.broker.clone(),
            open,
            confirms: AtomicBool::new(false),
            prefetch: AtomicU16::new(0),
        })
    }
}

pub struct MemoryChannel {
    id: u64,
    broker: MemoryBroker,
    open: Arc<AtomicBool>,
    confirms: AtomicBool,
    prefetch: AtomicU16,
}

impl MemoryChannel {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Simulates the broker closing this channel.
    pub fn sever(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn prefetch(&self) -> u16 {
        self.prefetch.load(Ordering::SeqCst)
    }

    pub fn confirms_enabled(&self) -> bool {
        self.confirms.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> BrokerResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BrokerError::ChannelError(format!("channel {} is closed", self.id)))
        }
    }
}

impl TransportHandle for MemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    type Subscription = MemorySubscription;

    async fn enable_confirms(&self) -> BrokerResult<()> {
        self.ensure_open()?;
        self.confirms.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, envelope: &Envelope, body: &[u8]) -> BrokerResult<PendingConfirm> {
        self.ensure_open()?;
        if MemoryBroker::take_failure(&self.broker.state.fail_publishes) {
            return Err(BrokerError::PublishingError("injected publish failure".to_owned()));
        }

        let delay = *self.broker.state.publish_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let message = StoredMessage {
            topic: envelope.destination().to_owned(),
            body: body.to_vec(),
            headers: envelope.headers.clone(),
            correlation_id: Some(envelope.correlation_id.clone()).filter(|id| !id.is_empty()),
            message_id: Some(envelope.message_id.clone()).filter(|id| !id.is_empty()),
            redelivered: false,
        };
        self.broker.state.published.lock().push(message.clone());
        self.broker.route(message);

        let mode = *self.broker.state.confirm_mode.lock();
        Ok(match mode {
            ConfirmMode::Immediate => future::ready(Ok(())).boxed(),
            ConfirmMode::Never => future::pending().boxed(),
            ConfirmMode::Reject => future::ready(Err(BrokerError::ConfirmNacked)).boxed(),
        })
    }

    async fn set_prefetch(&self, prefetch: u16) -> BrokerResult<()> {
        self.ensure_open()?;
        if MemoryBroker::take_failure(&self.broker.state.fail_prefetches) {
            return Err(BrokerError::QoSDeclarationError("injected qos failure".to_owned()));
        }
        self.prefetch.store(prefetch, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, consumer_tag: &str) -> BrokerResult<MemorySubscription> {
        self.ensure_open()?;
        if MemoryBroker::take_failure(&self.broker.state.fail_subscribes) {
            return Err(BrokerError::SubscribeError(
                topic.to_owned(),
                "injected subscribe failure".to_owned(),
            ));
        }

        let (id, rx) = self.broker.attach(topic, usize::from(self.prefetch()));
        self.broker.state.subscriptions.fetch_add(1, Ordering::SeqCst);
        debug!(topic, consumer_tag, "memory subscription attached");

        Ok(MemorySubscription {
            broker: self.broker.clone(),
            topic: topic.to_owned(),
            id,
            rx: Some(rx),
        })
    }

    async fn close(&self) -> BrokerResult<()> {
        self.sever();
        Ok(())
    }
}

pub struct MemorySubscription {
    broker: MemoryBroker,
    topic: String,
    id: u64,
    rx: Option<mpsc::UnboundedReceiver<StoredMessage>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_frame(&mut self) -> Option<BrokerResult<InboundFrame>> {
        let message = self.rx.as_mut()?.recv().await?;

        Some(Ok(InboundFrame {
            topic: message.topic.clone(),
            body: message.body.clone(),
            headers: message.headers.clone(),
            correlation_id: message.correlation_id.clone(),
            message_id: message.message_id.clone(),
            redelivered: message.redelivered,
            acker: Box::new(MemoryAcker {
                broker: self.broker.clone(),
                subscriber: self.id,
                message,
            }),
        }))
    }

    async fn unsubscribe(&mut self) -> BrokerResult<()> {
        if let Some(rx) = self.rx.take() {
            self.broker.detach(&self.topic, self.id, rx);
            self.broker.state.unsubscribes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        if let Some(rx) = self.rx.take() {
            self.broker.detach(&self.topic, self.id, rx);
        }
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    subscriber: u64,
    message: StoredMessage,
}

impl MemoryAcker {
    fn record(&self, outcome: DeliveryOutcome) {
        self.broker.state.settlements.lock().push(Settlement {
            message_id: self.message.message_id.clone(),
            outcome,
        });
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> BrokerResult<()> {
        self.record(DeliveryOutcome::Acknowledged);
        self.broker.settle(&self.message.topic, self.subscriber, None);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        let requeued = if requeue {
            self.record(DeliveryOutcome::NackRequeue);
            Some(StoredMessage {
                redelivered: true,
                ..self.message.clone()
            })
        } else {
            self.record(DeliveryOutcome::NackDrop);
            None
        };
        self.broker.settle(&self.message.topic, self.subscriber, requeued);
        Ok(())
    }
}

/// Connector producing [`MemoryLink`]s for [`crate::connection::BrokerConnection`].
#[derive(Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[derive(Clone)]
pub struct MemoryLink {
    id: u64,
    open: Arc<AtomicBool>,
    observers: Arc<Mutex<Vec<ShutdownObserver>>>,
}

impl MemoryLink {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Simulates the broker dropping the link.
    pub fn sever(&self, reason: &str) {
        self.open.store(false, Ordering::SeqCst);
        let observers: Vec<ShutdownObserver> = self.observers.lock().drain(..).collect();
        for observer in observers {
            observer(reason.to_owned());
        }
    }
}

impl fmt::Debug for MemoryLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryLink")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl TransportHandle for MemoryLink {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Link = MemoryLink;

    fn endpoint(&self) -> String {
        "memory://local".to_owned()
    }

    async fn connect(&self) -> BrokerResult<MemoryLink> {
        if MemoryBroker::take_failure(&self.broker.state.fail_connects) {
            return Err(BrokerError::ConnectionError("injected connect failure".to_owned()));
        }

        self.broker.state.links_created.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryLink {
            id: self.broker.next_id(),
            open: Arc::new(AtomicBool::new(true)),
            observers: Arc::new(Mutex::new(vec![])),
        })
    }

    fn on_shutdown(&self, link: &MemoryLink, observer: ShutdownObserver) {
        link.observers.lock().push(observer);
    }

    async fn disconnect(&self, link: &MemoryLink) -> BrokerResult<()> {
        link.open.store(false, Ordering::SeqCst);
        link.observers.lock().clear();
        Ok(())
    }
}
