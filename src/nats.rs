// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # NATS Transport
//!
//! Core NATS over `async-nats`. Every pooled handle is its own client
//! connection. NATS has no exchanges, so messages go to the envelope's
//! destination subject. A publish is confirmed by a server round-trip
//! (`flush`). Core NATS has no prefetch and no acknowledgements; settling a
//! frame only logs the outcome.

use crate::{
    broker::Broker,
    errors::{BrokerError, BrokerResult},
    message::{HeaderValue, Headers},
    settings::BrokerSettings,
    transport::{
        Acknowledger, Channel, Envelope, HandleFactory, InboundFrame, PendingConfirm,
        Subscription, TransportHandle,
    },
};
use async_nats::{connection::State, Client, ConnectOptions, HeaderMap, Subscriber};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{FutureExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error};

/// Transport name used for metrics and logs.
pub const TRANSPORT: &str = "nats";

const MESSAGE_ID_HEADER: &str = "Nats-Msg-Id";
const CORRELATION_ID_HEADER: &str = "Correlation-Id";
const CONTENT_TYPE_HEADER: &str = "Content-Type";

/// Builds a pooled NATS broker. Nothing connects until first use.
pub fn broker(settings: BrokerSettings) -> BrokerResult<Broker<NatsClientFactory>> {
    Broker::new(NatsClientFactory::new(&settings), settings)
}

/// Opens one client connection per pooled handle.
pub struct NatsClientFactory {
    address: String,
    name: String,
    credentials: Option<(String, String)>,
    require_tls: bool,
}

impl NatsClientFactory {
    pub fn new(settings: &BrokerSettings) -> Self {
        NatsClientFactory {
            address: format!("nats://{}", settings.endpoint()),
            name: settings.connection_name.clone(),
            credentials: (!settings.username.is_empty())
                .then(|| (settings.username.clone(), settings.password.clone())),
            require_tls: settings.use_tls,
        }
    }
}

#[async_trait]
impl HandleFactory for NatsClientFactory {
    type Handle = NatsHandle;

    fn transport(&self) -> &'static str {
        TRANSPORT
    }

    async fn create(&self) -> BrokerResult<NatsHandle> {
        let mut options = ConnectOptions::new()
            .name(self.name.clone())
            .require_tls(self.require_tls);
        if let Some((user, password)) = &self.credentials {
            options = options.user_and_password(user.clone(), password.clone());
        }

        match options.connect(self.address.as_str()).await {
            Ok(client) => {
                debug!(address = self.address.as_str(), "nats connected");
                Ok(NatsHandle {
                    client,
                    closed: AtomicBool::new(false),
                })
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(BrokerError::ConnectionError(err.to_string()))
            }
        }
    }
}

pub struct NatsHandle {
    client: Client,
    closed: AtomicBool,
}

impl NatsHandle {
    pub fn client(&self) -> &Client {
        &self.client
    }
}

impl TransportHandle for NatsHandle {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && matches!(self.client.connection_state(), State::Connected)
    }
}

#[async_trait]
impl Channel for NatsHandle {
    type Subscription = NatsSubscription;

    async fn enable_confirms(&self) -> BrokerResult<()> {
        Ok(())
    }

    async fn publish(&self, envelope: &Envelope, body: &[u8]) -> BrokerResult<PendingConfirm> {
        self.client
            .publish_with_headers(
                envelope.destination().to_owned(),
                header_map(envelope),
                Bytes::copy_from_slice(body),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                BrokerError::PublishingError(err.to_string())
            })?;

        let client = self.client.clone();
        Ok(async move {
            client
                .flush()
                .await
                .map_err(|err| BrokerError::PublishingError(err.to_string()))
        }
        .boxed())
    }

    async fn set_prefetch(&self, _prefetch: u16) -> BrokerResult<()> {
        Ok(())
    }

    async fn subscribe(&self, topic: &str, consumer_tag: &str) -> BrokerResult<NatsSubscription> {
        let subscriber = self
            .client
            .subscribe(topic.to_owned())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to subscribe");
                BrokerError::SubscribeError(topic.to_owned(), err.to_string())
            })?;
        debug!(topic, consumer_tag, "nats subscription created");

        Ok(NatsSubscription {
            subscriber: Some(subscriber),
            subject: topic.to_owned(),
        })
    }

    async fn close(&self) -> BrokerResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.client
            .flush()
            .await
            .map_err(|err| BrokerError::ConnectionError(err.to_string()))
    }
}

pub struct NatsSubscription {
    subscriber: Option<Subscriber>,
    subject: String,
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next_frame(&mut self) -> Option<BrokerResult<InboundFrame>> {
        let message = self.subscriber.as_mut()?.next().await?;
        let (headers, correlation_id, message_id) = split_headers(message.headers.as_ref());

        Some(Ok(InboundFrame {
            topic: message.subject.to_string(),
            body: message.payload.to_vec(),
            headers,
            correlation_id,
            message_id,
            redelivered: false,
            acker: Box::new(NoopAcker),
        }))
    }

    async fn unsubscribe(&mut self) -> BrokerResult<()> {
        let Some(mut subscriber) = self.subscriber.take() else {
            return Ok(());
        };
        subscriber
            .unsubscribe()
            .await
            .map_err(|err| BrokerError::UnsubscribeError(self.subject.clone(), err.to_string()))
    }
}

struct NoopAcker;

#[async_trait]
impl Acknowledger for NoopAcker {
    async fn ack(&self) -> BrokerResult<()> {
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        debug!(requeue, "core nats cannot redeliver, message dropped");
        Ok(())
    }
}

fn header_map(envelope: &Envelope) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (key, value) in &envelope.headers {
        map.insert(key.as_str(), value.to_string());
    }
    map.insert(CONTENT_TYPE_HEADER, envelope.content_type);
    if !envelope.message_id.is_empty() {
        map.insert(MESSAGE_ID_HEADER, envelope.message_id.as_str());
    }
    if !envelope.correlation_id.is_empty() {
        map.insert(CORRELATION_ID_HEADER, envelope.correlation_id.as_str());
    }
    map
}

/// Splits NATS headers into application headers and the two identifiers.
fn split_headers(map: Option<&HeaderMap>) -> (Headers, Option<String>, Option<String>) {
    let mut headers = Headers::default();
    let mut correlation_id = None;
    let mut message_id = None;

    for (name, values) in map.into_iter().flat_map(|map| map.iter()) {
        let Some(value) = values.first().map(|v| v.to_string()) else {
            continue;
        };
        let name = name.to_string();
        if name.eq_ignore_ascii_case(MESSAGE_ID_HEADER) {
            message_id = Some(value);
        } else if name.eq_ignore_ascii_case(CORRELATION_ID_HEADER) {
            correlation_id = Some(value);
        } else if !name.eq_ignore_ascii_case(CONTENT_TYPE_HEADER) {
            headers.insert(name, HeaderValue::String(value));
        }
    }

    (headers, correlation_id, message_id)
}
