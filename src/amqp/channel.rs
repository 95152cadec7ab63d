// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channels
//!
//! Pooled `lapin` channels: publishing with optional confirms, prefetch,
//! consuming and settling deliveries.

use super::{field_table, headers_from};
use crate::{
    errors::{BrokerError, BrokerResult},
    transport::{
        Acknowledger, Channel, Envelope, InboundFrame, PendingConfirm, Subscription,
        TransportHandle,
    },
};
use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
    },
    types::{FieldTable, ShortString},
    BasicProperties, Consumer,
};
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use tracing::{debug, error, warn};

/// How long `unsubscribe` waits for prefetched deliveries to drain.
const CANCEL_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

const PERSISTENT: u8 = 2;
const TRANSIENT: u8 = 1;

pub struct AmqpChannel {
    channel: lapin::Channel,
    confirms: AtomicBool,
}

impl AmqpChannel {
    pub(crate) fn new(channel: lapin::Channel) -> Self {
        AmqpChannel {
            channel,
            confirms: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &lapin::Channel {
        &self.channel
    }
}

impl TransportHandle for AmqpChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}

#[async_trait]
impl Channel for AmqpChannel {
    type Subscription = AmqpSubscription;

    async fn enable_confirms(&self) -> BrokerResult<()> {
        if self.confirms.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(err) = self
            .channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
        {
            self.confirms.store(false, Ordering::SeqCst);
            error!(error = err.to_string(), "failure to enable publisher confirms");
            return Err(BrokerError::ChannelError(err.to_string()));
        }
        Ok(())
    }

    async fn publish(&self, envelope: &Envelope, body: &[u8]) -> BrokerResult<PendingConfirm> {
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(envelope.content_type))
            .with_delivery_mode(if envelope.persistent {
                PERSISTENT
            } else {
                TRANSIENT
            })
            .with_correlation_id(ShortString::from(envelope.correlation_id.clone()))
            .with_message_id(ShortString::from(envelope.message_id.clone()))
            .with_headers(field_table(&envelope.headers));

        let confirm = self
            .channel
            .basic_publish(
                &envelope.exchange,
                &envelope.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                properties,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                BrokerError::PublishingError(err.to_string())
            })?;

        Ok(async move {
            match confirm.await {
                Ok(confirmation) if confirmation.is_nack() => Err(BrokerError::ConfirmNacked),
                Ok(_) => Ok(()),
                Err(err) => Err(BrokerError::PublishingError(err.to_string())),
            }
        }
        .boxed())
    }

    async fn set_prefetch(&self, prefetch: u16) -> BrokerResult<()> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|err| BrokerError::QoSDeclarationError(err.to_string()))
    }

    async fn subscribe(&self, topic: &str, consumer_tag: &str) -> BrokerResult<AmqpSubscription> {
        let consumer = self
            .channel
            .basic_consume(
                topic,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                BrokerError::SubscribeError(topic.to_owned(), err.to_string())
            })?;

        Ok(AmqpSubscription {
            channel: self.channel.clone(),
            consumer,
            queue: topic.to_owned(),
            consumer_tag: consumer_tag.to_owned(),
            active: true,
        })
    }

    async fn close(&self) -> BrokerResult<()> {
        self.channel
            .close(200, "closing")
            .await
            .map_err(|err| BrokerError::ChannelError(err.to_string()))
    }
}

pub struct AmqpSubscription {
    channel: lapin::Channel,
    consumer: Consumer,
    queue: String,
    consumer_tag: String,
    active: bool,
}

impl AmqpSubscription {
    fn frame(&self, delivery: Delivery) -> InboundFrame {
        let properties = &delivery.properties;

        InboundFrame {
            topic: self.queue.clone(),
            headers: headers_from(properties.headers().as_ref()),
            correlation_id: properties.correlation_id().as_ref().map(|id| id.as_str().to_owned()),
            message_id: properties.message_id().as_ref().map(|id| id.as_str().to_owned()),
            redelivered: delivery.redelivered,
            acker: Box::new(AmqpAcker(delivery.acker)),
            body: delivery.data,
        }
    }
}

#[async_trait]
impl Subscription for AmqpSubscription {
    async fn next_frame(&mut self) -> Option<BrokerResult<InboundFrame>> {
        if !self.active {
            return None;
        }

        match self.consumer.next().await? {
            Ok(delivery) => Some(Ok(self.frame(delivery))),
            Err(err) => Some(Err(BrokerError::ConsumerError(err.to_string()))),
        }
    }

    async fn unsubscribe(&mut self) -> BrokerResult<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;

        self.channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| {
                BrokerError::UnsubscribeError(self.queue.clone(), err.to_string())
            })?;

        // prefetched deliveries nobody will handle go back to the queue
        let consumer = &mut self.consumer;
        let drained = tokio::time::timeout(CANCEL_DRAIN_TIMEOUT, async move {
            let mut requeued = 0usize;
            while let Some(Ok(delivery)) = consumer.next().await {
                let options = BasicNackOptions {
                    multiple: false,
                    requeue: true,
                };
                if delivery.acker.nack(options).await.is_ok() {
                    requeued += 1;
                }
            }
            requeued
        })
        .await;

        match drained {
            Ok(requeued) => debug!(
                queue = self.queue.as_str(),
                requeued, "consumer cancelled"
            ),
            Err(_) => warn!(
                queue = self.queue.as_str(),
                "consumer stream did not end after cancel"
            ),
        }
        Ok(())
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> BrokerResult<()> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                BrokerError::AckMessageError
            })
    }

    async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                BrokerError::NackMessageError
            })
    }
}
