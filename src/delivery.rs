// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Per-Frame Delivery
//!
//! Turns one inbound frame into a handler call and settles it with the broker.
//! A frame is settled exactly once: acknowledged when the handler succeeds,
//! negatively acknowledged with requeue when it fails or panics. Frames whose
//! body does not deserialize are settled according to the configured
//! [`MalformedFramePolicy`] without reaching the handler.

use crate::{
    consumer::MessageHandler,
    errors::BrokerResult,
    message::{DeliveryOutcome, MessageContext},
    otel,
    settings::MalformedFramePolicy,
    transport::{self, Acknowledger, InboundFrame},
};
use futures_util::FutureExt;
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    trace::{Span, Status},
};
use serde::de::DeserializeOwned;
use std::{borrow::Cow, panic::AssertUnwindSafe};
use tracing::{debug, error, warn};

/// Consumes one frame.
///
/// # Parameters
/// * `tracer` - Tracer opening the consumer span
/// * `frame` - The frame, settled before returning
/// * `handler` - Receives the deserialized message
/// * `policy` - What to do with a body that does not deserialize
/// * `ceiling` - Soft size ceiling in bytes, only logged
///
/// # Returns
/// The outcome the frame was settled with, or `None` when the malformed
/// policy left it unsettled
pub(crate) async fn consume<T, H>(
    tracer: &BoxedTracer,
    frame: InboundFrame,
    handler: &H,
    policy: MalformedFramePolicy,
    ceiling: Option<usize>,
) -> BrokerResult<Option<DeliveryOutcome>>
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T> + ?Sized,
{
    let mut span = otel::new_span(&frame.headers, tracer, &frame.topic);

    debug!(
        topic = frame.topic.as_str(),
        redelivered = frame.redelivered,
        "received frame"
    );

    if let Some(ceiling) = ceiling {
        if frame.body.len() > ceiling {
            warn!(
                topic = frame.topic.as_str(),
                size = frame.body.len(),
                ceiling,
                "inbound frame exceeds the size ceiling"
            );
        }
    }

    let InboundFrame {
        topic,
        body,
        headers,
        correlation_id,
        message_id,
        acker,
        ..
    } = frame;

    let payload = match serde_json::from_slice::<T>(&body) {
        Ok(payload) => payload,
        Err(err) => {
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("malformed frame"),
            });
            warn!(
                topic = topic.as_str(),
                error = err.to_string(),
                policy = ?policy,
                "failure to deserialize frame"
            );

            let outcome = match policy {
                MalformedFramePolicy::Ignore => return Ok(None),
                MalformedFramePolicy::Ack => DeliveryOutcome::Acknowledged,
                MalformedFramePolicy::Reject => DeliveryOutcome::NackDrop,
                MalformedFramePolicy::Requeue => DeliveryOutcome::NackRequeue,
            };
            settle(acker.as_ref(), outcome, &mut span).await?;
            return Ok(Some(outcome));
        }
    };

    let message = MessageContext::from_parts(payload, headers, correlation_id, message_id);

    let outcome = match AssertUnwindSafe(handler.handle(message)).catch_unwind().await {
        Ok(Ok(())) => {
            debug!(topic = topic.as_str(), "message successfully processed");
            span.set_status(Status::Ok);
            DeliveryOutcome::Acknowledged
        }
        Ok(Err(err)) => {
            warn!(
                topic = topic.as_str(),
                error = err.to_string(),
                "handler failed, requeuing message"
            );
            span.record_error(err.as_ref());
            span.set_status(Status::Error {
                description: Cow::from("handler failed"),
            });
            DeliveryOutcome::NackRequeue
        }
        Err(_) => {
            error!(topic = topic.as_str(), "handler panicked, requeuing message");
            span.set_status(Status::Error {
                description: Cow::from("handler panicked"),
            });
            DeliveryOutcome::NackRequeue
        }
    };

    settle(acker.as_ref(), outcome, &mut span).await?;
    Ok(Some(outcome))
}

async fn settle(
    acker: &dyn Acknowledger,
    outcome: DeliveryOutcome,
    span: &mut BoxedSpan,
) -> BrokerResult<()> {
    transport::settle(acker, outcome).await.map_err(|err| {
        error!(error = err.to_string(), outcome = ?outcome, "failure to settle frame");
        span.record_error(&err);
        span.set_status(Status::Error {
            description: Cow::from("failure to settle frame"),
        });
        err
    })
}
