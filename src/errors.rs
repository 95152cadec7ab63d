// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Broker Core
//!
//! This module provides the error taxonomy shared by every transport. The
//! `BrokerError` enum covers connection, pooling, publishing, subscription and
//! acknowledgement failures. Each variant carries the human-readable cause so
//! callers receive a typed failure instead of a transport exception.

use std::time::Duration;
use thiserror::Error;

/// Result alias used across pool, producer and consumer operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Error type returned by message handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Represents errors that can occur while talking to a broker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel or handle from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// No handle became available before the acquire deadline
    #[error("no channel available after {0:?}")]
    AcquireTimeout(Duration),

    /// The pool was closed and hands out no more leases
    #[error("channel pool is closed")]
    PoolClosed,

    /// Error serializing a payload before publishing
    #[error("failure to serialize payload: {0}")]
    SerializePayloadError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// The broker did not confirm a publish in time
    #[error("publish confirm not received within {0:?}")]
    ConfirmTimeout(Duration),

    /// The broker negatively confirmed a publish
    #[error("publish rejected by the broker")]
    ConfirmNacked,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error subscribing to a queue or topic
    #[error("failure to subscribe to `{0}`: {1}")]
    SubscribeError(String, String),

    /// Error cancelling a subscription
    #[error("failure to unsubscribe from `{0}`: {1}")]
    UnsubscribeError(String, String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Invalid or unreadable configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),
}
