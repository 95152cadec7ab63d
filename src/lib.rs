// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod delivery;
mod otel;

pub mod amqp;
pub mod broker;
pub mod connection;
pub mod consumer;
pub mod diagnostics;
pub mod errors;
pub mod memory;
pub mod message;
pub mod metrics;
pub mod nats;
pub mod pool;
pub mod publisher;
pub mod resilience;
pub mod settings;
pub mod transport;

pub use broker::{Broker, BrokerConsumer, BrokerMetadata, BrokerProducer};
pub use errors::{BrokerError, BrokerResult, HandlerError};
pub use message::{DeliveryOutcome, HeaderValue, Headers, MessageContext};
pub use settings::{BrokerSettings, MalformedFramePolicy};
