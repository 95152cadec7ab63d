// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Settings
//!
//! Immutable per-transport configuration. Settings are plain serde structs so
//! they can be layered from a TOML file and `BROKER__*` environment variables
//! with the `config` crate, or built in code with struct update syntax.

use crate::errors::{BrokerError, BrokerResult};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Prefix of the environment variables read by [`BrokerSettings::load`].
pub const ENV_PREFIX: &str = "BROKER";

/// What the consumer does with a frame whose body cannot be deserialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedFramePolicy {
    /// Leave the frame unsettled. The broker keeps it in flight until the
    /// channel closes.
    Ignore,
    /// Acknowledge and forget the frame.
    Ack,
    /// Negative-acknowledge without requeue, letting the broker dead-letter it.
    #[default]
    Reject,
    /// Negative-acknowledge with requeue.
    Requeue,
}

/// Connection, pooling and delivery settings for one broker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub virtual_host: Option<String>,
    pub use_tls: bool,
    /// Name announced to the broker and used as consumer tag prefix.
    pub connection_name: String,
    /// Queue or topic consumed through the transport-agnostic facade.
    pub queue_name: String,
    pub max_connections: usize,
    pub prefetch: u16,
    /// Soft size ceiling in KB, 0 disables the check.
    pub max_message_size_kb: usize,
    pub publisher_confirms: bool,
    pub confirm_timeout_secs: u64,
    /// 0 disables rate limiting.
    pub max_messages_per_second: u32,
    pub retry_count: u32,
    /// 0 retries immediately.
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub acquire_poll_interval_ms: u64,
    /// 0 waits indefinitely for a free handle.
    pub acquire_timeout_ms: u64,
    pub malformed_frames: MalformedFramePolicy,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        BrokerSettings {
            host: "localhost".to_owned(),
            port: 5672,
            username: "guest".to_owned(),
            password: "guest".to_owned(),
            virtual_host: None,
            use_tls: false,
            connection_name: "brokerpool".to_owned(),
            queue_name: String::new(),
            max_connections: 5,
            prefetch: 10,
            max_message_size_kb: 0,
            publisher_confirms: false,
            confirm_timeout_secs: 5,
            max_messages_per_second: 0,
            retry_count: 3,
            retry_base_delay_ms: 0,
            retry_max_delay_ms: 30_000,
            acquire_poll_interval_ms: 50,
            acquire_timeout_ms: 0,
            malformed_frames: MalformedFramePolicy::default(),
        }
    }
}

impl BrokerSettings {
    /// Loads settings from an optional TOML file overlaid with `BROKER__*`
    /// environment variables, then validates them.
    ///
    /// # Example
    /// ```no_run
    /// let settings = brokerpool::settings::BrokerSettings::load(Some("broker.toml"))?;
    /// # Ok::<(), brokerpool::errors::BrokerError>(())
    /// ```
    pub fn load(path: Option<&str>) -> BrokerResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|cfg| cfg.try_deserialize::<BrokerSettings>())
            .map_err(|err| BrokerError::ConfigError(err.to_string()))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Rejects settings the pool and producer cannot work with.
    pub fn validate(&self) -> BrokerResult<()> {
        if self.host.trim().is_empty() {
            return Err(BrokerError::ConfigError("host must not be empty".to_owned()));
        }
        if self.max_connections == 0 {
            return Err(BrokerError::ConfigError(
                "max_connections must be at least 1".to_owned(),
            ));
        }
        if self.publisher_confirms && self.confirm_timeout_secs == 0 {
            return Err(BrokerError::ConfigError(
                "confirm_timeout_secs must be positive when publisher confirms are enabled"
                    .to_owned(),
            ));
        }
        Ok(())
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }

    pub fn max_message_bytes(&self) -> Option<usize> {
        (self.max_message_size_kb > 0).then(|| self.max_message_size_kb * 1024)
    }

    pub fn acquire_poll_interval(&self) -> Duration {
        Duration::from_millis(self.acquire_poll_interval_ms.max(1))
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        (self.acquire_timeout_ms > 0).then(|| Duration::from_millis(self.acquire_timeout_ms))
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    /// `host:port` pair used in log fields.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
