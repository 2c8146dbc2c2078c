// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Client Configuration
//!
//! `RabbitConfig` carries the broker coordinates and the behaviour switches
//! of the client. Every field has a default so partial configuration files
//! are accepted; the values usually live under a `[rabbitmq]` table.

use crate::{consumer::HandlerFailurePolicy, errors::AmqpError};
use serde::Deserialize;
use std::time::Duration;

fn default_app_name() -> String {
    "rabbitmq-resilience".to_owned()
}

fn default_host() -> String {
    "localhost".to_owned()
}

fn default_port() -> u16 {
    5672
}

fn default_user() -> String {
    "guest".to_owned()
}

fn default_password() -> String {
    "guest".to_owned()
}

fn default_vhost() -> String {
    "/".to_owned()
}

fn default_true() -> bool {
    true
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000 // 2^attempt seconds between publish attempts
}

/// Connection and behaviour settings for the client.
#[derive(Debug, Clone, Deserialize)]
pub struct RabbitConfig {
    /// Reported to the broker as the connection name
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    /// Declare exchanges and queues as durable
    #[serde(default = "default_true")]
    pub durable: bool,
    /// Declare exchanges and queues as auto-delete
    #[serde(default)]
    pub auto_delete: bool,
    /// Declare queues as exclusive to their connection
    #[serde(default)]
    pub exclusive: bool,
    /// How many times a publish is retried after a transport failure
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Give consumers their own connection so consumer reconnects do not
    /// disturb publishers
    #[serde(default)]
    pub use_secondary_connection_for_consumers: bool,
    /// Applied as `x-expires` to queues whose binding does not set one
    #[serde(default)]
    pub queue_expiration_ms: Option<u64>,
    #[serde(default)]
    pub handler_failure: HandlerFailurePolicy,
}

#[derive(Deserialize)]
struct ConfigFile {
    rabbitmq: RabbitConfig,
}

impl Default for RabbitConfig {
    fn default() -> Self {
        RabbitConfig {
            app_name: default_app_name(),
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: default_password(),
            vhost: default_vhost(),
            durable: true,
            auto_delete: false,
            exclusive: false,
            retry_count: default_retry_count(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            use_secondary_connection_for_consumers: false,
            queue_expiration_ms: None,
            handler_failure: HandlerFailurePolicy::default(),
        }
    }
}

impl RabbitConfig {
    /// Parses the `[rabbitmq]` table of a TOML document.
    pub fn from_toml_str(content: &str) -> Result<RabbitConfig, AmqpError> {
        toml::from_str::<ConfigFile>(content)
            .map(|file| file.rabbitmq)
            .map_err(|err| AmqpError::ConfigError(err.to_string()))
    }

    /// Builds the AMQP URI, percent-encoding the virtual host.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user,
            self.password,
            self.host,
            self.port,
            encode_vhost(&self.vhost)
        )
    }

    /// Broker address without credentials, used in log fields.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn queue_expiration(&self) -> Option<Duration> {
        self.queue_expiration_ms.map(Duration::from_millis)
    }
}

fn encode_vhost(vhost: &str) -> String {
    vhost.replace('%', "%25").replace('/', "%2f")
}
