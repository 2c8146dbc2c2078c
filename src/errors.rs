// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Resilient RabbitMQ Client
//!
//! This module provides the error type shared by every layer of the client:
//! binding validation, connection supervision, channel management, topology
//! declaration, publishing and consuming. The `AmqpError` enum also knows
//! which failures are transient transport faults worth retrying.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Each variant provides specific context about what operation failed,
/// usually carrying the name of the exchange, queue or consumer involved.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// A binding descriptor was built with invalid arguments
    #[error("invalid binding: {0}")]
    InvalidBinding(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// The connection required by an operation is not reachable
    #[error("connection unavailable")]
    ConnectionUnavailable,

    /// No connection could be established to open a channel on
    #[error("could not create channel, no connection available")]
    ChannelCreationFailed,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Socket-level or broker-unreachable failure while talking to the broker
    #[error("transport failure: {0}")]
    TransportError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error deleting a queue
    #[error("failure to delete queue `{0}`")]
    DeleteQueueError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error encoding or parsing a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// No factory is registered for the requested handler type
    #[error("no handler registered for `{0}`")]
    HandlerNotRegistered(String),

    /// Error loading the client configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// The component was disposed before or during the operation
    #[error("component was disposed")]
    Disposed,
}

impl AmqpError {
    /// Returns true for faults that may succeed when simply attempted again:
    /// the broker could not be reached or the socket failed mid-operation.
    ///
    /// Declaration, permission and encoding failures are permanent and are
    /// never retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AmqpError::TransportError(_) | AmqpError::ChannelCreationFailed
        )
    }
}
