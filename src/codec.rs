// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! JSON encoding of message bodies.

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Serialize};
use tracing::error;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, AmqpError> {
    serde_json::to_vec(value).map_err(|err| {
        error!(error = err.to_string(), "failure to serialize payload");
        AmqpError::ParsePayloadError(err.to_string())
    })
}

pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, AmqpError> {
    serde_json::from_slice(payload).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
}
