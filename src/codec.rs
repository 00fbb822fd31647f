// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! JSON payload codec used for publishing and consuming.

use crate::errors::AmqpError;
use serde::Serialize;
use serde_json::Value;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

pub fn encode<T>(value: &T) -> Result<Vec<u8>, AmqpError>
where
    T: Serialize + ?Sized,
{
    serde_json::to_vec(value).map_err(|err| AmqpError::CouldNotDispatchMessage(err.to_string()))
}

pub fn decode(bytes: &[u8]) -> Result<Value, AmqpError> {
    serde_json::from_slice(bytes).map_err(|err| AmqpError::CouldNotParsePayload(err.to_string()))
}
