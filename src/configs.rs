// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Broker coordinates and registry tuning. `AmqpConfigs` can be deserialized
//! from any serde source or read from the environment; `uri()` produces the
//! connection string handed to `Registry::open_connection`.

use serde::{de, Deserialize, Deserializer};
use std::{env, time::Duration};

/// Interval between two reconnection attempts
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

pub const DEFAULT_CONNECTION_NAME: &str = "eventhandler";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AmqpConfigs {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub vhost: String,
}

impl Default for AmqpConfigs {
    fn default() -> Self {
        AmqpConfigs {
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            host: "localhost".to_owned(),
            port: 5672,
            vhost: "%2f".to_owned(),
        }
    }
}

impl AmqpConfigs {
    /// Reads `RABBITMQ_USER`, `RABBITMQ_PASSWORD`, `RABBITMQ_HOST`,
    /// `RABBITMQ_PORT` and `RABBITMQ_VHOST`, keeping defaults for anything unset
    /// or malformed.
    pub fn from_env() -> AmqpConfigs {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> AmqpConfigs {
        let defaults = AmqpConfigs::default();

        AmqpConfigs {
            user: lookup("RABBITMQ_USER").unwrap_or(defaults.user),
            password: lookup("RABBITMQ_PASSWORD").unwrap_or(defaults.password),
            host: lookup("RABBITMQ_HOST").unwrap_or(defaults.host),
            port: lookup("RABBITMQ_PORT")
                .and_then(|port| port.parse().ok())
                .unwrap_or(defaults.port),
            vhost: lookup("RABBITMQ_VHOST").unwrap_or(defaults.vhost),
        }
    }

    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }
}

/// Registry tuning.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RegistryConfigs {
    /// Client-provided connection name shown by the broker
    pub connection_name: String,
    /// Fixed delay between reconnection attempts, in seconds when deserialized
    #[serde(deserialize_with = "seconds")]
    pub reconnect_interval: Duration,
}

fn seconds<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(de::Error::custom)
}

impl Default for RegistryConfigs {
    fn default() -> Self {
        RegistryConfigs {
            connection_name: DEFAULT_CONNECTION_NAME.to_owned(),
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
        }
    }
}
