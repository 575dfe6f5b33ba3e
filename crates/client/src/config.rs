use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while building a [`ClientConfig`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A property could not be parsed.
    #[error("invalid value '{value}' for property '{key}'")]
    InvalidValue {
        /// The property key.
        key: String,

        /// The rejected value.
        value: String,
    },

    /// A router needs at least one routee.
    #[error("routees per service must be at least 1")]
    NoRoutees,
}

/// Settings shared by the executor and the services of one client.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Broker host.
    pub host: String,

    /// Broker port.
    pub port: u16,

    /// Broker user.
    pub user: Option<String>,

    /// Broker password.
    pub password: Option<String>,

    /// Broker virtual host.
    pub vhost: String,

    /// Stamped as `application-id` on outgoing requests.
    pub client_id: String,

    /// Per-attempt RPC timeout in seconds. Zero waits forever on a single attempt.
    pub rpc_timeout_secs: u64,

    /// Retries after the first RPC attempt times out.
    pub rpc_retries: u32,

    /// Routees created per request service.
    pub nb_routees: usize,

    /// How long replies stay in the reply cache, in seconds.
    pub reply_cache_retention_secs: u64,

    /// Interval between reply cache sweeps, in seconds.
    pub reply_cache_sweep_secs: u64,

    /// How long stopping a consumer waits for its loop to exit, in milliseconds.
    pub consumer_stop_grace_millis: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            user: None,
            password: None,
            vhost: "/".to_string(),
            client_id: "switchyard".to_string(),
            rpc_timeout_secs: 10,
            rpc_retries: 2,
            nb_routees: 5,
            reply_cache_retention_secs: 20,
            reply_cache_sweep_secs: 5,
            consumer_stop_grace_millis: 100,
        }
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

impl ClientConfig {
    /// Builds a config from a `mom.*` property set, keeping defaults for
    /// absent keys. Unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if a value cannot be parsed or the result is invalid.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for (key, value) in properties {
            match key.as_str() {
                "mom.host" => config.host.clone_from(value),
                "mom.port" => config.port = parse(key, value)?,
                "mom.user" => config.user = Some(value.clone()),
                "mom.password" => config.password = Some(value.clone()),
                "mom.vhost" => config.vhost.clone_from(value),
                "mom.client_id" => config.client_id.clone_from(value),
                "mom.rpc_timeout" => config.rpc_timeout_secs = parse(key, value)?,
                "mom.rpc_retry" => config.rpc_retries = parse(key, value)?,
                "mom.nb_routees" => config.nb_routees = parse(key, value)?,
                "mom.reply_cache_retention" => {
                    config.reply_cache_retention_secs = parse(key, value)?;
                }
                "mom.reply_cache_sweep" => config.reply_cache_sweep_secs = parse(key, value)?,
                "mom.consumer_stop_grace" => {
                    config.consumer_stop_grace_millis = parse(key, value)?;
                }
                _ => {}
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks the settings are usable.
    ///
    /// # Errors
    ///
    /// Returns an error if no routees are configured or a cache interval is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nb_routees == 0 {
            return Err(ConfigError::NoRoutees);
        }
        if self.reply_cache_sweep_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "mom.reply_cache_sweep".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    /// Per-attempt RPC timeout.
    #[must_use]
    pub const fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    /// Reply cache retention window.
    #[must_use]
    pub const fn reply_cache_retention(&self) -> Duration {
        Duration::from_secs(self.reply_cache_retention_secs)
    }

    /// Reply cache sweep interval.
    #[must_use]
    pub const fn reply_cache_sweep(&self) -> Duration {
        Duration::from_secs(self.reply_cache_sweep_secs)
    }

    /// Consumer stop grace period.
    #[must_use]
    pub const fn consumer_stop_grace(&self) -> Duration {
        Duration::from_millis(self.consumer_stop_grace_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect()
    }

    #[test]
    fn test_from_properties_overrides_defaults() {
        let config = ClientConfig::from_properties(&properties(&[
            ("mom.host", "broker.internal"),
            ("mom.port", "5673"),
            ("mom.user", "guest"),
            ("mom.rpc_timeout", "1"),
            ("mom.rpc_retry", "4"),
            ("mom.nb_routees", "3"),
            ("unrelated.key", "ignored"),
        ]))
        .unwrap();

        assert_eq!(config.host, "broker.internal");
        assert_eq!(config.port, 5673);
        assert_eq!(config.user.as_deref(), Some("guest"));
        assert_eq!(config.password, None);
        assert_eq!(config.rpc_timeout(), Duration::from_secs(1));
        assert_eq!(config.rpc_retries, 4);
        assert_eq!(config.nb_routees, 3);
        assert_eq!(config.reply_cache_retention(), Duration::from_secs(20));
    }

    #[test]
    fn test_from_properties_rejects_bad_numbers() {
        assert_eq!(
            ClientConfig::from_properties(&properties(&[("mom.port", "amqp")])),
            Err(ConfigError::InvalidValue {
                key: "mom.port".to_string(),
                value: "amqp".to_string(),
            })
        );
    }

    #[test]
    fn test_zero_routees_is_rejected() {
        assert_eq!(
            ClientConfig::from_properties(&properties(&[("mom.nb_routees", "0")])),
            Err(ConfigError::NoRoutees)
        );
    }

    #[test]
    fn test_missing_fields_take_defaults_when_deserializing() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"host": "mq", "rpc_retries": 0}"#).unwrap();

        assert_eq!(config.host, "mq");
        assert_eq!(config.rpc_retries, 0);
        assert_eq!(config.nb_routees, ClientConfig::default().nb_routees);
    }
}
