// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::index_writer::DocumentIdStrategy;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Runtime configuration for both sides of the relay
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
    /// Directory holding the credential resources
    pub resource_dir: PathBuf,
    /// Comma separated Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// Topic written by the publisher and read by the index writer
    pub topic: String,
    /// Consumer group of the index writer
    pub consumer_group: String,
    /// Streaming endpoint of the firehose
    pub firehose_url: String,
    /// Intake queue slots
    pub queue_capacity: usize,
    pub offer_timeout: Duration,
    pub queue_poll_timeout: Duration,
    pub flush_timeout: Duration,
    /// Overrides the index location derived from the credentials
    pub index_url: Option<String>,
    pub index_name: String,
    pub doc_type: String,
    /// Successful index writes before the writer stops
    pub max_inserts: usize,
    pub poll_interval: Duration,
    pub pacing_delay: Duration,
    pub document_ids: DocumentIdStrategy,
    /// HTTPS proxy URL
    pub https_proxy: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            resource_dir: PathBuf::from("resources"),
            bootstrap_servers: "127.0.0.1:9092".to_string(),
            topic: "twitter_tweets".to_string(),
            consumer_group: "kafka-demo-elasticsearch".to_string(),
            firehose_url: "https://stream.twitter.com/1.1/statuses/filter.json".to_string(),
            queue_capacity: 1000,
            offer_timeout: Duration::from_millis(1000),
            queue_poll_timeout: Duration::from_millis(5000),
            flush_timeout: Duration::from_secs(30),
            index_url: None,
            index_name: "twitter".to_string(),
            doc_type: "tweets".to_string(),
            max_inserts: 5,
            poll_interval: Duration::from_millis(100),
            pacing_delay: Duration::from_millis(1000),
            document_ids: DocumentIdStrategy::ServerAssigned,
            https_proxy: None,
        }
    }
}

impl RelayConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let document_ids = match env::var("RELAY_DOCUMENT_IDS") {
            Ok(value) => value.parse::<DocumentIdStrategy>()?,
            Err(_) => defaults.document_ids,
        };

        let config = Self {
            log_level: env::var("RELAY_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
            resource_dir: env::var("RELAY_RESOURCE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.resource_dir),
            bootstrap_servers: env::var("RELAY_BOOTSTRAP_SERVERS")
                .unwrap_or(defaults.bootstrap_servers),
            topic: env::var("RELAY_TOPIC").unwrap_or(defaults.topic),
            consumer_group: env::var("RELAY_CONSUMER_GROUP").unwrap_or(defaults.consumer_group),
            firehose_url: env::var("RELAY_FIREHOSE_URL").unwrap_or(defaults.firehose_url),
            queue_capacity: parse_var("RELAY_QUEUE_CAPACITY").unwrap_or(defaults.queue_capacity),
            offer_timeout: parse_var("RELAY_OFFER_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.offer_timeout),
            queue_poll_timeout: parse_var("RELAY_QUEUE_POLL_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.queue_poll_timeout),
            flush_timeout: parse_var("RELAY_FLUSH_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.flush_timeout),
            index_url: env::var("RELAY_INDEX_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            index_name: env::var("RELAY_INDEX_NAME").unwrap_or(defaults.index_name),
            doc_type: env::var("RELAY_INDEX_TYPE").unwrap_or(defaults.doc_type),
            max_inserts: parse_var("RELAY_MAX_INSERTS").unwrap_or(defaults.max_inserts),
            poll_interval: parse_var("RELAY_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            pacing_delay: parse_var("RELAY_PACING_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.pacing_delay),
            document_ids,
            https_proxy: env::var("RELAY_PROXY_HTTPS")
                .or_else(|_| env::var("HTTPS_PROXY"))
                .ok(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "RELAY_QUEUE_CAPACITY must be greater than 0".to_string(),
            ));
        }

        if self.max_inserts == 0 {
            return Err(ConfigError::Invalid(
                "RELAY_MAX_INSERTS must be greater than 0".to_string(),
            ));
        }

        if self.topic.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "RELAY_TOPIC cannot be empty".to_string(),
            ));
        }

        if self.bootstrap_servers.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "RELAY_BOOTSTRAP_SERVERS cannot be empty".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }
}

// Unparsable numbers fall back to the default.
fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|val| val.trim().parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 8] = [
        "RELAY_LOG_LEVEL",
        "RELAY_TOPIC",
        "RELAY_QUEUE_CAPACITY",
        "RELAY_MAX_INSERTS",
        "RELAY_PACING_DELAY_MS",
        "RELAY_DOCUMENT_IDS",
        "RELAY_INDEX_URL",
        "RELAY_PROXY_HTTPS",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_capacity() {
        let config = RelayConfig {
            queue_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_max_inserts() {
        let config = RelayConfig {
            max_inserts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_topic() {
        let config = RelayConfig {
            topic: "  ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let config = RelayConfig {
            log_level: "verbose".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        let config = RelayConfig::from_env().unwrap();
        assert_eq!(config.topic, "twitter_tweets");
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.max_inserts, 5);
        assert_eq!(config.document_ids, DocumentIdStrategy::ServerAssigned);
        assert!(config.index_url.is_none());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        env::set_var("RELAY_LOG_LEVEL", "DEBUG");
        env::set_var("RELAY_TOPIC", "tweets");
        env::set_var("RELAY_MAX_INSERTS", "12");
        env::set_var("RELAY_PACING_DELAY_MS", "0");
        env::set_var("RELAY_DOCUMENT_IDS", "record");
        env::set_var("RELAY_PROXY_HTTPS", "http://proxy:3128");

        let config = RelayConfig::from_env().unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.topic, "tweets");
        assert_eq!(config.max_inserts, 12);
        assert_eq!(config.pacing_delay, Duration::ZERO);
        assert_eq!(config.document_ids, DocumentIdStrategy::RecordCoordinates);
        assert_eq!(config.https_proxy.as_deref(), Some("http://proxy:3128"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_zero_inserts() {
        clear_env();
        env::set_var("RELAY_MAX_INSERTS", "0");
        assert!(RelayConfig::from_env().is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_unknown_id_strategy() {
        clear_env();
        env::set_var("RELAY_DOCUMENT_IDS", "random");
        assert!(RelayConfig::from_env().is_err());
        clear_env();
    }
}
