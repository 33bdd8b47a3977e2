//! # Configuration
//!
//! A server is described by one TOML file:
//!
//! ```toml
//! [actor]
//! name = "lobby"
//! min_frame_ms = 2
//!
//! [wire]
//! max_len = 16384
//!
//! [tcp]
//! listen = "127.0.0.1:7100"
//!
//! [[worker]]
//! alias = "kv"
//! count = 2
//!
//! [logging]
//! level = "debug"
//! stdout = true
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::deframer::{DEFAULT_READ_CHUNK, DEFAULT_RING_CAPACITY};
use crate::errors::ConfigError;
use crate::wire::{FrameLimits, LENGTH_PREFIX, MAX_FRAME_LEN, MIN_FRAME_LEN};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarqueeConfig {
    pub actor: ActorConfig,
    pub wire: WireConfig,
    pub tcp: TcpConfig,
    #[serde(rename = "worker")]
    pub workers: Vec<WorkerConfig>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorConfig {
    pub name: String,
    /// Shortest frame; the loop sleeps off the remainder.
    pub min_frame_ms: u64,
    /// Frames slower than this are logged.
    pub warn_frame_ms: u64,
    /// Inbound messages still queued after this long in one frame are dropped.
    pub abort_frame_ms: u64,
    pub inbox_capacity: usize,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            name: "actor".to_string(),
            min_frame_ms: 2,
            warn_frame_ms: 1000,
            abort_frame_ms: 30000,
            inbox_capacity: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireConfig {
    pub min_len: usize,
    pub max_len: usize,
    pub ring_capacity: usize,
    pub read_chunk: usize,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            min_len: MIN_FRAME_LEN,
            max_len: MAX_FRAME_LEN,
            ring_capacity: DEFAULT_RING_CAPACITY,
            read_chunk: DEFAULT_READ_CHUNK,
        }
    }
}

impl WireConfig {
    pub fn limits(&self) -> FrameLimits {
        FrameLimits::new(self.min_len, self.max_len)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub listen: Option<String>,
    pub max_connections: Option<usize>,
    pub outbound_capacity: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            listen: None,
            max_connections: None,
            outbound_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub alias: String,
    pub count: usize,
    pub keep_alive_ms: u64,
    pub reconnect_ms: u64,
    /// Requests that may wait for each worker of this pool.
    pub queue_capacity: usize,
    /// Slots this pool adds to the shared reply queue the actor pumps.
    pub reply_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            alias: String::new(),
            count: 1,
            keep_alive_ms: 60_000,
            reconnect_ms: 5_000,
            queue_capacity: 256,
            reply_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub log_dir: Option<PathBuf>,
    pub stdout: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
            stdout: true,
        }
    }
}

impl MarqueeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("Loading config from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: MarqueeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let wire = &self.wire;
        if wire.min_len == 0 {
            return Err(ConfigError::Invalid("wire.min_len must be at least 1".into()));
        }
        if wire.min_len > wire.max_len {
            return Err(ConfigError::Invalid(format!(
                "wire.min_len {} is greater than wire.max_len {}",
                wire.min_len, wire.max_len
            )));
        }
        if wire.max_len > u16::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "wire.max_len {} does not fit the 2-byte length prefix",
                wire.max_len
            )));
        }
        if wire.read_chunk == 0 || wire.read_chunk > wire.max_len {
            return Err(ConfigError::Invalid(format!(
                "wire.read_chunk {} must be between 1 and wire.max_len",
                wire.read_chunk
            )));
        }
        if wire.ring_capacity <= wire.max_len + LENGTH_PREFIX + wire.read_chunk {
            return Err(ConfigError::Invalid(format!(
                "wire.ring_capacity {} cannot hold a full frame plus one read",
                wire.ring_capacity
            )));
        }
        if self.actor.inbox_capacity == 0 {
            return Err(ConfigError::Invalid("actor.inbox_capacity must be positive".into()));
        }
        if self.tcp.outbound_capacity == 0 {
            return Err(ConfigError::Invalid("tcp.outbound_capacity must be positive".into()));
        }

        let mut aliases = std::collections::HashSet::new();
        for worker in &self.workers {
            if worker.alias.is_empty() {
                return Err(ConfigError::Invalid("worker.alias must not be empty".into()));
            }
            if worker.count == 0 {
                return Err(ConfigError::Invalid(format!(
                    "worker '{}' needs at least one instance",
                    worker.alias
                )));
            }
            if worker.queue_capacity == 0 || worker.reply_capacity == 0 {
                return Err(ConfigError::Invalid(format!(
                    "worker '{}' queue and reply capacities must be positive",
                    worker.alias
                )));
            }
            if !aliases.insert(worker.alias.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "worker alias '{}' is defined twice",
                    worker.alias
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = MarqueeConfig::from_toml_str("").unwrap();
        assert_eq!(config, MarqueeConfig::default());
        assert_eq!(config.actor.min_frame_ms, 2);
        assert_eq!(config.actor.warn_frame_ms, 1000);
        assert_eq!(config.actor.abort_frame_ms, 30000);
        assert_eq!(config.wire.limits(), FrameLimits::default());
        assert_eq!(config.wire.ring_capacity, 65536);
    }

    #[test]
    fn test_full_config() {
        let config = MarqueeConfig::from_toml_str(
            r#"
            [actor]
            name = "lobby"
            abort_frame_ms = 500

            [wire]
            max_len = 4096
            ring_capacity = 16384
            read_chunk = 1024

            [tcp]
            listen = "127.0.0.1:7100"
            max_connections = 64

            [[worker]]
            alias = "kv"
            count = 2

            [[worker]]
            alias = "db"
            reconnect_ms = 100
            queue_capacity = 8

            [logging]
            level = "debug"
            stdout = false
            "#,
        )
        .unwrap();

        assert_eq!(config.actor.name, "lobby");
        assert_eq!(config.actor.abort_frame_ms, 500);
        assert_eq!(config.actor.min_frame_ms, 2);
        assert_eq!(config.wire.limits(), FrameLimits::new(7, 4096));
        assert_eq!(config.tcp.listen.as_deref(), Some("127.0.0.1:7100"));
        assert_eq!(config.tcp.max_connections, Some(64));
        assert_eq!(config.workers.len(), 2);
        assert_eq!(config.workers[0].count, 2);
        assert_eq!(config.workers[1].count, 1);
        assert_eq!(config.workers[1].reconnect_ms, 100);
        assert_eq!(config.workers[1].queue_capacity, 8);
        assert_eq!(config.workers[1].reply_capacity, 1024);
        assert_eq!(config.logging.level, "debug");
        assert!(!config.logging.stdout);
    }

    #[test]
    fn test_validation_rejects_bad_wire_settings() {
        for bad in [
            "[wire]\nmin_len = 0",
            "[wire]\nmin_len = 100\nmax_len = 50",
            "[wire]\nmax_len = 70000",
            "[wire]\nread_chunk = 20000",
            "[wire]\nring_capacity = 16000",
        ] {
            assert!(
                matches!(MarqueeConfig::from_toml_str(bad), Err(ConfigError::Invalid(_))),
                "accepted: {}",
                bad
            );
        }
    }

    #[test]
    fn test_duplicate_worker_alias() {
        let result = MarqueeConfig::from_toml_str(
            "[[worker]]\nalias = \"kv\"\n[[worker]]\nalias = \"kv\"\n",
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let result =
            MarqueeConfig::from_toml_str("[[worker]]\nalias = \"kv\"\nqueue_capacity = 0\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            MarqueeConfig::from_toml_str("[actor\nname = 1"),
            Err(ConfigError::Parse(_))
        ));
    }
}
