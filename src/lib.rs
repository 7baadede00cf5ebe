pub mod capture;
pub mod error;
pub mod ingest;
pub mod pipeline;

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use capture::frame::PayloadFormat;
use serde::{Deserialize, Serialize};

pub use capture::{FrameDecoder, FrameRecord, ImageDecoder};
pub use error::{ConfigError, DecodeError, IngestError};
pub use ingest::{IngestManager, IngestWorker, StopSignal};
pub use pipeline::FrameChannel;

/// Prefix for environment overrides, e.g. `ARGUS__INGEST__BASE_PORT=6000`
pub const ENV_PREFIX: &str = "ARGUS";

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ingest: IngestConfig,
    pub channel: ChannelConfig,
    pub decode: DecodeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub host: IpAddr,
    pub base_port: u16,
    pub connection_count: u16,
    pub accept_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub join_timeout_ms: u64,
    pub max_payload_bytes: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// 0 means unbounded
    pub capacity: usize,
    pub op_timeout_ms: u64,
    pub settle_delay_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeConfig {
    pub format: PayloadFormat,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            base_port: 5000,
            connection_count: 2,
            accept_timeout_ms: 10_000,
            read_timeout_ms: 10_000,
            join_timeout_ms: 10_000,
            max_payload_bytes: ingest::protocol::DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            op_timeout_ms: 100,
            settle_delay_ms: 100,
        }
    }
}

impl IngestConfig {
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// One port per camera, starting at `base_port`. Ports past `u16::MAX`
    /// are skipped; `validate` rejects such ranges up front.
    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        (0..self.connection_count).filter_map(move |index| self.base_port.checked_add(index))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection_count == 0 {
            return Err(ConfigError::Invalid(
                "connection_count must be at least 1".into(),
            ));
        }

        let last_port = u32::from(self.base_port) + u32::from(self.connection_count) - 1;
        if last_port > u32::from(u16::MAX) {
            return Err(ConfigError::Invalid(format!(
                "ports {}..={} exceed {}",
                self.base_port,
                last_port,
                u16::MAX
            )));
        }

        let timeouts = [
            ("ingest.accept_timeout_ms", self.accept_timeout_ms),
            ("ingest.read_timeout_ms", self.read_timeout_ms),
            ("ingest.join_timeout_ms", self.join_timeout_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, ms)| *ms == 0) {
            return Err(ConfigError::Invalid(format!("{} must be positive", name)));
        }

        if self.max_payload_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_payload_bytes must be positive".into(),
            ));
        }

        Ok(())
    }
}

impl ChannelConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Command line values that take precedence over file and environment
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub base_port: Option<u16>,
    pub connection_count: Option<u16>,
    pub queue_capacity: Option<usize>,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut Config) {
        if let Some(base_port) = self.base_port {
            config.ingest.base_port = base_port;
        }
        if let Some(connection_count) = self.connection_count {
            config.ingest.connection_count = connection_count;
        }
        if let Some(capacity) = self.queue_capacity {
            config.channel.capacity = capacity;
        }
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `ARGUS__*` environment
    /// variables, then `overrides`. Validated once, after every layer.
    pub fn load(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: Config = builder.build()?.try_deserialize()?;
        overrides.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ingest.validate()?;

        if self.channel.op_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "channel.op_timeout_ms must be positive".into(),
            ));
        }

        Ok(())
    }
}
