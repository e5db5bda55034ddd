// MIT License - Copyright (c) 2026 tuya-lan-bridge contributors
// Device connection settings

use std::time::Duration;

use serde_json::{json, Value};

use crate::constants::{
    DEFAULT_CONNECTION_TIMEOUT, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_PORT, DEFAULT_RETRY_DELAY,
    DEFAULT_RETRY_LIMIT,
};
use crate::crypto::key_from_str;
use crate::error::Result;
use crate::protocol::Version;

/// Query dialect of a device.
///
/// Some 3.3 devices (typically with 22-character ids) reject `DP_QUERY`
/// with "data unvalid" and must be queried with `CONTROL_NEW` listing the
/// data points wanted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevType {
    #[default]
    Default,
    Device22,
}

/// Configuration for connecting to a single device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Device id (`gwId`/`devId`)
    pub dev_id: String,
    /// IP address or host name
    pub address: String,
    /// TCP port (default: 6668)
    pub port: u16,
    /// 16-character local key
    pub local_key: String,
    /// Protocol version
    pub version: Version,
    /// Keep the TCP connection open between commands
    pub persistent: bool,
    /// Connect timeout, also used as the per-command response timeout
    pub connection_timeout: Duration,
    /// Connection attempts on transient errors before giving up
    pub retry_limit: u32,
    /// Base delay for exponential backoff between connection attempts
    pub retry_delay: Duration,
    /// Heartbeat period for long-running listeners
    pub heartbeat_interval: Duration,
    /// Query dialect
    pub dev_type: DevType,
    /// Data points requested by device22 queries
    pub dps_to_request: Value,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            dev_id: String::new(),
            address: String::new(),
            port: DEFAULT_PORT,
            local_key: String::new(),
            version: Version::V3_3,
            persistent: false,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            retry_limit: DEFAULT_RETRY_LIMIT,
            retry_delay: DEFAULT_RETRY_DELAY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            dev_type: DevType::Default,
            dps_to_request: json!({ "1": null }),
        }
    }
}

impl DeviceConfig {
    /// Create a new config builder starting from defaults.
    pub fn builder() -> DeviceConfigBuilder {
        DeviceConfigBuilder::default()
    }

    /// `address:port` for the TCP connection.
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Check the parts of the config that can be checked without I/O.
    pub fn validate(&self) -> Result<()> {
        key_from_str(&self.local_key)?;
        Ok(())
    }
}

/// Builder for DeviceConfig.
#[derive(Debug, Clone, Default)]
pub struct DeviceConfigBuilder {
    config: DeviceConfig,
}

impl DeviceConfigBuilder {
    pub fn dev_id(mut self, id: impl Into<String>) -> Self {
        self.config.dev_id = id.into();
        self
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.config.address = address.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn local_key(mut self, key: impl Into<String>) -> Self {
        self.config.local_key = key.into();
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.config.version = version;
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.config.persistent = persistent;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    pub fn retry_limit(mut self, limit: u32) -> Self {
        self.config.retry_limit = limit;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn dev_type(mut self, dev_type: DevType) -> Self {
        self.config.dev_type = dev_type;
        self
    }

    pub fn dps_to_request(mut self, dps: Value) -> Self {
        self.config.dps_to_request = dps;
        self
    }

    pub fn build(self) -> DeviceConfig {
        self.config
    }
}
