//! Configuration for the parameter-server agent.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AgentError, Result};

/// Top-level agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Address of the master node, as `host:port`.
    pub master_addr: String,
    /// Port the agent's main receiver listens on.
    pub listen_port: u16,
    /// Network interface to resolve the announced IP from. When unset, the
    /// first non-loopback IPv4 interface is used.
    pub net_interface: Option<String>,
    /// Explicit announced IP, bypassing interface resolution.
    pub announced_ip: Option<String>,
    /// Offset added to `listen_port` for the heartbeat receiver.
    pub heartbeat_port_offset: u16,
    // Bound on the inbound message queue of each transport instance.
    pub inbound_capacity: usize,
    /// Maximum number of key/value pairs in one IPC batch.
    pub batch_capacity: usize,
    /// Optional receive timeout in milliseconds. `None` blocks forever,
    /// which is the historical behavior; a timed-out receive is logged and
    /// retried, it never drops a pending shard.
    pub recv_timeout_ms: Option<u64>,
    /// Grace period between notifying the master of termination and exiting.
    pub terminate_grace_ms: u64,
    /// Paths of the worker-facing IPC endpoints.
    pub ipc: IpcConfig,
}

/// Filesystem endpoints shared with the local worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    // FIFO the worker writes pull/push/terminate signals into.
    pub signal_fifo: PathBuf,
    // FIFO the agent writes the pull-ready signal into.
    pub ready_fifo: PathBuf,
    // Shared region the worker fills with request batches.
    pub request_region: PathBuf,
    // Shared region the agent fills with pulled parameters.
    pub reply_region: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            master_addr: "127.0.0.1:16666".to_string(),
            listen_port: 15555,
            net_interface: None,
            announced_ip: None,
            heartbeat_port_offset: 1,
            inbound_capacity: 64,
            batch_capacity: 1024,
            recv_timeout_ms: None,
            terminate_grace_ms: 10_000,
            ipc: IpcConfig::default(),
        }
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            signal_fifo: PathBuf::from("/tmp/ps-agent/grad.fifo"),
            ready_fifo: PathBuf::from("/tmp/ps-agent/para.fifo"),
            request_region: PathBuf::from("/tmp/ps-agent/grad.shm"),
            reply_region: PathBuf::from("/tmp/ps-agent/para.shm"),
        }
    }
}

impl FromStr for AgentConfig {
    type Err = AgentError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| AgentError::config_with_source("failed to parse TOML config", e))
    }
}

impl AgentConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AgentError::config_with_source(format!("failed to read {}", path.display()), e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `PSA_`. For example:
    // - `PSA_MASTER_ADDR` overrides `master_addr`
    // - `PSA_LISTEN_PORT` overrides `listen_port`
    // - `PSA_RECV_TIMEOUT_MS` overrides `recv_timeout_ms`
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("PSA_MASTER_ADDR") {
            self.master_addr = val;
        }
        if let Ok(val) = std::env::var("PSA_LISTEN_PORT") {
            if let Ok(v) = val.parse() {
                self.listen_port = v;
            }
        }
        if let Ok(val) = std::env::var("PSA_NET_INTERFACE") {
            self.net_interface = Some(val);
        }
        if let Ok(val) = std::env::var("PSA_ANNOUNCED_IP") {
            self.announced_ip = Some(val);
        }
        if let Ok(val) = std::env::var("PSA_HEARTBEAT_PORT_OFFSET") {
            if let Ok(v) = val.parse() {
                self.heartbeat_port_offset = v;
            }
        }
        if let Ok(val) = std::env::var("PSA_INBOUND_CAPACITY") {
            if let Ok(v) = val.parse() {
                self.inbound_capacity = v;
            }
        }
        if let Ok(val) = std::env::var("PSA_BATCH_CAPACITY") {
            if let Ok(v) = val.parse() {
                self.batch_capacity = v;
            }
        }
        if let Ok(val) = std::env::var("PSA_RECV_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.recv_timeout_ms = Some(v);
            }
        }
        if let Ok(val) = std::env::var("PSA_TERMINATE_GRACE_MS") {
            if let Ok(v) = val.parse() {
                self.terminate_grace_ms = v;
            }
        }
        if let Ok(val) = std::env::var("PSA_SIGNAL_FIFO") {
            self.ipc.signal_fifo = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("PSA_READY_FIFO") {
            self.ipc.ready_fifo = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("PSA_REQUEST_REGION") {
            self.ipc.request_region = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("PSA_REPLY_REGION") {
            self.ipc.reply_region = PathBuf::from(val);
        }
        self
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.master_addr.is_empty() {
            return Err(AgentError::config("master_addr must not be empty"));
        }
        if !self.master_addr.contains(':') {
            return Err(AgentError::config(
                "master_addr must be of the form host:port",
            ));
        }
        if self.listen_port == 0 {
            return Err(AgentError::config("listen_port must be non-zero"));
        }
        if self.heartbeat_port_offset == 0 {
            return Err(AgentError::config(
                "heartbeat_port_offset must be non-zero or the heartbeat \
                 receiver would collide with the main receiver",
            ));
        }
        if u32::from(self.listen_port) + u32::from(self.heartbeat_port_offset)
            > u32::from(u16::MAX)
        {
            return Err(AgentError::config(format!(
                "listen_port {} plus heartbeat_port_offset {} exceeds the valid port range",
                self.listen_port, self.heartbeat_port_offset
            )));
        }
        if self.inbound_capacity == 0 {
            return Err(AgentError::config("inbound_capacity must be greater than 0"));
        }
        if self.batch_capacity == 0 {
            return Err(AgentError::config("batch_capacity must be greater than 0"));
        }
        Ok(())
    }

    /// Port of the heartbeat receiver. `validate()` guarantees the sum
    /// stays within the port range.
    pub fn heartbeat_port(&self) -> u16 {
        self.listen_port + self.heartbeat_port_offset
    }

    /// Receive timeout as a `Duration`, if configured.
    pub fn recv_timeout(&self) -> Option<Duration> {
        self.recv_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.heartbeat_port(), 15556);
        assert!(config.recv_timeout().is_none());
    }

    #[test]
    fn test_parse_toml() {
        let config: AgentConfig = r#"
            master_addr = "10.0.0.1:16666"
            listen_port = 15000
            recv_timeout_ms = 2500

            [ipc]
            signal_fifo = "/run/agent/grad.fifo"
        "#
        .parse()
        .unwrap();

        assert_eq!(config.master_addr, "10.0.0.1:16666");
        assert_eq!(config.listen_port, 15000);
        assert_eq!(config.recv_timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(
            config.ipc.signal_fifo,
            PathBuf::from("/run/agent/grad.fifo")
        );
        // Unspecified fields keep their defaults
        assert_eq!(config.batch_capacity, 1024);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AgentConfig::default();
        config.master_addr = "no-port".to_string();
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.heartbeat_port_offset = 0;
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.batch_capacity = 0;
        assert!(config.validate().is_err());

        // Heartbeat port would wrap past the end of the port range
        let mut config = AgentConfig::default();
        config.listen_port = u16::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("PSA_MASTER_ADDR", "192.168.1.9:7000");
        std::env::set_var("PSA_RECV_TIMEOUT_MS", "750");
        let config = AgentConfig::default().with_env_overrides();
        std::env::remove_var("PSA_MASTER_ADDR");
        std::env::remove_var("PSA_RECV_TIMEOUT_MS");

        assert_eq!(config.master_addr, "192.168.1.9:7000");
        assert_eq!(config.recv_timeout_ms, Some(750));
    }
}
