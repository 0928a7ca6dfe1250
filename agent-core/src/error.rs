use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Key {key} outside partitioned range [0, {key_range})")]
    KeyOutOfRange {
        key: u64,
        key_range: u64,
    },

    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Protocol violation: {message}")]
    Protocol {
        message: String,
    },

    #[error("No usable IPv4 address on interface {interface}")]
    NoInterfaceIp {
        interface: String,
    },

    #[error("IPC error: {message}")]
    Ipc {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },
}

pub type Result<T> = std::result::Result<T, AgentError>;

// Convenience constructors
impl AgentError {

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn key_out_of_range(key: u64, key_range: u64) -> Self {
        Self::KeyOutOfRange { key, key_range }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    pub fn transport_with_source(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn no_interface_ip(interface: impl Into<String>) -> Self {
        Self::NoInterfaceIp {
            interface: interface.into(),
        }
    }

    pub fn ipc(message: impl Into<String>) -> Self {
        Self::Ipc {
            message: message.into(),
            source: None,
        }
    }

    pub fn ipc_with_source(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Ipc {
            message: message.into(),
            source: Some(source),
        }
    }
}
