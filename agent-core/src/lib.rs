//! Parameter-Server Agent - Core Library
//!
//! This crate provides the agent-side runtime of a sharded parameter
//! server: the cluster-join handshake, key-range partition routing, the
//! push/pull scatter-gather engine, heartbeat-driven reconfiguration, and
//! the IPC loop serving a local training worker.

pub mod config;
pub mod error;

// Re-export commonly used types for convenience
pub use config::{AgentConfig, IpcConfig};
pub use error::{AgentError, Result};

pub mod batch;
pub use batch::KeyValueBatch;

pub mod message;
pub use message::{
    ConfigMsg, Envelope, HeartbeatMsg, MessageType, RegisterMsg, RequestKind, RequestMsg,
    MASTER_ID, UNASSIGNED_ID,
};

pub mod partition;
pub use partition::{ContiguousRun, PartitionTable};

pub mod cluster;
pub use cluster::{ClusterView, PendingReconfig, Reconfiguration};

pub mod transport;
pub use transport::{MemoryHub, MemoryTransport, TcpTransport, Transport};

pub mod ipc;
pub use ipc::{ChannelWorkerLink, ShmWorkerLink, WorkerHandle, WorkerLink, WorkerSignal};

pub mod handshake;
pub use handshake::{join, JoinOutcome};

pub mod engine;
pub use engine::PushPullEngine;

pub mod heartbeat;
pub use heartbeat::HeartbeatTask;

pub mod agent;
pub use agent::{Agent, AgentState};
