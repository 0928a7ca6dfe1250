//! IPC boundary to the local training worker.
//!
//! The worker drives the agent through a signal channel carrying discrete
//! intents and a bulk-data region carrying `(keys, values)` batches both
//! directions. [`ShmWorkerLink`] is the production implementation (named
//! FIFOs plus memory-mapped regions shared with a worker process);
//! [`ChannelWorkerLink`] serves tests and same-process workers.

mod channel;
mod shm;

pub use channel::{ChannelWorkerLink, WorkerHandle};
pub use shm::ShmWorkerLink;

use async_trait::async_trait;

use crate::batch::KeyValueBatch;
use crate::error::{AgentError, Result};

/// Byte written back on the ready channel once a pull completes.
pub const READY_SIGNAL: u8 = 2;

/// Discrete intent received from the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    Pull = 0,
    Push = 1,
    Terminate = 2,
}

impl WorkerSignal {
    /// Decode a signal byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::Pull),
            1 => Ok(Self::Push),
            2 => Ok(Self::Terminate),
            other => Err(AgentError::ipc(format!("unknown worker signal {other}"))),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Bidirectional channel to the local worker.
#[async_trait]
pub trait WorkerLink: Send + Sync {
    /// Block until the worker raises the next signal.
    async fn wait_signal(&self) -> Result<WorkerSignal>;

    /// Tell the worker its pulled parameters are ready.
    async fn signal_ready(&self) -> Result<()>;

    /// Read the worker's current request batch from the bulk region.
    async fn read_batch(&self) -> Result<KeyValueBatch>;

    /// Overwrite the reply region with `batch` for the worker to read.
    async fn write_batch(&self, batch: &KeyValueBatch) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_bytes() {
        assert_eq!(WorkerSignal::from_byte(0).unwrap(), WorkerSignal::Pull);
        assert_eq!(WorkerSignal::from_byte(1).unwrap(), WorkerSignal::Push);
        assert_eq!(WorkerSignal::from_byte(2).unwrap(), WorkerSignal::Terminate);
        assert!(WorkerSignal::from_byte(3).is_err());
        assert_eq!(WorkerSignal::Push.as_byte(), 1);
    }
}
