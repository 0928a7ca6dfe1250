//! In-process worker link over channels.
//!
//! [`ChannelWorkerLink::pair`] yields the agent-side link and a
//! [`WorkerHandle`] a test (or a same-process worker task) drives: write a
//! batch into the shared request slot, raise a signal, await the ready
//! byte, read the reply slot back.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{WorkerLink, WorkerSignal, READY_SIGNAL};
use crate::batch::KeyValueBatch;
use crate::error::{AgentError, Result};

/// Agent side of an in-process worker link.
pub struct ChannelWorkerLink {
    signals: tokio::sync::Mutex<mpsc::Receiver<u8>>,
    ready: mpsc::Sender<u8>,
    request_slot: Arc<Mutex<KeyValueBatch>>,
    reply_slot: Arc<Mutex<KeyValueBatch>>,
    capacity: usize,
}

/// Worker side of an in-process link.
pub struct WorkerHandle {
    signals: mpsc::Sender<u8>,
    ready: tokio::sync::Mutex<mpsc::Receiver<u8>>,
    request_slot: Arc<Mutex<KeyValueBatch>>,
    reply_slot: Arc<Mutex<KeyValueBatch>>,
}

impl ChannelWorkerLink {
    /// Build a connected link/handle pair with the given batch capacity.
    pub fn pair(capacity: usize) -> (Self, WorkerHandle) {
        let (signal_tx, signal_rx) = mpsc::channel(8);
        let (ready_tx, ready_rx) = mpsc::channel(8);
        let request_slot = Arc::new(Mutex::new(KeyValueBatch::new()));
        let reply_slot = Arc::new(Mutex::new(KeyValueBatch::new()));

        let link = Self {
            signals: tokio::sync::Mutex::new(signal_rx),
            ready: ready_tx,
            request_slot: Arc::clone(&request_slot),
            reply_slot: Arc::clone(&reply_slot),
            capacity,
        };
        let handle = WorkerHandle {
            signals: signal_tx,
            ready: tokio::sync::Mutex::new(ready_rx),
            request_slot,
            reply_slot,
        };
        (link, handle)
    }
}

#[async_trait]
impl WorkerLink for ChannelWorkerLink {
    async fn wait_signal(&self) -> Result<WorkerSignal> {
        let byte = self
            .signals
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| AgentError::ipc("worker signal channel closed"))?;
        WorkerSignal::from_byte(byte)
    }

    async fn signal_ready(&self) -> Result<()> {
        self.ready
            .send(READY_SIGNAL)
            .await
            .map_err(|_| AgentError::ipc("worker ready channel closed"))
    }

    async fn read_batch(&self) -> Result<KeyValueBatch> {
        let slot = self.request_slot.lock().unwrap_or_else(|e| e.into_inner());
        Ok(slot.clone())
    }

    async fn write_batch(&self, batch: &KeyValueBatch) -> Result<()> {
        if batch.len() > self.capacity {
            return Err(AgentError::ipc(format!(
                "pulled batch of {} pairs exceeds region capacity {}",
                batch.len(),
                self.capacity
            )));
        }
        let mut slot = self.reply_slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = batch.clone();
        Ok(())
    }
}

impl WorkerHandle {
    /// Place a batch in the request slot for the agent to read.
    pub fn write_request(&self, batch: KeyValueBatch) {
        *self.request_slot.lock().unwrap_or_else(|e| e.into_inner()) = batch;
    }

    /// Read back the agent's reply slot.
    pub fn read_reply(&self) -> KeyValueBatch {
        self.reply_slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Raise a signal towards the agent.
    pub async fn signal(&self, signal: WorkerSignal) -> Result<()> {
        self.signals
            .send(signal.as_byte())
            .await
            .map_err(|_| AgentError::ipc("agent signal channel closed"))
    }

    /// Await the agent's ready byte after a pull.
    pub async fn wait_ready(&self) -> Result<u8> {
        self.ready
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| AgentError::ipc("agent ready channel closed"))
    }
}
