//! The agent: composition root and worker-driven main loop.
//!
//! After bootstrap the main loop owns the cluster view, partition table,
//! and epoch counter exclusively. The heartbeat task runs beside it and
//! communicates only through the pending-reconfiguration mailbox and the
//! shared atomics, so no lock is ever held across a receive or an IPC
//! access.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cluster::{ClusterView, PendingReconfig, Reconfiguration};
use crate::config::AgentConfig;
use crate::engine::PushPullEngine;
use crate::error::Result;
use crate::handshake;
use crate::heartbeat::HeartbeatTask;
use crate::ipc::{WorkerLink, WorkerSignal};
use crate::message::{Envelope, MASTER_ID};
use crate::partition::PartitionTable;
use crate::transport::Transport;

/// Lifecycle of an agent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Initializing,
    Running,
    Terminating,
    Terminated,
}

/// A parameter-server agent bound to one local training worker.
pub struct Agent {
    config: AgentConfig,
    sender: Arc<dyn Transport>,
    receiver: Arc<dyn Transport>,
    worker: Box<dyn WorkerLink>,
    engine: PushPullEngine,
    local_id: Arc<AtomicI32>,
    epoch: Arc<AtomicU64>,
    pending: Arc<PendingReconfig>,
    view: ClusterView,
    partition: PartitionTable,
    state: AgentState,
    heartbeat: Option<JoinHandle<()>>,
}

impl Agent {
    /// Join the cluster and assemble the agent.
    ///
    /// # Errors
    ///
    /// Any handshake failure aborts initialization; nothing is retried
    /// here.
    pub async fn initialize(
        config: AgentConfig,
        sender: Arc<dyn Transport>,
        receiver: Arc<dyn Transport>,
        worker: Box<dyn WorkerLink>,
    ) -> Result<Self> {
        config.validate()?;
        let outcome = handshake::join(sender.as_ref(), receiver.as_ref(), &config).await?;

        let engine = PushPullEngine::new(
            Arc::clone(&sender),
            Arc::clone(&receiver),
            config.recv_timeout(),
        );
        Ok(Self {
            config,
            sender,
            receiver,
            worker,
            engine,
            local_id: Arc::new(AtomicI32::new(outcome.local_id)),
            epoch: Arc::new(AtomicU64::new(0)),
            pending: Arc::new(PendingReconfig::new()),
            view: outcome.view,
            partition: outcome.partition,
            state: AgentState::Initializing,
            heartbeat: None,
        })
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn local_id(&self) -> i32 {
        self.local_id.load(Ordering::SeqCst)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Spawn the heartbeat responder on its dedicated receiver and run the
    /// main loop until the worker terminates the agent. Returns the final
    /// lifecycle state, `Terminated` after a clean exit.
    ///
    /// # Errors
    ///
    /// Fails only when the worker link breaks; push/pull failures are
    /// logged and survived.
    pub async fn start(mut self, heartbeat_receiver: Arc<dyn Transport>) -> Result<AgentState> {
        let task = HeartbeatTask::new(
            Arc::clone(&self.sender),
            Arc::clone(&heartbeat_receiver),
            Arc::clone(&self.pending),
            Arc::clone(&self.epoch),
            Arc::clone(&self.local_id),
        );
        self.heartbeat = Some(tokio::spawn(task.run()));
        self.state = AgentState::Running;
        info!(local_id = self.local_id(), "agent running");

        let result = self.run().await;
        self.finalize(heartbeat_receiver).await;
        result.map(|()| self.state)
    }

    async fn run(&mut self) -> Result<()> {
        loop {
            let signal = self.worker.wait_signal().await?;

            // Reconfiguration checkpoint: only here, never mid-push/pull
            if let Some(snapshot) = self.pending.take() {
                self.apply_reconfiguration(snapshot);
            }

            match signal {
                WorkerSignal::Pull => {
                    if let Err(e) = self.handle_pull().await {
                        error!(error = %e, "pull cycle failed");
                    }
                }
                WorkerSignal::Push => {
                    if let Err(e) = self.handle_push().await {
                        error!(error = %e, "push cycle failed");
                    }
                }
                WorkerSignal::Terminate => {
                    self.state = AgentState::Terminating;
                    self.notify_terminate().await;
                    return Ok(());
                }
            }
        }
    }

    async fn handle_pull(&self) -> Result<()> {
        let keys = self.worker.read_batch().await?;
        let local_id = self.local_id();
        let pulled = self
            .engine
            .pull(local_id, &self.partition, &self.view, keys)
            .await?;
        self.worker.write_batch(&pulled).await?;
        self.worker.signal_ready().await
    }

    async fn handle_push(&self) -> Result<()> {
        let batch = self.worker.read_batch().await?;
        let local_id = self.local_id();
        self.engine
            .push(local_id, &self.partition, &self.view, batch)
            .await?;
        // A completed push cycle, even a partially dropped one
        self.epoch.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn apply_reconfiguration(&mut self, snapshot: Reconfiguration) {
        let partition = match PartitionTable::new(
            snapshot.view.key_range,
            snapshot.view.shard_count(),
            snapshot.boundaries,
        ) {
            Ok(partition) => partition,
            Err(e) => {
                // Discard and wait for the master's next attempt
                warn!(error = %e, "discarding reconfiguration with invalid partition");
                return;
            }
        };

        for (&id, addr) in &snapshot.view.node_addrs {
            if !self.sender.has_address(id, addr) {
                self.sender.remove_address(id);
                self.sender.register_address(id, addr);
            }
        }

        self.local_id.store(snapshot.local_id, Ordering::SeqCst);
        self.view = snapshot.view;
        self.partition = partition;
        self.epoch.store(0, Ordering::SeqCst);
        info!(
            local_id = self.local_id(),
            shards = self.view.shard_count(),
            "reconfiguration applied, epoch reset"
        );
    }

    async fn notify_terminate(&self) {
        let envelope = Envelope::terminate(self.local_id());
        if let Err(e) = self.sender.send(MASTER_ID, envelope.encode_to_bytes()).await {
            warn!(error = %e, "could not notify master of termination");
        }
        // Grace period so in-flight sends drain before teardown
        tokio::time::sleep(Duration::from_millis(self.config.terminate_grace_ms)).await;
    }

    async fn finalize(&mut self, heartbeat_receiver: Arc<dyn Transport>) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
        heartbeat_receiver.shutdown().await;
        self.receiver.shutdown().await;
        self.sender.shutdown().await;
        self.state = AgentState::Terminated;
        info!("agent terminated");
    }
}
