//! Heartbeat responder.
//!
//! Runs as its own task against a dedicated receiver one port above the
//! main one, so liveness pings are answered even while a pull gather is
//! blocking the main loop. Pings carrying a config body are staged as
//! reconfiguration snapshots for the main loop; every ping gets a liveness
//! reply carrying the agent's current push epoch.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cluster::{PendingReconfig, Reconfiguration};
use crate::message::Envelope;
use crate::transport::Transport;

/// The agent-side half of the master's liveness protocol.
pub struct HeartbeatTask {
    sender: Arc<dyn Transport>,
    receiver: Arc<dyn Transport>,
    pending: Arc<PendingReconfig>,
    epoch: Arc<AtomicU64>,
    local_id: Arc<AtomicI32>,
}

impl HeartbeatTask {
    pub fn new(
        sender: Arc<dyn Transport>,
        receiver: Arc<dyn Transport>,
        pending: Arc<PendingReconfig>,
        epoch: Arc<AtomicU64>,
        local_id: Arc<AtomicI32>,
    ) -> Self {
        Self {
            sender,
            receiver,
            pending,
            epoch,
            local_id,
        }
    }

    /// Answer pings until the receiver shuts down.
    pub async fn run(self) {
        loop {
            let payload = match self.receiver.recv().await {
                Ok(payload) => payload,
                Err(e) => {
                    info!(error = %e, "heartbeat receiver closed, stopping");
                    return;
                }
            };
            let envelope = match Envelope::decode_from_bytes(&payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(error = %e, "dropping undecodable heartbeat");
                    continue;
                }
            };
            self.handle_ping(&envelope).await;
        }
    }

    async fn handle_ping(&self, envelope: &Envelope) {
        if envelope.config_msg.is_some() {
            match Reconfiguration::from_envelope(envelope) {
                Ok(snapshot) => {
                    info!(
                        from = envelope.send_id,
                        local_id = snapshot.local_id,
                        shards = snapshot.view.shard_count(),
                        "staging reconfiguration"
                    );
                    if self.pending.stage(snapshot) {
                        warn!("replaced an unapplied reconfiguration snapshot");
                    }
                }
                Err(e) => {
                    warn!(from = envelope.send_id, error = %e, "ignoring malformed reconfiguration");
                }
            }
        }

        let reply = Envelope::heartbeat(
            self.local_id.load(Ordering::SeqCst),
            envelope.send_id,
            self.epoch.load(Ordering::SeqCst),
        );
        // Reply to whoever pinged, not to a hard-coded master id
        if let Err(e) = self.sender.send(envelope.send_id, reply.encode_to_bytes()).await {
            warn!(to = envelope.send_id, error = %e, "heartbeat reply failed");
        } else {
            debug!(to = envelope.send_id, "heartbeat answered");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::message::{ConfigMsg, MessageType, MASTER_ID};
    use crate::transport::MemoryHub;

    fn ping(send_id: i32, recv_id: i32) -> Envelope {
        Envelope {
            message_type: MessageType::Heartbeat as i32,
            send_id,
            recv_id,
            heartbeat_msg: Some(crate::message::HeartbeatMsg {
                is_live: true,
                epoch: 0,
            }),
            ..Envelope::default()
        }
    }

    fn config_msg() -> ConfigMsg {
        let mut node_addrs = HashMap::new();
        node_addrs.insert(0, "master:1".to_string());
        node_addrs.insert(5, "shard5:1".to_string());
        ConfigMsg {
            worker_count: 1,
            shard_count: 1,
            key_range: 10,
            shard_ids: vec![5],
            master_ids: vec![0],
            node_addrs,
            partition: vec![0, 10],
        }
    }

    struct Fixture {
        master: Arc<crate::transport::MemoryTransport>,
        pending: Arc<PendingReconfig>,
        epoch: Arc<AtomicU64>,
        task: tokio::task::JoinHandle<()>,
    }

    fn start_task(hub: &Arc<MemoryHub>) -> Fixture {
        let master = hub.open("master:1", 8);
        let sender = hub.open("agent-hb-sender", 8);
        let receiver = hub.open("agent:15556", 8);
        sender.register_address(MASTER_ID, "master:1");
        master.register_address(3, "agent:15556");

        let pending = Arc::new(PendingReconfig::new());
        let epoch = Arc::new(AtomicU64::new(4));
        let local_id = Arc::new(AtomicI32::new(3));
        let task = HeartbeatTask::new(
            sender,
            receiver,
            Arc::clone(&pending),
            Arc::clone(&epoch),
            Arc::clone(&local_id),
        );
        Fixture {
            master,
            pending,
            epoch,
            task: tokio::spawn(task.run()),
        }
    }

    #[tokio::test]
    async fn test_ping_gets_epoch_reply() {
        let hub = MemoryHub::new();
        let fx = start_task(&hub);

        fx.master
            .send(3, ping(MASTER_ID, 3).encode_to_bytes())
            .await
            .unwrap();

        let reply = Envelope::decode_from_bytes(&fx.master.recv().await.unwrap()).unwrap();
        assert_eq!(reply.kind(), Some(MessageType::Heartbeat));
        assert_eq!(reply.send_id, 3);
        assert_eq!(reply.recv_id, MASTER_ID);
        let hb = reply.heartbeat_msg.unwrap();
        assert!(hb.is_live);
        assert_eq!(hb.epoch, 4);
        // A plain ping stages nothing
        assert!(fx.pending.take().is_none());

        fx.task.abort();
    }

    #[tokio::test]
    async fn test_config_ping_stages_snapshot_and_still_replies() {
        let hub = MemoryHub::new();
        let fx = start_task(&hub);
        fx.epoch.store(9, Ordering::SeqCst);

        let mut env = ping(MASTER_ID, 8);
        env.config_msg = Some(config_msg());
        fx.master.send(3, env.encode_to_bytes()).await.unwrap();

        let reply = Envelope::decode_from_bytes(&fx.master.recv().await.unwrap()).unwrap();
        assert_eq!(reply.heartbeat_msg.unwrap().epoch, 9);

        let snapshot = fx.pending.take().unwrap();
        assert_eq!(snapshot.local_id, 8);
        assert_eq!(snapshot.view.shard_ids, vec![5]);

        fx.task.abort();
    }

    #[tokio::test]
    async fn test_malformed_config_is_ignored_but_answered() {
        let hub = MemoryHub::new();
        let fx = start_task(&hub);

        let mut bad = config_msg();
        bad.node_addrs.clear();
        let mut env = ping(MASTER_ID, 3);
        env.config_msg = Some(bad);
        fx.master.send(3, env.encode_to_bytes()).await.unwrap();

        let reply = Envelope::decode_from_bytes(&fx.master.recv().await.unwrap()).unwrap();
        assert_eq!(reply.kind(), Some(MessageType::Heartbeat));
        assert!(fx.pending.take().is_none());

        fx.task.abort();
    }

    #[tokio::test]
    async fn test_newer_snapshot_replaces_older() {
        let hub = MemoryHub::new();
        let fx = start_task(&hub);

        let mut first = ping(MASTER_ID, 3);
        first.config_msg = Some(config_msg());
        let mut second = ping(MASTER_ID, 4);
        second.config_msg = Some(config_msg());

        fx.master.send(3, first.encode_to_bytes()).await.unwrap();
        fx.master.recv().await.unwrap();
        fx.master.send(3, second.encode_to_bytes()).await.unwrap();
        fx.master.recv().await.unwrap();

        // Only the second snapshot remains
        let snapshot = fx.pending.take().unwrap();
        assert_eq!(snapshot.local_id, 4);
        assert!(fx.pending.take().is_none());

        fx.task.abort();
    }
}
