//! Cluster membership view and staged reconfigurations.
//!
//! The [`ClusterView`] is owned exclusively by the agent's main loop after
//! bootstrap. The heartbeat loop never mutates it; it stages a
//! [`Reconfiguration`] in the single-slot [`PendingReconfig`] mailbox, and
//! the main loop applies it as a checkpoint between worker requests.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{AgentError, Result};
use crate::message::{ConfigMsg, Envelope};

/// The agent's view of cluster membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterView {
    /// Number of training workers in the cluster.
    pub worker_count: u32,
    /// Node ids of the storage shards, in partition order: the shard at
    /// partition index `i` is node `shard_ids[i]`.
    pub shard_ids: Vec<i32>,
    /// Node ids of the masters.
    pub master_ids: Vec<i32>,
    /// Size of the key domain.
    pub key_range: u64,
    /// Network address of every node, keyed by node id.
    pub node_addrs: HashMap<i32, String>,
}

impl ClusterView {
    /// Build a view from a config body, checking internal consistency.
    pub fn from_config_msg(msg: &ConfigMsg) -> Result<Self> {
        if msg.shard_ids.len() != msg.shard_count as usize {
            return Err(AgentError::protocol(format!(
                "config announces {} shards but lists {} shard ids",
                msg.shard_count,
                msg.shard_ids.len()
            )));
        }
        if msg.shard_ids.is_empty() {
            return Err(AgentError::protocol("config lists no shards"));
        }
        for &id in msg.shard_ids.iter().chain(msg.master_ids.iter()) {
            if !msg.node_addrs.contains_key(&id) {
                return Err(AgentError::protocol(format!(
                    "config lists node {id} without an address"
                )));
            }
        }
        Ok(Self {
            worker_count: msg.worker_count,
            shard_ids: msg.shard_ids.clone(),
            master_ids: msg.master_ids.clone(),
            key_range: msg.key_range,
            node_addrs: msg.node_addrs.clone(),
        })
    }

    pub fn shard_count(&self) -> usize {
        self.shard_ids.len()
    }

    /// Node id of the shard at partition index `shard`.
    pub fn shard_node(&self, shard: usize) -> Result<i32> {
        self.shard_ids.get(shard).copied().ok_or_else(|| {
            AgentError::config(format!(
                "partition produced shard index {shard} but the view lists {} shards",
                self.shard_ids.len()
            ))
        })
    }
}

/// A staged cluster/partition snapshot awaiting application.
#[derive(Debug, Clone)]
pub struct Reconfiguration {
    /// Node id the master (re)assigned to this agent.
    pub local_id: i32,
    pub view: ClusterView,
    /// Partition boundaries; validated when the snapshot is applied.
    pub boundaries: Vec<u64>,
}

impl Reconfiguration {
    /// Extract a snapshot from a config-bearing envelope.
    pub fn from_envelope(env: &Envelope) -> Result<Self> {
        let msg = env
            .config_msg
            .as_ref()
            .ok_or_else(|| AgentError::protocol("envelope carries no config body"))?;
        Ok(Self {
            local_id: env.recv_id,
            view: ClusterView::from_config_msg(msg)?,
            boundaries: msg.partition.clone(),
        })
    }
}

/// Single-slot mailbox handing snapshots from the heartbeat loop to the
/// main loop. A newer snapshot overwrites an unconsumed one; snapshots are
/// never queued.
#[derive(Debug, Default)]
pub struct PendingReconfig {
    slot: Mutex<Option<Reconfiguration>>,
}

impl PendingReconfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a snapshot, replacing any unapplied one. Returns `true` if an
    /// unapplied snapshot was overwritten.
    pub fn stage(&self, snapshot: Reconfiguration) -> bool {
        // Lock held for the assignment only, never across an await.
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.replace(snapshot).is_some()
    }

    /// Consume the pending snapshot, leaving the slot empty.
    pub fn take(&self) -> Option<Reconfiguration> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    fn config_msg() -> ConfigMsg {
        let mut node_addrs = HashMap::new();
        node_addrs.insert(0, "m:1".to_string());
        node_addrs.insert(5, "s5:1".to_string());
        node_addrs.insert(7, "s7:1".to_string());
        ConfigMsg {
            worker_count: 1,
            shard_count: 2,
            key_range: 20,
            shard_ids: vec![5, 7],
            master_ids: vec![0],
            node_addrs,
            partition: vec![0, 10, 20],
        }
    }

    #[test]
    fn test_view_from_config() {
        let view = ClusterView::from_config_msg(&config_msg()).unwrap();
        assert_eq!(view.shard_count(), 2);
        assert_eq!(view.shard_node(1).unwrap(), 7);
        assert!(view.shard_node(2).is_err());
    }

    #[test]
    fn test_view_rejects_inconsistent_config() {
        let mut msg = config_msg();
        msg.shard_count = 3;
        assert!(ClusterView::from_config_msg(&msg).is_err());

        let mut msg = config_msg();
        msg.node_addrs.remove(&7);
        assert!(ClusterView::from_config_msg(&msg).is_err());

        let mut msg = config_msg();
        msg.shard_ids.clear();
        msg.shard_count = 0;
        assert!(ClusterView::from_config_msg(&msg).is_err());
    }

    #[test]
    fn test_reconfiguration_takes_local_id_from_envelope() {
        let env = Envelope {
            message_type: MessageType::Heartbeat as i32,
            send_id: 0,
            recv_id: 9,
            config_msg: Some(config_msg()),
            ..Envelope::default()
        };
        let snap = Reconfiguration::from_envelope(&env).unwrap();
        assert_eq!(snap.local_id, 9);
        assert_eq!(snap.boundaries, vec![0, 10, 20]);

        let bare = Envelope::terminate(1);
        assert!(Reconfiguration::from_envelope(&bare).is_err());
    }

    #[test]
    fn test_mailbox_overwrites_never_queues() {
        let pending = PendingReconfig::new();
        assert!(pending.take().is_none());

        let env = Envelope {
            recv_id: 1,
            config_msg: Some(config_msg()),
            ..Envelope::default()
        };
        let first = Reconfiguration::from_envelope(&env).unwrap();
        let mut second = first.clone();
        second.local_id = 2;

        assert!(!pending.stage(first));
        // Second snapshot replaces the unconsumed first
        assert!(pending.stage(second));

        let taken = pending.take().unwrap();
        assert_eq!(taken.local_id, 2);
        assert!(pending.take().is_none());
    }
}
