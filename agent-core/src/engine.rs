//! Push/pull scatter-gather engine.
//!
//! A push scatters one key/value request per contiguous same-shard run and
//! returns without waiting for acknowledgement. A pull scatters key
//! requests the same way, then gathers replies on the main receiver until
//! every contacted shard has answered. Replies that fail validation are
//! logged and skipped without shrinking the pending set, so a stray or
//! malformed message can never satisfy an outstanding shard.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::batch::KeyValueBatch;
use crate::cluster::ClusterView;
use crate::error::Result;
use crate::message::{Envelope, MessageType, RequestKind};
use crate::partition::PartitionTable;
use crate::transport::Transport;

/// Routes worker batches to shards and gathers pull replies.
pub struct PushPullEngine {
    sender: Arc<dyn Transport>,
    receiver: Arc<dyn Transport>,
    recv_timeout: Option<Duration>,
}

impl PushPullEngine {
    pub fn new(
        sender: Arc<dyn Transport>,
        receiver: Arc<dyn Transport>,
        recv_timeout: Option<Duration>,
    ) -> Self {
        Self {
            sender,
            receiver,
            recv_timeout,
        }
    }

    /// Scatter a gradient batch to its owning shards, fire-and-forget.
    ///
    /// The batch is key-sorted and deduplicated first, keeping each key's
    /// first-pushed value. A failed send to one shard is logged and the
    /// update to that shard dropped; remaining runs still go out.
    ///
    /// # Errors
    ///
    /// Fails only on routing errors: a key outside the partition domain or
    /// a shard index the view cannot resolve.
    pub async fn push(
        &self,
        local_id: i32,
        partition: &PartitionTable,
        view: &ClusterView,
        mut batch: KeyValueBatch,
    ) -> Result<()> {
        if batch.is_empty() {
            debug!("push of empty batch, nothing to send");
            return Ok(());
        }
        batch.sort_dedup();

        let mut start = 0;
        while start < batch.len() {
            let run = partition.next_contiguous_run(&batch.keys, start)?;
            let node = view.shard_node(run.shard)?;
            let envelope = Envelope::key_value_request(
                local_id,
                node,
                batch.keys[start..run.end].to_vec(),
                batch.values[start..run.end].to_vec(),
            );
            if let Err(e) = self.sender.send(node, envelope.encode_to_bytes()).await {
                warn!(node, error = %e, "push to shard failed, dropping update");
            }
            start = run.end;
        }
        Ok(())
    }

    /// Fetch current parameters for a key batch from their owning shards.
    ///
    /// Keys are sorted (duplicates kept) and scattered as one key request
    /// per contiguous same-shard run; the gather loop then blocks until
    /// every contacted shard has sent a valid key/value reply. The returned
    /// batch holds the union of the replies in arrival order.
    ///
    /// # Errors
    ///
    /// Fails on routing errors and on a failed request send. Invalid or
    /// misaddressed replies never fail the pull; they are logged and the
    /// loop keeps waiting.
    pub async fn pull(
        &self,
        local_id: i32,
        partition: &PartitionTable,
        view: &ClusterView,
        mut batch: KeyValueBatch,
    ) -> Result<KeyValueBatch> {
        if batch.is_empty() {
            debug!("pull of empty batch, nothing to fetch");
            return Ok(KeyValueBatch::new());
        }
        batch.sort_keys();

        let mut pending: HashSet<i32> = HashSet::new();
        let mut start = 0;
        while start < batch.len() {
            let run = partition.next_contiguous_run(&batch.keys, start)?;
            let node = view.shard_node(run.shard)?;
            let envelope =
                Envelope::key_request(local_id, node, batch.keys[start..run.end].to_vec());
            self.sender.send(node, envelope.encode_to_bytes()).await?;
            pending.insert(node);
            start = run.end;
        }
        debug!(shards = pending.len(), keys = batch.len(), "pull scattered");

        let mut gathered = KeyValueBatch::with_capacity(batch.len());
        while !pending.is_empty() {
            let payload = match self.recv_next().await {
                Ok(payload) => payload,
                Err(e) => {
                    error!(error = %e, outstanding = pending.len(), "pull receive failed, retrying");
                    continue;
                }
            };
            let envelope = match Envelope::decode_from_bytes(&payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(error = %e, "dropping undecodable message during pull");
                    continue;
                }
            };
            if envelope.kind() != Some(MessageType::Request) {
                warn!(
                    message_type = envelope.message_type,
                    from = envelope.send_id,
                    "dropping non-request message during pull"
                );
                continue;
            }
            let Some(request) = envelope.request_msg.as_ref() else {
                warn!(from = envelope.send_id, "dropping request with no body");
                continue;
            };
            if !pending.contains(&envelope.send_id) {
                warn!(from = envelope.send_id, "dropping reply from unexpected sender");
                continue;
            }
            if envelope.recv_id != local_id {
                warn!(
                    from = envelope.send_id,
                    addressed_to = envelope.recv_id,
                    "dropping reply addressed to another node"
                );
                continue;
            }
            if request.kind != RequestKind::KeyValue as i32 {
                warn!(from = envelope.send_id, "dropping keys-only reply");
                continue;
            }
            if request.keys.len() != request.values.len() {
                warn!(
                    from = envelope.send_id,
                    keys = request.keys.len(),
                    values = request.values.len(),
                    "dropping reply with mismatched key/value lengths"
                );
                continue;
            }

            pending.remove(&envelope.send_id);
            gathered.extend_from(&request.keys, &request.values);
            debug!(
                from = envelope.send_id,
                pairs = request.keys.len(),
                outstanding = pending.len(),
                "pull reply gathered"
            );
        }
        Ok(gathered)
    }

    async fn recv_next(&self) -> Result<Vec<u8>> {
        match self.recv_timeout {
            None => self.receiver.recv().await,
            Some(timeout) => match tokio::time::timeout(timeout, self.receiver.recv()).await {
                Ok(result) => result,
                Err(_) => Err(crate::error::AgentError::transport(format!(
                    "no reply within {timeout:?}"
                ))),
            },
        }
    }
}
