//! Wire messages exchanged with the master and the storage shards.
//!
//! Every message on the wire is one protobuf-encoded [`Envelope`] carrying a
//! type tag, sender/receiver node ids, and at most one body. The schema is
//! declared with `prost` derive macros rather than a generated module, so
//! there is no build-time protoc dependency.

use std::collections::HashMap;

use prost::Message;

use crate::error::{AgentError, Result};

/// Well-known node id of the master.
pub const MASTER_ID: i32 = 0;

/// Sender id used before the master has assigned one.
pub const UNASSIGNED_ID: i32 = -1;

/// Discriminant of an [`Envelope`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    Register = 0,
    Config = 1,
    Request = 2,
    Heartbeat = 3,
    Terminate = 4,
}

/// Kind of a request body: keys only (pull) or keys with values (push and
/// pull replies).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum RequestKind {
    Key = 0,
    KeyValue = 1,
}

/// Registration body sent to the master during the join handshake.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterMsg {
    #[prost(string, tag = "1")]
    pub ip: String,
    #[prost(uint32, tag = "2")]
    pub port: u32,
    #[prost(bool, tag = "3")]
    pub is_server: bool,
}

/// Cluster configuration body, carried by the join reply and by
/// reconfiguration heartbeats.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfigMsg {
    #[prost(uint32, tag = "1")]
    pub worker_count: u32,
    #[prost(uint32, tag = "2")]
    pub shard_count: u32,
    #[prost(uint64, tag = "3")]
    pub key_range: u64,
    /// Node ids of the storage shards, in partition order.
    #[prost(int32, repeated, tag = "4")]
    pub shard_ids: Vec<i32>,
    #[prost(int32, repeated, tag = "5")]
    pub master_ids: Vec<i32>,
    /// Network address of every node in the cluster, keyed by node id.
    #[prost(map = "int32, string", tag = "6")]
    pub node_addrs: HashMap<i32, String>,
    /// `shard_count + 1` partition boundaries spanning `[0, key_range)`.
    #[prost(uint64, repeated, tag = "7")]
    pub partition: Vec<u64>,
}

/// Push/pull request body; also the body of a shard's pull reply.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestMsg {
    #[prost(enumeration = "RequestKind", tag = "1")]
    pub kind: i32,
    #[prost(uint64, repeated, tag = "2")]
    pub keys: Vec<u64>,
    #[prost(float, repeated, tag = "3")]
    pub values: Vec<f32>,
}

/// Liveness body exchanged with the master.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartbeatMsg {
    #[prost(bool, tag = "1")]
    pub is_live: bool,
    /// Completed push cycles since the last reconfiguration.
    #[prost(uint64, tag = "2")]
    pub epoch: u64,
}

/// One wire message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub message_type: i32,
    #[prost(int32, tag = "2")]
    pub send_id: i32,
    #[prost(int32, tag = "3")]
    pub recv_id: i32,
    #[prost(message, optional, tag = "4")]
    pub register_msg: Option<RegisterMsg>,
    #[prost(message, optional, tag = "5")]
    pub config_msg: Option<ConfigMsg>,
    #[prost(message, optional, tag = "6")]
    pub request_msg: Option<RequestMsg>,
    #[prost(message, optional, tag = "7")]
    pub heartbeat_msg: Option<HeartbeatMsg>,
}

impl Envelope {
    /// Registration envelope addressed to the master.
    pub fn register(ip: impl Into<String>, port: u16) -> Self {
        Self {
            message_type: MessageType::Register as i32,
            send_id: UNASSIGNED_ID,
            recv_id: MASTER_ID,
            register_msg: Some(RegisterMsg {
                ip: ip.into(),
                port: u32::from(port),
                is_server: false,
            }),
            ..Self::default()
        }
    }

    /// Pull request carrying keys only.
    pub fn key_request(send_id: i32, recv_id: i32, keys: Vec<u64>) -> Self {
        Self {
            message_type: MessageType::Request as i32,
            send_id,
            recv_id,
            request_msg: Some(RequestMsg {
                kind: RequestKind::Key as i32,
                keys,
                values: Vec::new(),
            }),
            ..Self::default()
        }
    }

    /// Push request (or pull reply) carrying keys and values.
    pub fn key_value_request(send_id: i32, recv_id: i32, keys: Vec<u64>, values: Vec<f32>) -> Self {
        Self {
            message_type: MessageType::Request as i32,
            send_id,
            recv_id,
            request_msg: Some(RequestMsg {
                kind: RequestKind::KeyValue as i32,
                keys,
                values,
            }),
            ..Self::default()
        }
    }

    /// Liveness reply to a master ping.
    pub fn heartbeat(send_id: i32, recv_id: i32, epoch: u64) -> Self {
        Self {
            message_type: MessageType::Heartbeat as i32,
            send_id,
            recv_id,
            heartbeat_msg: Some(HeartbeatMsg {
                is_live: true,
                epoch,
            }),
            ..Self::default()
        }
    }

    /// Terminate notification addressed to the master.
    pub fn terminate(send_id: i32) -> Self {
        Self {
            message_type: MessageType::Terminate as i32,
            send_id,
            recv_id: MASTER_ID,
            ..Self::default()
        }
    }

    /// Typed message discriminant, if the raw tag is recognized.
    pub fn kind(&self) -> Option<MessageType> {
        MessageType::try_from(self.message_type).ok()
    }

    /// Encode to wire bytes.
    pub fn encode_to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Decode from wire bytes.
    pub fn decode_from_bytes(payload: &[u8]) -> Result<Self> {
        Self::decode(payload)
            .map_err(|e| AgentError::protocol(format!("undecodable envelope: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_roundtrip() {
        let env = Envelope::register("10.0.0.7", 15555);
        let decoded = Envelope::decode_from_bytes(&env.encode_to_bytes()).unwrap();

        assert_eq!(decoded.kind(), Some(MessageType::Register));
        assert_eq!(decoded.send_id, UNASSIGNED_ID);
        assert_eq!(decoded.recv_id, MASTER_ID);
        let reg = decoded.register_msg.unwrap();
        assert_eq!(reg.ip, "10.0.0.7");
        assert_eq!(reg.port, 15555);
        assert!(!reg.is_server);
    }

    #[test]
    fn test_request_bodies() {
        let pull = Envelope::key_request(3, 5, vec![1, 3, 9]);
        let req = pull.request_msg.as_ref().unwrap();
        assert_eq!(req.kind, RequestKind::Key as i32);
        assert!(req.values.is_empty());

        let push = Envelope::key_value_request(3, 5, vec![1, 3], vec![0.5, -2.0]);
        let decoded = Envelope::decode_from_bytes(&push.encode_to_bytes()).unwrap();
        let req = decoded.request_msg.unwrap();
        assert_eq!(req.kind, RequestKind::KeyValue as i32);
        assert_eq!(req.keys, vec![1, 3]);
        assert_eq!(req.values, vec![0.5, -2.0]);
    }

    #[test]
    fn test_heartbeat_carries_epoch() {
        let env = Envelope::heartbeat(4, MASTER_ID, 17);
        let decoded = Envelope::decode_from_bytes(&env.encode_to_bytes()).unwrap();
        let hb = decoded.heartbeat_msg.unwrap();
        assert!(hb.is_live);
        assert_eq!(hb.epoch, 17);
    }

    #[test]
    fn test_config_roundtrip() {
        let mut node_addrs = HashMap::new();
        node_addrs.insert(0, "10.0.0.1:16666".to_string());
        node_addrs.insert(5, "10.0.0.2:17777".to_string());

        let env = Envelope {
            message_type: MessageType::Config as i32,
            send_id: MASTER_ID,
            recv_id: 2,
            config_msg: Some(ConfigMsg {
                worker_count: 2,
                shard_count: 1,
                key_range: 100,
                shard_ids: vec![5],
                master_ids: vec![0],
                node_addrs,
                partition: vec![0, 100],
            }),
            ..Envelope::default()
        };

        let decoded = Envelope::decode_from_bytes(&env.encode_to_bytes()).unwrap();
        let cfg = decoded.config_msg.unwrap();
        assert_eq!(cfg.shard_ids, vec![5]);
        assert_eq!(cfg.partition, vec![0, 100]);
        assert_eq!(cfg.node_addrs[&5], "10.0.0.2:17777");
    }

    #[test]
    fn test_garbage_is_rejected() {
        // A stray length-delimited field with a truncated payload
        assert!(Envelope::decode_from_bytes(&[0x3a, 0x05, 0x01]).is_err());
    }
}
