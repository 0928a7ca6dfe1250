//! Cluster join handshake.
//!
//! One-shot bootstrap against the master: announce this agent's reachable
//! address, block for the initial cluster configuration, and materialize
//! the partition table and shard address registry from it. Every step is
//! fatal on error; the caller decides whether to retry the whole sequence.

use tracing::{debug, info};

use crate::cluster::ClusterView;
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::message::{Envelope, MessageType, MASTER_ID};
use crate::partition::PartitionTable;
use crate::transport::Transport;

/// Everything the join handshake establishes.
#[derive(Debug)]
pub struct JoinOutcome {
    /// Node id the master assigned to this agent.
    pub local_id: i32,
    pub view: ClusterView,
    pub partition: PartitionTable,
    /// The IP this agent announced to the master.
    pub announced_ip: String,
}

/// Register with the master and receive the initial cluster configuration.
///
/// `sender` ends up with the master's and every shard's address
/// registered; `receiver` must already be listening on
/// `config.listen_port`.
pub async fn join(
    sender: &dyn Transport,
    receiver: &dyn Transport,
    config: &AgentConfig,
) -> Result<JoinOutcome> {
    // 1. Resolve the agent's reachable IP.
    let ip = match &config.announced_ip {
        Some(ip) => ip.clone(),
        None => netif::resolve_ipv4(config.net_interface.as_deref())?,
    };
    info!(ip, port = config.listen_port, "announcing agent address");

    // 2. Register with the master at its well-known id.
    sender.register_address(MASTER_ID, &config.master_addr);
    let register = Envelope::register(ip.clone(), config.listen_port);
    sender.send(MASTER_ID, register.encode_to_bytes()).await?;

    // 3. Block for exactly one config envelope.
    let payload = receiver.recv().await?;
    let envelope = Envelope::decode_from_bytes(&payload)?;
    if envelope.kind() != Some(MessageType::Config) {
        return Err(AgentError::protocol(format!(
            "expected config envelope during join, got type {}",
            envelope.message_type
        )));
    }
    let config_msg = envelope
        .config_msg
        .as_ref()
        .ok_or_else(|| AgentError::protocol("config envelope carries no config body"))?;

    // 4. Extract identity, cluster view, and partition.
    let local_id = envelope.recv_id;
    let view = ClusterView::from_config_msg(config_msg)?;
    let partition = PartitionTable::new(
        config_msg.key_range,
        view.shard_count(),
        config_msg.partition.clone(),
    )?;
    info!(
        local_id,
        shards = view.shard_count(),
        key_range = view.key_range,
        "joined cluster"
    );

    // 5. Seed the sender's registry with every node's address so shard
    // requests and heartbeat replies resolve.
    for (&id, addr) in &view.node_addrs {
        debug!(id, addr, "registering node address");
        sender.register_address(id, addr);
    }

    Ok(JoinOutcome {
        local_id,
        view,
        partition,
        announced_ip: ip,
    })
}

/// Local interface address resolution.
mod netif {
    use super::{AgentError, Result};

    /// First IPv4 address on `interface`, or on any non-loopback interface
    /// when none is named.
    pub fn resolve_ipv4(interface: Option<&str>) -> Result<String> {
        let mut addrs: *mut libc::ifaddrs = std::ptr::null_mut();
        // SAFETY: getifaddrs allocates the list into addrs on success; we
        // free it with freeifaddrs on every path below.
        if unsafe { libc::getifaddrs(&mut addrs) } != 0 {
            return Err(AgentError::transport_with_source(
                "getifaddrs failed",
                std::io::Error::last_os_error(),
            ));
        }

        let mut found = None;
        let mut cursor = addrs;
        while !cursor.is_null() {
            // SAFETY: cursor walks the linked list getifaddrs returned;
            // each node is valid until freeifaddrs.
            let entry = unsafe { &*cursor };
            cursor = entry.ifa_next;

            if entry.ifa_addr.is_null() {
                continue;
            }
            // SAFETY: ifa_addr points to a sockaddr of the family it
            // declares; we only reinterpret it after checking AF_INET.
            let family = unsafe { (*entry.ifa_addr).sa_family };
            if i32::from(family) != libc::AF_INET {
                continue;
            }

            // SAFETY: ifa_name is a NUL-terminated interface name.
            let name = unsafe { std::ffi::CStr::from_ptr(entry.ifa_name) }
                .to_string_lossy()
                .into_owned();

            let loopback = entry.ifa_flags & libc::IFF_LOOPBACK as u32 != 0;
            let wanted = match interface {
                Some(requested) => name == requested,
                None => !loopback,
            };
            if !wanted {
                continue;
            }

            // SAFETY: family is AF_INET, so ifa_addr is a sockaddr_in.
            let sin = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in) };
            let octets = u32::from_be(sin.sin_addr.s_addr).to_be_bytes();
            found = Some(std::net::Ipv4Addr::from(octets).to_string());
            break;
        }

        // SAFETY: addrs came from getifaddrs above.
        unsafe { libc::freeifaddrs(addrs) };

        found.ok_or_else(|| {
            AgentError::no_interface_ip(interface.unwrap_or("<any non-loopback>"))
        })
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_loopback_interface_resolves() {
            // Every Linux host has lo at 127.0.0.1
            let ip = resolve_ipv4(Some("lo")).unwrap();
            assert_eq!(ip, "127.0.0.1");
        }

        #[test]
        fn test_missing_interface_fails() {
            let err = resolve_ipv4(Some("definitely-not-an-interface0")).unwrap_err();
            assert!(matches!(err, AgentError::NoInterfaceIp { .. }));
        }
    }
}
