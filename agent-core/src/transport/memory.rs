//! In-process transport for tests and single-process clusters.
//!
//! A [`MemoryHub`] routes payloads between named endpoints over channels,
//! preserving the addressed-send/single-inbound-queue contract without any
//! sockets. Protocol tests drive a whole fake cluster through one hub.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::{AddressBook, Transport};
use crate::error::{AgentError, Result};

/// Routing fabric connecting [`MemoryTransport`] endpoints by address.
#[derive(Default)]
pub struct MemoryHub {
    endpoints: std::sync::Mutex<HashMap<String, mpsc::Sender<Vec<u8>>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open an endpoint reachable at `addr` with a bounded inbound queue.
    pub fn open(self: &Arc<Self>, addr: &str, capacity: usize) -> Arc<MemoryTransport> {
        let (tx, rx) = mpsc::channel(capacity);
        self.endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(addr.to_string(), tx);
        Arc::new(MemoryTransport {
            hub: Arc::clone(self),
            local_addr: addr.to_string(),
            addrs: AddressBook::new(),
            inbound: Mutex::new(rx),
        })
    }

    fn route(&self, addr: &str) -> Option<mpsc::Sender<Vec<u8>>> {
        self.endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(addr)
            .cloned()
    }

    fn close(&self, addr: &str) {
        self.endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(addr);
    }
}

/// One endpoint on a [`MemoryHub`].
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    local_addr: String,
    addrs: AddressBook,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl MemoryTransport {
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn register_address(&self, id: i32, addr: &str) {
        self.addrs.register(id, addr);
    }

    fn has_address(&self, id: i32, addr: &str) -> bool {
        self.addrs.check(id, addr)
    }

    fn remove_address(&self, id: i32) {
        self.addrs.remove(id);
    }

    async fn send(&self, id: i32, payload: Vec<u8>) -> Result<()> {
        let addr = self
            .addrs
            .lookup(id)
            .ok_or_else(|| AgentError::transport(format!("no address registered for node {id}")))?;
        let tx = self
            .hub
            .route(&addr)
            .ok_or_else(|| AgentError::transport(format!("no endpoint at {addr}")))?;
        tx.send(payload)
            .await
            .map_err(|_| AgentError::transport(format!("endpoint at {addr} is closed")))
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        let mut inbound = self.inbound.lock().await;
        inbound
            .recv()
            .await
            .ok_or_else(|| AgentError::transport("inbound queue closed"))
    }

    async fn shutdown(&self) {
        self.hub.close(&self.local_addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_routed_delivery() {
        let hub = MemoryHub::new();
        let a = hub.open("a:1", 8);
        let b = hub.open("b:1", 8);

        a.register_address(2, "b:1");
        a.send(2, b"ping".to_vec()).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), b"ping");

        b.register_address(1, "a:1");
        b.send(1, b"pong".to_vec()).await.unwrap();
        assert_eq!(a.recv().await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn test_unroutable_send_fails() {
        let hub = MemoryHub::new();
        let a = hub.open("a:1", 8);

        // Unregistered id
        assert!(a.send(9, vec![]).await.is_err());

        // Registered id pointing at a closed endpoint
        a.register_address(9, "gone:1");
        assert!(a.send(9, vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_address_replacement_redirects() {
        let hub = MemoryHub::new();
        let a = hub.open("a:1", 8);
        let old = hub.open("old:1", 8);
        let new = hub.open("new:1", 8);

        a.register_address(5, "old:1");
        a.send(5, b"one".to_vec()).await.unwrap();
        assert_eq!(old.recv().await.unwrap(), b"one");

        a.remove_address(5);
        a.register_address(5, "new:1");
        a.send(5, b"two".to_vec()).await.unwrap();
        assert_eq!(new.recv().await.unwrap(), b"two");
    }
}
