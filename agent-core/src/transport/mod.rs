//! Reliable addressed message transport.
//!
//! A [`Transport`] pairs an id-to-address registry with point-to-point byte
//! delivery and a single inbound queue. The agent uses three instances: a
//! connect-only sender shared by both loops, the main loop's receiver, and
//! the heartbeat loop's receiver. Awaiting [`Transport::recv`] is the sole
//! suspension point of each loop.

mod memory;
mod tcp;

pub use memory::{MemoryHub, MemoryTransport};
pub use tcp::TcpTransport;

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::Result;

/// Addressed send/receive over some medium.
///
/// Implementations are internally synchronized; both the main loop and the
/// heartbeat loop may call into one instance without external locking.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Record `id`'s network address for future sends.
    fn register_address(&self, id: i32, addr: &str);

    /// Whether `id` is currently registered with exactly `addr`.
    fn has_address(&self, id: i32, addr: &str) -> bool;

    /// Drop `id`'s registration.
    fn remove_address(&self, id: i32);

    /// Deliver `payload` to the node registered as `id`.
    async fn send(&self, id: i32, payload: Vec<u8>) -> Result<()>;

    /// Wait for the next inbound payload.
    async fn recv(&self) -> Result<Vec<u8>>;

    /// Stop accepting inbound traffic and release resources.
    async fn shutdown(&self);
}

/// Shared id-to-address registry used by every transport implementation.
#[derive(Debug, Default)]
pub(crate) struct AddressBook {
    entries: RwLock<HashMap<i32, String>>,
}

impl AddressBook {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, id: i32, addr: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(id, addr.to_string());
    }

    pub(crate) fn check(&self, id: i32, addr: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(&id).is_some_and(|a| a.as_str() == addr)
    }

    pub(crate) fn remove(&self, id: i32) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(&id);
    }

    pub(crate) fn lookup(&self, id: i32) -> Option<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_book_registry_semantics() {
        let book = AddressBook::new();
        assert!(book.lookup(5).is_none());

        book.register(5, "10.0.0.2:17777");
        assert!(book.check(5, "10.0.0.2:17777"));
        assert!(!book.check(5, "10.0.0.3:17777"));
        assert_eq!(book.lookup(5).as_deref(), Some("10.0.0.2:17777"));

        // Re-registration replaces
        book.register(5, "10.0.0.3:17777");
        assert!(book.check(5, "10.0.0.3:17777"));

        book.remove(5);
        assert!(book.lookup(5).is_none());
        assert!(!book.check(5, "10.0.0.3:17777"));
    }
}
