//! Framed-TCP transport.
//!
//! Wire format: each message is a big-endian `u32` length prefix followed
//! by that many payload bytes. A listener task accepts connections and
//! spawns one reader task per peer; all readers feed the instance's single
//! bounded inbound queue. Outbound connections are cached per node id and
//! re-established once on a send failure.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{AddressBook, Transport};
use crate::error::{AgentError, Result};

/// Largest frame a peer may send, a guard against corrupt length prefixes.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

pub struct TcpTransport {
    addrs: AddressBook,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    // Streams are checked out for the duration of a write; the map lock
    // itself is never held across connect or I/O.
    conns: std::sync::Mutex<HashMap<i32, TcpStream>>,
    listener_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    local_port: u16,
}

impl TcpTransport {
    /// Connect-only instance for outbound traffic.
    pub fn sender() -> Arc<Self> {
        let (_tx, rx) = mpsc::channel(1);
        Arc::new(Self {
            addrs: AddressBook::new(),
            inbound: Mutex::new(rx),
            conns: std::sync::Mutex::new(HashMap::new()),
            listener_task: std::sync::Mutex::new(None),
            local_port: 0,
        })
    }

    /// Listening instance bound to `port` on all interfaces, with a bounded
    /// inbound queue of `capacity` frames.
    pub async fn bind(port: u16, capacity: usize) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await.map_err(|e| {
            AgentError::transport_with_source(format!("cannot listen on port {port}"), e)
        })?;
        let local_port = listener
            .local_addr()
            .map_err(|e| AgentError::transport_with_source("cannot read bound address", e))?
            .port();
        let (tx, rx) = mpsc::channel(capacity);

        let transport = Arc::new(Self {
            addrs: AddressBook::new(),
            inbound: Mutex::new(rx),
            conns: std::sync::Mutex::new(HashMap::new()),
            listener_task: std::sync::Mutex::new(None),
            local_port,
        });

        let task = tokio::spawn(accept_loop(listener, tx));
        *transport
            .listener_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(task);
        Ok(transport)
    }

    /// Port the listener is bound to; 0 for connect-only instances.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> std::io::Result<()> {
        stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
        stream.write_all(payload).await?;
        stream.flush().await
    }

    async fn send_via_cached(&self, id: i32, addr: &str, payload: &[u8]) -> std::io::Result<()> {
        if let Some(mut stream) = self.checkout_conn(id) {
            match Self::write_frame(&mut stream, payload).await {
                Ok(()) => {
                    self.cache_conn(id, addr, stream);
                    return Ok(());
                }
                Err(e) => {
                    // Stale connection; reconnect once below
                    debug!(id, error = %e, "cached connection failed, reconnecting");
                }
            }
        }

        let mut stream = TcpStream::connect(addr).await?;
        Self::write_frame(&mut stream, payload).await?;
        self.cache_conn(id, addr, stream);
        Ok(())
    }

    fn checkout_conn(&self, id: i32) -> Option<TcpStream> {
        self.conns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
    }

    fn cache_conn(&self, id: i32, addr: &str, stream: TcpStream) {
        // A concurrent re-registration must not get its eviction undone by
        // a write that was already in flight against the old address
        if self.addrs.check(id, addr) {
            self.conns
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(id, stream);
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn register_address(&self, id: i32, addr: &str) {
        self.addrs.register(id, addr);
    }

    fn has_address(&self, id: i32, addr: &str) -> bool {
        self.addrs.check(id, addr)
    }

    fn remove_address(&self, id: i32) {
        self.addrs.remove(id);
        self.conns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    async fn send(&self, id: i32, payload: Vec<u8>) -> Result<()> {
        let addr = self
            .addrs
            .lookup(id)
            .ok_or_else(|| AgentError::transport(format!("no address registered for node {id}")))?;
        self.send_via_cached(id, &addr, &payload)
            .await
            .map_err(|e| {
                AgentError::transport_with_source(format!("send to node {id} ({addr}) failed"), e)
            })
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        let mut inbound = self.inbound.lock().await;
        inbound
            .recv()
            .await
            .ok_or_else(|| AgentError::transport("inbound queue closed"))
    }

    async fn shutdown(&self) {
        let task = self
            .listener_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
        self.conns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

async fn accept_loop(listener: TcpListener, tx: mpsc::Sender<Vec<u8>>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted connection");
                tokio::spawn(read_frames(stream, tx.clone()));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
            }
        }
    }
}

async fn read_frames(mut stream: TcpStream, tx: mpsc::Sender<Vec<u8>>) {
    loop {
        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).await.is_err() {
            // Peer closed
            return;
        }
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_LEN {
            warn!(len, "oversized frame, dropping connection");
            return;
        }
        let mut payload = vec![0u8; len as usize];
        if let Err(e) = stream.read_exact(&mut payload).await {
            warn!(error = %e, "truncated frame");
            return;
        }
        if tx.send(payload).await.is_err() {
            // Receiver side shut down
            return;
        }
    }
}
