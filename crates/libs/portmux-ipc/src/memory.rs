//! In-process channels backed by bounded `tokio::sync::mpsc` queues.
//!
//! A [`MemoryTransport`] plays both sides: the server end accepts connections
//! and offers secondary channels through the [`Transport`] trait, while tests
//! (or an in-process client) dial in with [`MemoryTransport::connect`] and pick
//! up offered channels with [`MemoryTransport::claim`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ChannelError;
use crate::traits::{DuplexChannel, Transport};
use crate::types::{ConnectionMetadata, Payload, PeerIdentity};

pub const DEFAULT_CAPACITY: usize = 16;

/// One end of an in-memory duplex channel.
pub struct MemoryChannel {
    name: String,
    metadata: ConnectionMetadata,
    tx: mpsc::Sender<Payload>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Payload>>,
    closed: CancellationToken,
}

impl MemoryChannel {
    /// Build a connected pair. `a` sees `b_meta` as its remote and vice versa.
    pub fn pair(
        name: impl Into<String>,
        capacity: usize,
        a_meta: ConnectionMetadata,
        b_meta: ConnectionMetadata,
    ) -> (Self, Self) {
        let name = name.into();
        let capacity = capacity.max(1);
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        let closed = CancellationToken::new();

        let a = Self {
            name: name.clone(),
            metadata: b_meta,
            tx: a_tx,
            rx: tokio::sync::Mutex::new(a_rx),
            closed: closed.clone(),
        };
        let b = Self {
            name,
            metadata: a_meta,
            tx: b_tx,
            rx: tokio::sync::Mutex::new(b_rx),
            closed,
        };
        (a, b)
    }
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("name", &self.name)
            .field("peer", &self.metadata.peer)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

#[async_trait]
impl DuplexChannel for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn metadata(&self) -> &ConnectionMetadata {
        &self.metadata
    }

    async fn send(&self, message: Payload) -> Result<(), ChannelError> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed {
                name: self.name.clone(),
            });
        }
        tokio::select! {
            _ = self.closed.cancelled() => Err(ChannelError::Closed { name: self.name.clone() }),
            sent = self.tx.send(message) => {
                sent.map_err(|_| ChannelError::Closed { name: self.name.clone() })
            }
        }
    }

    async fn recv(&self) -> Option<Payload> {
        let mut rx = self.rx.lock().await;
        // Messages queued before a close are still delivered.
        if let Ok(message) = rx.try_recv() {
            return Some(message);
        }
        tokio::select! {
            biased;
            message = rx.recv() => message,
            _ = self.closed.cancelled() => rx.try_recv().ok(),
        }
    }

    fn close(&self) {
        if !self.closed.is_cancelled() {
            log::debug!("memory: close channel={}", self.name);
            self.closed.cancel();
        }
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        // A dropped end is a disconnect, like a dropped socket.
        self.closed.cancel();
    }
}

/// Loopback transport for tests and same-process clients.
pub struct MemoryTransport {
    local_origin: String,
    capacity: usize,
    incoming_tx: mpsc::UnboundedSender<Arc<dyn DuplexChannel>>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<dyn DuplexChannel>>>,
    offered: Mutex<HashMap<String, MemoryChannel>>,
    shutdown: CancellationToken,
}

impl MemoryTransport {
    pub fn new(local_origin: impl Into<String>) -> Self {
        Self::with_capacity(local_origin, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(local_origin: impl Into<String>, capacity: usize) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            local_origin: local_origin.into(),
            capacity,
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
            offered: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn local_origin(&self) -> &str {
        &self.local_origin
    }

    /// Dial the server from `peer`, as a top-level document.
    pub fn connect(&self, name: impl Into<String>, peer: PeerIdentity) -> MemoryChannel {
        let metadata = ConnectionMetadata::new(peer, self.local_origin.clone());
        self.connect_with(name, metadata)
    }

    /// Dial the server with explicit connection metadata.
    pub fn connect_with(
        &self,
        name: impl Into<String>,
        metadata: ConnectionMetadata,
    ) -> MemoryChannel {
        let server_meta = ConnectionMetadata::new(
            PeerIdentity::new(self.local_origin.clone()),
            metadata.peer.origin.clone(),
        );
        let (client, server) = MemoryChannel::pair(name, self.capacity, metadata, server_meta);
        if self.incoming_tx.send(Arc::new(server)).is_err() {
            log::warn!("memory: transport shut down, connection dropped channel={}", client.name);
        }
        client
    }

    /// Take the client end of a channel the server offered under `name`.
    pub fn claim(&self, name: &str) -> Option<MemoryChannel> {
        self.offered.lock().ok()?.remove(name)
    }

    /// Names offered by the server and not yet claimed.
    pub fn offered_names(&self) -> Vec<String> {
        self.offered.lock().map(|offered| offered.keys().cloned().collect()).unwrap_or_default()
    }

    /// Stop accepting; pending `accept` calls return `None`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn accept(&self) -> Option<Arc<dyn DuplexChannel>> {
        let mut incoming = self.incoming_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            channel = incoming.recv() => channel,
        }
    }

    async fn open(
        &self,
        name: &str,
        peer: &PeerIdentity,
    ) -> Result<Arc<dyn DuplexChannel>, ChannelError> {
        if self.shutdown.is_cancelled() {
            return Err(ChannelError::Refused {
                name: name.to_string(),
                reason: "transport shut down".into(),
            });
        }
        let mut offered = self.offered.lock().map_err(|_| ChannelError::Refused {
            name: name.to_string(),
            reason: "offer table poisoned".into(),
        })?;
        if offered.contains_key(name) {
            return Err(ChannelError::Refused {
                name: name.to_string(),
                reason: "name already offered".into(),
            });
        }

        let client_meta = ConnectionMetadata::new(peer.clone(), self.local_origin.clone());
        let server_meta = ConnectionMetadata::new(
            PeerIdentity::new(self.local_origin.clone()),
            peer.origin.clone(),
        );
        let (server, client) = MemoryChannel::pair(name, self.capacity, server_meta, client_meta);
        offered.insert(name.to_string(), client);
        Ok(Arc::new(server))
    }
}
