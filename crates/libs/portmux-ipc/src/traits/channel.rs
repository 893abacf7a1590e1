use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::types::{ConnectionMetadata, Payload, PeerIdentity};

/// A named, message-oriented duplex connection.
///
/// Implementations must allow `send` from several tasks at once. `recv`
/// returns `None` once the channel is closed from either side; `closed`
/// resolves at the same moment.
#[async_trait]
pub trait DuplexChannel: Send + Sync {
    /// The name the channel was opened under.
    fn name(&self) -> &str;

    /// Facts about the remote end, as reported by the transport.
    fn metadata(&self) -> &ConnectionMetadata;

    /// Post one message. Waits for the channel's own flow control.
    async fn send(&self, message: Payload) -> Result<(), ChannelError>;

    /// Next inbound message, or `None` after disconnect.
    async fn recv(&self) -> Option<Payload>;

    /// Close locally. The remote end observes a disconnect.
    fn close(&self);

    /// Resolves once the channel is closed by either end.
    async fn closed(&self);

    fn is_closed(&self) -> bool;
}

/// The signaling mechanism channels arrive through.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Wait for the next inbound connection. `None` once the transport shuts down.
    async fn accept(&self) -> Option<Arc<dyn DuplexChannel>>;

    /// Offer a secondary channel under `name` to `peer`.
    async fn open(
        &self,
        name: &str,
        peer: &PeerIdentity,
    ) -> Result<Arc<dyn DuplexChannel>, ChannelError>;
}
