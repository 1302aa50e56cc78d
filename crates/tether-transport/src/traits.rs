//! Capability traits: pluggable transports and the wrapped relay client.

use crate::errors::TransportError;
use crate::types::{Connection, ConnectionId, ConnectionInfo, ConnectionTarget, TransportType};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

/// Lifecycle event emitted by a single transport, before the registry tags it
/// with the transport type.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// A peer connection was established (locally or remotely initiated).
    ConnectionEstablished(Connection),
    /// A peer connection went away.
    ConnectionClosed {
        connection_id: ConnectionId,
        reason: Option<String>,
    },
}

/// One pluggable backend implementing a physical or logical medium for
/// establishing peer connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Medium identifier, also the registry key.
    fn transport_type(&self) -> TransportType;

    /// Whether the medium is currently usable. The router skips transports
    /// reporting `false` without counting an attempt.
    fn is_available(&self) -> bool;

    /// Establish a connection to the target. The target has already been
    /// validated by the router.
    async fn connect(&self, target: &ConnectionTarget) -> Result<Connection, TransportError>;

    /// Tear down one peer connection.
    async fn disconnect(&self, connection_id: &ConnectionId) -> Result<(), TransportError>;

    /// Tear down every connection and release the medium. Must be idempotent;
    /// the registry swallows and logs failures.
    async fn shutdown(&self) -> Result<(), TransportError>;

    /// Summaries of the live connections this transport owns.
    fn connections_info(&self) -> Vec<ConnectionInfo> {
        Vec::new()
    }

    /// Take the transport's lifecycle event stream, if it emits one. Yields
    /// the receiver at most once; later calls return `None`.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        None
    }
}

/// Contract of the external relay-protocol client wrapped by
/// [`RelayTransport`](crate::relay::RelayTransport).
///
/// The client owns the wire protocol, authentication, and encryption; this
/// layer only drives its link lifecycle and tunnels.
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// One handshake attempt against the relay server. Retry policy lives in
    /// the transport, not here.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Whether the logical link is currently up.
    fn is_connected(&self) -> bool;

    /// Watch the link status; `true` while the logical link is up.
    fn link_status(&self) -> watch::Receiver<bool>;

    /// Open a point-to-point tunnel to the target over the established link.
    async fn open_tunnel(&self, target: &ConnectionTarget) -> Result<Connection, TransportError>;

    /// Close one tunnel without touching the link.
    async fn close_tunnel(&self, connection_id: &ConnectionId) -> Result<(), TransportError>;

    /// Tear down the link and every tunnel riding on it. Must be idempotent.
    async fn close(&self) -> Result<(), TransportError>;

    /// Take the client's lifecycle event stream (tunnel established/closed),
    /// if it emits one. Yields the receiver at most once.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        None
    }
}
