//! Test doubles: scriptable transports and relay clients.
//!
//! Used by this crate's own tests and available to downstream crates that
//! need deterministic transports without any real medium.

use crate::errors::TransportError;
use crate::traits::{RelayClient, Transport, TransportEvent};
use crate::types::{Connection, ConnectionId, ConnectionInfo, ConnectionTarget, TransportType};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// In-memory [`Transport`] with scriptable availability, failures, and latency.
pub struct MockTransport {
    transport_type: TransportType,
    available: AtomicBool,
    connect_failures: AtomicU32,
    connect_delay: Mutex<Option<Duration>>,
    failing_shutdown: bool,
    shutdown_calls: AtomicU32,
    attempts: Mutex<Vec<ConnectionTarget>>,
    connections: Mutex<Vec<ConnectionInfo>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl MockTransport {
    pub fn new(transport_type: TransportType) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            transport_type,
            available: AtomicBool::new(true),
            connect_failures: AtomicU32::new(0),
            connect_delay: Mutex::new(None),
            failing_shutdown: false,
            shutdown_calls: AtomicU32::new(0),
            attempts: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Set the initial availability report.
    pub fn with_availability(self, available: bool) -> Self {
        self.available.store(available, Ordering::SeqCst);
        self
    }

    /// Fail the next `count` connect calls, then succeed.
    pub fn with_connect_failures(self, count: u32) -> Self {
        self.connect_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Fail every connect call.
    pub fn always_failing(self) -> Self {
        self.connect_failures.store(u32::MAX, Ordering::SeqCst);
        self
    }

    /// Delay every connect call before it resolves.
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        *self.connect_delay.lock() = Some(delay);
        self
    }

    /// Make shutdown return an error (still counted).
    pub fn with_failing_shutdown(mut self) -> Self {
        self.failing_shutdown = true;
        self
    }

    /// Flip availability at runtime.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn shutdown_calls(&self) -> u32 {
        self.shutdown_calls.load(Ordering::SeqCst)
    }

    /// Every target passed to connect, in call order.
    pub fn connect_attempts(&self) -> Vec<ConnectionTarget> {
        self.attempts.lock().clone()
    }

    /// Push a connection-established event, as if a peer dialed in.
    pub fn emit_established(&self, connection: Connection) {
        let _ = self
            .events_tx
            .send(TransportEvent::ConnectionEstablished(connection));
    }

    /// Push a connection-closed event.
    pub fn emit_closed(&self, connection_id: ConnectionId, reason: Option<String>) {
        let _ = self.events_tx.send(TransportEvent::ConnectionClosed {
            connection_id,
            reason,
        });
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn transport_type(&self) -> TransportType {
        self.transport_type
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn connect(&self, target: &ConnectionTarget) -> Result<Connection, TransportError> {
        self.attempts.lock().push(target.clone());

        let delay = *self.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                match remaining {
                    0 => None,
                    u32::MAX => Some(u32::MAX),
                    n => Some(n - 1),
                }
            })
            .is_ok();
        if failing {
            return Err(TransportError::HandshakeFailed(
                "mock transport refused connect".into(),
            ));
        }

        let connection = Connection::new(
            ConnectionId::random(),
            self.transport_type,
            target.clone(),
        );
        self.connections
            .lock()
            .push(ConnectionInfo::for_connection(&connection));
        self.emit_established(connection.clone());
        Ok(connection)
    }

    async fn disconnect(&self, connection_id: &ConnectionId) -> Result<(), TransportError> {
        self.connections.lock().retain(|info| &info.id != connection_id);
        self.emit_closed(connection_id.clone(), None);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        self.connections.lock().clear();
        if self.failing_shutdown {
            return Err(TransportError::Other("mock shutdown failure".into()));
        }
        Ok(())
    }

    fn connections_info(&self) -> Vec<ConnectionInfo> {
        self.connections.lock().clone()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().take()
    }
}

/// In-memory [`RelayClient`] with a scriptable handshake and droppable link.
pub struct MockRelayClient {
    handshake_failures: AtomicU32,
    handshake_attempts: AtomicU32,
    link_tx: watch::Sender<bool>,
    tunnels: Mutex<Vec<ConnectionId>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl MockRelayClient {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (link_tx, _) = watch::channel(false);
        Self {
            handshake_failures: AtomicU32::new(0),
            handshake_attempts: AtomicU32::new(0),
            link_tx,
            tunnels: Mutex::new(Vec::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Fail the next `count` handshakes; `u32::MAX` fails forever.
    pub fn with_handshake_failures(self, count: u32) -> Self {
        self.handshake_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Reschedule handshake failures at runtime.
    pub fn set_handshake_failures(&self, count: u32) {
        self.handshake_failures.store(count, Ordering::SeqCst);
    }

    /// Total handshake attempts observed so far.
    pub fn handshake_attempts(&self) -> u32 {
        self.handshake_attempts.load(Ordering::SeqCst)
    }

    /// Kill the logical link, as if the relay server went away.
    pub fn drop_link(&self) {
        self.link_tx.send_replace(false);
    }
}

impl Default for MockRelayClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayClient for MockRelayClient {
    async fn connect(&self) -> Result<(), TransportError> {
        self.handshake_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .handshake_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                match remaining {
                    0 => None,
                    u32::MAX => Some(u32::MAX),
                    n => Some(n - 1),
                }
            })
            .is_ok();
        if failing {
            return Err(TransportError::HandshakeFailed(
                "relay handshake refused".into(),
            ));
        }
        self.link_tx.send_replace(true);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *self.link_tx.borrow()
    }

    fn link_status(&self) -> watch::Receiver<bool> {
        self.link_tx.subscribe()
    }

    async fn open_tunnel(&self, target: &ConnectionTarget) -> Result<Connection, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Other("relay link is down".into()));
        }
        let connection = Connection::new(
            ConnectionId::random(),
            TransportType::Relay,
            target.clone(),
        );
        self.tunnels.lock().push(connection.id().clone());
        let _ = self
            .events_tx
            .send(TransportEvent::ConnectionEstablished(connection.clone()));
        Ok(connection)
    }

    async fn close_tunnel(&self, connection_id: &ConnectionId) -> Result<(), TransportError> {
        self.tunnels.lock().retain(|id| id != connection_id);
        let _ = self.events_tx.send(TransportEvent::ConnectionClosed {
            connection_id: connection_id.clone(),
            reason: None,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let closed: Vec<ConnectionId> = self.tunnels.lock().drain(..).collect();
        for connection_id in closed {
            let _ = self.events_tx.send(TransportEvent::ConnectionClosed {
                connection_id,
                reason: Some("relay link closed".into()),
            });
        }
        self.link_tx.send_replace(false);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().take()
    }
}
