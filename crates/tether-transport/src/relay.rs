//! Relay transport: the always-available backend.
//!
//! Wraps an external relay-protocol client and turns its persistent logical
//! link into point-to-point connections. The link lifecycle is driven by a
//! supervisor task independent of any caller's pending connect; a connect
//! issued while the link is not up fails fast instead of queueing.

use crate::config::RelayConfig;
use crate::errors::TransportError;
use crate::traits::{RelayClient, Transport, TransportEvent};
use crate::types::{Connection, ConnectionId, ConnectionInfo, ConnectionTarget, TransportType};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Relay link state, independent of any individual peer connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    /// Initial state; also reached after shutdown.
    Disconnected,
    /// Handshake in flight.
    Connecting,
    /// Link up; per-peer connects are possible.
    Connected,
    /// Waiting out a backoff interval before retrying the handshake.
    Reconnecting,
    /// Attempt budget exhausted. Sticky until an explicit restart.
    Failed,
}

/// Link state plus transition bookkeeping, shared between the supervisor task
/// and callers.
pub struct LinkMonitor {
    state: Mutex<LinkState>,
    connected_at: Mutex<Option<Instant>>,
    connects: AtomicU32,
    reconnect_attempts: AtomicU32,
}

impl LinkMonitor {
    fn new() -> Self {
        Self {
            state: Mutex::new(LinkState::Disconnected),
            connected_at: Mutex::new(None),
            connects: AtomicU32::new(0),
            reconnect_attempts: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    fn transition(&self, new_state: LinkState) -> LinkState {
        let mut state = self.state.lock();
        let old_state = *state;

        match new_state {
            LinkState::Connected => {
                *self.connected_at.lock() = Some(Instant::now());
                self.connects.fetch_add(1, Ordering::Relaxed);
            }
            LinkState::Disconnected | LinkState::Failed => {
                *self.connected_at.lock() = None;
            }
            LinkState::Reconnecting => {
                self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
            }
            LinkState::Connecting => {}
        }

        *state = new_state;
        old_state
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats {
            state: self.state(),
            uptime: self.connected_at.lock().map(|at| at.elapsed()),
            connects: self.connects.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of the relay link's lifetime counters.
#[derive(Clone, Debug)]
pub struct LinkStats {
    pub state: LinkState,
    pub uptime: Option<Duration>,
    pub connects: u32,
    pub reconnect_attempts: u32,
}

/// The relay-backed [`Transport`]. Cheap to clone; clones share the link.
///
/// `start` spawns a supervisor that drives the handshake/reconnect loop:
/// Disconnected -> Connecting -> Connected, with Reconnecting between failed
/// attempts (exponential backoff) and Failed once the per-outage attempt
/// budget runs out. Failed is sticky; call `start` again to recover.
#[derive(Clone)]
pub struct RelayTransport {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    config: RelayConfig,
    client: Arc<dyn RelayClient>,
    link: LinkMonitor,
    connections: DashMap<ConnectionId, ConnectionInfo>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl RelayTransport {
    pub fn new(config: RelayConfig, client: Arc<dyn RelayClient>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(RelayInner {
                config,
                client,
                link: LinkMonitor::new(),
                connections: DashMap::new(),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                shutdown_tx,
                supervisor: Mutex::new(None),
                forwarder: Mutex::new(None),
            }),
        }
    }

    pub fn link_state(&self) -> LinkState {
        self.inner.link.state()
    }

    pub fn link_stats(&self) -> LinkStats {
        self.inner.link.stats()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    /// Start (or restart after Failed/shutdown) the relay link supervisor.
    /// A no-op while a supervisor is already running.
    pub fn start(&self) {
        {
            let mut forwarder = self.inner.forwarder.lock();
            if forwarder.is_none() {
                if let Some(mut client_events) = self.inner.client.take_events() {
                    let inner = Arc::clone(&self.inner);
                    *forwarder = Some(tokio::spawn(async move {
                        while let Some(event) = client_events.recv().await {
                            match &event {
                                TransportEvent::ConnectionEstablished(connection) => {
                                    inner.connections.insert(
                                        connection.id().clone(),
                                        ConnectionInfo::for_connection(connection),
                                    );
                                }
                                TransportEvent::ConnectionClosed { connection_id, .. } => {
                                    inner.connections.remove(connection_id);
                                }
                            }
                            let _ = inner.events_tx.send(event);
                        }
                    }));
                }
            }
        }

        let mut supervisor = self.inner.supervisor.lock();
        if let Some(handle) = supervisor.as_ref() {
            if !handle.is_finished() {
                debug!("relay supervisor already running");
                return;
            }
        }
        self.inner.shutdown_tx.send_replace(false);
        let inner = Arc::clone(&self.inner);
        *supervisor = Some(tokio::spawn(async move { inner.run_link().await }));
    }
}

impl RelayInner {
    async fn run_link(&self) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut remaining_attempts = self.config.max_reconnect_attempts;
        let mut backoff_step: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.link.transition(LinkState::Connecting);
            debug!(url = %self.config.relay_url, "connecting relay link");

            let outcome =
                tokio::time::timeout(self.config.connect_timeout, self.client.connect()).await;
            let error = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(error)) => Some(error),
                Err(_) => Some(TransportError::Timeout),
            };

            match error {
                None => {
                    self.link.transition(LinkState::Connected);
                    info!(url = %self.config.relay_url, "relay link established");
                    remaining_attempts = self.config.max_reconnect_attempts;
                    backoff_step = 0;

                    if self.watch_link(&mut shutdown).await {
                        // Shutdown requested while the link was up.
                        break;
                    }
                    warn!("relay link lost, scheduling reconnect");
                    self.link.transition(LinkState::Reconnecting);
                    if !self.wait_backoff(&mut shutdown, backoff_step).await {
                        break;
                    }
                    backoff_step += 1;
                }
                Some(error) => {
                    if remaining_attempts == 0 {
                        warn!(error = %error, "relay link failed, attempt budget exhausted");
                        self.link.transition(LinkState::Failed);
                        return;
                    }
                    remaining_attempts -= 1;
                    debug!(
                        error = %error,
                        remaining_attempts,
                        "relay handshake failed, scheduling retry"
                    );
                    self.link.transition(LinkState::Reconnecting);
                    if !self.wait_backoff(&mut shutdown, backoff_step).await {
                        break;
                    }
                    backoff_step += 1;
                }
            }
        }
        self.link.transition(LinkState::Disconnected);
    }

    /// Block until the link drops or shutdown is requested. Returns `true`
    /// on shutdown, `false` on link loss.
    async fn watch_link(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut status = self.client.link_status();
        if !*status.borrow() {
            return false;
        }
        loop {
            tokio::select! {
                changed = status.changed() => {
                    match changed {
                        Ok(()) => {
                            if !*status.borrow() {
                                return false;
                            }
                        }
                        // Client gone entirely; treat as link loss.
                        Err(_) => return false,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return true;
                    }
                }
            }
        }
    }

    /// Wait out one backoff interval. Returns `false` if shutdown was
    /// requested during the wait.
    async fn wait_backoff(&self, shutdown: &mut watch::Receiver<bool>, step: u32) -> bool {
        let delay = self.config.backoff_delay(step);
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown.changed() => !*shutdown.borrow(),
        }
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Relay
    }

    fn is_available(&self) -> bool {
        self.inner.link.state() == LinkState::Connected
    }

    async fn connect(&self, target: &ConnectionTarget) -> Result<Connection, TransportError> {
        let state = self.inner.link.state();
        if state != LinkState::Connected {
            return Err(TransportError::RelayUnavailable { state });
        }
        let connection = self.inner.client.open_tunnel(target).await?;
        self.inner.connections.insert(
            connection.id().clone(),
            ConnectionInfo::for_connection(&connection),
        );
        debug!(connection = %connection.id(), "relay tunnel opened");
        Ok(connection)
    }

    async fn disconnect(&self, connection_id: &ConnectionId) -> Result<(), TransportError> {
        self.inner.client.close_tunnel(connection_id).await?;
        self.inner.connections.remove(connection_id);
        debug!(connection = %connection_id, "relay tunnel closed");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        self.inner.shutdown_tx.send_replace(true);
        let supervisor = self.inner.supervisor.lock().take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }
        // The client's event stream can only be taken once, so the forwarder
        // is kept running across restarts. It ends when the client drops its
        // sender.
        let result = self.inner.client.close().await;
        self.inner.connections.clear();
        self.inner.link.transition(LinkState::Disconnected);
        result
    }

    fn connections_info(&self) -> Vec<ConnectionInfo> {
        self.inner
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.inner.events_rx.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockRelayClient;
    use crate::types::PersonId;

    fn fast_config() -> RelayConfig {
        RelayConfig::default()
            .with_connect_timeout(Duration::from_millis(200))
            .with_backoff(Duration::from_millis(10), Duration::from_millis(40))
    }

    async fn wait_for_state(relay: &RelayTransport, wanted: LinkState) {
        for _ in 0..200 {
            if relay.link_state() == wanted {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "link never reached {:?}, stuck at {:?}",
            wanted,
            relay.link_state()
        );
    }

    #[test]
    fn test_link_monitor_transitions() {
        let monitor = LinkMonitor::new();
        assert_eq!(monitor.state(), LinkState::Disconnected);

        monitor.transition(LinkState::Connecting);
        monitor.transition(LinkState::Connected);
        assert_eq!(monitor.state(), LinkState::Connected);
        assert!(monitor.stats().uptime.is_some());
        assert_eq!(monitor.stats().connects, 1);

        monitor.transition(LinkState::Reconnecting);
        assert_eq!(monitor.stats().reconnect_attempts, 1);

        monitor.transition(LinkState::Failed);
        assert!(monitor.stats().uptime.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_and_opens_tunnels() {
        let client = Arc::new(MockRelayClient::new());
        let relay = RelayTransport::new(fast_config(), client.clone());
        relay.start();
        wait_for_state(&relay, LinkState::Connected).await;
        assert!(relay.is_available());

        let target = ConnectionTarget::person(PersonId([1u8; 32]));
        let connection = relay.connect(&target).await.unwrap();
        assert_eq!(connection.transport_type(), TransportType::Relay);
        assert_eq!(relay.connections_info().len(), 1);

        relay.disconnect(connection.id()).await.unwrap();
        assert!(relay.connections_info().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_fails_fast_when_link_down() {
        let client = Arc::new(MockRelayClient::new());
        let relay = RelayTransport::new(fast_config(), client);

        // Never started: Disconnected.
        let target = ConnectionTarget::person(PersonId([1u8; 32]));
        let error = relay.connect(&target).await.unwrap_err();
        assert!(matches!(
            error,
            TransportError::RelayUnavailable {
                state: LinkState::Disconnected
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_fails_fast_during_backoff() {
        // Long backoff keeps the link in Reconnecting while we probe it.
        let config = RelayConfig::default()
            .with_connect_timeout(Duration::from_millis(200))
            .with_backoff(Duration::from_secs(600), Duration::from_secs(600));
        let client = Arc::new(MockRelayClient::new().with_handshake_failures(1));
        let relay = RelayTransport::new(config, client);
        relay.start();
        wait_for_state(&relay, LinkState::Reconnecting).await;

        let target = ConnectionTarget::person(PersonId([1u8; 32]));
        let error = relay.connect(&target).await.unwrap_err();
        assert!(matches!(
            error,
            TransportError::RelayUnavailable {
                state: LinkState::Reconnecting
            }
        ));
        relay.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_link_loss() {
        let client = Arc::new(MockRelayClient::new());
        let relay = RelayTransport::new(fast_config(), client.clone());
        relay.start();
        wait_for_state(&relay, LinkState::Connected).await;

        client.drop_link();
        wait_for_state(&relay, LinkState::Connected).await;
        assert!(relay.link_stats().connects >= 2);
        assert!(relay.link_stats().reconnect_attempts >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_goes_failed_and_sticks() {
        let config = fast_config().with_max_reconnect_attempts(2);
        let client = Arc::new(MockRelayClient::new().with_handshake_failures(u32::MAX));
        let relay = RelayTransport::new(config, client.clone());
        relay.start();
        wait_for_state(&relay, LinkState::Failed).await;

        // Initial attempt plus the two budgeted retries.
        assert_eq!(client.handshake_attempts(), 3);

        // Sticky: no further attempts as time passes.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(relay.link_state(), LinkState::Failed);
        assert_eq!(client.handshake_attempts(), 3);

        // Explicit restart recovers once the relay accepts handshakes again.
        client.set_handshake_failures(0);
        relay.start();
        wait_for_state(&relay, LinkState::Connected).await;
    }

    async fn next_transport_event(
        rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
    ) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event within deadline")
            .expect("stream open")
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_events_survive_restart() {
        let client = Arc::new(MockRelayClient::new());
        let relay = RelayTransport::new(fast_config(), client.clone());
        relay.start();
        wait_for_state(&relay, LinkState::Connected).await;
        let mut events = relay.take_events().expect("events stream");

        let target = ConnectionTarget::person(PersonId([1u8; 32]));
        let first = relay.connect(&target).await.unwrap();
        match next_transport_event(&mut events).await {
            TransportEvent::ConnectionEstablished(connection) => {
                assert_eq!(connection.id(), first.id());
            }
            other => panic!("unexpected event: {:?}", other),
        }

        relay.shutdown().await.unwrap();
        relay.start();
        wait_for_state(&relay, LinkState::Connected).await;

        // Tunnel events still reach the transport stream after a restart,
        // and bookkeeping follows them.
        let second = relay.connect(&target).await.unwrap();
        loop {
            match next_transport_event(&mut events).await {
                TransportEvent::ConnectionEstablished(connection)
                    if connection.id() == second.id() =>
                {
                    break;
                }
                // Close events from the shutdown may interleave.
                _ => continue,
            }
        }
        assert_eq!(relay.connections_info().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_idempotent() {
        let client = Arc::new(MockRelayClient::new());
        let relay = RelayTransport::new(fast_config(), client.clone());

        // Shutdown before ever starting is fine.
        relay.shutdown().await.unwrap();
        assert_eq!(relay.link_state(), LinkState::Disconnected);

        relay.start();
        wait_for_state(&relay, LinkState::Connected).await;
        relay.shutdown().await.unwrap();
        relay.shutdown().await.unwrap();
        assert_eq!(relay.link_state(), LinkState::Disconnected);
        assert!(!client.is_connected());
    }
}
