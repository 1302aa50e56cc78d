//! Transport registry: the single source of truth for which transports exist,
//! and the fan-in point for their lifecycle events.

use crate::events::{RegistryEvent, EVENT_CHANNEL_CAPACITY};
use crate::traits::{Transport, TransportEvent};
use crate::types::TransportType;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Owns the set of active transports keyed by type and re-emits each
/// transport's lifecycle events on one aggregated broadcast stream.
///
/// Invariant: a type is present in the map iff its transport has been
/// registered and not yet unregistered or globally shut down. Full shutdown
/// is terminal for this instance.
pub struct TransportRegistry {
    transports: Mutex<HashMap<TransportType, Arc<dyn Transport>>>,
    forwarders: Mutex<HashMap<TransportType, JoinHandle<()>>>,
    events: broadcast::Sender<RegistryEvent>,
    shut_down: AtomicBool,
}

impl TransportRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            transports: Mutex::new(HashMap::new()),
            forwarders: Mutex::new(HashMap::new()),
            events,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Subscribe to the aggregated event stream. Events published before the
    /// subscription are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: RegistryEvent) {
        // Fire-and-forget: an Err only means no subscriber is listening.
        let _ = self.events.send(event);
    }

    /// Register a transport under its type. A duplicate type replaces the
    /// existing entry (recoverable, logged at warn) and reroutes event
    /// forwarding to the new instance.
    ///
    /// Event streams are one-shot: forwarding only starts if `take_events`
    /// yields a receiver here. A transport whose stream was already consumed
    /// registers fine but forwards nothing (logged at debug).
    pub fn register(&self, transport: Arc<dyn Transport>) {
        let transport_type = transport.transport_type();
        let replaced = {
            // The flag is checked under the map lock so a racing shutdown
            // cannot interleave between the check and the insert.
            let mut transports = self.transports.lock();
            if self.shut_down.load(Ordering::SeqCst) {
                warn!(
                    transport = %transport_type,
                    "registry already shut down, ignoring registration"
                );
                return;
            }
            transports.insert(transport_type, transport.clone())
        };
        if replaced.is_some() {
            warn!(transport = %transport_type, "replacing existing transport registration");
        }
        if let Some(old) = self.forwarders.lock().remove(&transport_type) {
            old.abort();
        }

        if let Some(mut events) = transport.take_events() {
            let sink = self.events.clone();
            let forwarder = tokio::spawn(async move {
                // One task per source keeps per-source delivery order.
                while let Some(event) = events.recv().await {
                    let tagged = match event {
                        TransportEvent::ConnectionEstablished(connection) => {
                            RegistryEvent::ConnectionEstablished {
                                connection,
                                transport: transport_type,
                            }
                        }
                        TransportEvent::ConnectionClosed {
                            connection_id,
                            reason,
                        } => RegistryEvent::ConnectionClosed {
                            connection_id,
                            transport: transport_type,
                            reason,
                        },
                    };
                    let _ = sink.send(tagged);
                }
            });
            let mut forwarders = self.forwarders.lock();
            if self.shut_down.load(Ordering::SeqCst) {
                // Shut down while the forwarder was being spawned; no task
                // may outlive shutdown_all.
                forwarder.abort();
            } else {
                forwarders.insert(transport_type, forwarder);
            }
        } else {
            debug!(
                transport = %transport_type,
                "transport exposes no event stream, nothing to forward"
            );
        }

        self.publish(RegistryEvent::TransportRegistered {
            transport: transport_type,
        });
        debug!(transport = %transport_type, "transport registered");
    }

    /// Remove a transport. Unregistering an absent type is a no-op and emits
    /// no event.
    pub fn unregister(&self, transport_type: TransportType) {
        if self.transports.lock().remove(&transport_type).is_none() {
            debug!(transport = %transport_type, "unregister for absent transport, ignoring");
            return;
        }
        if let Some(forwarder) = self.forwarders.lock().remove(&transport_type) {
            forwarder.abort();
        }
        self.publish(RegistryEvent::TransportUnregistered {
            transport: transport_type,
        });
        debug!(transport = %transport_type, "transport unregistered");
    }

    pub fn get(&self, transport_type: TransportType) -> Option<Arc<dyn Transport>> {
        self.transports.lock().get(&transport_type).cloned()
    }

    /// Point-in-time snapshot of the registered transports.
    pub fn list(&self) -> Vec<Arc<dyn Transport>> {
        self.transports.lock().values().cloned().collect()
    }

    /// Shut down every registered transport, best-effort and total: each
    /// transport gets a shutdown attempt even if earlier ones failed, and the
    /// map is cleared unconditionally afterwards. Terminal for this instance.
    pub async fn shutdown_all(&self) {
        let snapshot: Vec<(TransportType, Arc<dyn Transport>)> = {
            // Stored under the map lock; register serializes against it.
            let transports = self.transports.lock();
            self.shut_down.store(true, Ordering::SeqCst);
            transports
                .iter()
                .map(|(ty, transport)| (*ty, transport.clone()))
                .collect()
        };

        for (transport_type, transport) in snapshot {
            if let Err(error) = transport.shutdown().await {
                warn!(
                    transport = %transport_type,
                    error = %error,
                    "transport shutdown failed, continuing"
                );
            }
        }

        for (_, forwarder) in self.forwarders.lock().drain() {
            forwarder.abort();
        }
        self.transports.lock().clear();
        debug!("transport registry shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use crate::types::{Connection, ConnectionId, ConnectionTarget, PersonId};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_event(rx: &mut broadcast::Receiver<RegistryEvent>) -> RegistryEvent {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event within deadline")
            .expect("stream open")
    }

    #[tokio::test]
    async fn test_duplicate_registration_replaces() {
        let registry = TransportRegistry::new();
        let first = Arc::new(MockTransport::new(TransportType::Relay).with_availability(false));
        let second = Arc::new(MockTransport::new(TransportType::Relay));

        registry.register(first.clone());
        registry.register(second.clone());

        // The newest registration won: the stored instance is the available one.
        let stored = registry.get(TransportType::Relay).expect("registered");
        assert!(stored.is_available());
        assert_eq!(registry.list().len(), 1);
    }

    #[tokio::test]
    async fn test_unregister_absent_is_silent() {
        let registry = TransportRegistry::new();
        let mut events = registry.subscribe();

        registry.unregister(TransportType::Ble);
        registry.register(Arc::new(MockTransport::new(TransportType::Relay)));

        // The first observed event is the registration; no unregistered event
        // was emitted for the absent type.
        let event = next_event(&mut events).await;
        assert!(matches!(
            event,
            RegistryEvent::TransportRegistered {
                transport: TransportType::Relay
            }
        ));
    }

    #[tokio::test]
    async fn test_unregister_emits_event() {
        let registry = TransportRegistry::new();
        registry.register(Arc::new(MockTransport::new(TransportType::Quic)));

        let mut events = registry.subscribe();
        registry.unregister(TransportType::Quic);

        let event = next_event(&mut events).await;
        assert!(matches!(
            event,
            RegistryEvent::TransportUnregistered {
                transport: TransportType::Quic
            }
        ));
        assert!(registry.get(TransportType::Quic).is_none());
    }

    #[tokio::test]
    async fn test_shutdown_all_is_total_and_clears() {
        let registry = TransportRegistry::new();
        let failing = Arc::new(MockTransport::new(TransportType::Quic).with_failing_shutdown());
        let healthy = Arc::new(MockTransport::new(TransportType::Relay));
        registry.register(failing.clone());
        registry.register(healthy.clone());

        registry.shutdown_all().await;

        assert_eq!(failing.shutdown_calls(), 1);
        assert_eq!(healthy.shutdown_calls(), 1);
        assert!(registry.list().is_empty());
        assert!(registry.is_shut_down());

        // Terminal: later registrations are refused.
        registry.register(Arc::new(MockTransport::new(TransportType::Relay)));
        assert!(registry.list().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_register_racing_shutdown_leaves_registry_empty() {
        // A register landing on either side of shutdown_all must never leave
        // a live transport in a shut-down registry.
        for _ in 0..100 {
            let registry = Arc::new(TransportRegistry::new());
            let registering = {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry.register(Arc::new(MockTransport::new(TransportType::Quic)));
                })
            };
            let shutting_down = {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry.shutdown_all().await;
                })
            };
            registering.await.unwrap();
            shutting_down.await.unwrap();

            assert!(registry.is_shut_down());
            assert!(registry.list().is_empty());
            assert!(registry.get(TransportType::Quic).is_none());
        }
    }

    #[tokio::test]
    async fn test_register_with_consumed_event_stream_still_routes() {
        let registry = TransportRegistry::new();
        let transport = Arc::new(MockTransport::new(TransportType::Quic));
        // Stream consumed elsewhere before registration.
        let _events = transport.take_events();

        registry.register(transport.clone());
        assert!(registry.get(TransportType::Quic).is_some());

        // No forwarding, but routing and lifecycle still work.
        registry.shutdown_all().await;
        assert_eq!(transport.shutdown_calls(), 1);
    }

    #[tokio::test]
    async fn test_events_are_tagged_with_transport_type() {
        let registry = TransportRegistry::new();
        let transport = Arc::new(MockTransport::new(TransportType::Quic));
        registry.register(transport.clone());
        let mut events = registry.subscribe();

        let connection = Connection::new(
            ConnectionId::new("c1"),
            TransportType::Quic,
            ConnectionTarget::person(PersonId([5u8; 32])),
        );
        transport.emit_established(connection.clone());
        transport.emit_closed(ConnectionId::new("c1"), Some("peer went away".into()));

        match next_event(&mut events).await {
            RegistryEvent::ConnectionEstablished {
                connection: observed,
                transport: ty,
            } => {
                assert_eq!(observed.id(), connection.id());
                assert_eq!(ty, TransportType::Quic);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match next_event(&mut events).await {
            RegistryEvent::ConnectionClosed {
                connection_id,
                transport: ty,
                reason,
            } => {
                assert_eq!(connection_id, ConnectionId::new("c1"));
                assert_eq!(ty, TransportType::Quic);
                assert_eq!(reason.as_deref(), Some("peer went away"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_replacement_reroutes_event_forwarding() {
        let registry = TransportRegistry::new();
        let old = Arc::new(MockTransport::new(TransportType::Quic));
        registry.register(old.clone());

        let new = Arc::new(MockTransport::new(TransportType::Quic));
        registry.register(new.clone());
        // Let the aborted forwarder wind down before emitting on the old one.
        tokio::task::yield_now().await;

        let mut events = registry.subscribe();
        old.emit_established(Connection::new(
            ConnectionId::new("stale"),
            TransportType::Quic,
            ConnectionTarget::endpoint("old:1"),
        ));
        new.emit_established(Connection::new(
            ConnectionId::new("fresh"),
            TransportType::Quic,
            ConnectionTarget::endpoint("new:1"),
        ));

        match next_event(&mut events).await {
            RegistryEvent::ConnectionEstablished { connection, .. } => {
                assert_eq!(connection.id(), &ConnectionId::new("fresh"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
