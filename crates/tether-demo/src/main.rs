//! Walkthrough of the transport layer against in-memory doubles: register
//! transports, route a connect with fallback, survive a relay outage, and
//! shut everything down.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tether_transport::{
    ConnectionRouter, ConnectionTarget, MockRelayClient, MockTransport, PersonId, RegistryEvent,
    RelayConfig, RelayTransport, TransportPreferences, TransportRegistry, TransportType,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let registry = Arc::new(TransportRegistry::new());

    // Relay backend with a fast reconnect schedule for demo purposes.
    let relay_client = Arc::new(MockRelayClient::new());
    let relay = RelayTransport::new(
        RelayConfig::default()
            .with_url("wss://relay.demo.invalid:443")
            .with_connect_timeout(Duration::from_secs(2))
            .with_backoff(Duration::from_millis(100), Duration::from_secs(2)),
        relay_client.clone(),
    );
    relay.start();
    registry.register(Arc::new(relay.clone()));

    // A direct transport whose medium is not usable right now.
    registry.register(Arc::new(
        MockTransport::new(TransportType::Quic).with_availability(false),
    ));

    // Print everything the aggregated stream reports.
    let mut events = registry.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                RegistryEvent::TransportSelected { transport, .. } => {
                    info!(%transport, "router selected transport");
                }
                RegistryEvent::ConnectionEstablished {
                    connection,
                    transport,
                } => {
                    info!(%transport, connection = %connection.id(), "connection established");
                }
                RegistryEvent::ConnectionClosed {
                    connection_id,
                    transport,
                    reason,
                } => {
                    info!(%transport, connection = %connection_id, ?reason, "connection closed");
                }
                RegistryEvent::TransportRegistered { transport } => {
                    info!(%transport, "transport registered");
                }
                RegistryEvent::TransportUnregistered { transport } => {
                    info!(%transport, "transport unregistered");
                }
            }
        }
    });

    // Give the relay link a moment to come up.
    sleep(Duration::from_millis(200)).await;
    info!(state = ?relay.link_state(), "relay link state");

    // Prefer the direct transport; it is unavailable, so the router falls
    // back to the relay.
    let router = ConnectionRouter::new(registry.clone());
    let preferences = TransportPreferences::default()
        .with_preferred(vec![TransportType::Quic])
        .with_fallback(vec![TransportType::Relay]);
    let target = ConnectionTarget::person(PersonId([0x42; 32]));
    let connection = router.connect(&target, Some(&preferences)).await?;
    info!(
        transport = %connection.transport_type(),
        connection = %connection.id(),
        "connected to peer"
    );

    // Simulate a relay outage and watch the supervisor reconnect.
    info!("dropping relay link");
    relay_client.drop_link();
    sleep(Duration::from_millis(500)).await;
    let stats = relay.link_stats();
    info!(
        state = ?stats.state,
        connects = stats.connects,
        reconnect_attempts = stats.reconnect_attempts,
        "relay link after outage"
    );

    registry.shutdown_all().await;
    info!("registry shut down");
    Ok(())
}
