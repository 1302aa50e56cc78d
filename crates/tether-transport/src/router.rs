//! Connection routing: pick a transport for a target and drive the attempt.

use crate::errors::TransportError;
use crate::events::RegistryEvent;
use crate::registry::TransportRegistry;
use crate::types::{Connection, ConnectionTarget, TransportPreferences, TransportType};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Walks the preference-ordered transport candidates for a target and returns
/// the first connection that succeeds.
///
/// The router consults availability but never drives transport lifecycle:
/// an unavailable transport is skipped, not started. Each actual attempt is
/// announced with a `TransportSelected` event before the connect is issued.
pub struct ConnectionRouter {
    registry: Arc<TransportRegistry>,
}

impl ConnectionRouter {
    pub fn new(registry: Arc<TransportRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<TransportRegistry> {
        &self.registry
    }

    /// Connect to the target using the preferred transports in order, then the
    /// fallbacks. `None` preferences mean relay-only with default timing.
    ///
    /// Fails with `InvalidTarget` before any attempt if the target carries no
    /// address, and with `NoTransportAvailable` wrapping the last per-attempt
    /// error once the candidate list, attempt ceiling, or time budget runs out.
    pub async fn connect(
        &self,
        target: &ConnectionTarget,
        preferences: Option<&TransportPreferences>,
    ) -> Result<Connection, TransportError> {
        if !target.has_address() {
            return Err(TransportError::InvalidTarget(
                "target carries neither a person id nor an endpoint".into(),
            ));
        }

        let default_preferences;
        let preferences = match preferences {
            Some(preferences) => preferences,
            None => {
                default_preferences = TransportPreferences::relay_only();
                &default_preferences
            }
        };

        let deadline = Instant::now() + preferences.timeout;
        let mut attempts: u32 = 0;
        let mut last_error: Option<TransportError> = None;

        for candidate in preferences.candidates() {
            let Some(transport) = self.registry.get(candidate) else {
                debug!(transport = %candidate, "candidate not registered, skipping");
                continue;
            };
            if !transport.is_available() {
                debug!(transport = %candidate, "candidate unavailable, skipping");
                continue;
            }
            if attempts >= preferences.retry_attempts {
                debug!(attempts, "attempt ceiling reached");
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                last_error = Some(TransportError::Timeout);
                break;
            }

            self.registry.publish(RegistryEvent::TransportSelected {
                transport: candidate,
                target: target.clone(),
            });
            attempts += 1;

            match self.attempt(transport, target, remaining).await {
                Ok(connection) => {
                    debug!(
                        transport = %candidate,
                        connection = %connection.id(),
                        "connected"
                    );
                    return Ok(connection);
                }
                Err(error) => {
                    warn!(transport = %candidate, error = %error, "connect attempt failed");
                    last_error = Some(error);
                }
            }
        }

        Err(TransportError::NoTransportAvailable {
            source: last_error.map(Box::new),
        })
    }

    /// Connect through one specific transport, bypassing preference order.
    pub async fn connect_via(
        &self,
        transport_type: TransportType,
        target: &ConnectionTarget,
    ) -> Result<Connection, TransportError> {
        if !target.has_address() {
            return Err(TransportError::InvalidTarget(
                "target carries neither a person id nor an endpoint".into(),
            ));
        }
        let transport = self
            .registry
            .get(transport_type)
            .ok_or(TransportError::TransportNotRegistered(transport_type))?;

        self.registry.publish(RegistryEvent::TransportSelected {
            transport: transport_type,
            target: target.clone(),
        });
        transport.connect(target).await
    }

    /// One bounded attempt. The timeout is advisory: on expiry the attempt is
    /// abandoned, not cancelled, so a transport that eventually succeeds still
    /// emits its established event through the registry stream.
    async fn attempt(
        &self,
        transport: Arc<dyn crate::traits::Transport>,
        target: &ConnectionTarget,
        budget: Duration,
    ) -> Result<Connection, TransportError> {
        let target = target.clone();
        let task = tokio::spawn(async move { transport.connect(&target).await });
        match tokio::time::timeout(budget, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(TransportError::Other(format!(
                "connect task failed: {}",
                join_error
            ))),
            Err(_) => Err(TransportError::Timeout),
        }
    }
}
