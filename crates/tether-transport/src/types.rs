//! Shared types for transport selection and connection bookkeeping.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Transport medium identifier.
///
/// Doubles as the registry key and the wire capability marker. Relay is the
/// only medium guaranteed to have a registered backend; the others register
/// opportunistically when their medium is usable on this device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportType {
    /// Relay-tunneled connection through a rendezvous server.
    Relay,
    /// Direct QUIC connection.
    Quic,
    /// Direct UDP connection.
    UdpDirect,
    /// Short-range Bluetooth Low Energy link.
    Ble,
}

impl TransportType {
    /// All transport types, direct media first, relay last.
    pub fn all() -> Vec<TransportType> {
        vec![
            TransportType::Quic,
            TransportType::UdpDirect,
            TransportType::Ble,
            TransportType::Relay,
        ]
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportType::Relay => "relay",
            TransportType::Quic => "quic",
            TransportType::UdpDirect => "udp-direct",
            TransportType::Ble => "ble",
        };
        f.write_str(name)
    }
}

/// Person identity digest supplied by the external identity layer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PersonId(pub [u8; 32]);

/// Instance (device) identity digest supplied by the external identity layer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(pub [u8; 32]);

impl fmt::Display for PersonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PersonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PersonId({})", &hex::encode(self.0)[..8])
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceId({})", &hex::encode(self.0)[..8])
    }
}

/// Opaque one-time pairing token issued by the external identity layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairingToken(pub Bytes);

/// Addressing descriptor for the peer to connect to.
///
/// At least one addressing field must be present; the router validates this
/// before any selection happens, transports may assume a valid target.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionTarget {
    /// Peer identity.
    pub person_id: Option<PersonId>,
    /// Specific device of the peer.
    pub instance_id: Option<InstanceId>,
    /// Raw endpoint (host:port or transport-specific address).
    pub endpoint: Option<String>,
    /// One-time pairing token for first contact.
    pub pairing_token: Option<PairingToken>,
}

impl ConnectionTarget {
    /// Target addressed by peer identity.
    pub fn person(person_id: PersonId) -> Self {
        Self {
            person_id: Some(person_id),
            ..Self::default()
        }
    }

    /// Target addressed by raw endpoint.
    pub fn endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            ..Self::default()
        }
    }

    /// Narrow the target to a specific device instance.
    pub fn with_instance(mut self, instance_id: InstanceId) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    /// Attach a raw endpoint hint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Attach a one-time pairing token.
    pub fn with_pairing_token(mut self, token: PairingToken) -> Self {
        self.pairing_token = Some(token);
        self
    }

    /// Whether the target carries at least one addressing field.
    pub fn has_address(&self) -> bool {
        self.person_id.is_some()
            || self.instance_id.is_some()
            || self.endpoint.is_some()
            || self.pairing_token.is_some()
    }
}

/// Ordered transport selection policy for one connect call.
///
/// `timeout` and `retry_attempts` bound the whole selection attempt, not any
/// single transport's internal retry policy.
#[derive(Clone, Debug)]
pub struct TransportPreferences {
    /// Tried first, in order.
    pub preferred: Vec<TransportType>,
    /// Tried after every preferred entry failed or was absent, in order.
    pub fallback: Vec<TransportType>,
    /// Advisory budget for the whole selection attempt.
    pub timeout: Duration,
    /// Ceiling on the total number of connect attempts across the chain.
    pub retry_attempts: u32,
}

impl Default for TransportPreferences {
    fn default() -> Self {
        Self {
            preferred: vec![TransportType::Relay],
            fallback: Vec::new(),
            timeout: Duration::from_secs(30),
            retry_attempts: 4,
        }
    }
}

impl TransportPreferences {
    /// Relay as the single candidate; the router's default when the caller
    /// supplies no preferences.
    pub fn relay_only() -> Self {
        Self::default()
    }

    /// Replace the preferred list.
    pub fn with_preferred(mut self, preferred: Vec<TransportType>) -> Self {
        self.preferred = preferred;
        self
    }

    /// Replace the fallback list.
    pub fn with_fallback(mut self, fallback: Vec<TransportType>) -> Self {
        self.fallback = fallback;
        self
    }

    /// Set the overall selection timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the total attempt ceiling.
    pub fn with_retry_attempts(mut self, retry_attempts: u32) -> Self {
        self.retry_attempts = retry_attempts;
        self
    }

    /// Candidate types in evaluation order: preferred, then fallback.
    pub fn candidates(&self) -> impl Iterator<Item = TransportType> + '_ {
        self.preferred.iter().chain(self.fallback.iter()).copied()
    }
}

/// Identifier of one established peer connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id, used by transports when the collaborator protocol
    /// does not assign one.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque handle for one established peer link, owned by the transport that
/// created it. The routing core never inspects it beyond its id.
#[derive(Clone, Debug)]
pub struct Connection {
    id: ConnectionId,
    transport_type: TransportType,
    target: ConnectionTarget,
}

impl Connection {
    pub fn new(id: ConnectionId, transport_type: TransportType, target: ConnectionTarget) -> Self {
        Self {
            id,
            transport_type,
            target,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn transport_type(&self) -> TransportType {
        self.transport_type
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }
}

/// Typed summary of one live connection, for introspection queries.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub transport_type: TransportType,
    pub peer: Option<PersonId>,
    pub endpoint: Option<String>,
    pub established_at: Instant,
}

impl ConnectionInfo {
    pub fn for_connection(connection: &Connection) -> Self {
        Self {
            id: connection.id().clone(),
            transport_type: connection.transport_type(),
            peer: connection.target().person_id,
            endpoint: connection.target().endpoint.clone(),
            established_at: Instant::now(),
        }
    }
}
