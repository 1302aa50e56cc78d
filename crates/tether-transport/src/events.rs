//! Aggregated event stream shapes.
//!
//! Every transport's lifecycle events are re-emitted by the registry in this
//! uniform shape, tagged with the producing transport's type, so downstream
//! listeners never care which medium produced an event. Delivery is ordered
//! per source; cross-transport ordering is not guaranteed.

use crate::types::{Connection, ConnectionId, ConnectionTarget, TransportType};

/// Capacity of the registry's broadcast channel. Slow subscribers past this
/// backlog observe a lag error, not blocked producers.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event on the registry's aggregated stream.
#[derive(Clone, Debug)]
pub enum RegistryEvent {
    /// A transport established a peer connection.
    ConnectionEstablished {
        connection: Connection,
        transport: TransportType,
    },
    /// A peer connection went away.
    ConnectionClosed {
        connection_id: ConnectionId,
        transport: TransportType,
        reason: Option<String>,
    },
    /// A transport was registered.
    TransportRegistered { transport: TransportType },
    /// A transport was unregistered.
    TransportUnregistered { transport: TransportType },
    /// The router chose a transport for a connect attempt. Emitted exactly
    /// once per attempt, including attempts that subsequently fail.
    TransportSelected {
        transport: TransportType,
        target: ConnectionTarget,
    },
}
