// Core ID and channel types for the relay protocol.
//
// `ConnId` is the relay-assigned connection identifier, handed to the client
// in the connection-establishment reply and echoed back on both the stream
// and datagram sockets so the relay can pair them. `PriorityChannel` names
// the four outbound traffic classes the client's send scheduler drains
// (see `poolnet_client::scheduler`).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Relay-assigned connection ID. Zero means "not yet assigned".
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ConnId(pub i64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outbound traffic class. Declaration order is service priority: the send
/// scheduler always prefers an earlier variant, subject to its starvation
/// budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PriorityChannel {
    /// Control traffic and anything that must go out before everything else.
    AllCost,
    /// Frequent state snapshots.
    StateUpdate,
    /// Ordinary reliable application traffic.
    Reliable,
    /// Lowest priority stream traffic.
    Unreliable,
}

impl PriorityChannel {
    /// All channels in service-priority order.
    pub const ALL: [PriorityChannel; 4] = [
        PriorityChannel::AllCost,
        PriorityChannel::StateUpdate,
        PriorityChannel::Reliable,
        PriorityChannel::Unreliable,
    ];

    /// Dense index, usable for array-backed per-channel storage.
    pub fn index(self) -> usize {
        match self {
            PriorityChannel::AllCost => 0,
            PriorityChannel::StateUpdate => 1,
            PriorityChannel::Reliable => 2,
            PriorityChannel::Unreliable => 3,
        }
    }
}

impl fmt::Display for PriorityChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PriorityChannel::AllCost => "all-cost",
            PriorityChannel::StateUpdate => "state-update",
            PriorityChannel::Reliable => "reliable",
            PriorityChannel::Unreliable => "unreliable",
        };
        f.write_str(name)
    }
}
