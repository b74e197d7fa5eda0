// Structured messages and the reserved-key vocabulary of the relay protocol.
//
// Every frame on the wire carries exactly one `Message`: a JSON object with
// string keys. Protocol signals are not a separate envelope; they are reserved
// keys inside the same object (`connect`, `addPool`, `ping`, ...). The relay
// server is the other half of this contract, so key spellings in `keys` must
// never change.
//
// Three groups of helpers live here:
// - Control builders (`conn_registration`, `add_pool`, `move_to_pool`,
//   `leave_pool`, `pool_master`, `ping`) used by the client's pool protocol
//   and heartbeat.
// - `Directive` stamping for application sends. A message carries at most one
//   routing directive; stamping a new one removes any other.
// - `Route` classification for inbound messages, applied by the client's
//   message router.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ProtocolError, Result};
use crate::types::ConnId;

/// Reserved keys. These are the wire contract with the relay server.
pub mod keys {
    pub const CONNECT: &str = "connect";
    pub const CONN_ID: &str = "connId";
    pub const ADD_POOL: &str = "addPool";
    pub const CHANGE_POOL: &str = "changePool";
    pub const MOVE_TO_POOL: &str = "moveToPool";
    pub const LEAVE_POOL: &str = "leavePool";
    pub const POOL_MASTER: &str = "poolMaster";
    pub const POOL_TYPE: &str = "poolType";
    pub const FROM_POOL: &str = "fromPool";

    pub const SEND_TO_ALL: &str = "sendToAll";
    pub const SEND_TO_POOL: &str = "sendToPool";
    pub const SEND_TO_OTHERS: &str = "sendToOthers";
    pub const SEND_TO_CONN_ID: &str = "sendToConnId";
    pub const SEND_TO_POOL_MASTER: &str = "sendToPoolMaster";

    pub const PING: &str = "ping";
    pub const TIME: &str = "time";

    /// Pool-table entry present in every session.
    pub const ALL: &str = "all";
    /// Pool-table entry holding the session's primary pool.
    pub const MAIN: &str = "main";

    /// Every key that acts as a routing directive.
    pub const DIRECTIVES: [&str; 5] = [
        SEND_TO_ALL,
        SEND_TO_POOL,
        SEND_TO_OTHERS,
        SEND_TO_CONN_ID,
        SEND_TO_POOL_MASTER,
    ];
}

/// One structured message: a JSON object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message(Map<String, Value>);

impl Message {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Text form of a key's value. Strings come back as-is; numbers and
    /// booleans are rendered, so a pool name sent as a bare number still
    /// reads as a name.
    pub fn text(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// The `connId` field, accepted as a JSON integer, a whole-valued float
    /// (`42.0`) or a decimal string.
    pub fn conn_id(&self) -> Option<ConnId> {
        match self.0.get(keys::CONN_ID)? {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().and_then(whole_i64))
                .map(ConnId),
            Value::String(s) => s.trim().parse().ok().map(ConnId),
            _ => None,
        }
    }

    /// The echoed heartbeat timestamp in milliseconds since the UNIX epoch.
    /// Integers, floats and decimal strings are all accepted.
    pub fn echoed_time_ms(&self) -> Option<u64> {
        match self.0.get(keys::TIME)? {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Classify the routing directive carried by an inbound message, using
    /// the router's precedence: pool master, then connection, then pool or
    /// others.
    pub fn route(&self) -> Option<Route> {
        if self.contains_key(keys::SEND_TO_POOL_MASTER) {
            Some(Route::PoolMaster)
        } else if self.contains_key(keys::SEND_TO_CONN_ID) {
            Some(Route::Connection)
        } else if self.contains_key(keys::SEND_TO_POOL)
            || self.contains_key(keys::SEND_TO_OTHERS)
            || self.contains_key(keys::SEND_TO_ALL)
        {
            Some(Route::PoolOrOthers)
        } else {
            None
        }
    }

    /// Serialize to UTF-8 JSON.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.0).map_err(ProtocolError::InvalidPayload)
    }

    /// Parse a UTF-8 JSON object. Any other top-level JSON value is rejected.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self> {
        match serde_json::from_slice::<Value>(bytes).map_err(ProtocolError::InvalidPayload)? {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(ProtocolError::NotAnObject),
        }
    }

    // --- Control builders ---

    /// Tells the relay which logical connection a socket belongs to. Sent on
    /// both the stream and the datagram socket once the ID is known.
    pub fn conn_registration(conn_id: ConnId) -> Self {
        Self::new()
            .with(keys::CONNECT, true)
            .with(keys::CONN_ID, conn_id.0)
    }

    pub fn add_pool(pool: &str, pool_type: &str) -> Self {
        Self::new()
            .with(keys::ADD_POOL, pool)
            .with(keys::POOL_TYPE, pool_type)
    }

    /// Atomic switch of the primary pool; `from` is the current main pool
    /// (empty when none is assigned yet).
    pub fn move_to_pool(from: &str, pool: &str, pool_type: &str) -> Self {
        Self::new()
            .with(keys::FROM_POOL, from)
            .with(keys::CHANGE_POOL, pool)
            .with(keys::POOL_TYPE, pool_type)
    }

    pub fn leave_pool(pool: &str, pool_type: &str) -> Self {
        Self::new()
            .with(keys::LEAVE_POOL, pool)
            .with(keys::POOL_TYPE, pool_type)
    }

    pub fn pool_master(pool: &str) -> Self {
        Self::new().with(keys::POOL_MASTER, pool)
    }

    /// Heartbeat datagram. The relay echoes it back unchanged.
    pub fn ping(conn_id: ConnId, time_ms: u64) -> Self {
        Self::new()
            .with(keys::PING, true)
            .with(keys::TIME, time_ms)
            .with(keys::CONN_ID, conn_id.0)
    }
}

impl From<Map<String, Value>> for Message {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.0) {
            Ok(text) => f.write_str(&text),
            Err(_) => f.write_str("<unserializable message>"),
        }
    }
}

/// Inbound mailbox selected by a message's routing directive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    /// `sendToPoolMaster`: traffic for the pool's authority ("server" side).
    PoolMaster,
    /// `sendToConnId`: traffic addressed to this connection only.
    Connection,
    /// `sendToPool` / `sendToOthers` / `sendToAll`: pool broadcast traffic.
    PoolOrOthers,
}

/// Routing directive stamped onto an outbound application message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Directive {
    /// Deliver to one connection. `connId` is only added if the message does
    /// not already carry one.
    ToConnection(ConnId),
    /// Deliver to every other member of `pool`; `sender` is stamped as
    /// `connId` so receivers know who sent it.
    ToOthers { pool: String, sender: ConnId },
    /// Deliver to every member of `pool`.
    ToPool(String),
    /// Deliver to the master of `pool`.
    ToPoolMaster(String),
}

impl Directive {
    /// Stamp this directive onto `msg`, removing any other directive key so
    /// the message carries exactly one.
    pub fn apply(&self, msg: &mut Message) {
        for key in keys::DIRECTIVES {
            msg.remove(key);
        }
        match self {
            Directive::ToConnection(id) => {
                msg.insert(keys::SEND_TO_CONN_ID, true);
                if !msg.contains_key(keys::CONN_ID) {
                    msg.insert(keys::CONN_ID, id.0);
                }
            }
            Directive::ToOthers { pool, sender } => {
                msg.insert(keys::SEND_TO_OTHERS, pool.as_str());
                msg.insert(keys::CONN_ID, sender.0);
            }
            Directive::ToPool(pool) => {
                msg.insert(keys::SEND_TO_POOL, pool.as_str());
            }
            Directive::ToPoolMaster(pool) => {
                msg.insert(keys::SEND_TO_POOL_MASTER, pool.as_str());
            }
        }
    }
}

fn whole_i64(f: f64) -> Option<i64> {
    (f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64).then_some(f as i64)
}
