// Pool membership table and the pool-membership control protocol.
//
// `PoolTable` maps pool name to pool name. Two entries always exist: `all`
// (every session is in the wildcard pool) and `main` (the primary pool, empty
// until the relay assigns one). Other entries are self-referential: their
// presence is the membership. The table changes only in response to relay
// replies (see `router.rs`) or confirmed leave writes.
//
// `PoolProtocol` builds the four control requests, registers the reply
// callback in the pending map, and queues the request on the all-cost
// channel. Local failures (not connected, already in the target pool,
// leaving the main pool) complete the callback immediately and send nothing.
//
// Leave has no relay reply. It completes once the request is written to the
// stream, at which point the pool is dropped from the table.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use poolnet_protocol::{Message, PriorityChannel, keys};

use crate::error::{ClientError, Result};
use crate::pending::{PendingRequests, ReplyCallback, RequestKind};
use crate::scheduler::SendScheduler;
use crate::state::LinkState;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolTable {
    entries: BTreeMap<String, String>,
}

impl Default for PoolTable {
    fn default() -> Self {
        let mut table = Self {
            entries: BTreeMap::new(),
        };
        table.reset();
        table
    }
}

impl PoolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Back to just `all` and an unassigned `main`.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.entries.insert(keys::ALL.into(), keys::ALL.into());
        self.entries.insert(keys::MAIN.into(), String::new());
    }

    /// The primary pool, or `""` when none is assigned.
    pub fn main_pool(&self) -> &str {
        self.entries.get(keys::MAIN).map_or("", String::as_str)
    }

    pub fn set_main(&mut self, pool: &str) {
        self.entries.insert(keys::MAIN.into(), pool.into());
    }

    /// Clear `main` if it currently names `pool`. Returns whether it did.
    pub fn clear_main_if(&mut self, pool: &str) -> bool {
        if self.main_pool() == pool && !pool.is_empty() {
            self.set_main("");
            true
        } else {
            false
        }
    }

    /// Record membership of an additional pool. Returns `false` if the name
    /// is already in the table.
    pub fn add(&mut self, pool: &str) -> bool {
        if self.entries.contains_key(pool) {
            return false;
        }
        self.entries.insert(pool.into(), pool.into());
        true
    }

    /// Drop an additional pool. The `all` and `main` entries are permanent.
    pub fn remove(&mut self, pool: &str) -> bool {
        if pool == keys::ALL || pool == keys::MAIN {
            return false;
        }
        self.entries.remove(pool).is_some()
    }

    /// Whether the session is a member of `pool`, as main or additional.
    pub fn contains(&self, pool: &str) -> bool {
        !pool.is_empty() && self.entries.values().any(|v| v == pool)
    }

    /// Every pool the session belongs to, `all` and the main pool included.
    /// An unassigned main pool is not listed.
    pub fn all_pools(&self) -> Vec<String> {
        let mut pools: Vec<String> = Vec::with_capacity(self.entries.len());
        for pool in self.entries.values() {
            if !pool.is_empty() && !pools.contains(pool) {
                pools.push(pool.clone());
            }
        }
        pools
    }
}

/// Builds and sends pool control requests.
pub struct PoolProtocol {
    link: Arc<LinkState>,
    pools: Arc<Mutex<PoolTable>>,
    pending: Arc<Mutex<PendingRequests>>,
    scheduler: Arc<SendScheduler>,
}

impl PoolProtocol {
    pub fn new(
        link: Arc<LinkState>,
        pools: Arc<Mutex<PoolTable>>,
        pending: Arc<Mutex<PendingRequests>>,
        scheduler: Arc<SendScheduler>,
    ) -> Self {
        Self {
            link,
            pools,
            pending,
            scheduler,
        }
    }

    /// Join `pool` in addition to the current ones. Does not touch `main`.
    pub fn add_to_pool(&self, pool: &str, pool_type: &str, callback: ReplyCallback) {
        if let Err(e) = self.check_connected("add_to_pool") {
            callback(Err(e));
            return;
        }
        self.request(RequestKind::AddPool, Message::add_pool(pool, pool_type), callback);
    }

    /// Switch the primary pool to `pool`. Completes immediately, sending
    /// nothing, if `pool` already is the primary pool.
    pub fn move_to_pool(&self, pool: &str, pool_type: &str, callback: ReplyCallback) {
        if let Err(e) = self.check_connected("move_to_pool") {
            callback(Err(e));
            return;
        }
        let from = self.pools.lock().main_pool().to_owned();
        if from == pool {
            tracing::info!(pool, "already in pool, nothing to move");
            callback(Ok(None));
            return;
        }
        self.request(
            RequestKind::MoveToPool,
            Message::move_to_pool(&from, pool, pool_type),
            callback,
        );
    }

    /// Leave an additional pool. The main pool is refused; use
    /// `move_to_pool` to change it.
    pub fn leave_pool(&self, pool: &str, pool_type: &str, callback: ReplyCallback) {
        if let Err(e) = self.check_connected("leave_pool") {
            callback(Err(e));
            return;
        }
        let main = self.pools.lock().main_pool().to_owned();
        if main == pool {
            tracing::warn!(pool, "refusing to leave the main pool");
            callback(Err(ClientError::LeaveMainPool(pool.to_owned())));
            return;
        }

        tracing::info!(main = %main, leaving = pool, "leaving pool");
        let pools = self.pools.clone();
        let name = pool.to_owned();
        self.scheduler.enqueue(
            PriorityChannel::AllCost,
            Message::leave_pool(pool, pool_type),
            Some(Box::new(move |result| match result {
                Ok(()) => {
                    {
                        let mut pools = pools.lock();
                        pools.remove(&name);
                        pools.clear_main_if(&name);
                    }
                    callback(Ok(None));
                }
                Err(e) => callback(Err(e)),
            })),
        );
    }

    /// Ask the relay to make this connection the master of `pool`.
    pub fn set_connection_as_pool_master(&self, pool: &str, callback: ReplyCallback) {
        if let Err(e) = self.check_connected("set_connection_as_pool_master") {
            callback(Err(e));
            return;
        }
        self.request(RequestKind::PoolMaster, Message::pool_master(pool), callback);
    }

    fn check_connected(&self, op: &str) -> Result<()> {
        if !self.link.is_started() {
            tracing::warn!(op, "cannot send pool request: client is not started");
            return Err(ClientError::NotStarted);
        }
        if !self.link.is_connected() {
            tracing::warn!(op, "cannot send pool request: client is not connected");
            return Err(ClientError::NotConnected);
        }
        Ok(())
    }

    /// Register the reply callback, then queue the request. If the write
    /// fails the callback is taken back and fails with the write error.
    fn request(&self, kind: RequestKind, msg: Message, callback: ReplyCallback) {
        let (token, replaced) = self.pending.lock().register(kind, callback);
        if let Some(replaced) = replaced {
            tracing::warn!(kind = kind.key(), "pending request replaced by a newer one");
            replaced(Err(ClientError::Superseded));
        }

        let pending = self.pending.clone();
        self.scheduler.enqueue(
            PriorityChannel::AllCost,
            msg,
            Some(Box::new(move |result| {
                if let Err(e) = result {
                    tracing::error!(kind = kind.key(), error = %e, "pool request was not sent");
                    let callback = pending.lock().take_if(kind, token);
                    if let Some(callback) = callback {
                        callback(Err(e));
                    }
                }
            })),
        );
    }
}
