// Pending control requests awaiting a relay reply.
//
// The relay answers control messages asynchronously and without request IDs,
// so replies are correlated by type alone: at most one request per
// `RequestKind` can be outstanding. Registering a second request of the same
// kind replaces the first, and the replaced callback is handed back so the
// caller can fail it with `Superseded`.
//
// Each registration gets a token. A failure path that only knows "my send
// failed" uses `take_if` with its token, so it cannot accidentally resolve a
// newer request that replaced it in the meantime.
//
// Callbacks are never invoked while the map's lock is held; every method
// returns them to the caller instead.

use std::collections::HashMap;

use poolnet_protocol::{Message, keys};

use crate::error::ClientError;

/// Completion for a control request: the relay's reply message on success.
pub type ReplyCallback = Box<dyn FnOnce(Result<Option<Message>, ClientError>) + Send + 'static>;

/// Completion for an outbound frame: fires once the payload is written.
pub type SendCallback = Box<dyn FnOnce(Result<(), ClientError>) + Send + 'static>;

/// Control requests that wait for a matching relay reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Connect,
    AddPool,
    MoveToPool,
    PoolMaster,
}

impl RequestKind {
    /// Wire key this request kind is named by.
    pub fn key(self) -> &'static str {
        match self {
            RequestKind::Connect => keys::CONNECT,
            RequestKind::AddPool => keys::ADD_POOL,
            RequestKind::MoveToPool => keys::MOVE_TO_POOL,
            RequestKind::PoolMaster => keys::POOL_MASTER,
        }
    }
}

#[derive(Default)]
pub struct PendingRequests {
    callbacks: HashMap<RequestKind, (u64, ReplyCallback)>,
    next_token: u64,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `kind`. Returns the new token and the callback
    /// it replaced, if any.
    pub fn register(
        &mut self,
        kind: RequestKind,
        callback: ReplyCallback,
    ) -> (u64, Option<ReplyCallback>) {
        let token = self.next_token;
        self.next_token += 1;
        let replaced = self
            .callbacks
            .insert(kind, (token, callback))
            .map(|(_, cb)| cb);
        (token, replaced)
    }

    /// Remove and return the callback for `kind`.
    pub fn take(&mut self, kind: RequestKind) -> Option<ReplyCallback> {
        self.callbacks.remove(&kind).map(|(_, cb)| cb)
    }

    /// Remove the callback for `kind` only if it is still the registration
    /// identified by `token`.
    pub fn take_if(&mut self, kind: RequestKind, token: u64) -> Option<ReplyCallback> {
        match self.callbacks.get(&kind) {
            Some((current, _)) if *current == token => self.take(kind),
            _ => None,
        }
    }

    pub fn is_pending(&self, kind: RequestKind) -> bool {
        self.callbacks.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Remove every pending callback.
    pub fn drain(&mut self) -> Vec<(RequestKind, ReplyCallback)> {
        self.callbacks
            .drain()
            .map(|(kind, (_, cb))| (kind, cb))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting(counter: &Arc<AtomicUsize>) -> ReplyCallback {
        let counter = counter.clone();
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn second_registration_returns_the_first() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut pending = PendingRequests::new();

        let (_, replaced) = pending.register(RequestKind::AddPool, counting(&hits));
        assert!(replaced.is_none());
        let (_, replaced) = pending.register(RequestKind::AddPool, counting(&hits));
        let replaced = replaced.expect("first callback handed back");
        replaced(Err(ClientError::Superseded));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn take_if_ignores_stale_tokens() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut pending = PendingRequests::new();

        let (old, _) = pending.register(RequestKind::MoveToPool, counting(&hits));
        let (new, _) = pending.register(RequestKind::MoveToPool, counting(&hits));

        assert!(pending.take_if(RequestKind::MoveToPool, old).is_none());
        assert!(pending.take_if(RequestKind::MoveToPool, new).is_some());
        assert!(pending.is_empty());
    }

    #[test]
    fn kinds_are_independent() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut pending = PendingRequests::new();
        pending.register(RequestKind::Connect, counting(&hits));
        pending.register(RequestKind::PoolMaster, counting(&hits));

        assert!(pending.take(RequestKind::AddPool).is_none());
        assert!(pending.is_pending(RequestKind::Connect));
        assert_eq!(pending.drain().len(), 2);
        assert!(pending.is_empty());
    }

    #[test]
    fn kind_keys_match_wire_names() {
        assert_eq!(RequestKind::Connect.key(), "connect");
        assert_eq!(RequestKind::MoveToPool.key(), "moveToPool");
    }
}
