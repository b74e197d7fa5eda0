// Inbound mailboxes drained by the embedding application.
//
// The router sorts every routed message into one of three FIFO queues by its
// routing directive. The application polls them (typically once per frame)
// from its own thread; the router pushes from the stream and datagram loops.
// Order is preserved within a mailbox, never across them.

use std::collections::VecDeque;

use parking_lot::Mutex;
use poolnet_protocol::{Message, Route};

#[derive(Debug, Default)]
pub struct Mailbox {
    queue: Mutex<VecDeque<Message>>,
}

impl Mailbox {
    pub fn push(&self, msg: Message) {
        self.queue.lock().push_back(msg);
    }

    /// Oldest queued message, if any. Never blocks on an empty mailbox.
    pub fn pop(&self) -> Option<Message> {
        self.queue.lock().pop_front()
    }

    pub fn has_messages(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn clear(&self) {
        self.queue.lock().clear();
    }
}

/// The three inbound mailboxes.
#[derive(Debug, Default)]
pub struct Mailboxes {
    /// Pool-master-directed traffic.
    pub server: Mailbox,
    /// Pool and broadcast traffic.
    pub pool: Mailbox,
    /// Traffic addressed to this connection.
    pub conn: Mailbox,
}

impl Mailboxes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_route(&self, route: Route) -> &Mailbox {
        match route {
            Route::PoolMaster => &self.server,
            Route::Connection => &self.conn,
            Route::PoolOrOthers => &self.pool,
        }
    }

    pub fn deliver(&self, route: Route, msg: Message) {
        self.for_route(route).push(msg);
    }

    pub fn clear(&self) {
        self.server.clear();
        self.pool.clear();
        self.conn.clear();
    }
}
