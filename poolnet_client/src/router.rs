// Inbound message classification and fan-out.
//
// Every decoded message, from the stream or a datagram, passes through
// `MessageRouter::route`. The clauses run in a fixed order and are not
// exclusive, since one relay message can carry several signals:
//
// 1. `connect`: store the assigned connection ID, register it on both
//    sockets, resolve the pending connect request. A reply without a usable
//    ID, or a failed stream registration, fails the request instead.
// 2. `changePool`: set the main pool, resolve the pending move.
// 3. `addPool`: add the pool to the table, resolve the pending add.
// 4. `poolMaster`: record the promotion, resolve the pending request.
// 5. `ping`: heartbeat echo, update RTT and the liveness clock.
// 6. A routing directive: deliver to exactly one mailbox.
//
// A reply with no pending request (the relay moved us on its own, or the
// caller's request was already superseded) is logged and otherwise ignored.
//
// Sending the registration goes through the `Outbound` trait so the router
// can be exercised without sockets.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use poolnet_protocol::{Message, ProtocolError, keys};

use crate::error::{ClientError, Result};
use crate::heartbeat;
use crate::mailbox::Mailboxes;
use crate::pending::{PendingRequests, RequestKind};
use crate::pools::PoolTable;
use crate::state::LinkState;

/// Immediate sends the router needs while handling replies.
pub trait Outbound: Send + Sync {
    /// Write a frame on the stream now, ahead of anything queued.
    fn write_stream_now(&self, msg: &Message) -> Result<()>;

    /// Send a single datagram.
    fn send_datagram(&self, msg: &Message) -> Result<()>;
}

pub struct MessageRouter {
    link: Arc<LinkState>,
    pools: Arc<Mutex<PoolTable>>,
    pending: Arc<Mutex<PendingRequests>>,
    mailboxes: Arc<Mailboxes>,
}

impl MessageRouter {
    pub fn new(
        link: Arc<LinkState>,
        pools: Arc<Mutex<PoolTable>>,
        pending: Arc<Mutex<PendingRequests>>,
        mailboxes: Arc<Mailboxes>,
    ) -> Self {
        Self {
            link,
            pools,
            pending,
            mailboxes,
        }
    }

    pub fn route(&self, msg: Message, out: &dyn Outbound) {
        if msg.contains_key(keys::CONNECT) {
            self.on_connect(&msg, out);
        }

        if msg.contains_key(keys::CHANGE_POOL) {
            match msg.text(keys::CHANGE_POOL) {
                Some(pool) => {
                    self.pools.lock().set_main(&pool);
                    tracing::info!(pool = %pool, "main pool changed");
                }
                None => tracing::error!(%msg, "changePool reply without a pool name"),
            }
            self.resolve(RequestKind::MoveToPool, &msg);
        }

        if msg.contains_key(keys::ADD_POOL) {
            match msg.text(keys::ADD_POOL) {
                Some(pool) => {
                    if self.pools.lock().add(&pool) {
                        tracing::info!(pool = %pool, "pool membership added");
                    } else {
                        tracing::error!(pool = %pool, "added to a pool we already belong to");
                    }
                }
                None => tracing::error!(%msg, "addPool reply without a pool name"),
            }
            self.resolve(RequestKind::AddPool, &msg);
        }

        if msg.contains_key(keys::POOL_MASTER) {
            let pool = msg.text(keys::POOL_MASTER);
            tracing::info!(pool = ?pool, "set as pool master");
            self.link.set_pool_master(pool);
            self.resolve(RequestKind::PoolMaster, &msg);
        }

        if msg.contains_key(keys::PING) {
            self.on_heartbeat(&msg);
        }

        match msg.route() {
            Some(route) => self.mailboxes.deliver(route, msg),
            None => tracing::trace!("message carried no routing directive"),
        }
    }

    /// The connect request only succeeds once the registration is on the
    /// stream; until then nothing queued can be written.
    fn on_connect(&self, msg: &Message, out: &dyn Outbound) {
        let Some(id) = msg.conn_id() else {
            tracing::error!(%msg, "connect reply without a usable connId");
            self.link.set_connected(false);
            self.fail(RequestKind::Connect, ProtocolError::MissingConnId.into());
            return;
        };
        self.link.set_conn_id(id);
        tracing::info!(conn_id = %id, "connected to relay");

        let registration = Message::conn_registration(id);
        if let Err(e) = out.write_stream_now(&registration) {
            tracing::error!(error = %e, "stream registration failed");
            self.link.set_connected(false);
            self.fail(RequestKind::Connect, e);
            return;
        }
        self.link.set_ready(true);
        if let Err(e) = out.send_datagram(&registration) {
            tracing::error!(error = %e, "datagram registration failed");
        }
        self.resolve(RequestKind::Connect, msg);
    }

    fn on_heartbeat(&self, msg: &Message) {
        if let Some(sent) = msg.echoed_time_ms() {
            let rtt = heartbeat::round_trip_ms(sent, heartbeat::now_millis());
            self.link.set_rtt_ms(rtt);
            tracing::trace!(rtt_ms = rtt, "heartbeat echo");
        }
        self.link.touch_heartbeat(Instant::now());
    }

    fn fail(&self, kind: RequestKind, error: ClientError) {
        let callback = self.pending.lock().take(kind);
        match callback {
            Some(callback) => callback(Err(error)),
            None => tracing::error!(kind = kind.key(), %error, "no pending request for failure"),
        }
    }

    fn resolve(&self, kind: RequestKind, msg: &Message) {
        let callback = self.pending.lock().take(kind);
        match callback {
            Some(callback) => callback(Ok(Some(msg.clone()))),
            None => tracing::error!(kind = kind.key(), "no pending request for reply"),
        }
    }
}
