// Connection-level state shared by the session, its worker loops and timers.
//
// `started` and `connected` are independent: `started` means the session has
// been initialized and accepts sends; `connected` means a relay connection
// was established and has not been declared dead. `ready` flips once the
// connection-ID registration frame has gone out on the stream; the writer
// loop and heartbeat hold off until then.
//
// Flags and counters are atomics so any thread can read them without
// contention. The last-heartbeat instant and pool-master name sit behind
// small mutexes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use poolnet_protocol::ConnId;

#[derive(Debug)]
pub struct LinkState {
    started: AtomicBool,
    connected: AtomicBool,
    ready: AtomicBool,
    conn_id: AtomicI64,
    rtt_ms: AtomicU64,
    last_heartbeat: Mutex<Instant>,
    pool_master: Mutex<Option<String>>,
}

impl Default for LinkState {
    fn default() -> Self {
        Self {
            started: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            conn_id: AtomicI64::new(0),
            rtt_ms: AtomicU64::new(0),
            last_heartbeat: Mutex::new(Instant::now()),
            pool_master: Mutex::new(None),
        }
    }
}

impl LinkState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything learned from the previous connection.
    pub fn reset(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
        self.conn_id.store(0, Ordering::SeqCst);
        self.rtt_ms.store(0, Ordering::SeqCst);
        *self.last_heartbeat.lock() = Instant::now();
        *self.pool_master.lock() = None;
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn conn_id(&self) -> ConnId {
        ConnId(self.conn_id.load(Ordering::SeqCst))
    }

    pub fn set_conn_id(&self, id: ConnId) {
        self.conn_id.store(id.0, Ordering::SeqCst);
    }

    pub fn rtt_ms(&self) -> u64 {
        self.rtt_ms.load(Ordering::Relaxed)
    }

    pub fn set_rtt_ms(&self, rtt: u64) {
        self.rtt_ms.store(rtt, Ordering::Relaxed);
    }

    pub fn last_heartbeat(&self) -> Instant {
        *self.last_heartbeat.lock()
    }

    pub fn touch_heartbeat(&self, at: Instant) {
        *self.last_heartbeat.lock() = at;
    }

    pub fn pool_master(&self) -> Option<String> {
        self.pool_master.lock().clone()
    }

    pub fn set_pool_master(&self, pool: Option<String>) {
        *self.pool_master.lock() = pool;
    }
}

/// What every worker loop needs besides its socket: the shared link state,
/// the cancellation flag `disconnect` raises, and the poll interval that
/// bounds blocking calls.
#[derive(Clone, Debug)]
pub struct WorkerContext {
    pub link: Arc<LinkState>,
    pub cancel: Arc<AtomicBool>,
    pub poll: Duration,
}

impl WorkerContext {
    pub fn new(link: Arc<LinkState>, poll: Duration) -> Self {
        Self {
            link,
            cancel: Arc::new(AtomicBool::new(false)),
            poll,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_keeps_started() {
        let link = LinkState::new();
        link.set_started(true);
        link.set_connected(true);
        link.set_ready(true);
        link.set_conn_id(ConnId(42));
        link.set_pool_master(Some("lobby".into()));

        link.reset();

        assert!(link.is_started());
        assert!(!link.is_connected());
        assert!(!link.is_ready());
        assert_eq!(link.conn_id(), ConnId(0));
        assert_eq!(link.pool_master(), None);
    }

    #[test]
    fn cancellation_is_shared_between_clones() {
        let ctx = WorkerContext::new(Arc::new(LinkState::new()), Duration::from_millis(10));
        let clone = ctx.clone();
        ctx.cancel();
        assert!(clone.is_cancelled());
    }
}
