// Session: the public face of the client engine.
//
// A `Session` owns everything one relay connection needs: link state, the
// pool table, pending control requests, the send scheduler, the three
// inbound mailboxes, the sockets and the worker threads. It is cheap to
// share behind a reference; every method takes `&self`.
//
// Lifecycle:
//
//   new ──init/start──▶ started ──connect──▶ connected
//                          ▲                     │
//                          └──── init ◀── disconnect/stop (or link failure)
//
// - `init` tears down whatever is left of a previous connection, closes the
//   stream sockets, resets the pool table ("all"/"main" reseeded), link
//   state and mailboxes, and marks the session started.
// - `connect` opens the read stream, the send stream and the datagram
//   socket, spawns the stream-read, stream-write and datagram loops plus the
//   heartbeat timers, and registers the connect callback. The callback fires
//   when the relay's connect reply arrives, or with the error if opening
//   anything fails.
// - `disconnect` clears the flags, stops the timers, raises the workers'
//   cancel flag, shuts the sockets down underneath any blocked I/O, waits
//   (bounded) for the loops, then fails every queued frame and pending
//   request with `Disconnected`. The stream sockets stay installed until
//   `shutdown_stream_clients` (or the next `init`/`connect`) replaces them.
//
// Worker threads hold an `Arc` to the shared state; they release it when
// they exit, which `disconnect` guarantees. Dropping the `Session` runs a
// full shutdown.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use poolnet_protocol::{ConnId, Directive, Message, PriorityChannel};

use crate::config::ClientConfig;
use crate::datagram::{self, DatagramChannel};
use crate::error::{ClientError, Result};
use crate::heartbeat::HeartbeatMonitor;
use crate::mailbox::Mailboxes;
use crate::pending::{PendingRequests, ReplyCallback, RequestKind, SendCallback};
use crate::pools::{PoolProtocol, PoolTable};
use crate::router::{MessageRouter, Outbound};
use crate::scheduler::{SchedulerPolicy, SendScheduler};
use crate::state::{LinkState, WorkerContext};
use crate::stream::{self, StreamWriter};

/// How often `disconnect` checks whether a worker has exited.
const JOIN_POLL: Duration = Duration::from_millis(5);

/// Threads and timers belonging to one connection.
struct Workers {
    ctx: WorkerContext,
    handles: Vec<JoinHandle<()>>,
    heartbeat: Option<HeartbeatMonitor>,
}

impl Workers {
    fn new(ctx: WorkerContext) -> Self {
        Self {
            ctx,
            handles: Vec::new(),
            heartbeat: None,
        }
    }

    /// Cancel everything and wait up to `timeout` for the loops to exit. A
    /// loop that does not make it is detached; it exits on its own once its
    /// blocking call returns. Never joins the calling thread.
    fn stop(mut self, timeout: Duration) {
        self.ctx.cancel();
        if let Some(mut heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
        }

        let deadline = Instant::now() + timeout;
        let current = thread::current().id();
        for handle in self.handles {
            if handle.thread().id() == current {
                continue;
            }
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(JOIN_POLL);
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                tracing::warn!(
                    worker = handle.thread().name().unwrap_or("unnamed"),
                    "worker did not stop in time, detaching"
                );
            }
        }
    }
}

struct Shared {
    config: ClientConfig,
    link: Arc<LinkState>,
    pools: Arc<Mutex<PoolTable>>,
    pending: Arc<Mutex<PendingRequests>>,
    mailboxes: Arc<Mailboxes>,
    scheduler: Arc<SendScheduler>,
    router: MessageRouter,
    pool_protocol: PoolProtocol,
    writer: Arc<StreamWriter>,
    /// Shutdown handle for the read stream; the read loop owns a clone.
    read_stream: Mutex<Option<TcpStream>>,
    datagram: DatagramChannel,
    workers: Mutex<Option<Workers>>,
}

impl Shared {
    fn new(config: ClientConfig) -> Self {
        let link = Arc::new(LinkState::new());
        let pools = Arc::new(Mutex::new(PoolTable::new()));
        let pending = Arc::new(Mutex::new(PendingRequests::new()));
        let mailboxes = Arc::new(Mailboxes::new());
        let scheduler = Arc::new(SendScheduler::new(SchedulerPolicy::from(&config)));
        let router = MessageRouter::new(
            link.clone(),
            pools.clone(),
            pending.clone(),
            mailboxes.clone(),
        );
        let pool_protocol = PoolProtocol::new(
            link.clone(),
            pools.clone(),
            pending.clone(),
            scheduler.clone(),
        );
        Self {
            config,
            link,
            pools,
            pending,
            mailboxes,
            scheduler,
            router,
            pool_protocol,
            writer: Arc::new(StreamWriter::new()),
            read_stream: Mutex::new(None),
            datagram: DatagramChannel::new(),
            workers: Mutex::new(None),
        }
    }

    fn init(&self) {
        self.shutdown_stream_clients();
        self.pools.lock().reset();
        self.link.reset();
        self.mailboxes.clear();
        self.link.set_started(true);
        tracing::info!("session initialized");
    }

    fn connect(
        self: &Arc<Self>,
        host: &str,
        send_port: u16,
        read_port: u16,
        udp_port: u16,
        callback: ReplyCallback,
    ) {
        if !self.link.is_started() {
            tracing::warn!("cannot connect: client is not started");
            callback(Err(ClientError::NotStarted));
            return;
        }
        if self.link.is_connected() {
            tracing::warn!("cannot connect: client is already connected");
            callback(Err(ClientError::AlreadyConnected));
            return;
        }
        if self.workers.lock().is_some() {
            tracing::warn!("cannot connect: previous connection was lost, call init first");
            callback(Err(ClientError::ConnectionLost));
            return;
        }

        // Registered first: the relay sends its connect reply as soon as the
        // read stream is accepted.
        let (token, replaced) = self.pending.lock().register(RequestKind::Connect, callback);
        if let Some(replaced) = replaced {
            replaced(Err(ClientError::Superseded));
        }

        if let Err(e) = self.establish(host, send_port, read_port, udp_port) {
            tracing::error!(host, send_port, read_port, udp_port, error = %e, "connect failed");
            self.link.set_connected(false);
            self.link.set_ready(false);
            let workers = self.workers.lock().take();
            if let Some(workers) = workers {
                workers.stop(self.config.shutdown_join_timeout());
            }
            self.close_sockets();
            let callback = self.pending.lock().take_if(RequestKind::Connect, token);
            if let Some(callback) = callback {
                callback(Err(e.into()));
            }
        }
    }

    fn establish(
        self: &Arc<Self>,
        host: &str,
        send_port: u16,
        read_port: u16,
        udp_port: u16,
    ) -> io::Result<()> {
        let read = TcpStream::connect((host, read_port))?;
        read.set_nodelay(true)?;
        let send = TcpStream::connect((host, send_port))?;
        send.set_nodelay(true)?;
        let relay_udp = SocketAddr::new(send.peer_addr()?.ip(), udp_port);
        tracing::info!(host, send_port, read_port, udp_port, "relay streams open");

        self.writer.attach(send)?;
        *self.read_stream.lock() = Some(read.try_clone()?);

        let ctx = WorkerContext::new(self.link.clone(), self.config.poll_interval());
        let udp = self.datagram.open(relay_udp, &ctx)?;

        self.link.touch_heartbeat(Instant::now());
        self.link.set_connected(true);

        // Held while spawning so a worker that fails straight away cannot
        // tear down a half-built set.
        let mut slot = self.workers.lock();
        let workers = slot.insert(Workers::new(ctx.clone()));

        let shared = Arc::clone(self);
        workers.handles.push(stream::spawn_reader(read, ctx.clone(), move |msg| {
            shared.router.route(msg, &*shared)
        })?);

        workers.handles.push(stream::spawn_writer(
            self.writer.clone(),
            self.scheduler.clone(),
            ctx.clone(),
        )?);

        let shared = Arc::clone(self);
        let failed = Arc::clone(self);
        workers.handles.push(datagram::spawn_receiver(
            udp,
            ctx,
            move |msg| shared.router.route(msg, &*shared),
            move || failed.disconnect(),
        )?);

        let out: Arc<dyn Outbound> = self.clone();
        workers.heartbeat = Some(HeartbeatMonitor::start(&self.config, self.link.clone(), out)?);
        Ok(())
    }

    fn disconnect(&self) {
        let was_live = self.link.is_started() || self.link.is_connected();
        self.link.set_started(false);
        self.link.set_connected(false);
        self.link.set_ready(false);

        let workers = self.workers.lock().take();
        self.writer.shutdown();
        if let Some(read) = self.read_stream.lock().as_ref() {
            let _ = read.shutdown(Shutdown::Both);
        }
        self.datagram.close();
        if let Some(workers) = workers {
            workers.stop(self.config.shutdown_join_timeout());
        }

        let frames = self.scheduler.drain();
        let dropped = frames.len();
        for frame in frames {
            frame.complete(Err(ClientError::Disconnected));
        }
        let pending = self.pending.lock().drain();
        for (kind, callback) in pending {
            tracing::debug!(kind = kind.key(), "failing pending request");
            callback(Err(ClientError::Disconnected));
        }

        if was_live {
            tracing::info!(dropped_frames = dropped, "session disconnected");
        }
    }

    fn close_sockets(&self) {
        self.writer.close();
        if let Some(read) = self.read_stream.lock().take() {
            let _ = read.shutdown(Shutdown::Both);
        }
        self.datagram.close();
    }

    fn shutdown_stream_clients(&self) {
        self.disconnect();
        self.close_sockets();
    }

    fn check_started(&self, op: &str) -> Result<()> {
        if !self.link.is_started() {
            tracing::warn!(op, "cannot send: client is not started");
            return Err(ClientError::NotStarted);
        }
        Ok(())
    }

    fn send_reliable(
        &self,
        msg: Message,
        priority: PriorityChannel,
        callback: Option<SendCallback>,
    ) {
        if let Err(e) = self.check_started("send_reliable") {
            if let Some(callback) = callback {
                callback(Err(e));
            }
            return;
        }
        self.scheduler.enqueue(priority, msg, callback);
    }

    fn send_unreliable(&self, msg: Message, callback: Option<SendCallback>) {
        let result = self
            .check_started("send_unreliable")
            .and_then(|()| self.send_datagram(&msg));
        if let Some(callback) = callback {
            callback(result);
        }
    }
}

impl Outbound for Shared {
    fn write_stream_now(&self, msg: &Message) -> Result<()> {
        self.writer.write_message(msg)
    }

    /// A datagram send failure on an open socket means the session is
    /// unusable: force a full disconnect.
    fn send_datagram(&self, msg: &Message) -> Result<()> {
        match self.datagram.send(msg) {
            Ok(()) => Ok(()),
            Err(ClientError::Io(e)) => {
                tracing::error!(error = %e, "datagram send failed, disconnecting");
                self.disconnect();
                Err(ClientError::Io(e))
            }
            Err(e) => Err(e),
        }
    }
}

/// A client session with the relay. See the module comment for the
/// lifecycle.
pub struct Session {
    shared: Arc<Shared>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl Session {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            shared: Arc::new(Shared::new(config)),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    // --- Lifecycle ---

    /// Reset all state and mark the session started. Closes any sockets left
    /// over from a previous connection.
    pub fn init(&self) {
        self.shared.init();
    }

    /// `init`, unless the session is already started.
    pub fn start(&self) -> Result<()> {
        if self.shared.link.is_started() {
            tracing::warn!("client is already started");
            return Err(ClientError::AlreadyStarted);
        }
        self.init();
        Ok(())
    }

    /// `disconnect`, unless the session is not started.
    pub fn stop(&self) -> Result<()> {
        if !self.shared.link.is_started() {
            tracing::warn!("client is not started");
            return Err(ClientError::NotStarted);
        }
        self.disconnect();
        Ok(())
    }

    /// Open the relay connection. `callback` receives the relay's connect
    /// reply (carrying our connection ID), or the error that prevented the
    /// connection.
    pub fn connect<F>(
        &self,
        host: &str,
        send_port: u16,
        read_port: u16,
        udp_port: u16,
        callback: F,
    ) where
        F: FnOnce(Result<Option<Message>>) + Send + 'static,
    {
        self.shared
            .connect(host, send_port, read_port, udp_port, Box::new(callback));
    }

    /// Stop all workers and fail everything in flight with `Disconnected`.
    /// The stream sockets are shut down but kept until
    /// `shutdown_stream_clients`.
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    /// Disconnect and release the stream sockets.
    pub fn shutdown_stream_clients(&self) {
        self.shared.shutdown_stream_clients();
    }

    // --- Sending ---

    /// Queue `msg` on the stream at `priority`. `callback` fires once the
    /// frame is written, or with the reason it never will be.
    pub fn send_reliable(
        &self,
        msg: Message,
        priority: PriorityChannel,
        callback: Option<SendCallback>,
    ) {
        self.shared.send_reliable(msg, priority, callback);
    }

    /// Send `msg` as one datagram right away.
    pub fn send_unreliable(&self, msg: Message, callback: Option<SendCallback>) {
        self.shared.send_unreliable(msg, callback);
    }

    pub fn send_reliable_to_conn(
        &self,
        msg: Message,
        conn: ConnId,
        priority: PriorityChannel,
        callback: Option<SendCallback>,
    ) {
        let msg = directed(msg, Directive::ToConnection(conn));
        self.send_reliable(msg, priority, callback);
    }

    pub fn send_unreliable_to_conn(
        &self,
        msg: Message,
        conn: ConnId,
        callback: Option<SendCallback>,
    ) {
        let msg = directed(msg, Directive::ToConnection(conn));
        self.send_unreliable(msg, callback);
    }

    /// Send to every member of `pool` except this connection.
    pub fn send_reliable_to_others(
        &self,
        msg: Message,
        pool: &str,
        priority: PriorityChannel,
        callback: Option<SendCallback>,
    ) {
        let msg = directed(msg, self.to_others(pool));
        self.send_reliable(msg, priority, callback);
    }

    pub fn send_unreliable_to_others(
        &self,
        msg: Message,
        pool: &str,
        callback: Option<SendCallback>,
    ) {
        let msg = directed(msg, self.to_others(pool));
        self.send_unreliable(msg, callback);
    }

    pub fn send_reliable_to_pool(
        &self,
        msg: Message,
        pool: &str,
        priority: PriorityChannel,
        callback: Option<SendCallback>,
    ) {
        let msg = directed(msg, Directive::ToPool(pool.to_owned()));
        self.send_reliable(msg, priority, callback);
    }

    pub fn send_unreliable_to_pool(
        &self,
        msg: Message,
        pool: &str,
        callback: Option<SendCallback>,
    ) {
        let msg = directed(msg, Directive::ToPool(pool.to_owned()));
        self.send_unreliable(msg, callback);
    }

    pub fn send_reliable_to_pool_master(
        &self,
        msg: Message,
        pool: &str,
        priority: PriorityChannel,
        callback: Option<SendCallback>,
    ) {
        let msg = directed(msg, Directive::ToPoolMaster(pool.to_owned()));
        self.send_reliable(msg, priority, callback);
    }

    fn to_others(&self, pool: &str) -> Directive {
        Directive::ToOthers {
            pool: pool.to_owned(),
            sender: self.conn_id(),
        }
    }

    // --- Mailboxes ---

    /// Pool-master-directed messages are waiting.
    pub fn has_server_messages(&self) -> bool {
        self.shared.mailboxes.server.has_messages()
    }

    pub fn check_for_server_messages(&self) -> Option<Message> {
        self.shared.mailboxes.server.pop()
    }

    /// Pool and broadcast messages are waiting.
    pub fn has_client_messages(&self) -> bool {
        self.shared.mailboxes.pool.has_messages()
    }

    pub fn check_for_client_messages(&self) -> Option<Message> {
        self.shared.mailboxes.pool.pop()
    }

    /// Messages addressed to this connection are waiting.
    pub fn has_conn_messages(&self) -> bool {
        self.shared.mailboxes.conn.has_messages()
    }

    pub fn check_for_conn_messages(&self) -> Option<Message> {
        self.shared.mailboxes.conn.pop()
    }

    // --- Info ---

    pub fn conn_id(&self) -> ConnId {
        self.shared.link.conn_id()
    }

    /// Latest heartbeat round trip in milliseconds; zero before the first
    /// echo.
    pub fn rtt_ms(&self) -> u64 {
        self.shared.link.rtt_ms()
    }

    pub fn is_started(&self) -> bool {
        self.shared.link.is_started()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.link.is_connected()
    }

    /// Whether the stream sockets are still held. `disconnect` shuts them
    /// down but keeps them; `shutdown_stream_clients` releases them.
    pub fn has_stream_clients(&self) -> bool {
        self.shared.writer.is_attached() || self.shared.read_stream.lock().is_some()
    }

    /// The relay confirmed this connection as master of some pool.
    pub fn is_pool_master(&self) -> bool {
        self.shared.link.pool_master().is_some()
    }

    pub fn pool_master_of(&self) -> Option<String> {
        self.shared.link.pool_master()
    }

    /// Name of the primary pool; empty until the relay assigns one.
    pub fn main_pool(&self) -> String {
        self.shared.pools.lock().main_pool().to_owned()
    }

    pub fn all_pools(&self) -> Vec<String> {
        self.shared.pools.lock().all_pools()
    }

    // --- Pool control ---

    pub fn add_to_pool<F>(&self, pool: &str, pool_type: &str, callback: F)
    where
        F: FnOnce(Result<Option<Message>>) + Send + 'static,
    {
        self.shared
            .pool_protocol
            .add_to_pool(pool, pool_type, Box::new(callback));
    }

    pub fn move_to_pool<F>(&self, pool: &str, pool_type: &str, callback: F)
    where
        F: FnOnce(Result<Option<Message>>) + Send + 'static,
    {
        self.shared
            .pool_protocol
            .move_to_pool(pool, pool_type, Box::new(callback));
    }

    pub fn leave_pool<F>(&self, pool: &str, pool_type: &str, callback: F)
    where
        F: FnOnce(Result<Option<Message>>) + Send + 'static,
    {
        self.shared
            .pool_protocol
            .leave_pool(pool, pool_type, Box::new(callback));
    }

    pub fn set_connection_as_pool_master<F>(&self, pool: &str, callback: F)
    where
        F: FnOnce(Result<Option<Message>>) + Send + 'static,
    {
        self.shared
            .pool_protocol
            .set_connection_as_pool_master(pool, Box::new(callback));
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.shutdown_stream_clients();
    }
}

fn directed(mut msg: Message, directive: Directive) -> Message {
    directive.apply(&mut msg);
    msg
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use poolnet_protocol::keys;

    use super::*;

    type Outcome = std::result::Result<(), ClientError>;

    fn capture() -> (SendCallback, mpsc::Receiver<Outcome>) {
        let (tx, rx) = mpsc::channel();
        (
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
            rx,
        )
    }

    #[test]
    fn send_before_start_fails_locally() {
        let session = Session::default();
        let (cb, rx) = capture();
        session.send_reliable(Message::new().with("n", 1), PriorityChannel::Reliable, Some(cb));
        assert!(matches!(rx.try_recv(), Ok(Err(ClientError::NotStarted))));

        let (cb, rx) = capture();
        session.send_unreliable(Message::new().with("n", 1), Some(cb));
        assert!(matches!(rx.try_recv(), Ok(Err(ClientError::NotStarted))));
    }

    #[test]
    fn start_and_stop_guard_their_state() {
        let session = Session::default();
        assert!(matches!(session.stop(), Err(ClientError::NotStarted)));
        session.start().unwrap();
        assert!(session.is_started());
        assert!(matches!(session.start(), Err(ClientError::AlreadyStarted)));
        session.stop().unwrap();
        assert!(!session.is_started());
    }

    #[test]
    fn init_reseeds_pool_table() {
        let session = Session::default();
        session.init();
        assert_eq!(session.main_pool(), "");
        assert_eq!(session.all_pools(), vec![keys::ALL.to_string()]);
        assert!(!session.is_connected());
        assert!(!session.is_pool_master());
    }

    #[test]
    fn connect_requires_start() {
        let session = Session::default();
        let (tx, rx) = mpsc::channel();
        session.connect("127.0.0.1", 1, 2, 3, move |result| {
            let _ = tx.send(result.is_err());
        });
        assert!(rx.try_recv().unwrap());
    }

    #[test]
    fn refused_connect_reports_error_and_stays_disconnected() {
        // Bind then drop to get a port nobody listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let session = Session::default();
        session.init();

        let (tx, rx) = mpsc::channel();
        session.connect("127.0.0.1", port, port, port, move |result| {
            let _ = tx.send(result);
        });

        assert!(matches!(rx.try_recv(), Ok(Err(ClientError::Io(_)))));
        assert!(!session.is_connected());
        assert!(session.is_started());
    }

    #[test]
    fn disconnect_fails_queued_frames() {
        let session = Session::default();
        session.init();
        let (cb, rx) = capture();
        session.send_reliable(Message::new().with("n", 1), PriorityChannel::Reliable, Some(cb));
        assert!(rx.try_recv().is_err());

        session.disconnect();
        assert!(matches!(rx.try_recv(), Ok(Err(ClientError::Disconnected))));
    }

    #[test]
    fn directed_stamps_exactly_one_directive() {
        let msg = Message::new().with(keys::SEND_TO_POOL, "old");
        let msg = directed(msg, Directive::ToConnection(ConnId(3)));
        assert!(!msg.contains_key(keys::SEND_TO_POOL));
        assert_eq!(msg.conn_id(), Some(ConnId(3)));
    }
}
