// Unreliable datagram channel to the relay.
//
// One UDP socket per session, bound to an ephemeral local port in the relay
// address's family and `connect`ed to the relay so `send`/`recv` only talk to
// it. A datagram carries exactly one unframed JSON object.
//
// The receive loop hands every parsed message to the router. A datagram that
// fails to parse is noise: logged and dropped. Any other socket error while
// not cancelled means the session is unusable, so the loop calls its failure
// hook (the session wires that to a full disconnect) and exits.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::RwLock;
use poolnet_protocol::Message;

use crate::error::{ClientError, Result};
use crate::state::WorkerContext;
use crate::stream::is_poll_timeout;

/// Largest datagram we accept.
const RECV_BUFFER_LEN: usize = 65_536;

#[derive(Debug, Default)]
pub struct DatagramChannel {
    socket: RwLock<Option<Arc<UdpSocket>>>,
}

impl DatagramChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a fresh socket and connect it to `relay`. Returns a handle for the
    /// receive loop.
    pub fn open(&self, relay: SocketAddr, ctx: &WorkerContext) -> io::Result<Arc<UdpSocket>> {
        let local: SocketAddr = match relay {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(relay)?;
        socket.set_read_timeout(Some(ctx.poll))?;
        let socket = Arc::new(socket);
        *self.socket.write() = Some(socket.clone());
        tracing::debug!(%relay, local = ?socket.local_addr().ok(), "datagram socket open");
        Ok(socket)
    }

    pub fn is_open(&self) -> bool {
        self.socket.read().is_some()
    }

    /// Send one message as a single datagram.
    pub fn send(&self, msg: &Message) -> Result<()> {
        let bytes = msg.to_json_bytes()?;
        let socket = self.socket.read();
        let socket = socket.as_ref().ok_or(ClientError::NotConnected)?;
        socket.send(&bytes)?;
        Ok(())
    }

    /// Release the socket. The receive loop keeps its own handle until it
    /// notices cancellation.
    pub fn close(&self) {
        self.socket.write().take();
    }
}

/// Spawn the datagram receive loop.
pub fn spawn_receiver<F, E>(
    socket: Arc<UdpSocket>,
    ctx: WorkerContext,
    on_message: F,
    on_failure: E,
) -> io::Result<JoinHandle<()>>
where
    F: FnMut(Message) + Send + 'static,
    E: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name("poolnet-datagram".into())
        .spawn(move || {
            let span = tracing::debug_span!("datagram_recv");
            let _enter = span.enter();
            recv_loop(&socket, &ctx, on_message, on_failure);
        })
}

fn recv_loop(
    socket: &UdpSocket,
    ctx: &WorkerContext,
    mut on_message: impl FnMut(Message),
    on_failure: impl FnOnce(),
) {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    while !ctx.is_cancelled() {
        match socket.recv(&mut buf) {
            Ok(n) => match Message::from_json_slice(&buf[..n]) {
                Ok(msg) => {
                    tracing::trace!(%msg, "datagram");
                    on_message(msg);
                }
                Err(e) => tracing::warn!(error = %e, bytes = n, "discarding datagram"),
            },
            Err(e) if is_poll_timeout(&e) => {}
            Err(e) => {
                if !ctx.is_cancelled() {
                    tracing::error!(error = %e, "datagram receive failed");
                    on_failure();
                }
                break;
            }
        }
    }
    tracing::debug!("datagram loop exited");
}
