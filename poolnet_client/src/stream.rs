// Reliable stream I/O: the send socket's writer and both stream loops.
//
// The relay uses two TCP connections per client: one we write frames to and
// one we read frames from.
//
// - `StreamWriter` owns the send socket behind a mutex. A frame's header and
//   payload are written and flushed under one lock, so the writer loop and
//   the router's immediate registration write never interleave. A separate
//   control handle lets `shutdown` unblock a stuck write without waiting for
//   the lock.
// - The read loop asks the `FrameDecoder` how many bytes it needs, reads at
//   most that many, and feeds the result straight back. Exactly one read is
//   outstanding at a time, so reads never overflow the decoder's target.
//   The socket's read timeout (the worker poll interval) bounds how long the
//   loop can miss cancellation.
// - The write loop holds off until the connection-ID registration has gone
//   out (`ready`), then drains the `SendScheduler` one frame at a time.
//
// Either loop hitting EOF or an I/O error marks the session not connected
// and exits. Errors after cancellation are expected (disconnect shuts the
// sockets down underneath the loops) and only end the loop.

use std::io::{self, BufWriter, ErrorKind, Read};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use poolnet_protocol::{
    EncodedFrame, FrameDecoder, HEADER_PROBE_LEN, MAX_PAYLOAD_LEN, Message, StepOutcome,
    encode_frame, write_frame,
};

use crate::error::{ClientError, Result};
use crate::scheduler::SendScheduler;
use crate::state::WorkerContext;

/// Longest the write loop sleeps between checks of the ready flag.
const READY_BACKOFF: Duration = Duration::from_millis(5);

#[derive(Debug, Default)]
pub struct StreamWriter {
    writer: Mutex<Option<BufWriter<TcpStream>>>,
    control: Mutex<Option<TcpStream>>,
}

impl StreamWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a freshly connected send socket, replacing any previous one.
    pub fn attach(&self, stream: TcpStream) -> io::Result<()> {
        let control = stream.try_clone()?;
        *self.writer.lock() = Some(BufWriter::new(stream));
        *self.control.lock() = Some(control);
        Ok(())
    }

    pub fn is_attached(&self) -> bool {
        self.control.lock().is_some()
    }

    /// Write one frame atomically with respect to other writers.
    pub fn write_frame(&self, frame: &EncodedFrame) -> Result<()> {
        let mut writer = self.writer.lock();
        let writer = writer.as_mut().ok_or(ClientError::NotConnected)?;
        write_frame(writer, frame)?;
        Ok(())
    }

    pub fn write_message(&self, msg: &Message) -> Result<()> {
        let frame = encode_frame(msg)?;
        self.write_frame(&frame)
    }

    /// Shut the socket down in both directions but keep it installed.
    /// Unblocks a write in progress on another thread.
    pub fn shutdown(&self) {
        if let Some(control) = self.control.lock().as_ref() {
            let _ = control.shutdown(Shutdown::Both);
        }
    }

    /// Shut down and release the socket.
    pub fn close(&self) {
        self.shutdown();
        self.control.lock().take();
        self.writer.lock().take();
    }
}

/// Spawn the stream read loop. Every decoded message is handed to
/// `on_message` on the loop's thread.
pub fn spawn_reader<F>(
    stream: TcpStream,
    ctx: WorkerContext,
    on_message: F,
) -> io::Result<JoinHandle<()>>
where
    F: FnMut(Message) + Send + 'static,
{
    stream.set_read_timeout(Some(ctx.poll))?;
    thread::Builder::new()
        .name("poolnet-stream-read".into())
        .spawn(move || {
            let span = tracing::debug_span!("stream_read");
            let _enter = span.enter();
            read_loop(stream, &ctx, on_message);
        })
}

fn read_loop<R: Read>(mut stream: R, ctx: &WorkerContext, mut on_message: impl FnMut(Message)) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; MAX_PAYLOAD_LEN.max(HEADER_PROBE_LEN)];

    while !ctx.is_cancelled() {
        let want = decoder.remaining().min(buf.len());
        match stream.read(&mut buf[..want]) {
            Ok(0) => {
                if !ctx.is_cancelled() {
                    tracing::warn!("relay closed the read stream");
                    ctx.link.set_connected(false);
                }
                break;
            }
            Ok(n) => match decoder.step(&buf[..n]) {
                StepOutcome::Pending => {}
                StepOutcome::Message(msg) => {
                    tracing::debug!(%msg, "stream message");
                    on_message(msg);
                }
                StepOutcome::Discarded(e) => tracing::warn!(error = %e, "discarding frame"),
            },
            Err(e) if is_poll_timeout(&e) => {}
            Err(e) => {
                if !ctx.is_cancelled() {
                    tracing::error!(error = %e, "stream read failed");
                    ctx.link.set_connected(false);
                }
                break;
            }
        }
    }
    tracing::debug!("stream read loop exited");
}

/// Spawn the stream write loop draining `scheduler` into `writer`.
pub fn spawn_writer(
    writer: Arc<StreamWriter>,
    scheduler: Arc<SendScheduler>,
    ctx: WorkerContext,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("poolnet-stream-write".into())
        .spawn(move || {
            let span = tracing::debug_span!("stream_write");
            let _enter = span.enter();
            write_loop(&writer, &scheduler, &ctx);
        })
}

fn write_loop(writer: &StreamWriter, scheduler: &SendScheduler, ctx: &WorkerContext) {
    while !ctx.is_cancelled() {
        if !ctx.link.is_ready() {
            thread::sleep(READY_BACKOFF.min(ctx.poll));
            continue;
        }
        let Some((channel, frame)) = scheduler.wait_next(ctx.poll) else {
            continue;
        };
        if ctx.is_cancelled() {
            frame.complete(Err(ClientError::Disconnected));
            break;
        }

        match writer.write_frame(&frame.encoded) {
            Ok(()) => {
                tracing::debug!(%channel, bytes = frame.encoded.wire_len(), "frame sent");
                frame.complete(Ok(()));
            }
            Err(e) => {
                if !ctx.is_cancelled() {
                    tracing::error!(%channel, error = %e, "stream write failed");
                    ctx.link.set_connected(false);
                }
                frame.complete(Err(e));
                break;
            }
        }
    }
    tracing::debug!("stream write loop exited");
}

/// Read timeouts surface as `WouldBlock` on Unix and `TimedOut` on Windows.
pub(crate) fn is_poll_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
    )
}
