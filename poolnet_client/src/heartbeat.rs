// Datagram heartbeat and liveness detection.
//
// Two independent timers run while connected:
// - ping: every `ping_interval`, if the session is connected and ready to
//   send, a heartbeat datagram carrying the current epoch-millis timestamp
//   and our connection ID goes to the relay, which echoes it back. The
//   router turns the echo into an RTT sample and a fresh last-heartbeat.
// - liveness (optional): every `liveness_check_interval`, if no echo has
//   arrived within `liveness_grace`, the session is marked not connected.
//
// `Timer` is a named thread that sleeps on an mpsc `recv_timeout`. Dropping
// the sender wakes it immediately, so stopping is synchronous and never
// waits out a full interval.

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use poolnet_protocol::Message;

use crate::config::ClientConfig;
use crate::router::Outbound;
use crate::state::LinkState;

/// Milliseconds since the UNIX epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Round trip for a heartbeat sent at `sent_ms` and echoed at `now_ms`.
/// Clock steps backwards clamp to zero.
pub fn round_trip_ms(sent_ms: u64, now_ms: u64) -> u64 {
    now_ms.saturating_sub(sent_ms)
}

/// True when nothing has been heard since `last` for longer than `grace`.
pub fn liveness_expired(last: Instant, now: Instant, grace: Duration) -> bool {
    now.saturating_duration_since(last) > grace
}

/// A periodic callback on its own thread.
pub struct Timer {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    pub fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let span_name = name.to_owned();
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let span = tracing::debug_span!("timer", name = %span_name);
                let _enter = span.enter();
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => tick(),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::debug!("timer stopped");
            })?;
        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop the timer and wait for an in-progress tick to finish. Safe to
    /// call from the timer's own tick.
    pub fn stop(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take()
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The ping timer and the optional liveness timer.
pub struct HeartbeatMonitor {
    ping: Timer,
    liveness: Option<Timer>,
}

impl HeartbeatMonitor {
    pub fn start(
        config: &ClientConfig,
        link: Arc<LinkState>,
        out: Arc<dyn Outbound>,
    ) -> std::io::Result<Self> {
        let ping_link = link.clone();
        let ping = Timer::spawn("poolnet-ping", config.ping_interval(), move || {
            send_ping(&ping_link, out.as_ref());
        })?;

        let liveness = if config.liveness_timeout_enabled {
            let grace = config.liveness_grace();
            Some(Timer::spawn(
                "poolnet-liveness",
                config.liveness_check_interval(),
                move || check_liveness(&link, grace),
            )?)
        } else {
            None
        };

        Ok(Self { ping, liveness })
    }

    pub fn stop(&mut self) {
        self.ping.stop();
        if let Some(liveness) = self.liveness.as_mut() {
            liveness.stop();
        }
    }
}

fn send_ping(link: &LinkState, out: &dyn Outbound) {
    if !link.is_connected() || !link.is_ready() {
        return;
    }
    let ping = Message::ping(link.conn_id(), now_millis());
    if let Err(e) = out.send_datagram(&ping) {
        tracing::error!(error = %e, "heartbeat send failed");
    }
}

fn check_liveness(link: &LinkState, grace: Duration) {
    if !link.is_connected() {
        return;
    }
    if liveness_expired(link.last_heartbeat(), Instant::now(), grace) {
        tracing::warn!(
            grace_ms = grace.as_millis() as u64,
            "no heartbeat echo within grace period, marking disconnected"
        );
        link.set_connected(false);
    }
}
