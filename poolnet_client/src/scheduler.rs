// Priority-scheduled outbound queue for the relay stream.
//
// Four bounded FIFO lanes, one per `PriorityChannel`, drained by a single
// writer loop (`stream::spawn_writer`). Callers on any thread enqueue; the
// writer blocks in `wait_next` until a frame is eligible.
//
// Selection policy, applied on every dequeue:
// - All-cost frames always go first and never touch the starvation budget.
// - State-update frames are eligible while budget > `state_update_threshold`.
// - Reliable frames are eligible while budget > `reliable_threshold`.
// - Each state-update or reliable frame served spends one unit of budget.
// - Unreliable frames are served when no higher eligible lane has frames;
//   serving one refills the budget.
// - If frames exist only in lanes gated by the budget, or every lane is
//   empty, the budget refills.
//
// With the default budget of 8 and thresholds 5/3 a saturated mix drains as
// SU SU SU R R U, repeating, so no lane waits forever while all-cost is idle.
//
// Frames are encoded at enqueue time so the writer only copies bytes.
// Callbacks are never run while the queue lock is held.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use poolnet_protocol::{EncodedFrame, Message, PriorityChannel, encode_frame};

use crate::config::{ClientConfig, OverflowPolicy};
use crate::error::ClientError;
use crate::pending::SendCallback;

/// A message waiting in a send queue, already encoded for the wire.
pub struct OutboundFrame {
    pub message: Message,
    pub encoded: EncodedFrame,
    pub callback: Option<SendCallback>,
}

impl OutboundFrame {
    /// Fire the completion callback, if there is one.
    pub fn complete(self, result: Result<(), ClientError>) {
        if let Some(callback) = self.callback {
            callback(result);
        }
    }
}

impl std::fmt::Debug for OutboundFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundFrame")
            .field("header", &self.encoded.header)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Queue bounds and starvation thresholds, taken from `ClientConfig`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulerPolicy {
    pub capacity: usize,
    pub overflow: OverflowPolicy,
    pub initial_budget: u32,
    pub state_update_threshold: u32,
    pub reliable_threshold: u32,
}

impl From<&ClientConfig> for SchedulerPolicy {
    fn from(config: &ClientConfig) -> Self {
        Self {
            capacity: config.queue_capacity.max(1),
            overflow: config.overflow_policy,
            initial_budget: config.initial_starvation_budget,
            state_update_threshold: config.state_update_threshold,
            reliable_threshold: config.reliable_threshold,
        }
    }
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

struct Lanes {
    queues: [VecDeque<OutboundFrame>; 4],
    budget: u32,
}

impl Lanes {
    fn pop(&mut self, channel: PriorityChannel) -> Option<OutboundFrame> {
        self.queues[channel.index()].pop_front()
    }

    fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }
}

pub struct SendScheduler {
    lanes: Mutex<Lanes>,
    available: Condvar,
    policy: SchedulerPolicy,
}

impl SendScheduler {
    pub fn new(policy: SchedulerPolicy) -> Self {
        Self {
            lanes: Mutex::new(Lanes {
                queues: std::array::from_fn(|_| VecDeque::with_capacity(policy.capacity)),
                budget: policy.initial_budget,
            }),
            available: Condvar::new(),
            policy,
        }
    }

    pub fn policy(&self) -> SchedulerPolicy {
        self.policy
    }

    /// Queue `message` on `channel`. Never blocks on a full queue: depending
    /// on the overflow policy either this frame or the oldest queued one is
    /// dropped, and the dropped frame's callback reports `QueueFull`.
    pub fn enqueue(
        &self,
        channel: PriorityChannel,
        message: Message,
        callback: Option<SendCallback>,
    ) {
        let encoded = match encode_frame(&message) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!(%channel, error = %e, "cannot encode outbound message");
                if let Some(callback) = callback {
                    callback(Err(e.into()));
                }
                return;
            }
        };
        let frame = OutboundFrame {
            message,
            encoded,
            callback,
        };

        let dropped = {
            let mut lanes = self.lanes.lock();
            let queue = &mut lanes.queues[channel.index()];
            if queue.len() < self.policy.capacity {
                queue.push_back(frame);
                None
            } else {
                match self.policy.overflow {
                    OverflowPolicy::Reject => Some(frame),
                    OverflowPolicy::DropOldest => {
                        let oldest = queue.pop_front();
                        queue.push_back(frame);
                        oldest
                    }
                }
            }
        };
        self.available.notify_one();

        if let Some(dropped) = dropped {
            tracing::warn!(%channel, "send queue full, dropping frame");
            dropped.complete(Err(ClientError::QueueFull(channel)));
        }
    }

    /// Dequeue the next frame by policy without blocking.
    pub fn try_next(&self) -> Option<(PriorityChannel, OutboundFrame)> {
        let mut lanes = self.lanes.lock();
        self.select(&mut lanes)
    }

    /// Dequeue the next frame, waiting up to `timeout` for one to arrive.
    pub fn wait_next(&self, timeout: Duration) -> Option<(PriorityChannel, OutboundFrame)> {
        let mut lanes = self.lanes.lock();
        if let Some(next) = self.select(&mut lanes) {
            return Some(next);
        }
        self.available.wait_for(&mut lanes, timeout);
        self.select(&mut lanes)
    }

    fn select(&self, lanes: &mut Lanes) -> Option<(PriorityChannel, OutboundFrame)> {
        let policy = &self.policy;

        if let Some(frame) = lanes.pop(PriorityChannel::AllCost) {
            return Some((PriorityChannel::AllCost, frame));
        }

        let gated = [
            (PriorityChannel::StateUpdate, policy.state_update_threshold),
            (PriorityChannel::Reliable, policy.reliable_threshold),
        ];
        for (channel, threshold) in gated {
            if lanes.budget > threshold
                && let Some(frame) = lanes.pop(channel)
            {
                lanes.budget = lanes.budget.saturating_sub(1);
                return Some((channel, frame));
            }
        }

        lanes.budget = policy.initial_budget;

        if let Some(frame) = lanes.pop(PriorityChannel::Unreliable) {
            return Some((PriorityChannel::Unreliable, frame));
        }

        // Only budget-gated lanes have frames left; serve them anyway now
        // that the budget is refilled.
        for (channel, _) in gated {
            if let Some(frame) = lanes.pop(channel) {
                lanes.budget = lanes.budget.saturating_sub(1);
                return Some((channel, frame));
            }
        }
        None
    }

    /// Remove every queued frame without sending it.
    pub fn drain(&self) -> Vec<OutboundFrame> {
        let mut lanes = self.lanes.lock();
        lanes.budget = self.policy.initial_budget;
        lanes.queues.iter_mut().flat_map(|q| q.drain(..)).collect()
    }

    pub fn len(&self, channel: PriorityChannel) -> usize {
        self.lanes.lock().queues[channel.index()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.lock().is_empty()
    }

    /// Current starvation budget.
    pub fn budget(&self) -> u32 {
        self.lanes.lock().budget
    }
}
