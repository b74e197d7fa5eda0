// poolnet_client: session engine for the poolnet message relay.
//
// A `Session` multiplexes application messages over two TCP streams (one we
// write, one we read) and one UDP socket to a relay server, enrolls the
// connection in named pools, and sorts inbound traffic into three mailboxes
// the application polls. Wire vocabulary and framing live in
// `poolnet_protocol`.
//
// Module overview:
// - `session.rs`:   `Session`, the public API: lifecycle, sends, mailbox
//                   polling, info accessors, pool control. Owns the state
//                   below and the worker threads.
// - `scheduler.rs`: `SendScheduler`, four bounded priority lanes with a
//                   starvation budget, drained by the stream write loop.
// - `stream.rs`:    `StreamWriter` plus the stream read and write loops.
// - `datagram.rs`:  `DatagramChannel` and the datagram receive loop.
// - `router.rs`:    `MessageRouter`, which applies control replies and
//                   delivers routed messages to mailboxes.
// - `pools.rs`:     `PoolTable` and `PoolProtocol` (add/move/leave/master).
// - `pending.rs`:   control requests awaiting a reply, one per kind.
// - `heartbeat.rs`: ping and liveness timers.
// - `mailbox.rs`:   the three inbound mailboxes.
// - `state.rs`:     `LinkState` flags and counters, `WorkerContext`.
// - `config.rs`:    `ClientConfig`.
// - `error.rs`:     `ClientError`.
//
// Threading: three worker threads per connection (stream read, stream
// write, datagram receive) plus two timer threads, all plain `std::thread`.
// Cancellation is cooperative: `disconnect` raises a flag and shuts the
// sockets down; socket read timeouts bound how long a loop can miss it.
//
// Completion: every callback handed to the API fires exactly once, on
// success, failure, supersession or teardown.
//
// The library logs through `tracing` and never installs a subscriber.

pub mod config;
pub mod datagram;
pub mod error;
pub mod heartbeat;
pub mod mailbox;
pub mod pending;
pub mod pools;
pub mod router;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod stream;

pub use config::{ClientConfig, OverflowPolicy};
pub use error::{ClientError, Result};
pub use pending::{ReplyCallback, SendCallback};
pub use session::Session;

pub use poolnet_protocol::{ConnId, Message, PriorityChannel};
