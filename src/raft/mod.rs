//! The consensus core: a single-leader replicated log in the Raft family,
//! providing a linearizable key/value register per key to external clients.
//! See the Raft paper for the general algorithm: "In Search of an
//! Understandable Consensus Algorithm" (Ongaro and Ousterhout, 2014).

mod log;
mod message;
mod node;
mod state;

pub use self::log::{Command, Entry, Index, Log};
pub use message::{Envelope, Message, RequestID, BROADCAST};
pub use node::{Node, NodeID, Options, Status, Term};
pub use state::{KvState, State};

use std::time::Duration;

/// The base election timeout T. Actual timeouts are drawn uniformly from
/// [T, 2T) to avoid repeated split votes.
pub const ELECTION_TIMEOUT: Duration = Duration::from_millis(150);

/// The interval between leader heartbeats (T/2).
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(75);

/// How long a leader will go without commit progress before it assumes it
/// has lost its quorum and steps down (2T).
pub const PROGRESS_TIMEOUT: Duration = Duration::from_millis(300);

/// The interval between deferred redirect flushes (2T).
pub const REDIRECT_FLUSH_INTERVAL: Duration = Duration::from_millis(300);

/// The redirect queue size beyond which the queue is flushed immediately.
pub const REDIRECT_QUEUE_LIMIT: usize = 10;

/// The maximum number of entries in a single AppendEntries message. Larger
/// backlogs are sent as successive windows, which bounds the datagram size
/// and pipelines catch-up.
pub const MAX_APPEND_ENTRIES: usize = 50;
