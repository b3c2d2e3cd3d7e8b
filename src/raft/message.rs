use super::{Entry, Index, NodeID, Term};
use crate::error::Result;

use serde_derive::{Deserialize, Serialize};

/// The broadcast address, also used as the leader field when no leader is
/// known. All replicas process messages addressed to it.
pub const BROADCAST: &str = "FFFF";

/// A client-chosen message ID, echoed in responses. Clients reuse the MID
/// when retrying a request, which lets the leader suppress duplicates.
pub type RequestID = String;

/// A message envelope, exchanged as one JSON-encoded record per datagram.
/// Every message carries the sender, the recipient (possibly broadcast), and
/// the sender's current notion of the leader, so clients always learn where
/// to retry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The sender.
    pub src: NodeID,
    /// The recipient, or FFFF for broadcast.
    pub dst: NodeID,
    /// The sender's current leader, or FFFF if unknown.
    pub leader: NodeID,
    /// The message payload, tagged by "type" on the wire.
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    /// Decodes an envelope from a JSON datagram.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(frame)?)
    }

    /// Encodes the envelope as a JSON datagram.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Returns true if the envelope should be processed by the given node,
    /// i.e. it is addressed to it or broadcast.
    pub fn addressed_to(&self, id: &str) -> bool {
        self.dst == id || self.dst == BROADCAST
    }
}

/// A message payload. Replica-to-replica messages carry the sender's term;
/// client messages and responses do not.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Announces a replica to the cluster on startup.
    Hello,

    /// A client read of a key. The leader responds with Ok and the value,
    /// non-leaders eventually respond with Redirect.
    Get {
        #[serde(rename = "MID")]
        mid: RequestID,
        key: String,
    },

    /// A client write of a key. The leader acknowledges with Ok once the
    /// write is committed, non-leaders eventually respond with Redirect.
    Put {
        #[serde(rename = "MID")]
        mid: RequestID,
        key: String,
        value: String,
    },

    /// A successful response. Carries a value for reads, none for writes.
    Ok {
        #[serde(rename = "MID")]
        mid: RequestID,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },

    /// A failed request. The client should retry.
    Fail {
        #[serde(rename = "MID")]
        mid: RequestID,
    },

    /// A deflected request. The client should retry with the leader named in
    /// the envelope.
    Redirect {
        #[serde(rename = "MID")]
        mid: RequestID,
    },

    /// A candidate solicits votes from all peers, describing its log tail so
    /// voters can refuse out-of-date candidates.
    #[serde(rename_all = "camelCase")]
    Candidacy { term: Term, last_index: Index, last_term: Term },

    /// Grants a vote to a candidate. The value is the voter's last log
    /// index, which primes the future leader's match index tracking.
    Vote { term: Term, value: Index },

    /// Replicates log entries to a follower. Empty entries are a heartbeat.
    #[serde(rename = "AppendEntries", rename_all = "camelCase")]
    AppendEntries {
        term: Term,
        prev_log_index: Index,
        prev_log_term: Term,
        entries: Vec<Entry>,
        leader_commit: Index,
    },

    /// A follower accepted entries. The value is the follower's resulting
    /// last log index.
    Agree { term: Term, value: Index },

    /// A follower failed the AppendEntries consistency check and requests
    /// catch-up. The value is the follower's commit index.
    InduceMe { value: Index },
}

impl Message {
    /// Returns the term carried by the message, if any. Client messages,
    /// responses, and catch-up requests are termless.
    pub fn term(&self) -> Option<Term> {
        match self {
            Message::Candidacy { term, .. }
            | Message::Vote { term, .. }
            | Message::AppendEntries { term, .. }
            | Message::Agree { term, .. } => Some(*term),
            Message::Hello
            | Message::Get { .. }
            | Message::Put { .. }
            | Message::Ok { .. }
            | Message::Fail { .. }
            | Message::Redirect { .. }
            | Message::InduceMe { .. } => None,
        }
    }
}
