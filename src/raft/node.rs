use super::log::{Command, Index, Log};
use super::message::{Envelope, Message, RequestID, BROADCAST};
use super::state::State;
use crate::error::Result;

use itertools::Itertools as _;
use log::{debug, info};
use rand::Rng as _;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// A node ID: a short stable identifier. FFFF is reserved for broadcast.
pub type NodeID = String;

/// A leader term. Terms increase monotonically across the cluster, and
/// every replica-to-replica message carries the sender's term.
pub type Term = u64;

/// Raft node options, primarily timing and batching parameters. Tests use
/// these to control election order and to disable the progress watchdog.
#[derive(Clone, Debug)]
pub struct Options {
    /// The range of randomized election timeouts.
    pub election_timeout: std::ops::Range<Duration>,
    /// The interval between leader heartbeats.
    pub heartbeat_interval: Duration,
    /// How long a leader tolerates no commit progress before it assumes it
    /// has lost its quorum and steps down.
    pub progress_timeout: Duration,
    /// The interval between deferred redirect flushes.
    pub redirect_flush_interval: Duration,
    /// The redirect queue size beyond which the queue flushes immediately.
    pub redirect_queue_limit: usize,
    /// Maximum number of entries per AppendEntries message.
    pub max_append_entries: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            election_timeout: super::ELECTION_TIMEOUT..super::ELECTION_TIMEOUT * 2,
            heartbeat_interval: super::HEARTBEAT_INTERVAL,
            progress_timeout: super::PROGRESS_TIMEOUT,
            redirect_flush_interval: super::REDIRECT_FLUSH_INTERVAL,
            redirect_queue_limit: super::REDIRECT_QUEUE_LIMIT,
            max_append_entries: super::MAX_APPEND_ENTRIES,
        }
    }
}

/// A snapshot of a node's externally observable Raft state.
#[derive(Clone, Debug, PartialEq)]
pub struct Status {
    /// The node's current leader, or FFFF if unknown.
    pub leader: NodeID,
    /// The node's current term.
    pub term: Term,
    /// The last log index, or -1 if the log is empty.
    pub last_index: Index,
    /// The last log term, or 0 if the log is empty.
    pub last_term: Term,
    /// The commit index, or -1 if nothing is committed.
    pub commit_index: Index,
    /// The applied index, or -1 if nothing is applied.
    pub applied_index: Index,
}

/// A Raft node, with a dynamic role. The node is driven synchronously by
/// processing inbound messages via step() and by the passage of time via
/// tick(). These methods consume the current node and return a new one with
/// a possibly different role. Outbound messages are sent via the given
/// node_tx channel, and the caller supplies the current monotonic time, so
/// the node itself never reads the clock.
///
/// This enum wraps the RawNode<Role> types, which implement the actual node
/// logic. It exists for ergonomic use across role transitions, i.e.
/// node = node.step()?.
pub enum Node {
    Candidate(RawNode<Candidate>),
    Follower(RawNode<Follower>),
    Leader(RawNode<Leader>),
}

impl Node {
    /// Creates a new Raft node, starting as a leaderless follower, or as
    /// leader if there are no peers.
    pub fn new(
        id: NodeID,
        peers: HashSet<NodeID>,
        log: Log,
        state: Box<dyn State>,
        node_tx: crossbeam::channel::Sender<Envelope>,
        opts: Options,
        now: Instant,
    ) -> Result<Self> {
        assert_ne!(id, BROADCAST, "node ID can't be the broadcast address");
        assert!(!peers.contains(&id), "peers can't contain the local node");
        let node = RawNode::new(id, peers, log, state, node_tx, opts, now);
        if node.peers.is_empty() {
            // If there are no peers, become leader immediately.
            return Ok(node.into_candidate(now)?.into_leader(now)?.into());
        }
        Ok(node.into())
    }

    /// Returns the node ID.
    pub fn id(&self) -> &NodeID {
        match self {
            Node::Candidate(n) => &n.id,
            Node::Follower(n) => &n.id,
            Node::Leader(n) => &n.id,
        }
    }

    /// Returns the node's current term.
    pub fn term(&self) -> Term {
        match self {
            Node::Candidate(n) => n.term(),
            Node::Follower(n) => n.term(),
            Node::Leader(n) => n.term(),
        }
    }

    /// Returns true if the node is the cluster leader.
    pub fn is_leader(&self) -> bool {
        matches!(self, Node::Leader(_))
    }

    /// Returns the node's observable status.
    pub fn status(&self) -> Status {
        match self {
            Node::Candidate(n) => n.status(),
            Node::Follower(n) => n.status(),
            Node::Leader(n) => n.status(),
        }
    }

    /// Reads a key from the node's applied state. Clients should go through
    /// the leader via get messages; this is for local observability.
    pub fn read(&self, key: &str) -> Option<String> {
        match self {
            Node::Candidate(n) => n.state.read(key),
            Node::Follower(n) => n.state.read(key),
            Node::Leader(n) => n.state.read(key),
        }
    }

    /// Processes an inbound message.
    pub fn step(self, msg: Envelope, now: Instant) -> Result<Self> {
        debug!("Stepping {msg:?}");
        match self {
            Node::Candidate(n) => n.step(msg, now),
            Node::Follower(n) => n.step(msg, now),
            Node::Leader(n) => n.step(msg, now),
        }
    }

    /// Moves time forward, firing any elapsed timers.
    pub fn tick(self, now: Instant) -> Result<Self> {
        match self {
            Node::Candidate(n) => n.tick(now),
            Node::Follower(n) => n.tick(now),
            Node::Leader(n) => n.tick(now),
        }
    }
}

impl From<RawNode<Candidate>> for Node {
    fn from(n: RawNode<Candidate>) -> Self {
        Node::Candidate(n)
    }
}

impl From<RawNode<Follower>> for Node {
    fn from(n: RawNode<Follower>) -> Self {
        Node::Follower(n)
    }
}

impl From<RawNode<Leader>> for Node {
    fn from(n: RawNode<Leader>) -> Self {
        Node::Leader(n)
    }
}

/// A Raft role: leader, follower, or candidate.
pub trait Role {
    /// Returns the role's current leader for the envelope leader field, or
    /// FFFF if unknown.
    fn leader_hint<'a>(&'a self, id: &'a NodeID) -> &'a str;
}

/// A Raft node with the concrete role R.
///
/// This implements the typestate pattern, where individual node states
/// (roles) are encoded as RawNode<Role>.
pub struct RawNode<R: Role = Follower> {
    id: NodeID,
    peers: HashSet<NodeID>,
    log: Log,
    state: Box<dyn State>,
    node_tx: crossbeam::channel::Sender<Envelope>,
    opts: Options,
    /// Client requests buffered for deferred redirect, as (client, MID)
    /// pairs. Only used while not leader, but kept across role transitions
    /// so pending work survives elections.
    redirects: VecDeque<(NodeID, RequestID)>,
    /// When the redirect queue is next flushed.
    redirect_deadline: Instant,
    role: R,
}

impl<R: Role> RawNode<R> {
    /// Helper for role transitions.
    fn into_role<T: Role>(self, role: T) -> RawNode<T> {
        RawNode {
            id: self.id,
            peers: self.peers,
            log: self.log,
            state: self.state,
            node_tx: self.node_tx,
            opts: self.opts,
            redirects: self.redirects,
            redirect_deadline: self.redirect_deadline,
            role,
        }
    }

    /// Returns the node's current term.
    fn term(&self) -> Term {
        self.log.term()
    }

    /// Returns the cluster size as number of nodes.
    fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Returns the cluster quorum size: strictly more than half of the full
    /// cluster, counting the local node.
    fn quorum_size(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Returns the quorum value of the given unsorted vector, in descending
    /// order. The vector must have the same size as the cluster.
    fn quorum_value<T: Ord + Copy>(&self, mut values: Vec<T>) -> T {
        assert_eq!(values.len(), self.cluster_size(), "vector size must match cluster size");
        *values.select_nth_unstable_by(self.quorum_size() - 1, |a, b: &T| a.cmp(b).reverse()).1
    }

    /// Sends a message to the given recipient, stamping the envelope with
    /// our current leader so clients learn where to retry.
    fn send(&self, to: &str, message: Message) -> Result<()> {
        let envelope = Envelope {
            src: self.id.clone(),
            dst: to.to_string(),
            leader: self.role.leader_hint(&self.id).to_string(),
            message,
        };
        debug!("Sending {envelope:?}");
        Ok(self.node_tx.send(envelope)?)
    }

    /// Broadcasts a message to all peers via the broadcast address.
    fn broadcast(&self, message: Message) -> Result<()> {
        self.send(BROADCAST, message)
    }

    /// Generates a randomized election deadline.
    fn gen_election_deadline(&self, now: Instant) -> Instant {
        now + rand::thread_rng().gen_range(self.opts.election_timeout.clone())
    }

    /// Applies any committed but unapplied entries to the state machine.
    fn maybe_apply(&mut self) {
        while self.state.applied_index() < self.log.commit_index() {
            let index = self.state.applied_index() + 1;
            let entry = self.log.get(index).expect("missing committed entry");
            debug!("Applying entry {index}");
            self.state.apply(index, entry);
        }
    }

    /// Queues a client request for deferred redirect, flushing the queue if
    /// it exceeds the size limit.
    fn enqueue_redirect(&mut self, client: NodeID, mid: RequestID, now: Instant) -> Result<()> {
        self.redirects.push_back((client, mid));
        if self.redirects.len() > self.opts.redirect_queue_limit {
            self.flush_redirects(now)?;
        }
        Ok(())
    }

    /// Flushes the redirect queue, deflecting each buffered client request.
    /// Batching redirects dampens client thrashing during leader churn.
    fn flush_redirects(&mut self, now: Instant) -> Result<()> {
        for (client, mid) in std::mem::take(&mut self.redirects) {
            self.send(&client, Message::Redirect { mid })?;
        }
        self.redirect_deadline = now + self.opts.redirect_flush_interval;
        Ok(())
    }

    /// Flushes the redirect queue if the flush interval has elapsed.
    fn maybe_flush_redirects(&mut self, now: Instant) -> Result<()> {
        if now >= self.redirect_deadline {
            self.flush_redirects(now)?;
        }
        Ok(())
    }

    /// Returns the node's observable status.
    fn status(&self) -> Status {
        Status {
            leader: self.role.leader_hint(&self.id).to_string(),
            term: self.term(),
            last_index: self.log.last_index(),
            last_term: self.log.last_term(),
            commit_index: self.log.commit_index(),
            applied_index: self.state.applied_index(),
        }
    }
}

/// A candidate is campaigning to become leader.
pub struct Candidate {
    /// Votes received this term, including our own.
    votes: HashSet<NodeID>,
    /// The voters' last log indexes, reported alongside their votes. Used
    /// to prime match index tracking on promotion.
    match_hints: HashMap<NodeID, Index>,
    /// When the election expires and a new one is campaigned.
    election_deadline: Instant,
}

impl Candidate {
    /// Creates a new candidate role.
    fn new(election_deadline: Instant) -> Self {
        Self { votes: HashSet::new(), match_hints: HashMap::new(), election_deadline }
    }
}

impl Role for Candidate {
    fn leader_hint<'a>(&'a self, _: &'a NodeID) -> &'a str {
        BROADCAST
    }
}

impl RawNode<Candidate> {
    /// Transitions the candidate to a follower. We either lost the election
    /// and follow the winner, or we discovered a new term in which case we
    /// step into it as a leaderless follower.
    fn into_follower(
        mut self,
        term: Term,
        leader: Option<NodeID>,
        now: Instant,
    ) -> Result<RawNode<Follower>> {
        assert!(term >= self.term(), "term regression {} → {}", self.term(), term);

        let election_deadline = self.gen_election_deadline(now);
        if let Some(leader) = leader {
            // We lost the election, follow the winner.
            assert_eq!(term, self.term(), "can't follow leader in different term");
            info!("Lost election, following leader {leader} in term {term}");
            Ok(self.into_role(Follower::new(Some(leader), election_deadline)))
        } else {
            // We found a new term, but we don't necessarily know who the
            // leader is yet. We'll find out when we step a message from it.
            assert_ne!(term, self.term(), "can't be leaderless follower in current term");
            info!("Discovered new term {term}");
            self.log.set_term(term, None);
            Ok(self.into_role(Follower::new(None, election_deadline)))
        }
    }

    /// Transitions the candidate to a leader. We won the election.
    fn into_leader(mut self, now: Instant) -> Result<RawNode<Leader>> {
        info!("Won election for term {}, becoming leader", self.term());
        let match_hints = std::mem::take(&mut self.role.match_hints);
        let progress = self
            .peers
            .iter()
            .map(|peer| (peer.clone(), Progress { match_index: match_hints.get(peer).copied() }))
            .collect();
        let role = Leader::new(progress, now + self.opts.heartbeat_interval, now);
        let mut node = self.into_role(role);

        // Propose an empty command when assuming leadership, to commit and
        // apply entries from previous terms (see section 8 in the Raft
        // paper). Proposing fans the entry out to all voters, asserting
        // leadership.
        node.propose(None)?;
        node.maybe_commit_and_apply(now)?;

        // Deflect any client requests buffered during the election; their
        // redirects now name us as the leader.
        node.flush_redirects(now)?;

        Ok(node)
    }

    /// Campaigns for leadership in a new term, by incrementing the term,
    /// voting for ourself, and soliciting votes from all peers.
    fn campaign(&mut self, now: Instant) -> Result<()> {
        let term = self.term() + 1;
        info!("Starting new election for term {term}");
        self.role = Candidate::new(self.gen_election_deadline(now));
        self.role.votes.insert(self.id.clone()); // vote for ourself
        self.log.set_term(term, Some(self.id.clone()));

        let (last_index, last_term) = (self.log.last_index(), self.log.last_term());
        self.broadcast(Message::Candidacy { term, last_index, last_term })
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope, now: Instant) -> Result<Node> {
        // Drop messages from past terms, and step into any future term as a
        // leaderless follower before processing the message.
        if let Some(term) = msg.message.term() {
            if term < self.term() {
                debug!("Dropping message from past term ({msg:?})");
                return Ok(self.into());
            }
            if term > self.term() {
                return self.into_follower(term, None, now)?.step(msg, now);
            }
        }

        let src = msg.src.clone();
        match msg.message {
            // If we received a vote, record it along with the voter's last
            // log index. If the votes give us quorum, assume leadership.
            Message::Vote { value, .. } => {
                self.role.votes.insert(src.clone());
                self.role.match_hints.insert(src, value);
                if self.role.votes.len() >= self.quorum_size() {
                    return Ok(self.into_leader(now)?.into());
                }
            }

            // If we receive replicated entries in this term, we lost the
            // election and have a new leader. Follow it and step the message.
            Message::AppendEntries { .. } => {
                let term = self.term();
                return self.into_follower(term, Some(src), now)?.step(msg, now);
            }

            // Don't grant votes to other candidates campaigning in our term;
            // we already voted for ourself.
            Message::Candidacy { .. } => {}

            // Client requests are deflected in batches once a leader is known.
            Message::Get { mid, .. } | Message::Put { mid, .. } => {
                self.enqueue_redirect(src, mid, now)?;
            }

            // Ignore startup announcements, stale replication responses, and
            // anything misdelivered.
            Message::Hello
            | Message::Agree { .. }
            | Message::InduceMe { .. }
            | Message::Ok { .. }
            | Message::Fail { .. }
            | Message::Redirect { .. } => debug!("Ignoring message ({msg:?})"),
        }
        Ok(self.into())
    }

    /// Processes a clock advance.
    fn tick(mut self, now: Instant) -> Result<Node> {
        self.maybe_flush_redirects(now)?;
        if now >= self.role.election_deadline {
            // The election neither won nor found a leader: campaign again in
            // a higher term.
            self.campaign(now)?;
        }
        Ok(self.into())
    }
}

/// A follower replicates entries from a leader.
pub struct Follower {
    /// The leader, or None if just initialized or in a fresh term.
    leader: Option<NodeID>,
    /// When the leader is considered lost and an election is called.
    election_deadline: Instant,
}

impl Follower {
    /// Creates a new follower role.
    fn new(leader: Option<NodeID>, election_deadline: Instant) -> Self {
        Self { leader, election_deadline }
    }
}

impl Role for Follower {
    fn leader_hint<'a>(&'a self, _: &'a NodeID) -> &'a str {
        self.leader.as_deref().unwrap_or(BROADCAST)
    }
}

impl RawNode<Follower> {
    /// Creates a new node as a leaderless follower.
    fn new(
        id: NodeID,
        peers: HashSet<NodeID>,
        log: Log,
        state: Box<dyn State>,
        node_tx: crossbeam::channel::Sender<Envelope>,
        opts: Options,
        now: Instant,
    ) -> Self {
        let redirect_deadline = now + opts.redirect_flush_interval;
        let mut node = Self {
            id,
            peers,
            log,
            state,
            node_tx,
            opts,
            redirects: VecDeque::new(),
            redirect_deadline,
            role: Follower::new(None, now),
        };
        node.role.election_deadline = node.gen_election_deadline(now);
        node
    }

    /// Transitions the follower into a candidate, campaigning for leadership
    /// in a new term.
    fn into_candidate(mut self, now: Instant) -> Result<RawNode<Candidate>> {
        // Apply any pending committed entries, so we're caught up if we win.
        self.maybe_apply();
        let mut node = self.into_role(Candidate::new(now));
        node.campaign(now)?;
        Ok(node)
    }

    /// Transitions the follower into a follower: either following a leader
    /// discovered in the current term, or leaderless in a new term.
    fn into_follower(
        mut self,
        leader: Option<NodeID>,
        term: Term,
        now: Instant,
    ) -> Result<RawNode<Follower>> {
        assert!(term >= self.term(), "term regression {} → {}", self.term(), term);

        if let Some(leader) = leader {
            // We found a leader in the current term.
            assert_eq!(self.role.leader, None, "already have a leader in term");
            assert_eq!(term, self.term(), "can't follow leader in different term");
            info!("Following leader {leader} in term {term}");
            self.role = Follower::new(Some(leader), self.gen_election_deadline(now));
        } else {
            // We found a new term, but we don't necessarily know who the
            // leader is yet. We'll find out when we step a message from it.
            assert_ne!(term, self.term(), "can't be leaderless follower in current term");
            info!("Discovered new term {term}");
            self.log.set_term(term, None);
            self.role = Follower::new(None, self.gen_election_deadline(now));
        }
        Ok(self)
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope, now: Instant) -> Result<Node> {
        // Drop messages from past terms, and step into any future term as a
        // leaderless follower before processing the message.
        if let Some(term) = msg.message.term() {
            if term < self.term() {
                debug!("Dropping message from past term ({msg:?})");
                return Ok(self.into());
            }
            if term > self.term() {
                return self.into_follower(None, term, now)?.step(msg, now);
            }
        }

        // Any message from the current leader resets the election timeout.
        if self.role.leader.as_deref() == Some(msg.src.as_str()) {
            self.role.election_deadline = self.gen_election_deadline(now);
        }

        let src = msg.src.clone();
        match msg.message {
            Message::AppendEntries { term, prev_log_index, prev_log_term, entries, leader_commit } => {
                // The sender is the leader in this term: follow it if we
                // don't have a leader yet.
                if let Some(leader) = &self.role.leader {
                    assert_eq!(leader, &src, "multiple leaders in term");
                } else {
                    self = self.into_follower(Some(src.clone()), term, now)?;
                }

                if entries.is_empty() {
                    // A heartbeat. If the leader has committed entries beyond
                    // our log, solicit them, otherwise absorb it.
                    if leader_commit >= self.log.len() as Index {
                        self.send(&src, Message::InduceMe { value: self.log.commit_index() })?;
                    }
                } else if prev_log_index == -1 || self.log.has(prev_log_index, prev_log_term) {
                    // The entries connect to our log. Splice them in: already
                    // present entries are skipped, and a conflicting tail is
                    // truncated and replaced.
                    let last_index = self.log.splice(prev_log_index, entries);
                    self.send(&src, Message::Agree { term, value: last_index })?;
                    if leader_commit > self.log.commit_index() {
                        self.log.commit(std::cmp::min(leader_commit, last_index));
                        self.maybe_apply();
                    }
                } else {
                    // The consistency check failed: request catch-up from our
                    // commit index.
                    self.send(&src, Message::InduceMe { value: self.log.commit_index() })?;
                }
            }

            // A candidate in this term requests our vote.
            Message::Candidacy { term, last_index, last_term } => {
                // Don't vote if we already voted for someone else this term.
                if let Some(vote) = self.log.vote() {
                    if vote != &src {
                        return Ok(self.into());
                    }
                }

                // Don't vote if our log is more up to date than the
                // candidate's.
                let (log_index, log_term) = (self.log.last_index(), self.log.last_term());
                if log_term > last_term || log_term == last_term && log_index > last_index {
                    return Ok(self.into());
                }

                // Grant the vote, reporting our last index so the candidate
                // can prime its match index tracking if it wins.
                info!("Voting for {src} in term {term} election");
                self.log.set_term(term, Some(src.clone()));
                self.send(&src, Message::Vote { term, value: log_index })?;
                self.role.election_deadline = self.gen_election_deadline(now);
            }

            // Client requests are deflected to the leader in batches.
            Message::Get { mid, .. } | Message::Put { mid, .. } => {
                self.enqueue_redirect(src, mid, now)?;
            }

            // We may receive votes after losing an election, and replication
            // responses after being deposed as leader in an earlier term.
            // Ignore them, along with startup announcements.
            Message::Hello
            | Message::Vote { .. }
            | Message::Agree { .. }
            | Message::InduceMe { .. }
            | Message::Ok { .. }
            | Message::Fail { .. }
            | Message::Redirect { .. } => debug!("Ignoring message ({msg:?})"),
        }
        Ok(self.into())
    }

    /// Processes a clock advance.
    fn tick(mut self, now: Instant) -> Result<Node> {
        self.maybe_flush_redirects(now)?;
        if now >= self.role.election_deadline {
            // The election timeout elapsed with no contact from a leader and
            // no vote granted: campaign for leadership.
            return Ok(self.into_candidate(now)?.into());
        }
        Ok(self.into())
    }
}

/// Follower replication progress.
struct Progress {
    /// The highest log index confirmed to be replicated on the follower, or
    /// None if unknown. Primed from vote payloads and advanced by agree
    /// responses. Unknown peers count as -1 for commit computation, and
    /// outbound payloads optimistically assume they only lack the most
    /// recent window.
    match_index: Option<Index>,
}

/// A pending client write, waiting for its log entry to commit.
struct Write {
    /// The client that submitted the write.
    client: NodeID,
    /// The log index of the write's entry.
    index: Index,
}

/// A leader admits client requests and replicates its log to followers.
pub struct Leader {
    /// Follower replication progress.
    progress: HashMap<NodeID, Progress>,
    /// Pending client writes by request ID. Used both to acknowledge writes
    /// once their entries commit, and to suppress duplicate retries of
    /// in-flight writes.
    pending: HashMap<RequestID, Write>,
    /// When the next heartbeat is due.
    heartbeat_deadline: Instant,
    /// When commit progress was last made. A leader that can't make
    /// progress has likely lost its quorum.
    last_consensus: Instant,
}

impl Leader {
    /// Creates a new leader role.
    fn new(progress: HashMap<NodeID, Progress>, heartbeat_deadline: Instant, now: Instant) -> Self {
        Self { progress, pending: HashMap::new(), heartbeat_deadline, last_consensus: now }
    }
}

impl Role for Leader {
    fn leader_hint<'a>(&'a self, id: &'a NodeID) -> &'a str {
        id
    }
}

impl RawNode<Leader> {
    /// Transitions the leader into a follower after discovering a new term.
    /// All pending writes are moved to the redirect path.
    fn into_follower(mut self, term: Term, now: Instant) -> Result<RawNode<Follower>> {
        assert!(term > self.term(), "can only become follower in a later term");
        info!("Discovered new term {term}");
        self.abort_pending();
        self.log.set_term(term, None);
        let election_deadline = self.gen_election_deadline(now);
        Ok(self.into_role(Follower::new(None, election_deadline)))
    }

    /// Transitions the leader into a candidate campaigning in a higher term,
    /// after the progress watchdog fired. All pending writes are moved to
    /// the redirect path.
    fn into_candidate(mut self, now: Instant) -> Result<RawNode<Candidate>> {
        self.abort_pending();
        let mut node = self.into_role(Candidate::new(now));
        node.campaign(now)?;
        Ok(node)
    }

    /// Moves all pending writes to the redirect path. The entries may still
    /// commit under the next leader; clients treat MIDs as idempotency keys
    /// across retries.
    fn abort_pending(&mut self) {
        // Sort the requests for test determinism.
        let pending = std::mem::take(&mut self.role.pending);
        for (mid, write) in pending.into_iter().sorted_by(|a, b| a.0.cmp(&b.0)) {
            self.redirects.push_back((write.client, mid));
        }
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope, now: Instant) -> Result<Node> {
        // Drop messages from past terms, and step into any future term as a
        // leaderless follower before processing the message.
        if let Some(term) = msg.message.term() {
            if term < self.term() {
                debug!("Dropping message from past term ({msg:?})");
                return Ok(self.into());
            }
            if term > self.term() {
                return self.into_follower(term, now)?.step(msg, now);
            }
        }

        let src = msg.src.clone();
        match msg.message {
            // There can't be two leaders in the same term.
            Message::AppendEntries { .. } => {
                panic!("saw other leader {src} in term {}", self.term())
            }

            // A follower accepted entries: advance its match index and try
            // to commit, then continue catch-up if it's still behind.
            Message::Agree { value, .. } => {
                let Some(progress) = self.role.progress.get_mut(&src) else {
                    debug!("Ignoring agree from unknown peer {src}");
                    return Ok(self.into());
                };
                assert!(value <= self.log.last_index(), "follower claims unknown entries");
                if value > progress.match_index.unwrap_or(-1) {
                    progress.match_index = Some(value);
                    self.maybe_commit_and_apply(now)?;
                }
                self.maybe_send_append(&src)?;
            }

            // A residual vote from our election is an implicit match index
            // report.
            Message::Vote { value, .. } => {
                let mut advanced = false;
                if let Some(progress) = self.role.progress.get_mut(&src) {
                    if value > progress.match_index.unwrap_or(-1) {
                        progress.match_index = Some(value);
                        advanced = true;
                    }
                }
                if advanced {
                    self.maybe_commit_and_apply(now)?;
                }
            }

            // A follower failed its consistency check: catch it up from its
            // last confirmed match, or from the commit index it reported.
            Message::InduceMe { value } => {
                if let Some(progress) = self.role.progress.get(&src) {
                    let from = progress.match_index.unwrap_or(value);
                    if from < self.log.last_index() {
                        self.send_append_batches(&src, from)?;
                    }
                }
            }

            // Serve reads from the applied state. An unwritten key reads as
            // the empty string.
            Message::Get { mid, key } => {
                let value = self.state.read(&key).unwrap_or_default();
                self.send(&src, Message::Ok { mid, value: Some(value) })?;
            }

            // Append writes to our log and replicate them; acknowledgment is
            // deferred until the entry commits. Duplicate retries of
            // in-flight writes are dropped.
            Message::Put { mid, key, value } => {
                if self.role.pending.contains_key(&mid) {
                    debug!("Dropping duplicate put {mid}");
                } else {
                    let index = self.propose(Some((key, value)))?;
                    self.role.pending.insert(mid, Write { client: src, index });
                    if self.peers.is_empty() {
                        self.maybe_commit_and_apply(now)?;
                    }
                }
            }

            // Don't grant votes to candidates campaigning in our term.
            Message::Candidacy { .. } => {}

            // Ignore startup announcements and anything misdelivered.
            Message::Hello
            | Message::Ok { .. }
            | Message::Fail { .. }
            | Message::Redirect { .. } => debug!("Ignoring message ({msg:?})"),
        }

        Ok(self.into())
    }

    /// Processes a clock advance.
    fn tick(mut self, now: Instant) -> Result<Node> {
        if now >= self.role.heartbeat_deadline {
            self.heartbeat()?;
            self.role.heartbeat_deadline = now + self.opts.heartbeat_interval;
        }
        if now.duration_since(self.role.last_consensus) >= self.opts.progress_timeout {
            // We haven't made commit progress in a while, and have likely
            // lost our quorum to a partition. Step down and campaign, so
            // clients aren't left waiting on a deposed leader.
            info!("No commit progress in term {}, stepping down", self.term());
            return Ok(self.into_candidate(now)?.into());
        }
        Ok(self.into())
    }

    /// Sends periodic AppendEntries to all peers: pending entries for peers
    /// that are behind, empty heartbeats for the rest.
    fn heartbeat(&self) -> Result<()> {
        let term = self.term();
        let (last_index, last_term) = (self.log.last_index(), self.log.last_term());
        let leader_commit = self.log.commit_index();
        for peer in self.peers.iter().sorted() {
            if !self.maybe_send_append(peer)? {
                self.send(
                    peer,
                    Message::AppendEntries {
                        term,
                        prev_log_index: last_index,
                        prev_log_term: last_term,
                        entries: Vec::new(),
                        leader_commit,
                    },
                )?;
            }
        }
        Ok(())
    }

    /// Proposes a command by appending it to our log and eagerly fanning it
    /// out to peers. It commits once a quorum confirms it.
    fn propose(&mut self, command: Option<Command>) -> Result<Index> {
        let index = self.log.append(command);
        for peer in self.peers.iter().sorted() {
            self.maybe_send_append(peer)?;
        }
        Ok(index)
    }

    /// Sends pending log entries to a peer, starting after its match index.
    /// When the match index is unknown, optimistically assume the peer only
    /// lacks the most recent window; if the guess is wrong, the peer fails
    /// its consistency check and requests induction from an earlier
    /// position. Returns true if anything was sent.
    fn maybe_send_append(&self, peer: &str) -> Result<bool> {
        let last_index = self.log.last_index();
        let progress = self.role.progress.get(peer).expect("unknown peer");
        let from = progress.match_index.unwrap_or_else(|| {
            std::cmp::max(self.log.len() as Index - self.opts.max_append_entries as Index, 0)
        });
        if from >= last_index {
            return Ok(false);
        }
        self.send_append_batches(peer, from)?;
        Ok(true)
    }

    /// Sends successive bounded windows of entries after the given index up
    /// to the log tail. The windows bound the datagram size and pipeline
    /// catch-up of lagging followers.
    fn send_append_batches(&self, peer: &str, mut prev_index: Index) -> Result<()> {
        let term = self.term();
        let last_index = self.log.last_index();
        let leader_commit = self.log.commit_index();
        while prev_index < last_index {
            let prev_log_term = match prev_index {
                -1 => 0,
                prev => self.log.get(prev).expect("missing base entry").term(),
            };
            let entries = self.log.scan(prev_index + 1, self.opts.max_append_entries);
            let sent = entries.len() as Index;
            debug!("Replicating {sent} entries after {prev_index} to {peer}");
            self.send(
                peer,
                Message::AppendEntries {
                    term,
                    prev_log_index: prev_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                },
            )?;
            prev_index += sent;
        }
        Ok(())
    }

    /// Commits any new entries that have been confirmed by a quorum,
    /// provided the quorum entry is from our own term (see figure 8 in the
    /// Raft paper), then applies them and acknowledges the corresponding
    /// pending writes.
    fn maybe_commit_and_apply(&mut self, now: Instant) -> Result<Index> {
        // Determine the quorum commit index. Peers without a confirmed
        // match index count as -1.
        let quorum_index = self.quorum_value(
            self.role
                .progress
                .values()
                .map(|p| p.match_index.unwrap_or(-1))
                .chain(std::iter::once(self.log.last_index()))
                .collect(),
        );
        if quorum_index <= self.log.commit_index() {
            return Ok(self.log.commit_index());
        }

        // Entries from previous terms are only committed indirectly, by
        // committing a later entry from our own term.
        match self.log.get(quorum_index) {
            Some(entry) if entry.term() == self.term() => {}
            Some(_) => return Ok(self.log.commit_index()),
            None => panic!("missing entry at quorum index {quorum_index}"),
        }

        let commit_index = self.log.commit(quorum_index);
        self.role.last_consensus = now;
        self.maybe_apply();

        // Acknowledge pending writes whose entries are now committed,
        // sorted for test determinism.
        let committed: Vec<RequestID> = self
            .role
            .pending
            .iter()
            .filter(|(_, write)| write.index <= commit_index)
            .map(|(mid, _)| mid.clone())
            .sorted()
            .collect();
        for mid in committed {
            let write = self.role.pending.remove(&mid).expect("pending write disappeared");
            self.send(&write.client, Message::Ok { mid, value: None })?;
        }
        Ok(commit_index)
    }
}
