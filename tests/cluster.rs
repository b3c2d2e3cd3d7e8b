//! End-to-end cluster scenarios, run against an in-process cluster of Raft
//! nodes wired through a deterministic message router with a virtual clock.

use toykv::raft::{
    Envelope, KvState, Log, Message, Node, NodeID, Options, RequestID, Term, BROADCAST,
};

use crossbeam::channel::Receiver;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// An in-process cluster. Datagrams are routed by destination, broadcasts
/// fan out to all other replicas, and responses addressed to client IDs are
/// collected for inspection. Partitioned links drop messages in both
/// directions, like the lossy substrate the replicas are built for.
///
/// Election timeouts are staggered per node (n1 first) and the progress
/// watchdog is disabled by default, so tests control leadership explicitly.
struct TestCluster {
    ids: Vec<NodeID>,
    nodes: BTreeMap<NodeID, Node>,
    node_rxs: BTreeMap<NodeID, Receiver<Envelope>>,
    inboxes: BTreeMap<NodeID, VecDeque<Envelope>>,
    /// Responses delivered to clients, by client ID.
    clients: BTreeMap<NodeID, Vec<Envelope>>,
    /// Severed links, as ordered node pairs.
    cuts: HashSet<(NodeID, NodeID)>,
    /// Sizes of non-empty AppendEntries batches delivered, per recipient.
    batches: BTreeMap<NodeID, Vec<usize>>,
    /// Leaders observed per term, for the election safety invariant.
    leaders_by_term: BTreeMap<Term, NodeID>,
    now: Instant,
}

impl TestCluster {
    /// Creates a cluster of n nodes named n1..nN.
    fn new(n: usize) -> Self {
        Self::with_options(n, |_, _| {})
    }

    /// Creates a cluster of n nodes, passing each node's zero-based index
    /// and default options to the given closure for adjustment.
    fn with_options(n: usize, tweak: impl Fn(usize, &mut Options)) -> Self {
        let now = Instant::now();
        let ids: Vec<NodeID> = (1..=n).map(|i| format!("n{i}")).collect();

        let mut nodes = BTreeMap::new();
        let mut node_rxs = BTreeMap::new();
        let mut inboxes = BTreeMap::new();
        for (i, id) in ids.iter().enumerate() {
            let (node_tx, node_rx) = crossbeam::channel::unbounded();
            let mut opts = Options::default();
            let base = 150 + 100 * i as u64;
            opts.election_timeout =
                Duration::from_millis(base)..Duration::from_millis(base + 1);
            opts.progress_timeout = Duration::from_secs(3600);
            tweak(i, &mut opts);

            let peers: HashSet<NodeID> = ids.iter().filter(|p| *p != id).cloned().collect();
            let node = Node::new(
                id.clone(),
                peers,
                Log::new(),
                Box::new(KvState::new()),
                node_tx,
                opts,
                now,
            )
            .expect("node failed");
            nodes.insert(id.clone(), node);
            node_rxs.insert(id.clone(), node_rx);
            inboxes.insert(id.clone(), VecDeque::new());
        }

        Self {
            ids,
            nodes,
            node_rxs,
            inboxes,
            clients: BTreeMap::new(),
            cuts: HashSet::new(),
            batches: BTreeMap::new(),
            leaders_by_term: BTreeMap::new(),
            now,
        }
    }

    /// Advances the virtual clock in small steps, ticking all nodes and
    /// routing messages until quiescent after each step. Small steps keep
    /// leader heartbeats ahead of follower election timeouts.
    fn advance(&mut self, ms: u64) {
        let mut remaining = ms;
        while remaining > 0 {
            let step = remaining.min(50);
            self.now += Duration::from_millis(step);
            remaining -= step;
            for id in self.ids.clone() {
                let node = self.nodes.remove(&id).unwrap();
                self.nodes.insert(id, node.tick(self.now).expect("tick failed"));
            }
            self.pump();
        }
    }

    /// Routes and delivers messages until the cluster is quiescent.
    fn pump(&mut self) {
        loop {
            let mut wave = Vec::new();
            for id in &self.ids {
                wave.extend(self.node_rxs[id].try_iter());
            }
            let queued: usize = self.inboxes.values().map(|q| q.len()).sum();
            if wave.is_empty() && queued == 0 {
                break;
            }
            for envelope in wave {
                self.route(envelope);
            }
            for id in self.ids.clone() {
                let inbox = std::mem::take(self.inboxes.get_mut(&id).unwrap());
                for envelope in inbox {
                    let node = self.nodes.remove(&id).unwrap();
                    self.nodes.insert(id.clone(), node.step(envelope, self.now).expect("step failed"));
                }
            }
            self.check_election_safety();
        }
    }

    /// Routes an outbound message to replica inboxes or client mailboxes.
    fn route(&mut self, envelope: Envelope) {
        if envelope.dst == BROADCAST {
            for id in self.ids.clone() {
                if id != envelope.src && !self.is_cut(&envelope.src, &id) {
                    self.deliver(id, envelope.clone());
                }
            }
        } else if self.ids.contains(&envelope.dst) {
            if !self.is_cut(&envelope.src, &envelope.dst) {
                self.deliver(envelope.dst.clone(), envelope);
            }
        } else {
            self.clients.entry(envelope.dst.clone()).or_default().push(envelope);
        }
    }

    fn deliver(&mut self, to: NodeID, envelope: Envelope) {
        if let Message::AppendEntries { entries, .. } = &envelope.message {
            if !entries.is_empty() {
                self.batches.entry(to.clone()).or_default().push(entries.len());
            }
        }
        self.inboxes.get_mut(&to).unwrap().push_back(envelope);
    }

    /// At most one leader may exist per term, ever.
    fn check_election_safety(&mut self) {
        for (id, node) in &self.nodes {
            if node.is_leader() {
                let prev = self.leaders_by_term.entry(node.term()).or_insert_with(|| id.clone());
                assert_eq!(prev, id, "two leaders in term {}", node.term());
            }
        }
    }

    fn link(a: &str, b: &str) -> (NodeID, NodeID) {
        if a < b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        }
    }

    fn is_cut(&self, a: &str, b: &str) -> bool {
        self.cuts.contains(&Self::link(a, b))
    }

    /// Severs the link between two nodes, dropping traffic both ways.
    fn cut(&mut self, a: &str, b: &str) {
        self.cuts.insert(Self::link(a, b));
    }

    /// Severs all links to the given node. Clients can still reach it.
    fn isolate(&mut self, id: &str) {
        for other in self.ids.clone() {
            if other != id {
                self.cut(id, &other);
            }
        }
    }

    /// Restores all severed links.
    fn heal(&mut self) {
        self.cuts.clear();
    }

    /// Queues a client request for the given replica without processing it.
    fn inject(&mut self, client: &str, to: &str, message: Message) {
        self.deliver(
            to.to_string(),
            Envelope { src: client.into(), dst: to.into(), leader: BROADCAST.into(), message },
        );
    }

    /// Sends a client request to the given replica and routes to quiescence.
    fn request(&mut self, client: &str, to: &str, message: Message) {
        self.inject(client, to, message);
        self.pump();
    }

    /// Drains the responses received by the given client.
    fn client_messages(&mut self, client: &str) -> Vec<Envelope> {
        self.clients.remove(client).unwrap_or_default()
    }

    /// Returns the single leader among the given nodes, panicking if there
    /// is none or more than one.
    fn leader_among(&self, ids: &[&str]) -> NodeID {
        let leaders: Vec<NodeID> = ids
            .iter()
            .filter(|id| self.nodes.get(**id).unwrap().is_leader())
            .map(|id| id.to_string())
            .collect();
        assert_eq!(leaders.len(), 1, "expected one leader among {ids:?}, got {leaders:?}");
        leaders[0].clone()
    }

    /// Returns the single leader of the whole cluster.
    fn leader(&self) -> NodeID {
        let ids: Vec<&str> = self.ids.iter().map(|id| id.as_str()).collect();
        self.leader_among(&ids)
    }

    fn put(mid: &str, key: &str, value: &str) -> Message {
        Message::Put { mid: mid.into(), key: key.into(), value: value.into() }
    }

    fn get(mid: &str, key: &str) -> Message {
        Message::Get { mid: mid.into(), key: key.into() }
    }

    fn ok_mids(messages: &[Envelope]) -> Vec<RequestID> {
        messages
            .iter()
            .filter_map(|e| match &e.message {
                Message::Ok { mid, .. } => Some(mid.clone()),
                _ => None,
            })
            .collect()
    }
}

/// A three-node cluster elects a single leader that all nodes agree on.
#[test]
fn cluster_elects_single_leader() {
    let mut c = TestCluster::new(3);
    // Long enough for the election and the first heartbeat round, which
    // informs voters that didn't receive the winner's first append.
    c.advance(300);

    let leader = c.leader();
    let term = c.nodes[&leader].term();
    for id in &c.ids {
        let status = c.nodes[id].status();
        assert_eq!(status.term, term, "node {id} disagrees on term");
        assert_eq!(status.leader, leader, "node {id} disagrees on leader");
    }
}

/// Writes are acknowledged once committed, and reads observe them.
#[test]
fn put_and_get_round_trip() {
    let mut c = TestCluster::new(3);
    c.advance(200);
    let leader = c.leader();

    c.request("c001", &leader, TestCluster::put("M1", "a", "1"));
    c.request("c001", &leader, TestCluster::put("M2", "b", "2"));
    let responses = c.client_messages("c001");
    assert_eq!(
        responses.iter().map(|e| &e.message).collect::<Vec<_>>(),
        vec![
            &Message::Ok { mid: "M1".into(), value: None },
            &Message::Ok { mid: "M2".into(), value: None },
        ],
    );

    c.request("c001", &leader, TestCluster::get("M3", "a"));
    c.request("c001", &leader, TestCluster::get("M4", "b"));
    let responses = c.client_messages("c001");
    assert_eq!(responses[0].message, Message::Ok { mid: "M3".into(), value: Some("1".into()) });
    assert_eq!(responses[1].message, Message::Ok { mid: "M4".into(), value: Some("2".into()) });

    // A never-written key reads as the empty string.
    c.request("c001", &leader, TestCluster::get("M5", "nope"));
    let responses = c.client_messages("c001");
    assert_eq!(responses[0].message, Message::Ok { mid: "M5".into(), value: Some("".into()) });
}

/// An acknowledged write survives the leader being isolated: the surviving
/// majority elects a new leader whose applied state includes it.
#[test]
fn acknowledged_write_survives_leader_isolation() {
    let mut c = TestCluster::new(5);
    c.advance(200);
    let old_leader = c.leader();
    assert_eq!(old_leader, "n1");

    c.request("c001", &old_leader, TestCluster::put("M1", "x", "1"));
    assert_eq!(TestCluster::ok_mids(&c.client_messages("c001")), vec!["M1".to_string()]);

    c.isolate(&old_leader);
    c.advance(600);

    // The old leader still thinks it leads in its old term; the survivors
    // elected a new leader in a later term.
    let survivors = ["n2", "n3", "n4", "n5"];
    let new_leader = c.leader_among(&survivors);
    assert!(c.nodes[&new_leader].term() > c.nodes[&old_leader].term());

    c.request("c002", &new_leader, TestCluster::get("M2", "x"));
    let responses = c.client_messages("c002");
    assert_eq!(responses[0].message, Message::Ok { mid: "M2".into(), value: Some("1".into()) });

    // Healing the partition demotes the old leader and converges the logs.
    c.heal();
    c.advance(200);
    assert!(!c.nodes[&old_leader].is_leader());
    let leader_status = c.nodes[&new_leader].status();
    let old_status = c.nodes[&old_leader].status();
    assert_eq!(old_status.last_index, leader_status.last_index);
    assert_eq!(old_status.last_term, leader_status.last_term);
}

/// A leader cut off from the majority never acknowledges writes, steps down
/// once its progress watchdog fires, and deflects the pending request. The
/// write is discarded when the partition heals.
#[test]
fn minority_leader_never_acknowledges() {
    // Enable the progress watchdog on n1 and n2 only.
    let mut c = TestCluster::with_options(5, |i, opts| {
        if i < 2 {
            opts.progress_timeout = Duration::from_millis(600);
        }
    });
    c.advance(200);
    assert_eq!(c.leader(), "n1");

    // Partition {n1, n2} away from {n3, n4, n5}.
    for minority in ["n1", "n2"] {
        for majority in ["n3", "n4", "n5"] {
            c.cut(minority, majority);
        }
    }

    c.request("c001", "n1", TestCluster::put("M1", "y", "9"));
    assert!(c.client_messages("c001").is_empty(), "write must not be acknowledged");

    // The watchdog deposes n1, which deflects the pending write, while the
    // majority elects its own leader.
    c.advance(900);
    let responses = c.client_messages("c001");
    assert!(TestCluster::ok_mids(&responses).is_empty());
    assert!(responses
        .iter()
        .any(|e| e.message == Message::Redirect { mid: "M1".into() }));
    let new_leader = c.leader_among(&["n3", "n4", "n5"]);

    // After healing, the cluster converges and the write is gone.
    c.heal();
    c.advance(800);
    let leader = c.leader();
    assert!([new_leader.as_str(), "n3", "n4", "n5"].contains(&leader.as_str()));

    c.request("c002", &leader, TestCluster::put("M2", "z", "7"));
    assert_eq!(TestCluster::ok_mids(&c.client_messages("c002")), vec!["M2".to_string()]);
    c.request("c002", &leader, TestCluster::get("M3", "y"));
    c.request("c002", &leader, TestCluster::get("M4", "z"));
    let responses = c.client_messages("c002");
    assert_eq!(responses[0].message, Message::Ok { mid: "M3".into(), value: Some("".into()) });
    assert_eq!(responses[1].message, Message::Ok { mid: "M4".into(), value: Some("7".into()) });

    // The deposed leader never acknowledged the partitioned write.
    assert!(TestCluster::ok_mids(&c.client_messages("c001")).is_empty());
}

/// Rapid retries of a put with the same MID append one log entry and
/// receive exactly one acknowledgment.
#[test]
fn duplicate_puts_are_suppressed() {
    let mut c = TestCluster::new(3);
    c.advance(200);
    let leader = c.leader();

    for _ in 0..5 {
        c.inject("c001", &leader, TestCluster::put("M1", "k", "v"));
    }
    c.pump();

    assert_eq!(TestCluster::ok_mids(&c.client_messages("c001")), vec!["M1".to_string()]);
    // The election noop plus a single write.
    assert_eq!(c.nodes[&leader].status().last_index, 1);
}

/// A node that missed a long stretch of writes is caught up in successive
/// bounded batches, and ends with the leader's exact log.
#[test]
fn lagging_node_catches_up_in_bounded_batches() {
    // n3 never campaigns, so it rejoins as a quiet, empty follower.
    let mut c = TestCluster::with_options(3, |i, opts| {
        if i == 2 {
            opts.election_timeout = Duration::from_secs(3600)..Duration::from_secs(3601);
        }
    });
    c.isolate("n3");
    c.advance(200);
    let leader = c.leader_among(&["n1", "n2"]);

    for i in 0..120 {
        let mid = format!("M{i}");
        c.request("c001", &leader, TestCluster::put(&mid, &format!("k{i}"), &i.to_string()));
    }
    assert_eq!(TestCluster::ok_mids(&c.client_messages("c001")).len(), 120);

    c.batches.clear();
    c.heal();
    c.advance(200);

    // Catch-up arrived as multiple batches, each within the size cap.
    let batches = c.batches.get("n3").cloned().unwrap_or_default();
    assert!(batches.len() >= 3, "expected multiple batches, got {batches:?}");
    assert!(batches.iter().all(|len| *len <= 50), "oversized batch in {batches:?}");
    assert!(batches.iter().sum::<usize>() >= 121);

    // The follower's log and applied state match the leader's.
    let leader_status = c.nodes[&leader].status();
    let follower_status = c.nodes["n3"].status();
    assert_eq!(leader_status.last_index, 120);
    assert_eq!(follower_status.last_index, 120);
    assert_eq!(follower_status.last_term, leader_status.last_term);
    assert_eq!(follower_status.applied_index, 120);
    assert_eq!(c.nodes["n3"].read("k60"), Some("60".to_string()));
}

/// Client requests sent to a follower are deflected to the leader within
/// the redirect flush interval.
#[test]
fn follower_redirects_to_leader() {
    let mut c = TestCluster::new(3);
    c.advance(200);
    let leader = c.leader();
    assert_eq!(leader, "n1");

    c.request("c001", "n2", TestCluster::get("M1", "a"));
    assert!(c.client_messages("c001").is_empty(), "redirects are deferred");

    c.advance(300);
    let responses = c.client_messages("c001");
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].message, Message::Redirect { mid: "M1".into() });
    assert_eq!(responses[0].leader, leader, "redirect must name the leader");
}

/// Two candidates splitting the vote both time out and re-elect in a
/// strictly higher term.
#[test]
fn split_vote_resolves_in_higher_term() {
    // n1 and n2 share an election timeout so they campaign simultaneously;
    // n3 and n4 only ever vote.
    let mut c = TestCluster::with_options(4, |i, opts| match i {
        0 | 1 => opts.election_timeout = Duration::from_millis(150)..Duration::from_millis(151),
        _ => opts.election_timeout = Duration::from_secs(3600)..Duration::from_secs(3601),
    });

    // Each candidate can only reach one voter: neither gets a quorum.
    c.cut("n1", "n4");
    c.cut("n2", "n3");
    c.advance(200);
    assert!(c.ids.iter().all(|id| !c.nodes[id].is_leader()), "split vote must not elect");
    assert!(matches!(c.nodes["n1"], Node::Candidate(_)));
    assert!(matches!(c.nodes["n2"], Node::Candidate(_)));
    assert_eq!(c.nodes["n1"].term(), 1);
    assert_eq!(c.nodes["n2"].term(), 1);

    // Both time out and campaign again; with the partition healed, one wins
    // in a strictly higher term.
    c.heal();
    c.advance(250);
    let leader = c.leader();
    assert!(c.nodes[&leader].term() > 1);
    for id in &c.ids {
        assert_eq!(c.nodes[id].term(), c.nodes[&leader].term());
    }
}
