use crate::error::Result;
use crate::raft::{self, Envelope, KvState, Log, Message, Node, NodeID, BROADCAST};

use log::{debug, error, info};
use std::collections::HashSet;
use std::net::UdpSocket;
use std::time::{Duration, Instant};

/// The maximum datagram size.
const MAX_FRAME: usize = 65535;

/// The bounded socket wait per event loop iteration. Keeps the loop
/// responsive to timers while blocking on the transport.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A replica server: a single-threaded event loop coupling a Raft node to a
/// datagram endpoint. The loop multiplexes inbound messages from clients and
/// peers, timer expirations, and the node's outbound messages. All datagrams
/// go through the simulator endpoint on localhost, which routes them by
/// destination ID.
pub struct Server {
    id: NodeID,
    node: Node,
    node_rx: crossbeam::channel::Receiver<Envelope>,
    socket: UdpSocket,
}

impl Server {
    /// Creates a new replica server connected to the simulator endpoint on
    /// the given localhost port.
    pub fn new(id: NodeID, peers: Vec<NodeID>, port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(("127.0.0.1", 0))?;
        socket.connect(("127.0.0.1", port))?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;

        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let node = Node::new(
            id.clone(),
            peers.into_iter().collect::<HashSet<NodeID>>(),
            Log::new(),
            Box::new(KvState::new()),
            node_tx,
            raft::Options::default(),
            Instant::now(),
        )?;
        Ok(Self { id, node, node_rx, socket })
    }

    /// Serves requests until the process is killed. Each iteration receives
    /// at most one inbound message, advances the node's timers, and drains
    /// any outbound messages onto the socket.
    pub fn serve(self) -> Result<()> {
        let Server { id, mut node, node_rx, socket } = self;
        info!("Replica {id} listening on {}", socket.local_addr()?);

        // Announce ourselves to the cluster.
        Self::transmit(
            &socket,
            Envelope {
                src: id.clone(),
                dst: BROADCAST.into(),
                leader: BROADCAST.into(),
                message: Message::Hello,
            },
        )?;

        let mut buf = [0; MAX_FRAME];
        loop {
            match socket.recv(&mut buf) {
                Ok(len) => {
                    if let Some(envelope) = Self::decode(&buf[..len], &id) {
                        node = node.step(envelope, Instant::now())?;
                    }
                }
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut => {}
                Err(err) => return Err(err.into()),
            }

            node = node.tick(Instant::now())?;

            while let Ok(envelope) = node_rx.try_recv() {
                Self::transmit(&socket, envelope)?;
            }
        }
    }

    /// Decodes an inbound datagram. Returns None for malformed datagrams,
    /// messages addressed to other replicas, and our own broadcasts if the
    /// transport loops them back.
    fn decode(frame: &[u8], id: &str) -> Option<Envelope> {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!("Dropping malformed datagram: {err}");
                return None;
            }
        };
        if !envelope.addressed_to(id) || envelope.src == id {
            return None;
        }
        Some(envelope)
    }

    /// Transmits an outbound message as a single datagram. The transport is
    /// unreliable, so send failures are logged and dropped; the protocol
    /// recovers via retries and timeouts.
    fn transmit(socket: &UdpSocket, envelope: Envelope) -> Result<()> {
        let frame = envelope.encode()?;
        if frame.len() > MAX_FRAME {
            error!("Dropping oversized datagram ({} bytes)", frame.len());
            return Ok(());
        }
        if let Err(err) = socket.send(&frame) {
            debug!("Dropping undeliverable datagram: {err}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A replica must process messages addressed to it or broadcast, and
    /// ignore everything else, including its own looped-back broadcasts.
    #[test]
    fn decode_filters_by_destination_and_sender() {
        let frame = |src: &str, dst: &str| {
            Envelope {
                src: src.into(),
                dst: dst.into(),
                leader: BROADCAST.into(),
                message: Message::Hello,
            }
            .encode()
            .unwrap()
        };
        assert!(Server::decode(&frame("0001", "0000"), "0000").is_some());
        assert!(Server::decode(&frame("0001", BROADCAST), "0000").is_some());
        assert!(Server::decode(&frame("0001", "0002"), "0000").is_none());
        assert!(Server::decode(&frame("0000", BROADCAST), "0000").is_none());
        assert!(Server::decode(b"garbage", "0000").is_none());
    }
}
