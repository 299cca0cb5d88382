use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crossbeam::channel::{after, unbounded, Receiver, Select, Sender};

use crate::client::{ClientRequest, RaftClient};
use crate::error::NetworkError;
use crate::raft_message::Msg;
use crate::raft_network::{RaftNetwork, SelectedAction, TimerKind};
use crate::NodeId;

// Channels to communicate with peers
pub struct Peer<C: Clone + Debug> {
    id: NodeId,
    tx: Sender<Msg<C>>,
    rx: Receiver<Msg<C>>,
    // the sending side is gone, stop selecting on it
    closed: bool,
}

impl<C: Clone + Debug> Peer<C> {
    pub fn new(id: NodeId, tx: Sender<Msg<C>>, rx: Receiver<Msg<C>>) -> Self {
        Peer {
            id,
            tx,
            rx,
            closed: false,
        }
    }
}

struct Timer {
    rx: Receiver<Instant>,
    timer_kind: TimerKind,
}

/// Shared switchboard of cut links for an in-process cluster. A message on a
/// cut link is dropped silently, as a lossy network would.
#[derive(Clone, Debug, Default)]
pub struct LinkControl(Arc<RwLock<HashSet<(NodeId, NodeId)>>>);

impl LinkControl {
    /// Cut every link between the two groups, both ways.
    pub fn partition(&self, left: &[NodeId], right: &[NodeId]) {
        let mut cut = self.0.write().unwrap_or_else(|e| e.into_inner());
        for a in left {
            for b in right {
                cut.insert((*a, *b));
                cut.insert((*b, *a));
            }
        }
    }

    pub fn heal(&self) {
        self.0.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn is_cut(&self, from: NodeId, to: NodeId) -> bool {
        self.0
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&(from, to))
    }
}

pub struct ChanNetwork<C: Clone + Debug> {
    id: NodeId,
    peers: Vec<Peer<C>>,
    client_rx: Receiver<ClientRequest<C>>,
    client_closed: bool,
    timer: Option<Timer>,
    links: LinkControl,
}

impl<C: Clone + Debug> Debug for ChanNetwork<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let timer_kind = match &self.timer {
            Some(t) => match t.timer_kind {
                TimerKind::Election => "election",
                TimerKind::Heartbeat => "heartbeat",
            },
            None => "none",
        };
        let peers: Vec<NodeId> = self.peers.iter().map(|p| p.id).collect();
        f.debug_struct("ChanNetwork")
            .field("id", &self.id)
            .field("peers", &peers)
            .field("timer", &timer_kind)
            .finish()
    }
}

// which receiver a select operation belongs to
enum Source<'a, C: Clone + Debug> {
    Peer(usize, &'a Peer<C>),
    Client(&'a Receiver<ClientRequest<C>>),
    Timer(&'a Timer),
}

enum Polled<C: Clone + Debug> {
    Action(SelectedAction<C>),
    TimerFired(TimerKind),
    PeerClosed(usize),
    ClientClosed,
}

impl<C: Clone + Debug> ChanNetwork<C> {
    pub fn new(
        id: NodeId,
        peers: Vec<Peer<C>>,
        client_rx: Receiver<ClientRequest<C>>,
        links: LinkControl,
    ) -> Self {
        ChanNetwork {
            id,
            peers,
            client_rx,
            client_closed: false,
            timer: None,
            links,
        }
    }

    /// Fully connected in-process cluster of `nodes_count` nodes with ids
    /// `0..nodes_count`. Returns each node's endpoint, a client per node and
    /// the shared link switchboard.
    pub fn cluster(nodes_count: usize) -> (Vec<ChanNetwork<C>>, Vec<RaftClient<C>>, LinkControl) {
        let mut peers_per_node: Vec<Vec<Peer<C>>> = (0..nodes_count).map(|_| Vec::new()).collect();

        for i in 0..nodes_count {
            for j in i + 1..nodes_count {
                let (txi, rxi) = unbounded();
                let (txj, rxj) = unbounded();
                peers_per_node[i].push(Peer::new(j as NodeId, txi, rxj));
                peers_per_node[j].push(Peer::new(i as NodeId, txj, rxi));
            }
        }

        let links = LinkControl::default();
        let mut clients = Vec::new();
        let mut networks = Vec::new();

        for (i, peers) in peers_per_node.into_iter().enumerate() {
            let id = i as NodeId;
            let (client_tx, client_rx) = unbounded();
            clients.push(RaftClient::new(id, client_tx));
            networks.push(ChanNetwork::new(id, peers, client_rx, links.clone()));
        }

        (networks, clients, links)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.iter().map(|p| p.id).collect()
    }

    fn find_by_id(&self, id: NodeId) -> Option<&Peer<C>> {
        self.peers.iter().find(|p| p.id == id)
    }

    // one select over every open inbox and the timer
    fn poll(&self, wait_time: Duration) -> Option<Polled<C>> {
        let mut sources = Vec::new();
        let mut select = Select::new();

        for (i, peer) in self.peers.iter().enumerate() {
            if !peer.closed {
                select.recv(&peer.rx);
                sources.push(Source::Peer(i, peer));
            }
        }
        if !self.client_closed {
            select.recv(&self.client_rx);
            sources.push(Source::Client(&self.client_rx));
        }
        if let Some(t) = &self.timer {
            select.recv(&t.rx);
            sources.push(Source::Timer(t));
        }

        let selected = select.select_timeout(wait_time).ok()?;
        let polled = match &sources[selected.index()] {
            Source::Peer(i, peer) => match selected.recv(&peer.rx) {
                Ok(msg) => Polled::Action(SelectedAction::Peer(peer.id, msg)),
                Err(_) => Polled::PeerClosed(*i),
            },
            Source::Client(rx) => match selected.recv(rx) {
                Ok(request) => Polled::Action(SelectedAction::Client(request)),
                Err(_) => Polled::ClientClosed,
            },
            Source::Timer(t) => {
                let _ = selected.recv(&t.rx);
                Polled::TimerFired(t.timer_kind)
            }
        };
        Some(polled)
    }

    fn select_action(&mut self, wait_time: Duration) -> Option<SelectedAction<C>> {
        let deadline = Instant::now() + wait_time;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.poll(remaining)? {
                Polled::Action(action) => return Some(action),
                Polled::TimerFired(timer_kind) => {
                    self.timer = None;
                    return Some(SelectedAction::Timer(timer_kind));
                }
                Polled::PeerClosed(i) => {
                    log::debug!("[{}] Peer {} disconnected", self.id, self.peers[i].id);
                    self.peers[i].closed = true;
                }
                Polled::ClientClosed => {
                    log::debug!("[{}] Client channel closed", self.id);
                    self.client_closed = true;
                }
            }
        }
    }
}

impl<C: Clone + Debug + Send + 'static> RaftNetwork for ChanNetwork<C> {
    type Command = C;

    fn send(&mut self, peer_id: NodeId, msg: Msg<Self::Command>) -> Result<(), NetworkError> {
        let p = self
            .find_by_id(peer_id)
            .ok_or(NetworkError::UnknownPeer(peer_id))?;
        if self.links.is_cut(self.id, peer_id) {
            log::trace!("[{}] Link to {} is cut, dropping {}", self.id, peer_id, msg.kind());
            return Ok(());
        }
        p.tx.send(msg)
            .map_err(|_| NetworkError::Disconnected(peer_id))
    }

    fn timer_reset(&mut self, timer_kind: TimerKind, duration: Duration) {
        self.timer = Some(Timer {
            timer_kind,
            rx: after(duration),
        });
    }

    fn select_actions(
        &mut self,
        buf: &mut Vec<SelectedAction<Self::Command>>,
        max_actions: usize,
        max_wait_time: Duration,
    ) -> bool {
        // block for the first action only, then take what is already queued
        let mut timeout = max_wait_time;
        let mut selected = 0;
        while selected < max_actions {
            match self.select_action(timeout) {
                Some(action) => {
                    buf.push(action);
                    selected += 1;
                    timeout = Duration::ZERO;
                }
                None => break,
            }
        }
        selected == 0
    }
}
