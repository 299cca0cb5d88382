//! Deterministic multi-node harness for tests: a message queue instead of a
//! transport, manual timers, link cuts, crashes and restarts.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::io;
use std::time::Duration;

use rand::rngs::StdRng;
use rand_core::SeedableRng;

use crate::client::Proposal;
use crate::config::Config;
use crate::error::{NetworkError, Result, StorageError};
use crate::raft_message::Msg;
use crate::raft_network::{RaftNetwork, SelectedAction, TimerKind};
use crate::raft_state::{RaftRole, RaftState};
use crate::{LogEntry, MemStorage, NodeId, StateMachine, Storage};

/// Records every applied command.
#[derive(Debug, Default)]
pub(crate) struct RecordingMachine {
    pub(crate) applied: Vec<(u64, String)>,
}

impl StateMachine for RecordingMachine {
    type Command = String;

    fn apply(&mut self, index: u64, command: &String) {
        self.applied.push((index, command.clone()));
    }
}

/// In-memory storage whose writes can be switched to fail.
#[derive(Debug, Default)]
pub(crate) struct FlakyStorage {
    inner: MemStorage<String>,
    pub(crate) fail_writes: bool,
}

impl FlakyStorage {
    fn check(&self) -> std::result::Result<(), StorageError> {
        if self.fail_writes {
            Err(StorageError::Io(io::Error::new(io::ErrorKind::Other, "disk full")))
        } else {
            Ok(())
        }
    }
}

impl Storage for FlakyStorage {
    type Command = String;

    fn current_term(&self) -> u64 {
        self.inner.current_term()
    }

    fn voted_for(&self) -> Option<NodeId> {
        self.inner.voted_for()
    }

    fn persist_term(&mut self, term: u64) -> std::result::Result<(), StorageError> {
        self.check()?;
        self.inner.persist_term(term)
    }

    fn persist_vote(&mut self, term: u64, candidate_id: NodeId) -> std::result::Result<(), StorageError> {
        self.check()?;
        self.inner.persist_vote(term, candidate_id)
    }

    fn append_log(&mut self, entries: Vec<LogEntry<String>>) -> std::result::Result<(), StorageError> {
        self.check()?;
        self.inner.append_log(entries)
    }

    fn truncate_log_from(&mut self, index: u64) -> std::result::Result<(), StorageError> {
        self.check()?;
        self.inner.truncate_log_from(index)
    }

    fn entry(&self, index: u64) -> Option<&LogEntry<String>> {
        self.inner.entry(index)
    }

    fn read_log(&self, from_index: u64, to_index: u64) -> &[LogEntry<String>] {
        self.inner.read_log(from_index, to_index)
    }

    fn last_log_index_term(&self) -> (u64, u64) {
        self.inner.last_log_index_term()
    }
}

/// Network endpoint that collects what a node sends and hands out scripted
/// actions.
#[derive(Debug)]
pub(crate) struct SimNetwork {
    id: NodeId,
    outbox: Vec<(NodeId, Msg<String>)>,
    timer: Option<(TimerKind, Duration)>,
    inbox: VecDeque<SelectedAction<String>>,
}

impl SimNetwork {
    pub(crate) fn new(id: NodeId) -> Self {
        SimNetwork {
            id,
            outbox: Vec::new(),
            timer: None,
            inbox: VecDeque::new(),
        }
    }

    pub(crate) fn push_action(&mut self, action: SelectedAction<String>) {
        self.inbox.push_back(action);
    }

    pub(crate) fn take_outbox(&mut self) -> Vec<(NodeId, Msg<String>)> {
        std::mem::take(&mut self.outbox)
    }

    pub(crate) fn timer_kind(&self) -> Option<TimerKind> {
        self.timer.map(|(kind, _)| kind)
    }
}

impl RaftNetwork for SimNetwork {
    type Command = String;

    fn send(&mut self, peer_id: NodeId, msg: Msg<String>) -> std::result::Result<(), NetworkError> {
        if peer_id == self.id {
            return Err(NetworkError::UnknownPeer(peer_id));
        }
        self.outbox.push((peer_id, msg));
        Ok(())
    }

    fn timer_reset(&mut self, timer_kind: TimerKind, duration: Duration) {
        self.timer = Some((timer_kind, duration));
    }

    fn select_actions(
        &mut self,
        buf: &mut Vec<SelectedAction<String>>,
        max_actions: usize,
        _max_wait_time: Duration,
    ) -> bool {
        let count = max_actions.min(self.inbox.len());
        buf.extend(self.inbox.drain(..count));
        count == 0
    }
}

pub(crate) type SimState = RaftState<RecordingMachine, FlakyStorage>;

pub(crate) fn state(id: NodeId, members: &[NodeId]) -> SimState {
    state_with(id, members, Config::default(), FlakyStorage::default())
}

fn state_with(id: NodeId, members: &[NodeId], config: Config, storage: FlakyStorage) -> SimState {
    RaftState::new(
        id,
        members.to_vec(),
        config,
        RecordingMachine::default(),
        storage,
        StdRng::seed_from_u64(id),
    )
}

struct SimNode {
    state: Option<SimState>,
    // survives crashes
    storage: Option<FlakyStorage>,
    net: SimNetwork,
}

pub(crate) struct SimCluster {
    members: Vec<NodeId>,
    config: Config,
    nodes: BTreeMap<NodeId, SimNode>,
    queue: VecDeque<(NodeId, NodeId, Msg<String>)>,
    cut: HashSet<(NodeId, NodeId)>,
    // every (term, leader) ever observed
    leaders: BTreeMap<u64, BTreeSet<NodeId>>,
    // first command seen applied at each index, with the term of the node
    // that applied it (an upper bound on the commit term)
    applied_at: BTreeMap<u64, (String, u64)>,
}

impl SimCluster {
    pub(crate) fn new(size: u64) -> Self {
        Self::with_config(size, Config::default())
    }

    pub(crate) fn with_config(size: u64, config: Config) -> Self {
        let members: Vec<NodeId> = (1..=size).collect();
        let mut nodes = BTreeMap::new();
        for id in members.iter() {
            let mut net = SimNetwork::new(*id);
            let mut state = state_with(*id, &members, config.clone(), FlakyStorage::default());
            state.start(&mut net);
            nodes.insert(
                *id,
                SimNode {
                    state: Some(state),
                    storage: None,
                    net,
                },
            );
        }
        SimCluster {
            members,
            config,
            nodes,
            queue: VecDeque::new(),
            cut: HashSet::new(),
            leaders: BTreeMap::new(),
            applied_at: BTreeMap::new(),
        }
    }

    pub(crate) fn node(&self, id: NodeId) -> &SimState {
        self.nodes[&id].state.as_ref().expect("node is down")
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut SimState {
        self.nodes
            .get_mut(&id)
            .and_then(|n| n.state.as_mut())
            .expect("node is down")
    }

    pub(crate) fn is_up(&self, id: NodeId) -> bool {
        self.nodes[&id].state.is_some()
    }

    fn with_node<T>(&mut self, id: NodeId, f: impl FnOnce(&mut SimState, &mut SimNetwork) -> T) -> T {
        let node = self.nodes.get_mut(&id).expect("unknown node");
        let state = node.state.as_mut().expect("node is down");
        let result = f(state, &mut node.net);
        self.collect(id);
        self.observe();
        result
    }

    pub(crate) fn timeout(&mut self, id: NodeId) {
        self.with_node(id, |state, net| state.election_timeout(net))
            .expect("election timeout failed");
    }

    pub(crate) fn heartbeat(&mut self, id: NodeId) {
        self.with_node(id, |state, net| state.heartbeat_timeout(net));
    }

    pub(crate) fn propose(&mut self, id: NodeId, command: &str) -> Result<Proposal> {
        let command = command.to_string();
        self.with_node(id, |state, net| state.propose(net, command))
    }

    /// Queue a message as if `from` had sent it.
    pub(crate) fn inject(&mut self, from: NodeId, to: NodeId, msg: Msg<String>) {
        self.queue.push_back((from, to, msg));
    }

    /// Deliver one queued message. Returns the handler result, or None when
    /// the message was lost.
    pub(crate) fn deliver_one(&mut self) -> Option<Result<()>> {
        let (from, to, msg) = self.queue.pop_front()?;
        if self.cut.contains(&(from, to)) || !self.is_up(to) {
            return Some(Ok(()));
        }
        Some(self.with_node(to, |state, net| state.handle_rpc(net, from, msg)))
    }

    /// Deliver until the queue drains. Panics if a handler fails.
    pub(crate) fn deliver_all(&mut self) -> usize {
        let mut delivered = 0;
        while let Some(result) = self.deliver_one() {
            result.expect("handler failed");
            delivered += 1;
            assert!(delivered < 100_000, "message storm");
        }
        delivered
    }

    /// Throw away what `id` has queued but not yet delivered.
    pub(crate) fn drop_queued_from(&mut self, id: NodeId) {
        self.queue.retain(|(from, _, _)| *from != id);
    }

    pub(crate) fn isolate(&mut self, id: NodeId) {
        let others: Vec<NodeId> = self.members.iter().copied().filter(|o| *o != id).collect();
        self.partition(&[id], &others);
    }

    /// Cut every link between the two groups, both ways.
    pub(crate) fn partition(&mut self, left: &[NodeId], right: &[NodeId]) {
        for a in left {
            for b in right {
                self.cut.insert((*a, *b));
                self.cut.insert((*b, *a));
            }
        }
    }

    pub(crate) fn heal(&mut self) {
        self.cut.clear();
    }

    /// Stop `id`, keeping only what it persisted.
    pub(crate) fn crash(&mut self, id: NodeId) {
        let node = self.nodes.get_mut(&id).expect("unknown node");
        if let Some(state) = node.state.take() {
            node.storage = Some(state.into_storage());
        }
        node.net.take_outbox();
        self.drop_queued_from(id);
    }

    pub(crate) fn restart(&mut self, id: NodeId) {
        let members = self.members.clone();
        let config = self.config.clone();
        let node = self.nodes.get_mut(&id).expect("unknown node");
        let storage = node.storage.take().unwrap_or_default();
        let mut state = state_with(id, &members, config, storage);
        state.start(&mut node.net);
        node.state = Some(state);
    }

    pub(crate) fn set_fail_writes(&mut self, id: NodeId, fail: bool) {
        self.node_mut(id).storage_mut().fail_writes = fail;
    }

    /// Put entries straight into a node's log, as if it had received them
    /// from a leader that never told it about the commit.
    pub(crate) fn seed_log(&mut self, id: NodeId, entries: Vec<LogEntry<String>>) {
        self.node_mut(id)
            .storage_mut()
            .append_log(entries)
            .expect("seed log");
    }

    /// The live leader with the highest term, if any.
    pub(crate) fn leader(&self) -> Option<NodeId> {
        self.nodes
            .values()
            .filter_map(|n| n.state.as_ref())
            .filter(|s| s.role() == RaftRole::Leader)
            .max_by_key(|s| s.current_term())
            .map(|s| s.id())
    }

    pub(crate) fn applied(&self, id: NodeId) -> Vec<(u64, String)> {
        self.node(id).state_machine().applied.clone()
    }

    pub(crate) fn log_of(&self, id: NodeId) -> Vec<LogEntry<String>> {
        let state = self.node(id);
        state.storage().read_log(1, state.storage().last_index() + 1).to_vec()
    }

    pub(crate) fn leaders_in_term(&self, term: u64) -> BTreeSet<NodeId> {
        self.leaders.get(&term).cloned().unwrap_or_default()
    }

    fn collect(&mut self, id: NodeId) {
        let node = self.nodes.get_mut(&id).expect("unknown node");
        for (to, msg) in node.net.take_outbox() {
            self.queue.push_back((id, to, msg));
        }
    }

    /// Checks election safety, state machine safety and leader completeness
    /// after every step.
    fn observe(&mut self) {
        for node in self.nodes.values() {
            let state = match node.state.as_ref() {
                Some(state) => state,
                None => continue,
            };
            for (index, command) in state.state_machine().applied.iter() {
                let (first, _) = self
                    .applied_at
                    .entry(*index)
                    .or_insert_with(|| (command.clone(), state.current_term()));
                assert_eq!(first, command, "index {} applied differently", index);
            }
            if state.role() == RaftRole::Leader {
                let term = state.current_term();
                let leaders = self.leaders.entry(term).or_default();
                leaders.insert(state.id());
                assert!(leaders.len() <= 1, "two leaders in term {}: {:?}", term, leaders);

                for (index, (command, committed_by)) in self.applied_at.iter() {
                    if *committed_by < term {
                        assert_eq!(
                            Some(command),
                            state.storage().entry(*index).map(|e| &e.command),
                            "leader {} of term {} misses committed index {}",
                            state.id(),
                            term,
                            index
                        );
                    }
                }
            }
        }
    }

    /// Log Matching across every pair of live nodes.
    pub(crate) fn assert_logs_match(&self) {
        let logs: Vec<(NodeId, Vec<LogEntry<String>>)> = self
            .members
            .iter()
            .filter(|id| self.is_up(**id))
            .map(|id| (*id, self.log_of(*id)))
            .collect();
        for (a, log_a) in logs.iter() {
            for (b, log_b) in logs.iter() {
                let shared = log_a.len().min(log_b.len());
                if let Some(last_same) = (0..shared).rev().find(|i| log_a[*i].term == log_b[*i].term) {
                    assert_eq!(
                        log_a[..=last_same],
                        log_b[..=last_same],
                        "logs of {} and {} diverge before index {}",
                        a,
                        b,
                        last_same + 1
                    );
                }
            }
        }
    }
}
