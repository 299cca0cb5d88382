use std::fmt::{self, Debug};
use std::time::Duration;

use rand::rngs::StdRng;

use crate::config::Config;
use crate::error::Result;
use crate::raft_message::Msg;
use crate::raft_network::{RaftNetwork, TimerKind};
use crate::timer::random_election_timeout;
use crate::utils;
use crate::{NodeId, StateMachine, Storage};

mod election;
mod replication;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for RaftRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Point-in-time view of a node, for clients and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: RaftRole,
    pub term: u64,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

/// Leader's view of one follower's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Progress {
    pub(crate) next_index: u64,
    pub(crate) match_index: u64,
}

#[derive(Debug)]
pub(crate) enum RoleState {
    Follower,
    Candidate {
        // Stores peers's vote
        votes: PeerInfos<bool>,
    },
    Leader {
        progress: PeerInfos<Progress>,
    },
}

#[derive(Debug)]
pub(crate) struct PeerInfos<T: Copy + Debug>(Vec<(NodeId, T)>);

impl<T: Copy + Debug> PeerInfos<T> {
    pub(crate) fn new() -> Self {
        PeerInfos(Vec::new())
    }

    pub(crate) fn insert(&mut self, peer_id: NodeId, data: T) {
        if let Some(item) = self.0.iter_mut().find(|item| item.0 == peer_id) {
            item.1 = data;
        } else {
            self.0.push((peer_id, data));
        }
    }

    pub(crate) fn get(&self, peer_id: NodeId) -> Option<T> {
        self.0
            .iter()
            .find(|item| item.0 == peer_id)
            .map(|item| item.1)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (NodeId, T)> + '_ {
        self.0.iter().copied()
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = T> + Clone + ExactSizeIterator + '_ {
        self.0.iter().map(|item| item.1)
    }
}

/// The consensus core of one node. Owns the persistent state (through
/// `Storage`), the volatile commit/apply indexes and the role.
///
/// All mutation goes through `&mut self`, so whoever owns the value is the
/// single serialization point. Outbound traffic and timers go through the
/// `RaftNetwork` passed into each call.
pub(crate) struct RaftState<SM, S>
where
    SM: StateMachine,
    S: Storage<Command = SM::Command>,
{
    id: NodeId,
    // every other voter, never includes `id`
    peers: Vec<NodeId>,
    config: Config,

    // Persistent state
    storage: S,
    sm: SM,

    // Volatile state
    commit_index: u64,
    last_applied: u64,
    leader_id: Option<NodeId>,
    role_state: RoleState,

    rng: StdRng,
}

impl<SM, S> Debug for RaftState<SM, S>
where
    SM: StateMachine,
    S: Storage<Command = SM::Command>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaftState")
            .field("id", &self.id)
            .field("curr_term", &self.storage.current_term())
            .field("voted_for", &self.storage.voted_for())
            .field("commit_index", &self.commit_index)
            .field("last_applied", &self.last_applied)
            .field("role_state", &self.role().to_string())
            .finish()
    }
}

impl<SM, S> RaftState<SM, S>
where
    SM: StateMachine,
    S: Storage<Command = SM::Command>,
{
    pub(crate) fn new(
        id: NodeId,
        peers: Vec<NodeId>,
        config: Config,
        sm: SM,
        storage: S,
        rng: StdRng,
    ) -> Self {
        let mut peers: Vec<NodeId> = peers.into_iter().filter(|p| *p != id).collect();
        peers.sort_unstable();
        peers.dedup();

        RaftState {
            id,
            peers,
            config,

            storage,
            sm,

            commit_index: 0,
            last_applied: 0,
            leader_id: None,
            role_state: RoleState::Follower,

            rng,
        }
    }

    /// Arm the first election timer. Every node starts as a follower.
    pub(crate) fn start<N>(&mut self, net: &mut N)
    where
        N: RaftNetwork<Command = SM::Command>,
    {
        log::info!(
            "[{}] Starting as follower at term {}, last log index {}",
            self.id,
            self.current_term(),
            self.storage.last_index()
        );
        self.reset_election_timer(net);
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn current_term(&self) -> u64 {
        self.storage.current_term()
    }

    pub(crate) fn role(&self) -> RaftRole {
        match self.role_state {
            RoleState::Follower => RaftRole::Follower,
            RoleState::Candidate { .. } => RaftRole::Candidate,
            RoleState::Leader { .. } => RaftRole::Leader,
        }
    }

    pub(crate) fn is_leader(&self) -> bool {
        matches!(self.role_state, RoleState::Leader { .. })
    }

    pub(crate) fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub(crate) fn term_at(&self, index: u64) -> Option<u64> {
        self.storage.term_at(index)
    }

    pub(crate) fn status(&self) -> NodeStatus {
        let (last_log_index, last_log_term) = self.storage.last_log_index_term();
        NodeStatus {
            id: self.id,
            role: self.role(),
            term: self.current_term(),
            voted_for: self.storage.voted_for(),
            leader_id: self.leader_id,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index,
            last_log_term,
        }
    }

    #[cfg(test)]
    pub(crate) fn storage(&self) -> &S {
        &self.storage
    }

    #[cfg(test)]
    pub(crate) fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    #[cfg(test)]
    pub(crate) fn state_machine(&self) -> &SM {
        &self.sm
    }

    #[cfg(test)]
    pub(crate) fn into_storage(self) -> S {
        self.storage
    }

    fn quorum(&self) -> usize {
        utils::quorum_size(self.peers.len() + 1)
    }

    fn reset_election_timer<N>(&mut self, net: &mut N)
    where
        N: RaftNetwork<Command = SM::Command>,
    {
        let timeout = random_election_timeout(&mut self.rng, &self.config);
        net.timer_reset(TimerKind::Election, timeout);
    }

    fn reset_heartbeat_timer<N>(&mut self, net: &mut N)
    where
        N: RaftNetwork<Command = SM::Command>,
    {
        let interval: Duration = self.config.heartbeat_interval();
        net.timer_reset(TimerKind::Heartbeat, interval);
    }

    fn send<N>(&self, net: &mut N, peer_id: NodeId, msg: Msg<SM::Command>)
    where
        N: RaftNetwork<Command = SM::Command>,
    {
        let kind = msg.kind();
        if let Err(e) = net.send(peer_id, msg) {
            log::debug!("[{}] Dropped {} to {}: {}", self.id, kind, peer_id, e);
        }
    }

    /// Adopt `term` if it is newer than ours, reverting to follower.
    /// Returns whether the term changed.
    fn observe_term<N>(&mut self, net: &mut N, term: u64) -> Result<bool>
    where
        N: RaftNetwork<Command = SM::Command>,
    {
        if term <= self.current_term() {
            return Ok(false);
        }
        log::info!(
            "[{}] Observed term {} above current term {} as {}, become follower",
            self.id,
            term,
            self.current_term(),
            self.role()
        );
        self.storage.persist_term(term)?;
        self.leader_id = None;
        self.become_follower(net);
        Ok(true)
    }

    fn become_follower<N>(&mut self, net: &mut N)
    where
        N: RaftNetwork<Command = SM::Command>,
    {
        if !matches!(self.role_state, RoleState::Follower) {
            self.role_state = RoleState::Follower;
            self.reset_election_timer(net);
        }
    }

    /// Dispatch one inbound message from `peer_id`.
    pub(crate) fn handle_rpc<N>(
        &mut self,
        net: &mut N,
        peer_id: NodeId,
        msg: Msg<SM::Command>,
    ) -> Result<()>
    where
        N: RaftNetwork<Command = SM::Command>,
    {
        if !self.peers.contains(&peer_id) {
            log::warn!(
                "[{}] Drop {} from unknown node {}",
                self.id,
                msg.kind(),
                peer_id
            );
            return Ok(());
        }
        self.observe_term(net, msg.term())?;

        match msg {
            Msg::AppendEntries(data) => {
                let resp = self.append_entries(net, data)?;
                self.send(net, peer_id, Msg::AppendEntriesResponse(resp));
            }
            Msg::AppendEntriesResponse(data) => self.append_entries_response(net, peer_id, data)?,
            Msg::RequestVote(data) => {
                let resp = self.request_vote(net, data)?;
                self.send(net, peer_id, Msg::RequestVoteResponse(resp));
            }
            Msg::RequestVoteResponse(data) => self.request_vote_response(net, peer_id, data)?,
        }
        Ok(())
    }

    /// Raise the commit index (never lower it) and apply what became
    /// committed.
    fn commit_to(&mut self, index: u64) {
        if index > self.commit_index {
            log::debug!(
                "[{}] Commit index {} -> {}",
                self.id,
                self.commit_index,
                index
            );
            self.commit_index = index;
            self.apply_committed();
        }
    }

    /// Hand committed but unapplied entries to the state machine, in order.
    pub(crate) fn apply_committed(&mut self) -> bool {
        if self.commit_index <= self.last_applied {
            return false;
        }
        let entries = self
            .storage
            .read_log(self.last_applied + 1, self.commit_index + 1);
        let last = match entries.last() {
            Some(entry) => entry.index,
            None => return false,
        };
        self.sm
            .apply_batch(entries.iter().map(|entry| (entry.index, &entry.command)));
        self.last_applied = last;
        true
    }
}
