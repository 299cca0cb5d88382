use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};

use crate::error::{RaftError, Result};
use crate::raft_state::NodeStatus;
use crate::NodeId;

/// Where a proposal landed in the leader's log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Proposal {
    pub index: u64,
    pub term: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Applied locally after commit
    Committed { index: u64, term: u64 },
    /// Not the leader; retry at the hinted node if known
    Redirect { leader: Option<NodeId> },
    /// Not known to be committed: timed out, or the slot was taken by
    /// another leader's entry
    NotCommitted,
}

#[derive(Debug)]
pub enum ClientRequest<C> {
    Propose {
        command: C,
        reply: Sender<Result<Proposal>>,
        // notified once the proposed index is applied or overwritten
        commit: Option<Sender<SubmitOutcome>>,
    },
    Status {
        reply: Sender<NodeStatus>,
    },
    Shutdown,
}

/// Handle for talking to one node's event loop.
#[derive(Clone, Debug)]
pub struct RaftClient<C> {
    node_id: NodeId,
    tx: Sender<ClientRequest<C>>,
}

impl<C> RaftClient<C> {
    pub fn new(node_id: NodeId, tx: Sender<ClientRequest<C>>) -> Self {
        RaftClient { node_id, tx }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn request(&self, request: ClientRequest<C>) -> Result<()> {
        self.tx
            .send(request)
            .map_err(|_| RaftError::Stopped(self.node_id))
    }

    /// Append `command` on the leader and return without waiting for commit.
    pub fn propose(&self, command: C) -> Result<Proposal> {
        let (reply, reply_rx) = bounded(1);
        self.request(ClientRequest::Propose {
            command,
            reply,
            commit: None,
        })?;
        reply_rx
            .recv()
            .map_err(|_| RaftError::Stopped(self.node_id))?
    }

    /// Propose `command` and wait up to `timeout` for it to be applied on this
    /// node. A quorum that stays unreachable shows up as `NotCommitted`.
    pub fn submit(&self, command: C, timeout: Duration) -> Result<SubmitOutcome> {
        let deadline = Instant::now() + timeout;
        let (reply, reply_rx) = bounded(1);
        let (commit, commit_rx) = bounded(1);
        self.request(ClientRequest::Propose {
            command,
            reply,
            commit: Some(commit),
        })?;

        let proposal = match reply_rx.recv_timeout(timeout) {
            Ok(Ok(proposal)) => proposal,
            Ok(Err(RaftError::NotLeader(leader))) => {
                return Ok(SubmitOutcome::Redirect { leader });
            }
            Ok(Err(e)) => return Err(e),
            Err(RecvTimeoutError::Timeout) => return Ok(SubmitOutcome::NotCommitted),
            Err(RecvTimeoutError::Disconnected) => return Err(RaftError::Stopped(self.node_id)),
        };
        log::debug!(
            "[{}] Proposal accepted at index {} term {}",
            self.node_id,
            proposal.index,
            proposal.term
        );

        let remaining = deadline.saturating_duration_since(Instant::now());
        match commit_rx.recv_timeout(remaining) {
            Ok(outcome) => Ok(outcome),
            Err(RecvTimeoutError::Timeout) => Ok(SubmitOutcome::NotCommitted),
            Err(RecvTimeoutError::Disconnected) => Err(RaftError::Stopped(self.node_id)),
        }
    }

    pub fn status(&self) -> Result<NodeStatus> {
        let (reply, reply_rx) = bounded(1);
        self.request(ClientRequest::Status { reply })?;
        reply_rx.recv().map_err(|_| RaftError::Stopped(self.node_id))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.request(ClientRequest::Shutdown)
    }
}
