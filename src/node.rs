use std::collections::BTreeMap;
use std::thread::{self, JoinHandle};

use crossbeam::channel::Sender;
use rand::rngs::StdRng;
use rand_core::SeedableRng;

use crate::client::{ClientRequest, SubmitOutcome};
use crate::config::Config;
use crate::error::{RaftError, Result};
use crate::raft_network::{SelectedAction, TimerKind};
use crate::raft_state::RaftState;
use crate::{NodeId, RaftNetwork, StateMachine, Storage};

struct PendingCommit {
    term: u64,
    notify: Sender<SubmitOutcome>,
}

/// One Raft node: the consensus state plus its network endpoint, driven by
/// a single event loop thread.
pub struct Node<SM, S, N>
where
    SM: StateMachine,
    S: Storage<Command = SM::Command>,
    N: RaftNetwork<Command = SM::Command>,
{
    id: NodeId,
    state: RaftState<SM, S>,
    network: N,
    // submitters waiting for an index to be applied
    pending: BTreeMap<u64, PendingCommit>,
    stopped: bool,
}

impl<SM, S, N> Node<SM, S, N>
where
    SM: StateMachine,
    S: Storage<Command = SM::Command>,
    N: RaftNetwork<Command = SM::Command>,
{
    pub fn new(
        node_id: NodeId,
        peers: Vec<NodeId>,
        config: Config,
        sm: SM,
        storage: S,
        network: N,
    ) -> Result<Self> {
        config.validate()?;
        let state = RaftState::new(node_id, peers, config, sm, storage, StdRng::from_entropy());
        Ok(Self::with_state(state, network))
    }

    fn with_state(state: RaftState<SM, S>, network: N) -> Self {
        Node {
            id: state.id(),
            state,
            network,
            pending: BTreeMap::new(),
            stopped: false,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Run the event loop on its own thread until shutdown or a fatal
    /// storage error, which is returned from the thread.
    pub fn start_loop(mut self) -> JoinHandle<Result<()>> {
        thread::spawn(move || {
            log::info!("[{}] Start node event loop", self.id);
            self.state.start(&mut self.network);
            let mut action_buf = Vec::new();

            while !self.stopped {
                if let Err(e) = self.tick(&mut action_buf) {
                    log::error!("[{}] Node event loop stopped: {}", self.id, e);
                    return Err(e);
                }
            }
            log::info!("[{}] Node event loop shut down", self.id);
            Ok(())
        })
    }

    /// Handle one batch of actions. Returns whether the wait ran out with
    /// nothing to do.
    pub fn tick(&mut self, action_buf: &mut Vec<SelectedAction<SM::Command>>) -> Result<bool> {
        let (max_actions, wait) = {
            let config = self.state.config();
            (config.max_actions_per_tick, config.tick_wait())
        };
        let timed_out = self.network.select_actions(action_buf, max_actions, wait);
        log::trace!(
            "[{}] Node: {:?}, Actions: {:?}, Network: {:?}",
            self.id,
            self.state,
            action_buf,
            self.network
        );

        let result = self.handle_actions(action_buf);
        action_buf.clear();
        self.notify_applied();
        result.map(|_| timed_out)
    }

    fn handle_actions(&mut self, action_buf: &mut Vec<SelectedAction<SM::Command>>) -> Result<()> {
        for action in action_buf.drain(..) {
            match action {
                SelectedAction::Timer(timer_kind) => self.handle_timer(timer_kind)?,
                SelectedAction::Client(request) => self.handle_client(request)?,
                SelectedAction::Peer(id, msg) => self.state.handle_rpc(&mut self.network, id, msg)?,
            }
            if self.stopped {
                break;
            }
        }
        Ok(())
    }

    fn handle_timer(&mut self, timer_kind: TimerKind) -> Result<()> {
        match timer_kind {
            TimerKind::Election => self.state.election_timeout(&mut self.network),
            TimerKind::Heartbeat => {
                self.state.heartbeat_timeout(&mut self.network);
                Ok(())
            }
        }
    }

    fn handle_client(&mut self, request: ClientRequest<SM::Command>) -> Result<()> {
        match request {
            ClientRequest::Propose {
                command,
                reply,
                commit,
            } => match self.state.propose(&mut self.network, command) {
                Ok(proposal) => {
                    if let Some(notify) = commit {
                        let waiting = PendingCommit {
                            term: proposal.term,
                            notify,
                        };
                        if let Some(replaced) = self.pending.insert(proposal.index, waiting) {
                            let _ = replaced.notify.send(SubmitOutcome::NotCommitted);
                        }
                    }
                    let _ = reply.send(Ok(proposal));
                }
                Err(RaftError::Storage(e)) => {
                    let _ = reply.send(Err(RaftError::Stopped(self.id)));
                    return Err(RaftError::Storage(e));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            ClientRequest::Status { reply } => {
                let _ = reply.send(self.state.status());
            }
            ClientRequest::Shutdown => {
                log::info!("[{}] Shutdown requested", self.id);
                self.stopped = true;
            }
        }
        Ok(())
    }

    // resolve submitters whose index has been applied or lost
    fn notify_applied(&mut self) {
        let last_applied = self.state.last_applied();
        while let Some(waiting) = self.pending.first_entry() {
            let index = *waiting.key();
            if index > last_applied {
                break;
            }
            let waiting = waiting.remove();
            let outcome = match self.state.term_at(index) {
                Some(term) if term == waiting.term => SubmitOutcome::Committed { index, term },
                _ => SubmitOutcome::NotCommitted,
            };
            let _ = waiting.notify.send(outcome);
        }

        // a truncated or overwritten entry can never commit
        let state = &self.state;
        self.pending.retain(|index, waiting| {
            if state.term_at(*index) == Some(waiting.term) {
                return true;
            }
            let _ = waiting.notify.send(SubmitOutcome::NotCommitted);
            false
        });
    }

    #[cfg(test)]
    fn network_mut(&mut self) -> &mut N {
        &mut self.network
    }
}

#[cfg(test)]
mod tests {
    use crossbeam::channel::bounded;

    use super::Node;
    use crate::client::{ClientRequest, Proposal, SubmitOutcome};
    use crate::config::Config;
    use crate::error::RaftError;
    use crate::raft_message::{AppendEntries, Msg, RequestVoteResponse};
    use crate::raft_network::{SelectedAction, TimerKind};
    use crate::raft_state::{RaftRole, RaftState};
    use crate::sim::{FlakyStorage, RecordingMachine, SimNetwork};
    use crate::{LogEntry, NodeId};

    type TestNode = Node<RecordingMachine, FlakyStorage, SimNetwork>;

    fn node(id: NodeId, members: &[NodeId]) -> TestNode {
        let state = RaftState::new(
            id,
            members.to_vec(),
            Config::default(),
            RecordingMachine::default(),
            FlakyStorage::default(),
            rand_core::SeedableRng::seed_from_u64(id),
        );
        Node::with_state(state, SimNetwork::new(id))
    }

    fn tick(node: &mut TestNode, actions: Vec<SelectedAction<String>>) -> Result<bool, RaftError> {
        for action in actions {
            node.network_mut().push_action(action);
        }
        node.tick(&mut Vec::new())
    }

    #[test]
    fn rejects_invalid_config() {
        let config = Config::default().with_election_timeout(100, 50);
        let result = Node::new(
            1,
            vec![1, 2, 3],
            config,
            RecordingMachine::default(),
            FlakyStorage::default(),
            SimNetwork::new(1),
        );
        assert!(matches!(result, Err(RaftError::Config(_))));
    }

    #[test]
    fn idle_tick_times_out() {
        let mut node = node(1, &[1, 2, 3]);
        assert!(tick(&mut node, vec![]).unwrap());
    }

    #[test]
    fn submit_on_single_node_commits() {
        let mut node = node(1, &[1]);
        tick(&mut node, vec![SelectedAction::Timer(TimerKind::Election)]).unwrap();
        assert_eq!(RaftRole::Leader, node.state.role());

        let (reply, reply_rx) = bounded(1);
        let (commit, commit_rx) = bounded(1);
        let request = ClientRequest::Propose {
            command: "x=1".to_string(),
            reply,
            commit: Some(commit),
        };
        let timed_out = tick(&mut node, vec![SelectedAction::Client(request)]).unwrap();
        assert!(!timed_out);

        assert_eq!(Proposal { index: 1, term: 1 }, reply_rx.recv().unwrap().unwrap());
        assert_eq!(
            SubmitOutcome::Committed { index: 1, term: 1 },
            commit_rx.recv().unwrap()
        );
        assert!(node.pending.is_empty());
    }

    #[test]
    fn follower_reports_leader_hint() {
        let mut node = node(1, &[1, 2, 3]);
        let heartbeat = Msg::AppendEntries(AppendEntries {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        });
        let (reply, reply_rx) = bounded(1);
        let request = ClientRequest::Propose {
            command: "x=1".to_string(),
            reply,
            commit: None,
        };
        tick(
            &mut node,
            vec![SelectedAction::Peer(2, heartbeat), SelectedAction::Client(request)],
        )
        .unwrap();
        assert!(matches!(reply_rx.recv().unwrap(), Err(RaftError::NotLeader(Some(2)))));
    }

    #[test]
    fn overwritten_entry_is_not_committed() {
        let mut node = node(1, &[1, 2, 3]);
        let (reply, _reply_rx) = bounded(1);
        let (commit, commit_rx) = bounded(1);
        // leader of term 1 accepts a proposal at index 1
        node.state.election_timeout(&mut node.network).unwrap();
        let granted = RequestVoteResponse {
            term: 1,
            vote_granted: true,
        };
        node.state
            .handle_rpc(&mut node.network, 2, Msg::RequestVoteResponse(granted))
            .unwrap();
        assert_eq!(RaftRole::Leader, node.state.role());
        tick(
            &mut node,
            vec![SelectedAction::Client(ClientRequest::Propose {
                command: "mine".to_string(),
                reply,
                commit: Some(commit),
            })],
        )
        .unwrap();

        // a term 2 leader replaces index 1 and commits it
        let replace = Msg::AppendEntries(AppendEntries {
            term: 2,
            leader_id: 3,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![LogEntry {
                index: 1,
                term: 2,
                command: "theirs".to_string(),
            }],
            leader_commit: 1,
        });
        tick(&mut node, vec![SelectedAction::Peer(3, replace)]).unwrap();
        assert_eq!(SubmitOutcome::NotCommitted, commit_rx.recv().unwrap());
    }

    #[test]
    fn truncated_proposals_are_resolved_without_commit() {
        let mut node = node(1, &[1, 2, 3]);
        node.state.election_timeout(&mut node.network).unwrap();
        let granted = RequestVoteResponse {
            term: 1,
            vote_granted: true,
        };
        node.state
            .handle_rpc(&mut node.network, 2, Msg::RequestVoteResponse(granted))
            .unwrap();

        let mut commits = Vec::new();
        for command in ["a", "b"] {
            let (reply, _reply_rx) = bounded(1);
            let (commit, commit_rx) = bounded(1);
            tick(
                &mut node,
                vec![SelectedAction::Client(ClientRequest::Propose {
                    command: command.to_string(),
                    reply,
                    commit: Some(commit),
                })],
            )
            .unwrap();
            commits.push(commit_rx);
        }
        assert_eq!(2, node.pending.len());

        // a term 2 leader shortens the log to one entry of its own, commit unknown
        let replace = Msg::AppendEntries(AppendEntries {
            term: 2,
            leader_id: 3,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![LogEntry {
                index: 1,
                term: 2,
                command: "theirs".to_string(),
            }],
            leader_commit: 0,
        });
        tick(&mut node, vec![SelectedAction::Peer(3, replace)]).unwrap();
        assert_eq!(RaftRole::Follower, node.state.role());
        assert_eq!(0, node.state.last_applied());
        for commit_rx in commits {
            assert_eq!(SubmitOutcome::NotCommitted, commit_rx.try_recv().unwrap());
        }
        assert!(node.pending.is_empty());
    }

    #[test]
    fn storage_failure_stops_the_node() {
        let mut node = node(1, &[1]);
        tick(&mut node, vec![SelectedAction::Timer(TimerKind::Election)]).unwrap();
        node.state.storage_mut().fail_writes = true;

        let (reply, reply_rx) = bounded(1);
        let request = ClientRequest::Propose {
            command: "x=1".to_string(),
            reply,
            commit: None,
        };
        let result = tick(&mut node, vec![SelectedAction::Client(request)]);
        assert!(matches!(result, Err(RaftError::Storage(_))));
        assert!(matches!(reply_rx.recv().unwrap(), Err(RaftError::Stopped(1))));
    }

    #[test]
    fn shutdown_stops_handling() {
        let mut node = node(1, &[1]);
        let (reply, reply_rx) = bounded(1);
        tick(
            &mut node,
            vec![
                SelectedAction::Client(ClientRequest::Shutdown),
                SelectedAction::Client(ClientRequest::Status { reply }),
            ],
        )
        .unwrap();
        assert!(node.stopped);
        // the status request after shutdown is dropped unanswered
        assert!(reply_rx.recv().is_err());
    }
}
