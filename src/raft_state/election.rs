use crate::error::Result;
use crate::raft_message::{Msg, RequestVote, RequestVoteResponse};
use crate::raft_network::RaftNetwork;
use crate::{NodeId, StateMachine, Storage};

use super::{PeerInfos, Progress, RaftState, RoleState};

impl<SM, S> RaftState<SM, S>
where
    SM: StateMachine,
    S: Storage<Command = SM::Command>,
{
    /// Start an election at the next term. Leaders ignore this; their timer
    /// is the heartbeat.
    pub(crate) fn election_timeout<N>(&mut self, net: &mut N) -> Result<()>
    where
        N: RaftNetwork<Command = SM::Command>,
    {
        if self.is_leader() {
            log::debug!("[{}] Ignore election timeout as leader", self.id);
            return Ok(());
        }

        let term = self.current_term() + 1;
        // the self-vote is durable before anyone can see the new term
        self.storage.persist_vote(term, self.id)?;
        self.leader_id = None;

        let mut votes = PeerInfos::new();
        votes.insert(self.id, true);
        self.role_state = RoleState::Candidate { votes };
        self.reset_election_timer(net);

        log::info!(
            "[{}] Election timeout, self promote for term {}",
            self.id,
            term
        );

        if self.has_vote_quorum() {
            return self.become_leader(net);
        }

        let (last_log_index, last_log_term) = self.storage.last_log_index_term();
        let request = RequestVote {
            term,
            candidate_id: self.id,
            last_log_index,
            last_log_term,
        };
        let failures = net.send_all(
            self.peers
                .iter()
                .map(|peer_id| (*peer_id, Msg::RequestVote(request.clone()))),
        );
        for e in failures {
            log::debug!("[{}] RequestVote not sent: {}", self.id, e);
        }
        Ok(())
    }

    /// Decide a vote. A granted vote is durable before the response is
    /// returned, and pushes our own election further out.
    pub(crate) fn request_vote<N>(
        &mut self,
        net: &mut N,
        request_vote: RequestVote,
    ) -> Result<RequestVoteResponse>
    where
        N: RaftNetwork<Command = SM::Command>,
    {
        self.observe_term(net, request_vote.term)?;

        let vote_granted = if request_vote.term < self.current_term() {
            false
        } else {
            match self.storage.voted_for() {
                Some(id) if id != request_vote.candidate_id => false,
                _ => self.is_log_up_to_date(request_vote.last_log_term, request_vote.last_log_index),
            }
        };

        if vote_granted {
            self.storage
                .persist_vote(request_vote.term, request_vote.candidate_id)?;
            self.reset_election_timer(net);
        }

        log::debug!(
            "[{}] RequestVote from {} for term {}: granted={}",
            self.id,
            request_vote.candidate_id,
            request_vote.term,
            vote_granted
        );

        Ok(RequestVoteResponse {
            term: self.current_term(),
            vote_granted,
        })
    }

    pub(crate) fn request_vote_response<N>(
        &mut self,
        net: &mut N,
        peer_id: NodeId,
        request_vote_response: RequestVoteResponse,
    ) -> Result<()>
    where
        N: RaftNetwork<Command = SM::Command>,
    {
        if self.observe_term(net, request_vote_response.term)? {
            return Ok(());
        }
        if request_vote_response.term != self.current_term() {
            log::debug!(
                "[{}] Ignore vote from {} for stale term {}",
                self.id,
                peer_id,
                request_vote_response.term
            );
            return Ok(());
        }

        if let RoleState::Candidate { votes } = &mut self.role_state {
            votes.insert(peer_id, request_vote_response.vote_granted);
        } else {
            return Ok(());
        }

        if self.has_vote_quorum() {
            self.become_leader(net)?;
        }
        Ok(())
    }

    /// Candidate log `(last_term, last_index)` is at least ours, compared
    /// by term first.
    fn is_log_up_to_date(&self, last_log_term: u64, last_log_index: u64) -> bool {
        let (our_index, our_term) = self.storage.last_log_index_term();
        (last_log_term, last_log_index) >= (our_term, our_index)
    }

    fn has_vote_quorum(&self) -> bool {
        match &self.role_state {
            RoleState::Candidate { votes } => {
                votes.values().filter(|vote_granted| *vote_granted).count() >= self.quorum()
            }
            _ => false,
        }
    }

    fn become_leader<N>(&mut self, net: &mut N) -> Result<()>
    where
        N: RaftNetwork<Command = SM::Command>,
    {
        let next_index = self.storage.last_index() + 1;
        let mut progress = PeerInfos::new();
        for peer_id in self.peers.iter() {
            progress.insert(
                *peer_id,
                Progress {
                    next_index,
                    match_index: 0,
                },
            );
        }

        log::info!(
            "[{}] Received quorum votes, become leader for term {}",
            self.id,
            self.current_term()
        );
        self.role_state = RoleState::Leader { progress };
        self.leader_id = Some(self.id);
        self.reset_heartbeat_timer(net);
        self.replicate(net, true);
        self.advance_commit_index();
        Ok(())
    }
}
