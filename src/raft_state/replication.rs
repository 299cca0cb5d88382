use crate::client::Proposal;
use crate::error::{RaftError, Result};
use crate::raft_message::{AppendEntries, AppendEntriesResponse, ConflictHint, Msg};
use crate::raft_network::RaftNetwork;
use crate::utils;
use crate::{LogEntry, NodeId, StateMachine, Storage};

use super::{Progress, RaftState, RoleState};

impl<SM, S> RaftState<SM, S>
where
    SM: StateMachine,
    S: Storage<Command = SM::Command>,
{
    /// Append `command` to the leader's log and start replicating it.
    /// Returns as soon as the entry is durable locally; commit is observed
    /// later through the apply path.
    pub(crate) fn propose<N>(&mut self, net: &mut N, command: SM::Command) -> Result<Proposal>
    where
        N: RaftNetwork<Command = SM::Command>,
    {
        if !self.is_leader() {
            log::info!("[{}] Reject proposal as {}", self.id, self.role());
            return Err(RaftError::NotLeader(self.leader_id));
        }

        let term = self.current_term();
        let index = self.storage.last_index() + 1;
        self.storage.append_log(vec![LogEntry {
            index,
            term,
            command,
        }])?;
        log::debug!("[{}] Appended proposal at index {} term {}", self.id, index, term);

        self.advance_commit_index();
        self.replicate(net, false);
        Ok(Proposal { index, term })
    }

    pub(crate) fn heartbeat_timeout<N>(&mut self, net: &mut N)
    where
        N: RaftNetwork<Command = SM::Command>,
    {
        if self.is_leader() {
            log::trace!("[{}] Heartbeat timeout, sending out heartbeats", self.id);
            self.replicate(net, true);
            self.reset_heartbeat_timer(net);
        } else {
            self.reset_election_timer(net);
        }
    }

    /// Send AppendEntries to every follower that is behind, or to all of
    /// them when `is_heartbeat`.
    pub(crate) fn replicate<N>(&self, net: &mut N, is_heartbeat: bool)
    where
        N: RaftNetwork<Command = SM::Command>,
    {
        let progress = match &self.role_state {
            RoleState::Leader { progress } => progress,
            _ => return,
        };
        let requests: Vec<(NodeId, Msg<SM::Command>)> = progress
            .iter()
            .map(|(peer_id, p)| (peer_id, self.append_request(p.next_index)))
            .filter(|(_, append)| is_heartbeat || !append.entries.is_empty())
            .map(|(peer_id, append)| (peer_id, Msg::AppendEntries(append)))
            .collect();

        for e in net.send_all(requests.into_iter()) {
            log::debug!("[{}] AppendEntries not sent: {}", self.id, e);
        }
    }

    fn append_request(&self, next_index: u64) -> AppendEntries<SM::Command> {
        let next_index = next_index.clamp(1, self.storage.last_index() + 1);
        let prev_log_index = next_index - 1;
        let to_index = next_index.saturating_add(self.config.max_entries_per_append as u64);
        AppendEntries {
            term: self.current_term(),
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.storage.term_at(prev_log_index).unwrap_or(0),
            entries: self.storage.read_log(next_index, to_index).to_vec(),
            leader_commit: self.commit_index,
        }
    }

    /// Follower side of replication. Everything the response acknowledges
    /// is durable before it is returned.
    pub(crate) fn append_entries<N>(
        &mut self,
        net: &mut N,
        append_entries: AppendEntries<SM::Command>,
    ) -> Result<AppendEntriesResponse>
    where
        N: RaftNetwork<Command = SM::Command>,
    {
        self.observe_term(net, append_entries.term)?;

        let prev_log_index = append_entries.prev_log_index;
        let reject = |term: u64, conflict: Option<ConflictHint>| AppendEntriesResponse {
            term,
            success: false,
            match_index: 0,
            prev_log_index,
            conflict,
        };

        let current_term = self.current_term();
        if append_entries.term < current_term {
            log::debug!(
                "[{}] Reject AppendEntries from {} with stale term {}",
                self.id,
                append_entries.leader_id,
                append_entries.term
            );
            return Ok(reject(current_term, None));
        }

        match self.role_state {
            RoleState::Leader { .. } => {
                log::warn!(
                    "[{}] AppendEntries from {} claims leadership of my term {}",
                    self.id,
                    append_entries.leader_id,
                    current_term
                );
                return Ok(reject(current_term, None));
            }
            RoleState::Candidate { .. } => {
                log::info!(
                    "[{}] Leader {} found for term {}, abandon candidacy",
                    self.id,
                    append_entries.leader_id,
                    current_term
                );
                self.role_state = RoleState::Follower;
            }
            RoleState::Follower => {}
        }
        self.leader_id = Some(append_entries.leader_id);
        self.reset_election_timer(net);

        if let Some(conflict) = self.check_prev_entry(prev_log_index, append_entries.prev_log_term) {
            log::debug!(
                "[{}] Log mismatch at prev index {}, hint {:?}",
                self.id,
                prev_log_index,
                conflict
            );
            return Ok(reject(current_term, Some(conflict)));
        }

        let contiguous = append_entries
            .entries
            .iter()
            .enumerate()
            .all(|(i, e)| e.index == prev_log_index + 1 + i as u64);
        if !contiguous {
            log::warn!("[{}] Drop AppendEntries with non-contiguous entries", self.id);
            return Ok(reject(current_term, None));
        }

        let last_new_index = prev_log_index + append_entries.entries.len() as u64;
        let mut new_entries = Vec::new();
        for entry in append_entries.entries {
            if !new_entries.is_empty() {
                new_entries.push(entry);
                continue;
            }
            match self.storage.term_at(entry.index) {
                Some(term) if term == entry.term => {}
                Some(_) => {
                    if entry.index <= self.commit_index {
                        log::error!(
                            "[{}] Refuse to truncate committed index {} (commit index {})",
                            self.id,
                            entry.index,
                            self.commit_index
                        );
                        return Ok(reject(current_term, None));
                    }
                    log::info!(
                        "[{}] Truncate conflicting log suffix from index {}",
                        self.id,
                        entry.index
                    );
                    self.storage.truncate_log_from(entry.index)?;
                    new_entries.push(entry);
                }
                None => new_entries.push(entry),
            }
        }
        if !new_entries.is_empty() {
            log::debug!(
                "[{}] Append {} entries after index {}",
                self.id,
                new_entries.len(),
                new_entries[0].index - 1
            );
            self.storage.append_log(new_entries)?;
        }

        if append_entries.leader_commit > self.commit_index {
            self.commit_to(append_entries.leader_commit.min(last_new_index));
        }

        Ok(AppendEntriesResponse {
            term: current_term,
            success: true,
            match_index: last_new_index,
            prev_log_index,
            conflict: None,
        })
    }

    // None when our log holds `prev_log_index` at `prev_log_term`
    fn check_prev_entry(&self, prev_log_index: u64, prev_log_term: u64) -> Option<ConflictHint> {
        match self.storage.term_at(prev_log_index) {
            Some(term) if term == prev_log_term => None,
            Some(term) => {
                let mut first = prev_log_index;
                while first > 1 && self.storage.term_at(first - 1) == Some(term) {
                    first -= 1;
                }
                Some(ConflictHint {
                    index: first,
                    term: Some(term),
                })
            }
            None => Some(ConflictHint {
                index: self.storage.last_index() + 1,
                term: None,
            }),
        }
    }

    pub(crate) fn append_entries_response<N>(
        &mut self,
        net: &mut N,
        peer_id: NodeId,
        resp: AppendEntriesResponse,
    ) -> Result<()>
    where
        N: RaftNetwork<Command = SM::Command>,
    {
        if self.observe_term(net, resp.term)? {
            return Ok(());
        }
        if resp.term != self.current_term() {
            log::debug!(
                "[{}] Ignore AppendEntries response from {} for stale term {}",
                self.id,
                peer_id,
                resp.term
            );
            return Ok(());
        }
        let mut progress = match &self.role_state {
            RoleState::Leader { progress } => match progress.get(peer_id) {
                Some(p) => p,
                None => return Ok(()),
            },
            _ => return Ok(()),
        };
        let last_index = self.storage.last_index();

        if resp.success {
            if resp.match_index > progress.match_index {
                progress.match_index = resp.match_index.min(last_index);
            }
            progress.next_index = progress.next_index.max(progress.match_index + 1);
            self.set_progress(peer_id, progress);
            self.advance_commit_index();

            if progress.next_index <= last_index {
                let append = self.append_request(progress.next_index);
                self.send(net, peer_id, Msg::AppendEntries(append));
            }
        } else {
            if resp.prev_log_index + 1 != progress.next_index {
                log::debug!(
                    "[{}] Ignore out-of-order rejection from {} for prev index {}",
                    self.id,
                    peer_id,
                    resp.prev_log_index
                );
                return Ok(());
            }
            let target = match resp.conflict {
                Some(ConflictHint {
                    index,
                    term: Some(term),
                }) => self
                    .last_index_of_term(term)
                    .map(|i| i + 1)
                    .unwrap_or(index),
                Some(ConflictHint { index, term: None }) => index,
                None => progress.next_index - 1,
            };
            let floor = progress.match_index + 1;
            let ceil = progress.next_index.saturating_sub(1).max(floor);
            progress.next_index = target.clamp(floor, ceil);
            log::debug!(
                "[{}] Follower {} rejected prev index {}, retry from {}",
                self.id,
                peer_id,
                resp.prev_log_index,
                progress.next_index
            );
            self.set_progress(peer_id, progress);

            let append = self.append_request(progress.next_index);
            self.send(net, peer_id, Msg::AppendEntries(append));
        }
        Ok(())
    }

    fn set_progress(&mut self, peer_id: NodeId, progress: Progress) {
        if let RoleState::Leader { progress: peers } = &mut self.role_state {
            peers.insert(peer_id, progress);
        }
    }

    fn last_index_of_term(&self, term: u64) -> Option<u64> {
        let mut index = self.storage.last_index();
        while index > 0 {
            match self.storage.term_at(index) {
                Some(t) if t == term => return Some(index),
                Some(t) if t < term => return None,
                _ => index -= 1,
            }
        }
        None
    }

    /// Commit the highest index stored on a majority, but only if it was
    /// created in the current term. Older entries commit by being covered.
    pub(crate) fn advance_commit_index(&mut self) {
        let progress = match &self.role_state {
            RoleState::Leader { progress } => progress,
            _ => return,
        };
        let mut match_indexes: Vec<u64> = progress.values().map(|p| p.match_index).collect();
        match_indexes.push(self.storage.last_index());

        let quorum_index = utils::quorum_match_index(match_indexes.into_iter());
        if quorum_index > self.commit_index
            && self.storage.term_at(quorum_index) == Some(self.current_term())
        {
            log::info!("[{}] Commit up to index {}", self.id, quorum_index);
            self.commit_to(quorum_index);
        }
    }
}
