use serde::{Deserialize, Serialize};

use crate::{LogEntry, NodeId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntries<C> {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry<C>>,
    pub leader_commit: u64,
}

/// Where a follower's log diverges from the leader's probe.
///
/// `term` is set when the follower has an entry at `prev_log_index` with a
/// different term; `index` is then the first index the follower holds for
/// that term. Without a term the follower's log is too short and `index` is
/// one past its last entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictHint {
    pub index: u64,
    pub term: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    // last index known to match the leader, only meaningful on success
    pub match_index: u64,
    // echo of the request, lets the leader drop out-of-order rejections
    pub prev_log_index: u64,
    pub conflict: Option<ConflictHint>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVote {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Msg<C> {
    AppendEntries(AppendEntries<C>),
    AppendEntriesResponse(AppendEntriesResponse),
    RequestVote(RequestVote),
    RequestVoteResponse(RequestVoteResponse),
}

impl<C> Msg<C> {
    pub fn term(&self) -> u64 {
        match self {
            Msg::AppendEntries(a) => a.term,
            Msg::AppendEntriesResponse(a) => a.term,
            Msg::RequestVote(a) => a.term,
            Msg::RequestVoteResponse(a) => a.term,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Msg::AppendEntries(_) => "append_entries",
            Msg::AppendEntriesResponse(_) => "append_entries_response",
            Msg::RequestVote(_) => "request_vote",
            Msg::RequestVoteResponse(_) => "request_vote_response",
        }
    }
}
