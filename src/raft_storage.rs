use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::NodeId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry<C> {
    pub index: u64,
    pub term: u64,
    pub command: C,
}

/// Durable home of a node's persistent state: current term, vote and log.
///
/// Every write method returns only after the change is durable. The node
/// never emits a response that depends on a write before that write returns
/// `Ok`, and treats `Err` as fatal.
///
/// Log indexes start at 1; index 0 with term 0 is the empty-log sentinel.
pub trait Storage: Send + 'static {
    type Command;

    fn current_term(&self) -> u64;
    fn voted_for(&self) -> Option<NodeId>;

    /// Move to a newer term, clearing any vote.
    fn persist_term(&mut self, term: u64) -> Result<(), StorageError>;
    /// Record a vote in `term`, atomically with the term itself.
    fn persist_vote(&mut self, term: u64, candidate_id: NodeId) -> Result<(), StorageError>;

    /// Append entries that must continue the log at `last_index() + 1`.
    fn append_log(&mut self, entries: Vec<LogEntry<Self::Command>>) -> Result<(), StorageError>;
    /// Drop the entry at `index` and everything after it.
    fn truncate_log_from(&mut self, index: u64) -> Result<(), StorageError>;

    fn entry(&self, index: u64) -> Option<&LogEntry<Self::Command>>;
    // range [from_index, to_index), clamped to the log
    fn read_log(&self, from_index: u64, to_index: u64) -> &[LogEntry<Self::Command>];
    fn last_log_index_term(&self) -> (u64, u64);

    fn last_index(&self) -> u64 {
        self.last_log_index_term().0
    }

    fn last_term(&self) -> u64 {
        self.last_log_index_term().1
    }

    fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            Some(0)
        } else {
            self.entry(index).map(|e| e.term)
        }
    }
}

/// Contiguous in-memory log starting at index 1.
#[derive(Clone, Debug)]
pub(crate) struct VecLog<C>(Vec<LogEntry<C>>);

impl<C> VecLog<C> {
    pub(crate) fn new() -> Self {
        VecLog(Vec::new())
    }

    pub(crate) fn from_entries(entries: Vec<LogEntry<C>>) -> Result<Self, StorageError> {
        for (pos, entry) in entries.iter().enumerate() {
            if entry.index != pos as u64 + 1 {
                return Err(StorageError::Corrupt(format!(
                    "entry at position {} has index {}",
                    pos, entry.index
                )));
            }
        }
        Ok(VecLog(entries))
    }

    pub(crate) fn at(&self, index: u64) -> Option<&LogEntry<C>> {
        let vec_index = self.to_vec_index(index)?;
        self.0.get(vec_index)
    }

    pub(crate) fn last_index_term(&self) -> (u64, u64) {
        self.0.last().map(|e| (e.index, e.term)).unwrap_or((0, 0))
    }

    pub(crate) fn check_append(&self, entries: &[LogEntry<C>]) -> Result<(), StorageError> {
        let mut expected = self.last_index_term().0 + 1;
        for entry in entries {
            if entry.index != expected {
                return Err(StorageError::Corrupt(format!(
                    "append out of order: expected index {}, got {}",
                    expected, entry.index
                )));
            }
            expected += 1;
        }
        Ok(())
    }

    pub(crate) fn extend(&mut self, entries: Vec<LogEntry<C>>) {
        self.0.extend(entries);
    }

    pub(crate) fn truncate_from(&mut self, index: u64) {
        if let Some(vec_index) = self.to_vec_index(index) {
            self.0.truncate(vec_index);
        }
    }

    pub(crate) fn slice(&self, from_index: u64, to_index: u64) -> &[LogEntry<C>] {
        let from = from_index.max(1) as usize - 1;
        let to = (to_index.max(1) as usize - 1).min(self.0.len());
        if from >= to {
            &[]
        } else {
            &self.0[from..to]
        }
    }

    pub(crate) fn entries(&self) -> &[LogEntry<C>] {
        &self.0
    }

    // convert log's index to Vec's index
    // None for the sentinel index 0
    #[inline]
    fn to_vec_index(&self, index: u64) -> Option<usize> {
        index.checked_sub(1).map(|i| i as usize)
    }
}

/// Storage that keeps everything in memory. "Durable" for the lifetime of
/// the value, which is enough to model crash/restart by moving it between
/// node incarnations.
#[derive(Clone, Debug)]
pub struct MemStorage<C> {
    current_term: u64,
    voted_for: Option<NodeId>,
    log: VecLog<C>,
}

impl<C> MemStorage<C> {
    pub fn new() -> Self {
        MemStorage {
            current_term: 0,
            voted_for: None,
            log: VecLog::new(),
        }
    }
}

impl<C> Default for MemStorage<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Send + 'static> Storage for MemStorage<C> {
    type Command = C;

    fn current_term(&self) -> u64 {
        self.current_term
    }

    fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    fn persist_term(&mut self, term: u64) -> Result<(), StorageError> {
        self.current_term = term;
        self.voted_for = None;
        Ok(())
    }

    fn persist_vote(&mut self, term: u64, candidate_id: NodeId) -> Result<(), StorageError> {
        self.current_term = term;
        self.voted_for = Some(candidate_id);
        Ok(())
    }

    fn append_log(&mut self, entries: Vec<LogEntry<C>>) -> Result<(), StorageError> {
        self.log.check_append(&entries)?;
        self.log.extend(entries);
        Ok(())
    }

    fn truncate_log_from(&mut self, index: u64) -> Result<(), StorageError> {
        self.log.truncate_from(index);
        Ok(())
    }

    fn entry(&self, index: u64) -> Option<&LogEntry<C>> {
        self.log.at(index)
    }

    fn read_log(&self, from_index: u64, to_index: u64) -> &[LogEntry<C>] {
        self.log.slice(from_index, to_index)
    }

    fn last_log_index_term(&self) -> (u64, u64) {
        self.log.last_index_term()
    }
}
