use std::time::Duration;

use crate::error::{RaftError, Result};

/// Timing and batching knobs for a single node.
///
/// Election timeouts are drawn uniformly from
/// `[election_timeout_min_ms, election_timeout_max_ms]` on every reset. The
/// heartbeat interval has to stay below the minimum election timeout or
/// followers will start elections against a healthy leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Upper bound on entries carried by one AppendEntries request
    pub max_entries_per_append: usize,
    /// Actions drained from the network per event loop tick
    pub max_actions_per_tick: usize,
    /// How long one tick waits for the first action
    pub tick_wait_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            max_entries_per_append: 64,
            max_actions_per_tick: 100,
            tick_wait_ms: 500,
        }
    }
}

impl Config {
    pub fn with_election_timeout(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.election_timeout_min_ms = min_ms;
        self.election_timeout_max_ms = max_ms;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn with_max_entries_per_append(mut self, max_entries: usize) -> Self {
        self.max_entries_per_append = max_entries;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn tick_wait(&self) -> Duration {
        Duration::from_millis(self.tick_wait_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min_ms == 0 {
            return Err(RaftError::Config(
                "election_timeout_min_ms must be positive".to_string(),
            ));
        }
        if self.election_timeout_min_ms > self.election_timeout_max_ms {
            return Err(RaftError::Config(format!(
                "election timeout range is empty: {}..={}",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.election_timeout_min_ms
        {
            return Err(RaftError::Config(format!(
                "heartbeat interval {}ms must be positive and below the minimum election timeout {}ms",
                self.heartbeat_interval_ms, self.election_timeout_min_ms
            )));
        }
        if self.max_entries_per_append == 0 || self.max_actions_per_tick == 0 {
            return Err(RaftError::Config(
                "batch sizes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
