pub mod client;
pub mod config;
pub mod error;
pub mod impls;
mod node;
pub mod raft_message;
pub mod raft_network;
mod raft_state;
mod raft_state_machine;
pub mod raft_storage;
#[cfg(test)]
mod sim;
mod timer;
mod utils;

pub type NodeId = u64;

pub use node::Node;
pub use raft_state::{NodeStatus, RaftRole};

pub use self::client::{Proposal, RaftClient, SubmitOutcome};
pub use self::config::Config;
pub use self::error::RaftError;
pub use self::raft_message::Msg;
pub use self::raft_network::RaftNetwork;
pub use self::raft_state_machine::StateMachine;
pub use self::raft_storage::{LogEntry, MemStorage, Storage};
