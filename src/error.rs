use std::io;

use thiserror::Error;

use crate::NodeId;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Not the leader, current leader is node {0:?}")]
    NotLeader(Option<NodeId>),

    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Node {0} has stopped")]
    Stopped(NodeId),
}

/// Durable write or read failure. Fatal for the node that hits it.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Corrupt storage: {0}")]
    Corrupt(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Unknown peer {0}")]
    UnknownPeer(NodeId),

    #[error("Peer {0} disconnected")]
    Disconnected(NodeId),
}

pub type Result<T> = std::result::Result<T, RaftError>;
