use std::fmt::Debug;
use std::time::Duration;

use crate::client::ClientRequest;
use crate::error::NetworkError;
use crate::raft_message::Msg;
use crate::NodeId;

#[derive(Debug)]
pub enum SelectedAction<C: Clone + Debug> {
    Client(ClientRequest<C>),
    Peer(NodeId, Msg<C>),
    Timer(TimerKind),
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TimerKind {
    Heartbeat,
    Election,
}

/// A node's endpoint: outbound delivery to peers, the single active timer
/// and the inbox the event loop selects on.
///
/// Sends must not block on the receiving peer. A failed send is equivalent to
/// a lost message; the caller never retries synchronously.
pub trait RaftNetwork: Send + Debug + 'static {
    type Command: Clone + Debug;

    fn send(&mut self, peer_id: NodeId, msg: Msg<Self::Command>) -> Result<(), NetworkError>;

    /// Fan out to every target, returning the sends that failed.
    fn send_all<I>(&mut self, targets: I) -> Vec<NetworkError>
    where
        I: Iterator<Item = (NodeId, Msg<Self::Command>)>,
    {
        targets
            .filter_map(|(peer_id, msg)| self.send(peer_id, msg).err())
            .collect()
    }

    /// Replace the active timer. Only one timer is armed at a time.
    fn timer_reset(&mut self, timer_kind: TimerKind, duration: Duration);

    /// Wait up to `max_wait_time` for the first action, then take whatever
    /// else is ready, pushing at most `max_actions` into `buf`. Returns true
    /// if nothing arrived before the wait ran out.
    fn select_actions(
        &mut self,
        buf: &mut Vec<SelectedAction<Self::Command>>,
        max_actions: usize,
        max_wait_time: Duration,
    ) -> bool;
}
