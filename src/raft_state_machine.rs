use std::fmt::Debug;

/// The replicated application. Commands reach it strictly in log order and
/// at most once per node incarnation; after a restart the log is replayed
/// from the beginning, so commands should be idempotent.
pub trait StateMachine: Send + 'static {
    type Command: Send + Clone + Debug + 'static;

    fn apply(&mut self, index: u64, command: &Self::Command);
    fn apply_batch<'a, I>(&mut self, commands: I)
    where
        I: Iterator<Item = (u64, &'a Self::Command)>,
        Self::Command: 'a,
    {
        for (index, command) in commands {
            self.apply(index, command);
        }
    }
}
