pub mod chan_network;
pub mod file_storage;

pub use chan_network::{ChanNetwork, LinkControl};
pub use file_storage::FileStorage;
