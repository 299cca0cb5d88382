use std::time::Duration;

use rand::Rng;

use crate::config::Config;

/// Draws an election timeout uniformly from the configured range.
pub fn random_election_timeout<R: Rng>(rng: &mut R, config: &Config) -> Duration {
    let timeout_ms =
        rng.gen_range(config.election_timeout_min_ms..=config.election_timeout_max_ms);
    Duration::from_millis(timeout_ms)
}
