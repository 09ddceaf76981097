// Broker tuning knobs.
use std::time::Duration;

const DEFAULT_MAX_CONCURRENCY: usize = 100;
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_QUEUE_SIZE: usize = 1000;

/// Tuning knobs for a [`crate::Broker`].
///
/// `Default` carries the values used when no configuration is supplied.
/// Zero worker or queue sizes are floored to 1 where they are used.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Number of dispatcher workers draining the backlog.
    pub max_concurrency: usize,
    /// How often the sweeper purges expired messages from the store.
    pub cleanup_interval: Duration,
    /// Capacity of the bounded backlog channel.
    pub queue_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}
