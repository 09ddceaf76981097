// In-process pub/sub message broker: topic-tagged messages fan out to every
// registered subscriber, with optional delayed delivery and per-message TTL.
pub mod broker;
pub mod config;
pub mod message;
pub mod registry;
pub mod subscriber;
pub mod topic;

pub use broker::{Broker, BrokerStats};
pub use config::BrokerConfig;
pub use message::Message;
pub use registry::SubscriptionRegistry;
pub use subscriber::{MessageHandler, Subscriber, handler_fn};
pub use topic::Topic;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("broker is already running")]
    AlreadyRunning,
    #[error("broker is not running")]
    NotRunning,
    #[error("broker is shutting down")]
    ShuttingDown,
    #[error("subscriber already registered: {0}")]
    SubscriberExists(String),
    #[error("subscriber not found: {0}")]
    SubscriberNotFound(String),
    #[error("message not found: {0}")]
    MessageNotFound(String),
    #[error("topic cannot be empty")]
    EmptyTopic,
    #[error("message ttl must be positive")]
    InvalidTtl,
    #[error("p2p topic {topic} is not addressed to subscriber {subscriber}")]
    ForeignP2pTopic { topic: String, subscriber: String },
}
