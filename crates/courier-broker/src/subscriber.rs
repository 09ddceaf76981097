// Per-subscriber façade: owns the topic -> handler table and isolates
// handler execution from the broker.
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::message::Message;
use crate::topic::Topic;
use crate::{BrokerError, Result};

/// Handler invoked once per delivered message.
///
/// The token is cancelled when the broker shuts down; long-running handlers
/// should watch it. Errors and panics are logged and contained, they never
/// reach the broker or the publisher.
pub type MessageHandler =
    Arc<dyn Fn(CancellationToken, Message) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wraps an async closure as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(handler: F) -> MessageHandler
where
    F: Fn(CancellationToken, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |cancel, message| handler(cancel, message).boxed())
}

struct TopicSubscription {
    handler: MessageHandler,
    subscribed_at: Instant,
}

/// An identified participant that registers one handler per topic.
///
/// The broker hands each subscriber its own copy of a message; the subscriber
/// looks up the topic's handler and runs it in a dedicated task. A panicking
/// or failing handler is logged and swallowed, so one bad handler cannot take
/// down the dispatch pipeline.
pub struct Subscriber {
    id: String,
    subscriptions: DashMap<Topic, TopicSubscription>,
}

impl Subscriber {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            subscriptions: DashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Registers one handler per topic, overwriting any prior handler for the
    /// same topic. Fails on the first invalid topic; entries inserted before
    /// the failure are kept.
    pub fn subscribe(&self, handlers: HashMap<Topic, MessageHandler>) -> Result<()> {
        for (topic, handler) in handlers {
            self.validate_topic(&topic)?;
            debug!(subscriber = %self.id, topic = %topic, "subscription added");
            self.subscriptions.insert(
                topic,
                TopicSubscription {
                    handler,
                    subscribed_at: Instant::now(),
                },
            );
        }
        Ok(())
    }

    /// Drops the handler for each listed topic; unknown topics are ignored.
    pub fn unsubscribe(&self, topics: &[Topic]) {
        for topic in topics {
            self.subscriptions.remove(topic);
        }
        debug!(subscriber = %self.id, count = topics.len(), "unsubscribed from topics");
    }

    pub fn subscribed_at(&self, topic: &Topic) -> Option<Instant> {
        self.subscriptions
            .get(topic)
            .map(|subscription| subscription.subscribed_at)
    }

    /// Dispatches `message` to the topic's handler in an isolated task.
    /// Messages for topics without a local handler are dropped silently.
    pub fn handle_message(&self, message: Message, cancel: CancellationToken) {
        let handler = match self.subscriptions.get(message.topic()) {
            Some(subscription) => Arc::clone(&subscription.handler),
            None => return,
        };
        let subscriber_id = self.id.clone();
        let message_id = message.id().to_string();
        let topic = message.topic().clone();
        tokio::spawn(async move {
            match AssertUnwindSafe(handler(cancel, message)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(
                        subscriber = %subscriber_id,
                        message = %message_id,
                        topic = %topic,
                        error = %err,
                        "handler returned error"
                    );
                }
                Err(payload) => {
                    error!(
                        subscriber = %subscriber_id,
                        message = %message_id,
                        topic = %topic,
                        panic = %panic_text(payload.as_ref()),
                        "handler panicked"
                    );
                }
            }
        });
    }

    // Subscription-time rules: a point-to-point topic may only be subscribed
    // by the subscriber it is addressed to.
    fn validate_topic(&self, topic: &Topic) -> Result<()> {
        topic.validate()?;
        if topic.is_p2p() && topic.p2p_target() != Some(self.id.as_str()) {
            return Err(BrokerError::ForeignP2pTopic {
                topic: topic.to_string(),
                subscriber: self.id.clone(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&'static str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}
