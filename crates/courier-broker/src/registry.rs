// Bidirectional subscription index: topic -> subscribers and subscriber -> topics.
use std::collections::HashSet;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::topic::Topic;

/// Concurrent-safe pair of inverted subscription indices.
///
/// Both maps are updated for every mutation, and an inner set that empties is
/// removed together with its outer key inside the same entry critical
/// section, so a topic with no subscribers (or a subscriber with no topics)
/// is never observable.
///
/// ```
/// use courier_broker::{SubscriptionRegistry, Topic};
///
/// let registry = SubscriptionRegistry::new();
/// let topic = Topic::new("orders");
/// registry.add_subscription("c1", &topic);
/// assert_eq!(registry.topic_subscribers(&topic), vec!["c1".to_string()]);
/// registry.remove_subscriber("c1");
/// assert!(registry.all_topics().is_empty());
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    topic_subscribers: DashMap<Topic, HashSet<String>>,
    subscriber_topics: DashMap<String, HashSet<Topic>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a (subscriber, topic) pair in both indices. Re-adding an
    /// existing pair is a no-op.
    pub fn add_subscription(&self, subscriber_id: &str, topic: &Topic) {
        self.topic_subscribers
            .entry(topic.clone())
            .or_default()
            .insert(subscriber_id.to_string());
        self.subscriber_topics
            .entry(subscriber_id.to_string())
            .or_default()
            .insert(topic.clone());
    }

    /// Removes a (subscriber, topic) pair from both indices.
    pub fn remove_subscription(&self, subscriber_id: &str, topic: &Topic) {
        if let Entry::Occupied(mut entry) = self.topic_subscribers.entry(topic.clone()) {
            entry.get_mut().remove(subscriber_id);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
        if let Entry::Occupied(mut entry) = self.subscriber_topics.entry(subscriber_id.to_string())
        {
            entry.get_mut().remove(topic);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
    }

    /// Removes every subscription referencing `subscriber_id`.
    pub fn remove_subscriber(&self, subscriber_id: &str) {
        let Some((_, topics)) = self.subscriber_topics.remove(subscriber_id) else {
            return;
        };
        for topic in topics {
            if let Entry::Occupied(mut entry) = self.topic_subscribers.entry(topic) {
                entry.get_mut().remove(subscriber_id);
                if entry.get().is_empty() {
                    entry.remove();
                }
            }
        }
    }

    /// Snapshot of the subscriber ids for `topic`; empty when none.
    pub fn topic_subscribers(&self, topic: &Topic) -> Vec<String> {
        self.topic_subscribers
            .get(topic)
            .map(|subscribers| subscribers.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn topic_subscriber_count(&self, topic: &Topic) -> usize {
        self.topic_subscribers
            .get(topic)
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }

    /// Snapshot of the topics `subscriber_id` is subscribed to.
    pub fn subscriber_topics(&self, subscriber_id: &str) -> Vec<Topic> {
        self.subscriber_topics
            .get(subscriber_id)
            .map(|topics| topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_topic_count(&self, subscriber_id: &str) -> usize {
        self.subscriber_topics
            .get(subscriber_id)
            .map(|topics| topics.len())
            .unwrap_or(0)
    }

    pub fn all_topics(&self) -> Vec<Topic> {
        self.topic_subscribers
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn all_subscribers(&self) -> Vec<String> {
        self.subscriber_topics
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn topic_count(&self) -> usize {
        self.topic_subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriber_topics.len()
    }
}
