// Message value object: payload plus timing metadata.
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde_json::Value;

use crate::topic::Topic;
use crate::{BrokerError, Result};

const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(60 * 60);

// Ids combine a wall-clock timestamp with a process-wide counter so they stay
// unique even when many messages are created in the same millisecond. Id
// ordering carries no delivery-order meaning.
fn next_message_id() -> String {
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);
    let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("msg-{millis}-{sequence}")
}

/// Topic-tagged payload with timing metadata.
///
/// A message is immutable once published: the builder methods consume `self`
/// and are meant to be chained right after [`Message::new`]. The payload is
/// reference-counted and the header/metadata maps sit behind an `Arc`, so the
/// per-subscriber copies the broker hands out share them. Handlers must treat
/// all of it as read-only.
///
/// ```
/// use std::time::Duration;
/// use courier_broker::Message;
///
/// let msg = Message::new("orders", "hello")
///     .with_sender("api-1")
///     .with_delay(Duration::from_millis(200));
/// assert_eq!(msg.deliver_at(), msg.created_at() + Duration::from_millis(200));
/// assert!(!msg.is_expired());
/// ```
#[derive(Debug, Clone)]
pub struct Message {
    id: String,
    topic: Topic,
    sender_id: Option<String>,
    payload: Bytes,
    headers: Option<Arc<HashMap<String, String>>>,
    metadata: Option<Arc<HashMap<String, Value>>>,
    delay: Duration,
    ttl: Duration,
    created_at: Instant,
    deliver_at: Instant,
    expires_at: Instant,
}

impl Message {
    pub fn new(topic: impl Into<Topic>, payload: impl Into<Bytes>) -> Self {
        let now = Instant::now();
        Self {
            id: next_message_id(),
            topic: topic.into(),
            sender_id: None,
            payload: payload.into(),
            headers: None,
            metadata: None,
            delay: Duration::ZERO,
            ttl: DEFAULT_MESSAGE_TTL,
            created_at: now,
            deliver_at: now,
            expires_at: now + DEFAULT_MESSAGE_TTL,
        }
    }

    pub fn with_sender(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = Some(sender_id.into());
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Some(Arc::new(headers));
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = Some(Arc::new(metadata));
        self
    }

    /// Schedules delivery `delay` after creation instead of immediately.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self.deliver_at = self.created_at + delay;
        self
    }

    /// Overrides the default one-hour TTL. A zero TTL is rejected.
    pub fn with_ttl(mut self, ttl: Duration) -> Result<Self> {
        if ttl.is_zero() {
            return Err(BrokerError::InvalidTtl);
        }
        self.ttl = ttl;
        self.expires_at = self.created_at + ttl;
        Ok(self)
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn sender_id(&self) -> Option<&str> {
        self.sender_id.as_deref()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn headers(&self) -> Option<&HashMap<String, String>> {
        self.headers.as_deref()
    }

    pub fn metadata(&self) -> Option<&HashMap<String, Value>> {
        self.metadata.as_deref()
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn deliver_at(&self) -> Instant {
        self.deliver_at
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_defaults() {
        let msg = Message::new("orders", "hello");
        assert_eq!(msg.topic().as_str(), "orders");
        assert_eq!(msg.payload(), &Bytes::from_static(b"hello"));
        assert_eq!(msg.delay(), Duration::ZERO);
        assert_eq!(msg.deliver_at(), msg.created_at());
        assert_eq!(msg.ttl(), DEFAULT_MESSAGE_TTL);
        assert_eq!(msg.expires_at(), msg.created_at() + DEFAULT_MESSAGE_TTL);
        assert!(!msg.is_expired());
        assert!(msg.sender_id().is_none());
        assert!(msg.headers().is_none());
    }

    #[test]
    fn ids_are_unique() {
        let ids: std::collections::HashSet<String> = (0..1000)
            .map(|_| Message::new("t", "x").id().to_string())
            .collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn delay_moves_deliver_at() {
        let msg = Message::new("t", "x").with_delay(Duration::from_secs(5));
        assert_eq!(msg.delay(), Duration::from_secs(5));
        assert_eq!(msg.deliver_at(), msg.created_at() + Duration::from_secs(5));
    }

    #[test]
    fn ttl_moves_expires_at_and_rejects_zero() {
        let msg = Message::new("t", "x")
            .with_ttl(Duration::from_secs(2))
            .expect("ttl");
        assert_eq!(msg.expires_at(), msg.created_at() + Duration::from_secs(2));

        let err = Message::new("t", "x")
            .with_ttl(Duration::ZERO)
            .expect_err("zero ttl");
        assert!(matches!(err, BrokerError::InvalidTtl));
    }

    #[test]
    fn clones_share_payload_and_headers() {
        let mut headers = HashMap::new();
        headers.insert("kind".to_string(), "test".to_string());
        let msg = Message::new("t", "x").with_headers(headers);
        let copy = msg.clone();

        // Payload bytes and the header map are shared, not duplicated.
        assert_eq!(msg.payload().as_ptr(), copy.payload().as_ptr());
        assert!(std::ptr::eq(
            msg.headers().expect("headers"),
            copy.headers().expect("headers")
        ));
        assert_eq!(msg.id(), copy.id());
    }
}
