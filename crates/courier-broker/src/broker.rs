// Central coordinator: accepts publishes onto a bounded backlog, routes them
// through the subscription registry to subscribers, schedules delayed
// deliveries, and sweeps expired messages.
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::message::Message;
use crate::registry::SubscriptionRegistry;
use crate::subscriber::{MessageHandler, Subscriber};
use crate::topic::Topic;
use crate::{BrokerError, Result};

const MONITOR_INTERVAL: Duration = Duration::from_secs(30);

// State shared between the broker handle and its spawned tasks.
#[derive(Debug)]
struct Inner {
    registry: SubscriptionRegistry,
    subscribers: DashMap<String, Arc<Subscriber>>,
    // Message store: retains every accepted message until TTL expiry or
    // removal after a no-subscriber drop.
    messages: DashMap<String, Message>,
    // One cancel handle per armed delivery timer, keyed by message id.
    delivery_timers: DashMap<String, CancellationToken>,
    cancel: CancellationToken,
    running: AtomicBool,
    message_counter: AtomicU64,
}

/// In-process pub/sub message broker.
///
/// Messages published to a topic fan out to every subscriber registered for
/// it. A fixed-size worker pool drains the bounded backlog; messages with a
/// delay are held by a one-shot timer until they are due, and a sweeper
/// purges messages whose TTL has passed.
///
/// ```
/// use std::collections::HashMap;
/// use std::sync::Arc;
/// use courier_broker::{Broker, Message, Subscriber, handler_fn};
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let broker = Broker::new();
///     broker.start().expect("start");
///
///     let subscriber = Arc::new(Subscriber::new("c1"));
///     broker.register_subscriber(Arc::clone(&subscriber)).expect("register");
///     let mut handlers = HashMap::new();
///     handlers.insert(
///         "orders".into(),
///         handler_fn(|_cancel, message| async move {
///             println!("received {:?}", message.payload());
///             Ok(())
///         }),
///     );
///     broker.subscribe("c1", handlers).expect("subscribe");
///
///     broker.publish(Message::new("orders", "hello")).await.expect("publish");
///     broker.stop().await.expect("stop");
/// });
/// ```
#[derive(Debug)]
pub struct Broker {
    config: BrokerConfig,
    inner: Arc<Inner>,
    backlog_tx: async_channel::Sender<Message>,
    backlog_rx: async_channel::Receiver<Message>,
    tracker: TaskTracker,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    /// Creates a stopped broker with the default configuration.
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    pub fn with_config(config: BrokerConfig) -> Self {
        let (backlog_tx, backlog_rx) = async_channel::bounded(config.queue_size.max(1));
        info!(
            max_concurrency = config.max_concurrency,
            queue_size = config.queue_size,
            "message broker created"
        );
        Self {
            config,
            inner: Arc::new(Inner {
                registry: SubscriptionRegistry::new(),
                subscribers: DashMap::new(),
                messages: DashMap::new(),
                delivery_timers: DashMap::new(),
                cancel: CancellationToken::new(),
                running: AtomicBool::new(false),
                message_counter: AtomicU64::new(0),
            }),
            backlog_tx,
            backlog_rx,
            tracker: TaskTracker::new(),
        }
    }

    /// Spawns the dispatcher workers, the sweeper, and the monitor.
    /// A second call returns [`BrokerError::AlreadyRunning`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BrokerError::AlreadyRunning);
        }

        let workers = self.config.max_concurrency.max(1);
        for _ in 0..workers {
            self.tracker.spawn(dispatch_loop(
                Arc::clone(&self.inner),
                self.backlog_rx.clone(),
                self.tracker.clone(),
            ));
        }
        info!(workers, "dispatcher workers started");

        self.tracker.spawn(sweep_loop(
            Arc::clone(&self.inner),
            self.config.cleanup_interval,
        ));
        self.tracker.spawn(monitor_loop(
            Arc::clone(&self.inner),
            self.backlog_rx.clone(),
        ));

        info!("message broker started");
        Ok(())
    }

    /// Cancels every broker-owned task, drains the workers, and waits for all
    /// of them to exit. A second call returns [`BrokerError::NotRunning`].
    pub async fn stop(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BrokerError::NotRunning);
        }

        info!("stopping message broker");
        self.inner.cancel.cancel();
        self.backlog_tx.close();

        // Stop pending delivery timers before joining the workers so no
        // handler fires for a delayed message after stop returns.
        let timer_count = self.inner.delivery_timers.len();
        self.inner.delivery_timers.retain(|message_id, timer| {
            debug!(message = %message_id, "delivery timer stopped");
            timer.cancel();
            false
        });
        debug!(count = timer_count, "delivery timers cleared");

        self.tracker.close();
        self.tracker.wait().await;
        info!("message broker stopped");
        Ok(())
    }

    /// Alias for [`Broker::stop`].
    pub async fn shutdown(&self) -> Result<()> {
        self.stop().await
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Registers a subscriber façade under its id.
    pub fn register_subscriber(&self, subscriber: Arc<Subscriber>) -> Result<()> {
        match self.inner.subscribers.entry(subscriber.id().to_string()) {
            Entry::Occupied(_) => {
                warn!(subscriber = %subscriber.id(), "subscriber already registered");
                Err(BrokerError::SubscriberExists(subscriber.id().to_string()))
            }
            Entry::Vacant(slot) => {
                info!(subscriber = %subscriber.id(), "subscriber registered");
                slot.insert(subscriber);
                Ok(())
            }
        }
    }

    /// Removes a subscriber and purges all of its subscriptions. Unknown ids
    /// are ignored.
    pub fn unregister_subscriber(&self, subscriber_id: &str) {
        if !self.inner.subscribers.contains_key(subscriber_id) {
            debug!(subscriber = %subscriber_id, "subscriber not found for unregistration");
            return;
        }
        self.inner.registry.remove_subscriber(subscriber_id);
        self.inner.subscribers.remove(subscriber_id);
        info!(subscriber = %subscriber_id, "subscriber unregistered");
    }

    /// Subscribes a registered subscriber to each topic in `handlers`.
    ///
    /// The registry records every topic before the subscriber validates them,
    /// so a validation failure keeps the effects applied up to that point.
    pub fn subscribe(
        &self,
        subscriber_id: &str,
        handlers: HashMap<Topic, MessageHandler>,
    ) -> Result<()> {
        let subscriber = self
            .inner
            .subscribers
            .get(subscriber_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| BrokerError::SubscriberNotFound(subscriber_id.to_string()))?;
        for topic in handlers.keys() {
            self.inner.registry.add_subscription(subscriber_id, topic);
        }
        subscriber.subscribe(handlers)
    }

    /// Removes the listed subscriptions. Unknown subscribers, unknown topics,
    /// and an empty list are all no-ops.
    pub fn unsubscribe(&self, subscriber_id: &str, topics: &[Topic]) {
        if topics.is_empty() {
            return;
        }
        let Some(subscriber) = self
            .inner
            .subscribers
            .get(subscriber_id)
            .map(|entry| Arc::clone(entry.value()))
        else {
            return;
        };
        for topic in topics {
            self.inner.registry.remove_subscription(subscriber_id, topic);
            debug!(subscriber = %subscriber_id, topic = %topic, "unsubscribed from topic");
        }
        subscriber.unsubscribe(topics);
    }

    /// Stores the message and enqueues it for dispatch. Blocks while the
    /// backlog is full; observing shutdown while blocked returns
    /// [`BrokerError::ShuttingDown`].
    pub async fn publish(&self, message: Message) -> Result<()> {
        if !self.is_running() {
            return Err(BrokerError::NotRunning);
        }

        debug!(
            message = %message.id(),
            topic = %message.topic(),
            sender = message.sender_id().unwrap_or(""),
            payload_bytes = message.payload().len(),
            "publishing message"
        );
        self.inner
            .messages
            .insert(message.id().to_string(), message.clone());
        self.inner.message_counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("courier_messages_published_total").increment(1);

        let message_id = message.id().to_string();
        tokio::select! {
            result = self.backlog_tx.send(message) => match result {
                Ok(()) => {
                    debug!(message = %message_id, "message queued for dispatch");
                    Ok(())
                }
                Err(_) => Err(BrokerError::ShuttingDown),
            },
            _ = self.inner.cancel.cancelled() => {
                debug!(message = %message_id, "broker shutting down, publish rejected");
                Err(BrokerError::ShuttingDown)
            }
        }
    }

    /// Stops the delivery timer of a delayed message that has not fired yet.
    ///
    /// `true` means the stop won the race and the message will not be
    /// delivered; `false` means the timer already fired (or never existed).
    pub fn cancel_delayed_message(&self, message_id: &str) -> bool {
        match self.inner.delivery_timers.remove(message_id) {
            Some((_, timer)) => {
                timer.cancel();
                debug!(message = %message_id, "delayed message cancelled");
                true
            }
            None => {
                debug!(message = %message_id, "no pending delivery timer");
                false
            }
        }
    }

    /// Copy of a stored message.
    pub fn get_message(&self, message_id: &str) -> Result<Message> {
        self.inner
            .messages
            .get(message_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BrokerError::MessageNotFound(message_id.to_string()))
    }

    /// Number of messages waiting in the backlog.
    pub fn pending_message_count(&self) -> usize {
        self.backlog_rx.len()
    }

    /// Observational snapshot assembled from the live containers; the numbers
    /// are individually accurate but not atomic across containers.
    pub fn stats(&self) -> BrokerStats {
        self.inner.stats(self.backlog_rx.len())
    }
}

/// Point-in-time broker statistics.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerStats {
    pub total_subscribers: usize,
    pub total_topics: usize,
    pub total_messages: usize,
    pub pending_backlog: usize,
    pub delivery_timers: usize,
    pub running: bool,
    pub message_counter: u64,
    /// Subscriber count per topic currently present in the registry.
    pub topic_subscribers: HashMap<String, usize>,
}

impl Inner {
    fn stats(&self, pending_backlog: usize) -> BrokerStats {
        let mut topic_subscribers = HashMap::new();
        for topic in self.registry.all_topics() {
            topic_subscribers.insert(
                topic.to_string(),
                self.registry.topic_subscriber_count(&topic),
            );
        }
        BrokerStats {
            total_subscribers: self.subscribers.len(),
            total_topics: self.registry.topic_count(),
            total_messages: self.messages.len(),
            pending_backlog,
            delivery_timers: self.delivery_timers.len(),
            running: self.running.load(Ordering::SeqCst),
            message_counter: self.message_counter.load(Ordering::Relaxed),
            topic_subscribers,
        }
    }
}

// One dispatcher worker: drain the backlog until it is closed or the broker
// is cancelled.
async fn dispatch_loop(
    inner: Arc<Inner>,
    backlog: async_channel::Receiver<Message>,
    tracker: TaskTracker,
) {
    debug!("dispatcher worker started");
    while let Ok(message) = backlog.recv().await {
        if inner.cancel.is_cancelled() {
            return;
        }
        dispatch_message(&inner, &tracker, message);
    }
    debug!("dispatcher worker drained");
}

fn dispatch_message(inner: &Arc<Inner>, tracker: &TaskTracker, message: Message) {
    if message.is_expired() {
        inner.messages.remove(message.id());
        debug!(message = %message.id(), "message expired before dispatch");
        metrics::counter!("courier_messages_expired_total").increment(1);
        return;
    }

    if inner.registry.topic_subscriber_count(message.topic()) == 0 {
        inner.messages.remove(message.id());
        debug!(
            message = %message.id(),
            topic = %message.topic(),
            "no subscribers, message discarded"
        );
        metrics::counter!("courier_messages_discarded_total").increment(1);
        return;
    }

    if message.deliver_at() <= Instant::now() {
        fan_out(inner, message);
    } else {
        arm_delivery_timer(inner, tracker, message);
    }
}

fn arm_delivery_timer(inner: &Arc<Inner>, tracker: &TaskTracker, message: Message) {
    let timer = CancellationToken::new();
    inner
        .delivery_timers
        .insert(message.id().to_string(), timer.clone());
    metrics::gauge!("courier_delivery_timers").set(inner.delivery_timers.len() as f64);
    debug!(
        message = %message.id(),
        delay = ?message.delay(),
        "delivery timer armed"
    );

    let inner = Arc::clone(inner);
    tracker.spawn(async move {
        let deadline = tokio::time::Instant::from_std(message.deliver_at());
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {}
            _ = timer.cancelled() => return,
            _ = inner.cancel.cancelled() => return,
        }
        // Whoever removes the timer entry claims the message: losing this
        // race to cancel_delayed_message suppresses delivery.
        if inner.delivery_timers.remove(message.id()).is_none() {
            return;
        }
        metrics::gauge!("courier_delivery_timers").set(inner.delivery_timers.len() as f64);
        debug!(message = %message.id(), "delayed delivery due");
        fan_out(&inner, message);
    });
}

// Fan a message out to every subscriber of its topic, one shallow copy each.
// The registry is re-read here so delayed deliveries see the subscriptions
// current at firing time, not at dispatch time.
fn fan_out(inner: &Arc<Inner>, message: Message) {
    let subscriber_ids = inner.registry.topic_subscribers(message.topic());
    if subscriber_ids.is_empty() {
        inner.messages.remove(message.id());
        debug!(
            message = %message.id(),
            topic = %message.topic(),
            "no subscribers at delivery time, message discarded"
        );
        return;
    }

    let mut delivered = 0usize;
    for subscriber_id in subscriber_ids {
        let Some(subscriber) = inner.subscribers.get(&subscriber_id) else {
            continue;
        };
        subscriber.handle_message(message.clone(), inner.cancel.child_token());
        delivered += 1;
    }
    metrics::counter!("courier_messages_delivered_total").increment(delivered as u64);
    debug!(
        message = %message.id(),
        topic = %message.topic(),
        delivered,
        "message fanned out"
    );
}

async fn sweep_loop(inner: Arc<Inner>, interval: Duration) {
    debug!(interval = ?interval, "sweeper started");
    let mut ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => sweep_expired(&inner),
            _ = inner.cancel.cancelled() => {
                debug!("sweeper stopping");
                return;
            }
        }
    }
}

fn sweep_expired(inner: &Inner) {
    // Two phases: removing while iterating would deadlock on the shard locks.
    let expired: Vec<String> = inner
        .messages
        .iter()
        .filter(|entry| entry.value().is_expired())
        .map(|entry| entry.key().clone())
        .collect();
    if expired.is_empty() {
        return;
    }
    for message_id in &expired {
        inner.messages.remove(message_id);
    }
    metrics::counter!("courier_messages_expired_total").increment(expired.len() as u64);
    info!(count = expired.len(), "expired messages cleaned up");
}

async fn monitor_loop(inner: Arc<Inner>, backlog: async_channel::Receiver<Message>) {
    debug!("monitor started");
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + MONITOR_INTERVAL,
        MONITOR_INTERVAL,
    );
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = inner.stats(backlog.len());
                info!(
                    subscribers = stats.total_subscribers,
                    topics = stats.total_topics,
                    messages = stats.total_messages,
                    pending = stats.pending_backlog,
                    timers = stats.delivery_timers,
                    counter = stats.message_counter,
                    "broker stats"
                );
            }
            _ = inner.cancel.cancelled() => {
                debug!("monitor stopping");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::handler_fn;

    #[tokio::test]
    async fn start_and_stop_are_single_shot() {
        let broker = Broker::new();
        assert!(!broker.is_running());

        broker.start().expect("first start");
        assert!(broker.is_running());
        let err = broker.start().expect_err("second start");
        assert!(matches!(err, BrokerError::AlreadyRunning));

        broker.stop().await.expect("first stop");
        assert!(!broker.is_running());
        let err = broker.stop().await.expect_err("second stop");
        assert!(matches!(err, BrokerError::NotRunning));
    }

    #[tokio::test]
    async fn stop_before_start_errors() {
        let broker = Broker::new();
        let err = broker.stop().await.expect_err("never started");
        assert!(matches!(err, BrokerError::NotRunning));
    }

    #[tokio::test]
    async fn publish_requires_running_broker() {
        let broker = Broker::new();
        let err = broker
            .publish(Message::new("t", "x"))
            .await
            .expect_err("stopped broker");
        assert!(matches!(err, BrokerError::NotRunning));
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let broker = Broker::new();
        broker
            .register_subscriber(Arc::new(Subscriber::new("c1")))
            .expect("register");
        let err = broker
            .register_subscriber(Arc::new(Subscriber::new("c1")))
            .expect_err("duplicate");
        assert!(matches!(err, BrokerError::SubscriberExists(id) if id == "c1"));
    }

    #[tokio::test]
    async fn subscribe_requires_registration() {
        let broker = Broker::new();
        let mut handlers = HashMap::new();
        handlers.insert(
            Topic::new("t"),
            handler_fn(|_cancel, _message| async move { Ok(()) }),
        );
        let err = broker.subscribe("ghost", handlers).expect_err("unknown id");
        assert!(matches!(err, BrokerError::SubscriberNotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn unregister_purges_registry() {
        let broker = Broker::new();
        broker
            .register_subscriber(Arc::new(Subscriber::new("c1")))
            .expect("register");
        let mut handlers = HashMap::new();
        handlers.insert(
            Topic::new("t"),
            handler_fn(|_cancel, _message| async move { Ok(()) }),
        );
        broker.subscribe("c1", handlers).expect("subscribe");
        assert_eq!(broker.stats().total_topics, 1);

        broker.unregister_subscriber("c1");
        let stats = broker.stats();
        assert_eq!(stats.total_subscribers, 0);
        assert_eq!(stats.total_topics, 0);

        // Unknown ids are ignored.
        broker.unregister_subscriber("ghost");
    }

    #[tokio::test]
    async fn cancel_unknown_message_returns_false() {
        let broker = Broker::new();
        assert!(!broker.cancel_delayed_message("msg-0-0"));
    }

    #[tokio::test]
    async fn get_message_unknown_id_errors() {
        let broker = Broker::new();
        let err = broker.get_message("msg-0-0").expect_err("unknown");
        assert!(matches!(err, BrokerError::MessageNotFound(_)));
    }

    #[tokio::test]
    async fn stats_reflect_subscriptions() {
        let broker = Broker::new();
        broker
            .register_subscriber(Arc::new(Subscriber::new("c1")))
            .expect("register");
        broker
            .register_subscriber(Arc::new(Subscriber::new("c2")))
            .expect("register");
        let topic = Topic::new("orders");
        for id in ["c1", "c2"] {
            let mut handlers = HashMap::new();
            handlers.insert(
                topic.clone(),
                handler_fn(|_cancel, _message| async move { Ok(()) }),
            );
            broker.subscribe(id, handlers).expect("subscribe");
        }

        let stats = broker.stats();
        assert_eq!(stats.total_subscribers, 2);
        assert_eq!(stats.total_topics, 1);
        assert_eq!(stats.topic_subscribers.get("orders"), Some(&2));
        assert!(!stats.running);
        assert_eq!(stats.pending_backlog, 0);

        // The snapshot serializes for external observers.
        let encoded = serde_json::to_value(&stats).expect("serialize");
        assert_eq!(encoded["total_subscribers"], 2);
    }
}
