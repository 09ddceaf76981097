//! In-process pub/sub demo binary.
//!
//! # Purpose
//! Demonstrates the full broker flow: lifecycle, registration, subscription
//! (including a point-to-point topic), immediate and delayed publishes,
//! cancellation, and the statistics snapshot.
//!
//! # Notes
//! This is a developer-facing demo; it favors clarity over performance.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use courier_broker::{Broker, BrokerConfig, Message, Subscriber, Topic, handler_fn};

async fn run_demo() -> Result<()> {
    // Keep the demo output readable and step-by-step.
    println!("== Courier In-Process Pub/Sub Demo ==");
    println!("Goal: publish, fan out, delay, cancel, and inspect stats.");

    println!("Step 1/6: creating and starting the broker.");
    let broker = Broker::with_config(BrokerConfig {
        max_concurrency: 4,
        cleanup_interval: Duration::from_secs(5),
        queue_size: 64,
    });
    broker.start()?;

    println!("Step 2/6: registering two subscribers.");
    let orders_worker = Arc::new(Subscriber::new("orders-worker"));
    let audit = Arc::new(Subscriber::new("audit"));
    broker.register_subscriber(Arc::clone(&orders_worker))?;
    broker.register_subscriber(Arc::clone(&audit))?;

    println!("Step 3/6: subscribing to topics (one of them point-to-point).");
    let mut handlers = HashMap::new();
    handlers.insert(
        Topic::new("orders"),
        handler_fn(|_cancel, message| async move {
            println!(
                "  orders-worker got '{}' on {}",
                String::from_utf8_lossy(message.payload()),
                message.topic()
            );
            Ok(())
        }),
    );
    handlers.insert(
        Topic::new("p2p/orders-worker"),
        handler_fn(|_cancel, message| async move {
            println!(
                "  orders-worker got direct message '{}'",
                String::from_utf8_lossy(message.payload())
            );
            Ok(())
        }),
    );
    broker.subscribe("orders-worker", handlers)?;

    let mut audit_handlers = HashMap::new();
    audit_handlers.insert(
        Topic::new("orders"),
        handler_fn(|_cancel, message| async move {
            println!(
                "  audit recorded message {} ({} bytes)",
                message.id(),
                message.payload().len()
            );
            Ok(())
        }),
    );
    broker.subscribe("audit", audit_handlers)?;

    println!("Step 4/6: publishing an immediate and a direct message.");
    broker.publish(Message::new("orders", "order #4711")).await?;
    broker
        .publish(Message::new("p2p/orders-worker", "just for you"))
        .await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    println!("Step 5/6: delayed publish plus cancellation.");
    let delivered_later = Message::new("orders", "delayed order").with_delay(Duration::from_millis(300));
    broker.publish(delivered_later).await?;

    let never_delivered =
        Message::new("orders", "cancelled order").with_delay(Duration::from_millis(300));
    let cancelled_id = never_delivered.id().to_string();
    broker.publish(never_delivered).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!(
        "  cancel_delayed_message({cancelled_id}) -> {}",
        broker.cancel_delayed_message(&cancelled_id)
    );
    tokio::time::sleep(Duration::from_millis(400)).await;

    println!("Step 6/6: statistics snapshot and shutdown.");
    let stats = broker.stats();
    println!(
        "  subscribers={} topics={} messages={} pending={} timers={}",
        stats.total_subscribers,
        stats.total_topics,
        stats.total_messages,
        stats.pending_backlog,
        stats.delivery_timers
    );
    broker.stop().await?;
    println!("Demo complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    run_demo().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[tokio::test]
    async fn demo_runs_end_to_end() -> Result<()> {
        tokio::time::timeout(Duration::from_secs(10), run_demo())
            .await
            .context("demo timeout")?
    }
}
