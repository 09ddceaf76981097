// Shared helpers for the broker integration tests.
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use courier_broker::{MessageHandler, handler_fn};

/// Handler that appends each received payload to a shared list.
pub fn recording_handler() -> (MessageHandler, Arc<Mutex<Vec<Bytes>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler = handler_fn(move |_cancel, message| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().expect("lock").push(message.payload().clone());
            Ok(())
        }
    });
    (handler, seen)
}

/// Polls `condition` every few milliseconds until it holds or `timeout`
/// elapses; returns the final evaluation.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
