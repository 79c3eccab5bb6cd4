//! Custom assertions for retry outcomes

use reliable_sql::{Error, RetryExhausted, RetryingEvent};
use tokio::sync::broadcast;

/// Collect every event already delivered to `events`
pub fn drain_events(events: &mut broadcast::Receiver<RetryingEvent>) -> Vec<RetryingEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

/// Assert that `err` is an exhaustion after exactly `retries` retries
///
/// # Returns
/// The aggregate, for further inspection
pub fn assert_exhausted(err: &Error, retries: u32) -> &RetryExhausted {
    match err {
        Error::RetriesExhausted(exhausted) => {
            assert_eq!(exhausted.attempts, retries, "retry count");
            assert_eq!(
                exhausted.errors.len(),
                retries as usize + 1,
                "one error per attempt"
            );
            exhausted
        }
        other => panic!("expected exhausted retries, got {other:?}"),
    }
}

/// Assert that `events` are numbered 1..=n in order
pub fn assert_sequential(events: &[RetryingEvent]) {
    for (index, event) in events.iter().enumerate() {
        assert_eq!(event.current_retry_count as usize, index + 1);
    }
}
