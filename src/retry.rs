//! Retry policy execution engine
//!
//! A [`RetryPolicy`] runs an operation, classifies each failure with its
//! [`TransientErrorDetector`], waits according to its [`BackoffStrategy`] and
//! tries again until the operation succeeds, fails permanently, or the retry
//! budget runs out. Every retry is announced to the policy's listeners before
//! the backoff wait starts.
//!
//! When the budget runs out the caller receives a single
//! [`Error::RetriesExhausted`] holding every error observed, in attempt order,
//! plus the number of retries and the time of the first failure.
//!
//! # Example
//!
//! ```no_run
//! use reliable_sql::backoff::BackoffStrategy;
//! use reliable_sql::detection::ExtendedSqlDetector;
//! use reliable_sql::retry::RetryPolicy;
//! use std::time::Duration;
//!
//! # async fn example() -> reliable_sql::Result<()> {
//! let mut policy = RetryPolicy::new(
//!     ExtendedSqlDetector::extended(),
//!     BackoffStrategy::fixed(Duration::from_millis(100)),
//!     5,
//! );
//! policy.subscribe(|event| {
//!     println!("retry #{} after: {}", event.current_retry_count, event.error);
//! });
//!
//! let answer = policy.execute_action(|| async { Ok(42) }).await?;
//! assert_eq!(answer, 42);
//! # Ok(())
//! # }
//! ```

use crate::backoff::BackoffStrategy;
use crate::detection::TransientErrorDetector;
use crate::error::{Error, Result, RetryExhausted};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Notification fired before every retry
#[derive(Clone, Debug)]
pub struct RetryingEvent {
    /// Retry number about to be performed (1-based)
    pub current_retry_count: u32,
    /// Backoff delay that precedes the retry
    pub delay: Duration,
    /// Error that triggered the retry
    pub error: Error,
}

/// Callback invoked with every [`RetryingEvent`]
pub type RetryListener = Arc<dyn Fn(&RetryingEvent) + Send + Sync>;

/// Bookkeeping of a single execution
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetryAttemptContext {
    /// Retries performed so far
    pub attempts: u32,
    /// When the first failure happened, if any
    pub first_occurrence: Option<DateTime<Utc>>,
}

/// Retry policy: detector + backoff + retry budget + listeners
///
/// A policy tracks the attempts of the execution it is running, so one
/// instance must serve one operation at a time; `execute_*` take `&mut self`
/// to enforce this. Clone the policy to hand it to another connection or
/// command: clones share detector, backoff, budget and listeners but start
/// with a fresh attempt context.
pub struct RetryPolicy {
    detector: Arc<dyn TransientErrorDetector>,
    backoff: BackoffStrategy,
    max_retries: u32,
    listeners: Vec<RetryListener>,
    context: RetryAttemptContext,
}

impl RetryPolicy {
    /// Create a policy
    ///
    /// # Arguments
    ///
    /// * `detector` - Decides which errors are retried
    /// * `backoff` - Delay schedule between retries
    /// * `max_retries` - Retries after the initial attempt (0 = no retry)
    pub fn new(
        detector: impl TransientErrorDetector + 'static,
        backoff: BackoffStrategy,
        max_retries: u32,
    ) -> Self {
        Self::with_detector(Arc::new(detector), backoff, max_retries)
    }

    /// Create a policy around a shared detector
    pub fn with_detector(
        detector: Arc<dyn TransientErrorDetector>,
        backoff: BackoffStrategy,
        max_retries: u32,
    ) -> Self {
        Self {
            detector,
            backoff,
            max_retries,
            listeners: Vec::new(),
            context: RetryAttemptContext::default(),
        }
    }

    /// Attach a listener notified before every retry
    ///
    /// Listeners are carried over to every clone of this policy.
    pub fn subscribe<F>(&mut self, listener: F)
    where
        F: Fn(&RetryingEvent) + Send + Sync + 'static,
    {
        self.listeners.push(Arc::new(listener));
    }

    /// Attach an already shared listener
    pub fn subscribe_shared(&mut self, listener: RetryListener) {
        self.listeners.push(listener);
    }

    /// Number of attached listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Maximum number of retries after the initial attempt
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay schedule between retries
    pub fn backoff(&self) -> &BackoffStrategy {
        &self.backoff
    }

    /// Detector deciding which errors are retried
    pub fn detector(&self) -> &Arc<dyn TransientErrorDetector> {
        &self.detector
    }

    /// Whether the policy would retry `error`
    pub fn is_transient(&self, error: &Error) -> bool {
        self.detector.is_transient(error)
    }

    /// Bookkeeping of the current or most recent execution
    pub fn context(&self) -> RetryAttemptContext {
        self.context
    }

    /// Retries performed by the current or most recent execution
    pub fn attempts(&self) -> u32 {
        self.context.attempts
    }

    /// First failure of the current or most recent execution
    pub fn first_occurrence(&self) -> Option<DateTime<Utc>> {
        self.context.first_occurrence
    }

    /// Execute an async operation, retrying transient failures
    ///
    /// # Arguments
    ///
    /// * `operation` - Closure producing a fresh future for every attempt
    ///
    /// # Errors
    ///
    /// - The operation's own error if it is not transient
    /// - [`Error::RetriesExhausted`] if transient errors outlive the budget
    pub async fn execute_action<T, F, Fut>(&mut self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut scope = AttemptScope::begin(self);
        loop {
            match operation().await {
                Ok(value) => return Ok(scope.succeeded(value)),
                Err(error) => scope.failed(error).await?,
            }
        }
    }

    /// Execute an operation that needs mutable access to borrowed state
    ///
    /// Identical to [`execute_action`](Self::execute_action), but every attempt
    /// receives `state` mutably, which a plain `FnMut() -> Future` closure
    /// cannot lend to the future it returns.
    ///
    /// # Errors
    ///
    /// Same as [`execute_action`](Self::execute_action).
    pub async fn execute_with<S, T, F>(&mut self, state: &mut S, mut operation: F) -> Result<T>
    where
        S: ?Sized,
        F: for<'a> FnMut(&'a mut S) -> BoxFuture<'a, Result<T>>,
    {
        let mut scope = AttemptScope::begin(self);
        loop {
            match operation(&mut *state).await {
                Ok(value) => return Ok(scope.succeeded(value)),
                Err(error) => scope.failed(error).await?,
            }
        }
    }
}

impl Clone for RetryPolicy {
    fn clone(&self) -> Self {
        Self {
            detector: Arc::clone(&self.detector),
            backoff: self.backoff,
            max_retries: self.max_retries,
            listeners: self.listeners.clone(),
            context: RetryAttemptContext::default(),
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("backoff", &self.backoff)
            .field("max_retries", &self.max_retries)
            .field("listeners", &self.listeners.len())
            .field("context", &self.context)
            .finish()
    }
}

/// Per-execution state: the policy borrow, the collected errors
///
/// The policy's context is reset when the scope begins and updated on every
/// failure, so it stays readable after the execution ends. The errors vector
/// dies with the scope on every exit path, including a dropped future.
struct AttemptScope<'p> {
    policy: &'p mut RetryPolicy,
    errors: Vec<Error>,
}

impl<'p> AttemptScope<'p> {
    fn begin(policy: &'p mut RetryPolicy) -> Self {
        policy.context = RetryAttemptContext::default();
        Self {
            policy,
            errors: Vec::new(),
        }
    }

    fn succeeded<T>(self, value: T) -> T {
        let attempts = self.policy.context.attempts;
        if attempts > 0 {
            tracing::info!(attempts = attempts + 1, "Operation succeeded after retry");
        }
        value
    }

    /// Record a failure; `Ok(())` means "retry now", `Err` is terminal
    async fn failed(&mut self, error: Error) -> Result<()> {
        let context = &mut self.policy.context;
        let first_occurrence = *context.first_occurrence.get_or_insert_with(Utc::now);

        if !self.policy.detector.is_transient(&error) {
            tracing::error!(
                error = %error,
                attempts = context.attempts + 1,
                "Operation failed with non-transient error"
            );
            return Err(error);
        }

        if context.attempts >= self.policy.max_retries {
            tracing::error!(
                error = %error,
                attempts = context.attempts + 1,
                "Operation failed after all retry attempts exhausted"
            );
            self.errors.push(error);
            return Err(RetryExhausted {
                errors: std::mem::take(&mut self.errors),
                attempts: context.attempts,
                first_occurrence,
            }
            .into());
        }

        context.attempts += 1;
        let attempt = context.attempts;
        let delay = self.policy.backoff.next_delay(attempt);

        tracing::warn!(
            error = %error,
            attempt,
            max_retries = self.policy.max_retries,
            delay_ms = delay.as_millis(),
            "Operation failed, retrying"
        );

        let event = RetryingEvent {
            current_retry_count: attempt,
            delay,
            error,
        };
        for listener in &self.policy.listeners {
            listener(&event);
        }
        self.errors.push(event.error);

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}
