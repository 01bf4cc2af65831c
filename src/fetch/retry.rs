//! Backoff, time bounds and cancellation for fetch attempts

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::ProtocolError;

/// How long to keep retrying while the server is preparing a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry
    #[serde(with = "seconds")]
    pub initial_backoff: Duration,
    /// Upper bound for the doubling delay
    #[serde(with = "seconds")]
    pub max_backoff: Duration,
    /// Total stage1 attempts, the first one included
    pub max_attempts: u32,
    /// Time budget for the whole attempt, requests in flight included; `None` for no limit
    #[serde(with = "optional_seconds")]
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_attempts: 10,
            deadline: Some(Duration::from_secs(120)),
        }
    }
}

impl RetryPolicy {
    /// Starts a backoff sequence now
    pub fn backoff(&self) -> Backoff {
        self.backoff_since(Instant::now())
    }

    /// Starts a backoff sequence whose deadline counts from `started`
    pub fn backoff_since(&self, started: Instant) -> Backoff {
        Backoff {
            policy: *self,
            attempts: 1,
            next: self.initial_backoff,
            started,
        }
    }

    /// When an attempt started at `started` must be over, if it is bounded
    pub fn deadline_from(&self, started: Instant) -> Option<Instant> {
        self.deadline.map(|deadline| started + deadline)
    }
}

/// Retry state of one verification attempt
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Limits
    policy: RetryPolicy,
    /// Attempts made so far
    attempts: u32,
    /// Delay before the next attempt, without a server hint
    next: Duration,
    /// When the first attempt started
    started: Instant,
}

impl Backoff {
    /// Attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before the next attempt, or `None` when the budget is spent
    ///
    /// A server `hint` longer than the computed delay is honored.
    pub fn next_delay(&mut self, hint: Option<Duration>) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        let delay = hint.map_or(self.next, |hint| hint.max(self.next));
        if let Some(deadline) = self.policy.deadline {
            if self.started.elapsed() + delay > deadline {
                return None;
            }
        }
        self.attempts += 1;
        self.next = (self.next * 2).min(self.policy.max_backoff);
        Some(delay)
    }
}

/// Creates a connected cancel handle and signal
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (sender, receiver) = watch::channel(false);
    (CancelHandle(Arc::new(sender)), CancelSignal(receiver))
}

/// Host side of cancellation
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    /// Cancels every attempt watching this handle
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Fetch side of cancellation
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    /// A signal that is never cancelled
    pub fn never() -> Self {
        let (_, receiver) = watch::channel(false);
        Self(receiver)
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Completes once cancellation is requested
    pub async fn cancelled(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                // handle dropped without cancelling
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::never()
    }
}

/// Runs `future` for at most `timeout`, dropping it early if `cancel` fires
pub async fn bounded<F: Future>(
    timeout: Duration,
    cancel: &mut CancelSignal,
    future: F,
) -> Result<F::Output, ProtocolError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProtocolError::Cancelled),
        output = tokio::time::timeout(timeout, future) => output.map_err(|_| ProtocolError::TimedOut),
    }
}

/// Sleeps for `delay` unless cancelled first
pub async fn sleep(delay: Duration, cancel: &mut CancelSignal) -> Result<(), ProtocolError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProtocolError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// `Duration` as whole seconds
mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes as seconds
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    /// Deserializes from seconds
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// `Option<Duration>` as whole seconds
mod optional_seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes as seconds, `None` as nothing
    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(duration) => serializer.serialize_some(&duration.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    /// Deserializes from seconds
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|secs| secs.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Policy without a deadline
    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
            max_attempts,
            deadline: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_doubling_backoff() {
        let mut backoff = policy(6).backoff();
        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_delay(None)).collect();
        assert_eq!(
            delays,
            [1, 2, 4, 5, 5].map(Duration::from_secs).to_vec()
        );
        assert_eq!(backoff.attempts(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hint_honored_when_larger() {
        let mut backoff = policy(10).backoff();
        assert_eq!(
            backoff.next_delay(Some(Duration::from_secs(7))),
            Some(Duration::from_secs(7))
        );
        // computed delay is now 2s
        assert_eq!(
            backoff.next_delay(Some(Duration::from_millis(500))),
            Some(Duration::from_secs(2))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline() {
        let mut backoff = RetryPolicy {
            deadline: Some(Duration::from_secs(10)),
            ..policy(100)
        }
        .backoff();
        assert_eq!(backoff.next_delay(None), Some(Duration::from_secs(1)));
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(backoff.next_delay(None), Some(Duration::from_secs(2)));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(backoff.next_delay(None), None);
    }

    #[tokio::test(start_paused = true)]
    /// Time spent before the first stage1 attempt counts against the deadline
    async fn test_deadline_counts_from_start() {
        let bounded = RetryPolicy {
            deadline: Some(Duration::from_secs(10)),
            ..policy(100)
        };
        let started = Instant::now();
        assert_eq!(
            bounded.deadline_from(started),
            Some(started + Duration::from_secs(10))
        );
        assert_eq!(policy(3).deadline_from(started), None);

        tokio::time::advance(Duration::from_secs(9)).await;
        let mut backoff = bounded.backoff_since(started);
        assert_eq!(backoff.next_delay(None), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_timeout() {
        let mut cancel = CancelSignal::never();
        let result = bounded(
            Duration::from_secs(1),
            &mut cancel,
            tokio::time::sleep(Duration::from_secs(5)),
        )
        .await;
        assert_eq!(result, Err(ProtocolError::TimedOut));

        let result = bounded(Duration::from_secs(1), &mut cancel, async { 7 }).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    /// Cancelling drops the in-flight future
    async fn test_bounded_cancel() {
        let (handle, mut cancel) = cancel_pair();
        let dropped = Arc::new(());
        let held = dropped.clone();
        let in_flight = async move {
            let _held = held;
            std::future::pending::<()>().await
        };

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.cancel();
        });
        let result = bounded(Duration::from_secs(60), &mut cancel, in_flight).await;
        canceller.await.unwrap();

        assert_eq!(result, Err(ProtocolError::Cancelled));
        assert!(cancel.is_cancelled());
        assert_eq!(Arc::strong_count(&dropped), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_cancelled() {
        let (handle, mut cancel) = cancel_pair();
        handle.cancel();
        assert_eq!(
            sleep(Duration::from_secs(60), &mut cancel).await,
            Err(ProtocolError::Cancelled)
        );
        assert_eq!(
            sleep(Duration::from_secs(1), &mut CancelSignal::never()).await,
            Ok(())
        );
    }

    #[test]
    fn test_policy_from_toml() {
        let policy: RetryPolicy = toml::from_str("initial_backoff = 2\ndeadline = 60").unwrap();
        assert_eq!(policy.initial_backoff, Duration::from_secs(2));
        assert_eq!(policy.max_backoff, Duration::from_secs(30));
        assert_eq!(policy.deadline, Some(Duration::from_secs(60)));
    }
}
