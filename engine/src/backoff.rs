// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Backoff
//!
//! [`BackOff`] is the retry policy, a pure function of the attempt count.
//! [`BackOffTimer`] drives it: one spawned task per key sleeps the next
//! delay, runs the attempt, and reschedules until the attempt succeeds, the
//! policy is exhausted, or the task is cancelled.
//!

use ::backoff::backoff::Backoff as InnerBackoff;
use serde::{Deserialize, Serialize};
use tokio::{sync::Semaphore, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

/// Retry policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackOff {
    /// Delay before the first attempt.
    pub delay: Duration,
    pub max_delay: Option<Duration>,
    pub max_elapsed_time: Option<Duration>,
    /// `None` retries forever.
    pub max_attempts: Option<u64>,
    pub multiplier: f64,
}

impl Default for BackOff {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(2),
            max_delay: None,
            max_elapsed_time: None,
            max_attempts: None,
            multiplier: 1.0,
        }
    }
}

impl BackOff {
    /// `min(max_delay, delay * multiplier ^ attempt)`, attempts counted from 0.
    pub fn delay_for(&self, attempt: u64) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.delay.as_secs_f64() * self.multiplier.powi(exponent);
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// A fresh cursor over the delays of this policy.
    pub fn cursor(&self) -> BackOffCursor {
        BackOffCursor::new(self.clone())
    }
}

impl fmt::Display for BackOff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BackOff[delay={:?}", self.delay)?;
        if let Some(max_delay) = self.max_delay {
            write!(f, ", maxDelay={:?}", max_delay)?;
        }
        if let Some(max_elapsed_time) = self.max_elapsed_time {
            write!(f, ", maxElapsedTime={:?}", max_elapsed_time)?;
        }
        if let Some(max_attempts) = self.max_attempts {
            write!(f, ", maxAttempts={}", max_attempts)?;
        }
        write!(f, ", multiplier={}]", self.multiplier)
    }
}

/// Iterates the delays of a [`BackOff`], ending once it is exhausted.
#[derive(Debug)]
pub struct BackOffCursor {
    backoff: BackOff,
    attempts: u64,
    started: Instant,
}

impl BackOffCursor {
    fn new(backoff: BackOff) -> Self {
        Self {
            backoff,
            attempts: 0,
            started: Instant::now(),
        }
    }

    pub fn attempts(&self) -> u64 {
        self.attempts
    }
}

impl InnerBackoff for BackOffCursor {
    fn next_backoff(&mut self) -> Option<Duration> {
        if let Some(max_attempts) = self.backoff.max_attempts {
            if self.attempts >= max_attempts {
                return None;
            }
        }
        if let Some(max_elapsed_time) = self.backoff.max_elapsed_time {
            if self.started.elapsed() >= max_elapsed_time {
                return None;
            }
        }
        let delay = self.backoff.delay_for(self.attempts);
        self.attempts += 1;
        Some(delay)
    }

    fn reset(&mut self) {
        self.attempts = 0;
        self.started = Instant::now();
    }
}

/// Status of a backoff task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackOffStatus {
    Active,
    /// The policy ran out of attempts or time.
    Exhausted,
    Cancelled,
    /// An attempt succeeded.
    Completed,
}

/// Point in time view of a backoff task.
#[derive(Clone, Debug, PartialEq)]
pub struct BackOffTaskState {
    pub key: String,
    pub status: BackOffStatus,
    pub attempts: u64,
    pub current_delay: Duration,
    pub elapsed: Duration,
    pub next_attempt_in: Option<Duration>,
    pub last_attempt_ago: Option<Duration>,
}

#[derive(Debug)]
struct TaskInner {
    status: BackOffStatus,
    attempts: u64,
    current_delay: Duration,
    next_attempt: Option<Instant>,
    last_attempt: Option<Instant>,
}

/// One scheduled retry sequence.
#[derive(Debug)]
pub struct BackOffTask {
    key: String,
    backoff: BackOff,
    created: Instant,
    token: CancellationToken,
    inner: Mutex<TaskInner>,
}

impl BackOffTask {
    fn new(key: &str, backoff: BackOff) -> Self {
        Self {
            key: key.to_owned(),
            backoff,
            created: Instant::now(),
            token: CancellationToken::new(),
            inner: Mutex::new(TaskInner {
                status: BackOffStatus::Active,
                attempts: 0,
                current_delay: Duration::ZERO,
                next_attempt: None,
                last_attempt: None,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, TaskInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn backoff(&self) -> &BackOff {
        &self.backoff
    }

    pub fn status(&self) -> BackOffStatus {
        self.inner().status
    }

    pub fn is_active(&self) -> bool {
        self.status() == BackOffStatus::Active
    }

    /// Attempts run so far.
    pub fn attempts(&self) -> u64 {
        self.inner().attempts
    }

    pub fn snapshot(&self) -> BackOffTaskState {
        let inner = self.inner();
        let now = Instant::now();
        BackOffTaskState {
            key: self.key.clone(),
            status: inner.status,
            attempts: inner.attempts,
            current_delay: inner.current_delay,
            elapsed: now.saturating_duration_since(self.created),
            next_attempt_in: inner
                .next_attempt
                .map(|next| next.saturating_duration_since(now)),
            last_attempt_ago: inner
                .last_attempt
                .map(|last| now.saturating_duration_since(last)),
        }
    }

    /// Stops the task. Has no effect once it is no longer active.
    pub fn cancel(&self) {
        {
            let mut inner = self.inner();
            if inner.status == BackOffStatus::Active {
                inner.status = BackOffStatus::Cancelled;
                inner.next_attempt = None;
            }
        }
        self.token.cancel();
    }

    fn finish(&self, status: BackOffStatus) {
        let mut inner = self.inner();
        if inner.status == BackOffStatus::Active {
            inner.status = status;
        }
        inner.next_attempt = None;
    }

    fn schedule_next(&self, delay: Duration) {
        let mut inner = self.inner();
        inner.current_delay = delay;
        inner.next_attempt = Some(Instant::now() + delay);
    }

    fn begin_attempt(&self) {
        let mut inner = self.inner();
        inner.attempts += 1;
        inner.next_attempt = None;
        inner.last_attempt = Some(Instant::now());
    }
}

/// Schedules backoff tasks. At most `pool_size` attempts run at a time.
#[derive(Clone, Debug)]
pub struct BackOffTimer {
    name: String,
    permits: Arc<Semaphore>,
}

impl BackOffTimer {
    pub fn new(name: &str, pool_size: usize) -> Self {
        Self {
            name: name.to_owned(),
            permits: Arc::new(Semaphore::new(pool_size.max(1))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawns the retry loop for `key` and returns its task handle.
    ///
    /// `attempt` runs on each tick and returns `true` to retry.
    /// `on_complete` runs once when the task is no longer active.
    pub fn schedule<A, AF, C, CF>(
        &self,
        key: &str,
        backoff: BackOff,
        attempt: A,
        on_complete: C,
    ) -> Arc<BackOffTask>
    where
        A: Fn(Arc<BackOffTask>) -> AF + Send + Sync + 'static,
        AF: Future<Output = bool> + Send + 'static,
        C: FnOnce(Arc<BackOffTask>) -> CF + Send + 'static,
        CF: Future<Output = ()> + Send + 'static,
    {
        let task = Arc::new(BackOffTask::new(key, backoff.clone()));
        let runner = task.clone();
        let permits = self.permits.clone();
        let name = self.name.clone();
        debug!("{}: scheduling {} with {}", name, key, backoff);

        tokio::spawn(async move {
            let mut cursor = backoff.cursor();
            loop {
                let Some(delay) = cursor.next_backoff() else {
                    runner.finish(BackOffStatus::Exhausted);
                    break;
                };
                runner.schedule_next(delay);
                trace!("{}: next attempt of {} in {:?}", name, runner.key(), delay);

                tokio::select! {
                    _ = runner.token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                let _permit = tokio::select! {
                    _ = runner.token.cancelled() => break,
                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => {
                            runner.cancel();
                            break;
                        }
                    },
                };
                if !runner.is_active() {
                    break;
                }

                runner.begin_attempt();
                if !attempt(runner.clone()).await {
                    runner.finish(BackOffStatus::Completed);
                    break;
                }
            }
            on_complete(runner).await;
        });

        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU64, Ordering};

    fn backoff(max_attempts: Option<u64>) -> BackOff {
        BackOff {
            delay: Duration::from_millis(100),
            max_delay: Some(Duration::from_millis(350)),
            max_elapsed_time: None,
            max_attempts,
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_delay_grows_until_max_delay() {
        let backoff = backoff(None);
        assert_eq!(backoff.delay_for(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(350));
        assert_eq!(backoff.delay_for(u64::MAX), Duration::from_millis(350));
    }

    #[test]
    fn test_cursor_stops_after_max_attempts() {
        let mut cursor = backoff(Some(3)).cursor();
        assert!(cursor.next_backoff().is_some());
        assert!(cursor.next_backoff().is_some());
        assert!(cursor.next_backoff().is_some());
        assert_eq!(cursor.next_backoff(), None);
        cursor.reset();
        assert_eq!(cursor.next_backoff(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_display() {
        let text = backoff(Some(3)).to_string();
        assert!(text.starts_with("BackOff[delay=100ms"));
        assert!(text.contains("maxAttempts=3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_completes_on_success() {
        let timer = BackOffTimer::new("test", 1);
        let calls = Arc::new(AtomicU64::new(0));
        let attempt_calls = calls.clone();
        let (sender, receiver) = tokio::sync::oneshot::channel();
        let task = timer.schedule(
            "foo",
            backoff(None),
            move |_task| {
                let calls = attempt_calls.clone();
                async move { calls.fetch_add(1, Ordering::SeqCst) < 2 }
            },
            move |task| async move {
                let _ = sender.send(task.status());
            },
        );

        assert_eq!(receiver.await.unwrap(), BackOffStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(task.attempts(), 3);
        assert_eq!(task.snapshot().current_delay, Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_exhausts() {
        let timer = BackOffTimer::new("test", 1);
        let (sender, receiver) = tokio::sync::oneshot::channel();
        let task = timer.schedule(
            "foo",
            backoff(Some(2)),
            |_task| async { true },
            move |task| async move {
                let _ = sender.send(task.status());
            },
        );
        assert_eq!(receiver.await.unwrap(), BackOffStatus::Exhausted);
        assert_eq!(task.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_pending_attempt() {
        let timer = BackOffTimer::new("test", 1);
        let calls = Arc::new(AtomicU64::new(0));
        let attempt_calls = calls.clone();
        let (sender, receiver) = tokio::sync::oneshot::channel();
        let task = timer.schedule(
            "foo",
            backoff(None),
            move |_task| {
                let calls = attempt_calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    true
                }
            },
            move |task| async move {
                let _ = sender.send(task.status());
            },
        );
        task.cancel();
        assert_eq!(receiver.await.unwrap(), BackOffStatus::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
