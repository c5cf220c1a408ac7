//! Bounded exponential-backoff retry for connection-level database operations.
//!
//! Only failures classified as transient (busy/locked database, cannot open,
//! "too many connections", deadlock or serialization conflicts) are retried.
//! Everything else, including every error raised while a migration script is
//! running, propagates on the first attempt.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rusqlite::ErrorCode;
use tracing::warn;

/// Message fragments that mark an error as transient regardless of its code.
const TRANSIENT_MESSAGES: &[&str] = &[
    "too many connections",
    "deadlock",
    "could not serialize",
    "serialization failure",
    "database is locked",
    "database is busy",
    "connection refused",
    "connection reset",
];

/// Classifies failures as transient (worth retrying) or fatal.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for rusqlite::Error {
    fn is_retryable(&self) -> bool {
        match self {
            rusqlite::Error::SqliteFailure(err, message) => {
                matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen
                ) || message.as_deref().is_some_and(is_transient_message)
            }
            _ => false,
        }
    }
}

impl Retryable for strata_common::Error {
    fn is_retryable(&self) -> bool {
        strata_common::Error::is_retryable(self)
    }
}

/// Whether a driver message describes a transient condition.
pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_MESSAGES.iter().any(|m| lower.contains(m))
}

/// Backoff parameters.
///
/// The delay before retry `n` (0-based) is
/// `min(initial_delay * multiplier^n, max_delay)`, plus a random extra of up to
/// `jitter` times that value.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff before retry number `retry` (0-based), without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Backoff before retry number `retry`, with up to `jitter` extra added.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::rng().random_range(0.0..=self.jitter);
        base + base.mul_f64(factor)
    }
}

type SleepFn = Arc<dyn Fn(Duration) + Send + Sync>;

/// Executes operations under a [`RetryPolicy`].
///
/// Sleeping is a plain blocking call by default; tests swap it for a
/// recorder with [`Retry::with_sleeper`].
#[derive(Clone)]
pub struct Retry {
    policy: RetryPolicy,
    sleep: SleepFn,
}

impl std::fmt::Debug for Retry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retry").field("policy", &self.policy).finish()
    }
}

impl Default for Retry {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl Retry {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            sleep: Arc::new(std::thread::sleep),
        }
    }

    pub fn with_sleeper(mut self, sleep: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleep = Arc::new(sleep);
        self
    }

    /// Run `op` until it succeeds, fails fatally, or the attempt budget runs out.
    /// On exhaustion the last error is returned.
    pub fn run<T, E, F>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        E: Retryable + Display,
        F: FnMut() -> Result<T, E>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = self.policy.delay_for_retry(attempt - 1);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "{what} failed with a transient error, retrying: {err}"
                    );
                    (self.sleep)(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
