use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounded retry with linear backoff: the wait after attempt `n` is
/// `base_delay * n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    #[serde(rename = "base_delay_ms", with = "millis")]
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryExhausted<E> {
    pub attempts: usize,
    pub last_error: E,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn single_attempt() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn delay_after(&self, attempt: usize) -> Duration {
        self.base_delay * attempt as u32
    }

    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.max_attempts.max(1))
            .map(|attempt| self.delay_after(attempt))
            .collect()
    }

    pub fn run<T, E, F>(&self, op: F) -> Result<T, RetryExhausted<E>>
    where
        F: FnMut(usize) -> Result<T, E>,
    {
        self.run_when(op, |_| true)
    }

    /// Like [`RetryPolicy::run`], but only errors accepted by `retryable`
    /// trigger another attempt.
    pub fn run_when<T, E, F, P>(&self, mut op: F, retryable: P) -> Result<T, RetryExhausted<E>>
    where
        F: FnMut(usize) -> Result<T, E>,
        P: Fn(&E) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1usize;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= max_attempts || !retryable(&err) {
                        return Err(RetryExhausted {
                            attempts: attempt,
                            last_error: err,
                        });
                    }
                    let delay = self.delay_after(attempt);
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
