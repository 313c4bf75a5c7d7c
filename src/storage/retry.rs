//! Bounded retry with exponential backoff for config store contention
//!
//! Every ConfigStore operation runs through `RetryPolicy::run`. SQLite's own
//! busy handler is disabled on our connections, so `SQLITE_BUSY` and
//! `SQLITE_LOCKED` surface immediately and the schedule here is the only one
//! in effect.

use rusqlite::ErrorCode;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::{defaults, RetryConfig};
use crate::error::{ErrorContext, PipelineError, Result};

/// Retry budget for one storage operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Overall wall-clock budget including backoff sleeps.
    pub operation_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: defaults::RETRY_MAX_RETRIES,
            base_delay: Duration::from_millis(defaults::RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(defaults::RETRY_MAX_DELAY_MS),
            operation_timeout: None,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            operation_timeout: cfg.operation_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Outcome of a single attempt: contention is retried, anything else is final.
#[derive(Debug)]
pub(crate) enum AttemptError {
    Busy(rusqlite::Error),
    Fail(PipelineError),
}

impl From<PipelineError> for AttemptError {
    fn from(err: PipelineError) -> Self {
        AttemptError::Fail(err)
    }
}

impl AttemptError {
    /// Sort a raw SQLite error into retryable contention or a storage failure.
    pub(crate) fn classify(err: rusqlite::Error, context: &ErrorContext) -> Self {
        if is_contention(&err) {
            AttemptError::Busy(err)
        } else {
            AttemptError::Fail(PipelineError::storage(err, context.clone()))
        }
    }
}

/// `SQLITE_BUSY` or `SQLITE_LOCKED`.
pub(crate) fn is_contention(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

impl RetryPolicy {
    /// Policy that never sleeps. Useful when the caller handles contention.
    pub const fn no_retry() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            operation_timeout: None,
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Delay before retry number `attempt + 1`: `base * 2^attempt`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Run `op` until it succeeds, fails hard, or the budget is spent.
    pub(crate) fn run<T>(
        &self,
        context: &ErrorContext,
        op: impl FnMut() -> std::result::Result<T, AttemptError>,
    ) -> Result<T> {
        self.run_with(context, op, std::thread::sleep)
    }

    /// `run` with an injectable sleeper.
    pub(crate) fn run_with<T>(
        &self,
        context: &ErrorContext,
        mut op: impl FnMut() -> std::result::Result<T, AttemptError>,
        mut sleep: impl FnMut(Duration),
    ) -> Result<T> {
        let started = Instant::now();
        let mut waited = Duration::ZERO;
        let mut attempt: u32 = 0;

        loop {
            let err = match op() {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation = context.operation, attempts = attempt + 1, "Config store operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(AttemptError::Fail(e)) => return Err(e),
                Err(AttemptError::Busy(e)) => e,
            };

            if attempt >= self.max_retries {
                warn!(
                    operation = context.operation,
                    attempts = attempt + 1,
                    error = %err,
                    "Config store still locked, giving up"
                );
                return Err(PipelineError::Locked {
                    attempts: attempt + 1,
                    context: context.clone(),
                });
            }

            let delay = self.delay_for(attempt);
            // Real sleeps show up in `started`, injected ones only in `waited`
            let spent = started.elapsed().max(waited);
            if let Some(limit) = self.operation_timeout {
                if spent + delay > limit {
                    warn!(
                        operation = context.operation,
                        elapsed_ms = spent.as_millis() as u64,
                        limit_ms = limit.as_millis() as u64,
                        "Config store operation exceeded its time budget"
                    );
                    return Err(PipelineError::Timeout {
                        elapsed: spent,
                        context: context.clone(),
                    });
                }
            }

            warn!(
                operation = context.operation,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Config store busy, backing off"
            );
            sleep(delay);
            waited += delay;
            attempt += 1;
        }
    }
}
