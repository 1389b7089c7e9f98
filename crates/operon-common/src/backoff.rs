//! Backoff policies and the retry driver built on them.
//!
//! A [`BackOff`] is a cursor over wait durations: each call to
//! [`BackOff::next_backoff`] yields the next interval, or `None` once the
//! policy is exhausted. Decorators own a [`BackOffFactory`] and draw a fresh
//! cursor for every invocation, so a cursor is never shared between
//! concurrent calls.
//!
//! # Example
//!
//! ```ignore
//! use operon_common::backoff::{default_backoff, retry_with_backoff};
//!
//! let state = retry_with_backoff(&default_backoff(), "get_current_state", || async {
//!     api.get("my-config").await.map_err(Error::from)
//! })
//! .await?;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{error, warn};

use crate::{Error, Result};

/// Maximum wait between two attempts of the default policy
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(10);

/// Maximum total time the default policy keeps retrying
pub const DEFAULT_MAX_ELAPSED: Duration = Duration::from_secs(120);

/// A policy producing successive retry wait durations.
pub trait BackOff: Send {
    /// Next wait duration, or `None` when no further attempt should be made
    fn next_backoff(&mut self) -> Option<Duration>;

    /// Rewind the cursor to its initial state
    fn reset(&mut self);
}

impl<B: BackOff + ?Sized> BackOff for Box<B> {
    fn next_backoff(&mut self) -> Option<Duration> {
        (**self).next_backoff()
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}

/// Produces a fresh backoff cursor for each retried invocation.
pub type BackOffFactory = Arc<dyn Fn() -> Box<dyn BackOff> + Send + Sync>;

/// Build a factory that hands out reset copies of a prototype policy
pub fn factory<B>(prototype: B) -> BackOffFactory
where
    B: BackOff + Clone + Sync + 'static,
{
    Arc::new(move || {
        let mut backoff = prototype.clone();
        backoff.reset();
        Box::new(backoff) as Box<dyn BackOff>
    })
}

/// Default policy: exponential, 10s max interval, 2m max elapsed time
pub fn default_backoff() -> BackOffFactory {
    factory(ExponentialBackOff::default())
}

/// Exponential backoff with jitter.
///
/// Intervals grow by `multiplier` up to `max_interval`. Each interval is
/// randomized within `[1 - randomization_factor, 1 + randomization_factor]`
/// of its nominal value. The policy stops once `max_elapsed_time` has passed
/// since the last reset.
#[derive(Clone, Debug)]
pub struct ExponentialBackOff {
    /// First nominal interval
    pub initial_interval: Duration,
    /// Upper bound for the nominal interval
    pub max_interval: Duration,
    /// Total retry budget, `None` retries forever
    pub max_elapsed_time: Option<Duration>,
    multiplier: f64,
    randomization_factor: f64,
    current_interval: Duration,
    started: Instant,
}

impl Default for ExponentialBackOff {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(500),
            DEFAULT_MAX_INTERVAL,
            Some(DEFAULT_MAX_ELAPSED),
        )
    }
}

impl ExponentialBackOff {
    /// Create a policy with the default multiplier (1.5) and jitter (0.5)
    pub fn new(
        initial_interval: Duration,
        max_interval: Duration,
        max_elapsed_time: Option<Duration>,
    ) -> Self {
        Self {
            initial_interval,
            multiplier: 1.5,
            randomization_factor: 0.5,
            max_interval,
            max_elapsed_time,
            current_interval: initial_interval,
            started: Instant::now(),
        }
    }

    /// Override the growth factor. Values below 1.0 (and NaN) are raised to
    /// 1.0: intervals never shrink.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier.is_nan() {
            1.0
        } else {
            multiplier.max(1.0)
        };
        self
    }

    /// Override the jitter ratio, clamped to `[0.0, 1.0]`
    pub fn with_randomization_factor(mut self, factor: f64) -> Self {
        self.randomization_factor = if factor.is_nan() {
            0.0
        } else {
            factor.clamp(0.0, 1.0)
        };
        self
    }

    /// Growth factor in use
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Jitter ratio in use
    pub fn randomization_factor(&self) -> f64 {
        self.randomization_factor
    }

    fn jittered(&self, interval: Duration) -> Duration {
        if self.randomization_factor <= 0.0 {
            return interval;
        }
        let factor = rand::thread_rng()
            .gen_range(1.0 - self.randomization_factor..=1.0 + self.randomization_factor);
        Duration::try_from_secs_f64(interval.as_secs_f64() * factor).unwrap_or(interval)
    }
}

impl BackOff for ExponentialBackOff {
    fn next_backoff(&mut self) -> Option<Duration> {
        if let Some(max) = self.max_elapsed_time {
            if self.started.elapsed() >= max {
                return None;
            }
        }

        let interval = self.jittered(self.current_interval);
        let grown = self.current_interval.as_secs_f64() * self.multiplier;
        self.current_interval = Duration::try_from_secs_f64(grown)
            .map_or(self.max_interval, |d| d.min(self.max_interval));
        Some(interval)
    }

    fn reset(&mut self) {
        self.current_interval = self.initial_interval;
        self.started = Instant::now();
    }
}

/// Fixed interval between attempts, never exhausted on its own.
#[derive(Clone, Debug)]
pub struct ConstantBackOff {
    /// Wait between two attempts
    pub interval: Duration,
}

impl ConstantBackOff {
    /// Create a constant policy
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl BackOff for ConstantBackOff {
    fn next_backoff(&mut self) -> Option<Duration> {
        Some(self.interval)
    }

    fn reset(&mut self) {}
}

/// Retry immediately, forever. Mostly useful in tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct ZeroBackOff;

impl BackOff for ZeroBackOff {
    fn next_backoff(&mut self) -> Option<Duration> {
        Some(Duration::ZERO)
    }

    fn reset(&mut self) {}
}

/// Never retry.
#[derive(Clone, Copy, Debug, Default)]
pub struct StopBackOff;

impl BackOff for StopBackOff {
    fn next_backoff(&mut self) -> Option<Duration> {
        None
    }

    fn reset(&mut self) {}
}

/// Caps another policy at a fixed number of retries.
#[derive(Clone, Debug)]
pub struct MaxRetries<B> {
    inner: B,
    max: u32,
    attempts: u32,
}

impl<B: BackOff> MaxRetries<B> {
    /// Allow at most `max` retries of `inner`
    pub fn new(inner: B, max: u32) -> Self {
        Self {
            inner,
            max,
            attempts: 0,
        }
    }
}

impl<B: BackOff> BackOff for MaxRetries<B> {
    fn next_backoff(&mut self) -> Option<Duration> {
        if self.attempts >= self.max {
            return None;
        }
        self.attempts += 1;
        self.inner.next_backoff()
    }

    fn reset(&mut self) {
        self.attempts = 0;
        self.inner.reset();
    }
}

/// Run `operation` until it succeeds, the error is not retryable, or the
/// backoff is exhausted.
///
/// `notify` is called with the error and the upcoming wait before every
/// sleep. The last error is returned on exhaustion.
pub async fn retry_notify<F, Fut, T, N>(
    backoff: &mut dyn BackOff,
    mut operation: F,
    mut notify: N,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    N: FnMut(&Error, Duration),
{
    backoff.reset();

    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !err.is_retryable() {
            return Err(err);
        }

        match backoff.next_backoff() {
            Some(delay) => {
                notify(&err, delay);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            None => return Err(err),
        }
    }
}

/// Execute an async operation with a fresh cursor from `backoff`.
///
/// Failed attempts are logged as warnings, exhaustion as an error.
pub async fn retry_with_backoff<F, Fut, T>(
    backoff: &BackOffFactory,
    operation_name: &str,
    operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut cursor = backoff();
    let mut attempt = 0u32;

    let result = retry_notify(cursor.as_mut(), operation, |e, delay| {
        attempt += 1;
        warn!(
            operation = %operation_name,
            attempt = attempt,
            error = %e,
            delay_ms = delay.as_millis() as u64,
            "Operation failed, retrying"
        );
    })
    .await;

    if let Err(e) = &result {
        error!(
            operation = %operation_name,
            error = %e,
            "Operation failed, giving up"
        );
    }
    result
}
