use std::time::Duration;

use snafu::Snafu;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use super::limiter::Limiter;
use super::AcquireError;

/// Why a retry loop stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Snafu)]
pub enum RetryError {
    /// The limiter refused the (re)acquisition.
    #[snafu(context(false), display("admission failed: {source}"))]
    Admission { source: AcquireError },
    /// The next computed wake-up would land past the configured deadline, so
    /// re-acquiring would only pollute the queue with a doomed attempt.
    #[snafu(display("next retry would exceed the deadline"))]
    DeadlineExceeded,
}

/// Randomized exponential backoff retries on top of a [`Limiter`].
///
/// The first [`attempt`](Backoff::attempt) simply acquires. Every later one
/// signals [`Limiter::backoff`], returns the held slot, escalates priority
/// by one (so retries outrank fresh attempts of the same original
/// priority), grows the base step by half, and re-acquires after a jittered
/// delay in `[step/2, 3·step/2)`.
///
/// ```no_run
/// # async fn example() {
/// use std::time::Duration;
///
/// use congestion_limiter::admission::{AdmissionSettings, Backoff, Limiter};
/// use tokio_util::sync::CancellationToken;
///
/// let limiter = Limiter::new(AdmissionSettings::default());
/// let cancel = CancellationToken::new();
///
/// let mut retry = Backoff::new(&limiter, Duration::from_millis(10), 0);
/// while retry.attempt(&cancel).await {
///     let overloaded = run_request().await;
///     if !overloaded {
///         break;
///     }
/// }
/// drop(retry); // returns the held slot, if any
/// # }
/// # async fn run_request() -> bool { false }
/// ```
pub struct Backoff<'a> {
    limiter: &'a Limiter,
    step: Duration,
    priority: i32,
    deadline: Option<Instant>,
    last_error: Option<RetryError>,
    runs: u32,
    holds_slot: bool,
}

impl<'a> Backoff<'a> {
    pub fn new(limiter: &'a Limiter, step: Duration, priority: i32) -> Self {
        Self {
            limiter,
            step,
            priority,
            deadline: None,
            last_error: None,
            runs: 0,
            holds_slot: false,
        }
    }

    /// Stop retrying once the next wake-up would land past `deadline`.
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// The error that ended the most recent failed attempt.
    pub fn last_error(&self) -> Option<RetryError> {
        self.last_error
    }

    /// Return any slot still held to the limiter. Safe to call more than
    /// once; also runs on drop.
    pub fn close(&mut self) {
        if self.holds_slot {
            self.limiter.release();
            self.holds_slot = false;
        }
    }

    /// Run one admission attempt, backing off first if this is a retry.
    ///
    /// Returns `true` once a slot is held and the backoff delay has passed.
    /// Returns `false` when the attempt was dropped, cancelled, or would
    /// overrun the deadline; [`last_error`](Backoff::last_error) tells which.
    /// A `false` after cancellation during the delay leaves the slot held;
    /// [`close`](Backoff::close) (or drop) returns it.
    pub async fn attempt(&mut self, cancel: &CancellationToken) -> bool {
        self.runs += 1;
        if self.runs == 1 {
            return self.acquire(cancel).await;
        }

        // Retrying means the previous admission overloaded the downstream.
        self.limiter.backoff();
        self.close();

        self.priority += 1;
        self.step = self.step * 3 / 2;

        let jitter = rand::random::<f64>() + 0.5;
        let next_wake = Instant::now() + self.step.mul_f64(jitter);

        if let Some(deadline) = self.deadline {
            if next_wake > deadline {
                self.last_error = Some(RetryError::DeadlineExceeded);
                return false;
            }
        }

        debug!(
            target: "admission::retries",
            priority = self.priority,
            step_ms = self.step.as_millis() as u64,
            "Backing off before retry"
        );

        if !self.acquire(cancel).await {
            return false;
        }

        // Queueing may already have delayed us past the wake-up.
        if Instant::now() >= next_wake {
            return true;
        }

        tokio::select! {
            _ = sleep_until(next_wake) => true,
            _ = cancel.cancelled() => {
                // The slot stays held; close() will return it.
                self.last_error = Some(AcquireError::Cancelled.into());
                false
            }
        }
    }

    async fn acquire(&mut self, cancel: &CancellationToken) -> bool {
        match self.limiter.acquire(cancel, self.priority).await {
            Ok(()) => {
                self.holds_slot = true;
                true
            }
            Err(err) => {
                self.last_error = Some(err.into());
                false
            }
        }
    }
}

impl Drop for Backoff<'_> {
    fn drop(&mut self) {
        self.close();
    }
}
