//! Limit the number of requests concurrently admitted to a shared,
//! overloadable downstream.
//!
//! The [`Limiter`] hands out slots up to an adaptive cap and parks surplus
//! callers in a bounded priority queue; under saturation the weakest waiter
//! is shed rather than the process stalling. The cap follows an AIMD
//! (additive-increase / multiplicative-decrease) law driven by two signals:
//! every [`Limiter::release`] counts as an acknowledgement, and
//! [`Limiter::backoff`] tells the limiter the admitted work appeared to
//! overload the downstream. The limiter performs no I/O itself; the caller
//! decides which failures mean congestion.
//!
//! [`Backoff`] wraps the limiter into a retry loop with randomized
//! exponential delays, priority escalation, and deadline awareness.

mod internal_event;
mod queue;
mod stage;

pub mod limiter;
pub mod retries;

use bon::Builder;
use snafu::Snafu;

pub use limiter::{Limiter, LimiterState};
pub use retries::{Backoff, RetryError};
pub use stage::Stage;

/// Why an acquisition attempt ended without a slot.
///
/// Both variants are terminal for the attempt and equality-comparable so
/// callers can branch on them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Snafu)]
pub enum AcquireError {
    /// The waiter queue was full and this attempt did not outrank anyone;
    /// the system chose to shed it.
    #[snafu(display("admission attempt dropped by a full waiter queue"))]
    Dropped,
    /// The caller's cancellation fired before a slot was granted.
    #[snafu(display("admission attempt cancelled"))]
    Cancelled,
}

/// Configuration of the admission limiter.
///
/// The defaults suit a downstream whose safe concurrency is unknown; set
/// `max_concurrency` to the downstream's known capacity when you have one.
#[derive(Clone, Copy, Debug, Builder)]
pub struct AdmissionSettings {
    /// Upper bound on waiters parked behind the limiter. Zero disables
    /// queueing entirely: any acquire that misses the fast path is dropped.
    #[builder(default = default_queue_capacity())]
    queue_capacity: usize,

    /// Upper bound for the adaptive concurrency cap. Values below 1 are
    /// treated as 1; the cap never exceeds this.
    #[builder(default = default_max_concurrency())]
    max_concurrency: usize,
}

const fn default_queue_capacity() -> usize {
    100
}

const fn default_max_concurrency() -> usize {
    200
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl AdmissionSettings {
    pub fn get_queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn get_max_concurrency(&self) -> usize {
        self.max_concurrency
    }
}
