use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::internal_event;
use super::queue::{PushOutcome, Waiter, WaiterQueue};
use super::stage::Stage;
use super::{AcquireError, AdmissionSettings};

/// Admission limiter with an adaptive concurrency cap.
///
/// Callers [`acquire`](Limiter::acquire) a slot before running work against
/// the downstream and [`release`](Limiter::release) it afterwards; every
/// release acknowledges the admitted work and feeds the congestion window.
/// When the work's failure indicates the downstream is overloaded, signal
/// [`backoff`](Limiter::backoff) before releasing.
///
/// ```
/// use congestion_limiter::admission::{AdmissionSettings, Limiter};
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// const HIGH_PRIORITY: i32 = 100;
///
/// let limiter = Limiter::new(
///     AdmissionSettings::builder()
///         .queue_capacity(10)
///         .max_concurrency(10)
///         .build(),
/// );
/// let cancel = CancellationToken::new();
///
/// if limiter.acquire(&cancel, HIGH_PRIORITY).await.is_ok() {
///     // Make some sort of request here, and if its failure signals an
///     // overloaded downstream, call `limiter.backoff()` before releasing.
///     limiter.release();
/// }
/// # }
/// ```
pub struct Limiter {
    shared: Mutex<Shared>,
}

struct Shared {
    waiters: WaiterQueue,
    stage: Stage,
    acks_left: usize,
    in_flight: usize,
    cap: usize,
    max_cap: usize,
}

/// A point-in-time snapshot of the limiter.
///
/// Not guaranteed to stay consistent under concurrent use; intended for
/// observability and tests.
#[derive(Clone, Copy, Debug)]
pub struct LimiterState {
    cap: usize,
    in_flight: usize,
    queued: usize,
    stage: Stage,
}

impl LimiterState {
    /// The current adaptive concurrency cap.
    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Admitted operations that have not yet released.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Waiters currently parked behind the limiter.
    pub fn queued(&self) -> usize {
        self.queued
    }

    /// The congestion window stage.
    pub fn stage(&self) -> Stage {
        self.stage
    }
}

impl Limiter {
    pub fn new(settings: AdmissionSettings) -> Self {
        Self {
            shared: Mutex::new(Shared {
                waiters: WaiterQueue::new(settings.get_queue_capacity()),
                stage: Stage::SlowStart,
                acks_left: 1,
                in_flight: 0,
                cap: 1,
                max_cap: settings.get_max_concurrency().max(1),
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_state(
        stage: Stage,
        acks_left: usize,
        in_flight: usize,
        cap: usize,
        max_cap: usize,
        queue_capacity: usize,
    ) -> Self {
        Self {
            shared: Mutex::new(Shared {
                waiters: WaiterQueue::new(queue_capacity),
                stage,
                acks_left,
                in_flight,
                cap,
                max_cap,
            }),
        }
    }

    /// Acquire a slot, parking behind higher-priority waiters if the cap is
    /// reached. Larger priorities are more important.
    ///
    /// Returns [`AcquireError::Dropped`] when the waiter queue is full and
    /// this attempt does not outrank any queued waiter, and
    /// [`AcquireError::Cancelled`] when `cancel` fires first. If a grant
    /// races the cancellation and wins, the acquire succeeds and the caller
    /// owns the slot; release it as usual.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
        priority: i32,
    ) -> Result<(), AcquireError> {
        let (waiter, mut rx) = {
            let mut shared = self.shared.lock();

            if shared.in_flight < shared.cap && shared.waiters.is_empty() {
                shared.in_flight += 1;
                internal_event::emit_in_flight(shared.in_flight);
                return Ok(());
            }

            let (waiter, rx) = Waiter::new(priority);
            if shared.waiters.push(Arc::clone(&waiter)) == PushOutcome::Rejected {
                return Err(AcquireError::Dropped);
            }
            (waiter, rx)
        };

        tokio::select! {
            verdict = &mut rx => match verdict {
                Ok(verdict) => verdict,
                // The queue never abandons a waiter without a verdict; a
                // closed channel means the limiter itself was torn down.
                Err(_) => Err(AcquireError::Cancelled),
            },
            _ = cancel.cancelled() => {
                let mut shared = self.shared.lock();
                match rx.try_recv() {
                    // A verdict beat the cancellation. On a grant the slot
                    // is ours and the caller is expected to release it.
                    Ok(verdict) => verdict,
                    Err(_) => {
                        shared.waiters.remove(&waiter);
                        Err(AcquireError::Cancelled)
                    }
                }
            }
        }
    }

    /// Release a previously acquired slot, acknowledging the admitted work.
    ///
    /// Wakes as many parked waiters as the (possibly just-grown) cap allows,
    /// highest priority first.
    ///
    /// # Panics
    ///
    /// Panics if called without a matching acquire.
    pub fn release(&self) {
        let mut shared = self.shared.lock();

        shared.ack();

        assert!(shared.in_flight > 0, "release without a matching acquire");
        shared.in_flight -= 1;

        while shared.in_flight < shared.cap {
            let Some(waiter) = shared.waiters.pop() else {
                break;
            };
            // A waiter whose caller vanished consumes no slot.
            if waiter.grant() {
                shared.in_flight += 1;
            }
        }

        internal_event::emit_in_flight(shared.in_flight);
    }

    /// Signal that the admitted work appears to have overloaded the
    /// downstream, shrinking the cap. The slot is still held; the caller
    /// releases it separately.
    pub fn backoff(&self) {
        let mut shared = self.shared.lock();

        match shared.stage {
            // Backing off for longer than a full ack window means the
            // overload persists; shrink again.
            Stage::Recovering => {
                if shared.acks_left > 1 {
                    shared.acks_left -= 1;
                } else {
                    shared.decrease();
                }
            }
            Stage::SlowStart | Stage::Waiting | Stage::Increasing => shared.decrease(),
        }

        shared.set_stage(Stage::Recovering);
        internal_event::emit_backoff();
    }

    /// A snapshot of the limiter's adaptive state.
    pub fn state(&self) -> LimiterState {
        let shared = self.shared.lock();
        LimiterState {
            cap: shared.cap,
            in_flight: shared.in_flight,
            queued: shared.waiters.len(),
            stage: shared.stage,
        }
    }
}

impl fmt::Debug for Limiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared.lock();
        f.debug_struct("Limiter")
            .field("cap", &shared.cap)
            .field("max_cap", &shared.max_cap)
            .field("in_flight", &shared.in_flight)
            .field("stage", &shared.stage)
            .field("queued", &shared.waiters.len())
            .finish()
    }
}

impl Shared {
    /// One acknowledgement of admitted work, driving the congestion window.
    fn ack(&mut self) {
        if self.stage == Stage::Recovering {
            // Absorb this ack into a fresh waiting window: no growth until a
            // full cap's worth of successes has passed.
            self.acks_left = self.cap;
            self.set_stage(Stage::Waiting);
            return;
        }

        if self.acks_left > 1 {
            self.acks_left -= 1;
            return;
        }

        match self.stage {
            // Only grow out of Waiting once the cap is actually being used.
            Stage::Waiting => {
                if self.in_flight == self.cap {
                    self.set_stage(Stage::Increasing);
                }
            }
            Stage::SlowStart => self.set_cap(self.cap * 2),
            Stage::Increasing => self.set_cap(self.cap + 1),
            Stage::Recovering => {}
        }

        self.acks_left = self.cap;
    }

    fn decrease(&mut self) {
        self.set_cap((self.cap * 3 / 4).max(1));
        self.acks_left = self.cap;
    }

    fn set_cap(&mut self, cap: usize) {
        self.cap = cap.min(self.max_cap);
        internal_event::emit_limit(self.cap, self.stage);
    }

    fn set_stage(&mut self, stage: Stage) {
        if self.stage != stage {
            debug!(
                target: "admission::stats",
                from = %self.stage,
                to = %stage,
                "Stage transition"
            );
            self.stage = stage;
        }
    }
}
