use std::fmt;

/// Congestion window stage.
///
/// The limiter starts in `SlowStart` and doubles its cap on every full ack
/// window. A backoff signal moves it to `Recovering`, which suppresses growth
/// until a full window of acks has passed; it then holds in `Waiting` until
/// the cap is actually being used before resuming additive growth in
/// `Increasing`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    SlowStart,
    Waiting,
    Increasing,
    Recovering,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::SlowStart => "slow_start",
            Stage::Waiting => "waiting",
            Stage::Increasing => "increasing",
            Stage::Recovering => "recovering",
        })
    }
}
