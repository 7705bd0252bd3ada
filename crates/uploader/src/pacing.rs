use std::time::Duration;

use chunkferry_protocol::constants::SLICE_SIZE;

/// Slice size and send interval derived from a bytes-per-second budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    /// Payload bytes per data frame.
    pub slice: u64,
    /// Minimum time between the starts of two consecutive frames.
    pub interval: Duration,
}

impl Pacing {
    pub const UNLIMITED: Pacing = Pacing {
        slice: SLICE_SIZE,
        interval: Duration::ZERO,
    };

    /// Budget 0 means unlimited. Above one slice per second the slice stays
    /// at [`SLICE_SIZE`] and the interval shrinks; below it one smaller
    /// slice goes out per second.
    pub fn for_budget(bytes_per_sec: u64) -> Self {
        if bytes_per_sec == 0 {
            Self::UNLIMITED
        } else if bytes_per_sec > SLICE_SIZE {
            Self {
                slice: SLICE_SIZE,
                interval: Duration::from_millis(1000 * SLICE_SIZE / bytes_per_sec),
            }
        } else {
            Self {
                slice: bytes_per_sec,
                interval: Duration::from_secs(1),
            }
        }
    }

    /// How long to wait before the next frame when the last one went out
    /// `elapsed` ago.
    pub fn delay(&self, elapsed: Duration) -> Duration {
        self.interval.saturating_sub(elapsed)
    }
}

impl Default for Pacing {
    fn default() -> Self {
        Self::UNLIMITED
    }
}
