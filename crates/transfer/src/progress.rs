use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Byte-level progress of one file transfer, tracked per chunk index.
///
/// Chunks may be in flight on several connections at once; each reports the
/// bytes it has had acknowledged so far and the totals are summed here.
#[derive(Debug, Clone)]
pub struct ChunkProgress {
    total: u64,
    already_stored: u64,
    per_chunk: HashMap<u64, u64>,
}

impl ChunkProgress {
    /// `already_stored` counts bytes of chunks the server had before this transfer.
    pub fn new(total: u64, already_stored: u64) -> Self {
        Self {
            total,
            already_stored,
            per_chunk: HashMap::new(),
        }
    }

    /// Records the acknowledged byte count of chunk `index`.
    pub fn set(&mut self, index: u64, bytes: u64) {
        self.per_chunk.insert(index, bytes);
    }

    /// Forgets progress of a chunk that must be sent again.
    pub fn reset(&mut self, index: u64) {
        self.per_chunk.remove(&index);
    }

    pub fn transferred(&self) -> u64 {
        (self.already_stored + self.per_chunk.values().sum::<u64>()).min(self.total)
    }

    /// Whole percentage, rounded down.
    pub fn percentage(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        (self.transferred() * 100 / self.total) as u8
    }
}

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Calculates transfer speed using a sliding window of samples.
pub struct SpeedCalculator {
    inner: Mutex<SpeedInner>,
}

struct SpeedInner {
    samples: Vec<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window_size`: time window for speed calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                samples: Vec::new(),
                max_samples: max_samples.unwrap_or(100),
                window_size: window_size.unwrap_or(Duration::from_secs(5)),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SpeedInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records a sample of `bytes` transferred at the current instant.
    pub fn add_sample(&self, bytes: u64) {
        let mut s = self.lock();
        let now = Instant::now();
        s.samples.push(SpeedSample {
            bytes,
            timestamp: now,
        });

        // Prune samples outside the window.
        let cutoff = now - s.window_size;
        s.samples.retain(|sample| sample.timestamp >= cutoff);

        // Limit sample count.
        if s.samples.len() > s.max_samples {
            let excess = s.samples.len() - s.max_samples;
            s.samples.drain(..excess);
        }
    }

    /// Returns the average speed in bytes/second within the window.
    ///
    /// Returns 0.0 if fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let s = self.lock();
        if s.samples.len() < 2 {
            return 0.0;
        }

        let first = &s.samples[0];
        let last = &s.samples[s.samples.len() - 1];
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }

        let total_bytes: u64 = s.samples.iter().map(|sample| sample.bytes).sum();
        total_bytes as f64 / elapsed.as_secs_f64()
    }

    /// Estimates time remaining to transfer `remaining_bytes`.
    ///
    /// Returns `None` if speed is zero.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        let secs = remaining_bytes as f64 / speed;
        Some(Duration::from_secs_f64(secs))
    }

    /// Clears all recorded samples.
    pub fn reset(&self) {
        let mut s = self.lock();
        s.samples.clear();
    }
}
