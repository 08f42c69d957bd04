//! Live-lock detection.
//!
//! Each microstep contributes one sample: how much the internal queue grew
//! (or shrank) over it. When a full window of samples sums to zero or more,
//! the queue has not drained over the whole window and the session is
//! considered live-locked.
//!
//! Sample buffers are rented from a process-wide pool and returned when the
//! detector is dropped, whichever way the run ends.

use parking_lot::Mutex;

/// Default number of samples in the window.
pub const DEFAULT_WINDOW: usize = 36;

static POOL: Mutex<Vec<Vec<i64>>> = parking_lot::const_mutex(Vec::new());

/// Upper bound on pooled buffers.
const POOL_LIMIT: usize = 64;

fn rent(window: usize) -> Vec<i64> {
    let mut buffer = POOL.lock().pop().unwrap_or_default();
    buffer.clear();
    buffer.resize(window, 0);
    buffer
}

fn give_back(buffer: Vec<i64>) {
    let mut pool = POOL.lock();
    if pool.len() < POOL_LIMIT {
        pool.push(buffer);
    }
}

pub struct LiveLockDetector {
    samples: Vec<i64>,
    next: usize,
    filled: usize,
    sum: i64,
}

impl LiveLockDetector {
    /// Creates a detector over `window` samples. A window of zero is raised
    /// to one.
    pub fn new(window: usize) -> Self {
        Self {
            samples: rent(window.max(1)),
            next: 0,
            filled: 0,
            sum: 0,
        }
    }

    pub fn window(&self) -> usize {
        self.samples.len()
    }

    /// Records the queue-length change of one microstep. Returns `true`
    /// once the full window nets non-negative.
    pub fn sample(&mut self, delta: i64) -> bool {
        let window = self.samples.len();
        self.sum -= self.samples[self.next];
        self.samples[self.next] = delta;
        self.sum += delta;
        self.next = (self.next + 1) % window;
        if self.filled < window {
            self.filled += 1;
        }
        self.filled == window && self.sum >= 0
    }

    /// Forgets all samples.
    pub fn reset(&mut self) {
        self.samples.iter_mut().for_each(|s| *s = 0);
        self.next = 0;
        self.filled = 0;
        self.sum = 0;
    }
}

impl Drop for LiveLockDetector {
    fn drop(&mut self) {
        give_back(std::mem::take(&mut self.samples));
    }
}

impl std::fmt::Debug for LiveLockDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveLockDetector")
            .field("window", &self.samples.len())
            .field("filled", &self.filled)
            .field("sum", &self.sum)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_flat_queue_trips_after_full_window() {
        let mut detector = LiveLockDetector::new(DEFAULT_WINDOW);
        for _ in 0..DEFAULT_WINDOW - 1 {
            assert!(!detector.sample(0));
        }
        assert!(detector.sample(0));
    }

    #[test]
    fn test_draining_queue_never_trips() {
        let mut detector = LiveLockDetector::new(4);
        // grows and shrinks, but trends down
        for delta in [2, -3, 1, -2].iter().cycle().take(100) {
            assert!(!detector.sample(*delta));
        }
    }

    #[test]
    fn test_reset_starts_a_new_window() {
        let mut detector = LiveLockDetector::new(3);
        detector.sample(1);
        detector.sample(1);
        detector.reset();
        assert!(!detector.sample(1));
        assert!(!detector.sample(1));
        assert!(detector.sample(1));
    }

    #[test]
    fn test_zero_window_is_raised_to_one() {
        let mut detector = LiveLockDetector::new(0);
        assert_eq!(detector.window(), 1);
        assert!(!detector.sample(-1));
        assert!(detector.sample(0));
    }

    #[test]
    fn test_buffers_are_reused() {
        let detector = LiveLockDetector::new(8);
        drop(detector);
        let again = LiveLockDetector::new(8);
        assert_eq!(again.window(), 8);
        assert!(again.samples.iter().all(|s| *s == 0));
    }

    proptest! {
        #[test]
        fn prop_non_negative_sequences_trip(deltas in prop::collection::vec(0i64..3, 36..80)) {
            let mut detector = LiveLockDetector::new(36);
            let tripped: Vec<bool> = deltas.iter().map(|d| detector.sample(*d)).collect();
            prop_assert!(tripped[..35].iter().all(|t| !t));
            prop_assert!(tripped[35..].iter().all(|t| *t));
        }
    }
}
