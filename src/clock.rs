//! Master clock shared by every timing decision in the engine
//!
//! A single monotonic time source anchored at an origin `Instant`. Both the
//! video and audio loops of a streaming session, the cadence converters and
//! the supervised delivery path measure time against the same clock, so a
//! drift between them is always a real scheduling drift and never a clock
//! disagreement.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;

/// Monotonic master clock
///
/// Cheap to clone (shared origin). `reset()` re-anchors time zero and is
/// only intended for session start.
#[derive(Clone)]
pub struct MasterClock {
    origin: Arc<RwLock<Instant>>,
}

impl MasterClock {
    /// Create a clock anchored at the current instant
    pub fn new() -> Self {
        Self {
            origin: Arc::new(RwLock::new(Instant::now())),
        }
    }

    /// Seconds elapsed since the anchor
    pub fn elapsed(&self) -> f64 {
        self.origin.read().elapsed().as_secs_f64()
    }

    /// Milliseconds elapsed since the anchor
    pub fn elapsed_ms(&self) -> u64 {
        self.origin.read().elapsed().as_millis() as u64
    }

    /// Re-anchor time zero at the current instant
    pub fn reset(&self) {
        *self.origin.write() = Instant::now();
    }
}

impl Default for MasterClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_elapsed_is_monotonic() {
        let clock = MasterClock::new();
        let t1 = clock.elapsed();
        std::thread::sleep(Duration::from_millis(5));
        let t2 = clock.elapsed();
        assert!(t2 > t1);
        assert!(t1 >= 0.0);
    }

    #[test]
    fn test_reset_re_anchors() {
        let clock = MasterClock::new();
        std::thread::sleep(Duration::from_millis(10));
        assert!(clock.elapsed_ms() >= 10);

        clock.reset();
        assert!(clock.elapsed() < 0.05);
    }

    #[test]
    fn test_clones_share_the_anchor() {
        let clock = MasterClock::new();
        let other = clock.clone();
        std::thread::sleep(Duration::from_millis(5));

        other.reset();
        assert!(clock.elapsed() < 0.05);
    }
}
