//! High-water mark of a pool's usage, reported in operator stats.

use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct PeakTracker {
    peak: AtomicUsize,
}

impl PeakTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, used_bytes: usize) {
        if self.peak.fetch_max(used_bytes, Ordering::AcqRel) < used_bytes {
            tracing::trace!(used_bytes, "pool peak raised");
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::PeakTracker;

    #[test]
    fn keeps_the_maximum() {
        let t = PeakTracker::new();
        t.observe(10);
        t.observe(40);
        t.observe(5);
        assert_eq!(t.peak(), 40);
    }
}
