//! The most recent ball estimate, shared between the analysis worker and the
//! reporter.
//!
//! Each update swaps in a whole new [`EstimateSnapshot`], so a reader gets
//! both axes from the same detection or from none.

use std::sync::Arc;

use arc_swap::ArcSwap;
use balltrack_core::Coordinate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EstimateSnapshot {
    pub coordinate: Coordinate,
    /// Number of publishes so far; 0 means nothing was detected yet.
    pub revision: u64,
}

impl EstimateSnapshot {
    pub const INITIAL: Self = Self { coordinate: Coordinate::ORIGIN, revision: 0 };
}

/// Cheap to clone; clones share one estimate.
#[derive(Debug, Clone)]
pub struct SharedEstimate {
    current: Arc<ArcSwap<EstimateSnapshot>>,
}

impl SharedEstimate {
    pub fn new() -> Self {
        Self { current: Arc::new(ArcSwap::from_pointee(EstimateSnapshot::INITIAL)) }
    }

    /// Replaces the estimate and returns its revision.
    pub fn publish(&self, coordinate: Coordinate) -> u64 {
        let previous = self
            .current
            .rcu(|current| EstimateSnapshot { coordinate, revision: current.revision + 1 });
        previous.revision + 1
    }

    pub fn load(&self) -> EstimateSnapshot {
        **self.current.load()
    }

    pub fn coordinate(&self) -> Coordinate {
        self.load().coordinate
    }
}

impl Default for SharedEstimate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn starts_at_origin() {
        assert_eq!(SharedEstimate::new().load(), EstimateSnapshot::INITIAL);
    }

    #[test]
    fn written_pair_reads_back_exactly() {
        let estimate = SharedEstimate::new();
        let writer = estimate.clone();
        thread::spawn(move || writer.publish(Coordinate::new(42, 17))).join().unwrap();

        let reader = estimate.clone();
        let seen = thread::spawn(move || reader.load()).join().unwrap();
        assert_eq!(seen, EstimateSnapshot { coordinate: Coordinate::new(42, 17), revision: 1 });
    }

    #[test]
    fn readers_never_see_a_torn_pair() {
        let estimate = SharedEstimate::new();
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let estimate = estimate.clone();
            let done = Arc::clone(&done);
            thread::spawn(move || {
                for i in 1..=20_000 {
                    estimate.publish(Coordinate::new(i, i + 7));
                }
                done.store(true, Ordering::Release);
            })
        };

        let mut last_revision = 0;
        while !done.load(Ordering::Acquire) {
            let snap = estimate.load();
            if snap.revision > 0 {
                assert_eq!(snap.coordinate.y - snap.coordinate.x, 7, "torn read: {:?}", snap);
                assert_eq!(snap.coordinate.x as u64, snap.revision);
            }
            assert!(snap.revision >= last_revision);
            last_revision = snap.revision;
        }
        writer.join().unwrap();
        assert_eq!(estimate.load().revision, 20_000);
    }
}
