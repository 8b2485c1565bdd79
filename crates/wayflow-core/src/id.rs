//! Identifier generation for workflows, sessions and states.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

/// 2020-01-01T00:00:00Z in milliseconds.
const EPOCH_MS: i64 = 1_577_836_800_000;

/// Sequence bits below the millisecond timestamp.
const SEQUENCE_BITS: u32 = 12;

/// Monotonic `u64` ID source.
///
/// Time-based IDs sort by creation time and never repeat within one
/// generator. A sequential generator (1, 2, 3, ...) is available for tests
/// and embedded use.
#[derive(Debug)]
pub struct IdGenerator {
    last: AtomicU64,
    time_based: bool,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
            time_based: true,
        }
    }

    pub fn sequential() -> Self {
        Self {
            last: AtomicU64::new(0),
            time_based: false,
        }
    }

    /// Next ID; never 0.
    pub fn next(&self) -> u64 {
        let candidate = if self.time_based {
            let elapsed = (Utc::now().timestamp_millis() - EPOCH_MS).max(0) as u64;
            elapsed << SEQUENCE_BITS
        } else {
            0
        };

        let prev = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(candidate.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        candidate.max(prev + 1)
    }

    /// Make sure future IDs are greater than `id`.
    pub fn observe(&self, id: u64) {
        self.last.fetch_max(id, Ordering::SeqCst);
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_ids() {
        let ids = IdGenerator::sequential();
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
        ids.observe(10);
        assert_eq!(ids.next(), 11);
    }

    #[test]
    fn test_time_based_ids_increase() {
        let ids = IdGenerator::new();
        let mut last = 0;
        for _ in 0..1000 {
            let id = ids.next();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn test_ids_unique_across_threads() {
        let ids = std::sync::Arc::new(IdGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..500).map(|_| ids.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total);
    }
}
