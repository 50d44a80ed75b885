//! Monotonic bill-number allocation.
//!
//! Numbers come from a single process-wide sequence, so two sales can never
//! be assigned the same bill number. Uniqueness is structural, not
//! probabilistic.

use std::sync::atomic::{AtomicU64, Ordering};

use rxledger_billing::BillNumber;

#[derive(Debug, Default)]
pub struct BillNumberSequence {
    counter: AtomicU64,
}

impl BillNumberSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from a persisted high-water mark.
    pub fn starting_at(last_issued: u64) -> Self {
        Self {
            counter: AtomicU64::new(last_issued),
        }
    }

    /// Allocate the next bill number. Never yields the same value twice.
    pub fn next(&self, year: i32) -> BillNumber {
        let sequence = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        BillNumber::from_sequence(year, sequence)
    }

    pub fn last_issued(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn numbers_are_sequential() {
        let seq = BillNumberSequence::new();
        assert_eq!(seq.next(2026).as_str(), "RX-2026-000001");
        assert_eq!(seq.next(2026).as_str(), "RX-2026-000002");
        assert_eq!(seq.last_issued(), 2);
    }

    #[test]
    fn resumes_from_high_water_mark() {
        let seq = BillNumberSequence::starting_at(41);
        assert_eq!(seq.next(2026).as_str(), "RX-2026-000042");
    }

    #[test]
    fn concurrent_allocation_never_collides() {
        let seq = Arc::new(BillNumberSequence::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let seq = Arc::clone(&seq);
            handles.push(std::thread::spawn(move || {
                (0..100).map(|_| seq.next(2026)).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for number in handle.join().unwrap() {
                assert!(seen.insert(number.as_str().to_string()));
            }
        }
        assert_eq!(seen.len(), 800);
    }
}
