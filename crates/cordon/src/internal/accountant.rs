use std::sync::atomic::{AtomicUsize, Ordering};

/// Per-isolate guest-heap accountant.
///
/// Owned by a single isolate so that multiple isolates remain independently
/// accountable and destructible. Tracks guest allocations only; host-side
/// bookkeeping (external copies, reference tables) is not charged here.
pub(crate) struct HeapAccountant {
    ceiling: usize,
    used: AtomicUsize,
}

impl HeapAccountant {
    pub const fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            used: AtomicUsize::new(0),
        }
    }

    pub const fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Reserve `n` bytes against the ceiling. Fails at the allocation that
    /// would cross the ceiling; never lets the total overshoot by more than
    /// the failing allocation's own size.
    #[must_use]
    pub fn reserve(&self, n: usize) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(n).filter(|total| *total <= self.ceiling)
            })
            .is_ok()
    }

    pub fn release(&self, n: usize) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(n))
            });
    }

    /// Drop all accounting. Used on disposal, when the heap is released.
    pub fn reset(&self) {
        self.used.store(0, Ordering::Release);
    }
}
