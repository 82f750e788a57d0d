//! Bounded inspect → fail → redo cycles.

/// Pure counter check consulted before granting another rework cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReworkCycleGuard {
    bound: u32,
}

impl ReworkCycleGuard {
    pub fn new(bound: u32) -> Self {
        Self { bound }
    }

    pub fn bound(&self) -> u32 {
        self.bound
    }

    /// True once `count` cycles have used up the allowance.
    pub fn is_exceeded(&self, count: u32) -> bool {
        count >= self.bound
    }

    /// The count after a supervisor override. Always zero.
    pub fn reset(&self, _count: u32) -> u32 {
        0
    }
}

impl Default for ReworkCycleGuard {
    fn default() -> Self {
        Self::new(3)
    }
}
