//! Priority bitmap: which priority levels currently hold runnable LWPs.
//!
//! One bit per priority level; the rescan performed when the cached
//! highest-priority level drains lives here, where it can be tested in
//! isolation.

use fixedbitset::FixedBitSet;

use super::{Pri, PRI_COUNT};

pub struct PriorityBitmap {
    bits: FixedBitSet,
}

impl PriorityBitmap {
    pub fn new() -> Self {
        Self {
            bits: FixedBitSet::with_capacity(PRI_COUNT),
        }
    }

    pub fn set(&mut self, pri: Pri) {
        self.bits.insert(pri as usize);
    }

    pub fn clear(&mut self, pri: Pri) {
        self.bits.set(pri as usize, false);
    }

    pub fn is_set(&self, pri: Pri) -> bool {
        self.bits.contains(pri as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.bits.count_ones(..) == 0
    }

    /// Most important non-empty priority, i.e. the lowest-numbered set bit.
    pub fn highest(&self) -> Option<Pri> {
        self.bits.ones().next().map(|p| p as Pri)
    }

    /// Next set bit strictly below `pri` in importance (numerically above),
    /// used by scans that walk the queue from most to least important.
    pub fn next_below(&self, pri: Pri) -> Option<Pri> {
        ((pri + 1)..PRI_COUNT as Pri).find(|&p| self.is_set(p))
    }
}

impl Default for PriorityBitmap {
    fn default() -> Self {
        Self::new()
    }
}
