//! Ordered float wrapper for use in `BinaryHeap`.
//!
//! Uses `f32::total_cmp` for IEEE 754 total ordering so Ord/Eq stay
//! consistent even if a NaN slips into a distance, preventing heap
//! corruption during search.

use std::cmp::Ordering;

/// Wrapper for f32 implementing `Ord` for `BinaryHeap`.
#[derive(Debug, Clone, Copy)]
pub(super) struct OrderedFloat(pub f32);

impl PartialEq for OrderedFloat {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for OrderedFloat {}

impl PartialOrd for OrderedFloat {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedFloat {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}
