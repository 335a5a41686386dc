//! Bounded in-memory trajectory window with quality-weighted eviction.
//!
//! Unlike a pure-recency LRU, eviction removes the entry with the lowest
//! `quality / (age_days + 1)` priority, so a high-quality old trajectory
//! can outlive a mediocre fresh one.

use super::Trajectory;
use rustc_hash::FxHashMap;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Bounded window over the most valuable recent trajectories.
#[derive(Debug)]
pub struct MemoryWindow {
    capacity: usize,
    entries: FxHashMap<u64, Trajectory>,
}

impl MemoryWindow {
    /// Creates a window holding at most `capacity` trajectories.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: FxHashMap::default(),
        }
    }

    /// Current entry count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the window holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Eviction priority of a trajectory at `now`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn priority(trajectory: &Trajectory, now: i64) -> f32 {
        let age_days =
            ((now - trajectory.created_at).max(0) as f64 / SECONDS_PER_DAY) as f32;
        trajectory.quality_score / (age_days + 1.0)
    }

    /// Inserts a trajectory, evicting the minimum-priority entry when the
    /// window is full. Returns the evicted trajectory, if any.
    pub fn insert(&mut self, trajectory: Trajectory, now: i64) -> Option<Trajectory> {
        let id = trajectory.trajectory_id;
        if self.entries.contains_key(&id) {
            self.entries.insert(id, trajectory);
            return None;
        }

        let evicted = if self.entries.len() >= self.capacity {
            let victim = self
                .entries
                .iter()
                .min_by(|(_, a), (_, b)| {
                    Self::priority(a, now).total_cmp(&Self::priority(b, now))
                })
                .map(|(&victim, _)| victim);
            victim.and_then(|victim| self.entries.remove(&victim))
        } else {
            None
        };

        self.entries.insert(id, trajectory);
        evicted
    }

    /// Point lookup.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<&Trajectory> {
        self.entries.get(&id)
    }

    /// Mutable point lookup, for the three mutable metadata fields.
    pub fn get_mut(&mut self, id: u64) -> Option<&mut Trajectory> {
        self.entries.get_mut(&id)
    }
}
