//! Invite-expiry timers.
//!
//! A deadline-ordered table keyed by [`TimerId`]. The table never sleeps: the
//! runtime delivers periodic ticks and the driver pops whatever has expired.
//! Each entry carries the name of the user whose invitation it guards.

use std::collections::{BTreeMap, HashMap};

/// Handle for an armed timer.
pub type TimerId = u64;

/// Pending timers ordered by deadline.
///
/// # Invariants
///
/// - Every id in `deadlines` has exactly one entry in `by_deadline`
/// - Ids are never reused
#[derive(Debug)]
pub struct TimerTable<I> {
    next_id: TimerId,
    by_deadline: BTreeMap<(I, TimerId), String>,
    deadlines: HashMap<TimerId, I>,
}

impl<I: Copy + Ord> Default for TimerTable<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Copy + Ord> TimerTable<I> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self { next_id: 1, by_deadline: BTreeMap::new(), deadlines: HashMap::new() }
    }

    /// Arm a timer for `owner` firing at `deadline`.
    pub fn arm(&mut self, owner: impl Into<String>, deadline: I) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.by_deadline.insert((deadline, id), owner.into());
        self.deadlines.insert(id, deadline);
        id
    }

    /// Disarm a timer. Returns `false` if it already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let Some(deadline) = self.deadlines.remove(&id) else {
            return false;
        };
        self.by_deadline.remove(&(deadline, id));
        true
    }

    /// Remove and return every timer with `deadline <= now`, earliest first.
    pub fn pop_expired(&mut self, now: I) -> Vec<(TimerId, String)> {
        let mut expired = Vec::new();
        while let Some(entry) = self.by_deadline.first_entry() {
            let (deadline, id) = *entry.key();
            if deadline > now {
                break;
            }
            let owner = entry.remove();
            self.deadlines.remove(&id);
            expired.push((id, owner));
        }
        expired
    }

    /// Number of armed timers.
    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    /// True if no timer is armed.
    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}
