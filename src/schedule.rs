//! Deadline-ordered timer queue.
//!
//! The design doc calls for O(log n) insert, remove, and reschedule of an
//! arbitrary entry — something a plain sorted `Vec` (the shape used by the
//! teacher's `rust/relay/src/time_events.rs`) can't give without an O(n)
//! shift. Instead of an intrusive pairing heap this uses a `BinaryHeap` of
//! `(deadline, id)` pairs plus a side table of the current deadline per
//! `ScheduleId`: removing or rescheduling an entry just bumps its
//! generation in the side table and lets the stale heap entry get
//! skipped over (lazily) the next time it would otherwise fire.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScheduleId(u64);

struct Entry {
    deadline: Instant,
    /// Bumped on every reschedule of this id; a heap entry is stale once
    /// its recorded generation no longer matches the side table's.
    generation: u64,
}

pub struct Schedule {
    heap: BinaryHeap<Reverse<(Instant, u64, ScheduleId)>>,
    live: HashMap<ScheduleId, Entry>,
    next_id: u64,
}

impl Default for Schedule {
    fn default() -> Self {
        Self::new()
    }
}

impl Schedule {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Insert a new deadline and return the id to reschedule/remove it by.
    pub fn insert(&mut self, deadline: Instant) -> ScheduleId {
        let id = ScheduleId(self.next_id);
        self.next_id += 1;
        self.live.insert(id, Entry { deadline, generation: 0 });
        self.heap.push(Reverse((deadline, 0, id)));
        id
    }

    /// Move an existing entry's deadline. A no-op (returns `false`) if
    /// `id` was already removed or never existed.
    pub fn reschedule(&mut self, id: ScheduleId, new_deadline: Instant) -> bool {
        let Some(entry) = self.live.get_mut(&id) else {
            return false;
        };
        entry.deadline = new_deadline;
        entry.generation += 1;
        self.heap.push(Reverse((new_deadline, entry.generation, id)));
        true
    }

    /// Remove an entry outright. Returns `false` if it was already gone.
    pub fn remove(&mut self, id: ScheduleId) -> bool {
        self.live.remove(&id).is_some()
    }

    pub fn deadline_of(&self, id: ScheduleId) -> Option<Instant> {
        self.live.get(&id).map(|e| e.deadline)
    }

    /// The earliest still-live deadline, used to size the event loop's
    /// readiness wait.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.drop_stale();
        self.heap.peek().map(|Reverse((deadline, _, _))| *deadline)
    }

    /// Pop every entry whose deadline is `<= now`, in deadline order.
    pub fn drain_due(&mut self, now: Instant) -> Vec<ScheduleId> {
        let mut due = Vec::new();
        loop {
            self.drop_stale();
            match self.heap.peek() {
                Some(Reverse((deadline, _, _))) if *deadline <= now => {
                    let Reverse((_, _, id)) = self.heap.pop().unwrap();
                    self.live.remove(&id);
                    due.push(id);
                }
                _ => break,
            }
        }
        due
    }

    /// Drop heap entries at the top that no longer match their side-table
    /// generation (stale: superseded by a later `reschedule`) or whose id
    /// was removed entirely.
    fn drop_stale(&mut self) {
        while let Some(Reverse((_, generation, id))) = self.heap.peek().copied() {
            match self.live.get(&id) {
                Some(entry) if entry.generation == generation => break,
                _ => {
                    self.heap.pop();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn at(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[test]
    fn next_deadline_is_the_earliest() {
        let mut s = Schedule::new();
        s.insert(at(10));
        let earliest = s.insert(at(1));
        s.insert(at(5));

        assert_eq!(s.next_deadline(), Some(s.deadline_of(earliest).unwrap()));
    }

    #[test]
    fn reschedule_changes_fire_order() {
        let mut s = Schedule::new();
        let a = s.insert(at(1));
        let b = s.insert(at(10));

        s.reschedule(a, at(20));
        s.reschedule(b, at(2));

        let due = s.drain_due(at(30));
        assert_eq!(due, vec![b, a]);
    }

    #[test]
    fn remove_prevents_firing() {
        let mut s = Schedule::new();
        let a = s.insert(at(1));
        let b = s.insert(at(2));
        s.remove(a);

        let due = s.drain_due(at(30));
        assert_eq!(due, vec![b]);
    }

    #[test]
    fn drain_due_only_returns_entries_at_or_before_now() {
        let mut s = Schedule::new();
        let soon = s.insert(at(0));
        s.insert(at(100));

        let due = s.drain_due(at(1));
        assert_eq!(due, vec![soon]);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn stale_heap_entries_do_not_resurrect_after_reschedule() {
        let mut s = Schedule::new();
        let a = s.insert(at(1));
        for i in 0..5 {
            s.reschedule(a, at(1 + i));
        }
        assert_eq!(s.drain_due(at(1000)), vec![a]);
        assert!(s.is_empty());
    }
}
