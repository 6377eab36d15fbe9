use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        RwLock,
    },
    time::{Duration, Instant},
};

/// An ordered set of one-shot timers.
///
/// Entries are keyed by (deadline, id) so `poll` drains everything due with
/// a single range scan; the id map makes `cancel` O(log n) and idempotent.
/// The endpoint event loop calls `poll` on a short interval, which is all
/// the resolution the RFC 3261 timers need.
pub struct Timer<T> {
    entries: RwLock<BTreeMap<(Instant, u64), T>>,
    deadlines: RwLock<HashMap<u64, Instant>>,
    next_id: AtomicU64,
}

impl<T> Timer<T> {
    pub fn new() -> Self {
        Timer {
            entries: RwLock::new(BTreeMap::new()),
            deadlines: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Schedule `value` to fire after `duration`. Returns the id used to
    /// cancel it.
    pub fn timeout(&self, duration: Duration, value: T) -> u64 {
        self.timeout_at(Instant::now() + duration, value)
    }

    pub fn timeout_at(&self, deadline: Instant, value: T) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.write().unwrap().insert((deadline, id), value);
        self.deadlines.write().unwrap().insert(id, deadline);
        id
    }

    /// Cancel a scheduled timer. Returns the value when it had not fired
    /// yet; cancelling twice (or after firing) is a no-op.
    pub fn cancel(&self, id: u64) -> Option<T> {
        let deadline = self.deadlines.write().unwrap().remove(&id)?;
        self.entries.write().unwrap().remove(&(deadline, id))
    }

    /// Remove and return every timer due at `now`, in deadline order.
    pub fn poll(&self, now: Instant) -> Vec<T> {
        let due: Vec<(Instant, u64)> = {
            let entries = self.entries.read().unwrap();
            entries
                .range(..=(now, u64::MAX))
                .map(|(key, _)| *key)
                .collect()
        };
        if due.is_empty() {
            return Vec::new();
        }

        let mut fired = Vec::with_capacity(due.len());
        {
            let mut entries = self.entries.write().unwrap();
            let mut deadlines = self.deadlines.write().unwrap();
            for key in due {
                if let Some(value) = entries.remove(&key) {
                    deadlines.remove(&key.1);
                    fired.push(value);
                }
            }
        }
        fired
    }
}

impl<T> Default for Timer<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_cancel_is_idempotent() {
        let timer = Timer::new();
        let id = timer.timeout(Duration::from_secs(60), "a");
        assert_eq!(timer.cancel(id), Some("a"));
        assert_eq!(timer.cancel(id), None);
        assert!(timer.is_empty());
    }

    #[test]
    fn test_timer_poll_drains_due_entries_in_order() {
        let timer = Timer::new();
        let now = Instant::now();
        timer.timeout_at(now + Duration::from_millis(20), "late");
        timer.timeout_at(now, "early");
        timer.timeout_at(now + Duration::from_secs(60), "future");

        let fired = timer.poll(now + Duration::from_millis(30));
        assert_eq!(fired, vec!["early", "late"]);
        assert_eq!(timer.len(), 1);

        // Nothing else is due yet.
        assert!(timer.poll(now + Duration::from_millis(30)).is_empty());
    }
}
