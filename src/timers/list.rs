//! Per-duration timer lists and their expiry index.
//!
//! Timers that share a duration share a FIFO list. Every timer in a list was
//! queued at `now + ms` with a non-decreasing `now`, so the head always holds
//! the list's earliest expiry. Non-empty lists are indexed by
//! `(head expiry, duration)`; the first index entry is the next list to fire.

use crate::types::{Time, TimerId};
use std::collections::{BTreeSet, HashMap, VecDeque};

#[derive(Debug)]
struct TimerList {
    queue: VecDeque<(TimerId, Time)>,
}

impl TimerList {
    fn expiry(&self) -> Option<Time> {
        self.queue.front().map(|&(_, expiry)| expiry)
    }
}

#[derive(Debug, Default)]
pub(crate) struct ListQueue {
    lists: HashMap<u64, TimerList>,
    order: BTreeSet<(Time, u64)>,
    len: usize,
}

impl ListQueue {
    /// Number of queued timers across all lists.
    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Earliest `(expiry, duration)` across all lists.
    pub(crate) fn peek(&self) -> Option<(Time, u64)> {
        self.order.first().copied()
    }

    /// Appends a timer to the list for `ms`, creating the list if needed.
    pub(crate) fn push(&mut self, ms: u64, id: TimerId, expiry: Time) {
        let list = self.lists.entry(ms).or_insert_with(|| TimerList {
            queue: VecDeque::new(),
        });
        let before = list.expiry();
        list.queue.push_back((id, expiry));
        let after = list.expiry();
        self.len += 1;
        self.reindex(ms, before, after);
    }

    /// Removes a timer from the list for `ms`. Returns false if it was not
    /// queued there.
    pub(crate) fn remove(&mut self, ms: u64, id: TimerId) -> bool {
        let Some(list) = self.lists.get_mut(&ms) else {
            return false;
        };
        let Some(pos) = list.queue.iter().position(|&(queued, _)| queued == id) else {
            return false;
        };
        let before = list.expiry();
        list.queue.remove(pos);
        let after = list.expiry();
        self.len -= 1;
        self.reindex(ms, before, after);
        true
    }

    /// Duration of the earliest list if its head is due at `now`.
    pub(crate) fn first_due(&self, now: Time) -> Option<u64> {
        self.order
            .first()
            .filter(|&&(expiry, _)| expiry <= now)
            .map(|&(_, ms)| ms)
    }

    /// Pops the head of the list for `ms` if it is due at `now`.
    pub(crate) fn pop_due(&mut self, ms: u64, now: Time) -> Option<TimerId> {
        let list = self.lists.get_mut(&ms)?;
        let before = list.expiry();
        if before? > now {
            return None;
        }
        let (id, _) = list.queue.pop_front()?;
        let after = list.expiry();
        self.len -= 1;
        self.reindex(ms, before, after);
        Some(id)
    }

    /// Drops every list.
    pub(crate) fn clear(&mut self) {
        self.lists.clear();
        self.order.clear();
        self.len = 0;
    }

    fn reindex(&mut self, ms: u64, before: Option<Time>, after: Option<Time>) {
        if before == after {
            return;
        }
        if let Some(expiry) = before {
            self.order.remove(&(expiry, ms));
        }
        match after {
            Some(expiry) => {
                self.order.insert((expiry, ms));
            }
            None => {
                self.lists.remove(&ms);
            }
        }
    }
}
