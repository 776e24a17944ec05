// SPDX-License-Identifier: GPL-2.0
//
// ATQ: a bounded task queue keyed by pid and ordered by vtime (or insertion
// order in FIFO mode). A cheaper alternative to a migration DSQ: peek and
// pop are separate operations, so a dispatcher can compare heads across
// queues and detect when a racing CPU won the pop.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use sorted_vec::SortedVec;

use crate::lock::SpinLock;
use crate::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AtqEntry {
    pub pid: i32,
    pub vtime: u64,
    pub slice_ns: u64,
    pub enq_flags: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Keyed {
    key: u64,
    entry: AtqEntry,
}

impl PartialOrd for Keyed {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Keyed {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.key, self.entry.pid).cmp(&(other.key, other.entry.pid))
    }
}

pub struct Atq {
    fifo: bool,
    capacity: usize,
    seq: AtomicU64,
    queue: SpinLock<SortedVec<Keyed>>,
}

impl Atq {
    pub fn new(fifo: bool, capacity: usize) -> Self {
        Self {
            fifo,
            capacity,
            seq: AtomicU64::new(0),
            queue: SpinLock::new(SortedVec::new()),
        }
    }

    pub fn is_fifo(&self) -> bool {
        self.fifo
    }

    fn insert(&self, key: u64, entry: AtqEntry) -> Result<(), Error> {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            return Err(Error::OutOfMemory);
        }
        queue.insert(Keyed { key, entry });
        Ok(())
    }

    pub fn insert_vtime(&self, entry: AtqEntry) -> Result<(), Error> {
        if self.fifo {
            return Err(Error::InvalidArg);
        }
        self.insert(entry.vtime, entry)
    }

    pub fn insert_fifo(&self, entry: AtqEntry) -> Result<(), Error> {
        if !self.fifo {
            return Err(Error::InvalidArg);
        }
        self.insert(self.seq.fetch_add(1, Ordering::Relaxed), entry)
    }

    pub fn peek(&self) -> Option<AtqEntry> {
        self.queue.lock().first().map(|k| k.entry)
    }

    pub fn pop(&self) -> Option<AtqEntry> {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove_index(0).entry)
        }
    }

    pub fn nr_queued(&self) -> usize {
        self.queue.lock().len()
    }
}

impl std::fmt::Debug for Atq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Atq")
            .field("fifo", &self.fifo)
            .field("capacity", &self.capacity)
            .field("nr_queued", &self.nr_queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pid: i32, vtime: u64) -> AtqEntry {
        AtqEntry {
            pid,
            vtime,
            slice_ns: 100_000,
            enq_flags: 0,
        }
    }

    #[test]
    fn test_vtime_order() {
        let atq = Atq::new(false, 8);
        atq.insert_vtime(entry(1, 300)).unwrap();
        atq.insert_vtime(entry(2, 100)).unwrap();
        atq.insert_vtime(entry(3, 200)).unwrap();
        assert_eq!(atq.peek().unwrap().pid, 2);
        assert_eq!(atq.pop().unwrap().pid, 2);
        assert_eq!(atq.pop().unwrap().pid, 3);
        assert_eq!(atq.pop().unwrap().pid, 1);
        assert_eq!(atq.pop(), None);
    }

    #[test]
    fn test_fifo_order() {
        let atq = Atq::new(true, 8);
        atq.insert_fifo(entry(9, 500)).unwrap();
        atq.insert_fifo(entry(4, 100)).unwrap();
        assert_eq!(atq.pop().unwrap().pid, 9);
        assert_eq!(atq.pop().unwrap().pid, 4);
    }

    #[test]
    fn test_bounded() {
        let atq = Atq::new(false, 2);
        atq.insert_vtime(entry(1, 1)).unwrap();
        atq.insert_vtime(entry(2, 2)).unwrap();
        assert_eq!(atq.insert_vtime(entry(3, 3)), Err(Error::OutOfMemory));
        assert_eq!(atq.nr_queued(), 2);
    }

    #[test]
    fn test_mode_mismatch() {
        let atq = Atq::new(false, 2);
        assert_eq!(atq.insert_fifo(entry(1, 1)), Err(Error::InvalidArg));
    }
}
