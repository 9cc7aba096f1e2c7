/*
 * WaitQueue - rank-ordered queue a thread can sleep on.
 *
 * Backed by a plain `Vec<(ThreadId, C)>` rather than an intrusive linked
 * list, since safe Rust makes the latter awkward; kept sorted by rank so
 * that `Kernel::prioritize`/`deprioritize` (src/kernel.rs) can re-rank a
 * sleeping thread in place — a capability a pure FIFO waiter list does
 * not offer.
 *
 * Synchronization primitives (mutexes, semaphores) built on top of this
 * core own their `WaitQueue` instances; the kernel core only knows how to
 * insert into, remove from, iterate, and drain one.
 */

use alloc::vec::Vec;

use crate::criterion::Criterion;
use crate::thread::ThreadId;

/// A queue of threads blocked waiting for some condition external to the
/// scheduler (a mutex release, a semaphore post, an I/O completion).
pub struct WaitQueue<C: Criterion> {
    waiters: Vec<(ThreadId, C)>,
}

impl<C: Criterion> WaitQueue<C> {
    pub const fn new() -> Self {
        WaitQueue {
            waiters: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Insert a waiter at the position its rank belongs in. Idempotent: a
    /// thread already queued is not inserted twice.
    pub fn insert(&mut self, tid: ThreadId, rank: C) {
        if self.waiters.iter().any(|(id, _)| *id == tid) {
            return;
        }
        let pos = self
            .waiters
            .iter()
            .position(|(_, r)| rank.rank(r) == core::cmp::Ordering::Less)
            .unwrap_or(self.waiters.len());
        self.waiters.insert(pos, (tid, rank));
    }

    /// Remove a specific waiter (used when its rank changes and it must be
    /// reinserted, or when it is woken individually).
    pub fn remove(&mut self, tid: ThreadId) -> Option<C> {
        if let Some(pos) = self.waiters.iter().position(|(id, _)| *id == tid) {
            Some(self.waiters.remove(pos).1)
        } else {
            None
        }
    }

    /// Re-rank a waiter already in the queue, preserving sorted order.
    /// Used by `prioritize`/`deprioritize` on a thread that is currently
    /// asleep rather than ready.
    pub fn rerank(&mut self, tid: ThreadId, rank: C) {
        if self.remove(tid).is_some() {
            self.insert(tid, rank);
        }
    }

    /// The single best-ranked waiter, without removing it. Used by the
    /// priority ceiling/inheritance protocol to find who the owner should
    /// inherit from.
    pub fn head(&self) -> Option<ThreadId> {
        self.waiters.first().map(|(id, _)| *id)
    }

    /// Current rank of a specific waiter, if it is in the queue.
    pub fn rank_of(&self, tid: ThreadId) -> Option<C> {
        self.waiters.iter().find(|(id, _)| *id == tid).map(|(_, r)| *r)
    }

    /// Every thread currently queued, in no particular order. Used by
    /// `prioritize`/`deprioritize` to visit each waiter in the queue a
    /// thread is blocking on.
    pub fn ids(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.waiters.iter().map(|(id, _)| *id)
    }

    /// Wake and remove the best-ranked waiter.
    pub fn wake_one(&mut self) -> Option<ThreadId> {
        if self.waiters.is_empty() {
            None
        } else {
            Some(self.waiters.remove(0).0)
        }
    }

    /// Wake and remove every waiter, best-ranked first.
    pub fn wake_all(&mut self) -> Vec<ThreadId> {
        self.waiters.drain(..).map(|(id, _)| id).collect()
    }
}

impl<C: Criterion> Default for WaitQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::policy::Priority;

    #[test]
    fn insert_keeps_waiters_ranked_best_first() {
        let mut q: WaitQueue<Priority> = WaitQueue::new();
        q.insert(ThreadId(1), Priority::LOW);
        q.insert(ThreadId(2), Priority::HIGH);
        q.insert(ThreadId(3), Priority::NORMAL);
        assert_eq!(q.head(), Some(ThreadId(2)));
        assert_eq!(q.wake_all(), alloc::vec![ThreadId(2), ThreadId(3), ThreadId(1)]);
    }

    #[test]
    fn rerank_moves_waiter_to_new_position() {
        let mut q: WaitQueue<Priority> = WaitQueue::new();
        q.insert(ThreadId(1), Priority::NORMAL);
        q.insert(ThreadId(2), Priority::LOW);
        assert_eq!(q.head(), Some(ThreadId(1)));
        q.rerank(ThreadId(2), Priority::MAIN);
        assert_eq!(q.head(), Some(ThreadId(2)));
    }

    #[test]
    fn insert_is_idempotent_for_an_already_queued_thread() {
        let mut q: WaitQueue<Priority> = WaitQueue::new();
        q.insert(ThreadId(1), Priority::NORMAL);
        q.insert(ThreadId(1), Priority::HIGH);
        assert_eq!(q.len(), 1);
    }
}
