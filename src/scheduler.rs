/*
 * Scheduler - the ready-queue structure.
 *
 * Owns no thread data, only `ThreadId`s paired with their current rank,
 * kept sorted so the best-ranked runnable thread is always at the front.
 * Grounded on `scheduler/scheduler.rs` (a scheduler owning a queue of ids
 * rather than threads themselves) and `scheduler/sched_core.rs`'s
 * per-CPU state array for the partitioned layout.
 *
 * Two distribution modes, selected at build time via `Platform::PARTITIONED`:
 * - partitioned: one ready queue per core, a thread is pinned to the core
 *   it was inserted on for as long as it stays ready.
 * - global: one ready queue shared by every core.
 */

use alloc::vec::Vec;

use crate::criterion::Criterion;
use crate::thread::ThreadId;

/// Upper bound on the number of per-core ready queues a partitioned
/// scheduler maintains.
pub const MAX_QUEUES: usize = 4;

pub struct Scheduler<C: Criterion> {
    partitioned: bool,
    queues: [Vec<(ThreadId, C)>; MAX_QUEUES],
    cores: usize,
}

impl<C: Criterion> Scheduler<C> {
    pub fn new(partitioned: bool, cores: usize) -> Self {
        assert!(cores >= 1 && cores <= MAX_QUEUES, "unsupported core count");
        Scheduler {
            partitioned,
            queues: Default::default(),
            cores,
        }
    }

    fn queue_index(&self, home_cpu: usize) -> usize {
        if self.partitioned { home_cpu } else { 0 }
    }

    /// Insert a thread into the ready queue belonging to `home_cpu`
    /// (ignored in global mode), at the position its rank belongs.
    pub fn insert(&mut self, tid: ThreadId, rank: C, home_cpu: usize) {
        let q = &mut self.queues[self.queue_index(home_cpu)];
        if q.iter().any(|(id, _)| *id == tid) {
            return;
        }
        let pos = q
            .iter()
            .position(|(_, r)| rank.rank(r) == core::cmp::Ordering::Less)
            .unwrap_or(q.len());
        q.insert(pos, (tid, rank));
    }

    /// Remove a thread from whichever queue holds it (it was dispatched,
    /// blocked, or destroyed).
    pub fn remove(&mut self, tid: ThreadId) -> Option<C> {
        for q in &mut self.queues {
            if let Some(pos) = q.iter().position(|(id, _)| *id == tid) {
                return Some(q.remove(pos).1);
            }
        }
        None
    }

    /// Re-rank a thread already present in the ready queue.
    pub fn rerank(&mut self, tid: ThreadId, rank: C, home_cpu: usize) {
        if self.remove(tid).is_some() {
            self.insert(tid, rank, home_cpu);
        }
    }

    /// Best-ranked thread in `cpu`'s queue (partitioned) or in the single
    /// shared queue (global), without removing it.
    pub fn head(&self, cpu: usize) -> Option<ThreadId> {
        self.queues[self.queue_index(cpu)].first().map(|(id, _)| *id)
    }

    /// Best-ranked thread in `cpu`'s queue other than `exclude`, without
    /// removing it. Used by a voluntary yield (EPOS's `choose_another`),
    /// which must hand off to someone else even if the caller happens to
    /// still be present in the queue it is about to leave.
    pub fn head_excluding(&self, cpu: usize, exclude: ThreadId) -> Option<ThreadId> {
        self.queues[self.queue_index(cpu)]
            .iter()
            .find(|(id, _)| *id != exclude)
            .map(|(id, _)| *id)
    }

    /// Is this specific thread the current head of its queue?
    pub fn is_head(&self, tid: ThreadId, cpu: usize) -> bool {
        self.head(cpu) == Some(tid)
    }

    /// Number of runnable threads across every queue.
    pub fn len(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cores(&self) -> usize {
        self.cores
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::policy::Priority;
    use crate::thread::ThreadId;

    #[test]
    fn global_mode_shares_one_queue_across_cores() {
        let mut s: Scheduler<Priority> = Scheduler::new(false, 2);
        s.insert(ThreadId(1), Priority::NORMAL, 0);
        s.insert(ThreadId(2), Priority::HIGH, 1);
        assert_eq!(s.head(0), Some(ThreadId(2)));
        assert_eq!(s.head(1), Some(ThreadId(2)));
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn partitioned_mode_keeps_queues_independent() {
        let mut s: Scheduler<Priority> = Scheduler::new(true, 2);
        s.insert(ThreadId(1), Priority::NORMAL, 0);
        s.insert(ThreadId(2), Priority::HIGH, 1);
        assert_eq!(s.head(0), Some(ThreadId(1)));
        assert_eq!(s.head(1), Some(ThreadId(2)));
    }

    #[test]
    fn remove_takes_a_thread_off_whichever_queue_holds_it() {
        let mut s: Scheduler<Priority> = Scheduler::new(true, 2);
        s.insert(ThreadId(1), Priority::NORMAL, 1);
        assert_eq!(s.remove(ThreadId(1)), Some(Priority::NORMAL));
        assert_eq!(s.head(1), None);
    }
}
