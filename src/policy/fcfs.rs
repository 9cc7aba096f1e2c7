/*
 * First-Come-First-Served criterion.
 *
 * The rank is the order of arrival: a monotonically increasing ticket
 * assigned at construction. The ready queue is effectively a FIFO. Unlike
 * a round-robin policy, once placed a thread's rank never changes, so a
 * running thread always stays ahead of everything created after it until
 * it blocks or exits.
 */

use crate::criterion::{Criterion, CriterionEvent};
use core::sync::atomic::{AtomicU64, Ordering};

// Ticket 0 is reserved for `CEILING` and never handed out to a real thread.
static NEXT_TICKET: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Fcfs(u64);

impl Fcfs {
    /// Issue the next ticket in arrival order.
    pub fn next() -> Self {
        Fcfs(NEXT_TICKET.fetch_add(1, Ordering::Relaxed))
    }
}

impl Criterion for Fcfs {
    const IDLE: Self = Fcfs(u64::MAX);
    const CEILING: Self = Fcfs(0);

    fn on_event(&mut self, _event: CriterionEvent) {}
}
