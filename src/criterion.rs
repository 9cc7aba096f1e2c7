/*
 * Criterion - Pluggable Scheduling Policy
 *
 * A `Criterion` is a per-thread rank: the ready-queue structure keeps
 * threads ordered by it, `choose()` picks the lowest-ranked runnable
 * thread, and the kernel core notifies the criterion of lifecycle events
 * (creation, entering/leaving the ready queue, quantum charges, wakeups,
 * termination) so that a dynamic policy can re-rank threads in response.
 *
 * This generalizes "policy acts on kernel state through a context object"
 * to "rank is itself the comparable value the generic ready-queue
 * structure sorts on", since here the policy is chosen at build time (a
 * type parameter) rather than boxed at runtime.
 */

use core::cmp::Ordering;

/// Events the kernel core reports to a `Criterion` so that dynamic
/// policies can adjust ranks over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriterionEvent {
    /// A new thread was constructed with this criterion as its initial rank.
    Create,
    /// The thread entered a ready queue.
    Enter,
    /// The thread left a ready queue (dispatched, blocked, or destroyed).
    Leave,
    /// The thread was charged one tick of CPU time while running.
    Charge,
    /// The thread was handed extra rank (e.g. by `wakeup`).
    Award,
    /// The thread terminated.
    Finish,
}

/// A per-thread scheduling rank.
///
/// Lower ranks run first (`Ordering::Less` means "more eligible"), matching
/// EPOS's convention that priority values are queue positions, not
/// priority levels in the colloquial sense: `IDLE` is numerically largest
/// so the idle thread is always the order of last resort.
pub trait Criterion: 'static + Copy + Clone + Send + Ord {
    /// Rank reserved for the per-core idle thread: always the least eligible.
    const IDLE: Self;

    /// Rank a priority-ceiling protocol boosts an owner to: always at
    /// least as eligible as any rank a real thread can hold, so a thread
    /// holding a ceiling-protected resource runs at the ceiling of every
    /// resource any thread in the system can contend for.
    const CEILING: Self;

    /// Whether this criterion value represents a real-time / timed rank
    /// whose `TimerHandle` must be restarted differently on dispatch.
    fn is_timed(&self) -> bool {
        false
    }

    /// Whether this criterion recomputes ranks in response to scheduling
    /// events. Static policies (FCFS, fixed priority) leave this `false`
    /// and `on_event` is never consulted by `dispatch`; a dynamic policy
    /// (decay usage, EDF-style deadlines) returns `true` so `dispatch`
    /// charges/retires the outgoing thread, re-sorts every ready thread
    /// by its current rank, and awards the incoming thread before it runs.
    fn is_dynamic(&self) -> bool {
        false
    }

    /// Update this rank in response to a lifecycle event. The default
    /// implementation is a static policy: ranks never change on their own.
    fn on_event(&mut self, _event: CriterionEvent) {}

    /// Compare two ranks for ready-queue ordering. Defaults to `Ord::cmp`;
    /// overridable so a dynamic policy can fold in external state (e.g. a
    /// global clock) without that state living on every `Thread`.
    fn rank(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }
}
