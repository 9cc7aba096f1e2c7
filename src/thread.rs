/*
 * Thread - per-thread kernel state.
 *
 * A `ThreadId` newtype, a `ThreadState` enum, and a struct bundling
 * identity, state, and context, following EPOS's `Thread` closely: in
 * particular the `natural_priority` save stack used by priority
 * inheritance/ceiling, the `joining` single-waiter slot, and the
 * first-stack-word exit status all mirror EPOS's own choices.
 */

use alloc::boxed::Box;
use core::fmt;

use crate::platform::{Cpu, Platform};

/// Maximum nesting depth of saved "natural" priorities a single thread can
/// carry at once (one push per nested critical section it holds while its
/// rank is boosted by inheritance or ceiling).
pub const MAX_PRIORITY_NEST: usize = 8;

/// Identifies a thread for the lifetime of the kernel process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub usize);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

/// Opaque token identifying whatever synchronization-queue a thread is
/// blocked on. The kernel core never inspects the queue itself — wait
/// queues are owned and allocated by the synchronization primitives built
/// on top of this core (mutexes, semaphores) — it only needs to know
/// *that* a thread is waiting on one, for `prioritize`/`deprioritize` to
/// re-rank the right structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitToken(pub usize);

/// Lifecycle state of a thread, matching EPOS's `Thread::State` enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Constructed but not yet handed to the scheduler (between prologue
    /// and epilogue).
    Beginning,
    /// Runnable, waiting in a ready queue.
    Ready,
    /// Currently executing on some core.
    Running,
    /// Blocked by an explicit `suspend()` call.
    Suspended,
    /// Blocked on a synchronization-queue wait (`sleep`).
    Waiting,
    /// Has called `exit()` (or fallen off dispatch while `RUNNING`'s
    /// successor never ran) and is pending destruction.
    Finishing,
}

/// A single kernel thread.
pub struct Thread<P: Platform> {
    pub id: ThreadId,
    /// Diagnostic name; never consulted by scheduling logic.
    pub name: Option<&'static str>,
    pub state: ThreadState,
    pub context: <P::Cpu as Cpu>::Context,
    pub stack: Box<[u8]>,
    /// Current scheduling rank. Doubles as the `link` the ready-queue
    /// structure orders threads by.
    pub criterion: P::Criterion,
    /// Stack of ranks saved across `prioritize` boosts; `pop` on the
    /// matching `deprioritize` restores the previous rank. `None` marks
    /// "no boost active at this nesting level" rather than an in-band
    /// sentinel rank.
    pub natural_priority: heapless::Vec<Option<P::Criterion>, MAX_PRIORITY_NEST>,
    /// Which wait queue this thread is blocked on, if any.
    pub waiting: Option<WaitToken>,
    /// The thread (if any) blocked in `join()` waiting for this one to finish.
    pub joining: Option<ThreadId>,
    /// Fixed home core under partitioned distribution, assigned once at
    /// creation and never moved. Ignored under global distribution.
    /// Tracked explicitly rather than inferred from ready-queue position,
    /// since a thread need not be at the head of its queue to belong to it.
    pub home_cpu: usize,
}

impl<P: Platform> Thread<P> {
    /// Phase one of construction: allocate the stack and context, leave the
    /// thread in `Beginning` state. The kernel core runs phase two
    /// (`epilogue`, in `kernel.rs`) once the thread has been assigned an id
    /// and inserted into the global thread table, matching EPOS's
    /// `constructor_prologue`/`constructor_epilogue` split (a thread must be
    /// fully addressable by id before it can be made visible to the
    /// scheduler or to `join()` callers).
    pub fn prologue(
        id: ThreadId,
        name: Option<&'static str>,
        entry: extern "C" fn() -> !,
        stack_size: usize,
        criterion: P::Criterion,
        home_cpu: usize,
    ) -> Self {
        let mut stack = alloc::vec![0u8; stack_size].into_boxed_slice();
        let context = <P::Cpu as Cpu>::new_context(entry, &mut stack);
        Thread {
            id,
            name,
            state: ThreadState::Beginning,
            context,
            stack,
            criterion,
            natural_priority: heapless::Vec::new(),
            waiting: None,
            joining: None,
            home_cpu,
        }
    }

    /// Exit status slot: the first machine word of the stack, written by
    /// `exit()` and read by a joiner. Matches EPOS's trick of repurposing
    /// unused stack memory rather than allocating a dedicated field for a
    /// value that is only ever live after the thread stops using its stack.
    pub fn write_exit_status(&mut self, status: i32) {
        self.stack[0..4].copy_from_slice(&status.to_ne_bytes());
    }

    pub fn read_exit_status(&self) -> i32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.stack[0..4]);
        i32::from_ne_bytes(bytes)
    }

    /// Push the current rank onto the priority-save stack and install
    /// `boosted` as the active rank. Used by `prioritize()`.
    pub fn push_priority(&mut self, boosted: P::Criterion) {
        let previous = self.criterion;
        let _ = self.natural_priority.push(Some(previous));
        self.criterion = boosted;
    }

    /// Pop the most recently saved rank and restore it as the active rank,
    /// if any boost is outstanding. Used by `deprioritize()`. Returns
    /// whether a rank was actually restored, so the caller knows whether
    /// this thread's position in a queue needs to change.
    pub fn pop_priority(&mut self) -> bool {
        if let Some(Some(restored)) = self.natural_priority.pop() {
            self.criterion = restored;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::policy::Priority;
    use crate::test_support::TestPlatform;

    extern "C" fn stub_entry() -> ! {
        loop {}
    }

    #[test]
    fn prologue_starts_beginning_with_requested_stack_size() {
        let t = Thread::<TestPlatform<()>>::prologue(
            ThreadId(1),
            Some("t1"),
            stub_entry,
            4096,
            Priority::NORMAL,
            0,
        );
        assert_eq!(t.state, ThreadState::Beginning);
        assert_eq!(t.stack.len(), 4096);
        assert!(t.natural_priority.is_empty());
        assert!(t.joining.is_none());
    }

    #[test]
    fn exit_status_round_trips_through_stack_word() {
        let mut t = Thread::<TestPlatform<()>>::prologue(
            ThreadId(2),
            None,
            stub_entry,
            4096,
            Priority::NORMAL,
            0,
        );
        t.write_exit_status(-7);
        assert_eq!(t.read_exit_status(), -7);
    }

    #[test]
    fn push_and_pop_priority_restores_original_rank() {
        let mut t = Thread::<TestPlatform<()>>::prologue(
            ThreadId(3),
            None,
            stub_entry,
            4096,
            Priority::LOW,
            0,
        );
        t.push_priority(Priority::HIGH);
        assert_eq!(t.criterion, Priority::HIGH);
        t.push_priority(Priority::MAIN);
        assert_eq!(t.criterion, Priority::MAIN);
        t.pop_priority();
        assert_eq!(t.criterion, Priority::HIGH);
        t.pop_priority();
        assert_eq!(t.criterion, Priority::LOW);
    }
}
