/*
 * Kernel - the thread kernel core.
 *
 * `Kernel<P>` is a zero-sized manager type whose associated functions
 * operate on one global, lazily-initialized `KernelState<P>` instance per
 * concrete `Platform` — a ZST namespacing a global static, generalized
 * from a single fixed platform to one instance per monomorphization.
 *
 * Every operation's semantics (construction prologue/epilogue, the
 * destructor's state-action table, the dispatch lock-release-before-switch
 * protocol, `idle`'s shutdown condition, `self()`'s pre-boot identity) is
 * grounded closely on EPOS's Thread implementation.
 */

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::marker::PhantomData;

use crate::criterion::{Criterion, CriterionEvent};
use crate::lock::KernelLock;
use crate::platform::{Cpu, InterruptController, Platform, Protocol, TimerHandle};
use crate::queue::WaitQueue;
use crate::scheduler::{Scheduler, MAX_QUEUES};
use crate::thread::{Thread, ThreadId, ThreadState, WaitToken};

/// Outcome of a non-fatal misuse, logged rather than propagated, per the
/// crate's no-`Result` error-handling convention (there is nothing a caller
/// could usefully do with the error besides what the log already records).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    UnknownThread,
    WrongState,
    SelfJoin,
    AlreadyJoining,
}

struct KernelState<P: Platform> {
    threads: Vec<Option<Box<Thread<P>>>>,
    next_id: usize,
    scheduler: Scheduler<P::Criterion>,
    /// Thread currently running on each core.
    current: [Option<ThreadId>; MAX_QUEUES],
    /// Idle thread belonging to each core.
    idle: [Option<ThreadId>; MAX_QUEUES],
    thread_count: usize,
    not_booting: bool,
    next_cpu: usize,
}

impl<P: Platform> KernelState<P> {
    fn new() -> Self {
        KernelState {
            threads: Vec::new(),
            next_id: 0,
            scheduler: Scheduler::new(P::PARTITIONED, P::Cpu::cores()),
            current: [None; MAX_QUEUES],
            idle: [None; MAX_QUEUES],
            thread_count: 0,
            not_booting: false,
            next_cpu: 0,
        }
    }

    fn get(&self, id: ThreadId) -> Option<&Thread<P>> {
        self.threads.get(id.0).and_then(|slot| slot.as_deref())
    }

    fn get_mut(&mut self, id: ThreadId) -> Option<&mut Thread<P>> {
        self.threads.get_mut(id.0).and_then(|slot| slot.as_deref_mut())
    }

    /// Disjoint mutable access to two distinct threads, needed by
    /// `dispatch` to reach both `prev` and `next` at once.
    fn get_pair_mut(&mut self, a: ThreadId, b: ThreadId) -> (&mut Thread<P>, &mut Thread<P>) {
        assert!(a != b, "dispatch requires two distinct threads");
        let (lo, hi) = if a.0 < b.0 { (a.0, b.0) } else { (b.0, a.0) };
        let (left, right) = self.threads.split_at_mut(hi);
        let lo_thread = left[lo].as_deref_mut().expect("unknown thread id");
        let hi_thread = right[0].as_deref_mut().expect("unknown thread id");
        if a.0 < b.0 {
            (lo_thread, hi_thread)
        } else {
            (hi_thread, lo_thread)
        }
    }

    fn home_cpu_of(&self, id: ThreadId) -> usize {
        self.get(id).map(|t| t.home_cpu).unwrap_or(0)
    }
}

struct Globals<P: Platform> {
    lock: KernelLock,
    state: UnsafeCell<Option<KernelState<P>>>,
}

// Safety: every access to `state` is serialized by `lock`.
unsafe impl<P: Platform> Sync for Globals<P> {}

fn globals<P: Platform>() -> &'static Globals<P> {
    // A `static` declared inside a generic function is monomorphized along
    // with the function itself: each concrete `P` this is instantiated for
    // gets its own, independent copy of `G`. This is what gives every
    // `Platform` its own kernel singleton without a `Box<dyn Trait>` or a
    // registry keyed by `TypeId`.
    static G: Globals<P> = Globals {
        lock: KernelLock::new(),
        state: UnsafeCell::new(None),
    };
    &G
}

/// Thread kernel core, generic over the platform it runs on.
pub struct Kernel<P: Platform>(PhantomData<P>);

impl<P: Platform> Kernel<P> {
    /// Must be called once, on the boot processor, before any other
    /// operation.
    pub fn init() {
        let g = globals::<P>();
        g.lock.lock();
        unsafe {
            *g.state.get() = Some(KernelState::new());
        }
        g.lock.unlock();
        log::info!("kernel core initialized for {} core(s)", P::Cpu::cores());
    }

    fn with_state<R>(f: impl FnOnce(&mut KernelState<P>) -> R) -> R {
        let g = globals::<P>();
        g.lock.lock();
        let result = unsafe {
            let state = (*g.state.get())
                .as_mut()
                .expect("Kernel::init() must run before any other operation");
            f(state)
        };
        g.lock.unlock();
        result
    }

    /// Acquire the kernel lock. Exposed so that a synchronization primitive
    /// built on top of this core can bracket a sequence of calls to the
    /// caller-locked primitives (`sleep`, `wakeup`, `wakeup_all`,
    /// `prioritize`, `deprioritize`) in one critical section, the way a
    /// mutex's own `lock()`/`unlock()` wrap its check-then-sleep sequence.
    pub fn lock() {
        globals::<P>().lock.lock();
    }

    /// Release the kernel lock taken by a prior call to `lock()`.
    pub fn unlock() {
        globals::<P>().lock.unlock();
    }

    /// Access kernel state directly, assuming the caller already holds the
    /// kernel lock. Used by the caller-locked primitives, which must not
    /// take the lock themselves: their whole point is to compose with a
    /// synchronization primitive's own critical section without nesting a
    /// second acquisition of the same non-reentrant spin.
    fn assume_locked<R>(f: impl FnOnce(&mut KernelState<P>) -> R) -> R {
        let g = globals::<P>();
        debug_assert!(g.lock.is_locked(), "caller must hold the kernel lock");
        let state = unsafe {
            (*g.state.get())
                .as_mut()
                .expect("Kernel::init() must run before any other operation")
        };
        f(state)
    }

    // ------------------------------------------------------------------
    // 4.1 Construction
    // ------------------------------------------------------------------

    /// Create a new thread, ready to run, with the given rank. Two-phase:
    /// the prologue allocates stack/context, the epilogue (here, inline)
    /// assigns the id and makes the thread visible to the scheduler —
    /// mirroring EPOS's split so that nothing observes a half-built thread.
    pub fn create(
        name: Option<&'static str>,
        entry: extern "C" fn() -> !,
        stack_size: usize,
        rank: P::Criterion,
    ) -> ThreadId {
        Self::with_state(|state| {
            let id = ThreadId(state.next_id);
            state.next_id += 1;

            let home_cpu = state.next_cpu % state.scheduler.cores().max(1);
            if P::PARTITIONED {
                state.next_cpu = (state.next_cpu + 1) % state.scheduler.cores().max(1);
            }

            let mut thread = Thread::<P>::prologue(id, name, entry, stack_size, rank, home_cpu);
            thread.state = ThreadState::Ready;
            thread.criterion.on_event(CriterionEvent::Create);

            if id.0 >= state.threads.len() {
                state.threads.resize_with(id.0 + 1, || None);
            }
            state.threads[id.0] = Some(Box::new(thread));
            state.scheduler.insert(id, rank, home_cpu);
            state.thread_count += 1;

            log::debug!("{} created (rank queued on core {})", id, home_cpu);
            id
        })
    }

    /// Create the per-core idle thread. Ranked `Criterion::IDLE` so it is
    /// always the last choice of `choose()`. Pinned to `cpu` explicitly:
    /// `create()`'s own round-robin `home_cpu` assignment has no idea this
    /// thread must belong to a specific core's ready queue, so it is
    /// relocated here rather than trusted to land there by chance.
    pub fn create_idle(entry: extern "C" fn() -> !, stack_size: usize, cpu: usize) -> ThreadId {
        let id = Self::create(Some("idle"), entry, stack_size, P::Criterion::IDLE);
        Self::with_state(|state| {
            state.scheduler.remove(id);
            if let Some(thread) = state.get_mut(id) {
                thread.home_cpu = cpu;
            }
            state.scheduler.insert(id, P::Criterion::IDLE, cpu);
            state.idle[cpu] = Some(id);
        });
        id
    }

    // ------------------------------------------------------------------
    // 4.2 Destruction
    // ------------------------------------------------------------------

    /// Tear down a thread. Per spec, the action taken depends on the
    /// thread's state at the time of destruction:
    /// - `Ready`/`Suspended`/`Waiting`/`Beginning`: remove from wherever it
    ///   is queued, drop it, and count it down.
    /// - `Finishing`: already off every queue and already counted down by
    ///   `exit()`; just drop it.
    /// - `Running`: destroying the thread that is currently executing is a
    ///   contract violation (a thread cannot destroy itself mid-flight);
    ///   fall back to `exit(-1)` instead of corrupting scheduler state,
    ///   which takes care of its own count-down.
    pub fn destroy(id: ThreadId) {
        Self::with_state(|state| {
            let Some(thread) = state.get(id) else {
                log::warn!("destroy: {} unknown", id);
                return;
            };
            match thread.state {
                ThreadState::Running => {
                    log::warn!("destroy: {} is RUNNING, exiting instead", id);
                    Self::exit_locked(state, id, -1);
                    return;
                }
                ThreadState::Ready => {
                    state.scheduler.remove(id);
                    state.thread_count -= 1;
                }
                ThreadState::Waiting | ThreadState::Suspended | ThreadState::Beginning => {
                    // Caller is responsible for having already removed the
                    // thread from any wait queue it owns; the kernel core
                    // does not track wait-queue membership by address.
                    state.thread_count -= 1;
                }
                ThreadState::Finishing => {
                    // exit() already counted this thread down.
                }
            }
            state.threads[id.0] = None;
            log::debug!("{} destroyed", id);
        });
    }

    // ------------------------------------------------------------------
    // 4.3 State transitions
    // ------------------------------------------------------------------

    /// Cooperatively hand the CPU directly to `target`, bypassing rank
    /// order. `Scheduler::choose(t)` validates `target` is actually
    /// eligible (ready); if it is not, this logs and returns without
    /// switching.
    pub fn pass(target: ThreadId) {
        let cpu = P::Cpu::id();
        let (prev, eligible) = Self::with_state(|state| {
            let eligible = matches!(state.get(target).map(|t| t.state), Some(ThreadState::Ready));
            (state.current[cpu], eligible)
        });
        if !eligible {
            log::warn!("pass: {} not ready, ignoring", target);
            return;
        }
        // A cooperative hand-off must not charge the outgoing thread's
        // quantum or restart the preemption timer.
        match prev {
            Some(p) if p != target => Self::dispatch(p, target, false),
            Some(_) => {}
            None => Self::dispatch(target, target, false),
        }
    }

    /// Suspend a ready thread. A thread may suspend itself (the common
    /// case: about to block) or another thread, mirroring EPOS.
    pub fn suspend(id: ThreadId) -> Result<(), Rejected> {
        let (should_reschedule, cpu) = Self::with_state(|state| {
            let Some(thread) = state.get_mut(id) else {
                return (false, None);
            };
            if thread.state != ThreadState::Ready && thread.state != ThreadState::Running {
                log::warn!("suspend: {} not ready/running", id);
                return (false, None);
            }
            let was_running = thread.state == ThreadState::Running;
            thread.state = ThreadState::Suspended;
            thread.criterion.on_event(CriterionEvent::Leave);
            state.scheduler.remove(id);
            let cpu = was_running.then(|| P::Cpu::id());
            (was_running, cpu)
        });
        if should_reschedule {
            Self::reschedule_cpu(cpu.unwrap_or(P::Cpu::id()));
        }
        Ok(())
    }

    /// Make a suspended thread ready again.
    pub fn resume(id: ThreadId) -> Result<(), Rejected> {
        let home_cpu = Self::with_state(|state| {
            let Some(thread) = state.get_mut(id) else {
                return None;
            };
            if thread.state != ThreadState::Suspended {
                log::warn!("resume: {} not suspended", id);
                return None;
            }
            thread.state = ThreadState::Ready;
            thread.criterion.on_event(CriterionEvent::Enter);
            let rank = thread.criterion;
            let home_cpu = state.home_cpu_of(id);
            state.scheduler.insert(id, rank, home_cpu);
            Some(home_cpu)
        });
        match home_cpu {
            Some(cpu) => {
                Self::nudge(cpu);
                Ok(())
            }
            None => Err(Rejected::WrongState),
        }
    }

    /// Give up the remainder of the current quantum unconditionally,
    /// picking a different ready thread regardless of rank — EPOS's
    /// `choose_another()`. Unlike `reschedule_cpu`, a voluntary yield
    /// always hands off to whatever else is runnable, even to a
    /// lower-ranked thread; falls back to the idle thread if nothing else
    /// is ready.
    pub fn yield_now() {
        let cpu = P::Cpu::id();
        let (prev, next) = Self::with_state(|state| {
            let prev = state.current[cpu];
            let next = match prev {
                Some(p) => state.scheduler.head_excluding(cpu, p).or(state.idle[cpu]),
                None => state.scheduler.head(cpu).or(state.idle[cpu]),
            };
            (prev, next)
        });
        match (prev, next) {
            (Some(p), Some(n)) if p != n => Self::dispatch(p, n, true),
            (None, Some(n)) => Self::dispatch(n, n, true),
            _ => {}
        }
    }

    /// Terminate the calling thread with `status`, waking anyone joining
    /// it. Never returns: the dispatcher switches away permanently.
    pub fn exit(id: ThreadId, status: i32) -> ! {
        Self::with_state(|state| Self::exit_locked(state, id, status));
        Self::reschedule();
        unreachable!("exit: dispatcher switched away from a FINISHING thread");
    }

    fn exit_locked(state: &mut KernelState<P>, id: ThreadId, status: i32) {
        let joiner = {
            let Some(thread) = state.get_mut(id) else {
                return;
            };
            thread.state = ThreadState::Finishing;
            thread.write_exit_status(status);
            thread.criterion.on_event(CriterionEvent::Finish);
            thread.joining.take()
        };
        state.scheduler.remove(id);
        state.thread_count -= 1;
        if let Some(joiner) = joiner {
            let rank = {
                if let Some(j) = state.get_mut(joiner) {
                    if j.state == ThreadState::Suspended {
                        j.state = ThreadState::Ready;
                        Some(j.criterion)
                    } else {
                        None
                    }
                } else {
                    None
                }
            };
            if let Some(rank) = rank {
                let home_cpu = state.home_cpu_of(joiner);
                state.scheduler.insert(joiner, rank, home_cpu);
            }
        }
        log::info!("{} exited with status {}", id, status);
    }

    /// Block the caller until `id` finishes, returning its exit status.
    /// Only one thread may join a given target at a time.
    pub fn join(caller: ThreadId, id: ThreadId) -> Result<i32, Rejected> {
        if caller == id {
            return Err(Rejected::SelfJoin);
        }
        let already_finished = Self::with_state(|state| {
            let Some(target) = state.get_mut(id) else {
                return Err(Rejected::UnknownThread);
            };
            if target.state == ThreadState::Finishing {
                return Ok(true);
            }
            if target.joining.is_some() {
                return Err(Rejected::AlreadyJoining);
            }
            target.joining = Some(caller);
            if let Some(c) = state.get_mut(caller) {
                c.state = ThreadState::Suspended;
            }
            state.scheduler.remove(caller);
            Ok(false)
        })?;

        if !already_finished {
            Self::reschedule();
        }

        Self::with_state(|state| {
            state
                .get(id)
                .map(|t| t.read_exit_status())
                .ok_or(Rejected::UnknownThread)
        })
    }

    // ------------------------------------------------------------------
    // 4.4 Sleep / Wakeup
    // ------------------------------------------------------------------

    /// Block the calling thread on `token`. Assumes the caller already
    /// holds the kernel lock (via `Kernel::lock()`) — a synchronization
    /// primitive brackets "check my condition" and "sleep if it doesn't
    /// hold" in one critical section, so this cannot take the lock itself.
    /// The caller is also responsible for having already inserted `id`
    /// into its own `WaitQueue` before calling this — the kernel core
    /// only flips the thread's bookkeeping and reschedules.
    pub fn sleep(id: ThreadId, token: WaitToken) {
        Self::assume_locked(|state| {
            if let Some(thread) = state.get_mut(id) {
                thread.state = ThreadState::Waiting;
                thread.waiting = Some(token);
                thread.criterion.on_event(CriterionEvent::Leave);
            }
            state.scheduler.remove(id);
        });
        Self::reschedule_cpu_locked(P::Cpu::id());
    }

    /// Wake one specific thread that was sleeping on a wait queue (the
    /// caller has already popped it off that queue). Assumes the caller
    /// already holds the kernel lock.
    pub fn wakeup(id: ThreadId) {
        let home_cpu = Self::assume_locked(|state| {
            let Some(thread) = state.get_mut(id) else {
                return None;
            };
            if thread.state != ThreadState::Waiting {
                return None;
            }
            thread.state = ThreadState::Ready;
            thread.waiting = None;
            thread.criterion.on_event(CriterionEvent::Enter);
            let rank = thread.criterion;
            let home_cpu = state.home_cpu_of(id);
            state.scheduler.insert(id, rank, home_cpu);
            Some(home_cpu)
        });
        if let Some(cpu) = home_cpu {
            Self::nudge_locked(cpu);
        }
    }

    /// Wake every thread in `ids` (the caller has already drained its wait
    /// queue). Per the Open Question decision in DESIGN.md, this issues one
    /// reschedule per affected core rather than an extra broadcast. Assumes
    /// the caller already holds the kernel lock.
    pub fn wakeup_all(ids: &[ThreadId]) {
        let mut cpus_to_nudge = [false; MAX_QUEUES];
        Self::assume_locked(|state| {
            for &id in ids {
                let Some(thread) = state.get_mut(id) else {
                    continue;
                };
                if thread.state != ThreadState::Waiting {
                    continue;
                }
                thread.state = ThreadState::Ready;
                thread.waiting = None;
                thread.criterion.on_event(CriterionEvent::Enter);
                let rank = thread.criterion;
                let home_cpu = state.home_cpu_of(id);
                state.scheduler.insert(id, rank, home_cpu);
                cpus_to_nudge[home_cpu % MAX_QUEUES] = true;
            }
        });
        for (cpu, &flag) in cpus_to_nudge.iter().enumerate() {
            if flag {
                Self::nudge_locked(cpu);
            }
        }
    }

    // ------------------------------------------------------------------
    // 4.5 Priority inheritance / ceiling
    // ------------------------------------------------------------------

    /// Boost every thread in `queue` that is less eligible than the
    /// calling (running) thread, so that whoever currently holds whatever
    /// resource `queue` protects cannot be preempted by a thread waiting
    /// on it. Under `Protocol::Inherit` the boosted rank is the running
    /// thread's own rank; under `Protocol::Ceiling` it is always
    /// `Criterion::CEILING`, the most eligible rank any thread can carry.
    /// A no-op when `Platform::PRIORITY_PROTOCOL == Protocol::None`.
    /// Assumes the caller already holds the kernel lock.
    pub fn prioritize(queue: &mut WaitQueue<P::Criterion>) {
        if P::PRIORITY_PROTOCOL == Protocol::None || queue.is_empty() {
            return;
        }
        let cpu = P::Cpu::id();
        let Some(run_rank) = Self::assume_locked(|state| {
            let run = state.current[cpu].unwrap_or(ThreadId(cpu + 1));
            state.get(run).map(|t| t.criterion)
        }) else {
            return;
        };
        let owners: Vec<ThreadId> = queue.ids().collect();
        for owner in owners {
            let outcome = Self::assume_locked(|state| {
                let thread = state.get_mut(owner)?;
                if thread.criterion.rank(&run_rank) != core::cmp::Ordering::Greater {
                    return None;
                }
                let boosted = if P::PRIORITY_PROTOCOL == Protocol::Ceiling {
                    P::Criterion::CEILING
                } else {
                    run_rank
                };
                thread.push_priority(boosted);
                let kind = thread.state;
                let home_cpu = state.home_cpu_of(owner);
                if kind == ThreadState::Ready {
                    state.scheduler.rerank(owner, boosted, home_cpu);
                }
                Some((boosted, kind, home_cpu))
            });
            let Some((boosted, kind, home_cpu)) = outcome else {
                continue;
            };
            if kind == ThreadState::Waiting {
                queue.rerank(owner, boosted);
            }
            if P::PREEMPTIVE {
                if P::PARTITIONED {
                    Self::reschedule_cpu_locked(home_cpu);
                } else {
                    Self::reschedule_someone_locked();
                }
            }
        }
    }

    /// Undo the most recent `prioritize` boost on every thread in `queue`
    /// that had one outstanding. Assumes the caller already holds the
    /// kernel lock.
    pub fn deprioritize(queue: &mut WaitQueue<P::Criterion>) {
        if P::PRIORITY_PROTOCOL == Protocol::None || queue.is_empty() {
            return;
        }
        let owners: Vec<ThreadId> = queue.ids().collect();
        for owner in owners {
            let outcome = Self::assume_locked(|state| {
                let thread = state.get_mut(owner)?;
                if !thread.pop_priority() {
                    return None;
                }
                let restored = thread.criterion;
                let kind = thread.state;
                let home_cpu = state.home_cpu_of(owner);
                if kind == ThreadState::Ready {
                    state.scheduler.rerank(owner, restored, home_cpu);
                }
                Some((restored, kind, home_cpu))
            });
            let Some((restored, kind, home_cpu)) = outcome else {
                continue;
            };
            if kind == ThreadState::Waiting {
                queue.rerank(owner, restored);
            }
            if P::PREEMPTIVE {
                if P::PARTITIONED {
                    Self::reschedule_cpu_locked(home_cpu);
                } else {
                    Self::reschedule_someone_locked();
                }
            }
        }
    }

    /// Change `id`'s rank permanently (not a save/restore boost like
    /// `prioritize`/`deprioritize`). If the thread is not currently
    /// `RUNNING`, it is removed and reinserted at its new rank's
    /// position; a `RUNNING` thread isn't in the ready queue at all, so
    /// its rank is simply reassigned in place. If preemptive, nudges
    /// whichever core(s) the new rank might make eligible to run sooner.
    pub fn priority(id: ThreadId, new_rank: P::Criterion) {
        let found = Self::with_state(|state| {
            let Some(running) = state.get(id).map(|t| t.state == ThreadState::Running) else {
                return false;
            };
            if !running {
                let home_cpu = state.home_cpu_of(id);
                state.scheduler.remove(id);
                if let Some(thread) = state.get_mut(id) {
                    thread.criterion = new_rank;
                }
                state.scheduler.insert(id, new_rank, home_cpu);
            } else if let Some(thread) = state.get_mut(id) {
                thread.criterion = new_rank;
            }
            true
        });
        if !found {
            log::warn!("priority: {} unknown", id);
            return;
        }
        if P::PREEMPTIVE {
            if P::PARTITIONED {
                let home_cpu = Self::with_state(|state| state.home_cpu_of(id));
                Self::reschedule_cpu(home_cpu);
            } else {
                Self::reschedule_someone();
            }
        }
    }

    // ------------------------------------------------------------------
    // 4.6 Scheduling & dispatch
    // ------------------------------------------------------------------

    /// Who would run next on `cpu` if a dispatch happened right now.
    pub fn choose(cpu: usize) -> Option<ThreadId> {
        Self::with_state(|state| state.scheduler.head(cpu))
    }

    /// Reschedule the calling core: pick the best-ranked ready thread and
    /// dispatch to it if it differs from whoever is running.
    pub fn reschedule() {
        Self::reschedule_cpu(P::Cpu::id());
    }

    /// Involuntary reschedule (timer tick, IPI, a wakeup/resume/priority
    /// change that might affect this core): unlike `yield_now`, this must
    /// never demote a thread that is still genuinely `RUNNING` in favor of
    /// a less eligible ready thread — only switch when the ready queue's
    /// head is strictly more eligible than whatever is currently running.
    /// A `prev` that has already left `RUNNING` (suspended, slept, exited
    /// before calling this) has nothing left to protect, so it always
    /// yields to the next candidate.
    pub fn reschedule_cpu(cpu: usize) {
        Self::lock();
        Self::reschedule_cpu_locked(cpu);
        Self::unlock();
    }

    /// Same as `reschedule_cpu`, but assumes the kernel lock is already
    /// held by the caller and leaves it held on return (released, if at
    /// all, only inside `dispatch_locked` immediately before
    /// `switch_context`, then reacquired once `prev` resumes). Used by the
    /// caller-locked primitives so that detaching a thread from the
    /// scheduler and dispatching away from it is one atomic step under the
    /// lock the caller took out, rather than two separate acquisitions.
    fn reschedule_cpu_locked(cpu: usize) {
        let (prev, next) = Self::assume_locked(|state| {
            let prev = state.current[cpu];
            let candidate = state.scheduler.head(cpu).or(state.idle[cpu]);
            let next = match (prev, candidate) {
                (Some(p), Some(c)) => {
                    let prev_running_rank = state
                        .get(p)
                        .filter(|t| t.state == ThreadState::Running)
                        .map(|t| t.criterion);
                    match prev_running_rank {
                        Some(prev_rank) => {
                            let more_eligible = state
                                .get(c)
                                .map(|t| t.criterion.rank(&prev_rank) == core::cmp::Ordering::Less)
                                .unwrap_or(false);
                            if more_eligible { Some(c) } else { None }
                        }
                        None => Some(c),
                    }
                }
                (None, Some(c)) => Some(c),
                _ => None,
            };
            (prev, next)
        });
        match (prev, next) {
            (Some(p), Some(n)) if p != n => Self::dispatch_locked(p, n, true),
            (None, Some(n)) => Self::dispatch_locked(n, n, true),
            _ => {}
        }
    }

    /// Nudge whichever core is idle or running something worse-ranked than
    /// a thread that just became ready, so it reschedules promptly. In
    /// global mode this is always the calling core (global mode has no
    /// fixed home); in partitioned mode it is the thread's home core,
    /// signaled via IPI if that is not the calling core.
    fn nudge(cpu: usize) {
        if cpu == P::Cpu::id() {
            Self::reschedule_cpu(cpu);
        } else {
            P::Ic::send_reschedule_ipi(cpu);
        }
    }

    /// Same as `nudge`, but for callers that already hold the kernel lock.
    fn nudge_locked(cpu: usize) {
        if cpu == P::Cpu::id() {
            Self::reschedule_cpu_locked(cpu);
        } else {
            P::Ic::send_reschedule_ipi(cpu);
        }
    }

    /// Ask some core — not necessarily this one — to reschedule, round
    /// robin over the available cores. Used when a change affects
    /// eligibility globally but no specific core is implicated.
    pub fn reschedule_someone() {
        Self::lock();
        Self::reschedule_someone_locked();
        Self::unlock();
    }

    /// Same as `reschedule_someone`, assuming the caller already holds the
    /// kernel lock.
    fn reschedule_someone_locked() {
        let (cpu, is_self) = Self::assume_locked(|state| {
            let cpu = state.next_cpu;
            state.next_cpu = (state.next_cpu + 1) % state.scheduler.cores().max(1);
            (cpu, cpu == P::Cpu::id())
        });
        if is_self {
            Self::reschedule_cpu_locked(cpu);
        } else {
            P::Ic::send_reschedule_ipi(cpu);
        }
    }

    /// Entry point for the reschedule IPI handler.
    pub fn rescheduler() {
        Self::reschedule_cpu(P::Cpu::id());
    }

    /// Entry point for the quantum-expiry timer interrupt. A no-op unless
    /// `Platform::PREEMPTIVE`.
    pub fn time_slicer() {
        if !P::PREEMPTIVE {
            return;
        }
        Self::reschedule_cpu(P::Cpu::id());
    }

    /// Switch execution from `prev` to `next` on the calling core.
    ///
    /// Acquires the kernel lock itself and releases it again before
    /// returning, for the many call sites (`reschedule_cpu`, `yield_now`,
    /// `pass`, `exit`, `join`, ...) that are not themselves caller-locked.
    fn dispatch(prev: ThreadId, next: ThreadId, charge: bool) {
        Self::lock();
        Self::dispatch_locked(prev, next, charge);
        Self::unlock();
    }

    /// Same as `dispatch`, but assumes the kernel lock is already held by
    /// the caller and does not release it except in the one place the
    /// protocol requires: immediately before `switch_context`, reacquiring
    /// it once `prev` resumes. The lock is therefore still held when this
    /// returns — callers that took it out themselves (`dispatch`'s own
    /// wrapper, or a caller-locked primitive like `sleep`) are responsible
    /// for the matching `unlock()`.
    fn dispatch_locked(prev: ThreadId, next: ThreadId, charge: bool) {
        let g = globals::<P>();
        debug_assert!(g.lock.is_locked(), "caller must hold the kernel lock");
        let cpu = P::Cpu::id();

        if prev == next {
            let state = unsafe { (*g.state.get()).as_mut().unwrap() };
            state.current[cpu] = Some(next);
            if let Some(t) = state.get_mut(next) {
                t.state = ThreadState::Running;
            }
            return;
        }

        // SAFETY: raw pointers are obtained while holding `g.lock` and used
        // only until the matching `switch_context`/`restart` calls below;
        // no other access to `prev`'s or `next`'s context fields occurs in
        // between.
        let (prev_ctx, next_ctx, restart_timer): (
            *mut <P::Cpu as Cpu>::Context,
            *const <P::Cpu as Cpu>::Context,
            bool,
        ) = {
            let state = unsafe { (*g.state.get()).as_mut().unwrap() };
            let dynamic = state.get(next).map(|t| t.criterion.is_dynamic()).unwrap_or(false);

            if charge {
                if let Some(t) = state.get_mut(prev) {
                    t.criterion.on_event(CriterionEvent::Charge);
                }
            }

            if dynamic {
                // A dynamic policy retires the outgoing thread's rank,
                // re-sorts every thread still waiting to run, then awards
                // the incoming thread before it resumes.
                if let Some(t) = state.get_mut(prev) {
                    t.criterion.on_event(CriterionEvent::Leave);
                }
                let ready_ids: Vec<ThreadId> = state
                    .threads
                    .iter()
                    .filter_map(|slot| slot.as_deref())
                    .filter(|t| t.state == ThreadState::Ready)
                    .map(|t| t.id)
                    .collect();
                for id in ready_ids {
                    let home_cpu = state.home_cpu_of(id);
                    if let Some(t) = state.get_mut(id) {
                        let rank = t.criterion;
                        state.scheduler.rerank(id, rank, home_cpu);
                    }
                }
                if let Some(t) = state.get_mut(next) {
                    t.criterion.on_event(CriterionEvent::Award);
                    t.criterion.on_event(CriterionEvent::Enter);
                }
            }

            let timed = state.get(next).map(|t| t.criterion.is_timed()).unwrap_or(false);
            let restart_timer = charge && timed;

            if let Some(t) = state.get_mut(prev) {
                if t.state == ThreadState::Running {
                    t.state = ThreadState::Ready;
                    let rank = t.criterion;
                    state.scheduler.insert(prev, rank, cpu);
                }
            }
            if let Some(t) = state.get_mut(next) {
                t.state = ThreadState::Running;
            }
            state.scheduler.remove(next);
            state.current[cpu] = Some(next);

            let (prev_thread, next_thread) = state.get_pair_mut(prev, next);
            (
                &mut prev_thread.context as *mut _,
                &next_thread.context as *const _,
                restart_timer,
            )
        };

        g.lock.unlock();
        // The preemption timer only restarts for a timed criterion, and
        // only when this dispatch actually charges a quantum (never on a
        // cooperative `pass`/`yield`-style hand-off).
        if restart_timer {
            P::Timer::restart();
        }
        unsafe {
            P::Cpu::switch_context(&mut *prev_ctx, &*next_ctx);
        }
        // Resumes here once some core switches back into `prev`.
        g.lock.lock();
    }

    // ------------------------------------------------------------------
    // 4.7 Idle thread
    // ------------------------------------------------------------------

    /// Body of the per-core idle thread. Halts until interrupted, then
    /// reschedules; on the boot processor, also watches for the whole
    /// system being down to nothing but idle threads and shuts down.
    pub fn idle_loop(cpu: usize) -> ! {
        loop {
            if cpu == <P::Cpu as Cpu>::BSP {
                let should_shutdown = Self::with_state(|state| {
                    state.not_booting && state.thread_count <= state.scheduler.cores()
                });
                if should_shutdown {
                    log::info!("idle: no runnable threads remain, shutting down");
                    P::Cpu::shutdown(P::REBOOT_ON_SHUTDOWN);
                }
            }
            P::Cpu::halt();
            Self::reschedule_cpu(cpu);
        }
    }

    /// Mark boot complete: before this, `idle_loop`'s shutdown check never
    /// fires, giving every core a chance to create its threads first.
    pub fn finish_booting() {
        Self::with_state(|state| state.not_booting = true);
    }

    // ------------------------------------------------------------------
    // 4.8 Self-identification
    // ------------------------------------------------------------------

    /// The calling core's current thread. Before boot completes (no
    /// thread has been dispatched on this core yet), returns a synthetic
    /// per-core identity (`cpu + 1`) rather than `None`, so code that runs
    /// before the scheduler is live can still name "the current thread".
    pub fn current() -> ThreadId {
        let cpu = P::Cpu::id();
        Self::with_state(|state| {
            state.current[cpu].unwrap_or(ThreadId(cpu + 1))
        })
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::policy::{DynamicDemo, Priority};
    use crate::test_support::TestPlatform;

    extern "C" fn stub_entry() -> ! {
        loop {}
    }

    // Each test names its own marker type so `Kernel::<TestPlatform<M>>`
    // gets its own monomorphized global (see `globals`'s doc comment)
    // instead of racing with every other test on one shared kernel.

    #[test]
    fn higher_priority_thread_is_chosen_first() {
        enum M {}
        type K = Kernel<TestPlatform<M>>;
        K::init();
        let a = K::create(Some("a"), stub_entry, 4096, Priority::NORMAL);
        let b = K::create(Some("b"), stub_entry, 4096, Priority::HIGH);
        assert_eq!(K::choose(0), Some(b));
        let _ = a;
    }

    #[test]
    fn reschedule_dispatches_to_the_best_ranked_ready_thread() {
        enum M {}
        type K = Kernel<TestPlatform<M>>;
        K::init();
        let a = K::create(Some("a"), stub_entry, 4096, Priority::NORMAL);
        K::reschedule();
        assert_eq!(K::current(), a);

        let b = K::create(Some("b"), stub_entry, 4096, Priority::HIGH);
        K::reschedule();
        assert_eq!(K::current(), b);
    }

    #[test]
    fn reschedule_does_not_demote_a_running_thread_below_a_lower_ranked_ready_thread() {
        enum M {}
        type K = Kernel<TestPlatform<M>>;
        K::init();
        let a = K::create(Some("a"), stub_entry, 4096, Priority::NORMAL);
        K::reschedule();
        assert_eq!(K::current(), a);

        let b = K::create(Some("b"), stub_entry, 4096, Priority::HIGH);
        K::reschedule();
        assert_eq!(K::current(), b);

        // a (NORMAL, re-queued) is still ready, but b (HIGH) is RUNNING and
        // strictly more eligible: a third reschedule must not switch back.
        K::reschedule();
        assert_eq!(K::current(), b);
    }

    #[test]
    fn yield_now_hands_off_to_a_lower_ranked_ready_thread_unconditionally() {
        enum M {}
        type K = Kernel<TestPlatform<M>>;
        K::init();
        let a = K::create(Some("a"), stub_entry, 4096, Priority::HIGH);
        K::reschedule();
        assert_eq!(K::current(), a);

        let b = K::create(Some("b"), stub_entry, 4096, Priority::LOW);
        // An ordinary reschedule would never switch to the lower-ranked b...
        K::reschedule();
        assert_eq!(K::current(), a);
        // ...but a voluntary yield hands off regardless of rank.
        K::yield_now();
        assert_eq!(K::current(), b);
    }

    #[test]
    fn exit_decrements_thread_count_and_destroy_does_not_double_count() {
        enum M {}
        type K = Kernel<TestPlatform<M>>;
        K::init();
        let target = K::create(Some("target"), stub_entry, 4096, Priority::NORMAL);
        let before = K::with_state(|state| state.thread_count);
        K::with_state(|state| K::exit_locked(state, target, 0));
        let after_exit = K::with_state(|state| state.thread_count);
        assert_eq!(after_exit, before - 1);

        K::destroy(target);
        let after_destroy = K::with_state(|state| state.thread_count);
        assert_eq!(after_destroy, after_exit);
    }

    #[test]
    fn create_idle_pins_the_idle_thread_to_its_requested_core() {
        enum M {}
        type K = Kernel<TestPlatform<M>>;
        K::init();
        let idle = K::create_idle(stub_entry, 4096, 0);
        assert_eq!(K::with_state(|state| state.home_cpu_of(idle)), 0);
        assert_eq!(K::choose(0), Some(idle));
    }

    #[test]
    fn dynamic_criterion_is_charged_on_dispatch_and_forgiven_on_award() {
        enum M {}
        type K = Kernel<TestPlatform<M, DynamicDemo>>;
        K::init();
        let a = K::create(Some("a"), stub_entry, 4096, DynamicDemo::new());
        K::reschedule();
        assert_eq!(K::current(), a);

        let b = K::create(Some("b"), stub_entry, 4096, DynamicDemo::new());
        // a ran a full quantum: charged once, still ahead of b's untouched 0.
        K::yield_now();
        assert_eq!(K::current(), b);
        let a_after_first_handoff = K::with_state(|state| state.get(a).unwrap().criterion.ticks());
        let b_after_first_handoff = K::with_state(|state| state.get(b).unwrap().criterion.ticks());
        assert_eq!(a_after_first_handoff, 1);
        assert_eq!(b_after_first_handoff, 0);

        // Handing off back to a: b is charged for its turn, a is awarded and
        // its earlier charge is forgiven rather than accumulating forever.
        K::yield_now();
        assert_eq!(K::current(), a);
        let a_after_second_handoff =
            K::with_state(|state| state.get(a).unwrap().criterion.ticks());
        let b_after_second_handoff =
            K::with_state(|state| state.get(b).unwrap().criterion.ticks());
        assert_eq!(a_after_second_handoff, 0);
        assert_eq!(b_after_second_handoff, 1);
    }

    #[test]
    fn suspend_then_resume_round_trips_through_the_ready_queue() {
        enum M {}
        type K = Kernel<TestPlatform<M>>;
        K::init();
        let a = K::create(Some("a"), stub_entry, 4096, Priority::NORMAL);
        assert_eq!(K::choose(0), Some(a));
        K::suspend(a).unwrap();
        assert_eq!(K::choose(0), None);
        K::resume(a).unwrap();
        assert_eq!(K::choose(0), Some(a));
    }

    #[test]
    fn sleep_then_wakeup_round_trips_through_the_ready_queue() {
        enum M {}
        type K = Kernel<TestPlatform<M>>;
        K::init();
        let a = K::create(Some("a"), stub_entry, 4096, Priority::NORMAL);
        K::lock();
        K::sleep(a, WaitToken(0));
        K::unlock();
        assert_eq!(K::choose(0), None);
        K::lock();
        K::wakeup(a);
        K::unlock();
        assert_eq!(K::choose(0), Some(a));
    }

    #[test]
    fn join_on_an_already_finished_thread_returns_its_exit_status() {
        enum M {}
        type K = Kernel<TestPlatform<M>>;
        K::init();
        let target = K::create(Some("target"), stub_entry, 4096, Priority::NORMAL);
        let caller = K::create(Some("caller"), stub_entry, 4096, Priority::NORMAL);
        K::with_state(|state| K::exit_locked(state, target, 42));
        assert_eq!(K::join(caller, target), Ok(42));
    }

    #[test]
    fn join_rejects_joining_self() {
        enum M {}
        type K = Kernel<TestPlatform<M>>;
        K::init();
        let a = K::create(Some("a"), stub_entry, 4096, Priority::NORMAL);
        assert_eq!(K::join(a, a), Err(Rejected::SelfJoin));
    }

    #[test]
    fn prioritize_then_deprioritize_restores_original_rank_order() {
        enum M {}
        type K = Kernel<TestPlatform<M>>;
        K::init();
        let a = K::create(Some("a"), stub_entry, 4096, Priority::NORMAL);
        K::reschedule();
        assert_eq!(K::current(), a);

        let b = K::create(Some("b"), stub_entry, 4096, Priority::LOW);
        let mut q: WaitQueue<Priority> = WaitQueue::new();
        q.insert(b, Priority::LOW);

        K::lock();
        K::prioritize(&mut q);
        K::unlock();
        let boosted = K::with_state(|state| state.get(b).map(|t| t.criterion));
        assert_eq!(boosted, Some(Priority::NORMAL));

        K::lock();
        K::deprioritize(&mut q);
        K::unlock();
        let restored = K::with_state(|state| state.get(b).map(|t| t.criterion));
        assert_eq!(restored, Some(Priority::LOW));
    }

    #[test]
    fn pass_switches_directly_to_an_eligible_thread_ignoring_rank() {
        enum M {}
        type K = Kernel<TestPlatform<M>>;
        K::init();
        let a = K::create(Some("a"), stub_entry, 4096, Priority::HIGH);
        let b = K::create(Some("b"), stub_entry, 4096, Priority::LOW);
        K::reschedule();
        assert_eq!(K::current(), a);

        // b is lower-ranked, so an ordinary reschedule would never pick it,
        // but pass() bypasses rank order entirely.
        K::pass(b);
        assert_eq!(K::current(), b);
    }

    #[test]
    fn pass_to_an_ineligible_thread_is_ignored() {
        enum M {}
        type K = Kernel<TestPlatform<M>>;
        K::init();
        let a = K::create(Some("a"), stub_entry, 4096, Priority::NORMAL);
        let b = K::create(Some("b"), stub_entry, 4096, Priority::LOW);
        K::reschedule();
        assert_eq!(K::current(), a);

        K::suspend(b).unwrap();
        K::pass(b);
        assert_eq!(K::current(), a);
    }

    #[test]
    fn priority_reorders_a_ready_thread_in_the_queue() {
        enum M {}
        type K = Kernel<TestPlatform<M>>;
        K::init();
        let a = K::create(Some("a"), stub_entry, 4096, Priority::HIGH);
        let b = K::create(Some("b"), stub_entry, 4096, Priority::LOW);
        assert_eq!(K::choose(0), Some(a));

        K::priority(b, Priority::MAIN);
        assert_eq!(K::choose(0), Some(b));
    }

    #[test]
    fn prioritize_is_a_no_op_under_protocol_none() {
        struct NoProtocol;
        impl Platform for NoProtocol {
            type Cpu = crate::test_support::NullCpu;
            type Ic = crate::test_support::NullIc;
            type Timer = crate::test_support::NullTimer;
            type Criterion = Priority;
            const PREEMPTIVE: bool = false;
            const PARTITIONED: bool = false;
            const PRIORITY_PROTOCOL: Protocol = Protocol::None;
            const REBOOT_ON_SHUTDOWN: bool = false;
        }
        type K = Kernel<NoProtocol>;
        K::init();
        let a = K::create(Some("a"), stub_entry, 4096, Priority::NORMAL);
        let b = K::create(Some("b"), stub_entry, 4096, Priority::LOW);
        let mut q: WaitQueue<Priority> = WaitQueue::new();
        q.insert(b, Priority::LOW);
        K::lock();
        K::prioritize(&mut q);
        K::unlock();
        assert_eq!(K::choose(0), Some(a));
    }
}
