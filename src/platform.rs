/*
 * Platform Abstraction - External Collaborator Traits
 *
 * This module defines the seam between the thread kernel core and the
 * pieces of a real kernel it deliberately does not implement: CPU context
 * switching, the interrupt controller, the preemption timer, and the
 * scheduling policy comparator ("criterion"). A concrete kernel build
 * supplies one type implementing `Platform` and the core is generic over
 * it, the same way `KernelSchedCtx` in the policy layer is the narrow
 * interface a pluggable scheduling policy is given instead of direct
 * access to kernel internals.
 *
 * Build-time configuration (preemptive scheduling, partitioned vs. global
 * queue distribution, the priority-inversion protocol, reboot-on-shutdown)
 * is carried as associated constants on `Platform` rather than as runtime
 * fields: these are compile-time decisions, not something a running kernel
 * ever toggles.
 */

/// Opaque CPU primitives a concrete platform must provide.
///
/// `Context` is an opaque saved-register blob; the kernel core never reads
/// or writes its contents, only asks the platform to switch between two of
/// them.
pub trait Cpu: 'static {
    /// Saved CPU register state for one thread. Opaque to the kernel core.
    type Context: Send;

    /// Number of cores participating in scheduling.
    fn cores() -> usize;

    /// Index of the calling core, in `0..cores()`.
    fn id() -> usize;

    /// Index of the boot strap processor.
    const BSP: usize = 0;

    /// Switch execution from `prev`'s context to `next`'s context.
    ///
    /// Returns control to the caller only when some other thread switches
    /// back into `prev`. Must be called with interrupts disabled and
    /// returns with interrupts in whatever state `next`'s context specifies.
    ///
    /// # Safety
    /// Both contexts must belong to threads that are not concurrently being
    /// switched into on another core.
    unsafe fn switch_context(prev: &mut Self::Context, next: &Self::Context);

    /// Construct a context that begins execution at `entry` on `stack`.
    fn new_context(entry: extern "C" fn() -> !, stack: &mut [u8]) -> Self::Context;

    /// Halt the calling core until the next interrupt.
    fn halt();

    /// Disable interrupts on the calling core, returning the prior state.
    fn disable_interrupts() -> bool;

    /// Restore a previously saved interrupt-enabled state.
    fn restore_interrupts(was_enabled: bool);

    /// Power off or reboot the machine. Never returns.
    fn shutdown(reboot: bool) -> !;
}

/// Inter-processor interrupt delivery, used to nudge another core into
/// rescheduling (e.g. after `wakeup` makes a thread pinned to that core
/// ready, or after a priority-inheritance boost changes who should run).
pub trait InterruptController: 'static {
    /// Send a reschedule IPI to the given core.
    fn send_reschedule_ipi(cpu: usize);
}

/// Handle to the platform's preemption timer, used only to restart the
/// countdown to the next time-slice interrupt when a thread is dispatched.
pub trait TimerHandle: 'static {
    /// Restart the countdown for the calling core's quantum.
    fn restart();
}

/// Priority-inversion avoidance protocol selected at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// No priority-inversion avoidance: `prioritize`/`deprioritize` are no-ops.
    None,
    /// Priority inheritance: a blocked owner temporarily inherits the
    /// priority of the highest-priority thread waiting on it.
    Inherit,
    /// Priority ceiling: a thread entering a critical section is boosted to
    /// the highest priority any thread could ever contend for that section.
    Ceiling,
}

/// Bundles everything the thread kernel core needs from the surrounding
/// system. One build picks one concrete type implementing this trait.
pub trait Platform: 'static + Sized {
    type Cpu: Cpu;
    type Ic: InterruptController;
    type Timer: TimerHandle;
    type Criterion: crate::criterion::Criterion;

    /// Whether the scheduler preempts running threads on quantum expiry.
    const PREEMPTIVE: bool;
    /// Partitioned (one ready queue per core) vs. global (one shared queue).
    const PARTITIONED: bool;
    /// Priority-inversion avoidance protocol.
    const PRIORITY_PROTOCOL: Protocol;
    /// Whether `idle()` reboots (true) or halts (false) when it decides to
    /// shut the machine down.
    const REBOOT_ON_SHUTDOWN: bool;
}
