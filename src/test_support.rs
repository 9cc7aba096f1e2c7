/*
 * Mock Platform for unit tests.
 *
 * A single-core, non-preemptive, software-only stand-in for real CPU/IC/
 * timer hardware, so the kernel core's scheduling logic can be exercised
 * without touching any architecture-specific code. Grounded on the
 * standard no_std-library testing idiom (`extern crate std` inside
 * `#[cfg(test)]`), which is how every no_std library in the retrieved
 * pack that ships tests at all (e.g. `heapless`) links a test harness.
 */

extern crate std;

use core::cell::Cell;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::criterion::Criterion as CriterionTrait;
use crate::platform::{Cpu, InterruptController, Platform, Protocol, TimerHandle};

static CURRENT_CORE: AtomicUsize = AtomicUsize::new(0);
static INTERRUPTS_ENABLED: AtomicUsize = AtomicUsize::new(1);

pub struct NullCpu;

impl Cpu for NullCpu {
    type Context = Cell<usize>;

    fn cores() -> usize {
        1
    }

    fn id() -> usize {
        CURRENT_CORE.load(Ordering::Relaxed)
    }

    unsafe fn switch_context(_prev: &mut Self::Context, _next: &Self::Context) {
        // Single-threaded test harness: there is nothing to actually
        // switch to, tests drive the kernel core directly instead of
        // letting threads really run.
    }

    fn new_context(_entry: extern "C" fn() -> !, _stack: &mut [u8]) -> Self::Context {
        Cell::new(0)
    }

    fn halt() {}

    fn disable_interrupts() -> bool {
        INTERRUPTS_ENABLED.swap(0, Ordering::Relaxed) != 0
    }

    fn restore_interrupts(was_enabled: bool) {
        INTERRUPTS_ENABLED.store(was_enabled as usize, Ordering::Relaxed);
    }

    fn shutdown(_reboot: bool) -> ! {
        panic!("test platform shutdown");
    }
}

pub struct NullIc;

impl InterruptController for NullIc {
    fn send_reschedule_ipi(_cpu: usize) {}
}

pub struct NullTimer;

impl TimerHandle for NullTimer {
    fn restart() {}
}

/// Generic over an unused marker type so that distinct tests can each name
/// a distinct `TestPlatform<M>` — and therefore get their own,
/// independent `Kernel` global (see `kernel::globals`'s per-monomorphization
/// static) instead of racing on one shared instance when tests run
/// concurrently. Also generic over the `Criterion` itself, defaulted to
/// `Priority`, so a test exercising a different policy (e.g. the dynamic
/// demo criterion) can still get the rest of the mock platform for free.
pub struct TestPlatform<M: 'static, C: CriterionTrait = crate::policy::Priority>(
    core::marker::PhantomData<(M, C)>,
);

impl<M: 'static, C: CriterionTrait> Platform for TestPlatform<M, C> {
    type Cpu = NullCpu;
    type Ic = NullIc;
    type Timer = NullTimer;
    type Criterion = C;

    const PREEMPTIVE: bool = false;
    const PARTITIONED: bool = false;
    const PRIORITY_PROTOCOL: Protocol = Protocol::Inherit;
    const REBOOT_ON_SHUTDOWN: bool = false;
}
