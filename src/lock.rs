/*
 * KernelLock - a raw (non-RAII) spinlock.
 *
 * An RAII guard (the usual `spin::Mutex` shape) cannot work here:
 * `dispatch()` releases the kernel lock in the middle of its own call
 * frame, immediately before `switch_context`, and only reacquires it once
 * the thread resumes — which may happen inside a *different* call to
 * `dispatch()` altogether, when this thread is later chosen as `next` by
 * some other core. A guard cannot be carried across that boundary, so the
 * lock itself exposes `lock()`/`unlock()` directly, built on the same
 * `core::sync::atomic` primitive a guard-based spinlock would use.
 */

use core::sync::atomic::{AtomicBool, Ordering};

pub struct KernelLock {
    locked: AtomicBool,
}

impl KernelLock {
    pub const fn new() -> Self {
        KernelLock {
            locked: AtomicBool::new(false),
        }
    }

    /// Spin until the lock is acquired.
    pub fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
    }

    /// Release a lock held by the caller.
    ///
    /// # Safety-by-convention
    /// Not `unsafe` (no memory unsafety results from a spurious unlock),
    /// but callers must only unlock a lock they hold: an unpaired `unlock`
    /// lets a second thread proceed while the first still believes it owns
    /// the critical section.
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Default for KernelLock {
    fn default() -> Self {
        Self::new()
    }
}
