/*
 * Static-priority criterion.
 *
 * The rank is a fixed numeric priority, lower value wins, with named bands
 * in the EPOS style (`MAIN`/`HIGH`/`NORMAL`/`LOW` tiers). This is the
 * natural criterion for exercising the priority inheritance/ceiling
 * protocol, since `Kernel::prioritize`/`deprioritize` directly mutate a
 * thread's rank and a purely FIFO criterion would make that invisible.
 */

use crate::criterion::{Criterion, CriterionEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority(pub i32);

impl Priority {
    pub const MAIN: Priority = Priority(0);
    pub const HIGH: Priority = Priority(1);
    pub const NORMAL: Priority = Priority(2);
    pub const LOW: Priority = Priority(3);
}

impl Criterion for Priority {
    const IDLE: Self = Priority(i32::MAX);
    const CEILING: Self = Priority(i32::MIN);

    fn on_event(&mut self, _event: CriterionEvent) {}
}
