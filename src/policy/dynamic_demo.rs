/*
 * Usage-decay dynamic criterion.
 *
 * Rank is an accumulated tick count: lower wins, matching every other
 * criterion in this module. Unlike `Fcfs`/`Priority`, the rank actually
 * moves in response to the events `dispatch` reports (`is_dynamic() ==
 * true`), so it exercises the `CHARGE`/`LEAVE`/`AWARD`/`ENTER` path
 * `dispatch` drives for a dynamic policy: running costs ticks, being
 * woken back up forgives some of them, so a thread that has run a lot
 * gradually falls behind newer or just-woken threads without ever being
 * reassigned a fixed priority by a caller.
 */

use crate::criterion::{Criterion, CriterionEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DynamicDemo(u32);

impl DynamicDemo {
    pub const fn new() -> Self {
        DynamicDemo(0)
    }

    /// Accumulated tick count, for tests and diagnostics.
    pub fn ticks(&self) -> u32 {
        self.0
    }
}

impl Default for DynamicDemo {
    fn default() -> Self {
        Self::new()
    }
}

impl Criterion for DynamicDemo {
    const IDLE: Self = DynamicDemo(u32::MAX);
    const CEILING: Self = DynamicDemo(0);

    fn is_dynamic(&self) -> bool {
        true
    }

    fn on_event(&mut self, event: CriterionEvent) {
        match event {
            CriterionEvent::Create => self.0 = 0,
            CriterionEvent::Charge => self.0 = self.0.saturating_add(1),
            CriterionEvent::Award => self.0 = self.0.saturating_sub(2),
            CriterionEvent::Enter | CriterionEvent::Leave | CriterionEvent::Finish => {}
        }
    }
}
