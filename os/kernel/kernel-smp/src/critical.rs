//! # Critical sections
//!
//! A critical section keeps the current thread on its processor: interrupts
//! are masked and the scheduler does not run until the outermost section is
//! left. Sections nest through a per-processor depth counter.
//!
//! Leaving the outermost section (outside interrupt context) is the point
//! where postponed work catches up, in this order:
//!
//! 1. pending deferred calls run,
//! 2. the depth drops to zero,
//! 3. a pending asynchronous reschedule runs,
//! 4. the interrupt state captured on entry is restored.

use crate::SmpRuntime;
use crate::callback::InlineCallback;
use log::trace;

/// Leaves the critical section it entered when dropped.
#[must_use = "the critical section ends when the guard is dropped"]
pub struct CriticalGuard<'a> {
    runtime: &'a SmpRuntime,
}

impl Drop for CriticalGuard<'_> {
    fn drop(&mut self) {
        self.runtime.leave_critical();
    }
}

impl SmpRuntime {
    /// Enters a (possibly nested) critical section on the calling processor.
    pub fn enter_critical(&self) {
        // mask first: once interrupts are off this thread cannot migrate
        let were_enabled = self.platform.interrupts_enabled();
        self.platform.disable_interrupts();

        let cpu = self.current();
        let depth = cpu.in_critical();
        if depth == 0 {
            cpu.set_saved_interrupts(were_enabled);
        }
        cpu.set_critical_depth(depth + 1);
    }

    /// Leaves one level of critical section.
    ///
    /// # Panics
    ///
    /// Panics if the calling processor is not in a critical section.
    pub fn leave_critical(&self) {
        self.platform.disable_interrupts();
        let cpu = self.current();
        let depth = cpu.in_critical();
        assert!(depth > 0, "CPU {}: leave_critical without enter_critical", cpu.id());

        if depth > 1 {
            cpu.set_critical_depth(depth - 1);
            return;
        }

        // read before the scheduler gets a chance to run on this processor
        let restore = cpu.saved_interrupts();
        if cpu.in_irq() == 0 {
            // SAFETY: owning processor, interrupts disabled.
            unsafe { cpu.deferred.execute_pending() };
            assert_eq!(
                cpu.in_critical(),
                1,
                "CPU {}: deferred call left the critical depth unbalanced",
                cpu.id()
            );
        }

        cpu.set_critical_depth(0);
        if cpu.in_irq() == 0 {
            self.check_invoke_scheduler();
        }

        if restore {
            self.platform.enable_interrupts();
        }
    }

    /// Current critical depth of the calling processor.
    #[must_use]
    pub fn in_critical(&self) -> u32 {
        self.current().in_critical()
    }

    /// Enters a critical section for the lifetime of the returned guard.
    pub fn critical(&self) -> CriticalGuard<'_> {
        self.enter_critical();
        CriticalGuard { runtime: self }
    }

    /// Drops the calling processor out of every critical section level and
    /// returns the previous depth for [`restore_critical`](Self::restore_critical).
    ///
    /// Interrupts stay disabled; a pending reschedule runs if not in an IRQ.
    #[must_use = "the previous depth has to be restored"]
    pub fn clear_critical(&self) -> u32 {
        self.platform.disable_interrupts();
        let cpu = self.current();
        let prev = cpu.in_critical();
        cpu.set_critical_depth(0);
        if cpu.in_irq() == 0 {
            self.check_invoke_scheduler();
        }
        prev
    }

    /// Reinstates a depth returned by [`clear_critical`](Self::clear_critical).
    pub fn restore_critical(&self, depth: u32) {
        self.platform.disable_interrupts();
        self.current().set_critical_depth(depth);
    }

    /// Queues `call` to run on this processor once it leaves its outermost
    /// critical section outside interrupt context, or on interrupt exit.
    ///
    /// Called outside any critical section and IRQ, `call` runs before this
    /// returns.
    pub fn deferred_call_queue<F>(&self, call: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let _critical = self.critical();
        let cpu = self.current();
        trace!("CPU {}: deferred call queued", cpu.id());
        // SAFETY: owning processor, interrupts disabled.
        unsafe { cpu.deferred.push(InlineCallback::new(call)) };
    }

    /// Runs pending deferred calls now; returns how many ran.
    ///
    /// Must be called with interrupts disabled.
    pub(crate) fn execute_deferred_calls(&self) -> usize {
        let cpu = self.current();
        // SAFETY: owning processor, interrupts disabled.
        if unsafe { cpu.deferred.is_empty() } {
            return 0;
        }
        unsafe { cpu.deferred.execute_pending() }
    }
}
