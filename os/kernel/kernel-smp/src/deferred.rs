use crate::callback::InlineCallback;
use alloc::collections::VecDeque;
use core::cell::UnsafeCell;

/// Work a processor postpones until it is about to leave its outermost
/// critical section outside interrupt context (or returns from an interrupt).
///
/// Owner-only: every access happens on the owning processor with interrupts
/// disabled, which is what makes the `UnsafeCell` sound.
pub struct DeferredCallQueue {
    calls: UnsafeCell<VecDeque<InlineCallback>>,
}

impl DeferredCallQueue {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            calls: UnsafeCell::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// # Safety
    ///
    /// Owning processor only, interrupts disabled.
    pub(crate) unsafe fn push(&self, call: InlineCallback) {
        unsafe { (*self.calls.get()).push_back(call) };
    }

    /// # Safety
    ///
    /// Owning processor only, interrupts disabled.
    pub(crate) unsafe fn is_empty(&self) -> bool {
        unsafe { (*self.calls.get()).is_empty() }
    }

    /// Runs pending calls in queue order, including calls queued by the
    /// calls themselves. Returns how many ran.
    ///
    /// # Safety
    ///
    /// Owning processor only, interrupts disabled.
    pub(crate) unsafe fn execute_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            // The borrow ends before the call runs, so a call may queue more.
            let Some(call) = (unsafe { (*self.calls.get()).pop_front() }) else {
                return ran;
            };
            call.invoke();
            ran += 1;
        }
    }
}
