use super::QueueEntry;
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use kernel_sync::{Chain, IntrusiveStack};

/// A processor's incoming message queue.
///
/// Senders push lock-free from any processor; only the owner drains. The
/// underlying stack is LIFO, so a detached batch is reversed before dispatch,
/// restoring per-sender submission order.
///
/// ```text
///  senders ──push──► stack ──take_all, reverse──► backlog ──next_entry──► dispatch
/// ```
///
/// The undispatched rest of a batch stays in `backlog`. A drain that nests
/// inside a callback (a synchronous send, an exhausted pool) continues it
/// before taking anything newer off the stack.
pub struct MessageQueue {
    stack: IntrusiveStack<QueueEntry>,
    /// Owner-only.
    backlog: UnsafeCell<Chain<QueueEntry>>,
}

impl MessageQueue {
    pub(crate) const fn new() -> Self {
        Self {
            stack: IntrusiveStack::new(),
            backlog: UnsafeCell::new(Chain::empty()),
        }
    }

    /// Enqueues `entry`; `true` means the queue was empty and the owner
    /// needs an interrupt to notice.
    ///
    /// # Safety
    ///
    /// `entry` must be this queue's processor's entry of an in-flight message
    /// holding a reference for this processor.
    pub(crate) unsafe fn push(&self, entry: &QueueEntry) -> bool {
        // SAFETY: pool entries are never freed.
        unsafe { self.stack.push(NonNull::from(entry)) }
    }

    /// The oldest undispatched entry, refilling the backlog from the stack
    /// once it runs dry.
    ///
    /// # Safety
    ///
    /// Owning processor only, interrupts disabled.
    pub(crate) unsafe fn next_entry(&self) -> Option<NonNull<QueueEntry>> {
        // SAFETY: owner-only; the borrow ends before the entry is dispatched.
        let backlog = unsafe { &mut *self.backlog.get() };
        if backlog.is_empty() {
            *backlog = self.stack.take_all().reverse();
        }
        backlog.next()
    }

    /// Whether senders pushed entries not yet detached by the owner.
    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}
