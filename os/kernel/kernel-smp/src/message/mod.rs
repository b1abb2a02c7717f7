//! # Inter-processor messages
//!
//! Messages live in a slab allocated once when SMP messaging is enabled and
//! are recycled forever after. Each message owns one [`QueueEntry`] per
//! processor, so a single broadcast can sit on every target's queue at the
//! same time without allocating:
//!
//! ```text
//!   Message #7                 entries (flat slab, cpu_count per message)
//!  ┌──────────────────┐       ┌──────────┬──────────┬──────────┬──────────┐
//!  │ kind, refs=3     │ ◄──── │ cpu0     │ cpu1 ─┐  │ cpu2 ─┐  │ cpu3 ─┐  │
//!  │ async, state     │       └──────────┴───────│──┴───────│──┴───────│──┘
//!  └──────────────────┘                          ▼          ▼          ▼
//!                                         cpu1 queue  cpu2 queue  cpu3 queue
//! ```
//!
//! While in the pool only `pool_next` is meaningful; while in flight only
//! `kind`, `refs`, `is_async` and the target entries are.

mod pool;
mod queue;

pub use pool::MessagePool;
pub use queue::MessageQueue;

use crate::addr::{AddressSpaceId, VirtualAddress};
use crate::callback::InlineCallback;
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicU32, AtomicUsize, Ordering};
use kernel_sync::{FreeListLink, StackNode};

/// Payload of an in-flight message.
///
/// Variants clean up after themselves when dropped; resetting the payload to
/// [`MessageKind::Idle`] is the single cleanup path.
#[derive(Debug, Default)]
pub enum MessageKind {
    /// In the pool, or not yet filled in.
    #[default]
    Idle,
    /// Run a callback on every target.
    Callback(InlineCallback),
    /// Invalidate `page_count` pages starting at `vaddr`.
    FlushTlb {
        address_space: AddressSpaceId,
        vaddr: VirtualAddress,
        page_count: usize,
    },
}

const FREE: u8 = 0;
const IN_FLIGHT: u8 = 1;

pub struct Message {
    index: u32,
    kind: UnsafeCell<MessageKind>,
    /// Targets still processing.
    refs: AtomicUsize,
    is_async: AtomicBool,
    state: AtomicU8,
    pool_next: AtomicU32,
}

// Safety: `kind` is written only by the single owner of the message (the
// sender before publication, the releasing processor after the last
// reference is dropped) and shared read-only while in flight.
unsafe impl Sync for Message {}

impl Message {
    fn new(index: u32) -> Self {
        Self {
            index,
            kind: UnsafeCell::new(MessageKind::Idle),
            refs: AtomicUsize::new(0),
            is_async: AtomicBool::new(false),
            state: AtomicU8::new(FREE),
            pool_next: AtomicU32::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index as usize
    }

    /// Outstanding target references.
    #[inline]
    #[must_use]
    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    #[inline]
    #[must_use]
    pub fn is_async(&self) -> bool {
        self.is_async.load(Ordering::Relaxed)
    }

    /// Fills in an acquired message before it is published.
    ///
    /// # Safety
    ///
    /// The caller must own the message: acquired from the pool and not yet
    /// pushed to any queue.
    pub(crate) unsafe fn prepare(&self, kind: MessageKind, refs: usize, is_async: bool) {
        unsafe { *self.kind.get() = kind };
        self.is_async.store(is_async, Ordering::Relaxed);
        self.refs.store(refs, Ordering::Relaxed);
    }

    /// The payload of a published message.
    ///
    /// # Safety
    ///
    /// The caller must hold a reference (be a target that has not yet
    /// released it, or the owner).
    pub(crate) unsafe fn kind(&self) -> &MessageKind {
        unsafe { &*self.kind.get() }
    }

    /// Drops one target reference and returns `true` if it was the last.
    ///
    /// # Panics
    ///
    /// Panics on underflow.
    pub(crate) fn release_ref(&self) -> bool {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "message {} reference count underflow", self.index);
        prev == 1
    }

    /// Resets the payload, dropping whatever it owned.
    ///
    /// # Safety
    ///
    /// The caller must own the message (no target still holds a reference).
    unsafe fn cleanup(&self) {
        unsafe { *self.kind.get() = MessageKind::Idle };
    }

    fn mark(&self, from: u8, to: u8) {
        let prev = self.state.swap(to, Ordering::AcqRel);
        assert_eq!(
            prev, from,
            "message {} is in the wrong pool state",
            self.index
        );
    }
}

impl FreeListLink for Message {
    fn free_link(&self) -> &AtomicU32 {
        &self.pool_next
    }
}

/// Per-target linkage of a message inside one processor's queue.
pub struct QueueEntry {
    message: u32,
    next: AtomicPtr<QueueEntry>,
}

impl QueueEntry {
    const fn new(message: u32) -> Self {
        Self {
            message,
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Index of the message this entry belongs to.
    #[inline]
    #[must_use]
    pub const fn message(&self) -> usize {
        self.message as usize
    }
}

impl StackNode for QueueEntry {
    fn next_link(&self) -> &AtomicPtr<Self> {
        &self.next
    }
}
