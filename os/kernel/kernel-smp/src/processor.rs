//! # Processor descriptor
//!
//! One [`Processor`] exists per CPU, created at boot and never destroyed. The
//! owning CPU is the only writer of almost every field; other processors read
//! the descriptor for diagnostics and push onto its message queue. The two
//! fields other processors write are:
//!
//! - the incoming [`MessageQueue`] head, and
//! - the `halt_requested` flag.
//!
//! Owner-only counters are atomics accessed with `Relaxed` ordering. They are
//! never contended; the atomic type only makes the shared descriptor `Sync`
//! without resorting to `static mut`.

use crate::context::ThreadContext;
use crate::deferred::DeferredCallQueue;
use crate::features::Capabilities;
use crate::message::MessageQueue;
use crate::tss::TaskStateSegment;
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use kernel_sync::InitOnce;

/// Stable processor index, `0..cpu_count`.
pub type CpuId = u32;

#[repr(C, align(64))] // one descriptor per cache line at least
pub struct Processor {
    /// Logical CPU index. Kept first so bare-metal code can load it GS-relative.
    id: CpuId,

    /// Critical-section nesting depth.
    critical_depth: AtomicU32,

    /// Interrupt state captured by the outermost `enter_critical`.
    saved_interrupts: AtomicBool,

    /// Nested interrupt depth.
    irq_depth: AtomicU32,

    /// Reschedule at the next point where both depths drop to zero.
    invoke_scheduler_async: AtomicBool,

    /// Set by any processor to make this one stop after its next drain.
    halt_requested: AtomicBool,

    capabilities: InitOnce<Capabilities>,

    current_thread: AtomicPtr<ThreadContext>,
    idle_thread: AtomicPtr<ThreadContext>,

    /// Incoming messages. Mutated by every other processor.
    pub(crate) queue: MessageQueue,

    pub(crate) deferred: DeferredCallQueue,

    /// Owner-only; `rsp0` follows the running thread's kernel stack.
    task_state: UnsafeCell<TaskStateSegment>,

    /// Copy of `task_state.rsp0` other processors may read.
    kernel_stack: AtomicU64,

    messages_processed: AtomicU64,
}

// Safety: the `UnsafeCell` fields are only accessed by the owning processor
// with interrupts disabled; everything else is atomic.
unsafe impl Sync for Processor {}

impl Processor {
    pub(crate) fn new(id: CpuId, deferred_capacity: usize) -> Self {
        Self {
            id,
            critical_depth: AtomicU32::new(0),
            saved_interrupts: AtomicBool::new(false),
            irq_depth: AtomicU32::new(0),
            invoke_scheduler_async: AtomicBool::new(false),
            halt_requested: AtomicBool::new(false),
            capabilities: InitOnce::new(),
            current_thread: AtomicPtr::new(ptr::null_mut()),
            idle_thread: AtomicPtr::new(ptr::null_mut()),
            queue: MessageQueue::new(),
            deferred: DeferredCallQueue::with_capacity(deferred_capacity),
            task_state: UnsafeCell::new(TaskStateSegment::new()),
            kernel_stack: AtomicU64::new(0),
            messages_processed: AtomicU64::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> CpuId {
        self.id
    }

    /// The capability snapshot, once this processor has been initialized.
    #[inline]
    #[must_use]
    pub fn capabilities(&self) -> Option<&Capabilities> {
        self.capabilities.get()
    }

    pub(crate) fn publish_capabilities(&self, caps: Capabilities) -> bool {
        self.capabilities.try_init(caps).is_ok()
    }

    /// Current critical-section depth.
    #[inline]
    #[must_use]
    pub fn in_critical(&self) -> u32 {
        self.critical_depth.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_critical_depth(&self, depth: u32) {
        self.critical_depth.store(depth, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn saved_interrupts(&self) -> bool {
        self.saved_interrupts.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_saved_interrupts(&self, enabled: bool) {
        self.saved_interrupts.store(enabled, Ordering::Relaxed);
    }

    /// Current interrupt nesting depth.
    #[inline]
    #[must_use]
    pub fn in_irq(&self) -> u32 {
        self.irq_depth.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_irq_depth(&self, depth: u32) {
        self.irq_depth.store(depth, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn request_scheduler(&self) {
        self.invoke_scheduler_async.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn take_scheduler_request(&self) -> bool {
        self.invoke_scheduler_async.swap(false, Ordering::Relaxed)
    }

    /// Whether a reschedule is pending on this processor.
    #[inline]
    #[must_use]
    pub fn scheduler_requested(&self) -> bool {
        self.invoke_scheduler_async.load(Ordering::Relaxed)
    }

    /// Whether some processor asked this one to halt.
    #[inline]
    #[must_use]
    pub fn halt_requested(&self) -> bool {
        self.halt_requested.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn request_halt(&self) {
        self.halt_requested.store(true, Ordering::Release);
    }

    /// The thread running on this processor, or null before context
    /// switching started.
    #[inline]
    #[must_use]
    pub fn current_thread(&self) -> *mut ThreadContext {
        self.current_thread.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_current_thread(&self, thread: *mut ThreadContext) {
        self.current_thread.store(thread, Ordering::Relaxed);
    }

    #[inline]
    #[must_use]
    pub fn idle_thread(&self) -> *mut ThreadContext {
        self.idle_thread.load(Ordering::Relaxed)
    }

    /// Records the thread the scheduler runs when nothing else is ready.
    #[inline]
    pub fn set_idle_thread(&self, thread: *mut ThreadContext) {
        self.idle_thread.store(thread, Ordering::Relaxed);
    }

    /// `rsp0` of this processor's task-state segment.
    #[inline]
    #[must_use]
    pub fn kernel_stack_pointer(&self) -> u64 {
        self.kernel_stack.load(Ordering::Relaxed)
    }

    /// Owner-only, interrupts disabled.
    #[inline]
    pub(crate) fn set_kernel_stack_pointer(&self, top: u64) {
        // SAFETY: owner-only access with interrupts disabled.
        unsafe { (*self.task_state.get()).rsp0 = top };
        self.kernel_stack.store(top, Ordering::Relaxed);
    }

    /// Address of the task-state segment, for the GDT's TSS descriptor.
    #[inline]
    #[must_use]
    pub const fn task_state_ptr(&self) -> *const TaskStateSegment {
        self.task_state.get().cast_const()
    }

    /// Messages this processor has handled so far.
    #[inline]
    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn count_message(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether messages are waiting; racy, for diagnostics.
    #[inline]
    #[must_use]
    pub fn has_pending_messages(&self) -> bool {
        !self.queue.is_empty()
    }
}

impl core::fmt::Debug for Processor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Processor")
            .field("id", &self.id)
            .field("in_critical", &self.in_critical())
            .field("in_irq", &self.in_irq())
            .field("halt_requested", &self.halt_requested())
            .finish_non_exhaustive()
    }
}
