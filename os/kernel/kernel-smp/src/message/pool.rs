use super::{FREE, IN_FLIGHT, Message, QueueEntry};
use alloc::boxed::Box;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_sync::TaggedFreeList;

/// The never-freed slab of messages and their per-target queue entries.
///
/// Acquire and release are lock-free (a tagged compare-exchange loop on the
/// free-list head). A message is either on the free list or in flight, never
/// both; the per-message state flag turns a violation into a panic.
pub struct MessagePool {
    messages: Box<[Message]>,
    entries: Box<[QueueEntry]>,
    cpu_count: usize,
    free: TaggedFreeList,
    available: AtomicUsize,
}

impl MessagePool {
    /// Allocates `size` messages with one queue entry per processor each.
    ///
    /// # Panics
    ///
    /// Panics if the slab is too large to be indexed by `u32`.
    #[must_use]
    pub fn new(size: usize, cpu_count: usize) -> Self {
        let Some(total_entries) = size.checked_mul(cpu_count) else {
            panic!("message pool of {size} x {cpu_count} entries is too large");
        };
        assert!(
            u32::try_from(total_entries).is_ok(),
            "message pool of {total_entries} entries is too large"
        );

        #[allow(clippy::cast_possible_truncation)] // checked above
        let messages: Box<[Message]> = (0..size).map(|i| Message::new(i as u32)).collect();
        #[allow(clippy::cast_possible_truncation)]
        let entries: Box<[QueueEntry]> = (0..total_entries)
            .map(|i| QueueEntry::new((i / cpu_count) as u32))
            .collect();

        let free = TaggedFreeList::new();
        // push in reverse so the lowest index is handed out first
        for i in (0..size).rev() {
            free.push(&messages, i);
        }

        Self {
            messages,
            entries,
            cpu_count,
            free,
            available: AtomicUsize::new(size),
        }
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.messages.len()
    }

    /// Messages currently in the pool; exact only when no processor is
    /// acquiring or releasing.
    #[inline]
    #[must_use]
    pub fn available(&self) -> usize {
        self.available.load(Ordering::Relaxed)
    }

    /// Takes a message if one is free.
    pub fn try_acquire(&self) -> Option<&Message> {
        let index = self.free.try_pop(&self.messages)?;
        let message = &self.messages[index];
        message.mark(FREE, IN_FLIGHT);
        self.available.fetch_sub(1, Ordering::Relaxed);
        Some(message)
    }

    /// Takes a message, calling `on_empty` between attempts while the pool
    /// is exhausted.
    ///
    /// Callers pass a closure that processes their own incoming messages:
    /// every in-flight message is waiting for some processor to drain it,
    /// possibly this one.
    pub fn acquire(&self, mut on_empty: impl FnMut()) -> &Message {
        loop {
            if let Some(message) = self.try_acquire() {
                return message;
            }
            on_empty();
        }
    }

    /// Cleans up `message` and returns it to the pool.
    ///
    /// # Safety
    ///
    /// `message` must belong to this pool, be in flight, and have no target
    /// still holding a reference. Exactly one party (the sender of a
    /// synchronous message, the last receiver of an asynchronous one) may
    /// release a given message.
    pub unsafe fn release(&self, message: &Message) {
        // SAFETY: no references left.
        unsafe { message.cleanup() };
        message.mark(IN_FLIGHT, FREE);
        self.available.fetch_add(1, Ordering::Relaxed);
        self.free.push(&self.messages, message.index());
    }

    /// The message with the given index.
    #[inline]
    #[must_use]
    pub fn message(&self, index: usize) -> &Message {
        &self.messages[index]
    }

    /// `message`'s queue entry for `target`.
    #[inline]
    #[must_use]
    pub fn entry(&self, message: &Message, target: usize) -> &QueueEntry {
        debug_assert!(target < self.cpu_count);
        &self.entries[message.index() * self.cpu_count + target]
    }
}
