use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// A slot that can sit on a [`TaggedFreeList`].
pub trait FreeListLink {
    /// Link to the next free slot, encoded as `index + 1` (`0` terminates).
    fn free_link(&self) -> &AtomicU32;
}

/// Encoded "no slot".
const NIL: u32 = 0;

/// A lock-free LIFO free list of slot indices into a fixed slab.
///
/// The head packs a modification tag into the upper 32 bits and the encoded
/// slot (`index + 1`) into the lower 32 bits:
///
/// ```text
///  63              32 31               0
/// ┌──────────────────┬──────────────────┐
/// │       tag        │   index + 1      │
/// └──────────────────┴──────────────────┘
/// ```
///
/// Every successful push or pop bumps the tag, so a pop that read `A → B`
/// and was delayed while `A` was popped, `B` was popped and `A` was pushed
/// back fails its compare-exchange instead of installing the stale `B`.
///
/// The list never owns the slab; callers pass the same slab to every call.
pub struct TaggedFreeList {
    head: AtomicU64,
}

impl Default for TaggedFreeList {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
#[allow(clippy::cast_lossless)]
const fn pack(tag: u32, slot: u32) -> u64 {
    ((tag as u64) << 32) | slot as u64
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn unpack(head: u64) -> (u32, u32) {
    ((head >> 32) as u32, head as u32)
}

impl TaggedFreeList {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: AtomicU64::new(pack(0, NIL)),
        }
    }

    /// Returns slot `index` to the list.
    ///
    /// # Panics
    ///
    /// Panics if `index` is outside `slab` or not representable.
    pub fn push<T: FreeListLink>(&self, slab: &[T], index: usize) {
        assert!(index < slab.len(), "free list slot {index} out of range");
        let Ok(encoded) = u32::try_from(index + 1) else {
            panic!("free list slot {index} exceeds the encodable range");
        };
        let link = slab[index].free_link();

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let (tag, top) = unpack(head);
            link.store(top, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                pack(tag.wrapping_add(1), encoded),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Takes a slot off the list, or `None` if it is empty.
    pub fn try_pop<T: FreeListLink>(&self, slab: &[T]) -> Option<usize> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let (tag, top) = unpack(head);
            if top == NIL {
                return None;
            }

            let index = (top - 1) as usize;
            // May race with a concurrent re-push of this slot; the tag then
            // makes the exchange below fail and we retry with fresh values.
            let next = slab[index].free_link().load(Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                pack(tag.wrapping_add(1), next),
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(index),
                Err(actual) => head = actual,
            }
        }
    }

    /// A racy snapshot.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        unpack(self.head.load(Ordering::Relaxed)).1 == NIL
    }
}
