use crate::config::CALLBACK_INLINE_BYTES;
use core::mem::{MaybeUninit, align_of, size_of};

const WORDS: usize = CALLBACK_INLINE_BYTES / size_of::<usize>();

/// A type-erased `Fn()` stored inline, without a heap allocation.
///
/// Messages and deferred calls carry one of these so the messaging hot path
/// never allocates. Closures whose captured state exceeds
/// [`CALLBACK_INLINE_BYTES`](crate::config::CALLBACK_INLINE_BYTES) (or that
/// need more than word alignment) are rejected at compile time.
///
/// The stored closure is dropped exactly once, when the `InlineCallback` is.
pub struct InlineCallback {
    storage: MaybeUninit<[usize; WORDS]>,
    invoke: unsafe fn(*const ()),
    drop: unsafe fn(*mut ()),
}

// Safety: construction requires `F: Send + Sync`.
unsafe impl Send for InlineCallback {}
unsafe impl Sync for InlineCallback {}

unsafe fn invoke_erased<F: Fn()>(f: *const ()) {
    unsafe { (*f.cast::<F>())() }
}

unsafe fn drop_erased<F>(f: *mut ()) {
    unsafe { f.cast::<F>().drop_in_place() }
}

impl InlineCallback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        const {
            assert!(
                size_of::<F>() <= CALLBACK_INLINE_BYTES,
                "callback captures too much state to be stored inline"
            );
            assert!(align_of::<F>() <= align_of::<usize>());
        }

        let mut storage = MaybeUninit::<[usize; WORDS]>::uninit();
        // SAFETY: size and alignment checked above.
        unsafe { storage.as_mut_ptr().cast::<F>().write(f) };
        Self {
            storage,
            invoke: invoke_erased::<F>,
            drop: drop_erased::<F>,
        }
    }

    /// Runs the callback. Broadcast callbacks run concurrently on several
    /// processors through the same shared reference.
    #[inline]
    pub fn invoke(&self) {
        // SAFETY: `storage` holds an `F` matching `invoke`.
        unsafe { (self.invoke)(self.storage.as_ptr().cast()) }
    }
}

impl Drop for InlineCallback {
    fn drop(&mut self) {
        // SAFETY: `storage` holds an `F` matching `drop`, dropped only here.
        unsafe { (self.drop)(self.storage.as_mut_ptr().cast()) }
    }
}

impl core::fmt::Debug for InlineCallback {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("InlineCallback")
    }
}
