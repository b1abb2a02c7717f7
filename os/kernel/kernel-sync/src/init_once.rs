use core::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    sync::atomic::{AtomicU8, Ordering},
};

const EMPTY: u8 = 0;
const WRITING: u8 = 1;
const READY: u8 = 2;

/// A value that is published exactly once and read-only afterwards.
///
/// Unlike a lazily computed cell, the value is produced by the caller ahead
/// of time and handed over with [`try_init`](Self::try_init). Losing the race
/// (or arriving late) hands the value back instead of blocking, which makes
/// the cell safe to use from early boot and interrupt paths.
pub struct InitOnce<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Default for InitOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> InitOnce<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Returns the published value, if any.
    #[inline]
    #[must_use]
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == READY {
            // SAFETY: READY is only stored after the value was written.
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state.load(Ordering::Acquire) == READY
    }

    /// Publishes `value`.
    ///
    /// # Errors
    ///
    /// Returns the value back if the cell is already initialized or another
    /// thread is currently initializing it.
    pub fn try_init(&self, value: T) -> Result<&T, T> {
        if self
            .state
            .compare_exchange(EMPTY, WRITING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(value);
        }

        // SAFETY: WRITING grants exclusive access to the slot.
        let slot = unsafe { (*self.value.get()).write(value) };
        self.state.store(READY, Ordering::Release);
        Ok(slot)
    }
}

impl<T> Drop for InitOnce<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == READY {
            // SAFETY: READY and exclusive access.
            unsafe { self.value.get_mut().assume_init_drop() };
        }
    }
}

// Safety: the value is written once, before READY is published, and only
// shared immutably afterwards.
unsafe impl<T: Sync + Send> Sync for InitOnce<T> {}
unsafe impl<T: Send> Send for InitOnce<T> {}
