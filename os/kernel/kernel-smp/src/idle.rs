//! # Idle bitmap and wake-up
//!
//! Processors advertise that they are about to idle by setting their bit in a
//! shared mask; a processor with new work claims bits and sends a wake-up
//! interrupt to each processor it claimed. The mask is a hint: a processor may
//! have left idle by the time it is woken (a spurious wake-up is harmless) and
//! two wakers may race for the same bits (the loser wakes fewer).

use crate::SmpRuntime;
use crate::processor::CpuId;
use core::sync::atomic::{AtomicU64, Ordering};
use log::trace;

/// One bit per processor; set while the processor idles.
pub struct IdleMask {
    bits: AtomicU64,
}

impl IdleMask {
    pub(crate) const fn new() -> Self {
        Self {
            bits: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn set(&self, cpu: CpuId) {
        self.bits.fetch_or(1 << cpu, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn clear(&self, cpu: CpuId) {
        self.bits.fetch_and(!(1 << cpu), Ordering::Relaxed);
    }

    /// A snapshot of the mask.
    #[inline]
    #[must_use]
    pub fn load(&self) -> u64 {
        self.bits.load(Ordering::Relaxed)
    }

    /// Clears the bits in `wanted` and returns those this call actually
    /// cleared (some may have been cleared concurrently).
    #[inline]
    fn claim(&self, wanted: u64) -> u64 {
        self.bits.fetch_and(!wanted, Ordering::Relaxed) & wanted
    }
}

/// The lowest `n` set bits of `mask`.
const fn lowest_bits(mut mask: u64, n: u32) -> u64 {
    let mut picked = 0;
    let mut left = n;
    while left > 0 && mask != 0 {
        let bit = mask & mask.wrapping_neg();
        picked |= bit;
        mask &= !bit;
        left -= 1;
    }
    picked
}

impl SmpRuntime {
    /// Marks the calling processor idle.
    pub fn idle_begin(&self) {
        self.idle.set(self.current_id());
    }

    /// Marks the calling processor busy again.
    pub fn idle_end(&self) {
        self.idle.clear(self.current_id());
    }

    /// The idle mask, for diagnostics.
    #[must_use]
    pub fn idle_mask(&self) -> u64 {
        self.idle.load()
    }

    /// Wakes up to `wake_count` idle processors other than the caller and
    /// returns how many it woke.
    ///
    /// Never wakes more than `min(wake_count, idle processors, cpu_count - 1)`
    /// and never the caller. Under contention it may wake fewer than
    /// requested, including none; callers with more work than that simply
    /// call again later.
    pub fn wake_n_idle_processors(&self, wake_count: usize) -> usize {
        if wake_count == 0 || !self.is_smp_enabled() {
            return 0;
        }

        let _critical = self.critical();
        let me = self.current_id();
        let others = u32::try_from(self.cpu_count() - 1).unwrap_or(u32::MAX);
        let mut remaining = u32::try_from(wake_count).unwrap_or(u32::MAX).min(others);
        let mut woken = 0;

        while remaining > 0 {
            let candidates = self.idle.load() & !(1 << me);
            if candidates == 0 {
                break;
            }

            let claimed = self.idle.claim(lowest_bits(candidates, remaining));
            let mut pending = claimed;
            while pending != 0 {
                let cpu = pending.trailing_zeros();
                pending &= pending - 1;
                trace!("CPU {me}: waking idle CPU {cpu}");
                self.platform.send_ipi(cpu);
            }

            // zero if another waker took every bit we picked; look again
            let count = claimed.count_ones();
            woken += count;
            remaining -= count;
        }

        woken as usize
    }
}
