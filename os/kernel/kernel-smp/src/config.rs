//! # SMP configuration
//!
//! Compile-time limits of the multiprocessor core and the boot-time
//! [`SmpConfig`] the kernel hands to [`SmpRuntime::new`](crate::SmpRuntime::new).

use crate::error::SmpError;

/// Highest supported processor count; the idle bitmap is one `u64`.
pub const MAX_CPUS: usize = 64;

/// Pooled messages allocated per processor when SMP messaging is enabled.
pub const MESSAGE_POOL_FACTOR: usize = 100;

/// Deferred calls reserved per processor before the queue has to grow.
pub const DEFERRED_CALL_CAPACITY: usize = 5;

/// Upper bound of the random offset applied below a new thread's kernel stack top.
pub const STACK_RANDOMIZATION_MAX: u64 = 256;

/// Stack alignment required at function entry boundaries.
pub const STACK_ALIGNMENT: u64 = 16;

/// Bytes available for a callback's captured state inside a message.
pub const CALLBACK_INLINE_BYTES: usize = 64;

const _: () = {
    assert!(MAX_CPUS <= u64::BITS as usize);
    assert!(STACK_ALIGNMENT.is_power_of_two());
    assert!(STACK_RANDOMIZATION_MAX.is_multiple_of(STACK_ALIGNMENT));
    assert!(CALLBACK_INLINE_BYTES.is_multiple_of(size_of::<usize>()));
};

/// Boot-time parameters of the SMP core.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SmpConfig {
    /// Number of processors brought up by the platform.
    pub cpu_count: usize,
    /// Messages per processor in the pool.
    pub message_pool_factor: usize,
    /// Pre-reserved deferred call slots per processor.
    pub deferred_call_capacity: usize,
}

impl SmpConfig {
    #[must_use]
    pub const fn new(cpu_count: usize) -> Self {
        Self {
            cpu_count,
            message_pool_factor: MESSAGE_POOL_FACTOR,
            deferred_call_capacity: DEFERRED_CALL_CAPACITY,
        }
    }

    #[must_use]
    pub const fn with_message_pool_factor(mut self, factor: usize) -> Self {
        self.message_pool_factor = factor;
        self
    }

    #[must_use]
    pub const fn with_deferred_call_capacity(mut self, capacity: usize) -> Self {
        self.deferred_call_capacity = capacity;
        self
    }

    /// Total number of pooled messages.
    #[must_use]
    pub const fn message_pool_size(&self) -> usize {
        self.cpu_count * self.message_pool_factor
    }

    /// Checks the configuration against the core's limits.
    ///
    /// # Errors
    ///
    /// * [`SmpError::NoProcessors`] for a zero processor count,
    /// * [`SmpError::TooManyProcessors`] above [`MAX_CPUS`],
    /// * [`SmpError::EmptyMessagePool`] for a zero pool factor.
    pub const fn validate(&self) -> Result<(), SmpError> {
        if self.cpu_count == 0 {
            return Err(SmpError::NoProcessors);
        }
        if self.cpu_count > MAX_CPUS {
            return Err(SmpError::TooManyProcessors {
                requested: self.cpu_count,
                max: MAX_CPUS,
            });
        }
        if self.message_pool_factor == 0 {
            return Err(SmpError::EmptyMessagePool);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pool_is_hundred_per_cpu() {
        let cfg = SmpConfig::new(4);
        assert_eq!(cfg.message_pool_size(), 400);
        assert_eq!(cfg.validate(), Ok(()));
    }

    #[test]
    fn rejects_out_of_range_configurations() {
        assert_eq!(SmpConfig::new(0).validate(), Err(SmpError::NoProcessors));
        assert_eq!(
            SmpConfig::new(MAX_CPUS + 1).validate(),
            Err(SmpError::TooManyProcessors {
                requested: MAX_CPUS + 1,
                max: MAX_CPUS
            })
        );
        assert_eq!(
            SmpConfig::new(2).with_message_pool_factor(0).validate(),
            Err(SmpError::EmptyMessagePool)
        );
        assert_eq!(SmpConfig::new(MAX_CPUS).validate(), Ok(()));
    }
}
