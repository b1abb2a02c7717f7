//! # SMP runtime
//!
//! [`SmpRuntime`] owns every piece of shared multiprocessor state: the
//! processor table, the message pool, the idle bitmap and the hooks into the
//! platform, the context-switch layer and the scheduler.
//!
//! Lifecycle:
//!
//! 1. [`SmpRuntime::new`] on the bootstrap processor,
//! 2. [`SmpRuntime::initialize_processor`] once per processor during its
//!    early bring-up,
//! 3. [`SmpRuntime::enable_smp`] once all processors are online,
//! 4. optionally [`SmpRuntime::install`] to make it reachable from interrupt
//!    trampolines through [`SmpRuntime::global`].
//!
//! There is no teardown.

use crate::config::SmpConfig;
use crate::context::ContextSwitch;
use crate::error::SmpError;
use crate::features::Capabilities;
use crate::idle::IdleMask;
use crate::message::MessagePool;
use crate::platform::Platform;
use crate::processor::{CpuId, Processor};
use crate::scheduler::SchedulerHooks;
use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_sync::InitOnce;
use log::info;

pub struct SmpRuntime {
    pub(crate) config: SmpConfig,
    pub(crate) platform: &'static dyn Platform,
    pub(crate) switcher: &'static dyn ContextSwitch,
    pub(crate) scheduler: InitOnce<&'static dyn SchedulerHooks>,
    pub(crate) processors: Box<[Processor]>,
    pub(crate) pool: InitOnce<MessagePool>,
    pub(crate) idle: IdleMask,
    smp_enabled: AtomicBool,
}

static GLOBAL: InitOnce<&'static SmpRuntime> = InitOnce::new();

impl SmpRuntime {
    /// Builds the processor table for `config.cpu_count` processors.
    ///
    /// # Errors
    ///
    /// Returns the configuration error reported by [`SmpConfig::validate`].
    pub fn new(
        config: SmpConfig,
        platform: &'static dyn Platform,
        switcher: &'static dyn ContextSwitch,
    ) -> Result<Self, SmpError> {
        config.validate()?;

        #[allow(clippy::cast_possible_truncation)] // bounded by MAX_CPUS
        let processors = (0..config.cpu_count)
            .map(|id| Processor::new(id as CpuId, config.deferred_call_capacity))
            .collect();

        Ok(Self {
            config,
            platform,
            switcher,
            scheduler: InitOnce::new(),
            processors,
            pool: InitOnce::new(),
            idle: IdleMask::new(),
            smp_enabled: AtomicBool::new(false),
        })
    }

    /// Publishes the capability snapshot of processor `cpu`.
    ///
    /// # Errors
    ///
    /// [`SmpError::InvalidProcessor`] for an unknown id,
    /// [`SmpError::AlreadyInitialized`] on a second call for the same id.
    pub fn initialize_processor(&self, cpu: CpuId, caps: Capabilities) -> Result<(), SmpError> {
        let processor = self
            .processors
            .get(cpu as usize)
            .ok_or(SmpError::InvalidProcessor(cpu))?;
        if !processor.publish_capabilities(caps) {
            return Err(SmpError::AlreadyInitialized(cpu));
        }

        info!(
            "CPU {cpu}: FPU save mode {:?}, {} physical / {} virtual address bits",
            caps.fpu_save_mode(),
            caps.physical_address_bits,
            caps.virtual_address_bits
        );
        Ok(())
    }

    /// Allocates the message pool and turns on inter-processor messaging.
    ///
    /// # Errors
    ///
    /// [`SmpError::AlreadyEnabled`] on a second call.
    pub fn enable_smp(&self) -> Result<(), SmpError> {
        let size = self.config.message_pool_size();
        let pool = MessagePool::new(size, self.cpu_count());
        if self.pool.try_init(pool).is_err() {
            return Err(SmpError::AlreadyEnabled);
        }
        self.smp_enabled.store(true, Ordering::Release);

        info!(
            "SMP messaging enabled: {} processors, {size} pooled messages",
            self.cpu_count()
        );
        Ok(())
    }

    /// Connects the scheduler. Until then reschedule requests stay pending.
    ///
    /// # Errors
    ///
    /// [`SmpError::SchedulerAlreadyAttached`] on a second call.
    pub fn attach_scheduler(&self, hooks: &'static dyn SchedulerHooks) -> Result<(), SmpError> {
        self.scheduler
            .try_init(hooks)
            .map(|_| ())
            .map_err(|_| SmpError::SchedulerAlreadyAttached)
    }

    /// Makes `runtime` reachable through [`SmpRuntime::global`].
    ///
    /// # Errors
    ///
    /// [`SmpError::AlreadyInstalled`] if a runtime was installed before.
    pub fn install(runtime: &'static Self) -> Result<(), SmpError> {
        GLOBAL
            .try_init(runtime)
            .map(|_| info!("SMP runtime installed"))
            .map_err(|_| SmpError::AlreadyInstalled)
    }

    /// The installed runtime.
    ///
    /// # Panics
    ///
    /// Panics if [`SmpRuntime::install`] has not run yet.
    #[must_use]
    pub fn global() -> &'static Self {
        match Self::try_global() {
            Some(runtime) => runtime,
            None => panic!("SMP runtime used before it was installed"),
        }
    }

    #[must_use]
    pub fn try_global() -> Option<&'static Self> {
        GLOBAL.get().copied()
    }

    #[inline]
    #[must_use]
    pub fn is_smp_enabled(&self) -> bool {
        self.smp_enabled.load(Ordering::Acquire)
    }

    #[inline]
    #[must_use]
    pub fn cpu_count(&self) -> usize {
        self.processors.len()
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> &SmpConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn platform(&self) -> &'static dyn Platform {
        self.platform
    }

    /// The calling processor's descriptor.
    #[inline]
    #[must_use]
    pub fn current(&self) -> &Processor {
        &self.processors[self.platform.current_cpu() as usize]
    }

    #[inline]
    #[must_use]
    pub fn current_id(&self) -> CpuId {
        self.platform.current_cpu()
    }

    #[inline]
    #[must_use]
    pub fn processor(&self, cpu: CpuId) -> Option<&Processor> {
        self.processors.get(cpu as usize)
    }

    pub fn processors(&self) -> impl ExactSizeIterator<Item = &Processor> {
        self.processors.iter()
    }

    /// The message pool, once SMP messaging is enabled.
    #[inline]
    #[must_use]
    pub fn message_pool(&self) -> Option<&MessagePool> {
        self.pool.get()
    }

    pub(crate) fn pool(&self) -> &MessagePool {
        match self.pool.get() {
            Some(pool) => pool,
            None => panic!("SMP messaging used before enable_smp"),
        }
    }
}
