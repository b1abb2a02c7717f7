mod common;

use common::{Sim, SimMachine, avx_features, boot};
use kernel_smp::config::MAX_CPUS;
use kernel_smp::{Capabilities, FpuSaveMode, SmpConfig, SmpError, SmpRuntime};

fn machine(cpus: usize) -> &'static SimMachine {
    Box::leak(Box::new(SimMachine::new(cpus)))
}

fn runtime_for(config: SmpConfig) -> Result<SmpRuntime, SmpError> {
    let m = machine(config.cpu_count.max(1));
    SmpRuntime::new(config, m, m)
}

#[test]
fn rejects_invalid_configurations() {
    assert_eq!(
        runtime_for(SmpConfig::new(0)).err(),
        Some(SmpError::NoProcessors)
    );
    assert_eq!(
        runtime_for(SmpConfig::new(MAX_CPUS + 1)).err(),
        Some(SmpError::TooManyProcessors {
            requested: MAX_CPUS + 1,
            max: MAX_CPUS
        })
    );
    assert_eq!(
        runtime_for(SmpConfig::new(2).with_message_pool_factor(0)).err(),
        Some(SmpError::EmptyMessagePool)
    );
}

#[test]
fn processors_are_initialized_once() {
    let m = machine(2);
    let runtime = SmpRuntime::new(SmpConfig::new(2), m, m).unwrap();
    let caps = Capabilities::new(avx_features(), 46, 48);

    assert!(runtime.processor(1).unwrap().capabilities().is_none());
    assert_eq!(runtime.initialize_processor(1, caps), Ok(()));
    assert_eq!(
        runtime.initialize_processor(1, caps),
        Err(SmpError::AlreadyInitialized(1))
    );
    assert_eq!(
        runtime.initialize_processor(2, caps),
        Err(SmpError::InvalidProcessor(2))
    );

    let published = runtime.processor(1).unwrap().capabilities().unwrap();
    assert_eq!(published.fpu_save_mode(), FpuSaveMode::Xsave);
    assert_eq!(published.physical_address_bits, 46);
}

#[test]
fn enabling_smp_allocates_the_pool_once() {
    let sim = Sim::new(SmpConfig::new(3).with_message_pool_factor(7));
    assert!(!sim.runtime.is_smp_enabled());
    assert!(sim.runtime.message_pool().is_none());

    assert_eq!(sim.runtime.enable_smp(), Ok(()));
    assert!(sim.runtime.is_smp_enabled());
    let pool = sim.runtime.message_pool().unwrap();
    assert_eq!(pool.capacity(), 21);
    assert_eq!(pool.available(), 21);

    assert_eq!(sim.runtime.enable_smp(), Err(SmpError::AlreadyEnabled));
}

struct NoScheduler;

impl kernel_smp::SchedulerHooks for NoScheduler {
    fn invoke_async(&self, _runtime: &SmpRuntime, _cpu: u32) {}
}

#[test]
fn scheduler_attaches_once() {
    let sim = boot(1);
    assert_eq!(sim.runtime.attach_scheduler(&NoScheduler), Ok(()));
    assert_eq!(
        sim.runtime.attach_scheduler(&NoScheduler),
        Err(SmpError::SchedulerAlreadyAttached)
    );
}

#[test]
fn installed_runtime_is_reachable_globally() {
    let sim = boot(2);
    assert_eq!(SmpRuntime::install(sim.runtime), Ok(()));
    assert!(std::ptr::eq(SmpRuntime::global(), sim.runtime));

    let other = boot(1);
    assert_eq!(
        SmpRuntime::install(other.runtime),
        Err(SmpError::AlreadyInstalled)
    );
    assert!(std::ptr::eq(SmpRuntime::global(), sim.runtime));
}

#[test]
fn descriptors_start_quiet() {
    let sim = boot(4);
    assert_eq!(sim.runtime.cpu_count(), 4);
    assert_eq!(sim.runtime.processors().len(), 4);

    for (i, cpu) in sim.runtime.processors().enumerate() {
        assert_eq!(cpu.id() as usize, i);
        assert_eq!(cpu.in_critical(), 0);
        assert_eq!(cpu.in_irq(), 0);
        assert!(!cpu.scheduler_requested());
        assert!(!cpu.halt_requested());
        assert!(!cpu.has_pending_messages());
        assert!(cpu.current_thread().is_null());
        assert!(cpu.idle_thread().is_null());
        assert_eq!(cpu.messages_processed(), 0);
    }
    assert!(sim.runtime.processor(4).is_none());
}

#[test]
fn errors_render_readably() {
    assert_eq!(
        SmpError::TooManyProcessors {
            requested: 65,
            max: 64
        }
        .to_string(),
        "65 processors requested, at most 64 are supported"
    );
}
