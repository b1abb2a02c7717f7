use crate::SmpRuntime;
use crate::context::ThreadContext;
use crate::processor::CpuId;

/// Entry points the SMP core calls back into the scheduler.
///
/// Scheduling policy lives entirely on the other side of this trait.
pub trait SchedulerHooks: Sync {
    /// A reschedule was requested on `cpu` and the processor just reached a
    /// point where it may switch: no interrupt and no critical section.
    fn invoke_async(&self, runtime: &SmpRuntime, cpu: CpuId);

    /// `thread` runs for the very first time, still inside the critical
    /// section of the switch that brought it in.
    fn on_first_switch(&self, runtime: &SmpRuntime, thread: *mut ThreadContext) {
        let _ = (runtime, thread);
    }
}
