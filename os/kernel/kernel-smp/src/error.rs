use crate::processor::CpuId;

/// Boot-time failures of the SMP core.
///
/// Everything past boot treats a broken invariant as fatal instead; these are
/// the only recoverable errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SmpError {
    #[error("at least one processor is required")]
    NoProcessors,
    #[error("{requested} processors requested, at most {max} are supported")]
    TooManyProcessors { requested: usize, max: usize },
    #[error("the message pool must hold at least one message per processor")]
    EmptyMessagePool,
    #[error("processor {0} does not exist")]
    InvalidProcessor(CpuId),
    #[error("processor {0} is already initialized")]
    AlreadyInitialized(CpuId),
    #[error("SMP messaging is already enabled")]
    AlreadyEnabled,
    #[error("a scheduler is already attached")]
    SchedulerAlreadyAttached,
    #[error("a global SMP runtime is already installed")]
    AlreadyInstalled,
}
