use shared_memory::ShmemError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BarrierError {
    #[error("barrier is broken (timeout or explicit break elsewhere observed it first)")]
    Broken,
    #[error("await timed out before the barrier tripped")]
    TimedOut,
    #[error("await was interrupted by a signal before the barrier tripped")]
    Interrupted,
    #[error("underlying shared memory segment could not be created or opened")]
    Shmem(#[from] ShmemError),
    #[error("SysV semaphore operation failed: {0}")]
    Sem(#[source] std::io::Error),
}
