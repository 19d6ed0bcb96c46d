mod barrier;
mod error;
mod shmem_data;

pub use barrier::{AwaitOutcome, Barrier};
pub use error::BarrierError;
pub use shmem_data::{ShmemData, shmem_path};
