//! Persistent toolchain workers speaking framed JSON over stdio.

pub mod pool;
pub mod process;
pub mod protocol;

pub use pool::{PoolStats, WorkerPool};
pub use process::{WorkerProcess, WorkerSpec};
pub use protocol::{WorkerRequest, WorkerResponse};
