//! Error taxonomy for pools, workers, and the calls they carry.

use crate::host::HostError;

/// Every way a dispatched call (or the pool around it) can fail.
///
/// Computation failures are local to one call. Destruction failures are
/// broadcast to every call the destroyed pool or worker owned.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// Dispatch on a pool with no persistent workers and overflow disabled.
    #[error("Pool is empty.")]
    PoolEmpty,

    #[error("Pool destroyed.")]
    PoolDestroyed,

    /// Every persistent worker has been lost and overflow is disabled.
    #[error("Pool exhausted: no persistent worker is alive")]
    PoolExhausted,

    #[error("Worker destroyed.")]
    WorkerDestroyed,

    #[error("Worker is not ready.")]
    WorkerNotReady,

    /// A call was handed to a worker that already has one in flight.
    /// Only a dispatcher bookkeeping fault can produce this.
    #[error("Worker is already in use.")]
    WorkerBusy,

    /// Whatever the computation itself returned as an error (or panicked with).
    #[error("{0}")]
    Computation(String),

    /// The preparation step failed, so the worker never became ready.
    #[error("worker startup failed: {0}")]
    Startup(String),

    /// The execution context went away without being destroyed.
    #[error("execution context lost: {0}")]
    ContextLost(String),

    #[error("failed to spawn execution context: {0}")]
    Spawn(#[from] HostError),

    #[error("invalid program: {0}")]
    InvalidProgram(String),

    /// Arguments or results did not fit the expected JSON shape.
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl TaskError {
    pub fn computation(message: impl Into<String>) -> Self {
        Self::Computation(message.into())
    }

    pub fn invalid_program(message: impl Into<String>) -> Self {
        Self::InvalidProgram(message.into())
    }

    /// True for errors raised because a pool or worker was torn down.
    pub fn is_destroyed(&self) -> bool {
        matches!(self, Self::PoolDestroyed | Self::WorkerDestroyed)
    }
}
