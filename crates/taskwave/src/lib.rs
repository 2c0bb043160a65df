//! taskwave: offload computations into isolated worker contexts.
//!
//! A [`Task`] owns a [`Pool`] of persistent workers, each driving one
//! execution context (a thread or a child process). Calls go to the first
//! idle worker, overflow onto temporary workers when allowed, and otherwise
//! wait in a queue.

pub mod bridge;
pub mod context;
pub mod host;
pub mod pool;
pub mod program;
pub mod worker;

mod error;
mod task;

pub use error::TaskError;
pub use host::{ExecutionContext, ExecutionHost, HostError, ProcessHost, SendError, ThreadHost};
pub use pool::{DEFAULT_POOL_SIZE, Pool, PoolConfig, QueueDiscipline};
pub use program::{
    Args, CallFuture, Catalog, Computation, Preparation, PreparedComputation, Program,
    ProgramImage, TaskDefinition,
};
pub use task::{PreparedTask, Task, make_prepared_task, make_task};
pub use worker::{CallHandle, Worker, WorkerKind, WorkerPhase};

pub use futures::future::BoxFuture;
