//! Task handles - the public face of a pool.

use std::borrow::Cow;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::TaskError;
use crate::pool::{Pool, PoolConfig};
use crate::program::{Args, Computation, Preparation, Program};

/// Callable handle to a pool of workers running one program.
///
/// Clones share the pool.
#[derive(Debug, Clone)]
pub struct Task {
    pool: Pool,
}

impl Task {
    /// Build a pool for `program` with full control over host and queueing.
    pub fn spawn(program: Program, config: PoolConfig) -> Result<Self, TaskError> {
        Ok(Self {
            pool: Pool::new(program, config)?,
        })
    }

    /// Dispatch one call with raw JSON arguments.
    pub async fn call(&self, args: Args) -> Result<Value, TaskError> {
        self.pool.dispatch(args).await
    }

    /// Dispatch one call with typed arguments and result.
    ///
    /// `args` must serialize to a JSON array, so pass a tuple, slice or vec.
    pub async fn invoke<A, R>(&self, args: A) -> Result<R, TaskError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let args = match serde_json::to_value(args) {
            Ok(Value::Array(args)) => args,
            Ok(other) => {
                return Err(TaskError::Encoding(format!(
                    "call arguments must encode to a JSON array, got {other}"
                )));
            }
            Err(e) => return Err(TaskError::Encoding(e.to_string())),
        };

        let value = self.call(args).await?;
        serde_json::from_value(value).map_err(|e| TaskError::Encoding(e.to_string()))
    }

    /// Destroy the underlying pool. Pending and in-flight calls fail.
    pub fn destroy(&self) {
        self.pool.destroy();
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

/// Wrap a computation in a pool of `pool_size` thread-hosted workers.
pub fn make_task(
    computation: Computation,
    pool_size: usize,
    allow_overflow: bool,
) -> Result<Task, TaskError> {
    Task::spawn(
        Program::direct(computation),
        PoolConfig::new()
            .with_size(pool_size)
            .with_overflow(allow_overflow),
    )
}

/// Wrap a preparation step. No worker starts until [`PreparedTask::bind`]
/// supplies the preparation arguments.
pub fn make_prepared_task(
    preparation: Preparation,
    pool_size: usize,
    allow_overflow: bool,
) -> PreparedTask {
    PreparedTask {
        preparation,
        entry: None,
        config: PoolConfig::new()
            .with_size(pool_size)
            .with_overflow(allow_overflow),
    }
}

#[derive(Debug, Clone)]
pub struct PreparedTask {
    preparation: Preparation,
    entry: Option<Cow<'static, str>>,
    config: PoolConfig,
}

impl PreparedTask {
    pub fn with_config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Catalog entry name, required when the pool runs on a process host.
    pub fn with_entry(mut self, entry: impl Into<Cow<'static, str>>) -> Self {
        self.entry = Some(entry.into());
        self
    }

    /// Start a pool whose workers each run the preparation once with `args`.
    ///
    /// `args` must encode to a JSON array that round-trips unchanged.
    pub fn bind<A: Serialize + ?Sized>(&self, args: &A) -> Result<Task, TaskError> {
        let mut program = Program::prepared(self.preparation, args)?;
        if let Some(entry) = &self.entry {
            program = program.with_entry(entry.clone());
        }
        Task::spawn(program, self.config.clone())
    }
}
