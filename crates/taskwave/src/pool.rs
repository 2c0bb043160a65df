//! Execution pool - routes calls onto a fixed set of persistent workers.
//!
//! Dispatch order for one call:
//! 1. First idle persistent worker, scanning in index order
//! 2. A temporary worker, when overflow is enabled
//! 3. The pending queue, served as workers become free
//!
//! Pool state lives behind one std mutex that is never held across an await.
//! Lock order is pool state, then worker state.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::bridge::protocol::WorkerId;
use crate::error::TaskError;
use crate::host::{ExecutionHost, ThreadHost};
use crate::program::{Args, Program};
use crate::worker::{CallHandle, StartError, Worker, WorkerKind};

pub const DEFAULT_POOL_SIZE: usize = 8;

/// Which waiter gets a worker when one frees up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueueDiscipline {
    /// Oldest waiter first.
    #[default]
    Fifo,
    /// Newest waiter first.
    Lifo,
}

#[derive(Clone)]
pub struct PoolConfig {
    pub size: usize,
    pub allow_overflow: bool,
    pub discipline: QueueDiscipline,
    pub host: Arc<dyn ExecutionHost>,
}

impl PoolConfig {
    pub fn new() -> Self {
        Self {
            size: DEFAULT_POOL_SIZE,
            allow_overflow: false,
            discipline: QueueDiscipline::default(),
            host: Arc::new(ThreadHost::new()),
        }
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with_overflow(mut self, allow_overflow: bool) -> Self {
        self.allow_overflow = allow_overflow;
        self
    }

    pub fn with_queue_discipline(mut self, discipline: QueueDiscipline) -> Self {
        self.discipline = discipline;
        self
    }

    pub fn with_host(mut self, host: Arc<dyn ExecutionHost>) -> Self {
        self.host = host;
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("size", &self.size)
            .field("allow_overflow", &self.allow_overflow)
            .field("discipline", &self.discipline)
            .finish_non_exhaustive()
    }
}

struct PendingCall {
    args: Args,
    settle: oneshot::Sender<Result<CallHandle, TaskError>>,
}

#[derive(Default)]
struct PoolState {
    destroyed: bool,
    pending: VecDeque<PendingCall>,
    temporaries: HashMap<WorkerId, Worker>,
}

struct PoolInner {
    program: Program,
    host: Arc<dyn ExecutionHost>,
    allow_overflow: bool,
    discipline: QueueDiscipline,
    workers: Vec<Worker>,
    state: StdMutex<PoolState>,
}

enum Route {
    Started(CallHandle),
    Overflow(Args),
    Queued(oneshot::Receiver<Result<CallHandle, TaskError>>),
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Pool state mutex poisoned");
            poisoned.into_inner()
        })
    }

    fn all_workers_lost(&self) -> bool {
        self.workers.iter().all(Worker::is_destroyed)
    }

    fn route(&self, args: Args) -> Result<Route, TaskError> {
        let mut state = self.lock();
        if state.destroyed {
            return Err(TaskError::PoolDestroyed);
        }
        if self.workers.is_empty() && !self.allow_overflow {
            return Err(TaskError::PoolEmpty);
        }

        let mut args = args;
        for worker in self.workers.iter().filter(|w| w.is_idle()) {
            match worker.start(args) {
                Ok(call) => return Ok(Route::Started(call)),
                Err(StartError::Lost { args: returned, .. }) => args = returned,
                Err(StartError::Refused(e)) => return Err(e),
            }
        }
        if self.allow_overflow {
            return Ok(Route::Overflow(args));
        }
        if self.all_workers_lost() {
            self.reject_if_exhausted(&mut state);
            return Err(TaskError::PoolExhausted);
        }

        let (settle, rx) = oneshot::channel();
        state.pending.push_back(PendingCall { args, settle });
        tracing::trace!(queued = state.pending.len(), "Call queued");
        Ok(Route::Queued(rx))
    }

    /// Free listener body: a worker became idle or was lost.
    fn on_worker_free(&self) {
        let mut state = self.lock();
        if state.destroyed {
            return;
        }
        self.hand_off(&mut state);
        self.reject_if_exhausted(&mut state);
    }

    /// Give queued calls to idle workers, scanning in index order.
    fn hand_off(&self, state: &mut PoolState) {
        for worker in &self.workers {
            while worker.is_idle() {
                let next = match self.discipline {
                    QueueDiscipline::Fifo => state.pending.pop_front(),
                    QueueDiscipline::Lifo => state.pending.pop_back(),
                };
                let Some(call) = next else {
                    return;
                };
                if call.settle.is_closed() {
                    tracing::trace!("Skipping abandoned queued call");
                    continue;
                }

                tracing::trace!(worker = %worker.id(), "Handing queued call to freed worker");
                match worker.start(call.args) {
                    Ok(handle) => {
                        let _ = call.settle.send(Ok(handle));
                    }
                    Err(StartError::Lost { args, .. }) => {
                        let call = PendingCall {
                            args,
                            settle: call.settle,
                        };
                        match self.discipline {
                            QueueDiscipline::Fifo => state.pending.push_front(call),
                            QueueDiscipline::Lifo => state.pending.push_back(call),
                        }
                    }
                    Err(StartError::Refused(e)) => {
                        let _ = call.settle.send(Err(e));
                    }
                }
            }
        }
    }

    fn reject_if_exhausted(&self, state: &mut PoolState) {
        if state.pending.is_empty() || !self.all_workers_lost() {
            return;
        }
        tracing::error!(
            rejected = state.pending.len(),
            "Every persistent worker lost, rejecting queued calls"
        );
        for call in state.pending.drain(..) {
            let _ = call.settle.send(Err(TaskError::PoolExhausted));
        }
    }

    fn shutdown(&self) {
        let (pending, temporaries) = {
            let mut state = self.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.temporaries),
            )
        };

        tracing::debug!(
            workers = self.workers.len(),
            temporaries = temporaries.len(),
            queued = pending.len(),
            "Destroying pool"
        );
        for worker in self.workers.iter().chain(temporaries.values()) {
            worker.destroy();
        }
        for call in pending {
            let _ = call.settle.send(Err(TaskError::PoolDestroyed));
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Registration of one overflow worker. Dropping it destroys the worker.
struct TemporaryWorker<'a> {
    pool: &'a PoolInner,
    worker: Worker,
}

impl<'a> TemporaryWorker<'a> {
    fn register(pool: &'a PoolInner, worker: Worker) -> Result<Self, TaskError> {
        {
            let mut state = pool.lock();
            if state.destroyed {
                drop(state);
                worker.destroy();
                return Err(TaskError::PoolDestroyed);
            }
            state.temporaries.insert(worker.id(), worker.clone());
        }
        Ok(Self { pool, worker })
    }
}

impl Drop for TemporaryWorker<'_> {
    fn drop(&mut self) {
        self.pool.lock().temporaries.remove(&self.worker.id());
        self.worker.destroy();
    }
}

/// A set of persistent workers running one program.
///
/// Clones share the pool. Dropping the last handle destroys it.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Spawn `config.size` persistent workers.
    ///
    /// If any spawn fails, the workers already started are destroyed and the
    /// error is returned.
    pub fn new(program: Program, config: PoolConfig) -> Result<Self, TaskError> {
        let mut workers = Vec::with_capacity(config.size);
        for index in 0..config.size {
            match Worker::spawn(&program, config.host.as_ref(), WorkerKind::Persistent) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    tracing::error!(index, error = %e, "Failed to spawn persistent worker");
                    for worker in &workers {
                        worker.destroy();
                    }
                    return Err(e);
                }
            }
        }

        let inner = Arc::new(PoolInner {
            program,
            host: config.host,
            allow_overflow: config.allow_overflow,
            discipline: config.discipline,
            workers,
            state: StdMutex::new(PoolState::default()),
        });

        for worker in &inner.workers {
            let pool = Arc::downgrade(&inner);
            worker.set_free_listener(Arc::new(move || notify_free(&pool)));
        }

        tracing::debug!(
            size = config.size,
            allow_overflow = config.allow_overflow,
            discipline = ?config.discipline,
            "Pool created"
        );
        Ok(Self { inner })
    }

    /// Run one call on the pool and wait for its result.
    pub async fn dispatch(&self, args: Args) -> Result<Value, TaskError> {
        match self.inner.route(args)? {
            Route::Started(call) => call.await,
            Route::Overflow(args) => self.run_on_temporary(args).await,
            Route::Queued(rx) => rx.await.map_err(|_| TaskError::PoolDestroyed)??.await,
        }
    }

    async fn run_on_temporary(&self, args: Args) -> Result<Value, TaskError> {
        let worker = Worker::spawn(
            &self.inner.program,
            self.inner.host.as_ref(),
            WorkerKind::Temporary,
        )?;
        let temporary = TemporaryWorker::register(&self.inner, worker)?;
        tracing::debug!(worker = %temporary.worker.id(), "Overflow call on temporary worker");

        temporary.worker.wait_until_ready().await?;
        temporary.worker.run(args)?.await
    }

    /// Destroy every worker and reject every call still waiting. Idempotent.
    pub fn destroy(&self) {
        self.inner.shutdown();
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().destroyed
    }

    /// Number of persistent workers.
    pub fn size(&self) -> usize {
        self.inner.workers.len()
    }

    /// Persistent workers that are ready with no call in flight.
    pub fn idle(&self) -> usize {
        self.inner.workers.iter().filter(|w| w.is_idle()).count()
    }

    /// Calls waiting for a persistent worker.
    pub fn queued(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Live overflow workers.
    pub fn temporaries(&self) -> usize {
        self.inner.lock().temporaries.len()
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("size", &self.size())
            .field("allow_overflow", &self.inner.allow_overflow)
            .field("discipline", &self.inner.discipline)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

fn notify_free(pool: &Weak<PoolInner>) {
    if let Some(pool) = pool.upgrade() {
        pool.on_worker_free();
    }
}
