//! Worker - owns exactly one execution context.
//!
//! State machine: `Spawning → Idle ⇄ Busy → Destroyed`, where `Destroyed` is
//! terminal and reachable from every state.
//!
//! Signals from the context are pumped by a background task into
//! the worker's message handler. All bookkeeping happens under the worker's mutex;
//! the free listener is always invoked after that mutex is released, so a
//! listener may freely call back into the worker.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use crate::bridge::protocol::{ContextMessage, WorkerId};
use crate::error::TaskError;
use crate::host::{ExecutionContext, ExecutionHost, HostError};
use crate::program::{Args, Program};

/// Called whenever the worker may have become available (ready, call
/// settled) or has been lost.
pub type FreeListener = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// Lives as long as its pool.
    Persistent,
    /// Spawned for a single overflow call, destroyed once it settles.
    Temporary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Spawning,
    Idle,
    Busy,
    Destroyed,
}

impl WorkerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Destroyed => "destroyed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Readiness {
    Pending,
    Ready,
    Failed(String),
    Destroyed,
}

type CallSender = oneshot::Sender<Result<Value, TaskError>>;

struct WorkerState {
    phase: WorkerPhase,
    in_flight: Option<CallSender>,
    free_listener: Option<FreeListener>,
    context: Option<Box<dyn ExecutionContext>>,
}

struct WorkerShared {
    id: WorkerId,
    kind: WorkerKind,
    state: StdMutex<WorkerState>,
    readiness: watch::Sender<Readiness>,
}

impl WorkerShared {
    fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!(worker = %self.id, "Worker state mutex poisoned");
            poisoned.into_inner()
        })
    }
}

impl Drop for WorkerShared {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(mut context) = state.context.take() {
            tracing::debug!(worker = %self.id, "Worker dropped without destroy, terminating context");
            context.terminate();
        }
    }
}

/// Handle to one worker. Clones share the same context.
#[derive(Clone)]
pub struct Worker {
    shared: Arc<WorkerShared>,
}

impl Worker {
    /// Spawn a context for `program` and start pumping its signals.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        program: &Program,
        host: &dyn ExecutionHost,
        kind: WorkerKind,
    ) -> Result<Self, TaskError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| HostError::NoRuntime)?;

        let id = WorkerId::new();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let context = host.spawn(id, program, signals_tx)?;
        let (readiness, _) = watch::channel(Readiness::Pending);

        let shared = Arc::new(WorkerShared {
            id,
            kind,
            state: StdMutex::new(WorkerState {
                phase: WorkerPhase::Spawning,
                in_flight: None,
                free_listener: None,
                context: Some(context),
            }),
            readiness,
        });

        runtime.spawn(pump_signals(Arc::downgrade(&shared), signals_rx));
        tracing::debug!(worker = %id, ?kind, "Worker spawned");

        Ok(Self { shared })
    }

    pub fn id(&self) -> WorkerId {
        self.shared.id
    }

    pub fn kind(&self) -> WorkerKind {
        self.shared.kind
    }

    pub fn phase(&self) -> WorkerPhase {
        self.shared.lock().phase
    }

    /// Ready and no call in flight. The pool's dispatch scan relies on this
    /// predicate and nothing else.
    pub fn is_idle(&self) -> bool {
        let state = self.shared.lock();
        state.phase == WorkerPhase::Idle && state.in_flight.is_none()
    }

    pub fn is_destroyed(&self) -> bool {
        self.phase() == WorkerPhase::Destroyed
    }

    /// Install the listener fired when the worker becomes free or is lost.
    ///
    /// Returns `false` (and drops the listener) if the worker is already
    /// destroyed.
    pub fn set_free_listener(&self, listener: FreeListener) -> bool {
        let mut state = self.shared.lock();
        if state.phase == WorkerPhase::Destroyed {
            return false;
        }
        state.free_listener = Some(listener);
        true
    }

    /// Resolves once the context has signalled `Ready`.
    pub async fn wait_until_ready(&self) -> Result<(), TaskError> {
        let mut readiness = self.shared.readiness.subscribe();
        let outcome = readiness
            .wait_for(|r| *r != Readiness::Pending)
            .await
            .map_err(|_| TaskError::WorkerDestroyed)?
            .clone();

        match outcome {
            Readiness::Ready => Ok(()),
            Readiness::Failed(error) => Err(TaskError::Startup(error)),
            Readiness::Destroyed => Err(TaskError::WorkerDestroyed),
            Readiness::Pending => Err(TaskError::WorkerNotReady),
        }
    }

    /// Start one call. Fails immediately, without contacting the context, if
    /// the worker is destroyed, not yet ready, or busy.
    ///
    /// A context that refuses the call is dead: the worker is destroyed and
    /// the call fails with `ContextLost`.
    pub fn run(&self, args: Args) -> Result<CallHandle, TaskError> {
        self.start(args).map_err(|e| match e {
            StartError::Lost { error, .. } => TaskError::ContextLost(error),
            StartError::Refused(e) => e,
        })
    }

    /// Like [`Worker::run`], but hands the arguments back when the context
    /// turns out to be dead so the call can go to another worker.
    ///
    /// The free listener is not fired for a loss found here; the caller
    /// already knows.
    pub(crate) fn start(&self, args: Args) -> Result<CallHandle, StartError> {
        let mut state = self.shared.lock();
        match state.phase {
            WorkerPhase::Destroyed => return Err(StartError::Refused(TaskError::WorkerDestroyed)),
            WorkerPhase::Spawning => return Err(StartError::Refused(TaskError::WorkerNotReady)),
            WorkerPhase::Busy => return Err(StartError::Refused(TaskError::WorkerBusy)),
            WorkerPhase::Idle => {}
        }

        let Some(context) = state.context.as_mut() else {
            return Err(StartError::Refused(TaskError::WorkerDestroyed));
        };
        if let Err(rejected) = context.send(args) {
            drop(state);
            let error = rejected.error.to_string();
            let _ = self.retire(TaskError::ContextLost(error.clone()));
            return Err(StartError::Lost {
                args: rejected.args,
                error,
            });
        }

        let (tx, rx) = oneshot::channel();
        state.phase = WorkerPhase::Busy;
        state.in_flight = Some(tx);
        tracing::trace!(worker = %self.shared.id, "Call started");

        Ok(CallHandle {
            worker: self.shared.id,
            rx,
        })
    }

    /// Tear the worker down. An in-flight call is rejected with
    /// `WorkerDestroyed` before the context is terminated.
    pub fn destroy(&self) {
        let (in_flight, context) = {
            let mut state = self.shared.lock();
            if state.phase == WorkerPhase::Destroyed {
                return;
            }
            state.phase = WorkerPhase::Destroyed;
            state.free_listener = None;
            (state.in_flight.take(), state.context.take())
        };

        if let Some(call) = in_flight {
            let _ = call.send(Err(TaskError::WorkerDestroyed));
        }
        self.shared.readiness.send_replace(Readiness::Destroyed);
        if let Some(mut context) = context {
            context.terminate();
        }
        tracing::debug!(worker = %self.shared.id, kind = ?self.shared.kind, "Worker destroyed");
    }

    fn on_message(&self, msg: ContextMessage) {
        match msg {
            ContextMessage::Ready => self.on_ready(),
            ContextMessage::Result { value } => self.settle(Ok(value)),
            ContextMessage::Error { error } => {
                if self.phase() == WorkerPhase::Spawning {
                    self.fail(TaskError::Startup(error));
                } else {
                    self.settle(Err(TaskError::Computation(error)));
                }
            }
        }
    }

    fn on_ready(&self) {
        let listener = {
            let mut state = self.shared.lock();
            if state.phase != WorkerPhase::Spawning {
                tracing::warn!(
                    worker = %self.shared.id,
                    phase = state.phase.as_str(),
                    "Ready signal outside startup, ignoring"
                );
                return;
            }
            state.phase = WorkerPhase::Idle;
            state.free_listener.clone()
        };

        self.shared.readiness.send_replace(Readiness::Ready);
        tracing::debug!(worker = %self.shared.id, "Worker ready");
        if let Some(listener) = listener {
            listener();
        }
    }

    fn settle(&self, result: Result<Value, TaskError>) {
        let (call, listener) = {
            let mut state = self.shared.lock();
            if state.phase != WorkerPhase::Busy {
                tracing::warn!(
                    worker = %self.shared.id,
                    phase = state.phase.as_str(),
                    "Call signal with no call in flight, ignoring"
                );
                return;
            }
            state.phase = WorkerPhase::Idle;
            (state.in_flight.take(), state.free_listener.clone())
        };

        tracing::trace!(worker = %self.shared.id, ok = result.is_ok(), "Call settled");
        if let Some(call) = call
            && call.send(result).is_err()
        {
            tracing::debug!(worker = %self.shared.id, "Caller stopped waiting for result");
        }
        if let Some(listener) = listener {
            listener();
        }
    }

    /// The context failed on its own (bad preparation, exited, crashed).
    fn fail(&self, reason: TaskError) {
        if let Some(listener) = self.retire(reason) {
            listener();
        }
    }

    /// Mark the worker lost and tear its context down. Returns the free
    /// listener for the caller to fire, or `None` if already destroyed.
    fn retire(&self, reason: TaskError) -> Option<FreeListener> {
        let (call, context, listener) = {
            let mut state = self.shared.lock();
            if state.phase == WorkerPhase::Destroyed {
                return None;
            }
            state.phase = WorkerPhase::Destroyed;
            (
                state.in_flight.take(),
                state.context.take(),
                state.free_listener.take(),
            )
        };

        tracing::warn!(worker = %self.shared.id, kind = ?self.shared.kind, error = %reason, "Worker lost");
        let readiness = match &reason {
            TaskError::Startup(error) => Readiness::Failed(error.clone()),
            other => Readiness::Failed(other.to_string()),
        };
        self.shared.readiness.send_replace(readiness);

        if let Some(call) = call {
            let _ = call.send(Err(reason));
        }
        if let Some(mut context) = context {
            context.terminate();
        }
        listener
    }
}

/// Why [`Worker::start`] did not start a call.
pub(crate) enum StartError {
    /// The context refused the call; the worker is now destroyed.
    Lost { args: Args, error: String },
    Refused(TaskError),
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.shared.id)
            .field("kind", &self.shared.kind)
            .field("phase", &self.phase())
            .finish()
    }
}

async fn pump_signals(
    shared: Weak<WorkerShared>,
    mut signals: mpsc::UnboundedReceiver<ContextMessage>,
) {
    while let Some(msg) = signals.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        Worker { shared }.on_message(msg);
    }

    if let Some(shared) = shared.upgrade() {
        Worker { shared }.fail(TaskError::ContextLost(
            "context closed its signal channel".to_string(),
        ));
    }
}

/// Result of one accepted call.
#[must_use = "a call handle does nothing unless awaited"]
pub struct CallHandle {
    worker: WorkerId,
    rx: oneshot::Receiver<Result<Value, TaskError>>,
}

impl CallHandle {
    /// Worker the call was started on.
    pub fn worker(&self) -> WorkerId {
        self.worker
    }
}

impl Future for CallHandle {
    type Output = Result<Value, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(TaskError::WorkerDestroyed)))
    }
}
