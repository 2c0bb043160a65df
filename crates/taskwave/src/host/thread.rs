//! Thread-backed contexts.
//!
//! Each context gets its own OS thread and current-thread tokio runtime, so a
//! CPU-heavy computation never blocks the coordinator's runtime. The program
//! reaches the thread as a cloned [`Program`]; nothing else is shared.

use std::io;

use tokio::sync::mpsc;

use super::{ExecutionContext, ExecutionHost, HostError, SendError, SignalSender};
use crate::bridge::protocol::{ContextMessage, WorkerId};
use crate::context;
use crate::program::{Args, Program};

/// Hosts every context on a dedicated thread.
///
/// Terminating a context cannot interrupt a computation that is already
/// running: the thread exits only once that computation returns. A
/// computation that never returns keeps its thread for the life of the
/// process. Use [`super::ProcessHost`] for untrusted or unbounded work, where
/// termination kills the child.
#[derive(Debug, Clone, Default)]
pub struct ThreadHost {
    stack_size: Option<usize>,
}

impl ThreadHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }
}

impl ExecutionHost for ThreadHost {
    fn spawn(
        &self,
        worker: WorkerId,
        program: &Program,
        signals: SignalSender,
    ) -> Result<Box<dyn ExecutionContext>, HostError> {
        let (calls_tx, calls_rx) = mpsc::unbounded_channel::<Args>();
        let program = program.clone();

        let mut builder = std::thread::Builder::new().name(format!("taskwave-{worker}"));
        if let Some(bytes) = self.stack_size {
            builder = builder.stack_size(bytes);
        }
        builder.spawn(move || run_thread_context(worker, program, calls_rx, signals))?;

        tracing::trace!(%worker, "Spawned context thread");
        Ok(Box::new(ThreadContext {
            worker,
            calls: Some(calls_tx),
        }))
    }
}

fn run_thread_context(
    worker: WorkerId,
    program: Program,
    mut calls_rx: mpsc::UnboundedReceiver<Args>,
    signals: SignalSender,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(%worker, error = %e, "Failed to build context runtime");
            let _ = signals.send(ContextMessage::error(format!(
                "failed to start context runtime: {e}"
            )));
            return;
        }
    };

    let calls = futures::stream::poll_fn(move |cx| calls_rx.poll_recv(cx));
    let sink = futures::sink::unfold(signals, |signals, msg: ContextMessage| async move {
        signals.send(msg).map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, "worker stopped listening")
        })?;
        Ok::<_, io::Error>(signals)
    });

    match runtime.block_on(context::serve(&program, calls, sink)) {
        Ok(()) => tracing::trace!(%worker, "Context thread exiting"),
        Err(e) => tracing::debug!(%worker, error = %e, "Context thread stopped early"),
    }
}

struct ThreadContext {
    worker: WorkerId,
    calls: Option<mpsc::UnboundedSender<Args>>,
}

impl ExecutionContext for ThreadContext {
    fn send(&mut self, args: Args) -> Result<(), SendError> {
        let Some(calls) = self.calls.as_ref() else {
            return Err(SendError::closed(args));
        };
        calls
            .send(args)
            .map_err(|mpsc::error::SendError(args)| SendError::closed(args))
    }

    /// A running computation cannot be preempted; closing the call channel
    /// lets the thread exit once it finishes.
    fn terminate(&mut self) {
        if self.calls.take().is_some() {
            tracing::trace!(worker = %self.worker, "Closed context call channel");
        }
    }
}
