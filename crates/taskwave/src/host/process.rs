//! Process-backed contexts.
//!
//! The child is any executable that calls [`crate::context::run_worker`] when
//! it sees the `TASKWAVE_CONTEXT` environment variable. Frames travel over the
//! child's stdin (requests) and stdout (signals); stderr is inherited for logs.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use futures::{SinkExt, StreamExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::{ExecutionContext, ExecutionHost, HostError, SendError, SignalSender};
use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{ContextMessage, ContextRequest, WorkerId};
use crate::context::CONTEXT_ENV;
use crate::program::{Args, Program};

/// Hosts every context in a child process.
#[derive(Debug, Clone)]
pub struct ProcessHost {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl ProcessHost {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Re-execute the running binary as the context process.
    pub fn current_exe() -> io::Result<Self> {
        std::env::current_exe().map(Self::new)
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl ExecutionHost for ProcessHost {
    fn spawn(
        &self,
        worker: WorkerId,
        program: &Program,
        signals: SignalSender,
    ) -> Result<Box<dyn ExecutionContext>, HostError> {
        let image = program.image().ok_or(HostError::MissingImage)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env(CONTEXT_ENV, worker.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("stdout not captured"))?;

        tracing::debug!(%worker, pid = ?child.id(), entry = %image.entry, "Spawned context process");

        let (requests_tx, mut requests_rx) = mpsc::unbounded_channel::<ContextRequest>();
        requests_tx
            .send(ContextRequest::Load { image })
            .map_err(|_| HostError::Closed)?;

        tokio::spawn(async move {
            let mut writer = FramedWrite::new(stdin, JsonCodec::<ContextRequest>::new());
            while let Some(request) = requests_rx.recv().await {
                if let Err(e) = writer.send(request).await {
                    tracing::warn!(%worker, error = %e, "Failed to write to context process");
                    break;
                }
            }
            tracing::trace!(%worker, "Context writer task exiting");
        });

        tokio::spawn(async move {
            let mut reader = FramedRead::new(stdout, JsonCodec::<ContextMessage>::new());
            loop {
                match reader.next().await {
                    Some(Ok(msg)) => {
                        if signals.send(msg).is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!(%worker, error = %e, "Context process sent a bad frame");
                        break;
                    }
                    None => {
                        tracing::debug!(%worker, "Context process closed stdout");
                        break;
                    }
                }
            }
        });

        Ok(Box::new(ProcessContext {
            worker,
            requests: Some(requests_tx),
            child,
        }))
    }
}

struct ProcessContext {
    worker: WorkerId,
    requests: Option<mpsc::UnboundedSender<ContextRequest>>,
    child: Child,
}

impl ExecutionContext for ProcessContext {
    fn send(&mut self, args: Args) -> Result<(), SendError> {
        let Some(requests) = self.requests.as_ref() else {
            return Err(SendError::closed(args));
        };
        requests
            .send(ContextRequest::Call { args })
            .map_err(|mpsc::error::SendError(request)| match request {
                ContextRequest::Call { args } => SendError::closed(args),
                ContextRequest::Load { .. } => SendError::closed(Vec::new()),
            })
    }

    fn terminate(&mut self) {
        self.requests = None;
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(worker = %self.worker, error = %e, "Context process already gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn noop(_args: Args) -> crate::program::CallFuture {
        async { Ok(serde_json::Value::Null) }.boxed()
    }

    #[tokio::test]
    async fn uncatalogued_program_cannot_be_hosted() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = ProcessHost::new("/bin/true")
            .spawn(WorkerId::new(), &Program::direct(noop), tx)
            .err()
            .unwrap();
        assert!(matches!(err, HostError::MissingImage));
    }

    #[tokio::test]
    async fn missing_executable_is_io_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let program = Program::direct(noop).with_entry("noop");
        let err = ProcessHost::new("/nonexistent/taskwave-context")
            .arg("--quiet")
            .env("RUST_LOG", "off")
            .spawn(WorkerId::new(), &program, tx)
            .err()
            .unwrap();
        assert!(matches!(err, HostError::Io(_)));
    }
}
