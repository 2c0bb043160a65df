//! Execution hosts - where a worker's context actually runs.
//!
//! The pool never decides how contexts are hosted; it is handed an
//! [`ExecutionHost`] once at construction. Two ship with the crate:
//! - **ThreadHost**: a dedicated OS thread driving its own current-thread runtime
//! - **ProcessHost**: a child process speaking the framed bridge protocol

mod process;
mod thread;

#[cfg(test)]
pub(crate) mod testing;

use std::io;

use tokio::sync::mpsc;

use crate::bridge::protocol::{ContextMessage, WorkerId};
use crate::program::{Args, Program};

pub use process::ProcessHost;
pub use thread::ThreadHost;

/// Channel a context uses to signal its worker. Closing it means the context
/// is gone.
pub type SignalSender = mpsc::UnboundedSender<ContextMessage>;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("execution context is closed")]
    Closed,
    #[error("program has no catalog entry; process contexts can only run catalogued programs")]
    MissingImage,
    #[error("no tokio runtime available to drive the context")]
    NoRuntime,
}

/// A call the context could not accept. The arguments are handed back so the
/// caller can route them elsewhere.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct SendError {
    pub args: Args,
    pub error: HostError,
}

impl SendError {
    pub fn closed(args: Args) -> Self {
        Self {
            args,
            error: HostError::Closed,
        }
    }
}

/// Extension point for different context hosting strategies.
pub trait ExecutionHost: Send + Sync {
    /// Start a context running `program`.
    ///
    /// The context must send `Ready` once preparation succeeds, then exactly
    /// one `Result` or `Error` per call it receives.
    fn spawn(
        &self,
        worker: WorkerId,
        program: &Program,
        signals: SignalSender,
    ) -> Result<Box<dyn ExecutionContext>, HostError>;
}

/// Coordinator-side handle to one running context.
pub trait ExecutionContext: Send {
    /// Post one call. Must not block.
    fn send(&mut self, args: Args) -> Result<(), SendError>;

    /// Tear the context down. Signals sent afterwards are discarded.
    fn terminate(&mut self);
}
