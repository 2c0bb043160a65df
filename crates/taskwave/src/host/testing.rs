//! Scripted host for deterministic worker and pool tests.
//!
//! Contexts record the calls posted to them and only signal when a test tells
//! them to, so every interleaving is under the test's control.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use super::{ExecutionContext, ExecutionHost, HostError, SendError, SignalSender};
use crate::bridge::protocol::{ContextMessage, WorkerId};
use crate::program::{Args, Program};

#[derive(Default)]
pub(crate) struct ScriptedHost {
    contexts: Mutex<Vec<Arc<ScriptedContext>>>,
    auto_ready: bool,
    fail_from: Option<usize>,
}

impl ScriptedHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contexts signal `Ready` as soon as they are spawned.
    pub fn auto_ready() -> Self {
        Self {
            auto_ready: true,
            ..Self::default()
        }
    }

    /// Spawn attempt number `n` (zero-based) and all later ones fail.
    pub fn failing_from(mut self, n: usize) -> Self {
        self.fail_from = Some(n);
        self
    }

    pub fn spawned(&self) -> usize {
        self.contexts.lock().unwrap().len()
    }

    pub fn context(&self, index: usize) -> Arc<ScriptedContext> {
        Arc::clone(&self.contexts.lock().unwrap()[index])
    }
}

impl ExecutionHost for ScriptedHost {
    fn spawn(
        &self,
        worker: WorkerId,
        _program: &Program,
        signals: SignalSender,
    ) -> Result<Box<dyn ExecutionContext>, HostError> {
        let mut contexts = self.contexts.lock().unwrap();
        if self.fail_from.is_some_and(|n| contexts.len() >= n) {
            return Err(HostError::Io(std::io::Error::other("scripted spawn failure")));
        }

        if self.auto_ready {
            signals.send(ContextMessage::Ready).unwrap();
        }
        let context = Arc::new(ScriptedContext {
            worker,
            signals: Mutex::new(Some(signals)),
            calls: Mutex::new(Vec::new()),
            terminations: AtomicUsize::new(0),
            severed: AtomicBool::new(false),
        });
        contexts.push(Arc::clone(&context));
        Ok(Box::new(ScriptedExecution { context }))
    }
}

pub(crate) struct ScriptedContext {
    pub worker: WorkerId,
    signals: Mutex<Option<SignalSender>>,
    calls: Mutex<Vec<Args>>,
    terminations: AtomicUsize,
    severed: AtomicBool,
}

impl ScriptedContext {
    fn signal(&self, msg: ContextMessage) {
        if let Some(signals) = self.signals.lock().unwrap().as_ref() {
            let _ = signals.send(msg);
        }
    }

    pub fn ready(&self) {
        self.signal(ContextMessage::Ready);
    }

    pub fn respond(&self, value: Value) {
        self.signal(ContextMessage::result(value));
    }

    pub fn fail(&self, error: &str) {
        self.signal(ContextMessage::error(error));
    }

    /// Simulate the context dying on its own.
    pub fn crash(&self) {
        self.signals.lock().unwrap().take();
    }

    /// Refuse every later call while signals keep flowing, like a context
    /// whose request pipe broke.
    pub fn sever(&self) {
        self.severed.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Args> {
        self.calls.lock().unwrap().clone()
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }
}

struct ScriptedExecution {
    context: Arc<ScriptedContext>,
}

impl ExecutionContext for ScriptedExecution {
    fn send(&mut self, args: Args) -> Result<(), SendError> {
        if self.context.terminations() > 0 || self.context.severed.load(Ordering::SeqCst) {
            return Err(SendError::closed(args));
        }
        self.context.calls.lock().unwrap().push(args);
        Ok(())
    }

    fn terminate(&mut self) {
        self.context.terminations.fetch_add(1, Ordering::SeqCst);
        self.context.crash();
    }
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached within 2s");
}
