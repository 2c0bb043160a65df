//! Wire protocol types for coordinator-context communication.
//!
//! Calls flow coordinator → context as an ordered argument list. Each context
//! answers with one-way signals: `Ready` once, then exactly one `Result` or
//! `Error` per call. Only one call may be outstanding per context.

use serde::{Deserialize, Serialize};

use crate::program::{Args, ProgramImage};

/// Unique identifier for a worker and the context it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(uuid::Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Messages from coordinator to context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextRequest {
    /// Program to run (must be the first frame a process context receives).
    Load { image: ProgramImage },

    Call { args: Args },
}

/// Signals from context to coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextMessage {
    /// Preparation finished; sent once, before any call is served.
    Ready,

    Result { value: serde_json::Value },

    /// The call (or, before `Ready`, the preparation step) failed.
    Error { error: String },
}

impl ContextMessage {
    pub fn result(value: serde_json::Value) -> Self {
        Self::Result { value }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }
}
