//! Bridge between the coordinator and its execution contexts.
//!
//! # Architecture
//!
//! - **protocol**: Message types (ContextRequest, ContextMessage, WorkerId)
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite, used when a
//!   context lives in another process

pub mod codec;
pub mod protocol;
