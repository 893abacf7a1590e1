//! Boundary types for the portmux session layer.
//!
//! This crate defines the contract between the session server and the two
//! collaborators it consumes. It provides:
//!
//! - **Wire types** for request/response envelopes and stream frames
//! - **[`DuplexChannel`] / [`Transport`]**, the abstract channel primitive
//! - **[`ChannelHandler`]**, the application entry point
//! - **[`IpcError`] / [`ErrorPayload`]**, structured errors with stable codes
//! - **[`memory`]**, a queue-backed channel pair for tests and in-process use

pub mod error;
pub mod memory;
pub mod traits;
pub mod types;

pub use error::{ChannelError, ErrorCode, HandlerError, IpcError};
pub use traits::{
    handler_fn, ChannelHandler, DuplexChannel, HandlerFn, HandlerOutput, PayloadStream, Transport,
};
pub use types::*;
