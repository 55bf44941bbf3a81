//! Parent/worker control channel.
//!
//! Requests carry a correlation id and resolve exactly one pending call on the
//! sending side; id-less messages are pushes routed by message kind.

pub mod client;
pub mod message;
pub mod push;
pub mod server;
pub mod transport;

use thiserror::Error;
use tokio_util::codec::LinesCodecError;

pub use client::{IpcClient, IPC_CHANNEL_ENV};
pub use message::{kind, Envelope, IdGenerator};
pub use push::{PushHandler, PushRouter};
pub use server::{IpcServer, RequestHandler};

/// Error type for IPC operations
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("Not started as a managed child process; no IPC channel to attach to")]
    NotChildProcess,

    #[error("Request {msg} ({id}) timed out after {timeout_ms} ms")]
    Timeout { msg: String, id: u64, timeout_ms: u64 },

    #[error("{0}")]
    Remote(String),

    #[error("IPC channel is closed")]
    Closed,

    #[error("IPC codec error: {0}")]
    Codec(#[from] LinesCodecError),

    #[error("IPC serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
