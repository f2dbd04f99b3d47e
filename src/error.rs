//! Typed errors for the live session.
//!
//! Connection and device failures are terminal for a session; protocol and
//! tool failures are not, they degrade within the current turn. The session
//! controller relies on that split when deciding whether to tear down.

use thiserror::Error;

/// Errors surfaced by [`crate::session::LiveService`] and its collaborators.
#[derive(Debug, Error)]
pub enum LiveError {
    /// A conversation is already running (or still closing). Exactly one
    /// live session may exist at a time.
    #[error("a conversation is already active")]
    SessionActive,

    /// An audio device could not be acquired or configured.
    #[error("audio device error: {0}")]
    Device(String),

    /// The WebSocket connection could not be established. One attempt per
    /// session; no retry.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The channel's outbound queue is gone (session torn down mid-send).
    #[error("channel closed")]
    ChannelClosed,

    /// Settings could not be written.
    #[error("settings error: {0}")]
    Config(String),
}

/// Failure of a single tool invocation. Converted into an error payload and
/// sent back as the tool response; never fatal to the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}
