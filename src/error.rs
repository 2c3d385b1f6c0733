//! Error types for the extmodule client

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type PbxResult<T> = Result<T, PbxError>;

/// All errors surfaced by the PBX session, channels and IVRs.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PbxError {
    /// TCP-level failure while dialing or writing.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration refused to start the session (e.g. port 0).
    #[error("invalid configuration: {message}")]
    Config { message: String },

    /// A line could not be decoded, or an unknown frame type arrived.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// An operation did not complete within its deadline.
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The engine socket went away under an in-flight operation.
    #[error("connection closed")]
    ConnectionClosed,

    /// The session was destroyed; no further operations are possible.
    #[error("PBX session destroyed")]
    Destroyed,

    /// The channel has already terminated (or is unknown to the session).
    #[error("channel {id} is terminated")]
    ChannelTerminated { id: String },

    /// `routed` is set exactly once; a second routing operation failed.
    #[error("channel {id} is already routed")]
    AlreadyRouted { id: String },

    /// A routing operation was attempted on a channel that owes no route reply.
    #[error("channel {id} is not in routing mode")]
    NotRouting { id: String },

    /// The peer relationship is immutable once established.
    #[error("channel {id} already has a peer")]
    AlreadyPeered { id: String },

    /// A fork destination was malformed (no routes, missing host, ...).
    #[error("invalid destination: {message}")]
    InvalidDestination { message: String },

    /// A sound failed validation (relative path, zero-length tone, ...).
    #[error("invalid sound: {message}")]
    InvalidSound { message: String },
}

impl PbxError {
    /// Shorthand for a [`PbxError::Protocol`].
    pub fn protocol(message: impl Into<String>) -> Self {
        PbxError::Protocol {
            message: message.into(),
        }
    }

    /// Shorthand for a [`PbxError::Config`].
    pub fn config(message: impl Into<String>) -> Self {
        PbxError::Config {
            message: message.into(),
        }
    }
}
