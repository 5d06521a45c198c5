//! Crate-level error type.
//!
//! Every fallible operation in the client returns [`Result`]. Variants carry
//! enough context (URL, status, conversation id) to diagnose a failure from a
//! log line alone.

use thiserror::Error;

/// Errors produced by the REST client, the stream pump and the live channel.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server replied with a non-2xx status code.
    #[error("HTTP {status} from {url}: {detail}")]
    Http {
        status: u16,
        url: String,
        detail: String,
    },

    /// The request could not be sent or the body stream broke mid-way.
    #[error("transport failure talking to {url}: {detail}")]
    Transport { url: String, detail: String },

    /// A response body did not have the expected shape.
    #[error("could not decode {what}: {detail}")]
    Decode { what: String, detail: String },

    /// `begin_stream` was called while another stream for the same
    /// conversation still holds its guard.
    #[error("a reply is already streaming into conversation {conversation_id}")]
    StreamActive { conversation_id: String },

    /// The message is not shown in the pane.
    #[error("message {message_id} is not in the open conversation")]
    UnknownMessage { message_id: String },

    /// The user cancelled the stream. Never shown to the user.
    #[error("stream cancelled")]
    Cancelled,

    /// The live channel rejected an operation (e.g. not open).
    #[error("live channel: {0}")]
    Channel(String),

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// `true` when the error is the expected outcome of a user cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ClientError::Cancelled)
    }

    pub(crate) fn transport(url: impl Into<String>, err: impl std::fmt::Display) -> Self {
        ClientError::Transport {
            url: url.into(),
            detail: err.to_string(),
        }
    }

    pub(crate) fn decode(what: impl Into<String>, err: impl std::fmt::Display) -> Self {
        ClientError::Decode {
            what: what.into(),
            detail: err.to_string(),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;
