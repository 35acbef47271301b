//! Error taxonomy for the protocol engine.
//!
//! Errors split into two severities: those local to one operation
//! (`ResultError`, `Cancelled`) complete only that operation's future, and
//! those that compromise the shared byte stream (`Decode`, `Io`, `Security`,
//! `KindMismatch`, `Disconnected`) close the whole connection and drain every
//! pending future with the same reason.

use crate::protocol::LdapResult;
use thiserror::Error;

/// All failures the engine can surface. `Clone` because one close reason is
/// replayed to every pending operation and to any send attempted after close.
#[derive(Debug, Clone, Error)]
pub enum LdapError {
    /// Malformed or tag-mismatched wire bytes. Fatal to the connection: the
    /// stream position is no longer trustworthy.
    #[error("decode error: {0}")]
    Decode(String),

    /// A structurally valid element with an operation tag outside the known
    /// set. Carries the raw payload for diagnostics.
    #[error("unsupported message with tag 0x{tag:02X} ({n} payload bytes)", n = .raw.len())]
    UnsupportedMessage { tag: u8, raw: Vec<u8> },

    /// A request arrived where the local role expects none.
    #[error("unexpected {kind} request for message id {message_id}")]
    UnexpectedRequest { message_id: i32, kind: &'static str },

    /// A response arrived where none is expected.
    #[error("unexpected {kind} response for message id {message_id}")]
    UnexpectedResponse { message_id: i32, kind: &'static str },

    /// Transport read/write/flush failure. Always closes the connection.
    #[error("i/o error ({kind:?}): {message}")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },

    /// SASL or TLS evaluation, handshake, or wrap/unwrap failure. Always
    /// closes the connection.
    #[error("security layer failure: {0}")]
    Security(String),

    /// The server answered with an exceptional result code. This is a normal
    /// per-operation outcome and does not close the connection.
    #[error("server returned {code}: {diag:?}", code = .0.result_code, diag = .0.diagnostic_message)]
    ResultError(LdapResult),

    /// A response's kind disagrees with the pending entry registered for its
    /// message id. The stream is considered desynchronized; fatal.
    #[error("message id {message_id}: expected a {expected} response, got {got}")]
    KindMismatch {
        message_id: i32,
        expected: &'static str,
        got: &'static str,
    },

    /// The connection is closed; `{0}` renders the original close reason.
    #[error("connection closed: {0}")]
    Closed(String),

    /// The operation was cancelled locally before a response arrived.
    #[error("operation cancelled")]
    Cancelled,

    /// An operation was issued in a state that forbids it (e.g. bind on a
    /// non-quiescent connection, StartTLS with TLS already installed).
    #[error("invalid connection state: {0}")]
    InvalidState(String),

    /// Server-initiated close via the notice-of-disconnection unsolicited
    /// notification. Closes the connection with the embedded result.
    #[error("server disconnected: {code}: {diag:?}", code = .0.result_code, diag = .0.diagnostic_message)]
    Disconnected(LdapResult),
}

impl LdapError {
    pub(crate) fn decode(msg: impl Into<String>) -> Self {
        LdapError::Decode(msg.into())
    }

    pub(crate) fn security(msg: impl Into<String>) -> Self {
        LdapError::Security(msg.into())
    }

    /// Whether this error compromises the shared byte stream and must tear
    /// down the connection, as opposed to completing a single operation.
    pub fn is_fatal_to_connection(&self) -> bool {
        match self {
            LdapError::Decode(_)
            | LdapError::Io { .. }
            | LdapError::Security(_)
            | LdapError::KindMismatch { .. }
            | LdapError::UnexpectedRequest { .. }
            | LdapError::UnexpectedResponse { .. }
            | LdapError::UnsupportedMessage { .. }
            | LdapError::Disconnected(_) => true,
            LdapError::ResultError(_)
            | LdapError::Closed(_)
            | LdapError::Cancelled
            | LdapError::InvalidState(_) => false,
        }
    }
}

impl From<std::io::Error> for LdapError {
    fn from(e: std::io::Error) -> Self {
        LdapError::Io {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}
