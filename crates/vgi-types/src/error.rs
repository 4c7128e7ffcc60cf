//! The error taxonomy shared by both transports.

use std::fmt;
use std::io;

/// An error reported by a remote server, reconstructed from the
/// `log_extra` payload of an EXCEPTION batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    /// The server-side error kind, e.g. `"HandlerError"`.
    pub exception_type: String,
    /// The server-side error message.
    pub exception_message: String,
    /// Server-side backtrace text, when the server captured one.
    pub traceback: Option<String>,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.exception_type, self.exception_message)
    }
}

impl std::error::Error for RemoteError {}

/// Every failure the runtime can surface.
#[derive(Debug)]
pub enum RpcError {
    /// Request malformed, missing metadata, batch-count mismatch,
    /// truncated or tampered token, unknown method.
    Protocol(String),
    /// Request version absent or not `"1"`.
    Version(String),
    /// Handler result missing a required field or shaped wrong for the
    /// declared schema.
    Contract(String),
    /// User-supplied handler, init, header, produce, or exchange failed.
    Handler(String),
    /// Broken pipe or other I/O fault; unrecoverable for the session.
    Transport(io::Error),
    /// A server-side error observed by a client.
    Remote(RemoteError),
}

impl RpcError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        RpcError::Protocol(msg.into())
    }

    pub fn version(msg: impl Into<String>) -> Self {
        RpcError::Version(msg.into())
    }

    pub fn contract(msg: impl Into<String>) -> Self {
        RpcError::Contract(msg.into())
    }

    pub fn handler(msg: impl Into<String>) -> Self {
        RpcError::Handler(msg.into())
    }

    /// The wire name of this error kind, used as the prefix of
    /// `log_message` and as `exception_type` in `log_extra`.
    pub fn kind(&self) -> &str {
        match self {
            RpcError::Protocol(_) => "ProtocolError",
            RpcError::Version(_) => "VersionError",
            RpcError::Contract(_) => "ContractError",
            RpcError::Handler(_) => "HandlerError",
            RpcError::Transport(_) => "TransportError",
            RpcError::Remote(e) => &e.exception_type,
        }
    }

    /// The bare message without the kind prefix.
    pub fn message(&self) -> String {
        match self {
            RpcError::Protocol(m)
            | RpcError::Version(m)
            | RpcError::Contract(m)
            | RpcError::Handler(m) => m.clone(),
            RpcError::Transport(e) => e.to_string(),
            RpcError::Remote(e) => e.exception_message.clone(),
        }
    }

    /// True for faults that terminate the transport session rather than
    /// the current request.
    pub fn is_transport(&self) -> bool {
        matches!(self, RpcError::Transport(_))
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind(), self.message())
    }
}

impl std::error::Error for RpcError {}

impl From<io::Error> for RpcError {
    fn from(e: io::Error) -> Self {
        RpcError::Transport(e)
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::Protocol(format!("json: {e}"))
    }
}

impl From<RemoteError> for RpcError {
    fn from(e: RemoteError) -> Self {
        RpcError::Remote(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_kind() {
        let e = RpcError::version("expected \"1\", got \"7\"");
        assert_eq!(e.to_string(), "VersionError: expected \"1\", got \"7\"");
    }

    #[test]
    fn remote_kind_is_exception_type() {
        let e = RpcError::Remote(RemoteError {
            exception_type: "HandlerError".into(),
            exception_message: "boom".into(),
            traceback: None,
        });
        assert_eq!(e.kind(), "HandlerError");
        assert_eq!(e.message(), "boom");
    }
}
