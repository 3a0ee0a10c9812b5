//! Crate-wide error type.

use crate::variables::Variables;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type EslResult<T> = Result<T, EslError>;

/// Errors surfaced by the session engine.
///
/// The enum is `Clone` so a resolved-once result cell can hand the same
/// outcome to every observer; `std::io::Error` is not `Clone`, so transport
/// failures store the rendered message.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum EslError {
    /// TCP read/write failure (peer reset, broken pipe, ...).
    #[error("I/O error: {0}")]
    Io(String),

    /// Operation attempted before the session was started or after it
    /// stopped.
    #[error("not connected")]
    NotConnected,

    /// The connection closed while a reply or pending operation was
    /// outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    /// Connect, auth or reply wait exceeded its window.
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The switch rejected our credentials.
    #[error("authentication failed: {reason}")]
    AuthFailed { reason: String },

    /// The byte stream no longer parses as Event Socket framing.
    #[error("protocol error: {message}")]
    ProtocolError { message: String },

    /// A header line could not be parsed.
    #[error("invalid header: {header}")]
    InvalidHeader { header: String },

    /// Content-Length exceeded the configured maximum message size.
    #[error("message of {length} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { length: usize, limit: usize },

    /// Operation attempted on a leg that already hung up or was destroyed.
    #[error("channel {uuid} is gone")]
    ChannelGone { uuid: String },

    /// The switch answered a command with `-ERR ...`.
    #[error("command failed: {reply_text}")]
    CommandFailed { reply_text: String },

    /// An execute-class command was interrupted by hangup/destroy of its leg
    /// before the completion event arrived.
    #[error("execution {app_uuid} interrupted by hangup on channel {channel_uuid}")]
    Interrupted {
        app_uuid: String,
        channel_uuid: String,
    },

    /// An originate attempt failed; carries the destination and the
    /// variables that were attempted.
    #[error("originate to {destination} failed: {reason}")]
    Originate {
        destination: String,
        variables: Variables,
        reason: String,
    },
}

impl EslError {
    /// Shorthand for a [`EslError::ProtocolError`].
    pub fn protocol_error(message: impl Into<String>) -> Self {
        EslError::ProtocolError {
            message: message.into(),
        }
    }

    /// Shorthand for a [`EslError::AuthFailed`].
    pub fn auth_failed(reason: impl Into<String>) -> Self {
        EslError::AuthFailed {
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for EslError {
    fn from(e: std::io::Error) -> Self {
        EslError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for EslError {
    fn from(e: serde_json::Error) -> Self {
        EslError::ProtocolError {
            message: format!("invalid JSON event body: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupted_carries_both_ids() {
        let err = EslError::Interrupted {
            app_uuid: "event-123".into(),
            channel_uuid: "channel-456".into(),
        };
        let text = err.to_string();
        assert!(text.contains("event-123"));
        assert!(text.contains("channel-456"));
    }

    #[test]
    fn originate_carries_destination_and_variables() {
        let mut vars = Variables::new();
        vars.insert("caller_id", "123");
        let err = EslError::Originate {
            destination: "user/1000".into(),
            variables: vars.clone(),
            reason: "-ERR NO_ROUTE".into(),
        };
        match err {
            EslError::Originate {
                destination,
                variables,
                ..
            } => {
                assert_eq!(destination, "user/1000");
                assert_eq!(variables, vars);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn io_errors_are_cloneable() {
        let err: EslError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        let cloned = err.clone();
        assert!(cloned.to_string().contains("pipe"));
    }
}
