//! Protocol constants and configuration values

/// Default Event Socket port for inbound connections
pub const DEFAULT_ESL_PORT: u16 = 8021;

/// Socket buffer size for reading from the TCP stream (64KB)
pub const SOCKET_BUF_SIZE: usize = 65536;

/// Maximum single message size (8MB) - validates Content-Length header.
/// No legitimate ESL message should exceed this.
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Maximum total parse buffer size (16MB) - safety limit to prevent runaway
/// memory. Should hold 2 max messages + overhead.
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Protocol message terminators
pub const HEADER_TERMINATOR: &str = "\n\n";
pub const HEADER_TERMINATOR_CRLF: &str = "\r\n\r\n";
pub const LINE_TERMINATOR: &str = "\n";

/// Content-Type header values
pub const CONTENT_TYPE_AUTH_REQUEST: &str = "auth/request";
pub const CONTENT_TYPE_COMMAND_REPLY: &str = "command/reply";
pub const CONTENT_TYPE_API_RESPONSE: &str = "api/response";
pub const CONTENT_TYPE_TEXT_EVENT_PLAIN: &str = "text/event-plain";
pub const CONTENT_TYPE_TEXT_EVENT_JSON: &str = "text/event-json";
pub const CONTENT_TYPE_LOG_DATA: &str = "log/data";
pub const CONTENT_TYPE_DISCONNECT_NOTICE: &str = "text/disconnect-notice";
pub const CONTENT_TYPE_RUDE_REJECTION: &str = "text/rude-rejection";

/// Content types whose body is an opaque payload, never split into
/// extra event headers.
pub const BODY_EXEMPT_CONTENT_TYPES: [&str; 3] = [
    CONTENT_TYPE_API_RESPONSE,
    CONTENT_TYPE_RUDE_REJECTION,
    CONTENT_TYPE_LOG_DATA,
];

/// Protocol framing header names (not event payload).
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
/// Protocol framing header: body length.
pub const HEADER_CONTENT_LENGTH: &str = "Content-Length";
/// Protocol framing header: command reply status.
pub const HEADER_REPLY_TEXT: &str = "Reply-Text";
/// Protocol framing header: disconnect disposition.
pub const HEADER_CONTENT_DISPOSITION: &str = "Content-Disposition";

/// Prefix carried by channel-variable headers in events.
pub const VARIABLE_PREFIX: &str = "variable_";

/// TCP connect / auth handshake timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Router queue poll interval so the shutdown signal is observed while idle
pub const ROUTER_POLL_MS: u64 = 100;
