//! Wire-frame parsing: byte stream in, complete events out.

use crate::buffer::EslBuffer;
use crate::constants::{
    BODY_EXEMPT_CONTENT_TYPES, CONTENT_TYPE_API_RESPONSE, CONTENT_TYPE_AUTH_REQUEST,
    CONTENT_TYPE_COMMAND_REPLY, CONTENT_TYPE_DISCONNECT_NOTICE, CONTENT_TYPE_LOG_DATA,
    CONTENT_TYPE_RUDE_REJECTION, CONTENT_TYPE_TEXT_EVENT_JSON, CONTENT_TYPE_TEXT_EVENT_PLAIN,
    HEADER_CONTENT_LENGTH, HEADER_CONTENT_TYPE, HEADER_TERMINATOR, MAX_MESSAGE_SIZE,
};
use crate::error::{EslError, EslResult};
use crate::event::{EslEvent, HeaderValue};
use percent_encoding::percent_decode_str;
use tracing::debug;

/// Frame classification derived from the Content-Type header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MessageType {
    /// Authentication challenge from the switch.
    AuthRequest,
    /// Synchronous command reply.
    CommandReply,
    /// Blocking API response.
    ApiResponse,
    /// Asynchronous event (plain, JSON or forwarded log data).
    Event,
    /// Disconnect or rejection notice.
    Disconnect,
    /// Anything else.
    Unknown(String),
}

impl MessageType {
    pub(crate) fn from_content_type(content_type: &str) -> Self {
        match content_type {
            CONTENT_TYPE_AUTH_REQUEST => MessageType::AuthRequest,
            CONTENT_TYPE_COMMAND_REPLY => MessageType::CommandReply,
            CONTENT_TYPE_API_RESPONSE => MessageType::ApiResponse,
            CONTENT_TYPE_TEXT_EVENT_PLAIN | CONTENT_TYPE_TEXT_EVENT_JSON
            | CONTENT_TYPE_LOG_DATA => MessageType::Event,
            CONTENT_TYPE_DISCONNECT_NOTICE | CONTENT_TYPE_RUDE_REJECTION => {
                MessageType::Disconnect
            }
            other => MessageType::Unknown(other.to_string()),
        }
    }
}

#[derive(Debug)]
enum ParseState {
    Headers,
    Body { event: EslEvent, length: usize },
}

/// Incremental frame parser.
///
/// Feed raw bytes with [`add_data`](Self::add_data), then drain complete
/// frames with [`parse_frame`](Self::parse_frame). One frame usually yields
/// one event; a lock-bundled frame yields several, in wire order.
#[derive(Debug)]
pub(crate) struct EslParser {
    buffer: EslBuffer,
    state: ParseState,
}

impl EslParser {
    pub(crate) fn new() -> Self {
        Self {
            buffer: EslBuffer::new(),
            state: ParseState::Headers,
        }
    }

    pub(crate) fn add_data(&mut self, data: &[u8]) -> EslResult<()> {
        self.buffer.extend_from_slice(data);
        self.buffer.check_size_limits()
    }

    /// Try to parse one complete frame from buffered data.
    ///
    /// Returns `Ok(None)` until enough bytes have arrived.
    pub(crate) fn parse_frame(&mut self) -> EslResult<Option<Vec<EslEvent>>> {
        loop {
            match std::mem::replace(&mut self.state, ParseState::Headers) {
                ParseState::Headers => {
                    let Some(block) = self.buffer.extract_header_block() else {
                        return Ok(None);
                    };
                    self.buffer.compact();

                    let text = String::from_utf8_lossy(&block);
                    let event = parse_header_block(&text);
                    if event.headers().is_empty() {
                        continue;
                    }

                    // Every framed message carries Content-Type; its absence
                    // means the stream is out of sync (e.g. a corrupted
                    // Content-Length consumed part of the next frame).
                    if event.header(HEADER_CONTENT_TYPE).is_none() {
                        return Err(EslError::protocol_error(
                            "missing Content-Type header, stream is out of sync",
                        ));
                    }

                    if let Some(raw) = event.header(HEADER_CONTENT_LENGTH) {
                        let length: usize =
                            raw.trim().parse().map_err(|_| EslError::InvalidHeader {
                                header: format!("{HEADER_CONTENT_LENGTH}: {raw}"),
                            })?;
                        if length > MAX_MESSAGE_SIZE {
                            return Err(EslError::MessageTooLarge {
                                length,
                                limit: MAX_MESSAGE_SIZE,
                            });
                        }
                        if length > 0 {
                            self.state = ParseState::Body { event, length };
                            continue;
                        }
                    }

                    return Ok(Some(vec![event]));
                }
                ParseState::Body { event, length } => {
                    let Some(bytes) = self.buffer.extract_bytes(length) else {
                        self.state = ParseState::Body { event, length };
                        return Ok(None);
                    };
                    self.buffer.compact();
                    let body = String::from_utf8_lossy(&bytes).into_owned();
                    return finish_body(event, body).map(Some);
                }
            }
        }
    }
}

impl Default for EslParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse one `Key: value` block into an event.
///
/// Values are percent-decoded; a repeated key converts its slot to a list
/// preserving arrival order; a line without a `": "` separator continues the
/// previous value.
pub(crate) fn parse_header_block(text: &str) -> EslEvent {
    let mut entries: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once(": ") {
            entries.push((key.trim().to_string(), value.trim().to_string()));
        } else if let Some(last) = entries.last_mut() {
            last.1.push('\n');
            last.1.push_str(line.trim());
        }
    }

    let mut event = EslEvent::new();
    for (key, value) in entries {
        event.append_header(key, decode_value(&value));
    }
    event
}

fn decode_value(raw: &str) -> String {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

/// Attach a frame body to its event, splitting out extra event headers and
/// bundled sub-events where the content type allows it.
fn finish_body(mut event: EslEvent, body: String) -> EslResult<Vec<EslEvent>> {
    let content_type = event.content_type().map(str::to_string);
    match content_type.as_deref() {
        Some(CONTENT_TYPE_TEXT_EVENT_JSON) => {
            parse_json_into(&mut event, &body)?;
            Ok(vec![event])
        }
        Some(ct) if !BODY_EXEMPT_CONTENT_TYPES.contains(&ct) => Ok(split_plain_body(event, &body)),
        _ => {
            event.set_body(body);
            Ok(vec![event])
        }
    }
}

/// Split a body into extra headers + remaining body.
///
/// When the extra-header block carries `event-lock: true` it may contain
/// several concatenated event header blocks; each `Event-Name:`-led segment
/// after the first becomes an independent event inheriting the framing
/// headers and sharing the remaining body.
fn split_plain_body(mut event: EslEvent, body: &str) -> Vec<EslEvent> {
    let Some(pos) = body.find(HEADER_TERMINATOR) else {
        event.set_body(body);
        return vec![event];
    };
    let headers_part = &body[..pos];
    let rest = &body[pos + HEADER_TERMINATOR.len()..];

    let mut segments = headers_part.split("\nEvent-Name: ");
    let first = segments.next().unwrap_or_default();

    let bundled: Vec<&str> = if headers_part.to_lowercase().contains("event-lock: true") {
        segments.collect()
    } else {
        Vec::new()
    };

    let first_block = if bundled.is_empty() {
        headers_part
    } else {
        first
    };
    event.merge(&parse_header_block(first_block));
    if !rest.is_empty() {
        event.set_body(rest);
    }

    if bundled.is_empty() {
        return vec![event];
    }

    let inherited: Vec<(&str, HeaderValue)> = [HEADER_CONTENT_LENGTH, HEADER_CONTENT_TYPE]
        .into_iter()
        .filter_map(|name| event.header_values(name).map(|value| (name, value.clone())))
        .collect();

    let mut events = Vec::with_capacity(1 + bundled.len());
    events.push(event);
    for segment in bundled {
        let mut sub = parse_header_block(&format!("Event-Name: {segment}"));
        for (name, value) in &inherited {
            sub.set_header_slot(*name, value.clone());
        }
        if !rest.is_empty() {
            sub.set_body(rest);
        }
        events.push(sub);
    }
    debug!(count = events.len(), "split locked frame into bundled events");
    events
}

/// Decode a JSON event body into headers; the `_body` key becomes the body.
fn parse_json_into(event: &mut EslEvent, body: &str) -> EslResult<()> {
    let value: serde_json::Value = serde_json::from_str(body)?;
    if let Some(object) = value.as_object() {
        for (key, entry) in object {
            let text = match entry {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if key == "_body" {
                event.set_body(text);
            } else {
                event.set_header(key.clone(), text);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EslEventType;

    fn parse_all(data: &[u8]) -> Vec<EslEvent> {
        let mut parser = EslParser::new();
        parser.add_data(data).unwrap();
        let mut events = Vec::new();
        while let Some(mut frame) = parser.parse_frame().unwrap() {
            events.append(&mut frame);
        }
        events
    }

    fn plain_event_frame(event_headers: &str) -> Vec<u8> {
        let envelope = format!(
            "Content-Length: {}\nContent-Type: text/event-plain\n\n",
            event_headers.len()
        );
        let mut data = envelope.into_bytes();
        data.extend_from_slice(event_headers.as_bytes());
        data
    }

    #[test]
    fn parses_auth_request_without_body() {
        let events = parse_all(b"Content-Type: auth/request\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].content_type(), Some("auth/request"));
        assert!(events[0].body().is_none());
    }

    #[test]
    fn parses_api_response_body_as_opaque_payload() {
        // api/response is exempt from header splitting even when the body
        // looks like headers.
        let body = "Key: value\n\ntrailing";
        let data = format!(
            "Content-Type: api/response\nContent-Length: {}\n\n{}",
            body.len(),
            body
        );
        let events = parse_all(data.as_bytes());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].body(), Some(body));
        assert_eq!(events[0].header("Key"), None);
    }

    #[test]
    fn plain_event_body_headers_merge_into_event() {
        let data = plain_event_frame("Event-Name: CHANNEL_ANSWER\nUnique-ID: leg-1\n\n");
        let events = parse_all(&data);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), Some(EslEventType::ChannelAnswer));
        assert_eq!(events[0].unique_id(), Some("leg-1"));
        assert!(events[0].body().is_none());
    }

    #[test]
    fn plain_event_inner_body_is_preserved() {
        let inner = "+OK Status\n";
        let headers = format!(
            "Event-Name: BACKGROUND_JOB\nJob-UUID: job-1\nContent-Length: {}\n\n{}",
            inner.len(),
            inner
        );
        let data = plain_event_frame(&headers);
        let events = parse_all(&data);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), Some(EslEventType::BackgroundJob));
        assert_eq!(events[0].job_uuid(), Some("job-1"));
        assert_eq!(events[0].body(), Some(inner));
    }

    #[test]
    fn repeated_header_key_parses_to_ordered_list() {
        let event = parse_header_block("X-Multi: one\nX-Multi: two\nX-Single: only");
        match event.header_values("X-Multi").unwrap() {
            HeaderValue::List(values) => assert_eq!(values, &["one", "two"]),
            other => panic!("expected list, got {other:?}"),
        }
        assert!(matches!(
            event.header_values("X-Single").unwrap(),
            HeaderValue::Scalar(_)
        ));
    }

    #[test]
    fn percent_encoded_values_are_decoded() {
        let data = plain_event_frame(
            "Event-Name: HEARTBEAT\nUp-Time: 0%20years%2C%200%20days\nEvent-Info: System%20Ready\n\n",
        );
        let events = parse_all(&data);
        assert_eq!(events[0].header("Up-Time"), Some("0 years, 0 days"));
        assert_eq!(events[0].header("Event-Info"), Some("System Ready"));
    }

    #[test]
    fn invalid_percent_sequence_falls_back_to_raw() {
        let event = parse_header_block("X-Bad: %ZZinvalid\nX-Good: clean");
        assert_eq!(event.header("X-Bad"), Some("%ZZinvalid"));
        assert_eq!(event.header("X-Good"), Some("clean"));
    }

    #[test]
    fn continuation_line_extends_previous_value() {
        let event = parse_header_block("X-Long: first\nsecond part\nX-Next: value");
        assert_eq!(event.header("X-Long"), Some("first\nsecond part"));
        assert_eq!(event.header("X-Next"), Some("value"));
    }

    #[test]
    fn locked_frame_splits_into_two_events_with_inherited_headers() {
        let body = "Event-Name: CHANNEL_EXECUTE\nUnique-ID: leg-1\nevent-lock: true\n\
                    Event-Name: CHANNEL_EXECUTE_COMPLETE\nUnique-ID: leg-1\n\nshared body";
        let data = plain_event_frame(body);
        let events = parse_all(&data);
        assert_eq!(events.len(), 2);

        assert_eq!(events[0].event_type(), Some(EslEventType::ChannelExecute));
        assert_eq!(
            events[1].event_type(),
            Some(EslEventType::ChannelExecuteComplete)
        );
        for event in &events {
            assert_eq!(event.content_type(), Some("text/event-plain"));
            assert!(event.header("Content-Length").is_some());
            assert_eq!(event.body(), Some("shared body"));
        }
        assert_eq!(events[1].unique_id(), Some("leg-1"));
    }

    #[test]
    fn unlocked_frame_with_two_header_blocks_stays_one_event() {
        let body = "Event-Name: CHANNEL_EXECUTE\nUnique-ID: leg-1\n\
                    Event-Name: CHANNEL_EXECUTE_COMPLETE\n\n";
        let data = plain_event_frame(body);
        let events = parse_all(&data);
        assert_eq!(events.len(), 1);
        // The repeated Event-Name accumulates instead of splitting.
        match events[0].header_values("Event-Name").unwrap() {
            HeaderValue::List(values) => assert_eq!(values.len(), 2),
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn body_without_separator_is_kept_whole() {
        let body = "no separator here";
        let data = format!(
            "Content-Type: text/event-plain\nContent-Length: {}\n\n{}",
            body.len(),
            body
        );
        let events = parse_all(data.as_bytes());
        assert_eq!(events[0].body(), Some(body));
    }

    #[test]
    fn incomplete_frame_returns_none() {
        let mut parser = EslParser::new();
        parser
            .add_data(b"Content-Type: api/response\nContent-Length: 10\n\ntest")
            .unwrap();
        assert!(parser.parse_frame().unwrap().is_none());
        parser.add_data(b"armore").unwrap();
        let events = parser.parse_frame().unwrap().unwrap();
        assert_eq!(events[0].body(), Some("testarmore"));
    }

    #[test]
    fn crlf_terminated_headers_parse() {
        let events = parse_all(b"Content-Type: auth/request\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].content_type(), Some("auth/request"));
    }

    #[test]
    fn oversized_content_length_is_rejected() {
        let mut parser = EslParser::new();
        let data = format!(
            "Content-Type: api/response\nContent-Length: {}\n\n",
            MAX_MESSAGE_SIZE + 1
        );
        parser.add_data(data.as_bytes()).unwrap();
        assert!(matches!(
            parser.parse_frame(),
            Err(EslError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn non_numeric_content_length_is_rejected() {
        let mut parser = EslParser::new();
        parser
            .add_data(b"Content-Type: api/response\nContent-Length: abc\n\n")
            .unwrap();
        assert!(matches!(
            parser.parse_frame(),
            Err(EslError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn missing_content_type_is_a_desync_error() {
        let mut parser = EslParser::new();
        parser.add_data(b"Some-Header: value\n\n").unwrap();
        assert!(matches!(
            parser.parse_frame(),
            Err(EslError::ProtocolError { .. })
        ));
    }

    #[test]
    fn json_event_body_decodes_to_headers() {
        let json = r#"{"Event-Name":"CHANNEL_ANSWER","Unique-ID":"leg-9","_body":"payload"}"#;
        let data = format!(
            "Content-Type: text/event-json\nContent-Length: {}\n\n{}",
            json.len(),
            json
        );
        let events = parse_all(data.as_bytes());
        assert_eq!(events[0].event_type(), Some(EslEventType::ChannelAnswer));
        assert_eq!(events[0].unique_id(), Some("leg-9"));
        assert_eq!(events[0].body(), Some("payload"));
    }

    #[test]
    fn message_type_classification() {
        assert_eq!(
            MessageType::from_content_type("auth/request"),
            MessageType::AuthRequest
        );
        assert_eq!(
            MessageType::from_content_type("command/reply"),
            MessageType::CommandReply
        );
        assert_eq!(
            MessageType::from_content_type("api/response"),
            MessageType::ApiResponse
        );
        assert_eq!(
            MessageType::from_content_type("text/event-plain"),
            MessageType::Event
        );
        assert_eq!(
            MessageType::from_content_type("text/disconnect-notice"),
            MessageType::Disconnect
        );
        assert_eq!(
            MessageType::from_content_type("text/rude-rejection"),
            MessageType::Disconnect
        );
        assert_eq!(
            MessageType::from_content_type("application/x-whatever"),
            MessageType::Unknown("application/x-whatever".to_string())
        );
    }

    #[test]
    fn connect_reply_with_flat_channel_headers() {
        let mut data = String::new();
        for (key, value) in [
            ("Content-Type", "command/reply"),
            ("Reply-Text", "+OK"),
            ("Event-Name", "CHANNEL_DATA"),
            ("Channel-State", "CS_EXECUTE"),
            ("Unique-ID", "abcd-1234"),
            ("Channel-Name", "sofia/internal/1000@example.com"),
        ] {
            data.push_str(&format!("{key}: {value}\n"));
        }
        data.push('\n');

        let events = parse_all(data.as_bytes());
        assert_eq!(events.len(), 1);
        let reply = &events[0];
        assert_eq!(reply.content_type(), Some("command/reply"));
        assert!(reply.is_success_reply());
        assert_eq!(reply.unique_id(), Some("abcd-1234"));
        assert_eq!(
            reply.channel_state(),
            Some(crate::channel::ChannelState::CsExecute)
        );
    }
}
