//! Event model: ordered headers, list-valued repeats, optional body.

use crate::channel::{CallState, ChannelState};
use crate::constants::{
    CONTENT_TYPE_TEXT_EVENT_JSON, HEADER_CONTENT_LENGTH, HEADER_CONTENT_TYPE, HEADER_REPLY_TEXT,
    VARIABLE_PREFIX,
};
use crate::headers::EventHeader;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Event serialization format requested from the switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum EventFormat {
    /// Plain text format (default)
    Plain,
    /// JSON format
    Json,
}

impl EventFormat {
    /// Determine event format from a Content-Type header value.
    pub fn from_content_type(ct: &str) -> Self {
        match ct {
            CONTENT_TYPE_TEXT_EVENT_JSON => Self::Json,
            _ => Self::Plain,
        }
    }
}

impl fmt::Display for EventFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventFormat::Plain => write!(f, "plain"),
            EventFormat::Json => write!(f, "json"),
        }
    }
}

impl FromStr for EventFormat {
    type Err = ParseEventFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(Self::Plain),
            "json" => Ok(Self::Json),
            _ => Err(ParseEventFormatError(s.to_string())),
        }
    }
}

/// Error returned when parsing an invalid event format string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEventFormatError(pub String);

impl fmt::Display for ParseEventFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event format: {}", self.0)
    }
}

impl std::error::Error for ParseEventFormatError {}

/// Error returned when parsing an unknown event type string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEventTypeError(pub String);

impl fmt::Display for ParseEventTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event type: {}", self.0)
    }
}

impl std::error::Error for ParseEventTypeError {}

define_header_enum! {
    error_type: ParseEventTypeError,
    /// Wire event names the engine recognizes and dispatches on.
    ///
    /// The switch emits many more; everything else is still delivered to
    /// handlers keyed by the raw `Event-Name` string; this enum only covers
    /// names with engine-side behavior plus the common call-progress family.
    pub enum EslEventType {
        Custom => "CUSTOM",
        Heartbeat => "HEARTBEAT",
        Api => "API",
        BackgroundJob => "BACKGROUND_JOB",
        ChannelCreate => "CHANNEL_CREATE",
        ChannelData => "CHANNEL_DATA",
        ChannelState => "CHANNEL_STATE",
        ChannelCallstate => "CHANNEL_CALLSTATE",
        ChannelAnswer => "CHANNEL_ANSWER",
        ChannelExecute => "CHANNEL_EXECUTE",
        ChannelExecuteComplete => "CHANNEL_EXECUTE_COMPLETE",
        ChannelBridge => "CHANNEL_BRIDGE",
        ChannelUnbridge => "CHANNEL_UNBRIDGE",
        ChannelProgress => "CHANNEL_PROGRESS",
        ChannelProgressMedia => "CHANNEL_PROGRESS_MEDIA",
        ChannelOriginate => "CHANNEL_ORIGINATE",
        ChannelOutgoing => "CHANNEL_OUTGOING",
        ChannelPark => "CHANNEL_PARK",
        ChannelUnpark => "CHANNEL_UNPARK",
        ChannelHold => "CHANNEL_HOLD",
        ChannelUnhold => "CHANNEL_UNHOLD",
        ChannelHangup => "CHANNEL_HANGUP",
        ChannelHangupComplete => "CHANNEL_HANGUP_COMPLETE",
        ChannelDestroy => "CHANNEL_DESTROY",
        Dtmf => "DTMF",
        Message => "MESSAGE",
        PresenceIn => "PRESENCE_IN",
        Notify => "NOTIFY",
        ConferenceData => "CONFERENCE_DATA",
        ModuleUnload => "MODULE_UNLOAD",
        Shutdown => "SHUTDOWN",
    }
}

impl EslEventType {
    /// Parse an event type from its wire name (case-insensitive).
    pub fn parse_event_type(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

/// One header slot: a scalar, or the arrival-ordered list a repeated key
/// accumulated into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Scalar(String),
    List(Vec<String>),
}

impl HeaderValue {
    /// First (or only) value.
    pub fn first(&self) -> &str {
        match self {
            HeaderValue::Scalar(s) => s,
            HeaderValue::List(values) => values.first().map(String::as_str).unwrap_or(""),
        }
    }

    /// All values in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let values: Vec<&str> = match self {
            HeaderValue::Scalar(s) => vec![s.as_str()],
            HeaderValue::List(values) => values.iter().map(String::as_str).collect(),
        };
        values.into_iter()
    }

    fn push(&mut self, value: String) {
        match self {
            HeaderValue::Scalar(existing) => {
                *self = HeaderValue::List(vec![std::mem::take(existing), value]);
            }
            HeaderValue::List(values) => values.push(value),
        }
    }
}

impl From<String> for HeaderValue {
    fn from(s: String) -> Self {
        HeaderValue::Scalar(s)
    }
}

impl From<&str> for HeaderValue {
    fn from(s: &str) -> Self {
        HeaderValue::Scalar(s.to_string())
    }
}

/// One parsed protocol frame or event: an ordered header map plus an
/// optional body.
///
/// Immutable once parsed; only the router mutates it, when merging bundled
/// sub-events carried in a single frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EslEvent {
    event_type: Option<EslEventType>,
    headers: IndexMap<String, HeaderValue>,
    body: Option<String>,
}

impl EslEvent {
    /// Create a new empty event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parsed event type, if the `Event-Name` is one the engine recognizes.
    pub fn event_type(&self) -> Option<EslEventType> {
        self.event_type
    }

    /// Raw `Event-Name` header.
    pub fn event_name(&self) -> Option<&str> {
        self.header(EventHeader::EventName)
    }

    /// Look up a header by name; repeated keys yield their first value.
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers.get(name.as_ref()).map(HeaderValue::first)
    }

    /// Full header slot including any repeated values.
    pub fn header_values(&self, name: impl AsRef<str>) -> Option<&HeaderValue> {
        self.headers.get(name.as_ref())
    }

    /// All headers in arrival order.
    pub fn headers(&self) -> &IndexMap<String, HeaderValue> {
        &self.headers
    }

    /// Set or overwrite a header with a scalar value.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers.insert(name.clone(), HeaderValue::Scalar(value.into()));
        if name == EventHeader::EventName.as_str() {
            self.refresh_event_type();
        }
    }

    /// Add a header with repeated-key semantics: a second value for the same
    /// key converts the slot to a list, preserving arrival order.
    pub fn append_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let is_event_name = name == EventHeader::EventName.as_str();
        match self.headers.entry(name) {
            indexmap::map::Entry::Occupied(mut slot) => slot.get_mut().push(value.into()),
            indexmap::map::Entry::Vacant(slot) => {
                slot.insert(HeaderValue::Scalar(value.into()));
            }
        }
        if is_event_name {
            self.refresh_event_type();
        }
    }

    /// Remove a header, returning its slot if it existed.
    pub fn del_header(&mut self, name: &str) -> Option<HeaderValue> {
        self.headers.shift_remove(name)
    }

    /// Set a header to a full slot, list values included.
    pub(crate) fn set_header_slot(&mut self, name: impl Into<String>, value: HeaderValue) {
        let name = name.into();
        self.headers.insert(name.clone(), value);
        if name == EventHeader::EventName.as_str() {
            self.refresh_event_type();
        }
    }

    /// Overwrite this event's headers with every slot from `other`,
    /// appending keys not yet present. Used when a frame body carries extra
    /// event headers, and when bundled sub-events inherit framing headers.
    pub fn merge(&mut self, other: &EslEvent) {
        for (key, value) in &other.headers {
            self.headers.insert(key.clone(), value.clone());
        }
        self.refresh_event_type();
    }

    fn refresh_event_type(&mut self) {
        self.event_type = self
            .header(EventHeader::EventName)
            .and_then(EslEventType::parse_event_type);
    }

    /// Event body, if the frame carried one.
    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// Set the event body.
    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = Some(body.into());
    }

    // --- framing accessors -------------------------------------------------

    /// `Content-Type` framing header.
    pub fn content_type(&self) -> Option<&str> {
        self.header(HEADER_CONTENT_TYPE)
    }

    /// `Content-Length` framing header, first value (an inner event may have
    /// merged its own length header behind it).
    pub fn content_length(&self) -> Option<usize> {
        self.header(HEADER_CONTENT_LENGTH)?.trim().parse().ok()
    }

    /// `Reply-Text` header from command replies.
    pub fn reply_text(&self) -> Option<&str> {
        self.header(HEADER_REPLY_TEXT)
    }

    /// `true` when `Reply-Text` starts with `+OK` or is absent.
    pub fn is_success_reply(&self) -> bool {
        match self.reply_text() {
            None | Some("") => true,
            Some(text) => text.starts_with("+OK"),
        }
    }

    // --- event payload accessors -------------------------------------------

    /// `Unique-ID`, falling back to `Caller-Unique-ID`.
    pub fn unique_id(&self) -> Option<&str> {
        self.header(EventHeader::UniqueId)
            .or_else(|| self.header(EventHeader::CallerUniqueId))
    }

    /// `Job-UUID` carried on background-job events and `bgapi` replies.
    pub fn job_uuid(&self) -> Option<&str> {
        self.header(EventHeader::JobUuid)
    }

    /// `Application-UUID` echoed on execute and execute-complete events.
    pub fn application_uuid(&self) -> Option<&str> {
        self.header(EventHeader::ApplicationUuid)
    }

    /// `Application-Response` from execute-complete events.
    pub fn application_response(&self) -> Option<&str> {
        self.header(EventHeader::ApplicationResponse)
    }

    /// `Event-Subclass` header for `CUSTOM` events (e.g. `sofia::register`).
    pub fn event_subclass(&self) -> Option<&str> {
        self.header(EventHeader::EventSubclass)
    }

    /// Parse the `Channel-State` header into a [`ChannelState`].
    pub fn channel_state(&self) -> Option<ChannelState> {
        self.header(EventHeader::ChannelState)?.parse().ok()
    }

    /// Parse the `Channel-State-Number` header into a [`ChannelState`].
    pub fn channel_state_number(&self) -> Option<ChannelState> {
        let n: u8 = self.header(EventHeader::ChannelStateNumber)?.parse().ok()?;
        ChannelState::from_number(n)
    }

    /// Parse the `Channel-Call-State` header into a [`CallState`].
    pub fn call_state(&self) -> Option<CallState> {
        self.header(EventHeader::ChannelCallState)?.parse().ok()
    }

    /// Look up a channel variable by name (the `variable_{name}` header).
    pub fn variable(&self, name: &str) -> Option<&str> {
        let key = format!("{VARIABLE_PREFIX}{name}");
        self.header(&key)
    }

    /// The key handlers are dispatched under: the `Event-Subclass` when the
    /// event name is the generic `CUSTOM` marker, else the event name.
    pub fn dispatch_key(&self) -> Option<&str> {
        let name = self.event_name()?;
        if name == EslEventType::Custom.as_str() {
            self.event_subclass().or(Some(name))
        } else {
            Some(name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_key_becomes_list_in_order() {
        let mut event = EslEvent::new();
        event.append_header("Content-Length", "134");
        event.append_header("Content-Length", "12");
        match event.header_values("Content-Length").unwrap() {
            HeaderValue::List(values) => assert_eq!(values, &["134", "12"]),
            other => panic!("expected list, got {other:?}"),
        }
        assert_eq!(event.header("Content-Length"), Some("134"));
        assert_eq!(event.content_length(), Some(134));
    }

    #[test]
    fn single_key_stays_scalar() {
        let mut event = EslEvent::new();
        event.append_header("Unique-ID", "abcd");
        assert!(matches!(
            event.header_values("Unique-ID").unwrap(),
            HeaderValue::Scalar(_)
        ));
    }

    #[test]
    fn event_type_tracks_event_name() {
        let mut event = EslEvent::new();
        event.set_header("Event-Name", "CHANNEL_ANSWER");
        assert_eq!(event.event_type(), Some(EslEventType::ChannelAnswer));
        event.set_header("Event-Name", "NOT_A_REAL_EVENT");
        assert_eq!(event.event_type(), None);
        assert_eq!(event.event_name(), Some("NOT_A_REAL_EVENT"));
    }

    #[test]
    fn unique_id_falls_back_to_caller_unique_id() {
        let mut event = EslEvent::new();
        event.set_header("Caller-Unique-ID", "fallback");
        assert_eq!(event.unique_id(), Some("fallback"));
        event.set_header("Unique-ID", "primary");
        assert_eq!(event.unique_id(), Some("primary"));
    }

    #[test]
    fn dispatch_key_uses_subclass_for_custom() {
        let mut event = EslEvent::new();
        event.set_header("Event-Name", "CUSTOM");
        event.set_header("Event-Subclass", "sofia::register");
        assert_eq!(event.dispatch_key(), Some("sofia::register"));

        let mut plain = EslEvent::new();
        plain.set_header("Event-Name", "CHANNEL_ANSWER");
        assert_eq!(plain.dispatch_key(), Some("CHANNEL_ANSWER"));

        let mut bare_custom = EslEvent::new();
        bare_custom.set_header("Event-Name", "CUSTOM");
        assert_eq!(bare_custom.dispatch_key(), Some("CUSTOM"));
    }

    #[test]
    fn merge_overwrites_and_appends() {
        let mut base = EslEvent::new();
        base.set_header("Event-Name", "CHANNEL_CREATE");
        base.set_header("Keep", "yes");

        let mut extra = EslEvent::new();
        extra.set_header("Event-Name", "CHANNEL_ANSWER");
        extra.set_header("New", "value");

        base.merge(&extra);
        assert_eq!(base.event_type(), Some(EslEventType::ChannelAnswer));
        assert_eq!(base.header("Keep"), Some("yes"));
        assert_eq!(base.header("New"), Some("value"));
    }

    #[test]
    fn success_reply_classification() {
        let mut ok = EslEvent::new();
        ok.set_header("Reply-Text", "+OK accepted");
        assert!(ok.is_success_reply());

        let mut err = EslEvent::new();
        err.set_header("Reply-Text", "-ERR command not found");
        assert!(!err.is_success_reply());

        assert!(EslEvent::new().is_success_reply());
    }

    #[test]
    fn variable_lookup_uses_prefix() {
        let mut event = EslEvent::new();
        event.set_header("variable_hangup_after_bridge", "true");
        assert_eq!(event.variable("hangup_after_bridge"), Some("true"));
        assert_eq!(event.variable("missing"), None);
    }

    #[test]
    fn event_format_round_trip() {
        assert_eq!("plain".parse::<EventFormat>(), Ok(EventFormat::Plain));
        assert_eq!("json".parse::<EventFormat>(), Ok(EventFormat::Json));
        assert!("xml".parse::<EventFormat>().is_err());
        assert_eq!(
            EventFormat::from_content_type("text/event-json"),
            EventFormat::Json
        );
        assert_eq!(
            EventFormat::from_content_type("text/event-plain"),
            EventFormat::Plain
        );
    }
}
