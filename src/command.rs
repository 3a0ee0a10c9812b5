//! Outgoing command frames and command/result correlation.

use crate::error::{EslError, EslResult};
use crate::event::EslEvent;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::debug;

/// Validate that a user-provided string contains no newline characters.
///
/// Commands are line-delimited; embedded newlines would allow injection of
/// arbitrary protocol commands.
pub(crate) fn validate_no_newlines(s: &str, context: &str) -> EslResult<()> {
    if s.contains('\n') || s.contains('\r') {
        return Err(EslError::ProtocolError {
            message: format!("{context} must not contain newlines"),
        });
    }
    Ok(())
}

/// Reply-Text classification.
///
/// Commands return `+OK …` on success and `-ERR …` on failure. A handful of
/// commands return a bare value with no prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReplyStatus {
    /// Reply-Text starts with `+OK` or is absent/empty.
    Ok,
    /// Reply-Text starts with `-ERR`.
    Err,
    /// Reply-Text present but matches neither prefix.
    Other,
}

impl ReplyStatus {
    /// Classify a reply event by its `Reply-Text` header.
    pub fn classify(reply: &EslEvent) -> Self {
        match reply.reply_text() {
            None | Some("") => ReplyStatus::Ok,
            Some(t) if t.starts_with("+OK") => ReplyStatus::Ok,
            Some(t) if t.starts_with("-ERR") => ReplyStatus::Err,
            Some(_) => ReplyStatus::Other,
        }
    }
}

/// Convert a reply event into a result, mapping `-ERR` to
/// [`EslError::CommandFailed`].
pub(crate) fn reply_into_result(reply: EslEvent) -> EslResult<EslEvent> {
    match ReplyStatus::classify(&reply) {
        ReplyStatus::Ok | ReplyStatus::Other => Ok(reply),
        ReplyStatus::Err => Err(EslError::CommandFailed {
            reply_text: reply.reply_text().unwrap_or("-ERR").to_string(),
        }),
    }
}

/// Simple one-line commands sent over the control connection.
#[derive(Clone)]
#[non_exhaustive]
pub enum EslCommand {
    /// Authenticate with password (inbound mode).
    Auth { password: String },
    /// Request channel data for the attached leg (outbound mode).
    Connect,
    /// Subscribe to events: `event <format> <names>`.
    Events { format: String, events: String },
    /// Subscribe to all events of the attached session.
    MyEvents { format: String },
    /// Scope event delivery: `filter <header> <value>`.
    Filter { header: String, value: String },
    /// Keep the socket open after hangup.
    Linger { timeout: Option<u32> },
    /// Blocking API command.
    Api { command: String },
    /// Asynchronous API command with a job correlation id.
    BgApi {
        command: String,
        job_uuid: Option<String>,
    },
    /// Close the session gracefully.
    Exit,
}

impl std::fmt::Debug for EslCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EslCommand::Auth { .. } => f
                .debug_struct("Auth")
                .field("password", &"[REDACTED]")
                .finish(),
            EslCommand::Connect => write!(f, "Connect"),
            EslCommand::Events { format, events } => f
                .debug_struct("Events")
                .field("format", format)
                .field("events", events)
                .finish(),
            EslCommand::MyEvents { format } => f
                .debug_struct("MyEvents")
                .field("format", format)
                .finish(),
            EslCommand::Filter { header, value } => f
                .debug_struct("Filter")
                .field("header", header)
                .field("value", value)
                .finish(),
            EslCommand::Linger { timeout } => f
                .debug_struct("Linger")
                .field("timeout", timeout)
                .finish(),
            EslCommand::Api { command } => {
                f.debug_struct("Api").field("command", command).finish()
            }
            EslCommand::BgApi { command, job_uuid } => f
                .debug_struct("BgApi")
                .field("command", command)
                .field("job_uuid", job_uuid)
                .finish(),
            EslCommand::Exit => write!(f, "Exit"),
        }
    }
}

impl EslCommand {
    fn simple(cmd: &str, args: &[&str]) -> String {
        let mut line = String::from(cmd);
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Validate all user-supplied fields, then render the command text
    /// (without the frame-terminating blank line; the writer adds framing).
    pub fn to_command_string(&self) -> EslResult<String> {
        match self {
            EslCommand::Auth { password } => {
                validate_no_newlines(password, "password")?;
                Ok(Self::simple("auth", &[password]))
            }
            EslCommand::Connect => Ok("connect".to_string()),
            EslCommand::Events { format, events } => {
                validate_no_newlines(format, "event format")?;
                validate_no_newlines(events, "event list")?;
                Ok(Self::simple("event", &[format, events]))
            }
            EslCommand::MyEvents { format } => {
                validate_no_newlines(format, "myevents format")?;
                Ok(Self::simple("myevents", &[format]))
            }
            EslCommand::Filter { header, value } => {
                validate_no_newlines(header, "filter header")?;
                validate_no_newlines(value, "filter value")?;
                Ok(Self::simple("filter", &[header, value]))
            }
            EslCommand::Linger { timeout } => Ok(match timeout {
                Some(n) => Self::simple("linger", &[&n.to_string()]),
                None => "linger".to_string(),
            }),
            EslCommand::Api { command } => {
                validate_no_newlines(command, "api command")?;
                Ok(Self::simple("api", &[command]))
            }
            EslCommand::BgApi { command, job_uuid } => {
                validate_no_newlines(command, "bgapi command")?;
                let mut text = Self::simple("bgapi", &[command]);
                if let Some(job) = job_uuid {
                    validate_no_newlines(job, "job uuid")?;
                    let _ = write!(text, "\nJob-UUID: {job}");
                }
                Ok(text)
            }
            EslCommand::Exit => Ok("exit".to_string()),
        }
    }
}

/// `sendmsg` frame directed at a call leg.
///
/// Wire layout follows the dialplan-command protocol: a `call-command`
/// header, the application name/arguments for `execute`, an `Event-UUID`
/// correlation header, an optional `event-lock` flag and a `hangup-cause`
/// for the `hangup` command.
#[derive(Debug, Clone)]
pub struct SendMsg {
    pub(crate) uuid: Option<String>,
    pub(crate) command: String,
    pub(crate) application: Option<String>,
    pub(crate) data: Option<String>,
    pub(crate) lock: bool,
    pub(crate) event_uuid: Option<String>,
    pub(crate) headers: Vec<(String, String)>,
}

impl SendMsg {
    /// An `execute` command running a dialplan application.
    pub fn execute(application: impl Into<String>, data: Option<&str>) -> Self {
        Self {
            uuid: None,
            command: "execute".to_string(),
            application: Some(application.into()),
            data: data.map(str::to_string),
            lock: false,
            event_uuid: None,
            headers: Vec::new(),
        }
    }

    /// A `hangup` command with the given cause.
    pub fn hangup(cause: impl Into<String>) -> Self {
        Self {
            uuid: None,
            command: "hangup".to_string(),
            application: None,
            data: Some(cause.into()),
            lock: false,
            event_uuid: None,
            headers: Vec::new(),
        }
    }

    /// Target a specific leg id (`sendmsg <uuid>`).
    pub fn for_channel(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    /// Attach an explicit execution correlation id; one is generated at send
    /// time when absent.
    pub fn with_event_uuid(mut self, event_uuid: impl Into<String>) -> Self {
        self.event_uuid = Some(event_uuid.into());
        self
    }

    /// Ask the switch to serialize this command against queued events.
    pub fn with_lock(mut self) -> Self {
        self.lock = true;
        self
    }

    /// Add an extra header to the frame.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub(crate) fn is_execute(&self) -> bool {
        self.command == "execute"
    }

    /// Render the multi-line command text (framing blank line excluded).
    pub fn to_command_string(&self) -> EslResult<String> {
        let mut text = String::from("sendmsg");
        if let Some(uuid) = &self.uuid {
            validate_no_newlines(uuid, "sendmsg uuid")?;
            let _ = write!(text, " {uuid}");
        }

        validate_no_newlines(&self.command, "call command")?;
        let _ = write!(text, "\ncall-command: {}", self.command);

        if self.is_execute() {
            let application = self.application.as_deref().unwrap_or_default();
            validate_no_newlines(application, "application name")?;
            let _ = write!(text, "\nexecute-app-name: {application}");
            if let Some(data) = &self.data {
                validate_no_newlines(data, "application arguments")?;
                let _ = write!(text, "\nexecute-app-arg: {data}");
            }
            if let Some(event_uuid) = &self.event_uuid {
                validate_no_newlines(event_uuid, "event uuid")?;
                let _ = write!(text, "\nEvent-UUID: {event_uuid}");
            }
        }

        if self.lock {
            text.push_str("\nevent-lock: true");
        }

        if self.command == "hangup" {
            if let Some(cause) = &self.data {
                validate_no_newlines(cause, "hangup cause")?;
                let _ = write!(text, "\nhangup-cause: {cause}");
            }
        }

        for (name, value) in &self.headers {
            validate_no_newlines(name, "header name")?;
            validate_no_newlines(value, "header value")?;
            let _ = write!(text, "\n{name}: {value}");
        }

        Ok(text)
    }
}

fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Slot that resolves exactly once.
///
/// The first of completion, interruption or transport failure wins; later
/// resolutions are no-ops. Observable synchronously via [`peek`](Self::peek)
/// or asynchronously via [`wait`](Self::wait).
#[derive(Debug)]
pub(crate) struct ResultCell {
    value: Mutex<Option<EslResult<EslEvent>>>,
    done: watch::Sender<bool>,
}

impl ResultCell {
    pub(crate) fn new() -> Arc<Self> {
        let (done, _) = watch::channel(false);
        Arc::new(Self {
            value: Mutex::new(None),
            done,
        })
    }

    /// Store the outcome; returns `false` if the cell was already resolved.
    pub(crate) fn resolve(&self, outcome: EslResult<EslEvent>) -> bool {
        {
            let mut slot = lock_ignore_poison(&self.value);
            if slot.is_some() {
                debug!("ignoring second resolution of an already-resolved operation");
                return false;
            }
            *slot = Some(outcome);
        }
        self.done.send_replace(true);
        true
    }

    pub(crate) fn is_resolved(&self) -> bool {
        lock_ignore_poison(&self.value).is_some()
    }

    pub(crate) fn peek(&self) -> Option<EslResult<EslEvent>> {
        lock_ignore_poison(&self.value).clone()
    }

    /// Await resolution. No default timeout: a lost terminal event leaves
    /// the operation pending until the session unwinds it.
    pub(crate) async fn wait(&self) -> EslResult<EslEvent> {
        let mut rx = self.done.subscribe();
        loop {
            if *rx.borrow_and_update() {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
        self.peek().unwrap_or(Err(EslError::ConnectionClosed))
    }
}

#[derive(Debug)]
struct CommandResultInner {
    command: String,
    application: String,
    data: Option<String>,
    app_uuid: Option<String>,
    channel_uuid: Option<String>,
    initial_reply: Mutex<Option<EslEvent>>,
    cell: Arc<ResultCell>,
}

/// Handle to one outstanding (or finished) leg command.
///
/// For `execute`-class commands the result resolves when the matching
/// completion event arrives, or resolves with
/// [`EslError::Interrupted`] when the leg hangs up first. Exactly once,
/// whichever happens first. Non-execute commands are complete as soon as the
/// synchronous reply arrives.
#[derive(Debug, Clone)]
pub struct CommandResult {
    inner: Arc<CommandResultInner>,
}

impl CommandResult {
    pub(crate) fn pending(
        command: &str,
        application: &str,
        data: Option<&str>,
        app_uuid: Option<String>,
        channel_uuid: Option<String>,
        cell: Arc<ResultCell>,
    ) -> Self {
        Self {
            inner: Arc::new(CommandResultInner {
                command: command.to_string(),
                application: application.to_string(),
                data: data.map(str::to_string),
                app_uuid,
                channel_uuid,
                initial_reply: Mutex::new(None),
                cell,
            }),
        }
    }

    /// A result that is already complete, backed by the given event.
    pub(crate) fn completed(
        command: &str,
        application: &str,
        data: Option<&str>,
        event: EslEvent,
    ) -> Self {
        let cell = ResultCell::new();
        cell.resolve(Ok(event));
        Self::pending(command, application, data, None, None, cell)
    }

    pub(crate) fn set_initial_reply(&self, reply: EslEvent) {
        *lock_ignore_poison(&self.inner.initial_reply) = Some(reply);
    }

    /// The synchronous reply received when the command frame was accepted.
    pub fn initial_reply(&self) -> Option<EslEvent> {
        lock_ignore_poison(&self.inner.initial_reply).clone()
    }

    /// Execution correlation id, present for `execute`-class commands.
    pub fn app_uuid(&self) -> Option<&str> {
        self.inner.app_uuid.as_deref()
    }

    /// Leg the command was issued against.
    pub fn channel_uuid(&self) -> Option<&str> {
        self.inner.channel_uuid.as_deref()
    }

    /// Command verb (`execute`, `hangup`, ...).
    pub fn command(&self) -> &str {
        &self.inner.command
    }

    /// Application name for `execute` commands.
    pub fn application(&self) -> &str {
        &self.inner.application
    }

    /// Application arguments (or hangup cause).
    pub fn data(&self) -> Option<&str> {
        self.inner.data.as_deref()
    }

    /// Whether the command reached a terminal outcome.
    pub fn is_complete(&self) -> bool {
        self.inner.cell.is_resolved()
    }

    /// `Some(true)` on successful completion, `Some(false)` on interruption
    /// or failure, `None` while still pending.
    pub fn succeeded(&self) -> Option<bool> {
        self.inner.cell.peek().map(|outcome| outcome.is_ok())
    }

    /// The completion event, once resolved successfully.
    pub fn complete_event(&self) -> Option<EslEvent> {
        match self.inner.cell.peek() {
            Some(Ok(event)) => Some(event),
            _ => None,
        }
    }

    /// `Application-Response` from the completion event.
    pub fn response(&self) -> Option<String> {
        self.complete_event()?
            .application_response()
            .map(str::to_string)
    }

    /// The stored failure, if the command resolved with one.
    pub fn error(&self) -> Option<EslError> {
        match self.inner.cell.peek() {
            Some(Err(err)) => Some(err),
            _ => None,
        }
    }

    /// Await resolution, re-raising a stored interruption or transport
    /// error. There is no default timeout; wrap in
    /// `tokio::time::timeout` to bound the wait.
    pub async fn wait(&self) -> EslResult<EslEvent> {
        self.inner.cell.wait().await
    }

    pub(crate) fn cell(&self) -> Arc<ResultCell> {
        self.inner.cell.clone()
    }
}

/// Handle to one asynchronous API job.
///
/// Resolves when the job-completion event carrying the matching id arrives;
/// a body starting with `-ERR` (or containing `ERROR`) resolves as
/// [`EslError::CommandFailed`].
#[derive(Debug, Clone)]
pub struct BackgroundJob {
    job_uuid: String,
    command: String,
    cell: Arc<ResultCell>,
}

impl BackgroundJob {
    pub(crate) fn new(job_uuid: String, command: String, cell: Arc<ResultCell>) -> Self {
        Self {
            job_uuid,
            command,
            cell,
        }
    }

    /// Job correlation id carried in the `Job-UUID` header.
    pub fn job_uuid(&self) -> &str {
        &self.job_uuid
    }

    /// The API command this job runs.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Whether the completion event arrived.
    pub fn is_complete(&self) -> bool {
        self.cell.is_resolved()
    }

    /// The completion event body, once resolved successfully.
    pub fn response(&self) -> Option<String> {
        match self.cell.peek() {
            Some(Ok(event)) => event.body().map(|body| body.trim().to_string()),
            _ => None,
        }
    }

    /// Await the job-completion event.
    pub async fn wait(&self) -> EslResult<EslEvent> {
        self.cell.wait().await
    }
}

/// Classify a job-completion event body as success or failure.
pub(crate) fn classify_job_outcome(event: EslEvent) -> EslResult<EslEvent> {
    let body = event.body().unwrap_or("").trim().to_string();
    if body.starts_with("-ERR") || body.to_uppercase().contains("ERROR") {
        return Err(EslError::CommandFailed { reply_text: body });
    }
    if !body.starts_with("+OK") {
        debug!(body = %body, "job completed with an unprefixed response body");
    }
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(text: &str) -> EslEvent {
        let mut event = EslEvent::new();
        event.set_header("Content-Type", "command/reply");
        event.set_header("Reply-Text", text);
        event
    }

    #[test]
    fn sendmsg_execute_wire_format() {
        let msg = SendMsg::execute("playback", Some("/tmp/test.wav"))
            .for_channel("leg-1")
            .with_event_uuid("app-1");
        let text = msg.to_command_string().unwrap();
        assert_eq!(
            text,
            "sendmsg leg-1\n\
             call-command: execute\n\
             execute-app-name: playback\n\
             execute-app-arg: /tmp/test.wav\n\
             Event-UUID: app-1"
        );
    }

    #[test]
    fn sendmsg_hangup_wire_format() {
        let msg = SendMsg::hangup("USER_BUSY").for_channel("leg-1");
        let text = msg.to_command_string().unwrap();
        assert_eq!(
            text,
            "sendmsg leg-1\ncall-command: hangup\nhangup-cause: USER_BUSY"
        );
    }

    #[test]
    fn sendmsg_lock_and_extra_headers() {
        let msg = SendMsg::execute("bridge", Some("user/1001"))
            .with_event_uuid("app-2")
            .with_lock()
            .header("X-Custom", "value");
        let text = msg.to_command_string().unwrap();
        assert!(text.contains("event-lock: true"));
        assert!(text.ends_with("X-Custom: value"));
    }

    #[test]
    fn newline_injection_is_rejected() {
        let msg = SendMsg::execute("playback", Some("/tmp/a.wav\nexit"));
        assert!(msg.to_command_string().is_err());

        let cmd = EslCommand::Api {
            command: "status\nexit".to_string(),
        };
        assert!(cmd.to_command_string().is_err());
    }

    #[test]
    fn bgapi_carries_job_uuid_header() {
        let cmd = EslCommand::BgApi {
            command: "originate user/1000 &park".to_string(),
            job_uuid: Some("job-7".to_string()),
        };
        assert_eq!(
            cmd.to_command_string().unwrap(),
            "bgapi originate user/1000 &park\nJob-UUID: job-7"
        );
    }

    #[test]
    fn result_cell_resolves_exactly_once() {
        let cell = ResultCell::new();
        let mut completion = EslEvent::new();
        completion.set_header("Event-Name", "CHANNEL_EXECUTE_COMPLETE");

        assert!(cell.resolve(Ok(completion)));
        assert!(!cell.resolve(Err(EslError::Interrupted {
            app_uuid: "a".into(),
            channel_uuid: "c".into(),
        })));

        match cell.peek() {
            Some(Ok(event)) => {
                assert_eq!(event.event_name(), Some("CHANNEL_EXECUTE_COMPLETE"));
            }
            other => panic!("first resolution should win, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn command_result_wait_reraises_interruption() {
        let cell = ResultCell::new();
        let result = CommandResult::pending(
            "execute",
            "playback",
            None,
            Some("app-1".into()),
            Some("leg-1".into()),
            cell.clone(),
        );
        assert!(!result.is_complete());
        assert_eq!(result.succeeded(), None);

        cell.resolve(Err(EslError::Interrupted {
            app_uuid: "app-1".into(),
            channel_uuid: "leg-1".into(),
        }));

        assert!(result.is_complete());
        assert_eq!(result.succeeded(), Some(false));
        match result.wait().await {
            Err(EslError::Interrupted {
                app_uuid,
                channel_uuid,
            }) => {
                assert_eq!(app_uuid, "app-1");
                assert_eq!(channel_uuid, "leg-1");
            }
            other => panic!("expected interruption, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn command_result_response_reads_completion_event() {
        let cell = ResultCell::new();
        let result =
            CommandResult::pending("execute", "playback", None, None, None, cell.clone());

        let mut completion = EslEvent::new();
        completion.set_header("Event-Name", "CHANNEL_EXECUTE_COMPLETE");
        completion.set_header("Application-Response", "FILE PLAYED");
        cell.resolve(Ok(completion));

        let event = result.wait().await.unwrap();
        assert_eq!(event.application_response(), Some("FILE PLAYED"));
        assert_eq!(result.response().as_deref(), Some("FILE PLAYED"));
        assert_eq!(result.succeeded(), Some(true));
    }

    #[test]
    fn completed_result_is_immediately_done() {
        let result =
            CommandResult::completed("hangup", "", Some("NORMAL_CLEARING"), reply("+OK"));
        assert!(result.is_complete());
        assert_eq!(result.succeeded(), Some(true));
    }

    #[test]
    fn job_outcome_classification() {
        let mut ok = EslEvent::new();
        ok.set_body("+OK 7f4d-1");
        assert!(classify_job_outcome(ok).is_ok());

        let mut err = EslEvent::new();
        err.set_body("-ERR DESTINATION_OUT_OF_ORDER");
        match classify_job_outcome(err) {
            Err(EslError::CommandFailed { reply_text }) => {
                assert_eq!(reply_text, "-ERR DESTINATION_OUT_OF_ORDER");
            }
            other => panic!("expected command failure, got {other:?}"),
        }

        let mut shouty = EslEvent::new();
        shouty.set_body("unexpected error occurred");
        assert!(classify_job_outcome(shouty).is_err());
    }

    #[test]
    fn reply_status_classification() {
        assert_eq!(ReplyStatus::classify(&reply("+OK accepted")), ReplyStatus::Ok);
        assert_eq!(ReplyStatus::classify(&reply("-ERR no")), ReplyStatus::Err);
        assert_eq!(ReplyStatus::classify(&reply("raw value")), ReplyStatus::Other);
        assert!(reply_into_result(reply("-ERR no")).is_err());
    }
}
