//! Per-leg state machine and call-control operations.

use crate::command::{BackgroundJob, CommandResult, SendMsg};
use crate::commands::{PlayAndGetDigits, Say, UuidBridge, UuidTransfer};
use crate::constants::VARIABLE_PREFIX;
use crate::error::{EslError, EslResult};
use crate::event::EslEvent;
use crate::headers::EventHeader;
use crate::session::{
    spawn_blocking_handler, spawn_task_handler, HandlerKey, HandlerToken, SessionInner,
};
use crate::variables::{VariableValue, Variables};
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Error returned when parsing an invalid channel state string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseChannelStateError(pub String);

impl fmt::Display for ParseChannelStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown channel state: {}", self.0)
    }
}

impl std::error::Error for ParseChannelStateError {}

define_header_enum! {
    error_type: ParseChannelStateError,
    /// Core lifecycle state of a leg, carried in the `Channel-State` header
    /// as a string (`CS_ROUTING`) and in `Channel-State-Number` as an
    /// integer.
    pub enum ChannelState {
        CsNew => "CS_NEW",
        CsInit => "CS_INIT",
        CsRouting => "CS_ROUTING",
        CsSoftExecute => "CS_SOFT_EXECUTE",
        CsExecute => "CS_EXECUTE",
        CsExchangeMedia => "CS_EXCHANGE_MEDIA",
        CsPark => "CS_PARK",
        CsConsumeMedia => "CS_CONSUME_MEDIA",
        CsHibernate => "CS_HIBERNATE",
        CsReset => "CS_RESET",
        CsHangup => "CS_HANGUP",
        CsReporting => "CS_REPORTING",
        CsDestroy => "CS_DESTROY",
        CsNone => "CS_NONE",
    }
}

impl ChannelState {
    /// Parse from the `Channel-State-Number` integer header value.
    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            0 => Some(Self::CsNew),
            1 => Some(Self::CsInit),
            2 => Some(Self::CsRouting),
            3 => Some(Self::CsSoftExecute),
            4 => Some(Self::CsExecute),
            5 => Some(Self::CsExchangeMedia),
            6 => Some(Self::CsPark),
            7 => Some(Self::CsConsumeMedia),
            8 => Some(Self::CsHibernate),
            9 => Some(Self::CsReset),
            10 => Some(Self::CsHangup),
            11 => Some(Self::CsReporting),
            12 => Some(Self::CsDestroy),
            13 => Some(Self::CsNone),
            _ => None,
        }
    }

    /// Integer discriminant matching the wire numbering.
    pub fn as_number(&self) -> u8 {
        match self {
            Self::CsNew => 0,
            Self::CsInit => 1,
            Self::CsRouting => 2,
            Self::CsSoftExecute => 3,
            Self::CsExecute => 4,
            Self::CsExchangeMedia => 5,
            Self::CsPark => 6,
            Self::CsConsumeMedia => 7,
            Self::CsHibernate => 8,
            Self::CsReset => 9,
            Self::CsHangup => 10,
            Self::CsReporting => 11,
            Self::CsDestroy => 12,
            Self::CsNone => 13,
        }
    }
}

/// Error returned when parsing an invalid call state string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseCallStateError(pub String);

impl fmt::Display for ParseCallStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown call state: {}", self.0)
    }
}

impl std::error::Error for ParseCallStateError {}

define_header_enum! {
    error_type: ParseCallStateError,
    /// Call-progress state of a leg, carried in the `Channel-Call-State`
    /// header.
    pub enum CallState {
        Down => "DOWN",
        Dialing => "DIALING",
        Ringing => "RINGING",
        Early => "EARLY",
        Active => "ACTIVE",
        Held => "HELD",
        RingWait => "RING_WAIT",
        Hangup => "HANGUP",
        Unheld => "UNHELD",
    }
    aliases {
        Early => "EARLY_MEDIA",
    }
}

/// Identity headers mirrored into the variable snapshot alongside
/// `variable_`-prefixed headers.
const IDENTITY_HEADERS: [&str; 5] = [
    "Caller-Caller-ID-Number",
    "Caller-Caller-ID-Name",
    "Caller-Destination-Number",
    "Unique-ID",
    "Channel-Name",
];

#[derive(Debug)]
struct ChannelData {
    state: ChannelState,
    call_state: CallState,
    variables: HashMap<String, String>,
}

pub(crate) enum ChannelCallback {
    Task(Arc<dyn Fn(Arc<Channel>, EslEvent) -> BoxFuture<'static, ()> + Send + Sync>),
    Blocking(Arc<dyn Fn(Arc<Channel>, EslEvent) + Send + Sync>),
}

impl Clone for ChannelCallback {
    fn clone(&self) -> Self {
        match self {
            ChannelCallback::Task(f) => ChannelCallback::Task(f.clone()),
            ChannelCallback::Blocking(f) => ChannelCallback::Blocking(f.clone()),
        }
    }
}

/// One call leg tracked by a session.
///
/// Owned by the session's channel map; holds only a weak back-reference to
/// the session for issuing commands, so dropping the session tears down the
/// whole graph.
pub struct Channel {
    uuid: String,
    session: Weak<SessionInner>,
    data: Mutex<ChannelData>,
    gone: AtomicBool,
    handlers: Mutex<HashMap<HandlerKey, Vec<(u64, ChannelCallback)>>>,
    next_handler_id: AtomicU64,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("uuid", &self.uuid)
            .field("state", &self.state())
            .field("call_state", &self.call_state())
            .field("is_gone", &self.is_gone())
            .finish()
    }
}

fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Channel {
    pub(crate) fn new(
        uuid: impl Into<String>,
        session: Weak<SessionInner>,
        initial_state: ChannelState,
    ) -> Self {
        let uuid = uuid.into();
        info!(channel = %uuid, state = %initial_state, "channel created");
        Self {
            uuid,
            session,
            data: Mutex::new(ChannelData {
                state: initial_state,
                call_state: CallState::Down,
                variables: HashMap::new(),
            }),
            gone: AtomicBool::new(false),
            handlers: Mutex::new(HashMap::new()),
            next_handler_id: AtomicU64::new(0),
        }
    }

    /// Unique leg id.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Current core lifecycle state.
    pub fn state(&self) -> ChannelState {
        lock_ignore_poison(&self.data).state
    }

    /// Current call-progress state.
    pub fn call_state(&self) -> CallState {
        lock_ignore_poison(&self.data).call_state
    }

    /// Whether this leg hung up or was destroyed. Monotonic: once `true` it
    /// never reverts.
    pub fn is_gone(&self) -> bool {
        self.gone.load(Ordering::SeqCst)
    }

    /// Local value of one tracked variable.
    pub fn variable(&self, name: &str) -> Option<String> {
        lock_ignore_poison(&self.data).variables.get(name).cloned()
    }

    /// Snapshot of all tracked variables.
    pub fn variables(&self) -> HashMap<String, String> {
        lock_ignore_poison(&self.data).variables.clone()
    }

    fn session(&self) -> EslResult<Arc<SessionInner>> {
        self.session.upgrade().ok_or(EslError::NotConnected)
    }

    fn ensure_alive(&self) -> EslResult<()> {
        if self.is_gone() {
            return Err(EslError::ChannelGone {
                uuid: self.uuid.clone(),
            });
        }
        Ok(())
    }

    // --- handler registry --------------------------------------------------

    /// Register an async handler for an event key on this leg.
    ///
    /// Keys are wire event names, a `CUSTOM` subclass, or `"*"` for every
    /// event the leg receives.
    pub fn on<F, Fut>(&self, key: &str, handler: F) -> HandlerToken
    where
        F: Fn(Arc<Channel>, EslEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback = ChannelCallback::Task(Arc::new(move |channel, event| {
            let fut: BoxFuture<'static, ()> = Box::pin(handler(channel, event));
            fut
        }));
        self.register(key, callback)
    }

    /// Register a synchronous handler; it runs on the blocking pool so it
    /// cannot stall the event router.
    pub fn on_blocking<F>(&self, key: &str, handler: F) -> HandlerToken
    where
        F: Fn(Arc<Channel>, EslEvent) + Send + Sync + 'static,
    {
        self.register(key, ChannelCallback::Blocking(Arc::new(handler)))
    }

    fn register(&self, key: &str, callback: ChannelCallback) -> HandlerToken {
        let key = HandlerKey::from_key(key);
        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        debug!(channel = %self.uuid, key = ?key, "registering channel handler");
        lock_ignore_poison(&self.handlers)
            .entry(key.clone())
            .or_default()
            .push((id, callback));
        HandlerToken { key, id }
    }

    /// Remove a previously registered handler.
    pub fn remove_handler(&self, token: &HandlerToken) -> bool {
        let mut handlers = lock_ignore_poison(&self.handlers);
        if let Some(list) = handlers.get_mut(&token.key) {
            let before = list.len();
            list.retain(|(id, _)| *id != token.id);
            let removed = list.len() != before;
            if list.is_empty() {
                handlers.remove(&token.key);
            }
            return removed;
        }
        false
    }

    // --- state machine -----------------------------------------------------

    /// Apply one incoming event to this leg's state.
    ///
    /// Malformed numeric fields and unknown enum strings are logged and
    /// leave the previous value in place; the gone flag is recomputed on
    /// every event, not only terminal ones.
    pub fn update_state(&self, event: &EslEvent) {
        let mut data = lock_ignore_poison(&self.data);

        if let Some(raw) = event.header(EventHeader::ChannelStateNumber) {
            match raw.trim().parse::<u8>() {
                Ok(n) => match ChannelState::from_number(n) {
                    Some(state) => {
                        if data.state != state {
                            debug!(
                                channel = %self.uuid,
                                from = %data.state,
                                to = %state,
                                "channel state change"
                            );
                            data.state = state;
                        }
                    }
                    None => {
                        warn!(channel = %self.uuid, value = n, "channel state number out of range");
                    }
                },
                Err(_) => {
                    warn!(channel = %self.uuid, value = %raw, "non-integer channel state number");
                }
            }
        }

        if let Some(raw) = event.header(EventHeader::ChannelCallState) {
            match raw.parse::<CallState>() {
                Ok(call_state) => {
                    if data.call_state != call_state {
                        debug!(
                            channel = %self.uuid,
                            from = %data.call_state,
                            to = %call_state,
                            "call state change"
                        );
                        data.call_state = call_state;
                    }
                }
                Err(_) => {
                    warn!(channel = %self.uuid, value = %raw, "unknown call state");
                }
            }
        }

        for (key, value) in event.headers() {
            let value = value.first();
            let var_name = if let Some(stripped) = key.strip_prefix(VARIABLE_PREFIX) {
                Some(stripped)
            } else if IDENTITY_HEADERS.contains(&key.as_str()) {
                Some(key.as_str())
            } else {
                None
            };
            if let Some(name) = var_name {
                if data.variables.get(name).map(String::as_str) != Some(value) {
                    trace!(channel = %self.uuid, variable = name, value = %value, "variable update");
                    data.variables.insert(name.to_string(), value.to_string());
                }
            }
        }

        let gone_now =
            data.call_state == CallState::Hangup || data.state == ChannelState::CsDestroy;
        drop(data);

        if gone_now && !self.gone.swap(true, Ordering::SeqCst) {
            debug!(channel = %self.uuid, "channel marked gone");
        }
    }

    /// Update state, then fan the event out to this leg's handlers.
    pub(crate) fn handle_event(self: &Arc<Self>, event: &EslEvent) {
        self.update_state(event);

        let Some(key) = event.dispatch_key() else {
            return;
        };

        let callbacks: Vec<ChannelCallback> = {
            let handlers = lock_ignore_poison(&self.handlers);
            let mut list: Vec<ChannelCallback> = Vec::new();
            if let Some(exact) = handlers.get(&HandlerKey::Exact(key.to_string())) {
                list.extend(exact.iter().map(|(_, cb)| cb.clone()));
            }
            // Subclassed CUSTOM events also reach generic CUSTOM handlers.
            if event.event_name() == Some("CUSTOM") && key != "CUSTOM" {
                if let Some(custom) = handlers.get(&HandlerKey::Exact("CUSTOM".to_string())) {
                    list.extend(custom.iter().map(|(_, cb)| cb.clone()));
                }
            }
            if let Some(any) = handlers.get(&HandlerKey::Any) {
                list.extend(any.iter().map(|(_, cb)| cb.clone()));
            }
            list
        };

        for callback in callbacks {
            match callback {
                ChannelCallback::Task(f) => {
                    spawn_task_handler(f(self.clone(), event.clone()));
                }
                ChannelCallback::Blocking(f) => {
                    let channel = self.clone();
                    let event = event.clone();
                    spawn_blocking_handler(move || f(channel, event));
                }
            }
        }
    }

    // --- leg operations ----------------------------------------------------

    /// Run a dialplan application on this leg.
    ///
    /// Returns a live [`CommandResult`]; await it for the completion event,
    /// which also resolves with [`EslError::Interrupted`] if the leg hangs
    /// up first.
    pub async fn execute(&self, application: &str, data: Option<&str>) -> EslResult<CommandResult> {
        self.ensure_alive()?;
        let session = self.session()?;
        session
            .sendmsg(SendMsg::execute(application, data).for_channel(self.uuid.as_str()))
            .await
    }

    async fn execute_and_wait(
        &self,
        application: &str,
        data: Option<&str>,
    ) -> EslResult<CommandResult> {
        let result = self.execute(application, data).await?;
        result.wait().await?;
        Ok(result)
    }

    /// Hang this leg up.
    ///
    /// A leg already hanging up (or gone) is not sent a redundant command;
    /// the returned result is synthesized as already complete.
    pub async fn hangup(&self, cause: &str) -> EslResult<CommandResult> {
        let state = self.state();
        if self.is_gone() || matches!(state, ChannelState::CsHangup | ChannelState::CsDestroy) {
            info!(channel = %self.uuid, "already hanging up, skipping redundant hangup");
            let mut reply = EslEvent::new();
            reply.set_header("Reply-Text", "+OK channel already hung up");
            return Ok(CommandResult::completed("hangup", "", Some(cause), reply));
        }
        let session = self.session()?;
        session
            .sendmsg(SendMsg::hangup(cause).for_channel(self.uuid.as_str()))
            .await
    }

    /// Answer the leg and wait for the application to complete.
    pub async fn answer(&self) -> EslResult<CommandResult> {
        self.execute_and_wait("answer", None).await
    }

    /// Park the leg.
    pub async fn park(&self) -> EslResult<CommandResult> {
        self.execute_and_wait("park", None).await
    }

    /// Play an audio file and wait for playback to finish.
    pub async fn playback(&self, path: &str) -> EslResult<CommandResult> {
        self.execute_and_wait("playback", Some(path)).await
    }

    /// Play `ms` milliseconds of silence.
    pub async fn silence(&self, ms: u32) -> EslResult<CommandResult> {
        let path = format!("silence_stream://{ms}");
        self.playback(&path).await
    }

    /// Speak text through the `say` application.
    pub async fn say(&self, say: &Say) -> EslResult<CommandResult> {
        self.execute_and_wait("say", Some(&say.to_string())).await
    }

    /// Collect DTMF digits with `play_and_get_digits`.
    pub async fn play_and_get_digits(&self, args: &PlayAndGetDigits) -> EslResult<CommandResult> {
        self.execute_and_wait("play_and_get_digits", Some(&args.to_string()))
            .await
    }

    /// Set a channel variable on this leg (does not wait for completion).
    pub async fn set_variable(&self, name: &str, value: &str) -> EslResult<CommandResult> {
        self.execute("set", Some(&format!("{name}={value}"))).await
    }

    /// Read a variable from the local snapshot. Snapshot freshness depends
    /// on event delivery for this leg.
    pub async fn get_variable(&self, name: &str) -> EslResult<Option<String>> {
        self.ensure_alive()?;
        Ok(self.variable(name))
    }

    /// Bridge this leg to a dial string, creating the B-leg.
    ///
    /// The B-leg channel is pre-created and registered with the session
    /// *before* the bridge command resolves, so events for the new id are
    /// never orphaned. Caller identity is copied from this leg into the
    /// origination variables unless already supplied.
    pub async fn bridge(
        &self,
        target: &str,
        variables: Variables,
        await_completion: bool,
    ) -> EslResult<(CommandResult, Arc<Channel>)> {
        self.ensure_alive()?;
        let session = self.session()?;

        let bleg_uuid = Uuid::new_v4().to_string();
        let bridge_app_uuid = Uuid::new_v4().to_string();

        let mut vars = variables;
        vars.insert("origination_uuid", bleg_uuid.clone());
        self.propagate_caller_identity(&mut vars);

        let dial_string = format!("{vars}{target}");
        info!(channel = %self.uuid, bleg = %bleg_uuid, target = %dial_string, "bridging");

        let bleg = Arc::new(Channel::new(
            bleg_uuid.clone(),
            Arc::downgrade(&session),
            ChannelState::CsNew,
        ));
        session.register_channel(bleg.clone());

        // The bridge can still work without the narrowed event scope.
        if let Err(err) = session.filter_unique_id(&bleg_uuid).await {
            warn!(bleg = %bleg_uuid, error = %err, "failed to scope events to the new leg");
        }

        let result = session
            .sendmsg(
                SendMsg::execute("bridge", Some(&dial_string))
                    .for_channel(self.uuid.as_str())
                    .with_event_uuid(bridge_app_uuid.as_str()),
            )
            .await?;

        if await_completion {
            result.wait().await?;
        }

        Ok((result, bleg))
    }

    fn propagate_caller_identity(&self, vars: &mut Variables) {
        let data = lock_ignore_poison(&self.data);
        let pairs = [
            ("origination_caller_id_name", "Caller-Caller-ID-Name"),
            ("origination_caller_id_number", "Caller-Caller-ID-Number"),
        ];
        for (var, header) in pairs {
            if !vars.contains(var) {
                if let Some(value) = data.variables.get(header) {
                    if !value.is_empty() {
                        vars.insert(var, value.as_str());
                    }
                }
            }
            // An empty identity renders as a broken dial string.
            if let Some(VariableValue::Str(s)) = vars.get(var) {
                if s.is_empty() {
                    vars.remove(var);
                }
            }
        }
    }

    /// Bridge this leg to another already-tracked leg via `uuid_bridge`.
    /// No new channel is created.
    pub async fn bridge_channel(&self, other: &Channel) -> EslResult<BackgroundJob> {
        self.ensure_alive()?;
        let session = self.session()?;
        info!(channel = %self.uuid, other = %other.uuid(), "bridging to existing leg");
        let job = session
            .bgapi(
                &UuidBridge {
                    leg_a: self.uuid.clone(),
                    leg_b: other.uuid().to_string(),
                }
                .to_string(),
                None,
            )
            .await?;
        job.wait().await?;
        Ok(job)
    }

    /// Tear this leg out of its bridge.
    ///
    /// With `park` both legs go to the park target; otherwise the leg is
    /// transferred to `destination` (or simply unbridged when absent).
    pub async fn unbridge(
        &self,
        destination: Option<&str>,
        park: bool,
    ) -> EslResult<BackgroundJob> {
        self.ensure_alive()?;
        let session = self.session()?;

        let transfer = if park {
            UuidTransfer::park(self.uuid.as_str())
        } else {
            UuidTransfer {
                uuid: self.uuid.clone(),
                destination: destination.map(str::to_string),
                both: false,
            }
        };
        info!(channel = %self.uuid, command = %transfer, "unbridging");

        let job = session.bgapi(&transfer.to_string(), None).await?;
        job.wait().await?;
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached_channel() -> Channel {
        Channel::new("test-uuid", Weak::new(), ChannelState::CsNew)
    }

    fn event_with(headers: &[(&str, &str)]) -> EslEvent {
        let mut event = EslEvent::new();
        for (key, value) in headers {
            event.set_header(*key, *value);
        }
        event
    }

    #[test]
    fn state_updates_from_number() {
        let channel = detached_channel();
        channel.update_state(&event_with(&[("Channel-State-Number", "4")]));
        assert_eq!(channel.state(), ChannelState::CsExecute);
    }

    #[test]
    fn invalid_state_number_keeps_previous_value() {
        let channel = detached_channel();
        channel.update_state(&event_with(&[("Channel-State-Number", "4")]));
        channel.update_state(&event_with(&[("Channel-State-Number", "99")]));
        assert_eq!(channel.state(), ChannelState::CsExecute);
        channel.update_state(&event_with(&[("Channel-State-Number", "not-a-number")]));
        assert_eq!(channel.state(), ChannelState::CsExecute);
    }

    #[test]
    fn call_state_is_case_insensitive_with_early_media_alias() {
        let channel = detached_channel();
        channel.update_state(&event_with(&[("Channel-Call-State", "active")]));
        assert_eq!(channel.call_state(), CallState::Active);
        channel.update_state(&event_with(&[("Channel-Call-State", "EARLY_MEDIA")]));
        assert_eq!(channel.call_state(), CallState::Early);
    }

    #[test]
    fn unknown_call_state_keeps_previous_value() {
        let channel = detached_channel();
        channel.update_state(&event_with(&[("Channel-Call-State", "RINGING")]));
        channel.update_state(&event_with(&[("Channel-Call-State", "BOGUS")]));
        assert_eq!(channel.call_state(), CallState::Ringing);
    }

    #[test]
    fn variables_merge_prefix_and_identity_headers() {
        let channel = detached_channel();
        channel.update_state(&event_with(&[
            ("variable_hangup_after_bridge", "true"),
            ("Caller-Caller-ID-Name", "Alice"),
            ("Ignored-Header", "nope"),
        ]));
        assert_eq!(
            channel.variable("hangup_after_bridge").as_deref(),
            Some("true")
        );
        assert_eq!(
            channel.variable("Caller-Caller-ID-Name").as_deref(),
            Some("Alice")
        );
        assert_eq!(channel.variable("Ignored-Header"), None);
    }

    #[test]
    fn gone_flag_is_monotonic() {
        let channel = detached_channel();
        channel.update_state(&event_with(&[("Channel-Call-State", "HANGUP")]));
        assert!(channel.is_gone());

        // A later non-terminal event must not resurrect the leg.
        channel.update_state(&event_with(&[
            ("Channel-Call-State", "ACTIVE"),
            ("Channel-State-Number", "4"),
        ]));
        assert!(channel.is_gone());
    }

    #[test]
    fn destroy_state_also_marks_gone() {
        let channel = detached_channel();
        channel.update_state(&event_with(&[("Channel-State-Number", "12")]));
        assert!(channel.is_gone());
    }

    #[tokio::test]
    async fn operations_on_gone_channel_fail_fast() {
        let channel = detached_channel();
        channel.update_state(&event_with(&[("Channel-Call-State", "HANGUP")]));
        match channel.execute("playback", Some("/tmp/a.wav")).await {
            Err(EslError::ChannelGone { uuid }) => assert_eq!(uuid, "test-uuid"),
            other => panic!("expected channel-gone error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hangup_on_gone_channel_synthesizes_completed_result() {
        let channel = detached_channel();
        channel.update_state(&event_with(&[("Channel-Call-State", "HANGUP")]));
        let result = channel.hangup("NORMAL_CLEARING").await.unwrap();
        assert!(result.is_complete());
        assert_eq!(result.succeeded(), Some(true));
    }

    #[test]
    fn handler_tokens_remove_registrations() {
        let channel = detached_channel();
        let token = channel.on("CHANNEL_ANSWER", |_, _| async {});
        assert!(channel.remove_handler(&token));
        assert!(!channel.remove_handler(&token));
    }

    #[test]
    fn channel_state_round_trip() {
        assert_eq!("CS_EXECUTE".parse::<ChannelState>(), Ok(ChannelState::CsExecute));
        assert_eq!("cs_routing".parse::<ChannelState>(), Ok(ChannelState::CsRouting));
        assert!("CS_BOGUS".parse::<ChannelState>().is_err());
        assert_eq!(ChannelState::from_number(10), Some(ChannelState::CsHangup));
        assert_eq!(ChannelState::from_number(14), None);
        assert_eq!(ChannelState::CsDestroy.as_number(), 12);
        assert_eq!(ChannelState::CsHangup.to_string(), "CS_HANGUP");
    }
}
