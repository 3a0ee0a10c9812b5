//! Session lifecycle: reader/router tasks, command correlation and the
//! channel registry.

use crate::channel::{Channel, ChannelState};
use crate::command::{
    classify_job_outcome, reply_into_result, BackgroundJob, CommandResult, EslCommand, ResultCell,
    SendMsg,
};
use crate::commands::{Originate, PlayAndGetDigits, Say};
use crate::constants::{
    CONTENT_TYPE_COMMAND_REPLY, DEFAULT_TIMEOUT_MS, HEADER_CONTENT_DISPOSITION, ROUTER_POLL_MS,
    SOCKET_BUF_SIZE,
};
use crate::error::{EslError, EslResult};
use crate::event::{EslEvent, EslEventType, EventFormat};
use crate::headers::EventHeader;
use crate::protocol::{EslParser, MessageType};
use crate::variables::Variables;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn, Instrument, Span};
use uuid::Uuid;

fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Registry key for event handlers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum HandlerKey {
    Exact(String),
    Any,
}

impl HandlerKey {
    pub(crate) fn from_key(key: &str) -> Self {
        if key == "*" {
            HandlerKey::Any
        } else {
            HandlerKey::Exact(key.to_string())
        }
    }
}

/// Opaque handle returned by handler registration, used for removal.
#[derive(Debug, Clone)]
pub struct HandlerToken {
    pub(crate) key: HandlerKey,
    pub(crate) id: u64,
}

pub(crate) enum SessionCallback {
    Task(Arc<dyn Fn(EslEvent) -> BoxFuture<'static, ()> + Send + Sync>),
    Blocking(Arc<dyn Fn(EslEvent) + Send + Sync>),
}

impl Clone for SessionCallback {
    fn clone(&self) -> Self {
        match self {
            SessionCallback::Task(f) => SessionCallback::Task(f.clone()),
            SessionCallback::Blocking(f) => SessionCallback::Blocking(f.clone()),
        }
    }
}

/// Run an async handler isolated from the router: a panic is caught and
/// logged, never propagated.
pub(crate) fn spawn_task_handler(fut: BoxFuture<'static, ()>) {
    tokio::spawn(async move {
        if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
            error!("event handler panicked");
        }
    });
}

/// Run a synchronous handler on the blocking pool so it cannot stall the
/// router.
pub(crate) fn spawn_blocking_handler<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        if tokio::task::spawn_blocking(f).await.is_err() {
            error!("blocking event handler panicked");
        }
    });
}

/// Parameters fixed at session construction time.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Subscribe with `myevents` instead of per-leg filters. This limits
    /// delivery to the first leg, so bridge/originate legs get no events.
    pub myevents: bool,
    /// Ask the switch to keep the socket open after hangup.
    pub linger: bool,
    /// Default bound on every reply wait; `None` waits indefinitely.
    pub reply_timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            myevents: false,
            linger: true,
            reply_timeout: None,
        }
    }
}

struct PendingExecute {
    app_uuid: String,
    channel_uuid: Option<String>,
    cell: Arc<ResultCell>,
}

/// Shared session state owned by the [`Session`] handle and referenced
/// weakly by channels.
pub(crate) struct SessionInner {
    options: SessionOptions,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    replies: tokio::sync::Mutex<mpsc::UnboundedReceiver<EslEvent>>,
    connected: watch::Sender<bool>,
    auth_ready: watch::Sender<bool>,
    context: Mutex<Option<EslEvent>>,
    channels: Mutex<HashMap<String, Arc<Channel>>>,
    channel_a: Mutex<Option<Arc<Channel>>>,
    channel_a_assigned: AtomicBool,
    handlers: Mutex<HashMap<HandlerKey, Vec<(u64, SessionCallback)>>>,
    next_handler_id: AtomicU64,
    pending_executes: Mutex<Vec<PendingExecute>>,
    pending_jobs: Mutex<HashMap<String, Arc<ResultCell>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    span: Span,
}

impl SessionInner {
    fn new(
        options: SessionOptions,
        writer: Option<OwnedWriteHalf>,
        span: Span,
    ) -> (Arc<Self>, mpsc::UnboundedSender<EslEvent>) {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let (connected, _) = watch::channel(true);
        let (auth_ready, _) = watch::channel(false);
        let inner = Arc::new(Self {
            options,
            writer: tokio::sync::Mutex::new(writer),
            replies: tokio::sync::Mutex::new(reply_rx),
            connected,
            auth_ready,
            context: Mutex::new(None),
            channels: Mutex::new(HashMap::new()),
            channel_a: Mutex::new(None),
            channel_a_assigned: AtomicBool::new(false),
            handlers: Mutex::new(HashMap::new()),
            next_handler_id: AtomicU64::new(0),
            pending_executes: Mutex::new(Vec::new()),
            pending_jobs: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            span,
        });
        (inner, reply_tx)
    }

    pub(crate) fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Write one command frame and await the next FIFO reply.
    ///
    /// The writer lock is held through the reply await so concurrent senders
    /// cannot interleave: reply attribution relies on the peer answering
    /// synchronous commands strictly in send order.
    pub(crate) async fn send_raw(
        &self,
        cmd: &str,
        reply_timeout: Option<Duration>,
    ) -> EslResult<EslEvent> {
        if !self.is_connected() {
            return Err(EslError::NotConnected);
        }

        let first_line = cmd.lines().next().unwrap_or_default();
        if first_line.starts_with("auth ") {
            debug!("sending command: auth [REDACTED]");
        } else {
            debug!(command = %first_line, "sending command");
        }

        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(EslError::NotConnected)?;

        let mut wire = String::with_capacity(cmd.len() + 2);
        for line in cmd.lines() {
            wire.push_str(line);
            wire.push('\n');
        }
        wire.push('\n');
        writer.write_all(wire.as_bytes()).await?;
        writer.flush().await?;

        let mut replies = self.replies.lock().await;
        let effective_timeout = reply_timeout.or(self.options.reply_timeout);
        let reply = match effective_timeout {
            Some(bound) => match timeout(bound, replies.recv()).await {
                Ok(reply) => reply,
                Err(_) => {
                    warn!(command = %first_line, "timed out waiting for reply");
                    return Err(EslError::Timeout {
                        timeout_ms: bound.as_millis() as u64,
                    });
                }
            },
            None => replies.recv().await,
        };
        reply.ok_or(EslError::ConnectionClosed)
    }

    /// Send a leg-directed command frame.
    ///
    /// `execute`-class commands register the completion/interruption race
    /// *before* the frame is written, then return a live [`CommandResult`].
    /// Other commands resolve immediately from the synchronous reply.
    pub(crate) async fn sendmsg(self: &Arc<Self>, mut msg: SendMsg) -> EslResult<CommandResult> {
        if msg.is_execute() && msg.event_uuid.is_none() {
            msg = msg.with_event_uuid(Uuid::new_v4().to_string());
        }

        let cell = ResultCell::new();
        let result = CommandResult::pending(
            &msg.command,
            msg.application.as_deref().unwrap_or_default(),
            msg.data.as_deref(),
            msg.event_uuid.clone(),
            msg.uuid.clone(),
            cell.clone(),
        );
        let text = msg.to_command_string()?;

        if msg.is_execute() {
            let app_uuid = msg.event_uuid.clone().unwrap_or_default();
            debug!(
                app_uuid = %app_uuid,
                channel = msg.uuid.as_deref().unwrap_or("<session>"),
                application = msg.application.as_deref().unwrap_or_default(),
                "registering execute correlation"
            );
            lock_ignore_poison(&self.pending_executes).push(PendingExecute {
                app_uuid: app_uuid.clone(),
                channel_uuid: msg.uuid.clone(),
                cell: cell.clone(),
            });

            match self.send_raw(&text, None).await {
                Ok(reply) => {
                    result.set_initial_reply(reply);
                    Ok(result)
                }
                Err(err) => {
                    lock_ignore_poison(&self.pending_executes)
                        .retain(|pending| pending.app_uuid != app_uuid);
                    Err(err)
                }
            }
        } else {
            let reply = self.send_raw(&text, None).await?;
            result.set_initial_reply(reply.clone());
            cell.resolve(reply_into_result(reply));
            Ok(result)
        }
    }

    /// Issue an asynchronous API command tracked by job id.
    pub(crate) async fn bgapi(
        self: &Arc<Self>,
        command: &str,
        job_uuid: Option<String>,
    ) -> EslResult<BackgroundJob> {
        let job_uuid = job_uuid.unwrap_or_else(|| Uuid::new_v4().to_string());
        let cell = ResultCell::new();
        lock_ignore_poison(&self.pending_jobs).insert(job_uuid.clone(), cell.clone());

        let wire = EslCommand::BgApi {
            command: command.to_string(),
            job_uuid: Some(job_uuid.clone()),
        }
        .to_command_string()?;

        match self.send_raw(&wire, None).await {
            Ok(reply) => match reply_into_result(reply) {
                Ok(_) => Ok(BackgroundJob::new(job_uuid, command.to_string(), cell)),
                Err(err) => {
                    lock_ignore_poison(&self.pending_jobs).remove(&job_uuid);
                    Err(err)
                }
            },
            Err(err) => {
                lock_ignore_poison(&self.pending_jobs).remove(&job_uuid);
                Err(err)
            }
        }
    }

    /// Narrow event delivery to one leg id.
    pub(crate) async fn filter_unique_id(&self, uuid: &str) -> EslResult<()> {
        let cmd = EslCommand::Filter {
            header: EventHeader::UniqueId.to_string(),
            value: uuid.to_string(),
        }
        .to_command_string()?;
        let reply = self.send_raw(&cmd, None).await?;
        reply_into_result(reply).map(|_| ())
    }

    /// Register a pre-created channel (bridge/originate B-legs).
    pub(crate) fn register_channel(&self, channel: Arc<Channel>) {
        lock_ignore_poison(&self.channels).insert(channel.uuid().to_string(), channel);
    }

    fn remove_channel(&self, uuid: &str) {
        lock_ignore_poison(&self.channels).remove(uuid);
    }

    pub(crate) fn channel(&self, uuid: &str) -> Option<Arc<Channel>> {
        lock_ignore_poison(&self.channels).get(uuid).cloned()
    }

    /// Resolve terminal events against outstanding executes and jobs.
    fn resolve_correlations(&self, event: &EslEvent) {
        match event.event_type() {
            Some(EslEventType::ChannelExecuteComplete) => {
                let Some(app_uuid) = event.application_uuid() else {
                    return;
                };
                let pending = {
                    let mut executes = lock_ignore_poison(&self.pending_executes);
                    executes
                        .iter()
                        .position(|p| p.app_uuid == app_uuid)
                        .map(|idx| executes.swap_remove(idx))
                };
                if let Some(pending) = pending {
                    debug!(app_uuid = %app_uuid, "execute completed");
                    pending.cell.resolve(Ok(event.clone()));
                }
            }
            Some(EslEventType::ChannelHangup) | Some(EslEventType::ChannelDestroy) => {
                let Some(uuid) = event.unique_id() else {
                    return;
                };
                let interrupted: Vec<PendingExecute> = {
                    let mut executes = lock_ignore_poison(&self.pending_executes);
                    let mut taken = Vec::new();
                    let mut idx = 0;
                    while idx < executes.len() {
                        if executes[idx].channel_uuid.as_deref() == Some(uuid) {
                            taken.push(executes.swap_remove(idx));
                        } else {
                            idx += 1;
                        }
                    }
                    taken
                };
                for pending in interrupted {
                    warn!(
                        app_uuid = %pending.app_uuid,
                        channel = %uuid,
                        interrupted_by = event.event_name().unwrap_or_default(),
                        "execute interrupted before completion"
                    );
                    pending.cell.resolve(Err(EslError::Interrupted {
                        app_uuid: pending.app_uuid,
                        channel_uuid: uuid.to_string(),
                    }));
                }
            }
            Some(EslEventType::BackgroundJob) => {
                let Some(job_uuid) = event.job_uuid() else {
                    return;
                };
                let cell = lock_ignore_poison(&self.pending_jobs).remove(job_uuid);
                if let Some(cell) = cell {
                    debug!(job_uuid = %job_uuid, "background job completed");
                    cell.resolve(classify_job_outcome(event.clone()));
                }
            }
            _ => {}
        }
    }

    /// Route a channel-scoped event to its leg, creating or removing legs
    /// as the event dictates.
    pub(crate) fn dispatch_channel_event(self: &Arc<Self>, event: &EslEvent) {
        let target = event
            .header(EventHeader::ChannelUniqueId)
            .or_else(|| event.header(EventHeader::UniqueId))
            .map(str::to_string);
        let Some(uuid) = target else {
            trace!(
                event = event.event_name().or(event.content_type()).unwrap_or_default(),
                "event is not channel-scoped"
            );
            return;
        };

        let existing = self.channel(&uuid);
        match existing {
            Some(channel) => {
                channel.handle_event(event);
                if event.event_type() == Some(EslEventType::ChannelDestroy) {
                    info!(channel = %uuid, "channel destroyed, removing from session");
                    self.remove_channel(&uuid);
                    let mut channel_a = lock_ignore_poison(&self.channel_a);
                    if channel_a.as_ref().is_some_and(|a| a.uuid() == uuid) {
                        info!(channel = %uuid, "primary leg destroyed");
                        *channel_a = None;
                    }
                }
            }
            None => {
                let is_creation = matches!(
                    event.event_type(),
                    Some(EslEventType::ChannelCreate) | Some(EslEventType::ChannelData)
                );
                // The connect handshake reply establishes the primary leg: a
                // command/reply carrying channel state before any A-leg
                // exists.
                let is_initial_connect_reply = !self.channel_a_assigned.load(Ordering::SeqCst)
                    && event.content_type() == Some(CONTENT_TYPE_COMMAND_REPLY)
                    && event.header(EventHeader::ChannelState).is_some();

                if !is_creation && !is_initial_connect_reply {
                    debug!(
                        channel = %uuid,
                        event = event.event_name().or(event.content_type()).unwrap_or_default(),
                        "dropping event for unknown leg"
                    );
                    return;
                }

                let channel = Arc::new(Channel::new(
                    uuid.clone(),
                    Arc::downgrade(self),
                    ChannelState::CsNew,
                ));
                self.register_channel(channel.clone());

                if !self.channel_a_assigned.swap(true, Ordering::SeqCst) {
                    info!(channel = %uuid, "assigned as primary leg");
                    *lock_ignore_poison(&self.channel_a) = Some(channel.clone());
                }

                // Narrow event delivery to the new leg. Spawned: the router
                // must not block on its own reply queue. The initial leg's
                // subscription breadth is established by the caller's
                // subsequent subscription command.
                if !self.options.myevents && !is_initial_connect_reply {
                    let inner = self.clone();
                    let filter_uuid = uuid.clone();
                    tokio::spawn(
                        async move {
                            if let Err(err) = inner.filter_unique_id(&filter_uuid).await {
                                warn!(channel = %filter_uuid, error = %err, "failed to scope events to new leg");
                            }
                        }
                        .in_current_span(),
                    );
                }

                channel.handle_event(event);
            }
        }
    }

    /// Fan an event out to session-level handlers.
    fn fan_out(&self, event: &EslEvent) {
        let Some(key) = event.dispatch_key() else {
            return;
        };

        let callbacks: Vec<SessionCallback> = {
            let handlers = lock_ignore_poison(&self.handlers);
            let mut list = Vec::new();
            if let Some(exact) = handlers.get(&HandlerKey::Exact(key.to_string())) {
                list.extend(exact.iter().map(|(_, cb)| cb.clone()));
            }
            if let Some(any) = handlers.get(&HandlerKey::Any) {
                list.extend(any.iter().map(|(_, cb)| cb.clone()));
            }
            list
        };

        for callback in callbacks {
            match callback {
                SessionCallback::Task(f) => spawn_task_handler(f(event.clone())),
                SessionCallback::Blocking(f) => {
                    let event = event.clone();
                    spawn_blocking_handler(move || f(event));
                }
            }
        }
    }

    /// Mark the session disconnected. Socket teardown happens in `stop()`
    /// or when the peer closes; taking the writer lock here could deadlock
    /// against a sender holding it through its reply wait.
    fn begin_shutdown(&self) {
        self.connected.send_replace(false);
    }

    /// Resolve every outstanding operation with a connection-closed error.
    fn fail_pending(&self) {
        let executes = std::mem::take(&mut *lock_ignore_poison(&self.pending_executes));
        for pending in executes {
            pending.cell.resolve(Err(EslError::ConnectionClosed));
        }
        let jobs = std::mem::take(&mut *lock_ignore_poison(&self.pending_jobs));
        for (_, cell) in jobs {
            cell.resolve(Err(EslError::ConnectionClosed));
        }
    }

    /// Originate a new leg and hand it to a continuation application.
    pub(crate) async fn originate(
        self: &Arc<Self>,
        destination: &str,
        variables: Variables,
        timeout_secs: Option<u64>,
        application_after: Option<&str>,
    ) -> EslResult<Arc<Channel>> {
        let leg_uuid = Uuid::new_v4().to_string();
        let mut vars = variables;
        vars.insert("origination_uuid", leg_uuid.clone());

        debug!(destination = %destination, leg = %leg_uuid, "originating new leg");

        if let Err(err) = self.filter_unique_id(&leg_uuid).await {
            return Err(originate_error(destination, &vars, err.to_string()));
        }

        let channel = Arc::new(Channel::new(
            leg_uuid.clone(),
            Arc::downgrade(self),
            ChannelState::CsNew,
        ));

        let command = Originate {
            destination: destination.to_string(),
            variables: vars.clone(),
            application_after: application_after.unwrap_or("park").to_string(),
            timeout: timeout_secs,
        };

        let job = match self.bgapi(&command.to_string(), None).await {
            Ok(job) => job,
            Err(err) => return Err(originate_error(destination, &vars, err.to_string())),
        };

        match job.wait().await {
            Ok(event) => {
                trace!(body = event.body().unwrap_or_default(), "originate job finished");
            }
            Err(EslError::CommandFailed { reply_text }) => {
                self.remove_channel(&leg_uuid);
                error!(destination = %destination, response = %reply_text, "originate failed");
                return Err(originate_error(destination, &vars, reply_text));
            }
            Err(err) => {
                self.remove_channel(&leg_uuid);
                return Err(originate_error(destination, &vars, err.to_string()));
            }
        }

        // Adopt the leg if a creation event already registered it; that live
        // channel carries the state the gone-check below must observe.
        let channel = lock_ignore_poison(&self.channels)
            .entry(leg_uuid.clone())
            .or_insert(channel)
            .clone();

        if channel.is_gone() {
            self.remove_channel(&leg_uuid);
            return Err(originate_error(
                destination,
                &vars,
                format!("channel {leg_uuid} disconnected immediately"),
            ));
        }

        info!(destination = %destination, leg = %leg_uuid, "leg originated");
        Ok(channel)
    }
}

fn originate_error(destination: &str, variables: &Variables, reason: String) -> EslError {
    EslError::Originate {
        destination: destination.to_string(),
        variables: variables.clone(),
        reason,
    }
}

/// Single ordered consumer over the parsed event queue.
pub(crate) struct Router {
    inner: Arc<SessionInner>,
    reply_tx: mpsc::UnboundedSender<EslEvent>,
}

impl Router {
    async fn run(self, mut events_rx: mpsc::UnboundedReceiver<EslEvent>) {
        let mut connected_rx = self.inner.connected.subscribe();
        loop {
            if !*connected_rx.borrow_and_update() {
                break;
            }
            // Bounded poll so the shutdown signal is observed while idle.
            match timeout(Duration::from_millis(ROUTER_POLL_MS), events_rx.recv()).await {
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(event)) => self.route(event),
            }
        }
        debug!("router exited");
        self.inner.fail_pending();
    }

    /// Classify one event and hand it to the right consumer.
    pub(crate) fn route(&self, event: EslEvent) {
        let message_type = event.content_type().map(MessageType::from_content_type);
        match message_type {
            Some(MessageType::AuthRequest) => {
                debug!("authentication challenge received");
                self.inner.auth_ready.send_replace(true);
                return;
            }
            Some(MessageType::CommandReply) | Some(MessageType::ApiResponse) => {
                if self.reply_tx.send(event).is_err() {
                    warn!("reply received but the session is gone");
                }
                return;
            }
            Some(MessageType::Disconnect) => {
                if event.header(HEADER_CONTENT_DISPOSITION) == Some("linger") {
                    debug!("disconnect notice with linger disposition, ignoring");
                    return;
                }
                info!("disconnect notice received, shutting down");
                self.inner.begin_shutdown();
                return;
            }
            Some(MessageType::Event) | Some(MessageType::Unknown(_)) | None => {}
        }

        if let Some(name) = event.event_name() {
            if let Some(uuid) = event.unique_id() {
                trace!(event = name, channel = uuid, "event received");
            } else {
                trace!(event = name, "event received");
            }
        }

        self.inner.resolve_correlations(&event);
        self.inner.dispatch_channel_event(&event);
        self.inner.fan_out(&event);
    }
}

/// Background reader: socket bytes → frame parser → event queue.
async fn reader_loop(
    reader: OwnedReadHalf,
    parser: EslParser,
    events_tx: mpsc::UnboundedSender<EslEvent>,
    connected: watch::Sender<bool>,
) {
    let inner_loop = AssertUnwindSafe(reader_loop_inner(reader, parser, events_tx, connected.clone()));
    if inner_loop.catch_unwind().await.is_err() {
        error!("reader task panicked");
        connected.send_replace(false);
    }
}

async fn reader_loop_inner(
    mut reader: OwnedReadHalf,
    mut parser: EslParser,
    events_tx: mpsc::UnboundedSender<EslEvent>,
    connected: watch::Sender<bool>,
) {
    let mut read_buffer = vec![0u8; SOCKET_BUF_SIZE];
    loop {
        loop {
            match parser.parse_frame() {
                Ok(Some(events)) => {
                    for event in events {
                        if events_tx.send(event).is_err() {
                            debug!("event queue closed, reader exiting");
                            return;
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "frame parser error, disconnecting");
                    connected.send_replace(false);
                    return;
                }
            }
        }

        match reader.read(&mut read_buffer).await {
            Ok(0) => {
                info!("connection closed by peer");
                connected.send_replace(false);
                return;
            }
            Ok(n) => {
                trace!(bytes = n, "read from socket");
                if let Err(err) = parser.add_data(&read_buffer[..n]) {
                    warn!(error = %err, "parse buffer overflow, disconnecting");
                    connected.send_replace(false);
                    return;
                }
            }
            Err(err) => {
                warn!(error = %err, "socket read error");
                connected.send_replace(false);
                return;
            }
        }
    }
}

/// One control connection to the switch.
///
/// Cheap to clone; all clones share the same connection and channel
/// registry. Construct with [`attach`](Self::attach) for an accepted
/// outbound socket, or [`connect_to`](Self::connect_to) to dial and
/// authenticate inbound.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Session {
    /// Take over an accepted connection and start the reader/router tasks.
    pub fn attach(stream: TcpStream, options: SessionOptions) -> EslResult<Session> {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        let span = tracing::info_span!("esl_session", peer = %peer);

        let (read_half, write_half) = stream.into_split();
        let (inner, reply_tx) = SessionInner::new(options, Some(write_half), span.clone());

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(
            reader_loop(
                read_half,
                EslParser::new(),
                events_tx,
                inner.connected.clone(),
            )
            .instrument(span.clone()),
        );

        let router = Router {
            inner: inner.clone(),
            reply_tx,
        };
        let router_task = tokio::spawn(router.run(events_rx).instrument(span.clone()));

        {
            let mut tasks = lock_ignore_poison(&inner.tasks);
            tasks.push(reader);
            tasks.push(router_task);
        }

        info!(parent: &span, "session attached");
        Ok(Session { inner })
    }

    /// Dial the switch and authenticate with a password (inbound mode).
    pub async fn connect_to(
        host: &str,
        port: u16,
        password: &str,
        options: SessionOptions,
    ) -> EslResult<Session> {
        info!(host = %host, port = port, "connecting to switch");
        let connect_timeout = Duration::from_millis(DEFAULT_TIMEOUT_MS);
        let stream = match timeout(connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                warn!(error = %err, "TCP connect failed");
                return Err(err.into());
            }
            Err(_) => {
                warn!("TCP connect timed out");
                return Err(EslError::Timeout {
                    timeout_ms: DEFAULT_TIMEOUT_MS,
                });
            }
        };

        let session = Session::attach(stream, options)?;

        // Wait for the auth challenge routed by the router task.
        let mut auth_rx = session.inner.auth_ready.subscribe();
        let challenge = async {
            loop {
                if *auth_rx.borrow_and_update() {
                    return true;
                }
                if auth_rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        match timeout(connect_timeout, challenge).await {
            Ok(true) => {}
            Ok(false) => {
                session.stop().await;
                return Err(EslError::ConnectionClosed);
            }
            Err(_) => {
                session.stop().await;
                return Err(EslError::Timeout {
                    timeout_ms: DEFAULT_TIMEOUT_MS,
                });
            }
        }

        let auth = EslCommand::Auth {
            password: password.to_string(),
        }
        .to_command_string()?;
        let reply = session.send(&auth).await?;
        if !reply.is_success_reply() {
            let reason = reply.reply_text().unwrap_or("authentication failed").to_string();
            session.stop().await;
            return Err(EslError::AuthFailed { reason });
        }

        info!("authenticated");
        Ok(session)
    }

    /// Whether the connection is still alive.
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Handshake headers captured from the connect reply.
    pub fn context(&self) -> Option<EslEvent> {
        lock_ignore_poison(&self.inner.context).clone()
    }

    /// Look up one tracked leg.
    pub fn channel(&self, uuid: &str) -> Option<Arc<Channel>> {
        self.inner.channel(uuid)
    }

    /// Snapshot of all tracked legs.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        lock_ignore_poison(&self.inner.channels)
            .values()
            .cloned()
            .collect()
    }

    /// The primary (first-learned) leg, if still alive.
    pub fn channel_a(&self) -> Option<Arc<Channel>> {
        lock_ignore_poison(&self.inner.channel_a).clone()
    }

    // --- handler registry --------------------------------------------------

    /// Register an async handler for an event key (`"*"` for all events).
    pub fn on<F, Fut>(&self, key: &str, handler: F) -> HandlerToken
    where
        F: Fn(EslEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback = SessionCallback::Task(Arc::new(move |event| {
            let fut: BoxFuture<'static, ()> = Box::pin(handler(event));
            fut
        }));
        self.register(key, callback)
    }

    /// Register a synchronous handler, offloaded to the blocking pool.
    pub fn on_blocking<F>(&self, key: &str, handler: F) -> HandlerToken
    where
        F: Fn(EslEvent) + Send + Sync + 'static,
    {
        self.register(key, SessionCallback::Blocking(Arc::new(handler)))
    }

    fn register(&self, key: &str, callback: SessionCallback) -> HandlerToken {
        let key = HandlerKey::from_key(key);
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed);
        debug!(key = ?key, "registering session handler");
        lock_ignore_poison(&self.inner.handlers)
            .entry(key.clone())
            .or_default()
            .push((id, callback));
        HandlerToken { key, id }
    }

    /// Remove a previously registered handler.
    pub fn remove_handler(&self, token: &HandlerToken) -> bool {
        let mut handlers = lock_ignore_poison(&self.inner.handlers);
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

    // --- protocol operations -----------------------------------------------

    /// Send a raw command and await its reply.
    pub async fn send(&self, command: &str) -> EslResult<EslEvent> {
        self.inner.send_raw(command, None).await
    }

    /// Send a raw command with a bounded reply wait.
    pub async fn send_timeout(
        &self,
        command: &str,
        reply_timeout: Duration,
    ) -> EslResult<EslEvent> {
        self.inner.send_raw(command, Some(reply_timeout)).await
    }

    /// Establish the outbound session: send `connect`, store the returned
    /// channel data as session context and learn the primary leg from it.
    pub async fn connect(&self) -> EslResult<EslEvent> {
        let cmd = EslCommand::Connect.to_command_string()?;
        let reply = self.inner.send_raw(&cmd, None).await?;
        *lock_ignore_poison(&self.inner.context) = Some(reply.clone());
        self.inner.dispatch_channel_event(&reply);
        Ok(reply)
    }

    /// Subscribe to events: `event <format> <names>` (e.g. `"ALL"`).
    pub async fn subscribe_events(&self, format: EventFormat, events: &str) -> EslResult<()> {
        let cmd = EslCommand::Events {
            format: format.to_string(),
            events: events.to_string(),
        }
        .to_command_string()?;
        let reply = self.inner.send_raw(&cmd, None).await?;
        reply_into_result(reply).map(|_| ())?;
        info!(events = %events, "subscribed to events");
        Ok(())
    }

    /// Subscribe to all events of the attached session (outbound mode).
    pub async fn myevents(&self, format: EventFormat) -> EslResult<()> {
        let cmd = EslCommand::MyEvents {
            format: format.to_string(),
        }
        .to_command_string()?;
        let reply = self.inner.send_raw(&cmd, None).await?;
        reply_into_result(reply).map(|_| ())
    }

    /// Keep the socket open after hangup.
    pub async fn linger(&self, timeout_secs: Option<u32>) -> EslResult<()> {
        let cmd = EslCommand::Linger {
            timeout: timeout_secs,
        }
        .to_command_string()?;
        let reply = self.inner.send_raw(&cmd, None).await?;
        reply_into_result(reply).map(|_| ())
    }

    /// Run a blocking API command and return its response.
    pub async fn api(&self, command: &str) -> EslResult<EslEvent> {
        let cmd = EslCommand::Api {
            command: command.to_string(),
        }
        .to_command_string()?;
        let reply = self.inner.send_raw(&cmd, None).await?;
        reply_into_result(reply)
    }

    /// Run an asynchronous API command; the returned job resolves when its
    /// completion event arrives.
    pub async fn bgapi(&self, command: &str) -> EslResult<BackgroundJob> {
        self.inner.bgapi(command, None).await
    }

    /// Run an asynchronous API command under a caller-chosen job id.
    pub async fn bgapi_with_job_uuid(
        &self,
        command: &str,
        job_uuid: &str,
    ) -> EslResult<BackgroundJob> {
        self.inner.bgapi(command, Some(job_uuid.to_string())).await
    }

    /// Send a leg-directed command frame.
    pub async fn sendmsg(&self, msg: SendMsg) -> EslResult<CommandResult> {
        self.inner.sendmsg(msg).await
    }

    // --- call control on the attached leg ----------------------------------

    async fn execute_attached(
        &self,
        application: &str,
        data: Option<&str>,
    ) -> EslResult<CommandResult> {
        let result = self
            .inner
            .sendmsg(SendMsg::execute(application, data))
            .await?;
        result.wait().await?;
        Ok(result)
    }

    /// Answer the call attached to this session.
    pub async fn answer(&self) -> EslResult<CommandResult> {
        self.execute_attached("answer", None).await
    }

    /// Park the attached call.
    pub async fn park(&self) -> EslResult<CommandResult> {
        self.execute_attached("park", None).await
    }

    /// Hang the attached call up.
    pub async fn hangup(&self, cause: &str) -> EslResult<CommandResult> {
        self.execute_attached("hangup", Some(cause)).await
    }

    /// Play an audio file to the attached call and wait for completion.
    pub async fn playback(&self, path: &str) -> EslResult<CommandResult> {
        self.execute_attached("playback", Some(path)).await
    }

    /// Speak text through the `say` application.
    pub async fn say(&self, say: &Say) -> EslResult<CommandResult> {
        self.execute_attached("say", Some(&say.to_string())).await
    }

    /// Collect DTMF digits with `play_and_get_digits`.
    pub async fn play_and_get_digits(&self, args: &PlayAndGetDigits) -> EslResult<CommandResult> {
        self.execute_attached("play_and_get_digits", Some(&args.to_string()))
            .await
    }

    /// Write a message to the switch log.
    pub async fn log(&self, level: &str, message: &str) -> EslResult<CommandResult> {
        self.execute_attached("log", Some(&format!("{level} {message}")))
            .await
    }

    // --- composed call control ---------------------------------------------

    /// Bridge a leg to a dial string; see [`Channel::bridge`].
    pub async fn bridge(
        &self,
        channel: &Arc<Channel>,
        target: &str,
        variables: Variables,
        await_completion: bool,
    ) -> EslResult<(CommandResult, Arc<Channel>)> {
        channel.bridge(target, variables, await_completion).await
    }

    /// Tear a leg out of its bridge; see [`Channel::unbridge`].
    pub async fn unbridge(
        &self,
        channel: &Arc<Channel>,
        destination: Option<&str>,
        park: bool,
    ) -> EslResult<BackgroundJob> {
        channel.unbridge(destination, park).await
    }

    /// Originate a new leg: scope filter, `originate` background job, then
    /// registration of the answered leg. A failed job raises
    /// [`EslError::Originate`] carrying the destination and attempted
    /// variables, and registers nothing.
    pub async fn originate(
        &self,
        destination: &str,
        variables: Variables,
        timeout_secs: Option<u64>,
        application_after: Option<&str>,
    ) -> EslResult<Arc<Channel>> {
        self.inner
            .originate(destination, variables, timeout_secs, application_after)
            .await
    }

    /// Stop the session: cancel the reader and router tasks, close the
    /// connection and unwind every pending operation. Idempotent.
    pub async fn stop(&self) {
        let was_connected = self.inner.connected.send_replace(false);
        if was_connected {
            debug!("stopping session");
        }

        // Cancel the tasks first: dropping the router releases the reply
        // queue, which unblocks any sender holding the writer lock.
        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *lock_ignore_poison(&self.inner.tasks));
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }

        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            if let Err(err) = writer.shutdown().await {
                debug!(error = %err, "writer shutdown");
            }
        }

        self.inner.fail_pending();
    }

    /// Span carrying this session's identity, for application-side logging.
    pub fn span(&self) -> Span {
        self.inner.span.clone()
    }
}
