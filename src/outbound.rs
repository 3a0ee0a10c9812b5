//! Acceptor boundary for outbound mode: the switch dials us, we run one
//! session per connection.

use crate::error::EslResult;
use crate::event::EventFormat;
use crate::session::{Session, SessionOptions};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Application entry point invoked with each established session.
pub type AppHandler =
    Arc<dyn Fn(Session) -> BoxFuture<'static, EslResult<()>> + Send + Sync + 'static>;

/// Accept-loop server for outbound connections.
///
/// Responsible only for accepting connections and constructing one
/// [`Session`] per connection; call control lives in the handler.
pub struct Outbound {
    bind_addr: String,
    handler: AppHandler,
    options: SessionOptions,
}

impl Outbound {
    /// Build a server that calls `handler` with each new session.
    pub fn new<F, Fut>(bind_addr: impl Into<String>, options: SessionOptions, handler: F) -> Self
    where
        F: Fn(Session) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EslResult<()>> + Send + 'static,
    {
        Self {
            bind_addr: bind_addr.into(),
            handler: Arc::new(move |session| {
                let fut: BoxFuture<'static, EslResult<()>> = Box::pin(handler(session));
                fut
            }),
            options,
        }
    }

    /// Bind and serve forever.
    pub async fn start(&self) -> EslResult<()> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        info!(addr = %self.bind_addr, "application server listening");
        serve(listener, self.handler.clone(), self.options.clone()).await
    }
}

/// Accept connections from an already-bound listener.
pub async fn serve(
    listener: TcpListener,
    handler: AppHandler,
    options: SessionOptions,
) -> EslResult<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(peer = %peer, "connection accepted");
        let handler = handler.clone();
        let options = options.clone();
        tokio::spawn(async move {
            handle_connection(stream, handler, options).await;
        });
    }
}

/// Establish one session over an accepted socket and run the application
/// handler against it.
async fn handle_connection(stream: TcpStream, handler: AppHandler, options: SessionOptions) {
    let myevents = options.myevents;
    let linger = options.linger;

    let session = match Session::attach(stream, options) {
        Ok(session) => session,
        Err(err) => {
            error!(error = %err, "failed to attach session");
            return;
        }
    };

    let outcome = establish(&session, myevents, linger).await;
    match outcome {
        Ok(()) => {
            let app = AssertUnwindSafe(handler(session.clone()));
            match app.catch_unwind().await {
                Ok(Ok(())) => debug!("application handler finished"),
                Ok(Err(err)) => {
                    error!(error = %err, "application handler failed");
                    hangup_on_error(&session).await;
                }
                Err(_) => {
                    error!("application handler panicked");
                    hangup_on_error(&session).await;
                }
            }
        }
        Err(err) => {
            error!(error = %err, "session establishment failed");
        }
    }

    session.stop().await;
}

/// Handshake and subscription sequence for a fresh outbound session.
async fn establish(session: &Session, myevents: bool, linger: bool) -> EslResult<()> {
    session.connect().await?;

    if session.channel_a().is_none() {
        warn!("connect reply did not establish a primary leg");
    }

    if myevents {
        session.myevents(EventFormat::Plain).await?;
    } else {
        session.subscribe_events(EventFormat::Plain, "ALL").await?;
    }

    if linger {
        session.linger(None).await?;
    }

    Ok(())
}

/// Best-effort hangup of the primary leg after a handler failure.
async fn hangup_on_error(session: &Session) {
    if let Some(channel_a) = session.channel_a() {
        if !channel_a.is_gone() {
            info!(channel = channel_a.uuid(), "hanging up after handler error");
            if let Err(err) = channel_a.hangup("SYSTEM_ERROR").await {
                error!(error = %err, "hangup after handler error failed");
            }
        }
    }
}
