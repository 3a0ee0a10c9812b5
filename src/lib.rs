//! FreeSWITCH Event Socket session engine for Rust
//!
//! This crate drives a call switch over its Event Socket control protocol:
//! it parses the line-oriented wire framing, routes asynchronous events,
//! correlates commands (including background jobs) with their completions,
//! and tracks per-leg channel state so applications can bridge, unbridge and
//! originate calls.
//!
//! # Architecture
//!
//! One reader task parses frames off the socket into an event queue; one
//! router task classifies each event and fans it out to the reply queue,
//! pending-command correlation, the channel registry and registered
//! handlers. Application code talks to a [`Session`] (Clone + Send) and the
//! [`Channel`] handles it hands out.
//!
//! # Outbound mode
//!
//! The switch connects to *your* application (the `socket` dialplan
//! application); [`Outbound`] accepts those connections and runs your
//! handler with an established session:
//!
//! ```rust,no_run
//! use freeswitch_session_tokio::{EslResult, Outbound, Session, SessionOptions};
//!
//! #[tokio::main]
//! async fn main() -> EslResult<()> {
//!     let server = Outbound::new("0.0.0.0:9000", SessionOptions::default(), handle_call);
//!     server.start().await
//! }
//!
//! async fn handle_call(session: Session) -> EslResult<()> {
//!     let leg = session.channel_a().expect("primary leg");
//!     leg.answer().await?;
//!     leg.playback("ivr/ivr-welcome.wav").await?;
//!     leg.hangup("NORMAL_CLEARING").await?;
//!     Ok(())
//! }
//! ```
//!
//! Configure the switch to reach the application:
//! ```xml
//! <action application="socket" data="127.0.0.1:9000 async full"/>
//! ```
//!
//! # Inbound mode
//!
//! ```rust,no_run
//! use freeswitch_session_tokio::{EslResult, Session, SessionOptions};
//!
//! #[tokio::main]
//! async fn main() -> EslResult<()> {
//!     let session =
//!         Session::connect_to("localhost", 8021, "ClueCon", SessionOptions::default()).await?;
//!     let status = session.api("status").await?;
//!     println!("{}", status.body().unwrap_or(""));
//!     session.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Bridging
//!
//! ```rust,no_run
//! use freeswitch_session_tokio::{EslResult, Session, Variables};
//!
//! async fn bridge_out(session: &Session) -> EslResult<()> {
//!     let leg = session.channel_a().expect("primary leg");
//!     let mut vars = Variables::new();
//!     vars.insert("ignore_early_media", true);
//!     // The B-leg is registered with the session before the command
//!     // resolves.
//!     let (result, b_leg) = leg.bridge("user/1001", vars, false).await?;
//!     println!("dialing {}", b_leg.uuid());
//!     result.wait().await?;
//!     Ok(())
//! }
//! ```

#[macro_use]
mod macros;

pub mod channel;
pub mod command;
pub mod commands;
pub mod constants;
pub mod error;
pub mod event;
pub mod headers;
pub mod outbound;
pub mod session;
pub mod variables;

pub(crate) mod buffer;
pub(crate) mod protocol;

pub use channel::{CallState, Channel, ChannelState, ParseCallStateError, ParseChannelStateError};
pub use command::{BackgroundJob, CommandResult, EslCommand, ReplyStatus, SendMsg};
pub use commands::{Originate, PlayAndGetDigits, Say, UuidBridge, UuidTransfer};
pub use constants::DEFAULT_ESL_PORT;
pub use error::{EslError, EslResult};
pub use event::{EslEvent, EslEventType, EventFormat, HeaderValue, ParseEventTypeError};
pub use headers::EventHeader;
pub use outbound::{serve, AppHandler, Outbound};
pub use session::{HandlerToken, Session, SessionOptions};
pub use variables::{VariableValue, Variables};
