//! Transparent WebSocket bridge.
//!
//! Clients connect to a local listener; for each accepted client the bridge
//! dials one configured server (directly or through an HTTP CONNECT proxy)
//! and relays every message in both directions without looking inside it.
//!
//! # Architecture
//!
//! ```text
//! Client  <--WS-->  ws-bridge  <--WS[S]-->  [HTTP proxy]  -->  Server
//!                      |
//!            [pump: client -> server]
//!            [pump: server -> client]
//!                      |
//!                [Termination]
//! ```
//!
//! Each session runs two independent pumps. A pump moves one message at a
//! time, kind and payload unchanged, from a [`MessageSource`] to a
//! [`MessageSink`]. When either pump stops the session's [`Termination`]
//! fires, the other pump stops at its next read, and both connections are
//! closed. Ping, pong and close messages are relayed like data messages.

pub mod accept;
pub mod dial;
pub mod endpoint;
mod head;
pub mod listener;
pub mod proxy;
pub mod relay;
pub mod session;
pub mod termination;
pub mod ws;

pub use accept::{upgrade, UpgradeError};
pub use dial::{DialError, Dialer, ServerStream};
pub use endpoint::{ConfigError, Credentials, Endpoint, ProxyEndpoint};
pub use listener::{Bridge, BridgeConfig, ListenError};
pub use proxy::{EnvProxy, ProxyError, ProxyPolicy};
pub use relay::{relay, MessageKind, MessageSink, MessageSource, MessageWriter, RelayError};
pub use session::{Direction, Session, SessionSummary};
pub use termination::Termination;
