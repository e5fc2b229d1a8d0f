//! One bridged pair of connections, from dial to teardown.
//!
//! A session moves through `Pairing -> Relaying -> Terminating -> Closed`.
//! While relaying, two pump tasks run independently, one per direction.
//! Whichever pump stops first fires the session's [`Termination`]; the other
//! pump then stops at its next read and both connections are closed.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::dial::{DialError, Dialer};
use crate::relay::{relay, MessageSink, MessageSource};
use crate::termination::Termination;
use crate::ws::{WsSink, WsSource};

/// Direction of message flow through the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::ClientToServer => "client->server",
            Direction::ServerToClient => "server->client",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Pairing,
    Relaying,
    Terminating,
    Closed,
}

/// What happened during a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// The pump whose exit fired termination. `None` only if neither pump
    /// got to report, which happens when a pump task panics.
    pub initiator: Option<Direction>,
    pub client_to_server: u64,
    pub server_to_client: u64,
}

pub struct Session {
    id: Uuid,
    remote_addr: Option<SocketAddr>,
    close_timeout: Duration,
    state: SessionState,
}

impl Session {
    /// `close_timeout` bounds the close handshake on each side at teardown.
    pub fn new(remote_addr: Option<SocketAddr>, close_timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            close_timeout,
            state: SessionState::Pairing,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Dial the server for an accepted client and bridge the two.
    ///
    /// If the dial fails the client connection is closed without relaying
    /// anything and the dial error is returned.
    pub async fn run<C>(
        mut self,
        mut client: WebSocketStream<C>,
        dialer: &Dialer,
    ) -> Result<SessionSummary, DialError>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        tracing::info!(session_id = %self.id, uri = %dialer.target(), "connecting to server");

        let server = match dialer.dial().await {
            Ok(server) => server,
            Err(err) => {
                self.transition(SessionState::Terminating);
                close_quietly(&mut client, self.close_timeout, "client").await;
                self.transition(SessionState::Closed);
                return Err(err);
            }
        };

        tracing::info!(session_id = %self.id, uri = %dialer.target(), "server has connected");
        Ok(self.bridge(client, server).await)
    }

    /// Relay between two established connections until either side stops.
    pub async fn bridge<C, S>(
        &mut self,
        client: WebSocketStream<C>,
        server: WebSocketStream<S>,
    ) -> SessionSummary
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.transition(SessionState::Relaying);

        let termination = Termination::new();
        let (client_write, client_read) = client.split();
        let (server_write, server_read) = server.split();

        let upstream = tokio::spawn(pump(
            WsSource::new(client_read, termination.clone()),
            WsSink::new(server_write),
            Direction::ClientToServer,
            termination.clone(),
            self.id,
        ));
        let downstream = tokio::spawn(pump(
            WsSource::new(server_read, termination.clone()),
            WsSink::new(client_write),
            Direction::ServerToClient,
            termination.clone(),
            self.id,
        ));

        termination.triggered().await;
        self.transition(SessionState::Terminating);

        let (upstream, downstream) = tokio::join!(upstream, downstream);
        let mut summary = SessionSummary {
            initiator: None,
            client_to_server: 0,
            server_to_client: 0,
        };

        // Each pump hands back the writer of the connection it was feeding.
        match upstream {
            Ok(pumped) => {
                summary.client_to_server = pumped.relayed;
                if pumped.initiated {
                    summary.initiator = Some(Direction::ClientToServer);
                }
                close_quietly(&mut pumped.sink.into_inner(), self.close_timeout, "server").await;
            }
            Err(err) => tracing::error!(session_id = %self.id, %err, "client->server pump failed"),
        }
        match downstream {
            Ok(pumped) => {
                summary.server_to_client = pumped.relayed;
                if pumped.initiated {
                    summary.initiator = Some(Direction::ServerToClient);
                }
                close_quietly(&mut pumped.sink.into_inner(), self.close_timeout, "client").await;
            }
            Err(err) => tracing::error!(session_id = %self.id, %err, "server->client pump failed"),
        }

        self.transition(SessionState::Closed);
        summary
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!(
            session_id = %self.id,
            remote_addr = ?self.remote_addr,
            from = ?self.state,
            to = ?next,
            "session state changed"
        );
        self.state = next;
    }
}

struct Pumped<K> {
    sink: K,
    relayed: u64,
    initiated: bool,
}

/// Fires termination when a pump exits, including by panic.
struct TriggerOnExit(Termination);

impl Drop for TriggerOnExit {
    fn drop(&mut self) {
        self.0.trigger();
    }
}

async fn pump<Src, Snk>(
    mut source: Src,
    mut sink: Snk,
    direction: Direction,
    termination: Termination,
    session_id: Uuid,
) -> Pumped<Snk>
where
    Src: MessageSource,
    Snk: MessageSink,
{
    let _guard = TriggerOnExit(termination.clone());
    let mut relayed = 0_u64;

    while !termination.is_triggered() {
        match relay(&mut source, &mut sink).await {
            Ok(kind) => {
                relayed += 1;
                tracing::trace!(%session_id, %direction, %kind, "message relayed");
            }
            Err(err) if err.is_closed() => {
                tracing::debug!(%session_id, %direction, %err, "relay stopped");
                break;
            }
            Err(err) => {
                tracing::warn!(%session_id, %direction, %err, "relay failed");
                break;
            }
        }
    }

    let initiated = termination.trigger();
    if initiated {
        tracing::debug!(%session_id, %direction, relayed, "terminating session");
    }

    Pumped {
        sink,
        relayed,
        initiated,
    }
}

/// Send a close frame and flush, giving up after `timeout`.
async fn close_quietly<K>(sink: &mut K, timeout: Duration, side: &str)
where
    K: Sink<Message, Error = WsError> + Unpin,
{
    match tokio::time::timeout(timeout, sink.close()).await {
        Ok(Ok(())) => tracing::trace!(side, "connection closed"),
        Ok(Err(err)) => tracing::trace!(side, %err, "close after connection ended"),
        Err(_) => tracing::debug!(side, ?timeout, "close handshake timed out"),
    }
}
