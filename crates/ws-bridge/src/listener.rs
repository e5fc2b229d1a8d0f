use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};

use crate::accept::upgrade;
use crate::dial::{DialError, Dialer};
use crate::endpoint::Endpoint;
use crate::proxy::ProxyPolicy;
use crate::session::Session;

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for the WebSocket bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Host to bind the listening socket to.
    pub listen_host: String,
    /// Port to bind the listening socket to. `0` picks a free port.
    pub listen_port: u16,
    /// Server every accepted client is bridged to. Its path is also the
    /// path clients must request.
    pub target: Endpoint,
    /// How outbound connections pick a proxy.
    pub proxy: ProxyPolicy,
    /// Bound on each handshake: inbound upgrade, outbound dial, and the
    /// close handshake at teardown.
    pub handshake_timeout: Duration,
}

impl BridgeConfig {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const DEFAULT_PORT: u16 = 8080;
    pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Defaults for everything except the target.
    pub fn new(target: Endpoint) -> Self {
        Self {
            listen_host: Self::DEFAULT_HOST.to_string(),
            listen_port: Self::DEFAULT_PORT,
            target,
            proxy: ProxyPolicy::Environment,
            handshake_timeout: Self::DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// The URL clients connect to, e.g. `ws://127.0.0.1:8080/echo`.
    pub fn listen_url(&self) -> String {
        let host = if self.listen_host.contains(':') && !self.listen_host.starts_with('[') {
            format!("[{}]", self.listen_host)
        } else {
            self.listen_host.clone()
        };
        format!("ws://{host}:{}{}", self.listen_port, self.target.path())
    }
}

#[derive(Debug, Error)]
pub enum ListenError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// The WebSocket bridge server.
///
/// Accepts client WebSocket connections on the target's path, opens a
/// matching connection to the target server for each, and relays messages
/// in both directions until either side goes away.
pub struct Bridge {
    config: Arc<BridgeConfig>,
    dialer: Arc<Dialer>,
}

impl Bridge {
    /// Create a bridge. Fails only if the TLS client setup for a secure
    /// target cannot be built.
    pub fn new(config: BridgeConfig) -> Result<Self, DialError> {
        let dialer = Dialer::new(
            config.target.clone(),
            config.proxy.clone(),
            config.handshake_timeout,
        )?;
        Ok(Self {
            config: Arc::new(config),
            dialer: Arc::new(dialer),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Bind the listening socket.
    pub async fn bind(&self) -> Result<TcpListener, ListenError> {
        let host = crate::endpoint::strip_brackets(&self.config.listen_host);
        TcpListener::bind((host, self.config.listen_port))
            .await
            .map_err(|source| ListenError::Bind {
                addr: format!("{}:{}", self.config.listen_host, self.config.listen_port),
                source,
            })
    }

    /// Bind and serve forever.
    pub async fn run(&self) -> Result<(), ListenError> {
        let listener = self.bind().await?;
        self.serve(listener).await;
        Ok(())
    }

    /// Accept connections on `listener` forever.
    pub async fn serve(&self, listener: TcpListener) {
        self.serve_with_shutdown(listener, std::future::pending())
            .await
    }

    /// Accept connections until `shutdown` completes.
    ///
    /// Each connection is handled in its own task. Sessions already running
    /// when `shutdown` completes are not waited for.
    pub async fn serve_with_shutdown<F>(&self, listener: TcpListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        match listener.local_addr() {
            Ok(addr) => tracing::info!(%addr, target = %self.config.target, "ws-bridge listening"),
            Err(err) => tracing::warn!(%err, "ws-bridge listening on unknown address"),
        }

        tokio::pin!(shutdown);
        loop {
            let (stream, remote_addr) = tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested, no longer accepting connections");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        tracing::warn!(%err, "failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            let config = Arc::clone(&self.config);
            let dialer = Arc::clone(&self.dialer);
            tokio::spawn(handle_connection(stream, remote_addr, config, dialer));
        }
    }
}

/// Handle a single TCP connection from accept through relay and teardown.
async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    config: Arc<BridgeConfig>,
    dialer: Arc<Dialer>,
) {
    if let Err(err) = stream.set_nodelay(true) {
        tracing::debug!(%remote_addr, %err, "failed to set TCP_NODELAY");
    }

    let session = Session::new(Some(remote_addr), config.handshake_timeout);
    let session_id = session.id();

    let client = match upgrade(stream, config.target.path(), config.handshake_timeout).await {
        Ok(ws) => ws,
        Err(err) => {
            tracing::warn!(%session_id, %remote_addr, %err, "failed to upgrade client connection");
            return;
        }
    };
    tracing::info!(%session_id, %remote_addr, "client has connected");

    match session.run(client, &dialer).await {
        Ok(summary) => tracing::info!(
            %session_id,
            %remote_addr,
            initiator = ?summary.initiator,
            client_to_server = summary.client_to_server,
            server_to_client = summary.server_to_client,
            "bridge connection terminated"
        ),
        Err(err) => tracing::error!(
            %session_id,
            %remote_addr,
            uri = %dialer.target(),
            %err,
            "failed to connect to server"
        ),
    }
}
