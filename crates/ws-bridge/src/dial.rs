use std::io;
use std::sync::Arc;
use std::time::Duration;

use http::header::AUTHORIZATION;
use http::HeaderValue;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::endpoint::{strip_brackets, Endpoint};
use crate::proxy::{connect_tunnel, ProxyError, ProxyPolicy};

/// The outbound half of a session.
pub type ServerStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Failure to open the outbound connection.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("handshake with {url} failed: {source}")]
    Handshake {
        url: String,
        #[source]
        source: WsError,
    },

    #[error("dial timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to build TLS client configuration: {0}")]
    Tls(#[from] rustls::Error),
}

/// Opens WebSocket connections to the bridge target.
///
/// One dial attempt is made per call; there is no retry.
pub struct Dialer {
    target: Endpoint,
    proxy: ProxyPolicy,
    handshake_timeout: Duration,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl Dialer {
    /// Create a dialer. TLS roots are loaded up front for secure targets.
    pub fn new(
        target: Endpoint,
        proxy: ProxyPolicy,
        handshake_timeout: Duration,
    ) -> Result<Self, DialError> {
        let tls = if target.is_secure() {
            Some(Arc::new(tls_client_config()?))
        } else {
            None
        };

        Ok(Self {
            target,
            proxy,
            handshake_timeout,
            tls,
        })
    }

    pub fn target(&self) -> &Endpoint {
        &self.target
    }

    /// Connect to the target, through a proxy if the policy selects one.
    ///
    /// The handshake timeout covers the whole dial: TCP connect, proxy
    /// tunnel, TLS and the WebSocket handshake.
    pub async fn dial(&self) -> Result<ServerStream, DialError> {
        match tokio::time::timeout(self.handshake_timeout, self.dial_once()).await {
            Ok(result) => result,
            Err(_) => Err(DialError::Timeout(self.handshake_timeout)),
        }
    }

    async fn dial_once(&self) -> Result<ServerStream, DialError> {
        let stream = match self.proxy.resolve(&self.target)? {
            Some(proxy) => {
                let (host, port) = proxy.connect_addr();
                debug!(proxy = %proxy, target = %self.target, "dialing through proxy");
                let mut stream = connect_tcp(&host, port).await?;
                connect_tunnel(&mut stream, &proxy, &self.target).await?;
                stream
            }
            None => connect_tcp(strip_brackets(self.target.host()), self.target.port()).await?,
        };

        let url = self.target.websocket_url();
        let mut request = match url.as_str().into_client_request() {
            Ok(request) => request,
            Err(source) => return Err(DialError::Handshake { url, source }),
        };
        if let Some(credentials) = self.target.credentials() {
            let value = match HeaderValue::from_str(&credentials.basic_auth()) {
                Ok(value) => value,
                Err(err) => {
                    let source = WsError::HttpFormat(err.into());
                    return Err(DialError::Handshake { url, source });
                }
            };
            debug!(user = credentials.user(), "sending basic authorization to server");
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let connector = self
            .tls
            .as_ref()
            .map(|config| Connector::Rustls(Arc::clone(config)));

        let (ws, response) =
            tokio_tungstenite::client_async_tls_with_config(request, stream, None, connector)
                .await
                .map_err(|source| DialError::Handshake { url, source })?;

        debug!(status = %response.status(), "server handshake complete");
        Ok(ws)
    }
}

async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream, DialError> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|source| DialError::Connect {
            addr: format!("{host}:{port}"),
            source,
        })?;
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%err, "failed to set TCP_NODELAY");
    }
    Ok(stream)
}

fn tls_client_config() -> Result<rustls::ClientConfig, rustls::Error> {
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        warn!(%err, "failed to load a native root certificate");
    }

    let mut roots = rustls::RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    debug!(added, ignored, "loaded native root certificates");

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    Ok(rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth())
}
