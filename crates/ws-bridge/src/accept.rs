use std::io;
use std::time::Duration;

use http::{StatusCode, Version};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::handshake::server::{
    create_response, Request as HsRequest, Response as HsResponse,
};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::head::read_head;

/// Failure to turn an inbound connection into a WebSocket.
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("upgrade timed out after {0:?}")]
    Timeout(Duration),

    /// The request was answered with `status` and the connection closed.
    #[error("upgrade request rejected with {status}: {reason}")]
    Rejected { status: StatusCode, reason: String },

    #[error("upgrade I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Run the server side of the WebSocket handshake on `stream`.
///
/// Only requests for `path` are accepted. A request for any other path is
/// answered with `404 Not Found`; a request that is not a valid WebSocket
/// upgrade gets `400 Bad Request`. `timeout` bounds the negotiation only.
pub async fn upgrade<S>(
    mut stream: S,
    path: &str,
    timeout: Duration,
) -> Result<WebSocketStream<S>, UpgradeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(timeout, negotiate(&mut stream, path)).await {
        Ok(Ok(())) => Ok(WebSocketStream::from_raw_socket(stream, Role::Server, None).await),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(UpgradeError::Timeout(timeout)),
    }
}

async fn negotiate<S>(stream: &mut S, path: &str) -> Result<(), UpgradeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let head = match read_head(stream).await {
        Ok(head) => head,
        Err(err) if err.kind() == io::ErrorKind::InvalidData => {
            return reject(stream, StatusCode::BAD_REQUEST, err.to_string()).await;
        }
        Err(err) => return Err(err.into()),
    };

    let request = match parse_request(&head) {
        Ok(request) => request,
        Err(reason) => return reject(stream, StatusCode::BAD_REQUEST, reason).await,
    };
    let response = match create_response(&request) {
        Ok(response) => response,
        Err(err) => return reject(stream, StatusCode::BAD_REQUEST, err.to_string()).await,
    };

    let requested = request.uri().path();
    if requested != path {
        debug!(path = %requested, "upgrade request for unknown path");
        let reason = format!("no bridge at '{requested}'");
        return reject(stream, StatusCode::NOT_FOUND, reason).await;
    }

    stream.write_all(&response_head(&response)).await?;
    stream.flush().await?;
    Ok(())
}

/// Answer with `status`, close the write side and report the rejection.
async fn reject<S>(stream: &mut S, status: StatusCode, reason: String) -> Result<(), UpgradeError>
where
    S: AsyncWrite + Unpin,
{
    let body = status.canonical_reason().unwrap_or("Error");
    let response = format!(
        "HTTP/1.1 {status}\r\n\
         Connection: close\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {body}",
        body.len()
    );

    let written = async {
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await
    }
    .await;
    if let Err(err) = written {
        debug!(%err, %status, "failed to send upgrade rejection");
    }

    Err(UpgradeError::Rejected { status, reason })
}

fn parse_request(head: &str) -> Result<HsRequest, String> {
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();

    let mut parts = request_line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(format!("malformed request line '{request_line}'"));
    };
    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => return Err(format!("unsupported protocol '{other}'")),
    };

    let mut builder = http::Request::builder()
        .method(method)
        .uri(target)
        .version(version);
    for line in lines.take_while(|line| !line.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| format!("malformed header line '{line}'"))?;
        builder = builder.header(name.trim(), value.trim());
    }
    builder.body(()).map_err(|err| err.to_string())
}

fn response_head(response: &HsResponse) -> Vec<u8> {
    let mut head = format!("HTTP/1.1 {}\r\n", response.status()).into_bytes();
    for (name, value) in response.headers() {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}
