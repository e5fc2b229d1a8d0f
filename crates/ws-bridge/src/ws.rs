//! [`MessageSource`] / [`MessageSink`] adapters over tungstenite streams.
//!
//! tungstenite hands out whole reassembled messages, so a payload reader here
//! is a cursor over the received bytes and a writer collects the payload until
//! it is finished. Control messages are carried like any other message.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::AsyncWrite;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, Utf8Bytes};

use crate::relay::{MessageKind, MessageSink, MessageSource, MessageWriter, PayloadReader};
use crate::termination::Termination;

/// Reading half of a WebSocket connection.
///
/// A pending read fails with [`io::ErrorKind::ConnectionAborted`] once the
/// session's [`Termination`] fires, so an idle pump can observe teardown.
pub struct WsSource<S> {
    stream: S,
    termination: Termination,
}

impl<S> WsSource<S> {
    pub fn new(stream: S, termination: Termination) -> Self {
        Self {
            stream,
            termination,
        }
    }
}

#[async_trait]
impl<S> MessageSource for WsSource<S>
where
    S: Stream<Item = Result<Message, WsError>> + Send + Unpin,
{
    async fn next_reader(&mut self) -> io::Result<(MessageKind, PayloadReader)> {
        let next = tokio::select! {
            biased;
            _ = self.termination.triggered() => {
                return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "session terminated"));
            }
            next = self.stream.next() => next,
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(err)) => return Err(ws_io_error(err)),
            None => return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed")),
        };

        let (kind, payload) = split_message(message)?;
        Ok((kind, Box::new(io::Cursor::new(payload))))
    }
}

/// Writing half of a WebSocket connection.
pub struct WsSink<K> {
    sink: K,
}

impl<K> WsSink<K> {
    pub fn new(sink: K) -> Self {
        Self { sink }
    }

    pub fn into_inner(self) -> K {
        self.sink
    }
}

#[async_trait]
impl<K> MessageSink for WsSink<K>
where
    K: Sink<Message, Error = WsError> + Send + Unpin,
{
    async fn next_writer<'a>(
        &'a mut self,
        kind: MessageKind,
    ) -> io::Result<Box<dyn MessageWriter + 'a>> {
        futures_util::future::poll_fn(|cx| Pin::new(&mut self.sink).poll_ready(cx))
            .await
            .map_err(ws_io_error)?;

        Ok(Box::new(WsMessageWriter {
            sink: &mut self.sink,
            kind,
            buf: BytesMut::new(),
        }))
    }
}

/// Collects one message payload and sends it as a single WebSocket message.
pub struct WsMessageWriter<'a, K> {
    sink: &'a mut K,
    kind: MessageKind,
    buf: BytesMut,
}

impl<K> AsyncWrite for WsMessageWriter<'_, K>
where
    K: Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buf.put_slice(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl<K> MessageWriter for WsMessageWriter<'_, K>
where
    K: Sink<Message, Error = WsError> + Send + Unpin,
{
    async fn finish(self: Box<Self>) -> io::Result<()> {
        let WsMessageWriter { sink, kind, buf } = *self;
        let message = join_message(kind, buf.freeze())?;
        sink.send(message).await.map_err(ws_io_error)
    }
}

/// Break a tungstenite message into its type tag and raw payload.
///
/// A close message's payload is the close frame body as it appears on the
/// wire: the status code in network byte order followed by the reason.
pub fn split_message(message: Message) -> io::Result<(MessageKind, Bytes)> {
    let split = match message {
        Message::Text(text) => (MessageKind::Text, Bytes::from(text)),
        Message::Binary(data) => (MessageKind::Binary, data),
        Message::Ping(data) => (MessageKind::Ping, data),
        Message::Pong(data) => (MessageKind::Pong, data),
        Message::Close(None) => (MessageKind::Close, Bytes::new()),
        Message::Close(Some(frame)) => {
            let mut body = BytesMut::with_capacity(2 + frame.reason.len());
            body.put_u16(u16::from(frame.code));
            body.put_slice(frame.reason.as_bytes());
            (MessageKind::Close, body.freeze())
        }
        Message::Frame(_) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected raw frame",
            ))
        }
    };
    Ok(split)
}

/// Inverse of [`split_message`].
pub fn join_message(kind: MessageKind, payload: Bytes) -> io::Result<Message> {
    let message = match kind {
        MessageKind::Text => Message::Text(Utf8Bytes::try_from(payload).map_err(invalid_data)?),
        MessageKind::Binary => Message::Binary(payload),
        MessageKind::Ping => Message::Ping(payload),
        MessageKind::Pong => Message::Pong(payload),
        MessageKind::Close if payload.is_empty() => Message::Close(None),
        MessageKind::Close => {
            if payload.len() < 2 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "close payload shorter than a status code",
                ));
            }
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            let reason = Utf8Bytes::try_from(payload.slice(2..)).map_err(invalid_data)?;
            Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason,
            }))
        }
    };
    Ok(message)
}

fn invalid_data<E>(err: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Map a tungstenite error onto an [`io::Error`] whose kind tells a normal
/// close apart from a fault.
pub(crate) fn ws_io_error(err: WsError) -> io::Error {
    match err {
        WsError::Io(err) => err,
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            io::Error::new(io::ErrorKind::NotConnected, err)
        }
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            io::Error::new(io::ErrorKind::ConnectionReset, err)
        }
        other => io::Error::other(other),
    }
}
