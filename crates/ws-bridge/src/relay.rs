use std::fmt;
use std::io;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Type tag of a relayed message.
///
/// The bridge never looks inside a payload; the tag is all it needs to
/// re-emit the message with the same framing on the other side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    Binary,
    Ping,
    Pong,
    Close,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Text => "text",
            MessageKind::Binary => "binary",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::Close => "close",
        };
        f.write_str(name)
    }
}

/// Payload of a single message, consumed as a byte stream.
pub type PayloadReader = Box<dyn AsyncRead + Send + Unpin>;

/// The receiving side of a message connection.
#[async_trait]
pub trait MessageSource: Send {
    /// Wait for the next message and return its type tag together with a
    /// reader over its payload.
    async fn next_reader(&mut self) -> io::Result<(MessageKind, PayloadReader)>;
}

/// The sending side of a message connection.
#[async_trait]
pub trait MessageSink: Send {
    /// Open a writer for one outgoing message of the given kind.
    ///
    /// The message is not committed until [`MessageWriter::finish`] returns.
    async fn next_writer<'a>(
        &'a mut self,
        kind: MessageKind,
    ) -> io::Result<Box<dyn MessageWriter + 'a>>;
}

/// Writer for a single outgoing message.
#[async_trait]
pub trait MessageWriter: AsyncWrite + Send + Unpin {
    /// Seal the message and hand it to the transport.
    async fn finish(self: Box<Self>) -> io::Result<()>;
}

/// Why a single [`relay`] call failed. Every variant ends the pump loop.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to get next reader: {0}")]
    Read(#[source] io::Error),

    #[error("failed to get next writer ({kind}): {source}")]
    WriteAcquisition {
        kind: MessageKind,
        #[source]
        source: io::Error,
    },

    #[error("failed to copy data: {0}")]
    Copy(#[source] io::Error),

    #[error("failed to close writer: {0}")]
    Finalize(#[source] io::Error),
}

impl RelayError {
    fn io_error(&self) -> &io::Error {
        match self {
            RelayError::Read(err)
            | RelayError::Copy(err)
            | RelayError::Finalize(err)
            | RelayError::WriteAcquisition { source: err, .. } => err,
        }
    }

    /// Returns `true` when the error only reports that one side of the
    /// session went away, as opposed to a transport or protocol fault.
    pub fn is_closed(&self) -> bool {
        matches!(
            self.io_error().kind(),
            io::ErrorKind::NotConnected
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof
        )
    }
}

/// Relay exactly one message from `source` to `destination`.
///
/// Reads the next message, opens a writer of the same kind on the
/// destination, streams the payload across and finalizes the writer. The
/// writer is finalized even for peers that may already be broken, since
/// finalizing is the only thing that commits the message; a failure there is
/// reported as [`RelayError::Finalize`].
///
/// If the destination refuses a writer, the payload is drained and discarded
/// so the source stays on a message boundary.
///
/// Call this in a loop to bridge a whole connection.
pub async fn relay<S, D>(source: &mut S, destination: &mut D) -> Result<MessageKind, RelayError>
where
    S: MessageSource + ?Sized,
    D: MessageSink + ?Sized,
{
    let (kind, mut reader) = source.next_reader().await.map_err(RelayError::Read)?;

    let mut writer = match destination.next_writer(kind).await {
        Ok(writer) => writer,
        Err(err) => {
            if let Err(drain_err) = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
                tracing::trace!(%kind, err = %drain_err, "failed to drain refused message");
            }
            return Err(RelayError::WriteAcquisition { kind, source: err });
        }
    };

    tokio::io::copy(&mut reader, &mut writer)
        .await
        .map_err(RelayError::Copy)?;
    drop(reader);

    writer.finish().await.map_err(RelayError::Finalize)?;
    Ok(kind)
}

#[cfg(test)]
pub(crate) mod fakes {
    //! Scripted in-memory connections for exercising [`relay`].

    use std::collections::VecDeque;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};

    use async_trait::async_trait;
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

    use super::{MessageKind, MessageSink, MessageSource, MessageWriter, PayloadReader};

    /// Payload reader that hands out `chunk` bytes per read, optionally
    /// failing once `fail_at` bytes have been delivered.
    pub struct FakePayload {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
        fail_at: Option<usize>,
        consumed: Arc<AtomicUsize>,
    }

    impl AsyncRead for FakePayload {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if let Some(limit) = self.fail_at {
                if self.pos >= limit {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "payload interrupted",
                    )));
                }
            }
            let end = self
                .data
                .len()
                .min(self.pos + self.chunk)
                .min(self.pos + buf.remaining());
            let end = match self.fail_at {
                Some(limit) => end.min(limit),
                None => end,
            };
            let start = self.pos;
            buf.put_slice(&self.data[start..end]);
            self.pos = end;
            self.consumed.fetch_add(end - start, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }
    }

    pub enum Step {
        Message(MessageKind, Vec<u8>),
        Broken {
            kind: MessageKind,
            payload: Vec<u8>,
            fail_at: usize,
        },
        Fail(io::ErrorKind),
    }

    pub struct ScriptedSource {
        steps: VecDeque<Step>,
        chunk: usize,
        /// Total payload bytes pulled out of every reader handed out so far.
        pub consumed: Arc<AtomicUsize>,
    }

    impl ScriptedSource {
        pub fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: steps.into(),
                chunk: 3,
                consumed: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn messages<'a>(messages: impl IntoIterator<Item = (MessageKind, &'a [u8])>) -> Self {
            Self::new(
                messages
                    .into_iter()
                    .map(|(kind, payload)| Step::Message(kind, payload.to_vec()))
                    .collect(),
            )
        }

        fn payload(&self, data: Vec<u8>, fail_at: Option<usize>) -> PayloadReader {
            Box::new(FakePayload {
                data,
                pos: 0,
                chunk: self.chunk,
                fail_at,
                consumed: Arc::clone(&self.consumed),
            })
        }
    }

    #[async_trait]
    impl MessageSource for ScriptedSource {
        async fn next_reader(&mut self) -> io::Result<(MessageKind, PayloadReader)> {
            match self.steps.pop_front() {
                Some(Step::Message(kind, payload)) => Ok((kind, self.payload(payload, None))),
                Some(Step::Broken {
                    kind,
                    payload,
                    fail_at,
                }) => Ok((kind, self.payload(payload, Some(fail_at)))),
                Some(Step::Fail(kind)) => Err(io::Error::new(kind, "scripted read failure")),
                None => Err(io::Error::new(io::ErrorKind::NotConnected, "script exhausted")),
            }
        }
    }

    #[derive(Default)]
    pub struct RecordingSink {
        pub delivered: Vec<(MessageKind, Vec<u8>)>,
        pub writers_opened: usize,
        pub refuse: Option<io::ErrorKind>,
        pub fail_writes: bool,
        pub fail_finish: bool,
    }

    pub struct RecordingWriter<'a> {
        sink: &'a mut RecordingSink,
        kind: MessageKind,
        buf: Vec<u8>,
    }

    impl AsyncWrite for RecordingWriter<'_> {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            data: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.sink.fail_writes {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "write refused")));
            }
            self.buf.extend_from_slice(data);
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
    impl MessageWriter for RecordingWriter<'_> {
        async fn finish(self: Box<Self>) -> io::Result<()> {
            let RecordingWriter { sink, kind, buf } = *self;
            if sink.fail_finish {
                return Err(io::Error::other("flush failed"));
            }
            sink.delivered.push((kind, buf));
            Ok(())
        }
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn next_writer<'a>(
            &'a mut self,
            kind: MessageKind,
        ) -> io::Result<Box<dyn MessageWriter + 'a>> {
            if let Some(err) = self.refuse {
                return Err(io::Error::new(err, "writer refused"));
            }
            self.writers_opened += 1;
            Ok(Box::new(RecordingWriter {
                sink: self,
                kind,
                buf: Vec::new(),
            }))
        }
    }
}
