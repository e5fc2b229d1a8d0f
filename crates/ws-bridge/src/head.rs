use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on an HTTP/1.x message head, request or response.
pub(crate) const MAX_HEAD: usize = 8 * 1024;

/// Read an HTTP/1.x message head, up to and including the blank line.
///
/// Reads one byte at a time so nothing past the head is taken off the
/// stream. A head over [`MAX_HEAD`] bytes or one that is not UTF-8 is an
/// `InvalidData` error.
pub(crate) async fn read_head<S>(stream: &mut S) -> io::Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(256);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HEAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "message head too large",
            ));
        }
        head.push(stream.read_u8().await?);
    }
    String::from_utf8(head)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "message head is not UTF-8"))
}
