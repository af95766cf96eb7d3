//! Client-facing channel: Content-Length framed JSON over a byte stream pair.
//!
//! In production the pair is the bridge's own stdin/stdout. Tests use in-memory
//! duplex streams.

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, Stdin, Stdout};
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::CodecError;
use crate::wire::codec::ContentLengthCodec;

pub struct ClientChannel<R, W> {
    reader: FramedRead<R, ContentLengthCodec>,
    writer: FramedWrite<W, ContentLengthCodec>,
}

/// Channel over the process's stdin/stdout.
pub fn stdio() -> ClientChannel<Stdin, Stdout> {
    ClientChannel::new(tokio::io::stdin(), tokio::io::stdout())
}

impl<R, W> ClientChannel<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FramedRead::new(reader, ContentLengthCodec::new()),
            writer: FramedWrite::new(writer, ContentLengthCodec::new()),
        }
    }

    /// Payload of the next complete frame; `None` once the input is closed.
    ///
    /// Cancel safe: bytes of a partially received frame stay buffered.
    pub async fn next_frame(&mut self) -> Option<Result<Bytes, CodecError>> {
        self.reader.next().await
    }

    /// Frame `message` and write header and body as one flushed write.
    pub async fn write<T: Serialize>(&mut self, message: T) -> Result<(), CodecError> {
        self.writer.send(message).await
    }
}
