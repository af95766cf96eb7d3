//! Target-facing channel.
//!
//! Exactly one backend is active per bridge:
//! - **Process**: a launched debuggee, protocol on fd 3, stdout/stderr as output
//! - **Socket**: a TCP connection to an already running debuggee
//!
//! Both speak NUL-terminated JSON. Helper tasks turn everything read from the
//! backend into [`TargetEvent`]s on a single channel; the coordinator keeps the
//! write half and is the only one sending.

pub mod attach;
pub mod launch;

use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::error::{CodecError, ConnectError};
use crate::wire::codec::NulDelimitedCodec;
use crate::wire::protocol::OutputCategory;

/// Capacity of the event channel between helper tasks and the coordinator.
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

pub type TargetWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, NulDelimitedCodec>;

/// Everything the coordinator learns from the target side.
#[derive(Debug)]
pub enum TargetEvent {
    /// One NUL-delimited message, not yet parsed.
    Message(Bytes),
    /// Program output of a launched debuggee.
    Output {
        category: OutputCategory,
        text: String,
    },
    /// The attach task finished connecting.
    Connected(Result<TcpStream, ConnectError>),
    /// The protocol stream reached EOF (`error: None`) or failed.
    Closed { error: Option<CodecError> },
    /// A launched debuggee exited.
    Exited { code: i32 },
}

/// The active, writable target backend.
pub enum TargetConnection {
    Process {
        pid: Option<u32>,
        writer: TargetWriter,
    },
    Socket {
        peer: SocketAddr,
        writer: TargetWriter,
    },
}

impl TargetConnection {
    /// Wrap a connected socket, spawning its reader task.
    pub fn socket(
        stream: TcpStream,
        events: mpsc::Sender<TargetEvent>,
        cancel: CancellationToken,
    ) -> std::io::Result<Self> {
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        spawn_reader(read_half, events, cancel);
        Ok(Self::Socket {
            peer,
            writer: target_writer(write_half),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Process { .. } => "process",
            Self::Socket { .. } => "socket",
        }
    }

    pub fn is_socket(&self) -> bool {
        matches!(self, Self::Socket { .. })
    }

    /// Serialize `message`, append a NUL and write it to the backend.
    pub async fn send<T: Serialize>(&mut self, message: T) -> Result<(), CodecError> {
        let writer = match self {
            Self::Process { writer, .. } => writer,
            Self::Socket { writer, .. } => writer,
        };
        writer.send(message).await
    }
}

impl std::fmt::Debug for TargetConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Process { pid, .. } => f.debug_struct("Process").field("pid", pid).finish(),
            Self::Socket { peer, .. } => f.debug_struct("Socket").field("peer", peer).finish(),
        }
    }
}

pub(crate) fn target_writer<W>(write: W) -> TargetWriter
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let boxed: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write);
    FramedWrite::new(boxed, NulDelimitedCodec::new())
}

/// Forward NUL-delimited messages from `read` until EOF, error, or cancellation.
pub(crate) fn spawn_reader<R>(
    read: R,
    events: mpsc::Sender<TargetEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut reader = FramedRead::new(read, NulDelimitedCodec::new());
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = reader.next() => next,
            };
            let event = match next {
                Some(Ok(message)) => TargetEvent::Message(message),
                Some(Err(e)) => TargetEvent::Closed { error: Some(e) },
                None => TargetEvent::Closed { error: None },
            };
            let done = matches!(event, TargetEvent::Closed { .. });
            if events.send(event).await.is_err() || done {
                break;
            }
        }
        tracing::debug!("Target reader task exiting");
    })
}
