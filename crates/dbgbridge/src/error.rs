//! Error taxonomy for the bridge.

use std::io;

use thiserror::Error;

/// Errors produced by the wire codecs.
///
/// `tokio_util` decoders need `From<io::Error>`, so transport failures are
/// carried here next to the framing failures.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame header: {0}")]
    Framing(String),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CodecError {
    pub fn framing(reason: impl Into<String>) -> Self {
        Self::Framing(reason.into())
    }
}

/// A connect attempt that the retry policy gave up on.
#[derive(Debug, Error)]
#[error("failed to connect to {addr} after {attempts} attempts: {source}")]
pub struct ConnectError {
    pub addr: String,
    pub attempts: u32,
    #[source]
    pub source: io::Error,
}

impl ConnectError {
    /// Exit status for the bridge process: the OS error code when there is one.
    pub fn exit_code(&self) -> i32 {
        self.source.raw_os_error().unwrap_or(1)
    }
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to create protocol stream: {0}")]
    ProtocolStream(#[source] io::Error),

    #[error("{0} not captured")]
    NotCaptured(&'static str),

    #[error("protocol stream is not supported on this platform")]
    Unsupported,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("invalid port {0}: expected an integer between 0 and 65535")]
    InvalidPort(String),

    #[error("invalid {command} arguments: {reason}")]
    InvalidArguments { command: String, reason: String },

    #[error("malformed message: {0}")]
    MessageParse(String),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
