//! dbgbridge: relays a debug adapter protocol session between a client speaking
//! Content-Length framed JSON on stdio and a debuggee speaking NUL-terminated JSON.

pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod retry;
pub mod target;
pub mod wire;

pub use bridge::{Bridge, BridgeState, CommandTranslator, PendingQueue, SequenceCounter};
pub use client::ClientChannel;
pub use config::BridgeConfig;
pub use error::{BridgeError, CodecError, ConnectError, Result, SpawnError};
pub use retry::RetryPolicy;
pub use target::{TargetConnection, TargetEvent};
