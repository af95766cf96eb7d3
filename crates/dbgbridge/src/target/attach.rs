//! Attach backend: connect to a debuggee listening on TCP.

use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, ConnectError};
use crate::retry::{RetryExhausted, RetryPolicy};
use crate::wire::protocol::Request;

use super::TargetEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachOptions {
    pub host: String,
    pub port: u16,
}

impl AttachOptions {
    pub fn from_request(request: &Request, config: &BridgeConfig) -> Result<Self, BridgeError> {
        let host = match request.argument("host") {
            Some(Value::String(host)) if !host.is_empty() => host.clone(),
            _ => config.host.clone(),
        };
        let port = match request.argument("port") {
            None | Some(Value::Null) => config.port,
            Some(value) => parse_port(value)?,
        };
        Ok(Self { host, port })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Accept a port given as a JSON integer or as a string holding one.
pub fn parse_port(value: &Value) -> Result<u16, BridgeError> {
    let port = match value {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.trim().parse::<u16>().ok(),
        _ => None,
    };
    port.ok_or_else(|| BridgeError::InvalidPort(value.to_string()))
}

/// Connect following `policy`. Returns `None` if cancelled between attempts.
pub async fn connect(
    options: &AttachOptions,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Option<Result<TcpStream, ConnectError>> {
    let addr = options.addr();
    let result = policy
        .run(cancel, |attempt| {
            tracing::debug!(%addr, attempt, "Connecting to target");
            TcpStream::connect((options.host.as_str(), options.port))
        })
        .await;

    match result {
        Ok(stream) => {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
            }
            tracing::info!(%addr, "Connected to target");
            Some(Ok(stream))
        }
        Err(RetryExhausted::Failed { attempts, error }) => Some(Err(ConnectError {
            addr,
            attempts,
            source: error,
        })),
        Err(RetryExhausted::Cancelled { attempts }) => {
            tracing::debug!(%addr, attempts, "Attach cancelled");
            None
        }
    }
}

/// Run [`connect`] in the background and report the outcome as [`TargetEvent::Connected`].
pub fn spawn_connect(
    options: AttachOptions,
    policy: RetryPolicy,
    events: mpsc::Sender<TargetEvent>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        if let Some(result) = connect(&options, &policy, &cancel).await {
            let _ = events.send(TargetEvent::Connected(result)).await;
        }
    });
}
