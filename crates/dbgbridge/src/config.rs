//! Bridge configuration.
//!
//! Values are fixed for the lifetime of a bridge. The binary seeds them from the
//! environment and command line; tests construct them directly.

use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8999;
pub const DEFAULT_LEGACY_PREFIX: &str = "vscode_";
pub const DEFAULT_NEW_PREFIX: &str = "dap_";
pub const DEFAULT_PROGRAM: &str = "debuggee";

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// Host used by `attach` when the request names none.
    pub host: String,
    /// Port used by `attach` when the request names none.
    pub port: u16,
    pub legacy_prefix: String,
    pub new_prefix: String,
    /// Debuggee executable used by `launch` when the request names none.
    pub program: PathBuf,
    pub program_args: Vec<String>,
    pub retry: RetryPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            legacy_prefix: DEFAULT_LEGACY_PREFIX.to_string(),
            new_prefix: DEFAULT_NEW_PREFIX.to_string(),
            program: PathBuf::from(DEFAULT_PROGRAM),
            program_args: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `DBGBRIDGE_HOST`, `DBGBRIDGE_PORT` and `DBGBRIDGE_PROGRAM`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("DBGBRIDGE_HOST")
            && !host.is_empty()
        {
            config.host = host;
        }

        if let Ok(port) = std::env::var("DBGBRIDGE_PORT") {
            match port.parse::<u16>() {
                Ok(port) => config.port = port,
                Err(_) => tracing::warn!(%port, "Ignoring invalid DBGBRIDGE_PORT"),
            }
        }

        if let Ok(program) = std::env::var("DBGBRIDGE_PROGRAM")
            && !program.is_empty()
        {
            config.program = PathBuf::from(program);
        }

        config
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_prefixes(mut self, legacy: impl Into<String>, new: impl Into<String>) -> Self {
        self.legacy_prefix = legacy.into();
        self.new_prefix = new.into();
        self
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        self.program = program.into();
        self.program_args = args;
        self
    }

    pub fn with_retry(mut self, max_retries: u32, delay: Duration) -> Self {
        self.retry = RetryPolicy::new(max_retries, delay);
        self
    }
}
