//! Launch backend: spawn the debuggee as a child process.
//!
//! The child gets piped stdin/stdout/stderr. Its stdout/stderr are program
//! output and are wrapped into `output` events. Unless the request asks for
//! `noDebug`, one end of a Unix socket pair is installed as fd 3 in the child
//! and carries the NUL-terminated protocol.
//!
//! A waiter task owns the `Child`. It reports the exit code once every reader
//! of the child has drained, and kills the child when the bridge is cancelled.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use futures::StreamExt;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, SpawnError};
use crate::wire::codec::Utf8TextCodec;
use crate::wire::protocol::{OutputCategory, Request};

use super::{TargetEvent, TargetWriter};

/// File descriptor of the protocol stream inside the child.
pub const PROTOCOL_FD: i32 = 3;

/// Launch parameters, from the request with configured fallbacks.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchOptions {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Run without the protocol stream.
    pub no_debug: bool,
}

impl LaunchOptions {
    pub fn from_request(request: &Request, config: &BridgeConfig) -> Result<Self, BridgeError> {
        let invalid = |reason: String| BridgeError::InvalidArguments {
            command: request.command.clone(),
            reason,
        };

        let program = match request.argument("program") {
            None | Some(Value::Null) => config.program.clone(),
            Some(Value::String(program)) if !program.is_empty() => PathBuf::from(program),
            Some(other) => return Err(invalid(format!("program must be a path, got {other}"))),
        };

        let args = match request.argument("args") {
            None | Some(Value::Null) => config.program_args.clone(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    other => Err(invalid(format!("args must be strings, got {other}"))),
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(other) => return Err(invalid(format!("args must be an array, got {other}"))),
        };

        let cwd = match request.argument("cwd") {
            None | Some(Value::Null) => None,
            Some(Value::String(cwd)) => Some(PathBuf::from(cwd)),
            Some(other) => return Err(invalid(format!("cwd must be a path, got {other}"))),
        };

        let mut env = BTreeMap::new();
        match request.argument("env") {
            None | Some(Value::Null) => {}
            Some(Value::Object(vars)) => {
                for (key, value) in vars {
                    match value {
                        Value::String(v) => {
                            env.insert(key.clone(), v.clone());
                        }
                        other => {
                            return Err(invalid(format!(
                                "env value for {key} must be a string, got {other}"
                            )));
                        }
                    }
                }
            }
            Some(other) => return Err(invalid(format!("env must be an object, got {other}"))),
        }

        let no_debug = match request.argument("noDebug") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(other) => return Err(invalid(format!("noDebug must be a boolean, got {other}"))),
        };

        Ok(Self {
            program,
            args,
            cwd,
            env,
            no_debug,
        })
    }
}

/// A spawned debuggee.
pub struct LaunchedProcess {
    pub pid: Option<u32>,
    /// Writer for the protocol stream; `None` in `noDebug` mode.
    pub protocol: Option<TargetWriter>,
}

/// Spawn the debuggee and the tasks that watch it.
pub fn spawn(
    options: &LaunchOptions,
    events: mpsc::Sender<TargetEvent>,
    cancel: CancellationToken,
) -> Result<LaunchedProcess, SpawnError> {
    let mut command = Command::new(&options.program);
    command
        .args(&options.args)
        .envs(&options.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &options.cwd {
        command.current_dir(cwd);
    }

    let protocol_pair = if options.no_debug {
        None
    } else {
        Some(protocol_stream(&mut command)?)
    };

    let mut child = command.spawn().map_err(|source| SpawnError::Spawn {
        program: options.program.display().to_string(),
        source,
    })?;
    let pid = child.id();
    tracing::info!(?pid, program = %options.program.display(), no_debug = options.no_debug, "Spawned debuggee");

    let stdout = child
        .stdout
        .take()
        .ok_or(SpawnError::NotCaptured("stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or(SpawnError::NotCaptured("stderr"))?;

    let mut readers = vec![
        spawn_output_pump(stdout, OutputCategory::Stdout, events.clone()),
        spawn_output_pump(stderr, OutputCategory::Stderr, events.clone()),
    ];

    let protocol = match protocol_pair {
        Some(pair) => {
            let (reader, writer) = pair.into_parent()?;
            readers.push(super::spawn_reader(reader, events.clone(), cancel.clone()));
            Some(writer)
        }
        None => None,
    };

    spawn_waiter(child, readers, events, cancel);

    Ok(LaunchedProcess { pid, protocol })
}

fn spawn_output_pump<R>(
    read: R,
    category: OutputCategory,
    events: mpsc::Sender<TargetEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut chunks = FramedRead::new(read, Utf8TextCodec::new());
        while let Some(text) = chunks.next().await {
            let text = match text {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(category = category.as_str(), error = %e, "Failed to read debuggee output");
                    break;
                }
            };
            if events
                .send(TargetEvent::Output { category, text })
                .await
                .is_err()
            {
                break;
            }
        }
        tracing::trace!(category = category.as_str(), "Output pump exiting");
    })
}

fn spawn_waiter(
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    events: mpsc::Sender<TargetEvent>,
    cancel: CancellationToken,
) {
    // Held open so the debuggee does not see EOF on stdin.
    let stdin = child.stdin.take();

    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "Failed to kill debuggee");
                }
                return;
            }
        };
        drop(stdin);

        let code = match status {
            Ok(status) => exit_code(status),
            Err(e) => {
                tracing::error!(error = %e, "Failed to wait for debuggee");
                1
            }
        };

        // Deliver everything the debuggee wrote before reporting the exit.
        for reader in readers {
            let _ = reader.await;
        }
        let _ = events.send(TargetEvent::Exited { code }).await;
    });
}

/// Exit code of the debuggee; signal deaths map to 128 + signal like a shell.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

#[cfg(unix)]
struct ProtocolPair {
    parent: std::os::unix::net::UnixStream,
    // Kept alive until the child has been spawned.
    _child: std::os::unix::net::UnixStream,
}

#[cfg(unix)]
impl ProtocolPair {
    fn into_parent(
        self,
    ) -> Result<(tokio::net::unix::OwnedReadHalf, TargetWriter), SpawnError> {
        // Closing our copy of the child end lets EOF reach the reader when the
        // debuggee exits.
        drop(self._child);
        self.parent
            .set_nonblocking(true)
            .map_err(SpawnError::ProtocolStream)?;
        let stream =
            tokio::net::UnixStream::from_std(self.parent).map_err(SpawnError::ProtocolStream)?;
        let (read_half, write_half) = stream.into_split();
        Ok((read_half, super::target_writer(write_half)))
    }
}

/// Create the socket pair and arrange for its child end to become fd 3.
#[cfg(unix)]
fn protocol_stream(command: &mut Command) -> Result<ProtocolPair, SpawnError> {
    use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

    use nix::fcntl::{FcntlArg, FdFlag, fcntl};
    use nix::unistd::dup2;

    let (parent, child) =
        std::os::unix::net::UnixStream::pair().map_err(SpawnError::ProtocolStream)?;
    let child_fd = child.as_raw_fd();

    // SAFETY: runs in the forked child before exec. `child_fd` is open in the
    // child because it is open in the parent at fork time. dup2 and fcntl are
    // async-signal-safe. The OwnedFd for PROTOCOL_FD is forgotten so the
    // descriptor stays open across exec.
    unsafe {
        command.pre_exec(move || {
            let source = BorrowedFd::borrow_raw(child_fd);
            if child_fd == PROTOCOL_FD {
                // dup2 onto itself keeps FD_CLOEXEC, clear it explicitly.
                fcntl(source, FcntlArg::F_SETFD(FdFlag::empty()))?;
                return Ok(());
            }
            let mut target = OwnedFd::from_raw_fd(PROTOCOL_FD);
            let result = dup2(source, &mut target);
            std::mem::forget(target);
            result?;
            Ok(())
        });
    }

    Ok(ProtocolPair {
        parent,
        _child: child,
    })
}

#[cfg(not(unix))]
struct ProtocolPair;

#[cfg(not(unix))]
impl ProtocolPair {
    fn into_parent(self) -> Result<(tokio::io::Empty, TargetWriter), SpawnError> {
        Err(SpawnError::Unsupported)
    }
}

#[cfg(not(unix))]
fn protocol_stream(_command: &mut Command) -> Result<ProtocolPair, SpawnError> {
    Err(SpawnError::Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn launch_request(arguments: Value) -> Request {
        Request::new(2, "launch", Some(arguments))
    }

    #[test]
    fn options_fall_back_to_config() {
        let config = BridgeConfig::new().with_program("/opt/target/bin/debuggee", vec!["--dap".into()]);
        let options = LaunchOptions::from_request(&launch_request(json!({})), &config).unwrap();

        assert_eq!(options.program, PathBuf::from("/opt/target/bin/debuggee"));
        assert_eq!(options.args, vec!["--dap"]);
        assert!(options.cwd.is_none());
        assert!(options.env.is_empty());
        assert!(!options.no_debug);
    }

    #[test]
    fn options_from_request_arguments() {
        let request = launch_request(json!({
            "program": "/bin/app",
            "args": ["one", "two"],
            "cwd": "/srv",
            "env": {"MODE": "test"},
            "noDebug": true
        }));
        let options = LaunchOptions::from_request(&request, &BridgeConfig::new()).unwrap();

        assert_eq!(options.program, PathBuf::from("/bin/app"));
        assert_eq!(options.args, vec!["one", "two"]);
        assert_eq!(options.cwd, Some(PathBuf::from("/srv")));
        assert_eq!(options.env.get("MODE").map(String::as_str), Some("test"));
        assert!(options.no_debug);
    }

    #[test]
    fn options_reject_wrong_types() {
        for arguments in [
            json!({"args": "one two"}),
            json!({"args": [1, 2]}),
            json!({"noDebug": "yes"}),
            json!({"env": {"A": 1}}),
            json!({"program": 42}),
        ] {
            let err = LaunchOptions::from_request(&launch_request(arguments.clone()), &BridgeConfig::new())
                .unwrap_err();
            assert!(
                matches!(err, BridgeError::InvalidArguments { .. }),
                "{arguments}: {err:?}"
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn exit_code_maps_signals() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code(ExitStatus::from_raw(9)), 137);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let options = LaunchOptions {
            program: PathBuf::from("/nonexistent/debuggee"),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            no_debug: true,
        };
        let (tx, _rx) = mpsc::channel(super::super::EVENT_CHANNEL_CAPACITY);
        let err = spawn(&options, tx, CancellationToken::new())
            .err()
            .expect("spawn should fail");
        assert!(matches!(err, SpawnError::Spawn { .. }), "{err:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn no_debug_process_reports_output_and_exit() {
        let options = LaunchOptions {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), "echo hello; exit 4".into()],
            cwd: None,
            env: BTreeMap::new(),
            no_debug: true,
        };
        let (tx, mut rx) = mpsc::channel(super::super::EVENT_CHANNEL_CAPACITY);
        let launched = spawn(&options, tx, CancellationToken::new()).unwrap();
        assert!(launched.protocol.is_none());

        let mut stdout = String::new();
        loop {
            match rx.recv().await.unwrap() {
                TargetEvent::Output {
                    category: OutputCategory::Stdout,
                    text,
                } => stdout.push_str(&text),
                TargetEvent::Exited { code } => {
                    assert_eq!(code, 4);
                    break;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(stdout, "hello\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn protocol_stream_is_fd_3() {
        use futures::SinkExt;

        let options = LaunchOptions {
            program: PathBuf::from("/bin/sh"),
            args: vec![
                "-c".into(),
                r#"printf '{"event":"initialized"}\000' >&3"#.into(),
            ],
            cwd: None,
            env: BTreeMap::new(),
            no_debug: false,
        };
        let (tx, mut rx) = mpsc::channel(super::super::EVENT_CHANNEL_CAPACITY);
        let launched = spawn(&options, tx, CancellationToken::new()).unwrap();
        let mut writer = launched.protocol.expect("protocol stream");
        // The debuggee may already be gone; a failed write is fine here.
        let _ = writer.send(json!({"command": "launch"})).await;

        let mut messages = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                TargetEvent::Message(bytes) => messages.push(bytes),
                TargetEvent::Closed { .. } | TargetEvent::Output { .. } => {}
                TargetEvent::Exited { code } => {
                    assert_eq!(code, 0);
                    break;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(messages.len(), 1);
        assert_eq!(&messages[0][..], br#"{"event":"initialized"}"#);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn output_keeps_multibyte_characters_intact() {
        let options = LaunchOptions {
            program: PathBuf::from("/bin/sh"),
            args: vec![
                "-c".into(),
                r"head -c 8191 /dev/zero | tr '\000' a; printf '\303\251'".into(),
            ],
            cwd: None,
            env: BTreeMap::new(),
            no_debug: true,
        };
        let (tx, mut rx) = mpsc::channel(super::super::EVENT_CHANNEL_CAPACITY);
        spawn(&options, tx, CancellationToken::new()).unwrap();

        let mut stdout = String::new();
        loop {
            match rx.recv().await.unwrap() {
                TargetEvent::Output {
                    category: OutputCategory::Stdout,
                    text,
                } => stdout.push_str(&text),
                TargetEvent::Exited { code } => {
                    assert_eq!(code, 0);
                    break;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(!stdout.contains('\u{FFFD}'));
        assert_eq!(stdout.len(), 8193);
        assert!(stdout.ends_with('\u{e9}'));
    }
}
