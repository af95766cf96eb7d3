use std::process;
use std::time::Duration;

use anyhow::Context;

use dbgbridge::bridge::Bridge;
use dbgbridge::client;
use dbgbridge::config::BridgeConfig;
use dbgbridge::logging;

const USAGE: &str = "\
Usage: dbgbridge [OPTIONS] [-- <program args>...]

Options:
  --host <host>            Attach host [default: localhost]
  --port <port>            Attach port [default: 8999]
  --program <path>         Debuggee launched by `launch` [default: debuggee]
  --legacy-prefix <p>      Command prefix to rewrite [default: vscode_]
  --new-prefix <p>         Replacement prefix [default: dap_]
  --retries <n>            Attach retries after the first attempt [default: 5]
  --retry-delay-ms <ms>    Delay between attach attempts [default: 1000]
  -h, --help               Print this message";

fn main() {
    logging::init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let config = match parse_args(&args, BridgeConfig::from_env()) {
        Ok(config) => config,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "dbgbridge starting");
    tracing::debug!(?config, "Configuration");

    let code = match run(config) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Bridge failed");
            1
        }
    };
    process::exit(code);
}

fn run(config: BridgeConfig) -> anyhow::Result<i32> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let result = runtime.block_on(Bridge::new(config, client::stdio()).run());
    // Dropping the runtime kills a debuggee that is still running.
    drop(runtime);
    Ok(result?)
}

fn parse_args(args: &[String], mut config: BridgeConfig) -> Result<BridgeConfig, String> {
    let mut i = 1; // skip argv[0]
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--" => {
                config.program_args = args[i + 1..].to_vec();
                break;
            }
            "--help" | "-h" => return Err(String::new()),
            "--host" | "--port" | "--program" | "--legacy-prefix" | "--new-prefix"
            | "--retries" | "--retry-delay-ms" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| format!("{flag} requires a value"))?;
                apply_flag(&mut config, flag, value)?;
            }
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }
    Ok(config)
}

fn apply_flag(config: &mut BridgeConfig, flag: &str, value: &str) -> Result<(), String> {
    match flag {
        "--host" => config.host = value.to_string(),
        "--port" => {
            config.port = value
                .parse()
                .map_err(|_| format!("invalid port '{value}'"))?;
        }
        "--program" => config.program = value.into(),
        "--legacy-prefix" => config.legacy_prefix = value.to_string(),
        "--new-prefix" => config.new_prefix = value.to_string(),
        "--retries" => {
            config.retry.max_retries = value
                .parse()
                .map_err(|_| format!("invalid retry count '{value}'"))?;
        }
        "--retry-delay-ms" => {
            let ms: u64 = value
                .parse()
                .map_err(|_| format!("invalid retry delay '{value}'"))?;
            config.retry.delay = Duration::from_millis(ms);
        }
        _ => return Err(format!("unknown flag: {flag}")),
    }
    Ok(())
}
