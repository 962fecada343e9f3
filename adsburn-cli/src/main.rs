//! adsburn CLI - production-line flasher front-end.
//!
//! Two modes, picked once at startup:
//!
//! - **Control-channel mode** (default): a controller process writes one
//!   JSON command per line on stdin (`START` / `STOP`) and reads one JSON
//!   event per line (`LOG` / `PROGRESS` / `ERROR`) on stdout.
//! - **Single-target mode** (`--target` + `--file`): the flasher enumerates
//!   dongles itself, runs one factory until Ctrl-C, and emits plain
//!   `LOG:` / `PROGRESS:` / `ERROR:` lines.
//!
//! Diagnostics go to stderr through `env_logger`; stdout carries only the
//! event stream.

use std::io::Write as _;
use std::process::ExitCode;
use std::time::Duration;

use adsburn::{Command, Event, Factory, FactoryConfig, FactoryHandle, Reporter, SYSTEM_PORT};
use anyhow::{Context, Result, bail};
use clap::Parser;
use env_logger::Env;
use log::{debug, error};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

/// adsburn - flash BLE audio devices on a production line.
///
/// Environment variables:
///   ADSBURN_TARGET   - Default target name substring
///   ADSBURN_FILE     - Default audio image file
#[derive(Parser)]
#[command(name = "adsburn")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Flash devices whose advertised name contains this substring
    /// (single-target mode; without it the JSON control channel runs on
    /// stdin/stdout).
    #[arg(short, long, env = "ADSBURN_TARGET")]
    target: Option<String>,

    /// Audio image file to flash (required with --target).
    #[arg(short, long, env = "ADSBURN_FILE")]
    file: Option<String>,

    /// Dongle serial port to use (repeatable; default: scan for dongles).
    #[arg(short, long = "port")]
    ports: Vec<String>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (warnings only on stderr).
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();
    debug!("adsburn v{}", env!("CARGO_PKG_VERSION"));

    let (reporter, events) = Reporter::channel();
    let plain_mode = cli.target.is_some();
    let pump = tokio::spawn(pump_events(events, plain_mode));

    let code = match run(cli, reporter.clone()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            reporter.error(SYSTEM_PORT, format!("{e:#}"));
            ExitCode::FAILURE
        },
    };

    // Close our sender and give the pump a moment to drain; factory tasks
    // holding reporter clones are already stopping.
    drop(reporter);
    let _ = tokio::time::timeout(Duration::from_secs(1), pump).await;
    code
}

/// Serialize events onto stdout, one per line.
async fn pump_events(mut events: mpsc::UnboundedReceiver<Event>, plain: bool) {
    let mut out = std::io::stdout();
    while let Some(event) = events.recv().await {
        let line = if plain {
            event.to_plain_line()
        } else {
            match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    error!("event serialisation failed: {e}");
                    continue;
                },
            }
        };
        if writeln!(out, "{line}").and_then(|()| out.flush()).is_err() {
            // controller went away; stop writing
            break;
        }
    }
}

async fn run(cli: Cli, reporter: Reporter) -> Result<()> {
    let adapter = adsburn::default_adapter()
        .await
        .context("Bluetooth unavailable")?;

    match cli.target.clone() {
        Some(target) => run_single_target(cli, target, adapter, reporter).await,
        None => run_control_channel(adapter, reporter).await,
    }
}

/// Single-target mode: one factory, plain-line events, Ctrl-C to stop.
async fn run_single_target(
    cli: Cli,
    target: String,
    adapter: adsburn::scan::Adapter,
    reporter: Reporter,
) -> Result<()> {
    let file = cli.file.context("--file is required with --target")?;
    let ports = if cli.ports.is_empty() {
        adsburn::find_dongle_ports().context("dongle scan failed")?
    } else {
        cli.ports
    };
    if ports.is_empty() {
        bail!("no dongle found");
    }
    reporter.log(
        SYSTEM_PORT,
        "",
        format!("using {} dongle(s): {}", ports.len(), ports.join(", ")),
    );

    let config = FactoryConfig {
        file,
        target_ids: vec![target],
        ports,
    };
    let factory = Factory::new(config, reporter.clone()).context("factory start failed")?;
    let handle = factory.start(adapter);

    tokio::signal::ctrl_c().await.context("signal wait failed")?;
    handle.stop();
    Ok(())
}

/// Control-channel mode: commands in on stdin, events out on stdout.
async fn run_control_channel(
    adapter: adsburn::scan::Adapter,
    reporter: Reporter,
) -> Result<()> {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut running: Option<FactoryHandle> = None;

    while let Some(line) = lines.next_line().await.context("stdin read failed")? {
        let Ok(command) = serde_json::from_str::<Command>(&line) else {
            debug!("ignoring malformed control line");
            continue;
        };
        match command {
            Command::Start {
                file,
                target_ids,
                ports,
            } => {
                if let Some(old) = running.take() {
                    old.stop();
                }
                let config = FactoryConfig {
                    file,
                    target_ids,
                    ports,
                };
                match Factory::new(config, reporter.clone()) {
                    Ok(factory) => running = Some(factory.start(adapter.clone())),
                    Err(e) => reporter.error(SYSTEM_PORT, format!("start failed: {e}")),
                }
            },
            Command::Stop => {
                if let Some(old) = running.take() {
                    old.stop();
                }
            },
        }
    }

    // controller closed stdin
    if let Some(old) = running.take() {
        old.stop();
    }
    Ok(())
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_defaults_to_control_channel_mode() {
        let cli = Cli::try_parse_from(["adsburn"]).unwrap();
        assert!(cli.target.is_none());
        assert!(cli.file.is_none());
        assert!(cli.ports.is_empty());
        assert_eq!(cli.verbose, 0);
        assert!(!cli.quiet);
    }

    #[test]
    fn test_cli_parse_single_target_mode() {
        let cli = Cli::try_parse_from([
            "adsburn",
            "--target",
            "AB-01",
            "--file",
            "voice.ads",
            "--port",
            "COM3",
            "--port",
            "COM4",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.target.as_deref(), Some("AB-01"));
        assert_eq!(cli.file.as_deref(), Some("voice.ads"));
        assert_eq!(cli.ports, vec!["COM3", "COM4"]);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_cli_short_flags() {
        let cli = Cli::try_parse_from(["adsburn", "-t", "TOY", "-f", "a.ads", "-q"]).unwrap();
        assert_eq!(cli.target.as_deref(), Some("TOY"));
        assert_eq!(cli.file.as_deref(), Some("a.ads"));
        assert!(cli.quiet);
    }

    #[test]
    fn test_cli_rejects_unknown_flag() {
        assert!(Cli::try_parse_from(["adsburn", "--baud", "9600"]).is_err());
    }
}
