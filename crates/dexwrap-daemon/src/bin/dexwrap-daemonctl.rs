// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use dexwrap_daemon::DaemonError;
use dexwrap_daemon::config::DEFAULT_STATUS_PATH;
use dexwrap_daemon::slots::Slot;
use dexwrap_daemon::status::StatusReport;
use dexwrap_proto::{DEFAULT_SOCKET_PATH, DaemonClient, SLOT_COUNT};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(
    name = "dexwrap-daemonctl",
    about = "Control utility for dexwrap-daemon"
)]
struct Cli {
    /// Path to the daemon Unix socket
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    socket_path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Request the descriptor held in a slot and report what arrived
    Fd(FdArgs),
    /// Ask whether a process is excluded from injection
    Classify(ClassifyArgs),
    /// Show the compatibility status published by the daemon
    Status(StatusArgs),
}

#[derive(Parser, Debug)]
struct FdArgs {
    /// Slot index (0-5)
    slot: u8,

    /// Print JSON output
    #[arg(long)]
    json: bool,
}

#[derive(Parser, Debug)]
struct ClassifyArgs {
    /// Process name as seen by the wrapper
    process_name: String,

    /// Print JSON output
    #[arg(long)]
    json: bool,
}

#[derive(Parser, Debug)]
struct StatusArgs {
    /// Status file written by the daemon
    #[arg(long, default_value = DEFAULT_STATUS_PATH)]
    status_path: PathBuf,

    /// Print JSON status output
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct FdPrint {
    slot: u8,
    name: String,
    ack: i32,
    received: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<String>,
}

#[derive(Serialize)]
struct ClassifyPrint<'a> {
    process_name: &'a str,
    denied: bool,
}

fn main() {
    if let Err(err) = run() {
        let _ = writeln!(io::stderr(), "{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = DaemonClient::with_socket_path(&cli.socket_path);

    match cli.command {
        Command::Fd(args) => do_fd(&client, args)?,
        Command::Classify(args) => do_classify(&client, args)?,
        Command::Status(args) => do_status(args)?,
    }

    Ok(())
}

fn do_fd(client: &DaemonClient, args: FdArgs) -> Result<()> {
    let slot = Slot::from_index(args.slot).ok_or_else(|| {
        anyhow::anyhow!("slot must be between 0 and {}", SLOT_COUNT - 1)
    })?;
    let released = client
        .release_descriptor(args.slot)
        .map_err(|e| anyhow::anyhow!("descriptor request failed: {e}"))?;

    // Resolve what the descriptor points at through procfs
    let target = released.fd.as_ref().and_then(|fd| {
        std::fs::read_link(format!("/proc/self/fd/{}", fd.as_raw_fd()))
            .ok()
            .map(|path| path.display().to_string())
    });
    let output = FdPrint {
        slot: args.slot,
        name: slot.to_string(),
        ack: released.ack,
        received: released.fd.is_some(),
        target,
    };

    let mut stdout = io::stdout();
    if args.json {
        serde_json::to_writer_pretty(&mut stdout, &output)?;
        writeln!(stdout)?;
    } else {
        writeln!(stdout, "Slot: {} ({})", output.slot, output.name)?;
        writeln!(stdout, "Ack: {}", output.ack)?;
        match &output.target {
            Some(target) => writeln!(stdout, "Descriptor: {target}")?,
            None if output.received => writeln!(stdout, "Descriptor: received")?,
            None => writeln!(stdout, "Descriptor: none")?,
        }
    }
    Ok(())
}

fn do_classify(client: &DaemonClient, args: ClassifyArgs) -> Result<()> {
    let denied = client
        .classify(&args.process_name)
        .map_err(|e| anyhow::anyhow!("classify request failed: {e}"))?;
    let output = ClassifyPrint {
        process_name: &args.process_name,
        denied,
    };

    let mut stdout = io::stdout();
    if args.json {
        serde_json::to_writer_pretty(&mut stdout, &output)?;
        writeln!(stdout)?;
    } else {
        writeln!(
            stdout,
            "{}: {}",
            output.process_name,
            if denied { "denied" } else { "allowed" }
        )?;
    }
    Ok(())
}

fn do_status(args: StatusArgs) -> Result<()> {
    let report = StatusReport::read(&args.status_path).map_err(|e| match e {
        DaemonError::Io(ref io) if io.kind() == io::ErrorKind::NotFound => anyhow::anyhow!(
            "dex2oat wrapper daemon is not running (no status at {})",
            args.status_path.display()
        ),
        e => anyhow::anyhow!("failed to read status from {}: {e}", args.status_path.display()),
    })?;

    let mut stdout = io::stdout();
    if args.json {
        serde_json::to_writer_pretty(&mut stdout, &report)?;
        writeln!(stdout)?;
    } else {
        writeln!(stdout, "State: {} ({})", report.state, report.code)?;
        writeln!(stdout, "Updated: {}", report.updated_at)?;
    }

    if report.state.is_terminal() {
        anyhow::bail!("dex2oat wrapper daemon stopped serving (state: {})", report.state);
    }
    Ok(())
}
