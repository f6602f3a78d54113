use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

mod progress;

use progress::Waiter;

const DEFAULT_SOCKET: &str = "/var/run/zuul/scheduler.socket";
/// Matches the scheduler's own reconfigure-wait budget (spec §6) plus a
/// margin so a slow-but-genuine response doesn't race a client-side
/// timeout that's actually tighter than the one the scheduler promises.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(305);

#[derive(Parser, Debug)]
#[command(name = "zuul", version)]
#[command(about = "Command-socket client for a running zuul-scheduler process")]
struct Cli {
    /// Path to the scheduler's command socket.
    #[arg(long, default_value = DEFAULT_SOCKET)]
    socket: PathBuf,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Reload every tenant's layout from scratch.
    FullReconfigure,
    /// Reload only the tenants whose underlying project config changed.
    SmartReconfigure,
    /// Reload a single tenant's layout.
    TenantReconfigure { tenant: String },
    /// Shut the scheduler process down.
    Stop,
    /// Enable the operator-attached interactive console.
    Repl,
    /// Disable the operator-attached interactive console.
    Norepl,
}

impl Commands {
    fn wire_line(&self) -> String {
        match self {
            Commands::FullReconfigure => "full-reconfigure".to_string(),
            Commands::SmartReconfigure => "smart-reconfigure".to_string(),
            Commands::TenantReconfigure { tenant } => format!("tenant-reconfigure {tenant}"),
            Commands::Stop => "stop".to_string(),
            Commands::Repl => "repl".to_string(),
            Commands::Norepl => "norepl".to_string(),
        }
    }

    /// Reconfigure commands block the scheduler side until its
    /// management-queue consumer acknowledges them; the others return as
    /// soon as the scheduler has flipped a flag or started shutting down.
    fn blocks_on_scheduler(&self) -> bool {
        matches!(
            self,
            Commands::FullReconfigure | Commands::SmartReconfigure | Commands::TenantReconfigure { .. }
        )
    }
}

trait Reporter {
    fn info(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut reporter = CliReporter;
    let line = cli.cmd.wire_line();

    reporter.info(&format!("sending `{line}` to {}", cli.socket.display()));

    let waiter = if cli.cmd.blocks_on_scheduler() {
        Some(Waiter::start(format!("waiting for the scheduler to process `{line}`...")))
    } else {
        None
    };

    let outcome = send_command(&cli.socket, &line);

    if let Some(waiter) = waiter {
        waiter.finish();
    }

    match outcome {
        Ok(response) if response == "OK" => {
            println!("{response}");
            Ok(())
        }
        Ok(response) => {
            reporter.error(&response);
            std::process::exit(1);
        }
        Err(e) => {
            reporter.error(&format!("{e:#}"));
            std::process::exit(1);
        }
    }
}

/// One connection, one line out, one line in (spec §6): writes `line` plus
/// a trailing newline, half-closes the write side so the scheduler's
/// `lines().next_line()` sees EOF after the one command, and reads back
/// exactly one response line.
fn send_command(socket: &PathBuf, line: &str) -> Result<String> {
    let mut stream = UnixStream::connect(socket)
        .with_context(|| format!("connecting to command socket at {}", socket.display()))?;
    stream.set_read_timeout(Some(RESPONSE_TIMEOUT))?;

    stream.write_all(line.as_bytes())?;
    stream.write_all(b"\n")?;
    stream.shutdown(std::net::Shutdown::Write).ok();

    let mut reader = BufReader::new(stream);
    let mut response = String::new();
    reader
        .read_line(&mut response)
        .context("reading response from command socket")?;

    if response.is_empty() {
        anyhow::bail!("command socket closed the connection without a response");
    }
    Ok(response.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_line_matches_the_socket_protocol() {
        assert_eq!(Commands::FullReconfigure.wire_line(), "full-reconfigure");
        assert_eq!(Commands::SmartReconfigure.wire_line(), "smart-reconfigure");
        assert_eq!(
            Commands::TenantReconfigure { tenant: "t1".into() }.wire_line(),
            "tenant-reconfigure t1"
        );
        assert_eq!(Commands::Stop.wire_line(), "stop");
        assert_eq!(Commands::Repl.wire_line(), "repl");
        assert_eq!(Commands::Norepl.wire_line(), "norepl");
    }

    #[test]
    fn only_reconfigure_commands_block_on_the_scheduler() {
        assert!(Commands::FullReconfigure.blocks_on_scheduler());
        assert!(Commands::SmartReconfigure.blocks_on_scheduler());
        assert!(Commands::TenantReconfigure { tenant: "t1".into() }.blocks_on_scheduler());
        assert!(!Commands::Stop.blocks_on_scheduler());
        assert!(!Commands::Repl.blocks_on_scheduler());
        assert!(!Commands::Norepl.blocks_on_scheduler());
    }

    #[test]
    fn send_command_reports_connection_failure() {
        let err = send_command(&PathBuf::from("/nonexistent/path/to.socket"), "stop").unwrap_err();
        assert!(err.to_string().contains("connecting to command socket"));
    }
}
