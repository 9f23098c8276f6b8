//! Line-oriented operator console: `start <port>`, `stop`, `info`, `exit`.

use std::net::{IpAddr, SocketAddr};

use anyhow::{Result, anyhow};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::listener::{Listener, StartError};

#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    Start { port: u16 },
    Stop,
    Info,
    Exit,
}

impl ConsoleCommand {
    /// Parses one console line. Command words are case-insensitive.
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let Some(word) = parts.next() else {
            return Err(anyhow!("empty command"));
        };

        let command = match word.to_ascii_lowercase().as_str() {
            "start" => {
                let port = parts
                    .next()
                    .ok_or_else(|| anyhow!("usage: start <port>"))?;
                let port = port
                    .parse()
                    .map_err(|_| anyhow!("invalid port number '{port}'"))?;
                ConsoleCommand::Start { port }
            }
            "stop" => ConsoleCommand::Stop,
            "info" => ConsoleCommand::Info,
            "exit" => ConsoleCommand::Exit,
            other => {
                return Err(anyhow!(
                    "unknown command '{other}' - type 'info' to list commands"
                ));
            }
        };

        if let Some(extra) = parts.next() {
            return Err(anyhow!("unexpected argument '{extra}'"));
        }
        Ok(command)
    }
}

/// Reads commands from `input` until `exit` or end of input, writing replies
/// to `output`. The server is stopped before returning.
pub async fn run<R, W>(listener: &Listener, host: IpAddr, input: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let command = match ConsoleCommand::parse(&line) {
            Ok(command) => command,
            Err(err) => {
                write_line(&mut output, &err.to_string()).await?;
                continue;
            }
        };
        debug!(?command, "console command");

        match command {
            ConsoleCommand::Start { port } => {
                let reply = match listener.start(SocketAddr::new(host, port)).await {
                    Ok(addr) => format!("server started on {addr}"),
                    Err(err @ StartError::AlreadyRunning(_)) => err.to_string(),
                    Err(err) => format!("cannot start server: {err}"),
                };
                write_line(&mut output, &reply).await?;
            }
            ConsoleCommand::Stop => {
                let reply = if listener.stop().await {
                    "server stopped"
                } else {
                    "server is not running"
                };
                write_line(&mut output, reply).await?;
            }
            ConsoleCommand::Info => write_info(listener, &mut output).await?,
            ConsoleCommand::Exit => break,
        }
    }

    listener.stop().await;
    write_line(&mut output, "goodbye").await?;
    Ok(())
}

async fn write_info<W>(listener: &Listener, output: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_line(output, "commands:").await?;
    write_line(output, "  start <port> - start the server").await?;
    write_line(output, "  stop         - stop the server").await?;
    write_line(output, "  info         - show this help and server status").await?;
    write_line(output, "  exit         - stop the server and quit").await?;

    match listener.local_addr() {
        Some(addr) => {
            let online = listener.directory().snapshot_nicks().await;
            write_line(output, &format!("status: running on {addr}")).await?;
            write_line(output, &format!("online: {}", online.join(", "))).await?;
        }
        None => write_line(output, "status: stopped").await?,
    }
    Ok(())
}

async fn write_line<W>(output: &mut W, line: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    output.write_all(line.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await?;
    Ok(())
}
