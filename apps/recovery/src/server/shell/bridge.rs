//! Transport-independent half of a remote shell connection: spawns the local
//! shell on a pseudo-terminal and relays bytes and resize events.

use crate::server::shell::ShellError;
use crate::server::terminal::{PtyProcess, PtyReader, PtyWriter, ShellCommand, SpawnConfig};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub const NO_PTY_MESSAGE: &str = "No PTY requested.\n";
pub const NO_PTY_EXIT_STATUS: u32 = 1;

/// Terminal negotiated by the client before asking for a shell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TerminalRequest {
    pub term: String,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowSize {
    pub cols: u16,
    pub rows: u16,
}

impl WindowSize {
    pub fn from_wire(cols: u32, rows: u32) -> Self {
        Self {
            cols: clamp_dimension(cols),
            rows: clamp_dimension(rows),
        }
    }
}

pub(crate) fn clamp_dimension(value: u32) -> u16 {
    value.clamp(1, u16::MAX as u32) as u16
}

/// One remote shell client. `input` carries client keystrokes, `output`
/// receives everything the shell prints.
pub struct ShellConnection<R, W> {
    pub input: R,
    pub output: W,
    pub terminal: Option<TerminalRequest>,
    pub resizes: UnboundedReceiver<WindowSize>,
}

/// Runs the connection to completion and returns the exit status to report.
/// `hangup` kills the shell when the transport goes away.
pub async fn bridge<R, W>(
    connection: ShellConnection<R, W>,
    shell: &ShellCommand,
    hangup: &CancellationToken,
) -> Result<u32, ShellError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let ShellConnection {
        input,
        mut output,
        terminal,
        resizes,
    } = connection;

    let Some(terminal) = terminal else {
        debug!("rejecting shell without a terminal");
        output.write_all(NO_PTY_MESSAGE.as_bytes()).await?;
        output.flush().await?;
        return Ok(NO_PTY_EXIT_STATUS);
    };

    let command = shell.clone().env("TERM", terminal.term.as_str());
    let (process, reader, writer) =
        PtyProcess::spawn(SpawnConfig::new(command, terminal.cols, terminal.rows))
            .map_err(ShellError::Spawn)?;
    let process = Arc::new(process);
    debug!(term = %terminal.term, cols = terminal.cols, rows = terminal.rows, "shell started");

    let resize_task = tokio::spawn(forward_resizes(resizes, process.clone()));
    let input_task = tokio::spawn(forward_input(input, writer));
    let hangup_task = {
        let process = process.clone();
        let hangup = hangup.clone();
        tokio::spawn(async move {
            hangup.cancelled().await;
            debug!("transport closed; stopping shell");
            process.shutdown();
        })
    };

    if let Err(err) = forward_output(&reader, &mut output).await {
        debug!(error = %err, "client output closed; stopping shell");
        process.shutdown();
    }
    let status = process.wait().await.map_err(ShellError::Pty)?;

    resize_task.abort();
    input_task.abort();
    hangup_task.abort();
    debug!(status, "shell exited");
    Ok(status)
}

async fn forward_output<W>(reader: &PtyReader, output: &mut W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        match reader.read_chunk().await {
            Ok(Some(chunk)) => {
                output.write_all(&chunk).await?;
                output.flush().await?;
            }
            Ok(None) => return Ok(()),
            Err(err) => {
                warn!(error = %err, "pty read failed");
                return Ok(());
            }
        }
    }
}

async fn forward_input<R>(mut input: R, writer: PtyWriter)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = [0u8; 4096];
    loop {
        match input.read(&mut buffer).await {
            Ok(0) => {
                trace!("client input closed");
                break;
            }
            Ok(n) => {
                if let Err(err) = writer.write(&buffer[..n]) {
                    debug!(error = %err, "pty write failed");
                    break;
                }
            }
            Err(err) => {
                debug!(error = %err, "client input failed");
                break;
            }
        }
    }
}

async fn forward_resizes(mut resizes: UnboundedReceiver<WindowSize>, process: Arc<PtyProcess>) {
    while let Some(size) = resizes.recv().await {
        if let Err(err) = process.resize(size.cols, size.rows) {
            warn!(cols = size.cols, rows = size.rows, error = %err, "failed to apply PTY resize");
        } else {
            trace!(cols = size.cols, rows = size.rows, "applied PTY resize");
        }
    }
}
