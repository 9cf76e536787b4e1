use anyhow::{Context, Result};
use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtyPair, PtySize, native_pty_system};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task;
use tracing::trace;

/// Program started on the slave side of a fresh pseudo-terminal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl ShellCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }

    /// `$SHELL`, else the first of bash/sh that exists.
    pub fn login_shell() -> Self {
        if let Ok(shell) = std::env::var("SHELL") {
            if !shell.trim().is_empty() {
                return Self::new(shell);
            }
        }
        for candidate in ["/bin/bash", "/bin/sh"] {
            if Path::new(candidate).exists() {
                return Self::new(candidate);
            }
        }
        Self::new("/bin/sh")
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, path: impl Into<PathBuf>) -> Self {
        self.cwd = Some(path.into());
        self
    }
}

#[derive(Clone, Debug)]
pub struct SpawnConfig {
    pub command: ShellCommand,
    pub cols: u16,
    pub rows: u16,
}

impl SpawnConfig {
    pub fn new(command: ShellCommand, cols: u16, rows: u16) -> Self {
        Self {
            command,
            cols: cols.max(1),
            rows: rows.max(1),
        }
    }
}

/// A child process attached to a pseudo-terminal. Killed on drop.
pub struct PtyProcess {
    master: Mutex<Box<dyn MasterPty + Send>>,
    child: Arc<Mutex<Option<Box<dyn Child + Send + Sync>>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl PtyProcess {
    pub fn spawn(config: SpawnConfig) -> Result<(Self, PtyReader, PtyWriter)> {
        let mut pair = open_pair(config.rows, config.cols)?;
        let child = spawn_child(&mut pair, &config.command)?;
        let killer = child.clone_killer();
        // Dropping the slave here lets reads on the master fail once the
        // child (and anything it forked) has exited.
        let PtyPair { master, slave } = pair;
        drop(slave);
        let reader = master.try_clone_reader().context("clone PTY reader")?;
        let writer = master.take_writer().context("take PTY writer")?;

        let process = Self {
            master: Mutex::new(master),
            child: Arc::new(Mutex::new(Some(child))),
            killer: Mutex::new(killer),
        };

        Ok((process, PtyReader::new(reader), PtyWriter::new(writer)))
    }

    /// Waits for the child and returns its exit code.
    pub async fn wait(&self) -> Result<u32> {
        let child = self.child.clone();
        task::spawn_blocking(move || {
            let mut guard = child.lock().unwrap();
            match guard.as_mut() {
                Some(child) => {
                    let status = child.wait().context("wait for PTY child")?;
                    guard.take();
                    Ok(status.exit_code())
                }
                None => Ok(0),
            }
        })
        .await
        .context("join child wait task")?
    }

    pub fn shutdown(&self) {
        let mut killer = self.killer.lock().unwrap();
        if let Err(err) = killer.kill() {
            trace!(error = %err, "PTY child already gone");
        }
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let master = self.master.lock().unwrap();
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        master.resize(size).context("resize PTY")
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        let running = self
            .child
            .try_lock()
            .map(|guard| guard.is_some())
            .unwrap_or(true);
        if running {
            self.shutdown();
        }
    }
}

#[derive(Clone)]
pub struct PtyReader {
    reader: Arc<Mutex<Box<dyn std::io::Read + Send>>>,
}

impl PtyReader {
    const CHUNK: usize = 4096;

    fn new(reader: Box<dyn std::io::Read + Send>) -> Self {
        Self {
            reader: Arc::new(Mutex::new(reader)),
        }
    }

    /// `Ok(None)` once the terminal is closed. On Linux the master reports
    /// EIO rather than EOF after the last slave handle goes away.
    pub async fn read_chunk(&self) -> Result<Option<Vec<u8>>> {
        let reader = self.reader.clone();
        task::spawn_blocking(move || {
            let mut guard = reader.lock().unwrap();
            let mut buffer = vec![0u8; Self::CHUNK];
            loop {
                match guard.read(&mut buffer) {
                    Ok(0) => return Ok(None),
                    Ok(n) => {
                        buffer.truncate(n);
                        return Ok(Some(buffer));
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) if err.raw_os_error() == Some(libc::EIO) => return Ok(None),
                    Err(err) => return Err(err.into()),
                }
            }
        })
        .await
        .context("join PTY read task")?
    }
}

#[derive(Clone)]
pub struct PtyWriter {
    writer: Arc<Mutex<Box<dyn std::io::Write + Send>>>,
}

impl PtyWriter {
    fn new(writer: Box<dyn std::io::Write + Send>) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().unwrap();
        guard.write_all(bytes).context("write to PTY")?;
        guard.flush().context("flush PTY writer")?;
        Ok(())
    }
}

fn open_pair(rows: u16, cols: u16) -> Result<PtyPair> {
    let pty_system = native_pty_system();
    let size = PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    };
    pty_system.openpty(size).context("open PTY pair")
}

fn spawn_child(
    pair: &mut PtyPair,
    command: &ShellCommand,
) -> Result<Box<dyn Child + Send + Sync>> {
    let mut cmd = CommandBuilder::new(&command.program);
    for arg in &command.args {
        cmd.arg(arg);
    }
    for (key, value) in &command.env {
        cmd.env(key, value);
    }
    if let Some(cwd) = &command.cwd {
        cmd.cwd(cwd);
    }
    pair.slave.spawn_command(cmd).context("spawn PTY child")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawned_command_output_and_exit_code() {
        let command = ShellCommand::new("/bin/sh").arg("-c").arg("printf pty-ok; exit 3");
        let (process, reader, _writer) = PtyProcess::spawn(SpawnConfig::new(command, 80, 24)).unwrap();
        let mut output = Vec::new();
        while let Some(chunk) = reader.read_chunk().await.unwrap() {
            output.extend(chunk);
        }
        assert!(String::from_utf8_lossy(&output).contains("pty-ok"));
        assert_eq!(process.wait().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn resize_is_visible_to_child() {
        let command = ShellCommand::new("/bin/sh").arg("-c").arg("sleep 0.3; stty size");
        let (process, reader, _writer) = PtyProcess::spawn(SpawnConfig::new(command, 80, 24)).unwrap();
        process.resize(132, 43).unwrap();
        let mut output = Vec::new();
        while let Some(chunk) = reader.read_chunk().await.unwrap() {
            output.extend(chunk);
        }
        assert!(String::from_utf8_lossy(&output).contains("43 132"));
        process.wait().await.unwrap();
    }

    #[tokio::test]
    async fn shell_starts_in_requested_directory() {
        let dir = tempfile::tempdir().unwrap();
        let dir = dir.path().canonicalize().unwrap();
        let command = ShellCommand::new("/bin/sh").arg("-c").arg("pwd").cwd(&dir);
        let (process, reader, _writer) = PtyProcess::spawn(SpawnConfig::new(command, 80, 24)).unwrap();
        let mut output = Vec::new();
        while let Some(chunk) = reader.read_chunk().await.unwrap() {
            output.extend(chunk);
        }
        assert!(String::from_utf8_lossy(&output).contains(dir.to_str().unwrap()));
        process.wait().await.unwrap();
    }

    #[test]
    fn spawn_config_clamps_zero_sizes() {
        let config = SpawnConfig::new(ShellCommand::new("sh"), 0, 0);
        assert_eq!((config.cols, config.rows), (1, 1));
    }
}
