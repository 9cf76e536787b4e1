mod auth;
pub mod bridge;

pub use auth::PasswordAuthenticator;
pub use bridge::{
    NO_PTY_EXIT_STATUS, NO_PTY_MESSAGE, ShellConnection, TerminalRequest, WindowSize, bridge,
};

use crate::credentials::ShellPassword;
use crate::server::terminal::ShellCommand;
use async_trait::async_trait;
use russh::server::{Auth, Config, Handle, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Disconnect, MethodSet, Pty};
use russh_keys::key::KeyPair;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub const DEFAULT_SHELL_PORT: u16 = 2222;

const CHANNEL_BUFFER: usize = 16 * 1024;
const DEFAULT_TERM: &str = "xterm";
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("failed to generate host key")]
    HostKey,
    #[error("failed to bind shell listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("failed to start shell: {0}")]
    Spawn(anyhow::Error),
    #[error("pty error: {0}")]
    Pty(anyhow::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ssh protocol error: {0}")]
    Ssh(#[from] russh::Error),
}

/// Remote shell exposure as seen by the session controller.
#[async_trait]
pub trait ShellService: Send + Sync {
    async fn serve(
        &self,
        addr: SocketAddr,
        password: ShellPassword,
        shutdown: CancellationToken,
    ) -> Result<(), ShellError>;
}

/// SSH front end: password auth, one PTY-bridged shell per session channel.
#[derive(Clone, Debug)]
pub struct SshShellService {
    shell: ShellCommand,
}

impl SshShellService {
    pub fn new(shell: ShellCommand) -> Self {
        Self { shell }
    }
}

#[async_trait]
impl ShellService for SshShellService {
    async fn serve(
        &self,
        addr: SocketAddr,
        password: ShellPassword,
        shutdown: CancellationToken,
    ) -> Result<(), ShellError> {
        ShellServer::new(password, self.shell.clone())?
            .bind(addr)
            .await?
            .serve(shutdown)
            .await
    }
}

pub struct ShellServer {
    config: Arc<Config>,
    authenticator: Arc<PasswordAuthenticator>,
    shell: Arc<ShellCommand>,
}

impl ShellServer {
    /// Builds a server with a fresh ed25519 host key.
    pub fn new(password: ShellPassword, shell: ShellCommand) -> Result<Self, ShellError> {
        let key = KeyPair::generate_ed25519().ok_or(ShellError::HostKey)?;
        let config = Config {
            methods: MethodSet::PASSWORD,
            auth_rejection_time: Duration::ZERO,
            inactivity_timeout: None,
            keys: vec![key],
            ..Default::default()
        };
        Ok(Self {
            config: Arc::new(config),
            authenticator: Arc::new(PasswordAuthenticator::new(password)),
            shell: Arc::new(shell),
        })
    }

    pub async fn bind(self, addr: SocketAddr) -> Result<BoundShellServer, ShellError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ShellError::Bind { addr, source })?;
        Ok(BoundShellServer {
            server: self,
            listener,
        })
    }
}

pub struct BoundShellServer {
    server: ShellServer,
    listener: TcpListener,
}

impl BoundShellServer {
    pub fn local_addr(&self) -> Result<SocketAddr, ShellError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `shutdown` fires. Connections are not
    /// limited; each gets its own task and shell.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), ShellError> {
        let BoundShellServer { server, listener } = self;
        info!(addr = ?listener.local_addr().ok(), "shell server listening");
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(error = %err, "failed to accept shell connection");
                            continue;
                        }
                    };
                    if let Err(err) = stream.set_nodelay(true) {
                        trace!(%peer, error = %err, "failed to set TCP_NODELAY");
                    }
                    debug!(%peer, "shell connection accepted");
                    let handler = ShellHandler::new(
                        Some(peer),
                        server.authenticator.clone(),
                        server.shell.clone(),
                        shutdown.child_token(),
                    );
                    let config = server.config.clone();
                    let closing = shutdown.clone();
                    connections.spawn(serve_connection(config, stream, peer, handler, closing));
                }
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(err) = finished {
                        warn!(error = %err, "shell connection task failed");
                    }
                }
            }
        }
        info!(live = connections.len(), "shell server stopping");
        let drained = tokio::time::timeout(DISCONNECT_GRACE * 2, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(live = connections.len(), "shell connections did not close in time");
            connections.shutdown().await;
        }
        Ok(())
    }
}

/// Drives one SSH connection. When `closing` fires the client is sent a
/// disconnect and the session gets [`DISCONNECT_GRACE`] to wind down.
async fn serve_connection(
    config: Arc<Config>,
    stream: TcpStream,
    peer: SocketAddr,
    handler: ShellHandler,
    closing: CancellationToken,
) {
    let session = match russh::server::run_stream(config, stream, handler).await {
        Ok(session) => session,
        Err(err) => {
            debug!(%peer, error = %err, "ssh handshake failed");
            return;
        }
    };
    let handle = session.handle();
    tokio::pin!(session);
    tokio::select! {
        result = &mut session => {
            if let Err(err) = result {
                debug!(%peer, error = %err, "shell session ended with error");
            }
        }
        _ = closing.cancelled() => {
            let _ = handle
                .disconnect(
                    Disconnect::ByApplication,
                    "recovery session ended".into(),
                    "en".into(),
                )
                .await;
            if tokio::time::timeout(DISCONNECT_GRACE, &mut session).await.is_err() {
                debug!(%peer, "ssh session did not wind down after disconnect");
            }
        }
    }
    debug!(%peer, "shell connection closed");
}

#[derive(Default)]
struct ChannelState {
    terminal: Option<TerminalRequest>,
    input: Option<DuplexStream>,
    resizes: Option<UnboundedSender<WindowSize>>,
    hangup: Option<CancellationToken>,
    started: bool,
}

/// Per-connection SSH handler.
pub struct ShellHandler {
    peer: Option<SocketAddr>,
    authenticator: Arc<PasswordAuthenticator>,
    shell: Arc<ShellCommand>,
    connection: CancellationToken,
    channels: HashMap<ChannelId, ChannelState>,
}

impl ShellHandler {
    fn new(
        peer: Option<SocketAddr>,
        authenticator: Arc<PasswordAuthenticator>,
        shell: Arc<ShellCommand>,
        connection: CancellationToken,
    ) -> Self {
        Self {
            peer,
            authenticator,
            shell,
            connection,
            channels: HashMap::new(),
        }
    }

    fn start_shell(&mut self, channel: ChannelId, session: &mut Session) {
        let state = self.channels.entry(channel).or_default();
        if state.started {
            session.channel_failure(channel);
            return;
        }
        state.started = true;

        let (input_tx, input_rx) = tokio::io::duplex(CHANNEL_BUFFER);
        let (output_tx, output_rx) = tokio::io::duplex(CHANNEL_BUFFER);
        let (resize_tx, resize_rx) = mpsc::unbounded_channel();
        let hangup = self.connection.child_token();
        state.input = Some(input_tx);
        state.resizes = Some(resize_tx);
        state.hangup = Some(hangup.clone());

        let connection = ShellConnection {
            input: input_rx,
            output: output_tx,
            terminal: state.terminal.clone(),
            resizes: resize_rx,
        };
        session.channel_success(channel);

        let handle = session.handle();
        let shell = self.shell.clone();
        let peer = self.peer;
        tokio::spawn(async move {
            let pump = tokio::spawn(pump_output(output_rx, handle.clone(), channel));
            let status = match bridge(connection, &shell, &hangup).await {
                Ok(status) => status,
                Err(err) => {
                    warn!(?peer, error = %err, "shell bridge failed");
                    1
                }
            };
            if let Err(err) = pump.await {
                debug!(?peer, error = %err, "output pump task failed");
            }
            let _ = handle.exit_status_request(channel, status).await;
            let _ = handle.eof(channel).await;
            let _ = handle.close(channel).await;
            debug!(?peer, status, "shell channel finished");
        });
    }
}

impl Drop for ShellHandler {
    fn drop(&mut self) {
        self.connection.cancel();
    }
}

async fn pump_output(mut output: DuplexStream, handle: Handle, channel: ChannelId) {
    let mut buffer = vec![0u8; CHANNEL_BUFFER];
    loop {
        let n = match output.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if handle
            .data(channel, CryptoVec::from_slice(&buffer[..n]))
            .await
            .is_err()
        {
            trace!("client channel gone; dropping shell output");
            break;
        }
    }
}

#[async_trait]
impl russh::server::Handler for ShellHandler {
    type Error = ShellError;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if self.authenticator.verify(user, password.as_bytes()) {
            info!(peer = ?self.peer, user, "shell login");
            Ok(Auth::Accept)
        } else {
            // Password auth stays offered after a failed attempt.
            Ok(Auth::Reject {
                proceed_with_methods: Some(MethodSet::PASSWORD),
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), ChannelState::default());
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let term = if term.is_empty() { DEFAULT_TERM } else { term };
        let size = WindowSize::from_wire(col_width, row_height);
        self.channels.entry(channel).or_default().terminal = Some(TerminalRequest {
            term: term.to_string(),
            cols: size.cols,
            rows: size.rows,
        });
        session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.start_shell(channel, session);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            peer = ?self.peer,
            command = %String::from_utf8_lossy(data),
            "exec request served by the interactive shell"
        );
        self.start_shell(channel, session);
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            if let Some(input) = state.input.as_mut() {
                if input.write_all(data).await.is_err() {
                    state.input = None;
                }
            }
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let size = WindowSize::from_wire(col_width, row_height);
        if let Some(state) = self.channels.get_mut(&channel) {
            match state.resizes.as_ref() {
                Some(resizes) => {
                    let _ = resizes.send(size);
                }
                None => {
                    if let Some(terminal) = state.terminal.as_mut() {
                        terminal.cols = size.cols;
                        terminal.rows = size.rows;
                    }
                }
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            state.input = None;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.remove(&channel) {
            if let Some(hangup) = state.hangup {
                hangup.cancel();
            }
        }
        Ok(())
    }
}
