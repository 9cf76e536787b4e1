//! Recovery session controller.
//!
//! Sequences the session through
//! `Idle → Bootstrapping → AwaitingInterface → Ready → ShellActive → Aborting → Terminated`:
//! the network bootstrap runs on its own task, the operator is told how to
//! connect only after the interface has an address, and a single abort
//! cancels everything before the console goes back to the login service.

pub mod console;
pub mod handoff;
pub mod lock;

pub use console::{OperatorConsole, TerminalConsole};
pub use handoff::{GettyHandoff, HandoffError, LoginService};
pub use lock::{LockError, SessionLock};

use crate::credentials::{
    self, CredentialError, DEFAULT_PASSWORD_LENGTH, PairingToken,
};
use crate::network::bootstrap::{self, BootstrapHandle};
use crate::network::config::{
    BindAddress, ConfigError, DEFAULT_BIND_ADDRESS, DEFAULT_ENGINE_LOG_LEVEL, DEFAULT_INTERFACE,
    NetworkConfig,
};
use crate::network::engine::NetworkEngine;
use crate::network::interface::{
    DEFAULT_POLL_INTERVAL, InterfaceProbe, ReadinessError, ReadinessPoller,
};
use crate::pairing::{self, PairingTokenSource};
use crate::server::shell::{DEFAULT_SHELL_PORT, ShellError, ShellService};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CONSOLE_TTY: u8 = 1;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Credentials(#[from] CredentialError),
    #[error("fatal network configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Readiness(#[from] ReadinessError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Bootstrapping,
    AwaitingInterface,
    Ready,
    ShellActive,
    Aborting,
    Terminated,
}

impl SessionState {
    fn can_follow(self, previous: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (previous, self),
            (Idle, Bootstrapping)
                | (Bootstrapping, AwaitingInterface)
                | (AwaitingInterface, Ready)
                | (Ready, ShellActive)
                | (ShellActive, Aborting)
                | (AwaitingInterface, Aborting)
                | (Aborting, Terminated)
        )
    }
}

#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub bind_address: String,
    pub shell_port: u16,
    pub interface: String,
    pub engine_log_level: String,
    pub password_length: usize,
    pub startup_grace: Duration,
    pub poll_interval: Duration,
    pub shutdown_timeout: Duration,
    pub console_tty: u8,
    pub lock_path: PathBuf,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            shell_port: DEFAULT_SHELL_PORT,
            interface: DEFAULT_INTERFACE.to_string(),
            engine_log_level: DEFAULT_ENGINE_LOG_LEVEL.to_string(),
            password_length: DEFAULT_PASSWORD_LENGTH,
            startup_grace: DEFAULT_STARTUP_GRACE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            console_tty: DEFAULT_CONSOLE_TTY,
            lock_path: PathBuf::from(lock::DEFAULT_LOCK_PATH),
        }
    }
}

/// External services the controller drives.
#[derive(Clone)]
pub struct Collaborators {
    pub tokens: Arc<dyn PairingTokenSource>,
    pub engine: Arc<dyn NetworkEngine>,
    pub probe: Arc<dyn InterfaceProbe>,
    pub shell: Arc<dyn ShellService>,
    pub console: Arc<dyn OperatorConsole>,
    pub login: Arc<dyn LoginService>,
}

/// Single-shot trigger over the session's cancellation token.
#[derive(Debug, Default)]
pub struct AbortSignal {
    token: CancellationToken,
    fired: AtomicBool,
}

impl AbortSignal {
    /// Fires the cancellation. Returns `false` if it had already fired.
    pub fn trigger(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.token.cancel();
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionReport {
    pub states: Vec<SessionState>,
    /// `None` when the session was aborted before the interface came up.
    pub address: Option<IpAddr>,
    pub shell_addr: Option<SocketAddr>,
    pub console_restored: bool,
}

pub struct RecoverySession {
    settings: SessionSettings,
    services: Collaborators,
    abort: Arc<AbortSignal>,
    state: SessionState,
    history: Vec<SessionState>,
}

impl RecoverySession {
    pub fn new(settings: SessionSettings, services: Collaborators) -> Self {
        Self {
            settings,
            services,
            abort: Arc::new(AbortSignal::default()),
            state: SessionState::Idle,
            history: vec![SessionState::Idle],
        }
    }

    /// Handle for aborting from outside the console, e.g. a signal.
    pub fn abort_handle(&self) -> Arc<AbortSignal> {
        self.abort.clone()
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(
            next.can_follow(self.state),
            "invalid transition {:?} -> {:?}",
            self.state,
            next
        );
        info!(from = ?self.state, to = ?next, "recovery session state");
        self.state = next;
        self.history.push(next);
    }

    pub async fn run(mut self) -> Result<SessionReport, SessionError> {
        let _lock = SessionLock::acquire(&self.settings.lock_path)?;
        let console = self.services.console.clone();

        self.transition(SessionState::Bootstrapping);
        let token = credentials::generate_pairing_token(self.services.tokens.as_ref())?;
        let bind = self.validate_network(&token)?;
        let bootstrap = bootstrap::spawn(
            self.abort.token(),
            token.clone(),
            self.settings.bind_address.clone(),
            self.settings.interface.clone(),
            self.settings.engine_log_level.clone(),
            self.services.engine.clone(),
        );

        self.transition(SessionState::AwaitingInterface);
        console.banner("Recovery", &banner_text(&bind, self.settings.shell_port));
        console.info("Press any key to abort recovery. To restart the process run 'recovery'.");

        let poller = ReadinessPoller::new(self.services.probe.clone(), self.settings.poll_interval);
        let status = bootstrap.status();
        let cancelled = self.abort.token();
        let waited = tokio::select! {
            result = async {
                tokio::time::sleep(self.settings.startup_grace).await;
                console.info("Waiting for interface to be ready...");
                poller.wait_for_interface(&self.settings.interface, &status).await
            } => Some(result),
            _ = cancelled.cancelled() => None,
        };
        let address = match waited {
            Some(Ok(address)) => address,
            Some(Err(err)) => {
                console.warn(&format!("Recovery network failed to start: {err}"));
                self.transition(SessionState::Aborting);
                self.teardown(bootstrap, None).await;
                self.transition(SessionState::Terminated);
                return Err(err.into());
            }
            None => {
                debug!("recovery aborted before the interface came up");
                self.transition(SessionState::Aborting);
                let console_restored = self.teardown(bootstrap, None).await;
                self.transition(SessionState::Terminated);
                return Ok(SessionReport {
                    states: self.history.clone(),
                    address: None,
                    shell_addr: None,
                    console_restored,
                });
            }
        };

        self.transition(SessionState::Ready);
        console.info("Interface ready");
        console.spacer();

        let password = credentials::generate_shell_password(self.settings.password_length)?;
        match pairing::render_scannable(&token) {
            Ok(code) => console.scannable(&code),
            Err(err) => {
                warn!(error = %err, "failed to render pairing code");
                console.warn(&format!("Pairing token: {}", token.as_str()));
            }
        }
        let shell_addr = SocketAddr::new(IpAddr::V4(bind.ip), self.settings.shell_port);
        console.info(&format!(
            "starting ssh server on {shell_addr}, password: {password}"
        ));
        let shell = self.services.shell.clone();
        let shutdown = self.abort.token();
        let shell_task =
            tokio::spawn(async move { shell.serve(shell_addr, password, shutdown).await });
        self.transition(SessionState::ShellActive);

        let cancelled = self.abort.token();
        tokio::select! {
            result = console.wait_for_abort() => {
                if let Err(err) = result {
                    warn!(error = %err, "console read failed; aborting recovery");
                }
            }
            _ = cancelled.cancelled() => debug!("recovery aborted externally"),
        }

        self.transition(SessionState::Aborting);
        let console_restored = self.teardown(bootstrap, Some(shell_task)).await;
        self.transition(SessionState::Terminated);

        Ok(SessionReport {
            states: self.history.clone(),
            address: Some(address),
            shell_addr: Some(shell_addr),
            console_restored,
        })
    }

    fn validate_network(&self, token: &PairingToken) -> Result<BindAddress, SessionError> {
        let config = NetworkConfig::new(
            token,
            &self.settings.bind_address,
            &self.settings.interface,
            &self.settings.engine_log_level,
        );
        Ok(config.validate()?)
    }

    /// Cancels the background work, waits for it (bounded), then hands the
    /// console back. Returns whether the console was reattached.
    async fn teardown(
        &self,
        bootstrap: BootstrapHandle,
        shell_task: Option<JoinHandle<Result<(), ShellError>>>,
    ) -> bool {
        if !self.abort.trigger() {
            debug!("cancellation already triggered");
        }

        let timeout = self.settings.shutdown_timeout;
        let shell_join = async {
            let Some(task) = shell_task else {
                return;
            };
            match tokio::time::timeout(timeout, task).await {
                Ok(Ok(Ok(()))) => debug!("shell server stopped"),
                Ok(Ok(Err(err))) => warn!(error = %err, "shell server failed"),
                Ok(Err(err)) => warn!(error = %err, "shell server task panicked"),
                Err(_) => warn!(?timeout, "shell server did not stop in time"),
            }
        };
        tokio::join!(bootstrap.join(timeout), shell_join);

        match self
            .services
            .login
            .reattach_primary_console(self.settings.console_tty)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, tty = self.settings.console_tty, "could not restore console login");
                false
            }
        }
    }
}

fn banner_text(bind: &BindAddress, port: u16) -> String {
    format!(
        "Welcome to recovery mode!
p2p device recovery mode is starting.
A QR code with a generated network token will be displayed below that can be used
to join the recovery network from another machine.
The machine will have the {ip} ip in the VPN and you can SSH it on port {port}.
If the QR code is not displaying correctly,
try booting with another vga option from the boot cmdline (e.g. vga=791).",
        ip = bind.ip,
    )
}
