use async_trait::async_trait;
use recovery_core::credentials::{PairingToken, ShellPassword};
use recovery_core::network::config::{LivenessPolicy, NetworkConfig};
use recovery_core::network::engine::{EngineError, NetworkEngine};
use recovery_core::network::interface::{InterfaceProbe, ReadinessError};
use recovery_core::pairing::PairingTokenSource;
use recovery_core::server::shell::{ShellError, ShellService};
use recovery_core::session::{
    Collaborators, HandoffError, LockError, LoginService, OperatorConsole, RecoverySession,
    SessionError, SessionLock, SessionSettings, SessionState,
};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type Journal = Arc<Mutex<Vec<String>>>;

fn note(journal: &Journal, entry: impl Into<String>) {
    journal.lock().unwrap().push(entry.into());
}

fn position(journal: &Journal, prefix: &str) -> usize {
    journal
        .lock()
        .unwrap()
        .iter()
        .position(|entry| entry.starts_with(prefix))
        .unwrap_or_else(|| panic!("no journal entry starting with {prefix:?}"))
}

fn contains(journal: &Journal, prefix: &str) -> bool {
    journal
        .lock()
        .unwrap()
        .iter()
        .any(|entry| entry.starts_with(prefix))
}

struct FixedTokens;

impl PairingTokenSource for FixedTokens {
    fn generate(&self) -> PairingToken {
        PairingToken::new("pairing-token")
    }
}

struct ScriptedEngine {
    journal: Journal,
    fail: bool,
}

#[async_trait]
impl NetworkEngine for ScriptedEngine {
    async fn start(
        &self,
        config: NetworkConfig,
        _liveness: LivenessPolicy,
        cancel: CancellationToken,
    ) -> Result<(), EngineError> {
        note(&self.journal, format!("engine started on {}", config.interface));
        if self.fail {
            return Err(EngineError::Io(io::Error::other("engine crashed")));
        }
        cancel.cancelled().await;
        note(&self.journal, "engine cancelled");
        Ok(())
    }
}

struct SlowInterface {
    journal: Journal,
    ready_after: usize,
    calls: AtomicUsize,
}

impl InterfaceProbe for SlowInterface {
    fn address(&self, name: &str) -> Option<IpAddr> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        note(&self.journal, format!("probe {name} #{call}"));
        (call >= self.ready_after).then_some(IpAddr::V4(Ipv4Addr::new(10, 1, 0, 20)))
    }
}

struct RecordingShell {
    journal: Journal,
}

#[async_trait]
impl ShellService for RecordingShell {
    async fn serve(
        &self,
        addr: SocketAddr,
        password: ShellPassword,
        shutdown: CancellationToken,
    ) -> Result<(), ShellError> {
        note(
            &self.journal,
            format!("shell serving {addr} ({} chars)", password.as_str().len()),
        );
        shutdown.cancelled().await;
        note(&self.journal, "shell stopped");
        Ok(())
    }
}

/// Console whose operator presses a key after `abort_after`, or never.
struct RecordingConsole {
    journal: Journal,
    abort_after: Option<Duration>,
}

#[async_trait]
impl OperatorConsole for RecordingConsole {
    fn banner(&self, title: &str, _body: &str) {
        note(&self.journal, format!("banner {title}"));
    }

    fn info(&self, message: &str) {
        note(&self.journal, format!("info {message}"));
    }

    fn warn(&self, message: &str) {
        note(&self.journal, format!("warn {message}"));
    }

    fn spacer(&self) {
        note(&self.journal, "spacer");
    }

    fn scannable(&self, _code: &str) {
        note(&self.journal, "scannable");
    }

    async fn wait_for_abort(&self) -> io::Result<()> {
        match self.abort_after {
            Some(delay) => tokio::time::sleep(delay).await,
            None => std::future::pending::<()>().await,
        }
        note(&self.journal, "operator abort");
        Ok(())
    }
}

struct RecordingLogin {
    journal: Journal,
    fail: bool,
}

#[async_trait]
impl LoginService for RecordingLogin {
    async fn reattach_primary_console(&self, tty: u8) -> Result<(), HandoffError> {
        note(&self.journal, format!("reattach tty{tty}"));
        if self.fail {
            return Err(HandoffError::NoInitSystem);
        }
        Ok(())
    }
}

struct Harness {
    journal: Journal,
    settings: SessionSettings,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let settings = SessionSettings {
            lock_path: dir.path().join("recovery.lock"),
            ..SessionSettings::default()
        };
        Self {
            journal: Arc::new(Mutex::new(Vec::new())),
            settings,
            _dir: dir,
        }
    }

    fn services(
        &self,
        engine_fails: bool,
        ready_after: usize,
        abort_after: Option<Duration>,
        login_fails: bool,
    ) -> Collaborators {
        Collaborators {
            tokens: Arc::new(FixedTokens),
            engine: Arc::new(ScriptedEngine {
                journal: self.journal.clone(),
                fail: engine_fails,
            }),
            probe: Arc::new(SlowInterface {
                journal: self.journal.clone(),
                ready_after,
                calls: AtomicUsize::new(0),
            }),
            shell: Arc::new(RecordingShell {
                journal: self.journal.clone(),
            }),
            console: Arc::new(RecordingConsole {
                journal: self.journal.clone(),
                abort_after,
            }),
            login: Arc::new(RecordingLogin {
                journal: self.journal.clone(),
                fail: login_fails,
            }),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn instructions_follow_interface_readiness_and_abort_tears_down() {
    let harness = Harness::new();
    let services = harness.services(false, 3, Some(Duration::from_secs(60)), false);
    let session = RecoverySession::new(harness.settings.clone(), services);

    let report = session.run().await.unwrap();

    use SessionState::*;
    assert_eq!(
        report.states,
        vec![
            Idle,
            Bootstrapping,
            AwaitingInterface,
            Ready,
            ShellActive,
            Aborting,
            Terminated
        ]
    );
    assert_eq!(report.address, Some(IpAddr::V4(Ipv4Addr::new(10, 1, 0, 20))));
    assert_eq!(report.shell_addr, Some("10.1.0.20:2222".parse().unwrap()));
    assert!(report.console_restored);

    let journal = &harness.journal;
    assert!(position(journal, "banner") < position(journal, "info Waiting for interface"));
    assert!(position(journal, "info Waiting for interface") < position(journal, "probe recovery0 #1"));
    assert!(position(journal, "probe recovery0 #3") < position(journal, "info Interface ready"));
    assert!(position(journal, "info Interface ready") < position(journal, "scannable"));
    assert!(position(journal, "scannable") < position(journal, "info starting ssh server on 10.1.0.20:2222"));
    assert!(position(journal, "operator abort") < position(journal, "engine cancelled"));
    assert!(position(journal, "shell stopped") < position(journal, "reattach tty1"));
    assert!(position(journal, "engine cancelled") < position(journal, "reattach tty1"));
    assert!(contains(journal, "shell serving 10.1.0.20:2222 (7 chars)"));
    assert!(!contains(journal, "probe recovery0 #4"));
}

#[tokio::test(start_paused = true)]
async fn external_abort_ends_the_session_once() {
    let harness = Harness::new();
    let services = harness.services(false, 1, None, false);
    let session = RecoverySession::new(harness.settings.clone(), services);
    let abort = session.abort_handle();
    let run = tokio::spawn(session.run());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(abort.trigger());
    let report = run.await.unwrap().unwrap();

    assert_eq!(report.states.last(), Some(&SessionState::Terminated));
    assert!(!abort.trigger());
    assert!(!contains(&harness.journal, "operator abort"));
    assert!(contains(&harness.journal, "shell stopped"));
    assert!(contains(&harness.journal, "engine cancelled"));
}

#[tokio::test(start_paused = true)]
async fn abort_while_waiting_for_the_interface_ends_cleanly() {
    let harness = Harness::new();
    let services = harness.services(false, usize::MAX, None, false);
    let session = RecoverySession::new(harness.settings.clone(), services);
    let abort = session.abort_handle();
    let run = tokio::spawn(session.run());

    // Past the startup grace, between two polls.
    tokio::time::sleep(Duration::from_secs(7)).await;
    assert!(abort.trigger());
    let report = run.await.unwrap().unwrap();

    use SessionState::*;
    assert_eq!(
        report.states,
        vec![Idle, Bootstrapping, AwaitingInterface, Aborting, Terminated]
    );
    assert_eq!(report.address, None);
    assert_eq!(report.shell_addr, None);
    assert!(report.console_restored);
    let journal = &harness.journal;
    assert!(contains(journal, "engine cancelled"));
    assert!(!contains(journal, "shell serving"));
    assert!(!contains(journal, "warn Recovery network failed to start"));
    assert!(position(journal, "engine cancelled") < position(journal, "reattach tty1"));
}

#[tokio::test(start_paused = true)]
async fn abort_during_startup_grace_skips_polling() {
    let harness = Harness::new();
    let services = harness.services(false, 1, None, false);
    let session = RecoverySession::new(harness.settings.clone(), services);
    let abort = session.abort_handle();
    let run = tokio::spawn(session.run());

    tokio::time::sleep(Duration::from_secs(1)).await;
    abort.trigger();
    let report = run.await.unwrap().unwrap();

    assert_eq!(report.address, None);
    assert!(!contains(&harness.journal, "probe"));
    assert!(!contains(&harness.journal, "info Waiting for interface"));
}

#[tokio::test(start_paused = true)]
async fn console_restore_failure_does_not_fail_the_session() {
    let harness = Harness::new();
    let services = harness.services(false, 1, Some(Duration::from_secs(1)), true);
    let session = RecoverySession::new(harness.settings.clone(), services);

    let report = session.run().await.unwrap();

    assert!(!report.console_restored);
    assert!(contains(&harness.journal, "reattach tty1"));
}

#[tokio::test(start_paused = true)]
async fn failed_bootstrap_stops_waiting_for_the_interface() {
    let harness = Harness::new();
    let services = harness.services(true, usize::MAX, None, false);
    let session = RecoverySession::new(harness.settings.clone(), services);

    let result = session.run().await;

    assert!(matches!(
        result,
        Err(SessionError::Readiness(ReadinessError::Bootstrap { .. }))
    ));
    let journal = &harness.journal;
    assert!(!contains(journal, "info starting ssh server"));
    assert!(!contains(journal, "shell serving"));
    assert!(contains(journal, "warn Recovery network failed to start"));
    assert!(contains(journal, "reattach tty1"));
}

#[tokio::test(start_paused = true)]
async fn second_session_on_the_same_host_is_refused() {
    let harness = Harness::new();
    let _held = SessionLock::acquire(&harness.settings.lock_path).unwrap();
    let services = harness.services(false, 1, Some(Duration::from_secs(1)), false);
    let session = RecoverySession::new(harness.settings.clone(), services);

    let result = session.run().await;

    assert!(matches!(
        result,
        Err(SessionError::Lock(LockError::AlreadyActive { .. }))
    ));
    assert!(harness.journal.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn invalid_bind_address_is_fatal_before_anything_starts() {
    let mut harness = Harness::new();
    harness.settings.bind_address = "not-an-address".into();
    let services = harness.services(false, 1, Some(Duration::from_secs(1)), false);
    let session = RecoverySession::new(harness.settings.clone(), services);

    let result = session.run().await;

    assert!(matches!(result, Err(SessionError::Config(_))));
    assert!(!contains(&harness.journal, "engine started"));
    assert!(!contains(&harness.journal, "banner"));
}
