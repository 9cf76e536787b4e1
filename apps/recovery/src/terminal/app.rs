use crate::network::engine::ProcessEngine;
use crate::network::interface::SystemInterfaces;
use crate::pairing::EdgeTokenSource;
use crate::server::shell::SshShellService;
use crate::server::terminal::ShellCommand;
use crate::session::{Collaborators, GettyHandoff, RecoverySession, TerminalConsole};
use crate::terminal::cli::Cli;
use crate::terminal::error::CliError;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Remote shells start in `$HOME` when it exists, otherwise `/`.
fn shell_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .filter(|home| home.is_dir())
        .unwrap_or_else(|| PathBuf::from("/"))
}

pub async fn run(cli: Cli) -> Result<(), CliError> {
    let settings = cli.settings()?;
    let shell = match cli.shell.as_deref() {
        Some(program) if !program.trim().is_empty() => ShellCommand::new(program),
        _ => ShellCommand::login_shell(),
    }
    .cwd(shell_home());
    debug!(shell = %shell.program, engine = ?cli.engine.binary, "recovery collaborators selected");

    let services = Collaborators {
        tokens: Arc::new(EdgeTokenSource),
        engine: Arc::new(
            ProcessEngine::new(cli.engine.binary.clone())
                .with_leading_args(cli.engine.leading_args.iter().cloned()),
        ),
        probe: Arc::new(SystemInterfaces),
        shell: Arc::new(SshShellService::new(shell)),
        console: Arc::new(TerminalConsole),
        login: Arc::new(GettyHandoff::detect()),
    };

    let session = RecoverySession::new(settings, services);
    let abort = session.abort_handle();
    let signals = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received; aborting recovery");
                abort.trigger();
            }
            Err(err) => warn!(error = %err, "unable to listen for interrupt"),
        }
    });

    let result = session.run().await;
    signals.abort();
    let report = result?;
    info!(
        address = ?report.address,
        shell = ?report.shell_addr,
        console_restored = report.console_restored,
        "recovery session finished"
    );
    Ok(())
}
