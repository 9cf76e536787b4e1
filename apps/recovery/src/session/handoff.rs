use async_trait::async_trait;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("no supported init system found")]
    NoInitSystem,
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: &'static str,
        source: std::io::Error,
    },
    #[error("starting {service} failed ({status})")]
    Failed { service: String, status: ExitStatus },
}

/// Returns the primary console to the host's login service.
#[async_trait]
pub trait LoginService: Send + Sync {
    async fn reattach_primary_console(&self, tty: u8) -> Result<(), HandoffError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitSystem {
    Systemd,
    OpenRc,
}

impl InitSystem {
    pub fn detect() -> Option<Self> {
        Self::detect_in(Path::new("/"))
    }

    pub(crate) fn detect_in(root: &Path) -> Option<Self> {
        if root.join("run/systemd/system").is_dir() {
            Some(InitSystem::Systemd)
        } else if root.join("run/openrc").is_dir() || root.join("sbin/openrc").exists() {
            Some(InitSystem::OpenRc)
        } else {
            None
        }
    }

    pub fn getty_service(self, tty: u8) -> String {
        match self {
            InitSystem::Systemd => format!("getty@tty{tty}"),
            InitSystem::OpenRc => format!("agetty.tty{tty}"),
        }
    }

    fn start_command(self, service: &str) -> (&'static str, Vec<String>) {
        match self {
            InitSystem::Systemd => ("systemctl", vec!["start".into(), service.into()]),
            InitSystem::OpenRc => ("rc-service", vec![service.into(), "start".into()]),
        }
    }
}

/// Starts the getty unit for the console through the detected init system.
#[derive(Clone, Copy, Debug)]
pub struct GettyHandoff {
    init: Option<InitSystem>,
}

impl GettyHandoff {
    pub fn detect() -> Self {
        Self {
            init: InitSystem::detect(),
        }
    }

    pub fn with_init(init: InitSystem) -> Self {
        Self { init: Some(init) }
    }
}

#[async_trait]
impl LoginService for GettyHandoff {
    async fn reattach_primary_console(&self, tty: u8) -> Result<(), HandoffError> {
        let init = self.init.ok_or(HandoffError::NoInitSystem)?;
        let service = init.getty_service(tty);
        let (program, args) = init.start_command(&service);
        debug!(program, ?args, "starting login service");
        let status = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|source| HandoffError::Spawn { program, source })?;
        if !status.success() {
            return Err(HandoffError::Failed { service, status });
        }
        info!(%service, "console handed back to login service");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_names_per_init_system() {
        assert_eq!(InitSystem::Systemd.getty_service(1), "getty@tty1");
        assert_eq!(InitSystem::OpenRc.getty_service(2), "agetty.tty2");
        let (program, args) = InitSystem::OpenRc.start_command("agetty.tty1");
        assert_eq!(program, "rc-service");
        assert_eq!(args, vec!["agetty.tty1", "start"]);
    }

    #[test]
    fn detection_follows_runtime_markers() {
        let root = tempfile::tempdir().unwrap();
        assert_eq!(InitSystem::detect_in(root.path()), None);
        std::fs::create_dir_all(root.path().join("run/openrc")).unwrap();
        assert_eq!(InitSystem::detect_in(root.path()), Some(InitSystem::OpenRc));
        std::fs::create_dir_all(root.path().join("run/systemd/system")).unwrap();
        assert_eq!(InitSystem::detect_in(root.path()), Some(InitSystem::Systemd));
    }

    #[tokio::test]
    async fn missing_init_system_is_an_error() {
        let handoff = GettyHandoff { init: None };
        assert!(matches!(
            handoff.reattach_primary_console(1).await,
            Err(HandoffError::NoInitSystem)
        ));
    }
}
