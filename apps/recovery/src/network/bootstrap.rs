use crate::credentials::PairingToken;
use crate::network::config::{ConfigError, LivenessPolicy, NetworkConfig};
use crate::network::engine::{EngineError, NetworkEngine};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("invalid network configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BootstrapStatus {
    Starting,
    Running,
    Stopped,
    Failed(String),
}

impl BootstrapStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BootstrapStatus::Stopped | BootstrapStatus::Failed(_))
    }
}

/// Read side of the bootstrap task's status slot.
#[derive(Clone, Debug)]
pub struct StatusWatch {
    rx: watch::Receiver<BootstrapStatus>,
}

impl StatusWatch {
    #[cfg(test)]
    pub(crate) fn from_receiver(rx: watch::Receiver<BootstrapStatus>) -> Self {
        Self { rx }
    }

    pub fn current(&self) -> BootstrapStatus {
        self.rx.borrow().clone()
    }

    /// A status that never changes; for callers with no bootstrap to observe.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let (tx, rx) = watch::channel(BootstrapStatus::Running);
        drop(tx);
        Self { rx }
    }
}

/// Builds the network configuration and drives the engine until `cancel`
/// fires or the engine fails.
pub async fn run(
    cancel: CancellationToken,
    token: &PairingToken,
    bind_address: &str,
    interface: &str,
    log_level: &str,
    engine: &dyn NetworkEngine,
) -> Result<(), BootstrapError> {
    let config = NetworkConfig::new(token, bind_address, interface, log_level);
    config.validate()?;
    debug!(
        config = %serde_json::to_string(&config).unwrap_or_default(),
        "network configuration built"
    );
    engine
        .start(config, LivenessPolicy::default(), cancel)
        .await
        .map_err(|err| match err {
            EngineError::Config(config) => BootstrapError::Config(config),
            other => BootstrapError::Engine(other),
        })
}

pub struct BootstrapHandle {
    task: JoinHandle<Result<(), BootstrapError>>,
    status: StatusWatch,
}

impl BootstrapHandle {
    pub fn status(&self) -> StatusWatch {
        self.status.clone()
    }

    /// Waits for the task to finish, up to `timeout`. Returns `false` if the
    /// task was still running when the timeout expired.
    pub async fn join(self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.task).await {
            Ok(Ok(Ok(()))) => true,
            Ok(Ok(Err(err))) => {
                debug!(error = %err, "bootstrap task finished with error");
                true
            }
            Ok(Err(err)) => {
                warn!(error = %err, "bootstrap task panicked");
                true
            }
            Err(_) => {
                warn!(?timeout, "bootstrap task did not stop in time");
                false
            }
        }
    }
}

/// Runs [`run`] on its own task. The caller keeps going immediately.
pub fn spawn(
    cancel: CancellationToken,
    token: PairingToken,
    bind_address: String,
    interface: String,
    log_level: String,
    engine: Arc<dyn NetworkEngine>,
) -> BootstrapHandle {
    let (tx, rx) = watch::channel(BootstrapStatus::Starting);
    let task = tokio::spawn(async move {
        let _ = tx.send(BootstrapStatus::Running);
        let result = run(
            cancel,
            &token,
            &bind_address,
            &interface,
            &log_level,
            engine.as_ref(),
        )
        .await;
        match &result {
            Ok(()) => {
                info!("network bootstrap stopped");
                let _ = tx.send(BootstrapStatus::Stopped);
            }
            Err(err) => {
                error!(error = %err, "network bootstrap failed");
                let _ = tx.send(BootstrapStatus::Failed(err.to_string()));
            }
        }
        result
    });
    BootstrapHandle {
        task,
        status: StatusWatch { rx },
    }
}
