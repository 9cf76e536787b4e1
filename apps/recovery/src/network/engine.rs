use crate::network::config::{ConfigError, LivenessPolicy, NetworkConfig};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_ENGINE_BINARY: &str = "edgevpn";
const TOKEN_ENV: &str = "EDGEVPNTOKEN";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to start network engine {binary:?}: {source}")]
    Start {
        binary: PathBuf,
        source: std::io::Error,
    },
    #[error("network engine exited unexpectedly ({0})")]
    Exited(ExitStatus),
    #[error("network engine i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// The peer-to-peer network engine. `start` runs until `cancel` fires or
/// the engine fails.
#[async_trait]
pub trait NetworkEngine: Send + Sync {
    async fn start(
        &self,
        config: NetworkConfig,
        liveness: LivenessPolicy,
        cancel: CancellationToken,
    ) -> Result<(), EngineError>;
}

/// Runs an edgevpn-compatible engine binary as a child process.
#[derive(Clone, Debug)]
pub struct ProcessEngine {
    binary: PathBuf,
    leading_args: Vec<String>,
}

impl ProcessEngine {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            leading_args: Vec::new(),
        }
    }

    /// Arguments placed before the translated config, e.g. a subcommand.
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args.extend(args.into_iter().map(Into::into));
        self
    }
}

#[async_trait]
impl NetworkEngine for ProcessEngine {
    async fn start(
        &self,
        config: NetworkConfig,
        liveness: LivenessPolicy,
        cancel: CancellationToken,
    ) -> Result<(), EngineError> {
        let args = config.engine_args(&liveness)?;
        debug!(binary = ?self.binary, args = ?args, "launching network engine");

        let mut child = Command::new(&self.binary)
            .args(&self.leading_args)
            .args(&args)
            .env(TOKEN_ENV, &config.network_token)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::Start {
                binary: self.binary.clone(),
                source,
            })?;
        info!(pid = ?child.id(), interface = %config.interface, "network engine started");

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                warn!(%status, "network engine exited before cancellation");
                Err(EngineError::Exited(status))
            }
            _ = cancel.cancelled() => {
                if let Err(err) = child.kill().await {
                    warn!(error = %err, "failed to stop network engine");
                }
                info!("network engine stopped");
                Ok(())
            }
        }
    }
}
