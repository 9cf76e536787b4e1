use crate::network::bootstrap::{BootstrapStatus, StatusWatch};
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReadinessError {
    #[error("network bootstrap ended before interface {interface} came up: {reason}")]
    Bootstrap { interface: String, reason: String },
}

/// Looks up the address currently assigned to an interface.
pub trait InterfaceProbe: Send + Sync {
    fn address(&self, name: &str) -> Option<IpAddr>;
}

/// Reads the host's interface table.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemInterfaces;

impl InterfaceProbe for SystemInterfaces {
    fn address(&self, name: &str) -> Option<IpAddr> {
        let interfaces = match if_addrs::get_if_addrs() {
            Ok(interfaces) => interfaces,
            Err(err) => {
                warn!(error = %err, "failed to enumerate network interfaces");
                return None;
            }
        };
        let mut fallback = None;
        for iface in interfaces.into_iter().filter(|iface| iface.name == name) {
            let ip = iface.ip();
            if ip.is_ipv4() {
                return Some(ip);
            }
            fallback.get_or_insert(ip);
        }
        fallback
    }
}

pub struct ReadinessPoller<P> {
    probe: P,
    interval: Duration,
}

impl<P: InterfaceProbe> ReadinessPoller<P> {
    pub fn new(probe: P, interval: Duration) -> Self {
        Self { probe, interval }
    }

    /// Polls until `name` has an address. Unbounded; returns early only if
    /// the bootstrap task has already given up.
    pub async fn wait_for_interface(
        &self,
        name: &str,
        bootstrap: &StatusWatch,
    ) -> Result<IpAddr, ReadinessError> {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            if let Some(ip) = self.probe.address(name) {
                info!(interface = name, %ip, attempt, "interface ready");
                return Ok(ip);
            }
            match bootstrap.current() {
                BootstrapStatus::Failed(reason) => {
                    return Err(ReadinessError::Bootstrap {
                        interface: name.to_string(),
                        reason,
                    });
                }
                BootstrapStatus::Stopped => {
                    return Err(ReadinessError::Bootstrap {
                        interface: name.to_string(),
                        reason: "engine stopped".to_string(),
                    });
                }
                BootstrapStatus::Starting | BootstrapStatus::Running => {}
            }
            debug!(interface = name, attempt, interval = ?self.interval, "interface not ready");
            tokio::time::sleep(self.interval).await;
        }
    }
}

impl<P: InterfaceProbe + ?Sized> InterfaceProbe for std::sync::Arc<P> {
    fn address(&self, name: &str) -> Option<IpAddr> {
        (**self).address(name)
    }
}
