use crate::credentials::PairingToken;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BIND_ADDRESS: &str = "10.1.0.20/24";
pub const DEFAULT_INTERFACE: &str = "recovery0";
pub const DEFAULT_ENGINE_LOG_LEVEL: &str = "fatal";

const MAX_INTERFACE_NAME: usize = 15;
const ENGINE_LOG_LEVELS: &[&str] = &["debug", "info", "warn", "error", "dpanic", "panic", "fatal"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("network token is empty")]
    EmptyToken,
    #[error("bind address '{0}' is not an IPv4 CIDR")]
    InvalidAddress(String),
    #[error("interface name '{0}' must be 1-15 bytes")]
    InvalidInterface(String),
    #[error("unknown engine log level '{0}'")]
    InvalidLogLevel(String),
    #[error("MTU values must be non-zero and interface MTU must not exceed packet MTU ({interface} > {packet})")]
    InvalidMtu { packet: u32, interface: u32 },
}

/// IPv4 address plus prefix, e.g. `10.1.0.20/24`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindAddress {
    pub ip: Ipv4Addr,
    pub prefix: u8,
}

impl BindAddress {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidAddress(value.to_string());
        let (ip, prefix) = value.split_once('/').ok_or_else(invalid)?;
        let ip: Ipv4Addr = ip.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        if prefix > 32 {
            return Err(invalid());
        }
        Ok(Self { ip, prefix })
    }
}

impl std::fmt::Display for BindAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LedgerConfig {
    pub announce_interval: Duration,
    pub sync_interval: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NatConfig {
    pub service: bool,
    pub map: bool,
    pub rate_limit: bool,
    pub rate_limit_global: u32,
    pub rate_limit_peer: u32,
    pub rate_limit_interval: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DiscoveryConfig {
    pub dht: bool,
    pub mdns: bool,
    pub interval: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectionConfig {
    pub auto_relay: bool,
    pub hole_punch: bool,
    pub max_connections: u32,
    pub max_streams: u32,
}

/// Heartbeat service registered alongside the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct LivenessPolicy {
    pub max_silence: Duration,
    pub check_interval: Duration,
    pub grace: Duration,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            max_silence: Duration::from_secs(20),
            check_interval: Duration::from_secs(10),
            grace: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NetworkConfig {
    #[serde(skip)]
    pub network_token: String,
    pub address: String,
    pub interface: String,
    pub log_level: String,
    pub libp2p_log_level: String,
    pub frame_timeout: Duration,
    pub low_profile: bool,
    pub vpn_low_profile: bool,
    pub concurrency: usize,
    pub packet_mtu: u32,
    pub interface_mtu: u32,
    pub ledger: LedgerConfig,
    pub nat: NatConfig,
    pub discovery: DiscoveryConfig,
    pub connection: ConnectionConfig,
}

impl NetworkConfig {
    pub fn new(token: &PairingToken, address: &str, interface: &str, log_level: &str) -> Self {
        Self {
            network_token: token.as_str().to_string(),
            address: address.to_string(),
            interface: interface.to_string(),
            log_level: log_level.to_string(),
            libp2p_log_level: "error".to_string(),
            frame_timeout: Duration::from_secs(30),
            low_profile: true,
            vpn_low_profile: true,
            concurrency: host_concurrency(),
            packet_mtu: 1420,
            interface_mtu: 1200,
            ledger: LedgerConfig {
                announce_interval: Duration::from_secs(30),
                sync_interval: Duration::from_secs(30),
            },
            nat: NatConfig {
                service: false,
                map: true,
                rate_limit: true,
                rate_limit_global: 10,
                rate_limit_peer: 10,
                rate_limit_interval: Duration::from_secs(10),
            },
            discovery: DiscoveryConfig {
                dht: true,
                mdns: true,
                interval: Duration::from_secs(120),
            },
            connection: ConnectionConfig {
                auto_relay: true,
                hole_punch: true,
                max_connections: 100,
                max_streams: 100,
            },
        }
    }

    pub fn validate(&self) -> Result<BindAddress, ConfigError> {
        if self.network_token.is_empty() {
            return Err(ConfigError::EmptyToken);
        }
        let bind = BindAddress::parse(&self.address)?;
        if self.interface.is_empty() || self.interface.len() > MAX_INTERFACE_NAME {
            return Err(ConfigError::InvalidInterface(self.interface.clone()));
        }
        if !ENGINE_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log_level.clone()));
        }
        if self.packet_mtu == 0 || self.interface_mtu == 0 || self.interface_mtu > self.packet_mtu
        {
            return Err(ConfigError::InvalidMtu {
                packet: self.packet_mtu,
                interface: self.interface_mtu,
            });
        }
        Ok(bind)
    }

    /// Command-line form understood by edgevpn-compatible engines. The token
    /// is deliberately absent; engines receive it through the environment.
    pub fn engine_args(&self, liveness: &LivenessPolicy) -> Result<Vec<String>, ConfigError> {
        self.validate()?;
        let mut args = vec![
            flag("address", &self.address),
            flag("interface", &self.interface),
            flag("log-level", &self.log_level),
            flag("libp2p-log-level", &self.libp2p_log_level),
            flag("timeout", secs(self.frame_timeout)),
            flag("concurrency", self.concurrency),
            flag("packet-mtu", self.packet_mtu),
            flag("mtu", self.interface_mtu),
            flag("ledger-announce-interval", self.ledger.announce_interval.as_secs()),
            flag("ledger-syncronization-interval", self.ledger.sync_interval.as_secs()),
            flag("natratelimit-global", self.nat.rate_limit_global),
            flag("natratelimit-peer", self.nat.rate_limit_peer),
            flag("natratelimit-interval", self.nat.rate_limit_interval.as_secs()),
            flag("discovery-interval", self.discovery.interval.as_secs()),
            flag("max-connections", self.connection.max_connections),
            flag("max-streams", self.connection.max_streams),
            flag("alive-max-silence", liveness.max_silence.as_secs()),
            flag("alive-check-interval", liveness.check_interval.as_secs()),
            flag("alive-grace", liveness.grace.as_secs()),
        ];
        let switches = [
            ("low-profile", self.low_profile),
            ("vpn-low-profile", self.vpn_low_profile),
            ("natservice", self.nat.service),
            ("natmap", self.nat.map),
            ("natratelimit", self.nat.rate_limit),
            ("dht", self.discovery.dht),
            ("mdns", self.discovery.mdns),
            ("autorelay", self.connection.auto_relay),
            ("holepunch", self.connection.hole_punch),
        ];
        args.extend(
            switches
                .iter()
                .map(|(name, enabled)| flag(name, enabled)),
        );
        Ok(args)
    }
}

fn flag(name: &str, value: impl std::fmt::Display) -> String {
    format!("--{name}={value}")
}

fn secs(duration: Duration) -> String {
    format!("{}s", duration.as_secs())
}

fn host_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> PairingToken {
        PairingToken::new("dG9rZW4=")
    }

    #[test]
    fn construction_carries_fixed_policy() {
        let token = token();
        let mut config = NetworkConfig::new(&token, DEFAULT_BIND_ADDRESS, DEFAULT_INTERFACE, "fatal");
        assert!(config.concurrency >= 1);
        config.concurrency = 4;

        let expected = NetworkConfig {
            network_token: "dG9rZW4=".into(),
            address: "10.1.0.20/24".into(),
            interface: "recovery0".into(),
            log_level: "fatal".into(),
            libp2p_log_level: "error".into(),
            frame_timeout: Duration::from_secs(30),
            low_profile: true,
            vpn_low_profile: true,
            concurrency: 4,
            packet_mtu: 1420,
            interface_mtu: 1200,
            ledger: LedgerConfig {
                announce_interval: Duration::from_secs(30),
                sync_interval: Duration::from_secs(30),
            },
            nat: NatConfig {
                service: false,
                map: true,
                rate_limit: true,
                rate_limit_global: 10,
                rate_limit_peer: 10,
                rate_limit_interval: Duration::from_secs(10),
            },
            discovery: DiscoveryConfig {
                dht: true,
                mdns: true,
                interval: Duration::from_secs(120),
            },
            connection: ConnectionConfig {
                auto_relay: true,
                hole_punch: true,
                max_connections: 100,
                max_streams: 100,
            },
        };
        assert_eq!(config, expected);
    }

    #[test]
    fn construction_is_deterministic_apart_from_concurrency() {
        let token = token();
        let first = NetworkConfig::new(&token, "10.9.0.1/16", "rec1", "error");
        let second = NetworkConfig::new(&token, "10.9.0.1/16", "rec1", "error");
        assert_eq!(first, second);
    }

    #[test]
    fn liveness_defaults() {
        let policy = LivenessPolicy::default();
        assert_eq!(policy.max_silence, Duration::from_secs(20));
        assert_eq!(policy.check_interval, Duration::from_secs(10));
        assert_eq!(policy.grace, Duration::from_secs(10));
    }

    #[test]
    fn bind_address_parsing() {
        let bind = BindAddress::parse("10.1.0.20/24").unwrap();
        assert_eq!(bind.ip, Ipv4Addr::new(10, 1, 0, 20));
        assert_eq!(bind.prefix, 24);
        assert_eq!(bind.to_string(), "10.1.0.20/24");
        for bad in ["10.1.0.20", "10.1.0.300/24", "10.1.0.20/33", "fe80::1/64", ""] {
            assert!(BindAddress::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn validation_rejects_malformed_inputs() {
        let token = token();
        let empty = PairingToken::new("");
        assert_eq!(
            NetworkConfig::new(&empty, DEFAULT_BIND_ADDRESS, DEFAULT_INTERFACE, "fatal").validate(),
            Err(ConfigError::EmptyToken)
        );
        assert!(matches!(
            NetworkConfig::new(&token, DEFAULT_BIND_ADDRESS, "a-very-long-interface-name", "fatal")
                .validate(),
            Err(ConfigError::InvalidInterface(_))
        ));
        assert!(matches!(
            NetworkConfig::new(&token, DEFAULT_BIND_ADDRESS, DEFAULT_INTERFACE, "loud").validate(),
            Err(ConfigError::InvalidLogLevel(_))
        ));
        let mut config = NetworkConfig::new(&token, DEFAULT_BIND_ADDRESS, DEFAULT_INTERFACE, "fatal");
        config.interface_mtu = 1500;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidMtu { .. })));
    }

    #[test]
    fn engine_args_exclude_token_and_carry_policy() {
        let token = token();
        let config = NetworkConfig::new(&token, DEFAULT_BIND_ADDRESS, DEFAULT_INTERFACE, "fatal");
        let args = config.engine_args(&LivenessPolicy::default()).unwrap();
        assert!(args.iter().all(|arg| !arg.contains("dG9rZW4=")));
        for expected in [
            "--address=10.1.0.20/24",
            "--interface=recovery0",
            "--log-level=fatal",
            "--packet-mtu=1420",
            "--mtu=1200",
            "--max-connections=100",
            "--discovery-interval=120",
            "--natratelimit-interval=10",
            "--alive-max-silence=20",
            "--natservice=false",
            "--holepunch=true",
        ] {
            assert!(args.iter().any(|arg| arg == expected), "missing {expected}");
        }
    }
}
