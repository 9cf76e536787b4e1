pub mod bootstrap;
pub mod config;
pub mod engine;
pub mod interface;

pub use bootstrap::{BootstrapError, BootstrapHandle, BootstrapStatus, StatusWatch};
pub use config::{BindAddress, ConfigError, LivenessPolicy, NetworkConfig};
pub use engine::{EngineError, NetworkEngine, ProcessEngine};
pub use interface::{InterfaceProbe, ReadinessError, ReadinessPoller, SystemInterfaces};
