pub mod credentials;
pub mod network;
pub mod pairing;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod terminal;
