pub mod config;
pub mod fingerprint;
pub mod plugin;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod upstream;
