pub mod config;
pub mod deploy;
pub mod errors;
pub mod telemetry;
