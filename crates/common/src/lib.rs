//! Shared ambient plumbing: configuration, logging, reconnect backoff.

mod backoff;
mod config;
mod environment;
mod logging;

pub use backoff::ExponentialBackoff;
pub use config::{Config, ConfigError};
pub use environment::BinanceEnvironment;
pub use logging::init_logging;
