//! Shared plumbing: log output, reconnect backoff

pub mod backoff;
pub mod logging;

pub use backoff::BackoffConfig;
pub use logging::{LogConfig, LogError, LogFormat, Verbosity, init_logging};
