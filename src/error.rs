//! Crate-wide error type.

use picoswitch_protocol::DecodeError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the picoswitch host controller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Inbound serial line was not a recognized command. The transport logs
    /// and drops these without replying.
    #[error("malformed request: {0}")]
    MalformedRequest(#[from] DecodeError),

    /// The container runtime could not be commanded (binary missing,
    /// container name unknown, daemon unreachable). State is left unchanged.
    #[error("container runtime error: {0}")]
    Lifecycle(String),

    /// A memory domain could not be read. Callers substitute the `{0,0}`
    /// sample instead of failing the reply.
    #[error("sensor unavailable: {0}")]
    Sensor(String),

    /// The serial link itself failed. Fatal to the current session; the
    /// transport reopens the port rather than crashing the process.
    #[error("serial link error: {0}")]
    Transport(String),

    /// Failed to load the configuration file.
    #[error("failed to load config: {0}")]
    ConfigLoad(String),

    /// Invalid configuration or command-line value.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Convenience constructor for lifecycle failures.
    pub fn lifecycle(msg: impl Into<String>) -> Self {
        Error::Lifecycle(msg.into())
    }

    /// Convenience constructor for sensor failures.
    pub fn sensor(msg: impl Into<String>) -> Self {
        Error::Sensor(msg.into())
    }
}
