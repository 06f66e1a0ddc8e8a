//! picoswitch host controller library.
//!
//! Bridges a microcontroller-driven toggle switch to a local containerized
//! inference server: serial commands come in, container lifecycle actions and
//! status lines go out. The pieces:
//!
//! - [`runtime`]: issues start/stop to podman/docker and queries ground truth
//! - [`stats`]: samples RAM and GPU memory on demand
//! - [`controller`]: the single task that owns the lifecycle state machine
//! - [`transport`]: the serial session loop and reconnect policy
//! - [`config`]: persistent host configuration

pub mod config;
pub mod controller;
pub mod error;
pub mod runtime;
pub mod stats;
pub mod transport;

pub use error::{Error, Result};

/// Crate version, reported in logs at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
