//! Container runtime integration.
//!
//! The runtime is the single source of truth for whether the inference
//! container is up: the controller never keeps an "I started it" flag, so
//! starts and stops done outside this process are still reflected correctly.
//! The cost is that transitions must be confirmed by polling [`is_running`]
//! after the command is issued.
//!
//! [`is_running`]: ContainerRuntime::is_running

use crate::error::{Error, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

/// Timeout for a single runtime state query.
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime binaries probed in preference order.
const RUNTIME_CANDIDATES: &[&str] = &["podman", "docker"];

/// Boundary to the container runtime.
///
/// Start/stop are idempotent and return as soon as the command is issued;
/// they never wait for the container to become ready. Confirmation is the
/// controller's job, via [`is_running`](Self::is_running) polls.
pub trait ContainerRuntime {
    /// Start the container. No-op success if it is already running.
    async fn request_start(&self) -> Result<()>;

    /// Stop the container. No-op success if it is already stopped.
    async fn request_stop(&self) -> Result<()>;

    /// Query whether the container is currently running. Ground truth;
    /// cheap enough to call every poll tick.
    async fn is_running(&self) -> Result<bool>;
}

/// Drives podman or docker through their CLIs.
///
/// With a compose file configured, start/stop become `compose up -d` /
/// `compose down`; otherwise plain `start`/`stop` by container name. The
/// running query is always `ps --filter name=…` regardless of mode.
#[derive(Debug, Clone)]
pub struct CliRuntime {
    binary: String,
    container: String,
    compose_file: Option<PathBuf>,
}

impl CliRuntime {
    /// Create a runtime driver, probing for podman/docker unless `binary`
    /// pins one explicitly.
    pub fn new(
        binary: Option<String>,
        container: String,
        compose_file: Option<PathBuf>,
    ) -> Result<Self> {
        let binary = match binary {
            Some(b) => b,
            None => detect_runtime_binary()?,
        };
        Ok(Self {
            binary,
            container,
            compose_file,
        })
    }

    /// The runtime binary in use.
    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn start_args(&self) -> Vec<String> {
        match &self.compose_file {
            Some(file) => vec![
                "compose".into(),
                "-f".into(),
                file.display().to_string(),
                "up".into(),
                "-d".into(),
            ],
            None => vec!["start".into(), self.container.clone()],
        }
    }

    fn stop_args(&self) -> Vec<String> {
        match &self.compose_file {
            Some(file) => vec![
                "compose".into(),
                "-f".into(),
                file.display().to_string(),
                "down".into(),
            ],
            None => vec!["stop".into(), self.container.clone()],
        }
    }

    fn query_args(&self) -> Vec<String> {
        vec![
            "ps".into(),
            "--filter".into(),
            format!("name={}", self.container),
            "--format".into(),
            "{{.Status}}".into(),
        ]
    }

    /// Issue a lifecycle command without waiting for the container itself.
    ///
    /// The child is detached; a background task reaps it and logs a non-zero
    /// exit, since by then the reply has long been sent.
    fn issue(&self, args: Vec<String>) -> Result<()> {
        tracing::info!(binary = %self.binary, args = ?args, "issuing runtime command");

        let mut child = tokio::process::Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                Error::Lifecycle(format!("failed to run {} {}: {}", self.binary, args[0], e))
            })?;

        let binary = self.binary.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    tracing::warn!(binary = %binary, %status, "runtime command exited non-zero")
                }
                Err(e) => tracing::warn!(binary = %binary, error = %e, "failed to reap runtime command"),
            }
        });

        Ok(())
    }
}

impl ContainerRuntime for CliRuntime {
    async fn request_start(&self) -> Result<()> {
        if matches!(self.is_running().await, Ok(true)) {
            tracing::debug!(container = %self.container, "already running, start is a no-op");
            return Ok(());
        }
        self.issue(self.start_args())
    }

    async fn request_stop(&self) -> Result<()> {
        if matches!(self.is_running().await, Ok(false)) {
            tracing::debug!(container = %self.container, "already stopped, stop is a no-op");
            return Ok(());
        }
        self.issue(self.stop_args())
    }

    async fn is_running(&self) -> Result<bool> {
        let query = tokio::process::Command::new(&self.binary)
            .args(self.query_args())
            .stdin(Stdio::null())
            .output();

        let output = tokio::time::timeout(QUERY_TIMEOUT, query)
            .await
            .map_err(|_| Error::Lifecycle(format!("{} ps timed out", self.binary)))?
            .map_err(|e| Error::Lifecycle(format!("failed to run {} ps: {}", self.binary, e)))?;

        if !output.status.success() {
            return Err(Error::Lifecycle(format!(
                "{} ps exited with {}",
                self.binary, output.status
            )));
        }

        Ok(status_means_running(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }
}

/// Interpret a `ps --format {{.Status}}` line.
///
/// An empty filter result means no such container; "Up …" means running;
/// "Created", "Restarting" and "Exited …" all count as not running for the
/// coarse boolean the state machine needs.
fn status_means_running(status: &str) -> bool {
    status.trim().to_lowercase().starts_with("up")
}

/// Probe for a usable runtime binary, preferring podman.
fn detect_runtime_binary() -> Result<String> {
    for candidate in RUNTIME_CANDIDATES {
        if std::process::Command::new(candidate)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .is_ok()
        {
            tracing::debug!(binary = candidate, "detected container runtime");
            return Ok(candidate.to_string());
        }
    }

    Err(Error::Lifecycle(
        "no container runtime found (tried podman, docker)".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_means_running() {
        assert!(status_means_running("Up 3 seconds\n"));
        assert!(status_means_running("Up About a minute"));
        assert!(!status_means_running(""));
        assert!(!status_means_running("\n"));
        assert!(!status_means_running("Exited (0) 2 minutes ago"));
        assert!(!status_means_running("Created"));
        assert!(!status_means_running("Restarting (1) 5 seconds ago"));
    }

    #[test]
    fn test_name_mode_args() {
        let runtime = CliRuntime {
            binary: "podman".into(),
            container: "llama-server".into(),
            compose_file: None,
        };
        assert_eq!(runtime.start_args(), ["start", "llama-server"]);
        assert_eq!(runtime.stop_args(), ["stop", "llama-server"]);
        assert_eq!(
            runtime.query_args(),
            [
                "ps",
                "--filter",
                "name=llama-server",
                "--format",
                "{{.Status}}"
            ]
        );
    }

    #[test]
    fn test_compose_mode_args() {
        let runtime = CliRuntime {
            binary: "docker".into(),
            container: "llama-server".into(),
            compose_file: Some(PathBuf::from("/srv/llamacpp/docker-compose.yml")),
        };
        assert_eq!(
            runtime.start_args(),
            [
                "compose",
                "-f",
                "/srv/llamacpp/docker-compose.yml",
                "up",
                "-d"
            ]
        );
        assert_eq!(
            runtime.stop_args(),
            ["compose", "-f", "/srv/llamacpp/docker-compose.yml", "down"]
        );
    }
}
