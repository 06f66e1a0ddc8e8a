//! Daemon command implementation.

use clap::Args;
use picoswitch::config::HostConfig;
use picoswitch::controller::Controller;
use picoswitch::runtime::CliRuntime;
use picoswitch::stats::SystemSampler;
use picoswitch::transport::Transport;
use picoswitch::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;

/// Run the host daemon.
#[derive(Args, Debug)]
pub struct RunCmd {
    /// Serial port (auto-detect if omitted).
    #[arg(short, long)]
    pub port: Option<PathBuf>,

    /// Serial baud rate.
    #[arg(long)]
    pub baud: Option<u32>,

    /// Container name to control.
    #[arg(short, long)]
    pub container: Option<String>,

    /// Compose file to drive instead of start/stop by name.
    #[arg(short = 'f', long)]
    pub compose_file: Option<PathBuf>,

    /// Container runtime binary (podman or docker; auto-detected if omitted).
    #[arg(long)]
    pub runtime: Option<String>,

    /// Interval between runtime polls while a transition is in flight
    /// (e.g. "2s").
    #[arg(long, value_parser = humantime::parse_duration)]
    pub poll_interval: Option<Duration>,

    /// Time after which a stuck transition settles to its target state
    /// (e.g. "45s").
    #[arg(long, value_parser = humantime::parse_duration)]
    pub settle_timeout: Option<Duration>,
}

impl RunCmd {
    /// Execute the run command.
    pub fn run(self, mut config: HostConfig) -> Result<()> {
        self.apply_overrides(&mut config);

        let runtime = tokio::runtime::Runtime::new().map_err(Error::Io)?;
        runtime.block_on(run_daemon(config))
    }

    /// Fold command-line flags over the loaded configuration.
    fn apply_overrides(&self, config: &mut HostConfig) {
        if let Some(port) = &self.port {
            config.port = Some(port.clone());
        }
        if let Some(baud) = self.baud {
            config.baud = baud;
        }
        if let Some(container) = &self.container {
            config.container = container.clone();
        }
        if let Some(file) = &self.compose_file {
            config.compose_file = Some(file.clone());
        }
        if let Some(runtime) = &self.runtime {
            config.runtime = Some(runtime.clone());
        }
        if let Some(interval) = self.poll_interval {
            config.poll_interval_secs = interval.as_secs().max(1);
        }
        if let Some(timeout) = self.settle_timeout {
            config.settle_timeout_secs = timeout.as_secs().max(1);
        }
    }
}

async fn run_daemon(config: HostConfig) -> Result<()> {
    let runtime = CliRuntime::new(
        config.runtime.clone(),
        config.container.clone(),
        config.compose_file.clone(),
    )?;
    tracing::info!(
        binary = runtime.binary(),
        container = %config.container,
        compose = config.compose_file.is_some(),
        "using container runtime"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (controller, handle) = Controller::new(
        runtime,
        SystemSampler::new(),
        config.poll_interval(),
        config.settle_timeout(),
        shutdown_rx.clone(),
    );
    let controller_task = tokio::spawn(controller.run());

    let transport = Transport::new(config.port.clone(), config.baud, handle, shutdown_rx);

    tokio::select! {
        result = transport.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
            let _ = shutdown_tx.send(true);
        }
    }

    // Let the controller drain before the process exits.
    let _ = controller_task.await;
    Ok(())
}
