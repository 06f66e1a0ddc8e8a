//! One-shot status command implementation.
//!
//! Composes a status reply the same way the daemon does, without touching
//! the serial link. Handy for checking sensors and runtime wiring before
//! plugging the board in.

use clap::Args;
use picoswitch::config::HostConfig;
use picoswitch::runtime::{CliRuntime, ContainerRuntime};
use picoswitch::stats::{MemorySampler, SystemSampler};
use picoswitch::{Error, Result};
use picoswitch_protocol::{encode_status, LifecycleState, StatusReply};
use std::path::PathBuf;

/// Print a one-shot status reply.
#[derive(Args, Debug)]
pub struct StatCmd {
    /// Container name to query.
    #[arg(short, long)]
    pub container: Option<String>,

    /// Compose file mode.
    #[arg(short = 'f', long)]
    pub compose_file: Option<PathBuf>,

    /// Container runtime binary (podman or docker; auto-detected if omitted).
    #[arg(long)]
    pub runtime: Option<String>,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatCmd {
    /// Execute the stat command.
    pub fn run(self, mut config: HostConfig) -> Result<()> {
        if let Some(container) = &self.container {
            config.container = container.clone();
        }
        if let Some(file) = &self.compose_file {
            config.compose_file = Some(file.clone());
        }
        if let Some(runtime) = &self.runtime {
            config.runtime = Some(runtime.clone());
        }

        let rt = tokio::runtime::Runtime::new().map_err(Error::Io)?;
        rt.block_on(async move {
            let runtime = CliRuntime::new(
                config.runtime.clone(),
                config.container.clone(),
                config.compose_file.clone(),
            )?;

            // One-shot: the runtime answer maps straight to a terminal state,
            // there is no transition to track here.
            let state = if runtime.is_running().await? {
                LifecycleState::On
            } else {
                LifecycleState::Off
            };
            let (accel, general) = SystemSampler::new().sample().await;
            let reply = StatusReply {
                state,
                accel,
                general,
            };

            if self.json {
                let json = serde_json::json!({
                    "container": config.container,
                    "state": state.to_string(),
                    "accel": { "used_mib": accel.used, "total_mib": accel.total },
                    "general": { "used_mib": general.used, "total_mib": general.total },
                    "line": encode_status(&reply),
                });
                println!("{:#}", json);
            } else {
                println!("container: {}", config.container);
                println!("state:     {}", state);
                if accel.is_unavailable() {
                    println!("vram:      unavailable");
                } else {
                    println!("vram:      {} / {} MiB", accel.used, accel.total);
                }
                println!("ram:       {} / {} MiB", general.used, general.total);
                println!("line:      {}", encode_status(&reply));
            }
            Ok(())
        })
    }
}
