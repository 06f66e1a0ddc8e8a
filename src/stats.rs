//! Memory stats sampling.
//!
//! Two read-only sensors: general system RAM from `/proc/meminfo` and
//! accelerator memory from `nvidia-smi`. A sample is produced fresh for
//! every status reply, never cached. Each domain degrades independently to
//! the `{0,0}` sentinel when its source is unavailable; a missing GPU must
//! not prevent RAM reporting.

use crate::error::{Error, Result};
use picoswitch_protocol::MemorySample;
use std::process::Stdio;
use std::time::Duration;

/// Timeout for one accelerator query. An unresponsive `nvidia-smi` is
/// treated as sensor-unavailable rather than stalling the reply.
const ACCEL_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// On-demand reader of the two memory domains.
///
/// Returns `(accelerator, general)`, matching the field order of the
/// `STAT:` line. Infallible by contract: failures surface as the
/// unavailable sentinel, already logged.
pub trait MemorySampler {
    async fn sample(&self) -> (MemorySample, MemorySample);
}

/// Samples the live host: `/proc/meminfo` and `nvidia-smi`.
#[derive(Debug, Clone, Default)]
pub struct SystemSampler;

impl SystemSampler {
    pub fn new() -> Self {
        Self
    }

    async fn general(&self) -> Result<MemorySample> {
        let text = tokio::fs::read_to_string("/proc/meminfo")
            .await
            .map_err(|e| Error::Sensor(format!("failed to read /proc/meminfo: {}", e)))?;
        parse_meminfo(&text)
    }

    async fn accel(&self) -> Result<MemorySample> {
        let query = tokio::process::Command::new("nvidia-smi")
            .args([
                "--query-gpu=memory.used,memory.total",
                "--format=csv,noheader,nounits",
            ])
            .stdin(Stdio::null())
            .output();

        let output = tokio::time::timeout(ACCEL_QUERY_TIMEOUT, query)
            .await
            .map_err(|_| Error::Sensor("nvidia-smi timed out".into()))?
            .map_err(|e| Error::Sensor(format!("failed to run nvidia-smi: {}", e)))?;

        if !output.status.success() {
            return Err(Error::Sensor(format!(
                "nvidia-smi exited with {}",
                output.status
            )));
        }

        parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
    }
}

impl MemorySampler for SystemSampler {
    async fn sample(&self) -> (MemorySample, MemorySample) {
        let accel = self.accel().await.unwrap_or_else(|e| {
            tracing::debug!(error = %e, "accelerator memory unavailable");
            MemorySample::unavailable()
        });
        let general = self.general().await.unwrap_or_else(|e| {
            tracing::debug!(error = %e, "general memory unavailable");
            MemorySample::unavailable()
        });
        (accel, general)
    }
}

/// Parse `/proc/meminfo` into a used/total sample in MiB.
///
/// Used is `MemTotal - MemAvailable`; the kernel reports both in kB.
fn parse_meminfo(text: &str) -> Result<MemorySample> {
    let mut total_kb: Option<u64> = None;
    let mut available_kb: Option<u64> = None;

    for line in text.lines() {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("MemTotal:"), Some(value)) => total_kb = value.parse().ok(),
            (Some("MemAvailable:"), Some(value)) => available_kb = value.parse().ok(),
            _ => {}
        }
    }

    match (total_kb, available_kb) {
        (Some(total), Some(available)) => Ok(MemorySample::new(
            total.saturating_sub(available) / 1024,
            total / 1024,
        )),
        _ => Err(Error::Sensor(
            "meminfo missing MemTotal or MemAvailable".into(),
        )),
    }
}

/// Parse `nvidia-smi --query-gpu=memory.used,memory.total` CSV output,
/// summing across GPUs. Values are already in MiB.
fn parse_nvidia_smi(text: &str) -> Result<MemorySample> {
    let mut used = 0u64;
    let mut total = 0u64;
    let mut seen = false;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split(',');
        let line_used: u64 = fields
            .next()
            .and_then(|f| f.trim().parse().ok())
            .ok_or_else(|| Error::Sensor(format!("bad nvidia-smi line: {:?}", line)))?;
        let line_total: u64 = fields
            .next()
            .and_then(|f| f.trim().parse().ok())
            .ok_or_else(|| Error::Sensor(format!("bad nvidia-smi line: {:?}", line)))?;
        used += line_used;
        total += line_total;
        seen = true;
    }

    if !seen {
        return Err(Error::Sensor("nvidia-smi reported no GPUs".into()));
    }
    Ok(MemorySample::new(used, total))
}
