use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{HerdError, Result};
use crate::scheduler::GpuInfo;

const QUERY_ARGS: [&str; 2] = [
    "--query-gpu=name,temperature.gpu,memory.total,memory.free,utilization.gpu",
    "--format=csv,nounits,noheader",
];

/// Parse one `nvidia-smi` CSV row. Spaces are stripped from every field,
/// including the GPU name.
pub fn parse_nvidia_line(line: &str) -> Option<GpuInfo> {
    let fields: Vec<String> = line
        .trim_end_matches(['\r', '\n'])
        .split(',')
        .map(|field| field.replace(' ', ""))
        .collect();
    let [name, temperature, total, free, utilization] = fields.as_slice() else {
        return None;
    };
    Some(GpuInfo {
        name: name.clone(),
        temperature: temperature.parse().ok()?,
        memory_total_mb: total.parse().ok()?,
        memory_free_mb: free.parse().ok()?,
        utilization: utilization.parse().ok()?,
    })
}

/// Parse a whole `nvidia-smi` report, skipping rows that don't parse.
pub fn parse_nvidia_output(output: &str) -> Vec<GpuInfo> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let gpu = parse_nvidia_line(line);
            if gpu.is_none() {
                tracing::debug!(line, "Skipping unparseable nvidia-smi row");
            }
            gpu
        })
        .collect()
}

/// Run `nvidia-smi` once.
pub async fn poll_once(nvidia_smi: &str) -> Result<Vec<GpuInfo>> {
    let output = Command::new(nvidia_smi)
        .args(QUERY_ARGS)
        .stdin(Stdio::null())
        .output()
        .await?;
    if !output.status.success() {
        return Err(HerdError::Config(format!(
            "{nvidia_smi} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(parse_nvidia_output(&String::from_utf8_lossy(&output.stdout)))
}

/// Poll GPUs every `interval` and publish the result until shutdown. A failed
/// poll keeps the previous inventory.
pub async fn run_poller(
    nvidia_smi: String,
    interval: Duration,
    gpus: watch::Sender<Vec<GpuInfo>>,
    shutdown: CancellationToken,
) {
    tracing::info!(nvidia_smi = %nvidia_smi, interval_ms = interval.as_millis() as u64, "Starting GPU poller");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match poll_once(&nvidia_smi).await {
                    Ok(inventory) => {
                        gpus.send_replace(inventory);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "GPU poll failed");
                    }
                }
            }
        }
    }
}
