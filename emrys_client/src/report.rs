use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct GpuStatus {
    pub index: u32,
    pub gpu_name: Option<String>,
    pub gpu_usage: Option<f64>,
    pub temperature: Option<f64>,
    pub memory_free: Option<f64>,
    pub memory_total: Option<f64>,
    pub memory_usage: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GpuComputeProcess {
    pub pid: u32,
    pub user: String,
    pub gpu_uuid: Option<String>,
    pub gpu_index: Option<u32>,
    pub gpu_mem_used: Option<f64>,
    pub gpu_mem_unit: String,
    pub cpu_usage: Option<f64>,
    pub cpu_mem_usage: Option<f64>,
    pub proc_uptime: Option<f64>,
    pub proc_uptime_str: Option<String>,
    pub command: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiskStatus {
    pub directory: String,
    pub created_at: Option<DateTime<Utc>>,
    pub usage: f64,
    pub free: String,
    pub total: String,
    pub detail: Vec<(String, String)>,
}

/// One status report, in the shape the collector's `/report` endpoint takes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusReport {
    pub report_key: String,
    pub machine_id: String,
    pub name: Option<String>,
    pub created_at: Option<DateTime<Utc>>,

    pub hostname: Option<String>,
    pub local_ip: Option<String>,
    pub ipv4s: Vec<String>,
    pub ipv6s: Vec<String>,
    pub architecture: Option<String>,
    pub platform: Option<String>,
    pub platform_release: Option<String>,
    pub platform_version: Option<String>,
    pub linux_distro: Option<String>,
    pub processor: Option<String>,
    pub uptime: Option<f64>,
    pub uptime_str: Option<String>,
    pub nvidia_smi_version: Option<String>,

    pub cpu_model: Option<String>,
    pub cpu_cores: Option<u32>,
    pub cpu_usage: Option<f64>,
    pub cpu_temp: Option<f64>,
    pub ram_free: Option<String>,
    pub ram_total: Option<String>,
    pub ram_usage: Option<f64>,

    pub gpu_status: Vec<GpuStatus>,
    pub gpu_compute_processes: Vec<GpuComputeProcess>,
    pub users_info: BTreeMap<String, Vec<String>>,
    pub disk_system: Option<DiskStatus>,
    pub disk_external: Vec<DiskStatus>,
}

/// POST a report to the collector.
pub async fn send_report(client: &Client, server_url: &str, report: &StatusReport) -> Result<()> {
    let url = format!("{}/report", server_url.trim_end_matches('/'));
    let response = client
        .post(&url)
        .json(report)
        .send()
        .await
        .context("Error sending status report")?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("Status report rejected {}: {}", status, body);
    }
    Ok(())
}
