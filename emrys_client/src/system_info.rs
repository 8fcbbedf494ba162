use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::Utc;
use local_ip_address::{list_afinet_netifas, local_ip};
use sysinfo::{Disks, System, Users};

use crate::gpu;
use crate::report::{DiskStatus, StatusReport};
use crate::settings::ClientSettings;

const MIB: f64 = 1024.0 * 1024.0;
const GIB: f64 = 1024.0 * MIB;

/// Collects status reports for this machine. Keeps one `System` around so CPU
/// usage is measured over the interval between two reports.
pub struct Collector {
    sys: System,
    report_key: String,
    machine_id: String,
    name: Option<String>,
    external_disks: Vec<PathBuf>,
}

impl Collector {
    pub fn new(settings: &ClientSettings) -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let machine_id = settings.machine_id.clone().unwrap_or_else(local_machine_id);
        log::info!("Reporting as machine {machine_id}");

        Self {
            sys,
            report_key: settings.report_key.clone(),
            machine_id,
            name: settings.name.clone(),
            external_disks: settings.external_disks.clone(),
        }
    }

    pub fn collect(&mut self) -> StatusReport {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();

        let mut gpus = gpu::read_gpus();
        let users = Users::new_with_refreshed_list();
        gpu::describe_processes(&mut self.sys, &users, &mut gpus.processes);

        let total = self.sys.total_memory() as f64;
        let available = self.sys.available_memory() as f64;
        let ram_usage = (total > 0.0).then(|| ((total - available) / total).clamp(0.0, 1.0));

        let (ipv4s, ipv6s) = interface_addresses();
        let uptime = System::uptime();

        let disks = Disks::new_with_refreshed_list();
        let disk_system = disk_status(&disks, Path::new("/"));
        let disk_external = self
            .external_disks
            .iter()
            .filter_map(|mount| disk_status(&disks, mount))
            .collect();

        StatusReport {
            report_key: self.report_key.clone(),
            machine_id: self.machine_id.clone(),
            name: self.name.clone(),
            created_at: Some(Utc::now()),

            hostname: System::host_name(),
            local_ip: local_ip().ok().map(|ip| ip.to_string()),
            ipv4s,
            ipv6s,
            architecture: Some(std::env::consts::ARCH.to_string()),
            platform: Some(std::env::consts::OS.to_string()),
            platform_release: System::kernel_version(),
            platform_version: System::os_version(),
            linux_distro: System::long_os_version(),
            processor: self.sys.cpus().first().map(|cpu| cpu.brand().to_string()),
            uptime: Some(uptime as f64),
            uptime_str: Some(format_uptime(uptime)),
            nvidia_smi_version: gpu::driver_version(),

            cpu_model: self.sys.cpus().first().map(|cpu| cpu.brand().to_string()),
            cpu_cores: Some(self.sys.cpus().len() as u32),
            cpu_usage: Some((self.sys.global_cpu_usage() as f64 / 100.0).clamp(0.0, 1.0)),
            cpu_temp: cpu_temperature(),
            ram_free: Some(format!("{:.0}", available / MIB)),
            ram_total: Some(format!("{:.0}", total / MIB)),
            ram_usage,

            gpu_status: gpus.status,
            gpu_compute_processes: gpus.processes,
            users_info: users_info(),
            disk_system,
            disk_external,
        }
    }
}

/// `/etc/machine-id`, falling back to the hostname.
fn local_machine_id() -> String {
    fs::read_to_string("/etc/machine-id")
        .ok()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .or_else(System::host_name)
        .unwrap_or_else(|| "unknown".to_string())
}

fn interface_addresses() -> (Vec<String>, Vec<String>) {
    let mut ipv4s = Vec::new();
    let mut ipv6s = Vec::new();
    for (_, ip) in list_afinet_netifas().unwrap_or_default() {
        match ip {
            IpAddr::V4(v4) if !v4.is_loopback() => ipv4s.push(v4.to_string()),
            IpAddr::V6(v6) if !v6.is_loopback() => ipv6s.push(v6.to_string()),
            _ => {}
        }
    }
    (ipv4s, ipv6s)
}

fn disk_status(disks: &Disks, mount: &Path) -> Option<DiskStatus> {
    let disk = disks.list().iter().find(|d| d.mount_point() == mount)?;
    let total = disk.total_space() as f64;
    let free = disk.available_space() as f64;
    Some(DiskStatus {
        directory: mount.display().to_string(),
        created_at: Some(Utc::now()),
        usage: if total > 0.0 { ((total - free) / total).clamp(0.0, 1.0) } else { 0.0 },
        free: format_gb(free),
        total: format_gb(total),
        detail: Vec::new(),
    })
}

fn cpu_temperature() -> Option<f64> {
    fs::read_to_string("/sys/class/thermal/thermal_zone0/temp")
        .ok()
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .map(|milli| milli / 1000.0)
}

/// `online`: users with a session in `who`; `offline`: the other home directories.
fn users_info() -> BTreeMap<String, Vec<String>> {
    let online = Command::new("who")
        .output()
        .map(|out| parse_who(&String::from_utf8_lossy(&out.stdout)))
        .unwrap_or_default();

    let offline: BTreeSet<String> = fs::read_dir("/home")
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_dir())
                .filter_map(|e| e.file_name().into_string().ok())
                .filter(|name| !online.contains(name))
                .collect()
        })
        .unwrap_or_default();

    BTreeMap::from([
        ("online".to_string(), online.into_iter().collect()),
        ("offline".to_string(), offline.into_iter().collect()),
    ])
}

/// Distinct user names from `who` output.
pub fn parse_who(out: &str) -> BTreeSet<String> {
    out.lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

pub fn format_gb(bytes: f64) -> String {
    format!("{:.1}GB", bytes / GIB)
}

pub fn format_uptime(secs: u64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn who_output_gives_distinct_users() {
        let out = "alice    pts/0        2024-03-01 09:12 (10.0.0.7)\n\
                   bob      pts/1        2024-03-01 09:30 (10.0.0.8)\n\
                   alice    pts/2        2024-03-01 10:02 (10.0.0.7)\n";
        let users: Vec<_> = parse_who(out).into_iter().collect();
        assert_eq!(users, vec!["alice", "bob"]);
        assert!(parse_who("").is_empty());
    }

    #[test]
    fn formats_sizes_and_uptime() {
        assert_eq!(format_gb(1.5 * GIB), "1.5GB");
        assert_eq!(format_gb(0.0), "0.0GB");
        assert_eq!(format_uptime(0), "00:00:00");
        assert_eq!(format_uptime(90_061), "25:01:01");
    }
}
