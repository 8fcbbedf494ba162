use std::collections::HashMap;
use std::ffi::OsString;
use std::process::Command;

use anyhow::{Context, Result, bail};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind, Users};

use crate::report::{GpuComputeProcess, GpuStatus};
use crate::system_info::format_uptime;

const GPU_QUERY: &str =
    "--query-gpu=index,uuid,name,utilization.gpu,temperature.gpu,memory.free,memory.total";
const APPS_QUERY: &str = "--query-compute-apps=pid,gpu_uuid,used_memory";

/// GPU readings from `nvidia-smi`. Empty when the tool is missing.
pub struct GpuReadings {
    pub status: Vec<GpuStatus>,
    pub processes: Vec<GpuComputeProcess>,
}

pub fn read_gpus() -> GpuReadings {
    let gpus = match nvidia_smi(&[GPU_QUERY, "--format=csv,noheader,nounits"]) {
        Ok(out) => parse_gpu_rows(&out),
        Err(e) => {
            log::debug!("No GPU readings: {e:#}");
            return GpuReadings {
                status: Vec::new(),
                processes: Vec::new(),
            };
        }
    };

    let index_by_uuid: HashMap<String, u32> = gpus
        .iter()
        .map(|(uuid, gpu)| (uuid.clone(), gpu.index))
        .collect();

    let processes = match nvidia_smi(&[APPS_QUERY, "--format=csv,noheader,nounits"]) {
        Ok(out) => parse_app_rows(&out)
            .into_iter()
            .map(|mut process| {
                process.gpu_index = process
                    .gpu_uuid
                    .as_ref()
                    .and_then(|uuid| index_by_uuid.get(uuid).copied());
                process
            })
            .collect(),
        Err(e) => {
            log::warn!("Failed to list GPU compute apps: {e:#}");
            Vec::new()
        }
    };

    GpuReadings {
        status: gpus.into_iter().map(|(_, gpu)| gpu).collect(),
        processes,
    }
}

pub fn driver_version() -> Option<String> {
    nvidia_smi(&["--query-gpu=driver_version", "--format=csv,noheader"])
        .ok()
        .and_then(|out| out.lines().next().map(|l| l.trim().to_string()))
        .filter(|v| !v.is_empty())
}

fn nvidia_smi(args: &[&str]) -> Result<String> {
    let output = Command::new("nvidia-smi")
        .args(args)
        .output()
        .context("Failed to run nvidia-smi")?;
    if !output.status.success() {
        bail!("nvidia-smi exited with {}", output.status);
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn fields(line: &str) -> Vec<&str> {
    line.split(',').map(str::trim).collect()
}

/// `[N/A]` and friends become `None`.
fn number(field: &str) -> Option<f64> {
    field.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse `index, uuid, name, util %, temp, mem free, mem total` rows.
pub fn parse_gpu_rows(out: &str) -> Vec<(String, GpuStatus)> {
    out.lines()
        .filter_map(|line| {
            let f = fields(line);
            if f.len() < 7 {
                return None;
            }
            let index = f[0].parse().ok()?;
            let memory_free = number(f[5]);
            let memory_total = number(f[6]);
            let memory_usage = match (memory_free, memory_total) {
                (Some(free), Some(total)) if total > 0.0 => Some(((total - free) / total).clamp(0.0, 1.0)),
                _ => None,
            };

            Some((
                f[1].to_string(),
                GpuStatus {
                    index,
                    gpu_name: Some(f[2].to_string()),
                    gpu_usage: number(f[3]).map(|u| (u / 100.0).clamp(0.0, 1.0)),
                    temperature: number(f[4]),
                    memory_free,
                    memory_total,
                    memory_usage,
                },
            ))
        })
        .collect()
}

/// Parse `pid, gpu uuid, used memory` rows.
pub fn parse_app_rows(out: &str) -> Vec<GpuComputeProcess> {
    out.lines()
        .filter_map(|line| {
            let f = fields(line);
            if f.len() < 3 {
                return None;
            }
            Some(GpuComputeProcess {
                pid: f[0].parse().ok()?,
                gpu_uuid: Some(f[1].to_string()),
                gpu_mem_used: number(f[2]),
                gpu_mem_unit: "MiB".to_string(),
                ..Default::default()
            })
        })
        .collect()
}

/// Fill owner, command line and CPU/RAM share of each GPU process from the
/// process table. Processes that exited since `nvidia-smi` ran keep only
/// their GPU fields.
pub fn describe_processes(sys: &mut System, users: &Users, processes: &mut [GpuComputeProcess]) {
    let pids: Vec<Pid> = processes.iter().map(|p| Pid::from_u32(p.pid)).collect();
    if pids.is_empty() {
        return;
    }

    sys.refresh_memory();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&pids),
        true,
        ProcessRefreshKind::nothing()
            .with_cpu()
            .with_memory()
            .with_user(UpdateKind::OnlyIfNotSet)
            .with_cmd(UpdateKind::OnlyIfNotSet),
    );
    let cores = sys.cpus().len().max(1);
    let total_memory = sys.total_memory();

    for entry in processes.iter_mut() {
        let Some(process) = sys.process(Pid::from_u32(entry.pid)) else {
            log::debug!("GPU process {} is gone", entry.pid);
            continue;
        };

        entry.user = process
            .user_id()
            .and_then(|uid| users.get_user_by_id(uid))
            .map(|user| user.name().to_string())
            .unwrap_or_default();
        entry.command = Some(join_command(process.cmd())).filter(|c| !c.is_empty());
        entry.cpu_usage = cpu_share(process.cpu_usage(), cores);
        entry.cpu_mem_usage = memory_share(process.memory(), total_memory);

        let uptime = process.run_time();
        entry.proc_uptime = Some(uptime as f64);
        entry.proc_uptime_str = Some(format_uptime(uptime));
    }
}

/// sysinfo reports per-core percent; the collector wants a share of the machine.
pub fn cpu_share(percent: f32, cores: usize) -> Option<f64> {
    let share = f64::from(percent) / 100.0 / cores.max(1) as f64;
    share.is_finite().then(|| share.clamp(0.0, 1.0))
}

pub fn memory_share(used: u64, total: u64) -> Option<f64> {
    (total > 0).then(|| (used as f64 / total as f64).clamp(0.0, 1.0))
}

fn join_command(args: &[OsString]) -> String {
    args.iter()
        .map(|arg| arg.to_string_lossy())
        .filter(|arg| !arg.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gpu_rows() {
        let out = "0, GPU-aaa, NVIDIA A100-SXM4-40GB, 35, 41, 30720, 40960\n\
                   1, GPU-bbb, NVIDIA A100-SXM4-40GB, [N/A], 38, 40960, 40960\n\
                   garbage\n";

        let gpus = parse_gpu_rows(out);
        assert_eq!(gpus.len(), 2);

        let (uuid, first) = &gpus[0];
        assert_eq!(uuid, "GPU-aaa");
        assert_eq!(first.index, 0);
        assert_eq!(first.gpu_usage, Some(0.35));
        assert_eq!(first.temperature, Some(41.0));
        assert_eq!(first.memory_usage, Some(0.25));

        let (_, second) = &gpus[1];
        assert_eq!(second.index, 1);
        assert_eq!(second.gpu_usage, None);
        assert_eq!(second.memory_usage, Some(0.0));
    }

    #[test]
    fn parses_compute_apps() {
        let apps = parse_app_rows("4242, GPU-aaa, 1024\n17, GPU-bbb, [N/A]\n");

        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0].pid, 4242);
        assert_eq!(apps[0].gpu_uuid.as_deref(), Some("GPU-aaa"));
        assert_eq!(apps[0].gpu_mem_used, Some(1024.0));
        assert_eq!(apps[1].gpu_mem_used, None);
    }

    #[test]
    fn cpu_share_is_spread_over_cores() {
        assert_eq!(cpu_share(250.0, 4), Some(0.625));
        assert_eq!(cpu_share(900.0, 4), Some(1.0));
        assert_eq!(cpu_share(50.0, 0), Some(0.5));
        assert_eq!(cpu_share(f32::NAN, 4), None);
    }

    #[test]
    fn memory_share_needs_a_total() {
        assert_eq!(memory_share(512, 2048), Some(0.25));
        assert_eq!(memory_share(1, 0), None);
    }

    #[test]
    fn joins_command_arguments() {
        let args: Vec<OsString> = ["python", "train.py", "", "--lr", "0.1"]
            .iter()
            .map(OsString::from)
            .collect();
        assert_eq!(join_command(&args), "python train.py --lr 0.1");
        assert_eq!(join_command(&[]), "");
    }

    #[test]
    fn describes_live_processes_from_the_process_table() {
        let mut sys = System::new();
        let users = Users::new_with_refreshed_list();
        let mut processes = vec![
            GpuComputeProcess {
                pid: std::process::id(),
                gpu_mem_used: Some(1024.0),
                ..Default::default()
            },
            GpuComputeProcess {
                pid: u32::MAX,
                gpu_mem_used: Some(10.0),
                ..Default::default()
            },
        ];

        describe_processes(&mut sys, &users, &mut processes);

        let live = &processes[0];
        assert!(live.command.is_some());
        assert!(live.proc_uptime.is_some());
        assert!(live.proc_uptime_str.is_some());
        assert!(live.cpu_usage.is_none_or(|v| (0.0..=1.0).contains(&v)));
        assert!(live.cpu_mem_usage.is_some_and(|v| (0.0..=1.0).contains(&v)));
        assert_eq!(live.gpu_mem_used, Some(1024.0));

        let gone = &processes[1];
        assert!(gone.command.is_none());
        assert!(gone.cpu_usage.is_none());
        assert!(gone.proc_uptime.is_none());
        assert_eq!(gone.gpu_mem_used, Some(10.0));
    }
}
