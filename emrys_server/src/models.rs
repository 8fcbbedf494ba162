use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::mask::mask_identity;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GpuStatus {
    pub index: Option<u32>,
    pub gpu_name: Option<String>,
    pub gpu_usage: Option<f64>, // range: [0, 1]
    pub temperature: Option<f64>, // Celsius
    pub memory_free: Option<f64>, // MB
    pub memory_total: Option<f64>, // MB
    pub memory_usage: Option<f64>, // range: [0, 1]
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GpuComputeProcess {
    pub pid: Option<u32>,
    #[serde(default)]
    pub user: String,
    pub gpu_uuid: Option<String>,
    pub gpu_index: Option<u32>,
    pub gpu_mem_used: Option<f64>,
    #[serde(default = "default_mem_unit")]
    pub gpu_mem_unit: String,
    pub cpu_usage: Option<f64>, // range: [0, 1]
    pub cpu_mem_usage: Option<f64>, // range: [0, 1]
    pub proc_uptime: Option<f64>, // seconds
    pub proc_uptime_str: Option<String>, // HH:MM:SS
    pub command: Option<String>,
}

fn default_mem_unit() -> String {
    "MiB".to_string()
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DiskStatus {
    #[serde(default)]
    pub directory: String,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage: f64, // range: [0, 1]
    #[serde(default)]
    pub free: String,
    #[serde(default)]
    pub total: String,
    /// (user, usage) pairs.
    #[serde(default)]
    pub detail: Vec<(String, String)>,
}

/// Host metadata carried verbatim from the report.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostInfo {
    pub hostname: Option<String>,
    pub local_ip: Option<String>,
    pub public_ip: Option<String>,
    pub ipv4s: Vec<String>,
    pub ipv6s: Vec<String>,
    pub architecture: Option<String>,
    pub mac_address: Option<String>,
    pub platform: Option<String>,
    pub platform_release: Option<String>,
    pub platform_version: Option<String>,
    pub linux_distro: Option<String>,
    pub processor: Option<String>,
    pub uptime: Option<f64>, // seconds
    pub uptime_str: Option<String>,
    pub cuda_version: Option<String>,
    pub nvidia_smi_version: Option<String>,
    pub cpu_model: Option<String>,
    pub cpu_cores: Option<u32>,
    pub cpu_usage: Option<f64>, // range: [0, 1]
    pub cpu_temp: Option<f64>,
    pub ram_free: Option<String>, // MiB
    pub ram_total: Option<String>, // MiB
    pub ram_usage: Option<f64>, // range: [0, 1]
}

/// A status report as it arrives on the wire, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusReport {
    pub report_key: Option<String>,
    pub machine_id: Option<String>,
    pub name: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub host: HostInfo,
    pub gpu_status: Option<Vec<GpuStatus>>,
    pub gpu_compute_processes: Option<Vec<GpuComputeProcess>>,
    pub users_info: Option<BTreeMap<String, Vec<String>>>,
    pub disk_system: Option<DiskStatus>,
    pub disk_external: Option<Vec<DiskStatus>>,
}

/// A validated report. User identities are already masked and the report key
/// has been dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub machine_id: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub host: HostInfo,
    #[serde(default)]
    pub gpu_status: Vec<GpuStatus>,
    #[serde(default)]
    pub gpu_compute_processes: Vec<GpuComputeProcess>,
    #[serde(default)]
    pub users_info: BTreeMap<String, Vec<String>>,
    pub disk_system: Option<DiskStatus>,
    #[serde(default)]
    pub disk_external: Vec<DiskStatus>,
}

/// One GPU compute process seen in a report, kept for usage analytics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuUsageEvent {
    pub user: String,
    pub time: DateTime<Utc>,
    pub machine_id: String,
}

impl StatusReport {
    /// Validate the report and turn it into a storable record.
    ///
    /// `now` becomes `created_at` when the report carries none.
    pub fn validate(self, now: DateTime<Utc>) -> Result<TelemetryRecord, ValidationError> {
        let machine_id = self
            .machine_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ValidationError::Missing("machine_id".to_string()))?;

        check_unit("cpu_usage", self.host.cpu_usage)?;
        check_unit("ram_usage", self.host.ram_usage)?;

        let gpu_status = self.gpu_status.unwrap_or_default();
        for (i, gpu) in gpu_status.iter().enumerate() {
            check_unit(&format!("gpu_status[{i}].gpu_usage"), gpu.gpu_usage)?;
            check_unit(&format!("gpu_status[{i}].memory_usage"), gpu.memory_usage)?;
        }

        let mut processes = self.gpu_compute_processes.unwrap_or_default();
        for (i, process) in processes.iter_mut().enumerate() {
            check_unit(&format!("gpu_compute_processes[{i}].cpu_usage"), process.cpu_usage)?;
            check_unit(&format!("gpu_compute_processes[{i}].cpu_mem_usage"), process.cpu_mem_usage)?;
            process.user = mask_identity(&process.user);
        }

        let disk_system = self
            .disk_system
            .map(|disk| mask_disk("disk_system", disk))
            .transpose()?;
        let disk_external = self
            .disk_external
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(i, disk)| mask_disk(&format!("disk_external[{i}]"), disk))
            .collect::<Result<Vec<_>, _>>()?;

        let users_info = self
            .users_info
            .unwrap_or_default()
            .into_iter()
            .map(|(state, users)| {
                let masked = users.iter().map(|u| mask_identity(u)).collect();
                (state, masked)
            })
            .collect();

        Ok(TelemetryRecord {
            machine_id,
            name: self.name,
            created_at: self.created_at.unwrap_or(now),
            host: self.host,
            gpu_status,
            gpu_compute_processes: processes,
            users_info,
            disk_system,
            disk_external,
        })
    }
}

impl TelemetryRecord {
    /// GPU usage events derived from this record, one per compute process.
    pub fn gpu_usage_events(&self) -> impl Iterator<Item = GpuUsageEvent> + '_ {
        self.gpu_compute_processes.iter().map(|process| GpuUsageEvent {
            user: process.user.clone(),
            time: self.created_at,
            machine_id: self.machine_id.clone(),
        })
    }
}

fn mask_disk(field: &str, mut disk: DiskStatus) -> Result<DiskStatus, ValidationError> {
    check_unit(&format!("{field}.usage"), Some(disk.usage))?;
    for (user, _) in disk.detail.iter_mut() {
        *user = mask_identity(user);
    }
    Ok(disk)
}

fn check_unit(field: &str, value: Option<f64>) -> Result<(), ValidationError> {
    match value {
        Some(v) if !(v.is_finite() && (0.0..=1.0).contains(&v)) => {
            Err(ValidationError::OutOfRange {
                field: field.to_string(),
                value: v,
            })
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn parse(value: serde_json::Value) -> StatusReport {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn defaults_are_applied() {
        let record = parse(json!({ "machine_id": "m1" })).validate(now()).unwrap();

        assert_eq!(record.machine_id, "m1");
        assert_eq!(record.created_at, now());
        assert!(record.gpu_status.is_empty());
        assert!(record.gpu_compute_processes.is_empty());
        assert!(record.users_info.is_empty());
        assert!(record.disk_system.is_none());
        assert!(record.disk_external.is_empty());
    }

    #[test]
    fn reported_created_at_is_kept() {
        let record = parse(json!({
            "machine_id": "m1",
            "created_at": "2024-02-01T08:30:00Z",
        }))
        .validate(now())
        .unwrap();

        assert_eq!(
            record.created_at,
            Utc.with_ymd_and_hms(2024, 2, 1, 8, 30, 0).unwrap()
        );
    }

    #[test]
    fn missing_or_blank_machine_id_is_rejected() {
        for report in [json!({}), json!({ "machine_id": "" }), json!({ "machine_id": "  " })] {
            let err = parse(report).validate(now()).unwrap_err();
            assert_eq!(err, ValidationError::Missing("machine_id".to_string()));
        }
    }

    #[test]
    fn out_of_range_utilization_names_the_field() {
        let err = parse(json!({
            "machine_id": "m1",
            "gpu_status": [
                { "index": 0, "gpu_usage": 0.5 },
                { "index": 1, "gpu_usage": 1.5 },
            ],
        }))
        .validate(now())
        .unwrap_err();

        assert_eq!(
            err,
            ValidationError::OutOfRange {
                field: "gpu_status[1].gpu_usage".to_string(),
                value: 1.5,
            }
        );

        let err = parse(json!({ "machine_id": "m1", "ram_usage": -0.1 }))
            .validate(now())
            .unwrap_err();
        assert!(matches!(err, ValidationError::OutOfRange { ref field, .. } if field == "ram_usage"));
    }

    #[test]
    fn identities_are_masked() {
        let record = parse(json!({
            "machine_id": "m1",
            "gpu_compute_processes": [
                { "pid": 10, "user": "alice" },
                { "pid": 11 },
            ],
            "users_info": { "online": ["alice"], "offline": ["bob"] },
            "disk_system": {
                "directory": "/",
                "usage": 0.4,
                "detail": [["alice", "12GB"]],
            },
            "disk_external": [
                { "directory": "/data", "usage": 0.9, "detail": [["bob", "1TB"]] },
            ],
        }))
        .validate(now())
        .unwrap();

        let alice = mask_identity("alice");
        let bob = mask_identity("bob");
        assert_eq!(record.gpu_compute_processes[0].user, alice);
        assert_eq!(record.gpu_compute_processes[1].user, "");
        assert_eq!(record.users_info["online"], vec![alice.clone()]);
        assert_eq!(record.users_info["offline"], vec![bob.clone()]);
        let system = record.disk_system.as_ref().unwrap();
        assert_eq!(system.detail, vec![(alice, "12GB".to_string())]);
        assert_eq!(record.disk_external[0].detail, vec![(bob, "1TB".to_string())]);
    }

    #[test]
    fn record_never_carries_the_report_key() {
        let record = parse(json!({ "machine_id": "m1", "report_key": "secret" }))
            .validate(now())
            .unwrap();

        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("report_key").is_none());
        assert!(!value.to_string().contains("secret"));
    }

    #[test]
    fn host_fields_round_trip_flat() {
        let record = parse(json!({
            "machine_id": "m1",
            "hostname": "gpu-01",
            "cpu_cores": 32,
            "cpu_usage": 0.25,
            "ipv4s": ["10.0.0.5"],
        }))
        .validate(now())
        .unwrap();

        assert_eq!(record.host.hostname.as_deref(), Some("gpu-01"));
        assert_eq!(record.host.cpu_cores, Some(32));

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["hostname"], "gpu-01");
        let back: TelemetryRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn gpu_entries_without_index_or_pid_still_validate() {
        let record = parse(json!({
            "machine_id": "m1",
            "gpu_status": [{ "gpu_usage": 0.3 }],
            "gpu_compute_processes": [{ "user": "alice" }],
        }))
        .validate(now())
        .unwrap();

        assert_eq!(record.gpu_status[0].index, None);
        assert_eq!(record.gpu_compute_processes[0].pid, None);
        assert_eq!(record.gpu_usage_events().count(), 1);

        let err = parse(json!({
            "machine_id": "m1",
            "gpu_compute_processes": [{ "user": "alice", "cpu_usage": 2.0 }],
        }))
        .validate(now())
        .unwrap_err();
        assert!(matches!(
            err,
            ValidationError::OutOfRange { ref field, .. } if field == "gpu_compute_processes[0].cpu_usage"
        ));
    }

    #[test]
    fn one_usage_event_per_compute_process() {
        let record = parse(json!({
            "machine_id": "m1",
            "gpu_compute_processes": [{ "pid": 1, "user": "a" }, { "pid": 2, "user": "b" }],
        }))
        .validate(now())
        .unwrap();

        let events: Vec<_> = record.gpu_usage_events().collect();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.machine_id == "m1" && e.time == now()));
    }
}
