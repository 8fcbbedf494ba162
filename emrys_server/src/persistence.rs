use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::PersistenceError;
use crate::models::{GpuUsageEvent, TelemetryRecord};
use crate::retention;

/// Per-machine histories, keyed by machine id.
pub type Histories = BTreeMap<String, VecDeque<TelemetryRecord>>;

const GPU_LOG_COLUMNS: [&str; 3] = ["user", "time", "machine_id"];

/// Reads and writes the two snapshot files: machine histories as JSON and the
/// GPU usage log as CSV.
#[derive(Debug, Clone)]
pub struct PersistenceAdapter {
    status_file: PathBuf,
    gpu_log_file: PathBuf,
    max_records: usize,
}

impl PersistenceAdapter {
    pub fn new(status_file: PathBuf, gpu_log_file: PathBuf, max_records: usize) -> Self {
        Self {
            status_file,
            gpu_log_file,
            max_records,
        }
    }

    /// Rewrite both snapshot files. Each file is swapped in with a rename, so a
    /// reader sees either the previous snapshot or the new one.
    pub fn save(&self, histories: &Histories, gpu_log: &VecDeque<GpuUsageEvent>) -> Result<()> {
        let status = serde_json::to_vec(histories).context("Failed to encode status snapshot")?;
        write_atomic(&self.status_file, &status)?;
        write_atomic(&self.gpu_log_file, encode_gpu_log(gpu_log).as_bytes())?;
        Ok(())
    }

    /// Load machine histories. A missing file is an empty store.
    pub fn load_status(&self) -> Result<Histories, PersistenceError> {
        let Some(raw) = read_if_exists(&self.status_file)? else {
            return Ok(Histories::new());
        };

        let mut histories: Histories = serde_json::from_str(&raw)?;
        histories.retain(|_, history| !history.is_empty());
        for history in histories.values_mut() {
            let excess = retention::history_overflow(history.len(), self.max_records);
            history.drain(..excess);
        }
        Ok(histories)
    }

    /// Load the GPU usage log. A missing file is an empty log.
    pub fn load_gpu_log(&self) -> Result<VecDeque<GpuUsageEvent>, PersistenceError> {
        match read_if_exists(&self.gpu_log_file)? {
            Some(raw) => decode_gpu_log(&raw),
            None => Ok(VecDeque::new()),
        }
    }
}

fn read_if_exists(path: &Path) -> Result<Option<String>, PersistenceError> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let mut file = File::create(&tmp_path)
        .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("Failed to sync {}", tmp_path.display()))?;

    fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

fn encode_gpu_log(gpu_log: &VecDeque<GpuUsageEvent>) -> String {
    let mut out = GPU_LOG_COLUMNS.join(",");
    out.push('\n');
    for event in gpu_log {
        let time = event.time.to_rfc3339_opts(SecondsFormat::AutoSi, true);
        let fields = [
            quote_field(&event.user),
            quote_field(&time),
            quote_field(&event.machine_id),
        ];
        out.push_str(&fields.join(","));
        out.push('\n');
    }
    out
}

fn quote_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn decode_gpu_log(raw: &str) -> Result<VecDeque<GpuUsageEvent>, PersistenceError> {
    let mut rows = parse_rows(raw)?.into_iter();

    let Some(header) = rows.next() else {
        return Ok(VecDeque::new());
    };
    let column = |name: &str| {
        header
            .fields
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| PersistenceError::Csv {
                line: header.line,
                reason: format!("missing column `{name}`"),
            })
    };
    let (user_col, time_col, machine_col) = (column("user")?, column("time")?, column("machine_id")?);
    let width = header.fields.len();

    let mut events = VecDeque::new();
    for CsvRow { line, fields } in rows {
        if fields.len() != width {
            return Err(PersistenceError::Csv {
                line,
                reason: format!("expected {width} fields, found {}", fields.len()),
            });
        }

        let time = DateTime::parse_from_rfc3339(&fields[time_col])
            .map_err(|e| PersistenceError::Csv {
                line,
                reason: format!("bad time `{}`: {e}", fields[time_col]),
            })?
            .with_timezone(&Utc);

        events.push_back(GpuUsageEvent {
            user: fields[user_col].clone(),
            time,
            machine_id: fields[machine_col].clone(),
        });
    }
    Ok(events)
}

/// One CSV record and the file line it starts on (1-based).
struct CsvRow {
    line: usize,
    fields: Vec<String>,
}

/// Split CSV text into rows of unquoted fields. Blank lines are skipped.
fn parse_rows(raw: &str) -> Result<Vec<CsvRow>, PersistenceError> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut line = 1;
    let mut row_start = 1;
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push(c);
                }
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' if field.is_empty() => in_quotes = true,
            ',' => row.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                row.push(std::mem::take(&mut field));
                push_row(&mut rows, row_start, std::mem::take(&mut row));
                line += 1;
                row_start = line;
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(PersistenceError::Csv {
            line: row_start,
            reason: "unterminated quoted field".to_string(),
        });
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        push_row(&mut rows, row_start, row);
    }
    Ok(rows)
}

fn push_row(rows: &mut Vec<CsvRow>, line: usize, fields: Vec<String>) {
    let blank = fields.len() == 1 && fields[0].is_empty();
    if !blank {
        rows.push(CsvRow { line, fields });
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::models::StatusReport;

    fn adapter(dir: &Path, max_records: usize) -> PersistenceAdapter {
        PersistenceAdapter::new(
            dir.join("machine_status.json"),
            dir.join("gpu_status.csv"),
            max_records,
        )
    }

    fn record(machine_id: &str, offset_secs: i64) -> TelemetryRecord {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(offset_secs);
        StatusReport {
            machine_id: Some(machine_id.to_string()),
            created_at: Some(at),
            ..Default::default()
        }
        .validate(at)
        .unwrap()
    }

    fn event(user: &str, machine_id: &str, millis: i64) -> GpuUsageEvent {
        GpuUsageEvent {
            user: user.to_string(),
            time: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::milliseconds(millis),
            machine_id: machine_id.to_string(),
        }
    }

    #[test]
    fn missing_files_load_empty() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path(), 10);

        assert!(adapter.load_status().unwrap().is_empty());
        assert!(adapter.load_gpu_log().unwrap().is_empty());
    }

    #[test]
    fn empty_state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path(), 10);

        adapter.save(&Histories::new(), &VecDeque::new()).unwrap();

        assert!(adapter.load_status().unwrap().is_empty());
        assert!(adapter.load_gpu_log().unwrap().is_empty());
    }

    #[test]
    fn populated_state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path(), 10);

        let mut histories = Histories::new();
        histories.insert("m1".into(), (0..3).map(|i| record("m1", i)).collect());
        histories.insert("m2".into(), VecDeque::from([record("m2", 9)]));
        let gpu_log = VecDeque::from([
            event("u_aaa", "m1", 0),
            event("u_bbb", "m,2", 1500),
            event("", "quoted \"id\"", 2),
        ]);

        adapter.save(&histories, &gpu_log).unwrap();

        assert_eq!(adapter.load_status().unwrap(), histories);
        assert_eq!(adapter.load_gpu_log().unwrap(), gpu_log);
        assert!(!dir.path().join("machine_status.json.tmp").exists());
        assert!(!dir.path().join("gpu_status.csv.tmp").exists());
    }

    #[test]
    fn oversized_history_is_trimmed_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut histories = Histories::new();
        histories.insert("m1".into(), (0..5).map(|i| record("m1", i)).collect());
        adapter(dir.path(), 10).save(&histories, &VecDeque::new()).unwrap();

        let loaded = adapter(dir.path(), 3).load_status().unwrap();
        let kept: Vec<_> = loaded["m1"].iter().cloned().collect();
        assert_eq!(kept, vec![record("m1", 2), record("m1", 3), record("m1", 4)]);
    }

    #[test]
    fn corrupt_files_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path(), 10);

        fs::write(dir.path().join("machine_status.json"), "{\"m1\": [").unwrap();
        assert!(matches!(adapter.load_status(), Err(PersistenceError::Json(_))));

        fs::write(dir.path().join("gpu_status.csv"), "user,time,machine_id\nu,not-a-time,m1\n").unwrap();
        assert!(matches!(
            adapter.load_gpu_log(),
            Err(PersistenceError::Csv { line: 2, .. })
        ));

        fs::write(dir.path().join("gpu_status.csv"), "user,machine_id\nu,m1\n").unwrap();
        assert!(matches!(adapter.load_gpu_log(), Err(PersistenceError::Csv { line: 1, .. })));
    }

    #[test]
    fn csv_errors_report_file_lines() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path(), 10);
        let path = dir.path().join("gpu_status.csv");

        // Blank lines still count.
        fs::write(&path, "user,time,machine_id\n\n\nu,not-a-time,m1\n").unwrap();
        assert!(matches!(adapter.load_gpu_log(), Err(PersistenceError::Csv { line: 4, .. })));

        // A quoted field spanning two lines pushes the next record down.
        fs::write(
            &path,
            "user,time,machine_id\n\"a\nb\",2024-03-01T12:00:00Z,m1\nu,2024-03-01T12:00:00Z\n",
        )
        .unwrap();
        assert!(matches!(adapter.load_gpu_log(), Err(PersistenceError::Csv { line: 4, .. })));

        fs::write(&path, "user,time,machine_id\n\nu,\"open\n").unwrap();
        assert!(matches!(adapter.load_gpu_log(), Err(PersistenceError::Csv { line: 3, .. })));
    }

    #[test]
    fn column_order_follows_header() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("gpu_status.csv"),
            "machine_id,user,time\r\nm1,u_abc,2024-03-01T12:00:00Z\r\n\r\n",
        )
        .unwrap();

        let log = adapter(dir.path(), 10).load_gpu_log().unwrap();
        assert_eq!(log, VecDeque::from([event("u_abc", "m1", 0)]));
    }
}
