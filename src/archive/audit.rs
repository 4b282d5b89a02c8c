use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{errors::DaclError, telemetry::TelemetrySnapshot, trigger::TriggerSource};

pub const CSV_HEADER: &str = "timestamp,sourceType,warningLabel,speed,preFiles,postFile,status";
pub const MANIFEST_FILE: &str = "events.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Complete,
    Incomplete,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Complete => "complete",
            EventStatus::Incomplete => "incomplete",
        }
    }
}

/// One archived event, as written to the audit log and the JSON lines manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: String,
    pub source: TriggerSource,
    pub warning_label: String,
    pub speed_kph: i64,
    pub pre_files: Vec<PathBuf>,
    pub post_file: Option<PathBuf>,
    pub status: EventStatus,
    pub telemetry: TelemetrySnapshot,
}

impl AuditRecord {
    pub fn csv_row(&self) -> String {
        let pre_files = self
            .pre_files
            .iter()
            .map(|p| p.to_string_lossy())
            .join(";");
        let post_file = self
            .post_file
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        [
            self.timestamp.clone(),
            self.source.audit_name().to_string(),
            self.warning_label.clone(),
            self.speed_kph.to_string(),
            pre_files,
            post_file,
            self.status.as_str().to_string(),
        ]
        .iter()
        .map(|field| csv_field(field))
        .join(",")
    }
}

fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Append-only CSV audit log with a JSON lines manifest next to it.
#[derive(Debug)]
pub struct AuditLog {
    csv_path: PathBuf,
    manifest_path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(csv_path: &Path) -> Self {
        let manifest_path = csv_path
            .parent()
            .map(|dir| dir.join(MANIFEST_FILE))
            .unwrap_or_else(|| PathBuf::from(MANIFEST_FILE));
        Self {
            csv_path: csv_path.to_path_buf(),
            manifest_path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    pub fn append(&self, record: &AuditRecord) -> Result<(), DaclError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(dir) = self.csv_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| file_error("create_dir", dir, e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.csv_path)
            .map_err(|e| file_error("open", &self.csv_path, e))?;
        let is_new = file
            .metadata()
            .map(|meta| meta.len() == 0)
            .unwrap_or(false);
        if is_new {
            writeln!(file, "{CSV_HEADER}").map_err(|e| file_error("write", &self.csv_path, e))?;
        }
        writeln!(file, "{}", record.csv_row())
            .map_err(|e| file_error("write", &self.csv_path, e))?;

        serde_jsonlines::append_json_lines(&self.manifest_path, [record])
            .map_err(|e| file_error("write", &self.manifest_path, e))?;

        debug!(
            "Audit row written for {} ({})",
            record.timestamp,
            record.status.as_str()
        );
        Ok(())
    }

    /// Reads back every event in the manifest.
    pub fn read_manifest(&self) -> Result<Vec<AuditRecord>, DaclError> {
        serde_jsonlines::json_lines(&self.manifest_path)
            .map_err(|e| file_error("open", &self.manifest_path, e))?
            .collect::<std::io::Result<Vec<AuditRecord>>>()
            .map_err(|e| file_error("read", &self.manifest_path, e))
    }
}

fn file_error(operation: &str, path: &Path, source: std::io::Error) -> DaclError {
    DaclError::FileOperationError {
        operation: operation.to_string(),
        path: path.to_path_buf(),
        source,
    }
}
