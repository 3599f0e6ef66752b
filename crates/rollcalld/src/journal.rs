//! Append-only JSON Lines attendance journal.

use crate::attendance::{AttendanceSink, PersistenceError};
use chrono::{DateTime, Local, Utc};
use parking_lot::Mutex;
use rollcall_core::Role;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// One journal line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub role: Role,
    /// Local calendar date, `YYYY-MM-DD`.
    pub date: String,
    /// Local wall-clock time, `HH:MM:SS`.
    pub time: String,
}

impl AttendanceRecord {
    pub fn new(id: &str, role: Role, at: DateTime<Utc>) -> Self {
        let local = at.with_timezone(&Local);
        Self {
            id: id.to_string(),
            role,
            date: local.format("%Y-%m-%d").to_string(),
            time: local.format("%H:%M:%S").to_string(),
        }
    }
}

pub struct JournalSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JournalSink {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        tracing::info!(path = %path.display(), "attendance journal opened");
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AttendanceSink for JournalSink {
    fn mark_present(&self, identity_id: &str, role: Role, at: DateTime<Utc>) -> Result<(), PersistenceError> {
        let fail = |reason: String| PersistenceError {
            identity_id: identity_id.to_string(),
            reason,
        };
        let mut line = serde_json::to_vec(&AttendanceRecord::new(identity_id, role, at)).map_err(|e| fail(e.to_string()))?;
        line.push(b'\n');

        let mut file = self.file.lock();
        file.write_all(&line).map_err(|e| fail(e.to_string()))?;
        file.flush().map_err(|e| fail(e.to_string()))
    }
}
