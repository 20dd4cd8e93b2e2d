//! Append-only audit trail of permission checks and resource access.
//!
//! One JSONL file per UTC day (`audit-YYYY-MM-DD.jsonl`), one line per record.
//! Entries are never rewritten. A failing write is reported through `tracing`
//! and never fails the operation being audited.

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A single audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub timestamp: DateTime<Utc>,
    pub plugin_id: String,
    pub action: String,
    pub resource: String,
    pub allowed: bool,
    /// Extra classification, e.g. `path_traversal` or `cache_hit`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditLogEntry {
    pub fn new(plugin_id: &str, action: &str, resource: &str, allowed: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            plugin_id: plugin_id.to_string(),
            action: action.to_string(),
            resource: resource.to_string(),
            allowed,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

struct OpenFile {
    day: NaiveDate,
    file: File,
}

pub struct AuditLogger {
    dir: Option<PathBuf>,
    current: Mutex<Option<OpenFile>>,
}

impl AuditLogger {
    /// Open (creating if needed) an audit directory.
    pub fn open(dir: &Path) -> vcp_core::Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: Some(dir.to_path_buf()),
            current: Mutex::new(None),
        })
    }

    /// A logger that only emits `tracing` events (no files).
    pub fn disabled() -> Self {
        Self {
            dir: None,
            current: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn log(&self, plugin_id: &str, action: &str, resource: &str, allowed: bool) {
        self.record(AuditLogEntry::new(plugin_id, action, resource, allowed));
    }

    pub fn log_detail(
        &self,
        plugin_id: &str,
        action: &str,
        resource: &str,
        allowed: bool,
        detail: &str,
    ) {
        self.record(AuditLogEntry::new(plugin_id, action, resource, allowed).with_detail(detail));
    }

    /// Append one record to the current day's file.
    pub fn record(&self, entry: AuditLogEntry) {
        debug!(
            plugin = %entry.plugin_id,
            action = %entry.action,
            resource = %entry.resource,
            allowed = entry.allowed,
            detail = entry.detail.as_deref().unwrap_or(""),
            "audit"
        );

        let Some(dir) = &self.dir else {
            return;
        };

        let mut line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize audit entry");
                return;
            }
        };
        line.push('\n');

        let day = entry.timestamp.date_naive();
        let mut current = self.current.lock();
        if current.as_ref().is_none_or(|open| open.day != day) {
            let path = day_file(dir, day);
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => *current = Some(OpenFile { day, file }),
                Err(e) => {
                    warn!(path = ?path, error = %e, "failed to open audit log");
                    *current = None;
                    return;
                }
            }
        }
        if let Some(open) = current.as_mut()
            && let Err(e) = open.file.write_all(line.as_bytes())
        {
            warn!(error = %e, "failed to append audit entry");
        }
    }

    /// Newest-first records across day files, optionally filtered by plugin.
    pub fn recent(&self, limit: usize, plugin: Option<&str>) -> vcp_core::Result<Vec<AuditLogEntry>> {
        let Some(dir) = &self.dir else {
            return Ok(Vec::new());
        };

        let mut days: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("audit-") && n.ends_with(".jsonl"))
            })
            .collect();
        // File names sort chronologically.
        days.sort();

        let mut out = Vec::new();
        for path in days.iter().rev() {
            let mut entries = read_day(path)?;
            entries.reverse();
            for entry in entries {
                if plugin.is_some_and(|p| p != entry.plugin_id) {
                    continue;
                }
                out.push(entry);
                if out.len() >= limit {
                    return Ok(out);
                }
            }
        }
        Ok(out)
    }
}

fn day_file(dir: &Path, day: NaiveDate) -> PathBuf {
    dir.join(format!("audit-{}.jsonl", day.format("%Y-%m-%d")))
}

fn read_day(path: &Path) -> vcp_core::Result<Vec<AuditLogEntry>> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(path = ?path, error = %e, "skipping corrupt audit line"),
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLogger::open(dir.path()).unwrap();
        audit.log("notes", "filesystem.read", "AppData/notes/a.txt", true);
        audit.log("notes", "network.request", "evil.com", false);

        let file = day_file(dir.path(), Utc::now().date_naive());
        let raw = std::fs::read_to_string(file).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["plugin_id"], "notes");
        assert_eq!(first["action"], "filesystem.read");
        assert_eq!(first["allowed"], true);
        assert!(first.get("timestamp").is_some());
        assert!(first.get("detail").is_none());
    }

    #[test]
    fn test_recent_is_newest_first_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLogger::open(dir.path()).unwrap();
        audit.log("a", "x", "1", true);
        audit.log("b", "x", "2", true);
        audit.log_detail("a", "x", "3", false, "path_traversal");

        let all = audit.recent(10, None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].resource, "3");
        assert_eq!(all[0].detail.as_deref(), Some("path_traversal"));

        let only_a = audit.recent(10, Some("a")).unwrap();
        assert_eq!(only_a.len(), 2);
        assert_eq!(audit.recent(1, None).unwrap().len(), 1);
    }

    #[test]
    fn test_reads_older_day_files() {
        let dir = tempfile::tempdir().unwrap();
        let old = AuditLogEntry {
            timestamp: "2024-01-02T03:04:05Z".parse().unwrap(),
            ..AuditLogEntry::new("a", "x", "old", true)
        };
        let day = old.timestamp.date_naive();
        std::fs::write(
            day_file(dir.path(), day),
            format!("{}\n", serde_json::to_string(&old).unwrap()),
        )
        .unwrap();

        let audit = AuditLogger::open(dir.path()).unwrap();
        audit.log("a", "x", "new", true);
        let entries = audit.recent(10, None).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].resource, "new");
        assert_eq!(entries[1].resource, "old");
    }

    #[test]
    fn test_disabled_logger_is_silent() {
        let audit = AuditLogger::disabled();
        audit.log("a", "x", "y", true);
        assert!(audit.recent(10, None).unwrap().is_empty());
    }
}
