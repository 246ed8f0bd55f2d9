//! Append-only audit trail of applied records
//!
//! One JSON object per line: `{"timestamp": <RFC 3339>, "object": <record>}`.

use crate::crd::ContainerScale;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Serialize)]
struct AuditEntry<'a> {
    timestamp: DateTime<Utc>,
    object: &'a ContainerScale,
}

#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    // Keeps lines from concurrent workers whole
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a timestamped snapshot of `record`
    pub async fn append(&self, record: &ContainerScale) -> io::Result<()> {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            object: record,
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::test_support::record;
    use crate::models::ResourceVector;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_writes_one_line_per_record() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path().join("audit.log"));

        log.append(&record("a", "node-a", ResourceVector::new(100, 1024)))
            .await
            .unwrap();
        log.append(&record("b", "node-a", ResourceVector::new(200, 2048)))
            .await
            .unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert!(lines[0]["timestamp"].is_string());
        assert_eq!(lines[0]["object"]["metadata"]["name"], "a");
        assert_eq!(
            lines[1]["object"]["spec"]["desiredResources"]["cpuMillicores"],
            200
        );
    }

    #[tokio::test]
    async fn test_append_fails_for_missing_directory() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path().join("missing").join("audit.log"));

        let result = log
            .append(&record("a", "node-a", ResourceVector::new(1, 1)))
            .await;
        assert!(result.is_err());
    }
}
