//! Quarantine of files rejected by the validation chain with `Critical`
//! severity.
//!
//! Rejected files are moved (not deleted — an operator or the original
//! author may need the content back) into a quarantine directory with a
//! `.REJECTED` suffix, and a JSON sidecar records why. Grounded in the
//! same "never silently drop input" posture as `policy.rs`'s
//! `ForbiddenContent` error, generalised from "reject the request" to
//! "reject and relocate the file".

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum QuarantineError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sidecar metadata corrupt: {0}")]
    Sidecar(#[from] serde_json::Error),
    #[error("no quarantine record for {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub original_path: String,
    pub reason: String,
    pub validation_check: String,
    pub file_hash: String,
    pub quarantined_at: u64,
    pub restored: bool,
    pub restored_at: Option<u64>,
}

const SIDECAR_NAME: &str = ".metadata.json";

/// Moves rejected files into `quarantine_dir` and tracks why in a single
/// JSON sidecar file, keyed by the quarantined file's own name. A
/// `Mutex` serializes sidecar read-modify-write cycles since two workers
/// could quarantine files concurrently.
pub struct QuarantineManager {
    quarantine_dir: PathBuf,
    lock: Mutex<()>,
}

impl QuarantineManager {
    pub fn new(quarantine_dir: impl Into<PathBuf>) -> Self {
        Self {
            quarantine_dir: quarantine_dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub async fn quarantine(
        &self,
        path: &Path,
        reason: impl Into<String>,
        validation_check: impl Into<String>,
        file_hash: impl Into<String>,
    ) -> Result<PathBuf, QuarantineError> {
        let _guard = self.lock.lock().await;
        tokio::fs::create_dir_all(&self.quarantine_dir).await?;

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "unnamed".to_string());

        let dest = self.unique_destination(&file_name).await;
        tokio::fs::rename(path, &dest).await?;

        let record = QuarantineRecord {
            original_path: path.to_string_lossy().to_string(),
            reason: reason.into(),
            validation_check: validation_check.into(),
            file_hash: file_hash.into(),
            quarantined_at: now_unix(),
            restored: false,
            restored_at: None,
        };

        let dest_name = dest
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| file_name.clone());

        let mut sidecar = self.read_sidecar().await?;
        sidecar.insert(dest_name, record);
        self.write_sidecar(&sidecar).await?;

        Ok(dest)
    }

    /// Picks `<name>.REJECTED`, falling back to `<name>.REJECTED.1`,
    /// `.2`, ... if a prior quarantine already used that name.
    async fn unique_destination(&self, file_name: &str) -> PathBuf {
        let base = self.quarantine_dir.join(format!("{file_name}.REJECTED"));
        if tokio::fs::metadata(&base).await.is_err() {
            return base;
        }
        let mut n = 1u32;
        loop {
            let candidate = self
                .quarantine_dir
                .join(format!("{file_name}.REJECTED.{n}"));
            if tokio::fs::metadata(&candidate).await.is_err() {
                return candidate;
            }
            n += 1;
        }
    }

    /// Moves a quarantined file back to `destination` and marks the
    /// sidecar record restored. The record is kept (not deleted) as an
    /// audit trail of the reject/restore cycle.
    pub async fn restore(
        &self,
        quarantined_name: &str,
        destination: &Path,
    ) -> Result<(), QuarantineError> {
        let _guard = self.lock.lock().await;
        let mut sidecar = self.read_sidecar().await?;
        let record = sidecar
            .get_mut(quarantined_name)
            .ok_or_else(|| QuarantineError::NotFound(quarantined_name.to_string()))?;

        let quarantined_path = self.quarantine_dir.join(quarantined_name);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&quarantined_path, destination).await?;

        record.restored = true;
        record.restored_at = Some(now_unix());
        self.write_sidecar(&sidecar).await?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<QuarantineRecord>, QuarantineError> {
        let sidecar = self.read_sidecar().await?;
        Ok(sidecar.into_values().collect())
    }

    async fn read_sidecar(&self) -> Result<HashMap<String, QuarantineRecord>, QuarantineError> {
        let path = self.quarantine_dir.join(SIDECAR_NAME);
        match tokio::fs::read(&path).await {
            Ok(bytes) if !bytes.is_empty() => Ok(serde_json::from_slice(&bytes)?),
            _ => Ok(HashMap::new()),
        }
    }

    async fn write_sidecar(
        &self,
        sidecar: &HashMap<String, QuarantineRecord>,
    ) -> Result<(), QuarantineError> {
        let path = self.quarantine_dir.join(SIDECAR_NAME);
        let bytes = serde_json::to_vec_pretty(sidecar)?;
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn quarantines_and_records_metadata() {
        let dir = tempdir().unwrap();
        let source_dir = tempdir().unwrap();
        let source = source_dir.path().join("payload.bin");
        tokio::fs::write(&source, b"danger").await.unwrap();

        let manager = QuarantineManager::new(dir.path().join("quarantine"));
        let dest = manager
            .quarantine(&source, "executable magic", "extension_mismatch", "abc123")
            .await
            .unwrap();

        assert!(dest.to_string_lossy().ends_with("payload.bin.REJECTED"));
        assert!(tokio::fs::metadata(&dest).await.is_ok());
        assert!(tokio::fs::metadata(&source).await.is_err());

        let records = manager.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].validation_check, "extension_mismatch");
    }

    #[tokio::test]
    async fn repeated_quarantine_of_same_name_gets_suffix() {
        let dir = tempdir().unwrap();
        let source_dir = tempdir().unwrap();
        let manager = QuarantineManager::new(dir.path().join("quarantine"));

        for _ in 0..2 {
            let source = source_dir.path().join("dup.bin");
            tokio::fs::write(&source, b"x").await.unwrap();
            manager
                .quarantine(&source, "bad", "extension", "hash")
                .await
                .unwrap();
        }

        let records = manager.list().await.unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn restore_moves_file_back_and_marks_record() {
        let dir = tempdir().unwrap();
        let source_dir = tempdir().unwrap();
        let source = source_dir.path().join("note.md");
        tokio::fs::write(&source, b"hi").await.unwrap();

        let manager = QuarantineManager::new(dir.path().join("quarantine"));
        manager
            .quarantine(&source, "false positive", "text_file", "hash")
            .await
            .unwrap();

        let restored_to = source_dir.path().join("note-restored.md");
        manager
            .restore("note.md.REJECTED", &restored_to)
            .await
            .unwrap();

        assert!(tokio::fs::metadata(&restored_to).await.is_ok());
        let records = manager.list().await.unwrap();
        assert!(records[0].restored);
    }
}
