//! File-based audit sink.
//!
//! Appends one JSON object per line. The file is opened in append-only
//! mode; existing lines are never rewritten.

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::audit::{AuditEvent, AuditSink};
use crate::error::AuditError;

/// Audit sink that writes JSON lines to a file.
pub struct FileAuditSink {
    path: PathBuf,
    writer: Mutex<Option<tokio::fs::File>>,
}

impl FileAuditSink {
    /// The file is created (or opened for append) on the first write.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: Mutex::new(None),
        }
    }

    fn failure(&self, reason: String) -> AuditError {
        AuditError::SinkFailure {
            name: format!("file:{}", self.path.display()),
            reason,
        }
    }
}

#[async_trait::async_trait]
impl AuditSink for FileAuditSink {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "file"
    }

    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(event).map_err(|e| AuditError::Serialization {
            reason: e.to_string(),
        })?;
        line.push(b'\n');

        let mut guard = self.writer.lock().await;
        if guard.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| self.failure(format!("open failed: {e}")))?;
            *guard = Some(file);
        }
        let file = guard
            .as_mut()
            .ok_or_else(|| self.failure("file handle missing after open".to_owned()))?;

        file.write_all(&line)
            .await
            .map_err(|e| self.failure(format!("write failed: {e}")))?;
        file.flush()
            .await
            .map_err(|e| self.failure(format!("flush failed: {e}")))?;
        Ok(())
    }
}

impl std::fmt::Debug for FileAuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAuditSink")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::audit::AuditAction;
    use crate::principal::Principal;
    use serde_json::json;

    #[tokio::test]
    async fn appends_one_json_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let sink = FileAuditSink::new(&path);
        let alice = Principal::user("alice").unwrap();

        for target in ["shared/a", "shared/b"] {
            let event = AuditEvent::new(&alice, AuditAction::SafeCreated, target, json!({}));
            sink.record(&event).await.unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: AuditEvent = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.target, "shared/b");
        assert_eq!(second.action, AuditAction::SafeCreated);
    }

    #[tokio::test]
    async fn unwritable_path_is_a_sink_failure() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileAuditSink::new(dir.path().join("missing").join("audit.log"));
        let alice = Principal::user("alice").unwrap();
        let event = AuditEvent::new(&alice, AuditAction::SafeDeleted, "shared/a", json!({}));
        assert!(matches!(
            sink.record(&event).await,
            Err(AuditError::SinkFailure { .. })
        ));
    }
}
