use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use common::error::AppError;

/// One observed interaction, appended to the durable usage log. The triplet
/// miner replays windows of these to produce training examples.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UsageEvent {
    Query {
        query_id: String,
        corpus_id: String,
        query: String,
        /// Chunk ids in the order they were returned.
        ranked_chunk_ids: Vec<String>,
        at: DateTime<Utc>,
    },
    Feedback {
        query_id: String,
        chunk_id: String,
        helpful: bool,
        at: DateTime<Utc>,
    },
    Click {
        query_id: String,
        chunk_id: String,
        /// 1-based rank the user clicked at.
        rank: usize,
        at: DateTime<Utc>,
    },
}

impl UsageEvent {
    pub fn query_id(&self) -> &str {
        match self {
            Self::Query { query_id, .. }
            | Self::Feedback { query_id, .. }
            | Self::Click { query_id, .. } => query_id,
        }
    }
}

/// Append-only JSONL log at `<data_dir>/events/usage.log`.
#[derive(Debug, Clone)]
pub struct UsageEventLog {
    path: PathBuf,
}

impl UsageEventLog {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join("events").join("usage.log"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, event: &UsageEvent) -> Result<(), AppError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read the whole log. Malformed lines are skipped with a warning so one
    /// torn write cannot poison mining.
    pub async fn read_all(&self) -> Result<Vec<UsageEvent>, AppError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(AppError::Io(err)),
        };

        let mut events = Vec::new();
        for (line_no, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<UsageEvent>(line) {
                Ok(event) => events.push(event),
                Err(err) => {
                    warn!(line = line_no + 1, error = %err, "skipping malformed usage event");
                }
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn query_event(id: &str) -> UsageEvent {
        UsageEvent::Query {
            query_id: id.to_owned(),
            corpus_id: "c1".to_owned(),
            query: "login handler".to_owned(),
            ranked_chunk_ids: vec!["chunk-a".to_owned(), "chunk-b".to_owned()],
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn append_then_read_round_trips() {
        let dir = TempDir::new().expect("tempdir");
        let log = UsageEventLog::new(dir.path());

        log.append(&query_event("q1")).await.expect("append");
        log.append(&UsageEvent::Click {
            query_id: "q1".into(),
            chunk_id: "chunk-a".into(),
            rank: 1,
            at: Utc::now(),
        })
        .await
        .expect("append click");

        let events = log.read_all().await.expect("read");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].query_id(), "q1");
    }

    #[tokio::test]
    async fn missing_log_reads_as_empty() {
        let dir = TempDir::new().expect("tempdir");
        let log = UsageEventLog::new(dir.path());
        assert!(log.read_all().await.expect("read").is_empty());
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let dir = TempDir::new().expect("tempdir");
        let log = UsageEventLog::new(dir.path());
        log.append(&query_event("q1")).await.expect("append");

        // Simulate a torn write that still ended the line.
        let mut raw = tokio::fs::read_to_string(log.path()).await.expect("read");
        raw.push_str("{\"type\":\"query\",\"query_id\":\"tr\n");
        tokio::fs::write(log.path(), raw).await.expect("write");

        log.append(&query_event("q2")).await.expect("append after tear");

        let events = log.read_all().await.expect("read");
        assert_eq!(events.len(), 2);
    }
}
