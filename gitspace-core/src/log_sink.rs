//! Destination for container output, tagged per gitspace.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Lines written by the engine itself (stage banners, bootstrap steps).
    System,
}

impl Display for LogStream {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            LogStream::Stdout => f.write_str("stdout"),
            LogStream::Stderr => f.write_str("stderr"),
            LogStream::System => f.write_str("system"),
        }
    }
}

impl std::str::FromStr for LogStream {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(LogStream::Stdout),
            "stderr" => Ok(LogStream::Stderr),
            "system" => Ok(LogStream::System),
            other => Err(format!("unknown log stream: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub gitspace_id: String,
    pub stream: LogStream,
    pub line: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait LogSink: Send + Sync {
    async fn append(&self, gitspace_id: &str, stream: LogStream, line: &str) -> Result<()>;

    /// Most recent `limit` lines for a gitspace, oldest first.
    async fn tail(&self, gitspace_id: &str, limit: usize) -> Result<Vec<LogLine>>;
}

/// Process-local sink, used where no persistent store is wired in.
#[derive(Default)]
pub struct MemoryLogSink {
    lines: Mutex<HashMap<String, Vec<LogLine>>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogSink for MemoryLogSink {
    async fn append(&self, gitspace_id: &str, stream: LogStream, line: &str) -> Result<()> {
        let mut lines = self.lines.lock().await;
        lines
            .entry(gitspace_id.to_string())
            .or_default()
            .push(LogLine {
                gitspace_id: gitspace_id.to_string(),
                stream,
                line: line.to_string(),
                created_at: Utc::now(),
            });
        Ok(())
    }

    async fn tail(&self, gitspace_id: &str, limit: usize) -> Result<Vec<LogLine>> {
        let lines = self.lines.lock().await;
        let all = lines.get(gitspace_id).cloned().unwrap_or_default();
        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_sink_tail_keeps_order() {
        let sink = MemoryLogSink::new();
        for i in 0..5 {
            sink.append("gs-1", LogStream::Stdout, &format!("line {}", i))
                .await
                .unwrap();
        }
        sink.append("gs-2", LogStream::Stderr, "other").await.unwrap();

        let tail = sink.tail("gs-1", 2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].line, "line 3");
        assert_eq!(tail[1].line, "line 4");
        assert!(sink.tail("missing", 10).await.unwrap().is_empty());
    }

    #[test]
    fn test_stream_round_trips_through_str() {
        assert_eq!("stderr".parse::<LogStream>().unwrap(), LogStream::Stderr);
        assert_eq!(LogStream::System.to_string(), "system");
        assert!("tty".parse::<LogStream>().is_err());
    }
}
