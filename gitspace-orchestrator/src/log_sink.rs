//! Container output persisted in `gitspace_logs`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gitspace_core::{GitspaceError, LogLine, LogSink, LogStream};
use sqlx::SqlitePool;

#[derive(Clone)]
pub struct SqliteLogSink {
    pool: SqlitePool,
}

impl SqliteLogSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn internal(e: sqlx::Error) -> GitspaceError {
    GitspaceError::Internal(format!("log store: {}", e))
}

#[derive(sqlx::FromRow)]
struct LogRow {
    gitspace_id: String,
    stream: String,
    line: String,
    created_at: i64,
}

#[async_trait]
impl LogSink for SqliteLogSink {
    async fn append(
        &self,
        gitspace_id: &str,
        stream: LogStream,
        line: &str,
    ) -> gitspace_core::Result<()> {
        sqlx::query(
            "INSERT INTO gitspace_logs (gitspace_id, stream, line, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(gitspace_id)
        .bind(stream.to_string())
        .bind(line)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(internal)?;

        Ok(())
    }

    async fn tail(&self, gitspace_id: &str, limit: usize) -> gitspace_core::Result<Vec<LogLine>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = sqlx::query_as::<_, LogRow>(
            "SELECT gitspace_id, stream, line, created_at FROM gitspace_logs
             WHERE gitspace_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(gitspace_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        rows.reverse();

        rows.into_iter()
            .map(|row| {
                let stream = row
                    .stream
                    .parse::<LogStream>()
                    .map_err(GitspaceError::Serialization)?;
                Ok(LogLine {
                    gitspace_id: row.gitspace_id,
                    stream,
                    line: row.line,
                    created_at: DateTime::from_timestamp(row.created_at, 0).unwrap_or_default(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_db;

    #[tokio::test]
    async fn test_tail_returns_latest_lines_oldest_first() {
        let sink = SqliteLogSink::new(create_test_db().await);
        for i in 0..5 {
            sink.append("i1", LogStream::Stdout, &format!("line {}", i))
                .await
                .unwrap();
        }
        sink.append("i2", LogStream::Stderr, "other").await.unwrap();
        sink.append("i1", LogStream::System, "done").await.unwrap();

        let tail = sink.tail("i1", 3).await.unwrap();
        let lines: Vec<_> = tail.iter().map(|l| l.line.as_str()).collect();
        assert_eq!(lines, vec!["line 3", "line 4", "done"]);
        assert_eq!(tail[2].stream, LogStream::System);
    }
}
