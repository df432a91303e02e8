// Standard library
use std::sync::Arc;

// External crates
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::log_sink::{LogSink, LogStream};

/// Forward every line of `reader` into the log sink on a background task.
///
/// The returned handle completes when the reader reaches EOF, so callers that
/// must not block on the child process simply drop it.
pub fn forward_lines<R>(
    reader: R,
    gitspace_id: String,
    stream: LogStream,
    sink: Arc<dyn LogSink>,
) -> JoinHandle<usize>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut forwarded = 0;

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Err(e) = sink.append(&gitspace_id, stream, &line).await {
                        warn!("Dropping {} line for {}: {}", stream, gitspace_id, e);
                        continue;
                    }
                    forwarded += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Stopped reading {} for {}: {}", stream, gitspace_id, e);
                    break;
                }
            }
        }

        debug!("Forwarded {} {} lines for {}", forwarded, stream, gitspace_id);
        forwarded
    })
}

/// Write a single engine-originated line, ignoring sink failures.
pub async fn system_line(sink: &dyn LogSink, gitspace_id: &str, line: &str) {
    if let Err(e) = sink.append(gitspace_id, LogStream::System, line).await {
        warn!("Failed to record system log line for {}: {}", gitspace_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_sink::MemoryLogSink;

    #[tokio::test]
    async fn test_forward_lines_reaches_sink() {
        let sink = Arc::new(MemoryLogSink::new());
        let input: &'static [u8] = b"cloning repo\ninstalling ide\nready\n";

        let handle = forward_lines(input, "gs-1".to_string(), LogStream::Stdout, sink.clone());
        let count = handle.await.unwrap();

        assert_eq!(count, 3);
        let tail = sink.tail("gs-1", 10).await.unwrap();
        assert_eq!(tail.last().unwrap().line, "ready");
        assert!(tail.iter().all(|l| l.stream == LogStream::Stdout));
    }

    #[tokio::test]
    async fn test_system_line() {
        let sink = MemoryLogSink::new();
        system_line(&sink, "gs-2", "provisioning infrastructure").await;
        let tail = sink.tail("gs-2", 1).await.unwrap();
        assert_eq!(tail[0].stream, LogStream::System);
    }
}
