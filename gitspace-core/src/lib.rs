pub mod command_stream;
pub mod error;
pub mod log_sink;
pub mod retry;
pub mod secrets;

pub use error::{ErrorKind, GitspaceError, Result};
pub use log_sink::{LogLine, LogSink, LogStream, MemoryLogSink};
pub use retry::{retry_with_backoff, RetryPolicy};
