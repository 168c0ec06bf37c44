// Durable-log collaborator interface consumed by the topic core.
pub mod log;

pub use log::{AppendRecord, LogProvider, LogRecord, MemoryLog, MemoryLogProvider, Offset, TopicLog};

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("log deleted")]
    Deleted,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
