//! Log processing for kubetail
//!
//! This crate runs on the node agent. It discovers container log files,
//! watches them for changes and streams their records through an external
//! line-processing engine.

mod error;
mod index;
mod record;
mod stream;
mod watcher;

pub use error::{LogError, Result};
pub use index::{LogFileIndex, parse_file_name};
pub use record::RecordParser;
pub use stream::{DEFAULT_ENGINE_PROGRAM, EngineCommand, LogStreamEngine, engine_args};
pub use watcher::{CloseHandle, LogFileWatcher};

// Re-export types used in our public API
pub use kubetail_types::{
    FollowFrom, LogFileMetadata, LogFileSpec, LogFileWatchEvent, LogRecord, LogStreamRequest,
    StreamDirection, WatchEventType,
};
