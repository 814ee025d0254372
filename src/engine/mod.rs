//! The crawl engine: dispatch loop, congestion control, retries, buffered
//! writes and checkpointing.

pub mod buffer;
pub mod checkpoint;
pub mod congestion;
pub mod item;
pub mod retry;
pub mod scheduler;

pub use buffer::{BufferedRecord, DataSink};
pub use checkpoint::CheckpointStore;
pub use item::{ItemId, Keyword, Query, QueryMode, WorkItem};
pub use scheduler::{Scheduler, Summary};
