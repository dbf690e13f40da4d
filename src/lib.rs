pub mod config;
pub mod dataset;
pub mod error;
pub mod load;
pub mod logger;
pub mod pipeline;
pub mod qc;
pub mod retrieve;
pub mod storage;
pub mod transform;
pub mod units;

// Re-export public API
pub use config::PipelineConfig;
pub use dataset::{Dataset, QcFlags, Variable};
pub use error::{PipelineError, Result};
pub use logger::SimpleLogger;
pub use pipeline::{CancellationToken, Pipeline, PipelineHooks, RunReport, Stage, run_many};
pub use storage::{FileSystemStorage, Provenance, RecordMetadata, StorageRecord, VersionPolicy};
