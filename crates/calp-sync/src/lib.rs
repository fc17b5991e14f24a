//! Pipeline orchestration: configuration, the extraction run, store → search
//! index replication, run serialization and cron scheduling.

pub mod config;
pub mod extraction;
pub mod replication;
pub mod runner;
pub mod schedule;
pub mod search;

pub use calp_core::{ExtractionOutcome, SyncOutcome};
pub use config::{ConfigError, ElasticsearchSettings, PipelineConfig, DEFAULT_SEARCH_URL};
pub use extraction::{
    ChromeLauncher, ExtractionPipeline, ExtractionSettings, SearchFilter, SessionLauncher,
};
pub use replication::{index_action, SyncCoordinator, SyncSettings};
pub use runner::PipelineRunner;
pub use schedule::maybe_build_scheduler;
pub use search::{
    BulkAction, BulkReport, ElasticsearchIndex, IndexCreation, IndexError, MemorySearchIndex,
    SearchIndex,
};

pub const CRATE_NAME: &str = "calp-sync";
