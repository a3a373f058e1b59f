//! # Treegrok Indexer
//!
//! Incremental synchronization of a source tree with its search index.
//!
//! ## Pipeline
//!
//! ```text
//! IndexRunner
//!     │
//!     ├──> ExecutionFabric (fixed / work-stealing / scheduled / ctags pools)
//!     │
//!     ├──> IndexReconciler, one per project
//!     │      ├─> index side: SegmentStore uids, ascending
//!     │      ├─> disk side:  FileScanner, same order
//!     │      └─> MergeDiff:  remove / keep / add (analysis fans out)
//!     │
//!     └──> PendingFileCompleter
//!            ├─> deletions (all attempted)
//!            └─> renamings (only after clean deletions)
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use treegrok_indexer::{IndexRunner, IndexerConfig};
//!
//! fn main() -> treegrok_indexer::Result<()> {
//!     let config = IndexerConfig::new("/srv/src", "/srv/data");
//!     let report = IndexRunner::new(config)?.run()?;
//!
//!     for project in &report.projects {
//!         println!("{}: {:?}", project.name, project.stats);
//!     }
//!     Ok(())
//! }
//! ```

mod analysis;
mod cancel;
mod config;
mod ctags;
mod dirty;
mod error;
mod fabric;
mod filter;
mod listener;
mod merge;
mod pending;
mod pool;
mod progress;
mod reconciler;
mod runner;
mod scanner;
mod stats;
mod store;
mod uid;

pub use analysis::{
    is_binary, AnalysisOutput, Analyzer, AnalyzerGuru, BinaryAnalyzer, PlainTextAnalyzer,
    DEFS_FIELD, FULL_FIELD, PATH_FIELD,
};
pub use cancel::CancellationToken;
pub use config::{IndexerConfig, ProjectConfig};
pub use ctags::{CtagsFactory, CtagsWorker, Definition};
pub use dirty::DirtyMarker;
pub use error::{CompletionStage, IndexerError, Result};
pub use fabric::ExecutionFabric;
pub use filter::{IgnoreFilter, DEFAULT_IGNORED_NAMES};
pub use listener::{IndexChangeListener, LoggingListener};
pub use merge::{MergeDiff, MergeStep};
pub use pending::{
    pending_path, PendingFileCompleter, PendingFileDeletion, PendingFileRenaming, PENDING_SUFFIX,
};
pub use pool::{BoundedPool, PoolFactory, Pooled};
pub use progress::Progress;
pub use reconciler::IndexReconciler;
pub use runner::{
    IndexRunner, ProjectOutcome, RunReport, FREQUENT_TOKEN_DOCS, FREQUENT_TOKEN_MIN_LEN,
};
pub use scanner::{DiskEntry, FileScanner};
pub use stats::ProjectStats;
pub use store::{force_unlock, lock_holder_alive, Document, IndexStore, SegmentStore, UidIter};
pub use uid::UidKey;
