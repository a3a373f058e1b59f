use crate::analysis::AnalyzerGuru;
use crate::cancel::CancellationToken;
use crate::config::{IndexerConfig, ProjectConfig};
use crate::dirty::DirtyMarker;
use crate::fabric::ExecutionFabric;
use crate::filter::IgnoreFilter;
use crate::listener::IndexChangeListener;
use crate::merge::{MergeDiff, MergeStep};
use crate::pending::{PendingFileCompleter, PendingFileDeletion, PendingFileRenaming};
use crate::progress::Progress;
use crate::scanner::{DiskEntry, FileScanner};
use crate::stats::ProjectStats;
use crate::store::{force_unlock, lock_holder_alive, Document, IndexStore, SegmentStore};
use crate::uid::UidKey;
use crate::{IndexerError, Result};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// New or changed files analyzed together on the work-stealing pool.
const ADD_BATCH: usize = 256;

/// One reconciliation pass over one project (or the whole source root).
///
/// The decision loop runs on the calling thread in ascending [`UidKey`]
/// order; only the analysis of new files fans out. The store is owned by
/// the pass and committed once at the end.
pub struct IndexReconciler<'a> {
    config: Arc<IndexerConfig>,
    project: Option<ProjectConfig>,
    fabric: &'a ExecutionFabric,
    completer: &'a PendingFileCompleter,
    listeners: Vec<Arc<dyn IndexChangeListener>>,
    analyzers: AnalyzerGuru,
    filter: IgnoreFilter,
    cancel: CancellationToken,
    directories: Vec<String>,
}

struct PassState {
    store: SegmentStore,
    dirty: DirtyMarker,
    stats: ProjectStats,
    batch: Vec<QueuedAdd>,
}

/// A file to analyze, and the entry it takes over once analysis succeeds.
struct QueuedAdd {
    entry: DiskEntry,
    replaces: Replaces,
}

enum Replaces {
    Nothing,
    /// Same path, older or newer timestamp.
    Stale(UidKey),
    /// Same key, outputs out of date.
    Itself,
}

impl<'a> IndexReconciler<'a> {
    pub fn new(
        config: Arc<IndexerConfig>,
        project: Option<ProjectConfig>,
        fabric: &'a ExecutionFabric,
        completer: &'a PendingFileCompleter,
    ) -> Result<Self> {
        let filter = config.ignore_filter()?;
        Ok(Self {
            config,
            project,
            fabric,
            completer,
            listeners: Vec::new(),
            analyzers: AnalyzerGuru::new(),
            filter,
            cancel: CancellationToken::new(),
            directories: Vec::new(),
        })
    }

    #[must_use]
    pub fn with_listeners(mut self, listeners: Vec<Arc<dyn IndexChangeListener>>) -> Self {
        self.listeners = listeners;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Limit the pass to these source-relative directories instead of the
    /// whole project. Nested directories collapse into their ancestor.
    #[must_use]
    pub fn with_directories(mut self, directories: Vec<String>) -> Self {
        self.directories = normalize_directories(directories);
        self
    }

    /// Source-relative directory of the project; empty for the whole
    /// source root.
    fn prefix_dir(&self) -> &str {
        self.project.as_ref().map_or("", |p| p.path.trim_end_matches('/'))
    }

    fn scope(&self) -> Vec<&str> {
        if self.directories.is_empty() {
            vec![self.prefix_dir()]
        } else {
            self.directories.iter().map(String::as_str).collect()
        }
    }

    fn label(&self) -> &str {
        self.project.as_ref().map_or("/", |p| p.name.as_str())
    }

    pub fn run(&self) -> Result<ProjectStats> {
        let start = Instant::now();
        let source_root = self.config.source_root.canonicalize()?;
        let scope = self.scope();
        let mut walk_roots = Vec::with_capacity(scope.len());
        for dir in &scope {
            walk_roots.push(checked_walk_root(&source_root, dir)?);
        }
        let excluded = self
            .config
            .data_root
            .canonicalize()
            .ok()
            .filter(|data| data.starts_with(&source_root));

        let index_dir = self.config.index_dir(self.project.as_ref());
        let mut pass = PassState {
            store: self.open_store(&index_dir)?,
            dirty: DirtyMarker::load(&index_dir),
            stats: ProjectStats::default(),
            batch: Vec::new(),
        };
        log::info!(
            "Reconciling {} ({} documents indexed{})",
            self.label(),
            pass.store.num_docs(),
            if pass.dirty.is_dirty() { ", dirty" } else { "" }
        );

        let mut cancelled = false;
        for (dir, walk_root) in scope.iter().zip(&walk_roots) {
            cancelled = self.reconcile_dir(&mut pass, &source_root, walk_root, dir, excluded.clone())?;
            if cancelled {
                break;
            }
        }
        self.flush_adds(&mut pass)?;
        pass.store.commit()?;

        if !cancelled && pass.dirty.is_dirty() {
            self.post_process(&mut pass);
        }

        let PassState {
            store,
            dirty,
            mut stats,
            ..
        } = pass;
        stats.documents = store.num_docs();
        stats.dirty = dirty.is_dirty();
        stats.cancelled = cancelled;
        stats.time_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        log::info!(
            "Reconciled {}: +{} -{} ={} ~{} ({} failed) in {} ms",
            self.label(),
            stats.added,
            stats.removed,
            stats.unchanged,
            stats.refreshed,
            stats.failed,
            stats.time_ms
        );
        Ok(stats)
    }

    /// Merge one directory's slice of the index with the disk. Returns
    /// whether the walk was cancelled.
    fn reconcile_dir(
        &self,
        pass: &mut PassState,
        source_root: &Path,
        walk_root: &Path,
        dir: &str,
        excluded: Option<PathBuf>,
    ) -> Result<bool> {
        let prefix = UidKey::prefix(dir);
        let index_side = pass
            .store
            .uids_from(&prefix)
            .take_while(|uid| uid.has_prefix(&prefix));
        let disk_side = FileScanner::new(source_root, walk_root, &self.filter, self.cancel.clone())
            .exclude(excluded);

        let mut diff = MergeDiff::new(index_side, disk_side);
        for step in diff.by_ref() {
            match step {
                MergeStep::Remove(uid) => self.remove(pass, &uid)?,
                MergeStep::Keep(entry) => {
                    if self.outputs_current(pass, &entry) {
                        pass.stats.unchanged += 1;
                    } else {
                        self.queue(pass, entry, Replaces::Itself)?;
                    }
                }
                MergeStep::Replace { stale, entry } => {
                    self.queue(pass, entry, Replaces::Stale(stale))?;
                }
                MergeStep::Add(entry) => self.queue(pass, entry, Replaces::Nothing)?,
            }
        }

        if self.cancel.is_cancelled() {
            log::info!("Pass over {} cancelled; skipping stale-entry cleanup", self.label());
            return Ok(true);
        }
        for uid in diff.into_tail() {
            self.remove(pass, &uid)?;
        }
        Ok(false)
    }

    fn queue(&self, pass: &mut PassState, entry: DiskEntry, replaces: Replaces) -> Result<()> {
        pass.batch.push(QueuedAdd { entry, replaces });
        if pass.batch.len() >= ADD_BATCH {
            self.flush_adds(pass)?;
        }
        Ok(())
    }

    /// Whether an unchanged file's document and xref still match what this
    /// configuration would produce. A stray xref is queued for deletion when
    /// xrefs are off.
    fn outputs_current(&self, pass: &PassState, entry: &DiskEntry) -> bool {
        let Some(doc) = pass.store.document(&entry.uid) else {
            return false;
        };
        let Some(analyzer) = self.analyzers.by_name(&doc.analyzer) else {
            log::debug!("Reindexing {}: analyzer {} is gone", entry.relative, doc.analyzer);
            return false;
        };
        if doc.analyzer_version != analyzer.version() {
            log::debug!(
                "Reindexing {}: {} analyzer version {} -> {}",
                entry.relative,
                doc.analyzer,
                doc.analyzer_version,
                analyzer.version()
            );
            return false;
        }

        let xref = self.config.xref_path(&entry.relative);
        if self.config.generate_xref {
            if analyzer.writes_xref() && !xref.is_file() {
                log::debug!("Reindexing {}: xref missing", entry.relative);
                return false;
            }
        } else if xref.exists() {
            self.completer.add_deletion(PendingFileDeletion::new(xref));
        }
        true
    }

    /// Open the store, recovering once from a lock left by a dead process.
    fn open_store(&self, index_dir: &Path) -> Result<SegmentStore> {
        match SegmentStore::open(index_dir, self.config.locking) {
            Err(e) if e.is_lock_held() && !lock_holder_alive(index_dir) => {
                log::warn!("{e}; holder is gone, unlocking");
                force_unlock(index_dir)?;
                SegmentStore::open(index_dir, self.config.locking)
            }
            other => other,
        }
    }

    fn remove(&self, pass: &mut PassState, uid: &UidKey) -> Result<()> {
        let path = uid.path();
        for listener in &self.listeners {
            listener.file_remove(&path);
        }
        pass.store.delete_document(uid)?;
        self.completer
            .add_deletion(PendingFileDeletion::new(self.config.xref_path(&path)));
        pass.dirty.mark()?;
        pass.stats.removed += 1;
        for listener in &self.listeners {
            listener.file_removed(&path);
        }
        Ok(())
    }

    fn flush_adds(&self, pass: &mut PassState) -> Result<()> {
        if pass.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut pass.batch);
        let progress = Progress::start(
            format!("files analyzed in {}", self.label()),
            batch.len(),
            Some(self.fabric.scheduled()),
            self.config.progress_interval(),
        );

        let analyzed: Vec<(QueuedAdd, Result<Document>)> = self.fabric.work_stealing().install(|| {
            batch
                .into_par_iter()
                .map(|queued| {
                    let outcome = self.analyze(&queued.entry);
                    progress.increment();
                    (queued, outcome)
                })
                .collect()
        });
        drop(progress);

        for (QueuedAdd { entry, replaces }, outcome) in analyzed {
            let doc = match outcome {
                Ok(doc) => doc,
                Err(e) => {
                    match replaces {
                        Replaces::Nothing => log::warn!("Skipping {}: {e}", entry.relative),
                        Replaces::Stale(_) | Replaces::Itself => {
                            log::warn!("Keeping previous entry of {}: {e}", entry.relative);
                        }
                    }
                    pass.stats.failed += 1;
                    continue;
                }
            };
            match replaces {
                Replaces::Nothing => pass.stats.added += 1,
                Replaces::Stale(stale) => {
                    self.remove(pass, &stale)?;
                    pass.stats.added += 1;
                }
                Replaces::Itself => pass.stats.refreshed += 1,
            }
            let analyzer = doc.analyzer.clone();
            pass.store.add_document(doc)?;
            pass.dirty.mark()?;
            for listener in &self.listeners {
                listener.file_added(&entry.relative, &analyzer);
            }
        }
        Ok(())
    }

    /// Fails on unreadable files before any listener hears of them.
    fn analyze(&self, entry: &DiskEntry) -> Result<Document> {
        let content = std::fs::read(&entry.absolute)?;
        let analyzer = self.analyzers.select(&content);
        for listener in &self.listeners {
            listener.file_add(&entry.relative, analyzer.name());
        }

        let definitions = if analyzer.wants_definitions() && self.config.ctags.is_some() {
            let mut worker = self.fabric.ctags().acquire()?;
            worker.definitions(&entry.absolute).unwrap_or_else(|e| {
                log::warn!("No definitions for {}: {e}", entry.relative);
                Vec::new()
            })
        } else {
            Vec::new()
        };

        let output = analyzer.analyze(
            &entry.relative,
            &content,
            &definitions,
            self.config.generate_xref,
        );
        if let Some(xref) = output.xref {
            self.write_provisional_xref(&entry.relative, &xref)?;
        }

        log::trace!("Analyzed {} with {}", entry.relative, analyzer.name());
        Ok(Document {
            uid: entry.uid.clone(),
            path: entry.relative.clone(),
            analyzer: analyzer.name().to_string(),
            analyzer_version: analyzer.version(),
            fields: output.fields,
        })
    }

    /// Stage the xref outside the live xref tree; the completer moves it
    /// into place, creating directories as needed.
    fn write_provisional_xref(&self, relative: &str, xref: &str) -> Result<()> {
        let staged = self.config.staging_path(relative);
        if let Some(parent) = staged.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&staged, xref)?;
        self.completer
            .add_renaming(PendingFileRenaming::new(staged, self.config.xref_path(relative)));
        Ok(())
    }

    /// Optimize (when enabled) and rebuild the spelling index. Failures are
    /// logged; the dirty marker stays set so the next run retries.
    fn post_process(&self, pass: &mut PassState) {
        if self.config.optimize {
            let started = Instant::now();
            match pass.store.optimize() {
                Ok(()) => match pass.dirty.clear() {
                    Ok(()) => {
                        pass.stats.optimized = true;
                        log::info!("Optimized {} in {:?}", self.label(), started.elapsed());
                    }
                    Err(e) => log::warn!("Failed to clear dirty marker of {}: {e}", self.label()),
                },
                Err(e) => log::warn!("Optimizing {} failed: {e}", self.label()),
            }
        }

        let dest = self.config.spelling_dir(self.project.as_ref());
        match pass
            .store
            .build_spelling_index(&self.config.spelling_field, &dest)
        {
            Ok(terms) => log::debug!("Spelling index of {} has {terms} terms", self.label()),
            Err(e) => log::warn!("Building spelling index of {} failed: {e}", self.label()),
        }
    }
}

/// Resolve `dir` below the canonical `source_root`, refusing paths that
/// are missing or resolve elsewhere.
fn checked_walk_root(source_root: &Path, dir: &str) -> Result<PathBuf> {
    let walk_root = source_root.join(dir.trim_start_matches('/'));
    if !walk_root.is_dir() {
        return Err(IndexerError::InvalidPath(format!(
            "Project directory does not exist: {}",
            walk_root.display()
        )));
    }
    if walk_root.canonicalize()? != walk_root {
        return Err(IndexerError::InvalidPath(format!(
            "Project directory resolves elsewhere (symlink?): {}",
            walk_root.display()
        )));
    }
    Ok(walk_root)
}

/// Sorted, `/`-prefixed, without trailing `/` and without directories
/// nested in another entry.
fn normalize_directories(directories: Vec<String>) -> Vec<String> {
    let mut dirs: Vec<String> = directories
        .into_iter()
        .map(|dir| {
            let trimmed = dir.trim_matches('/');
            if trimmed.is_empty() {
                String::new()
            } else {
                format!("/{trimmed}")
            }
        })
        .collect();
    dirs.sort();
    dirs.dedup();

    let mut kept: Vec<String> = Vec::with_capacity(dirs.len());
    for dir in dirs {
        let nested = kept.iter().any(|outer| {
            outer.is_empty()
                || dir
                    .strip_prefix(outer.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        });
        if !nested {
            kept.push(dir);
        }
    }
    kept
}
