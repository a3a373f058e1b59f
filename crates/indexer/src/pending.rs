//! Deferred filesystem mutations for one synchronization run.
//!
//! Analysis writes provisional artifacts to a staging location ending in
//! [`PENDING_SUFFIX`] and stale artifacts are only scheduled for deletion. Nothing becomes visible
//! until [`PendingFileCompleter::complete`] runs, once, after every project
//! pass finished:
//!
//! 1. deletions, all attempted in parallel, failures collected; emptied
//!    directories are pruned afterwards;
//! 2. renamings, only when step 1 reported no failure. A renaming creates
//!    the target's parent first, so it may land where step 1 just removed a
//!    file of the same name.

use crate::error::CompletionStage;
use crate::{IndexerError, Result};
use dashmap::DashSet;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Appended to a final path to get its provisional location.
pub const PENDING_SUFFIX: &str = ".treegrok-pending";

/// Provisional location of `path`.
#[must_use]
pub fn pending_path(path: &Path) -> PathBuf {
    let mut raw = OsString::from(path.as_os_str());
    raw.push(PENDING_SUFFIX);
    PathBuf::from(raw)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingFileDeletion {
    pub absolute_path: PathBuf,
}

impl PendingFileDeletion {
    pub fn new(absolute_path: impl Into<PathBuf>) -> Self {
        Self {
            absolute_path: absolute_path.into(),
        }
    }
}

/// Identity is the target path: at most one renaming per target.
#[derive(Debug, Clone)]
pub struct PendingFileRenaming {
    pub transient_path: PathBuf,
    pub absolute_path: PathBuf,
}

impl PendingFileRenaming {
    pub fn new(transient_path: impl Into<PathBuf>, absolute_path: impl Into<PathBuf>) -> Self {
        Self {
            transient_path: transient_path.into(),
            absolute_path: absolute_path.into(),
        }
    }
}

impl PartialEq for PendingFileRenaming {
    fn eq(&self, other: &Self) -> bool {
        self.absolute_path == other.absolute_path
    }
}

impl Eq for PendingFileRenaming {}

impl Hash for PendingFileRenaming {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.absolute_path.hash(state);
    }
}

#[derive(Debug, Default)]
pub struct PendingFileCompleter {
    deletions: DashSet<PendingFileDeletion>,
    renamings: DashSet<PendingFileRenaming>,
    /// Serializes the cross-set checks of `add_deletion` and `add_renaming`.
    intake: Mutex<()>,
    /// Emptied directories are pruned up to, not including, this one.
    prune_root: Option<PathBuf>,
    completing: AtomicBool,
}

impl PendingFileCompleter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Also remove emptied ancestors of deleted files, stopping below `root`.
    #[must_use]
    pub fn with_prune_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.prune_root = Some(root.into());
        self
    }

    /// Returns `false` when the same deletion was already queued or a
    /// renaming onto the same path supersedes it.
    pub fn add_deletion(&self, deletion: PendingFileDeletion) -> bool {
        debug_assert!(!self.completing.load(Ordering::SeqCst), "complete() is running");
        let superseding = PendingFileRenaming::new(PathBuf::new(), deletion.absolute_path.clone());
        let _intake = self.intake.lock();
        if self.renamings.contains(&superseding) {
            return false;
        }
        self.deletions.insert(deletion)
    }

    /// Queue a renaming, replacing any earlier one for the same target and
    /// cancelling a queued deletion of the target.
    pub fn add_renaming(&self, renaming: PendingFileRenaming) -> bool {
        debug_assert!(!self.completing.load(Ordering::SeqCst), "complete() is running");
        let target = PendingFileDeletion::new(renaming.absolute_path.clone());
        let _intake = self.intake.lock();
        let replaced = self.renamings.remove(&renaming).is_some();
        self.renamings.insert(renaming);
        self.deletions.remove(&target);
        !replaced
    }

    #[must_use]
    pub fn deletion_count(&self) -> usize {
        self.deletions.len()
    }

    #[must_use]
    pub fn renaming_count(&self) -> usize {
        self.renamings.len()
    }

    /// Execute every queued intent. Returns the number of successful
    /// operations; a stage with failures ends the call with
    /// [`IndexerError::Completion`] and later stages are not attempted.
    ///
    /// Runs on the caller's rayon pool; use `ThreadPool::install` to pick
    /// one.
    pub fn complete(&self) -> Result<usize> {
        self.completing.store(true, Ordering::SeqCst);
        let outcome = self.complete_inner();
        self.completing.store(false, Ordering::SeqCst);
        outcome
    }

    fn complete_inner(&self) -> Result<usize> {
        let start = Instant::now();
        let deleted = self.complete_deletions()?;
        log::debug!("Deleted {deleted} pending file(s) in {:?}", start.elapsed());

        let start = Instant::now();
        let renamed = self.complete_renamings()?;
        log::debug!("Renamed {renamed} pending file(s) in {:?}", start.elapsed());

        Ok(deleted + renamed)
    }

    fn complete_deletions(&self) -> Result<usize> {
        let pending: Vec<PendingFileDeletion> =
            self.deletions.iter().map(|entry| entry.key().clone()).collect();
        self.deletions.clear();
        if pending.is_empty() {
            return Ok(0);
        }

        let outcomes: Vec<(&PendingFileDeletion, io::Result<()>)> = pending
            .par_iter()
            .map(|deletion| (deletion, delete_with_provisional(&deletion.absolute_path)))
            .collect();

        let mut failures = Vec::new();
        let mut parents = BTreeSet::new();
        for (deletion, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    if let Some(parent) = deletion.absolute_path.parent() {
                        parents.insert(parent.to_path_buf());
                    }
                }
                Err(e) => {
                    log::warn!(
                        "Failed to delete obsolete file {}: {e}",
                        deletion.absolute_path.display()
                    );
                    failures.push(e);
                }
            }
        }
        self.prune_empty_dirs(parents);

        stage_outcome(CompletionStage::Deleting, pending.len(), failures)
    }

    fn complete_renamings(&self) -> Result<usize> {
        let pending: Vec<PendingFileRenaming> =
            self.renamings.iter().map(|entry| entry.key().clone()).collect();
        self.renamings.clear();
        if pending.is_empty() {
            return Ok(0);
        }

        let failures: Vec<io::Error> = pending
            .par_iter()
            .filter_map(|renaming| {
                match move_into_place(&renaming.transient_path, &renaming.absolute_path) {
                    Ok(()) => {
                        log::trace!("Moved pending file to {}", renaming.absolute_path.display());
                        None
                    }
                    Err(e) => {
                        log::warn!(
                            "Failed to move file {} -> {}: {e}",
                            renaming.transient_path.display(),
                            renaming.absolute_path.display()
                        );
                        Some(e)
                    }
                }
            })
            .collect();

        stage_outcome(CompletionStage::Renaming, pending.len(), failures)
    }

    /// Deepest first: prune each parent, then (with a prune root) its
    /// emptied ancestors.
    fn prune_empty_dirs(&self, parents: BTreeSet<PathBuf>) {
        let mut parents: Vec<PathBuf> = parents.into_iter().collect();
        parents.sort_by(|a, b| {
            b.components()
                .count()
                .cmp(&a.components().count())
                .then_with(|| a.cmp(b))
        });
        for dir in parents {
            if self.prune_root.as_deref() == Some(dir.as_path()) || !prune_dir(&dir) {
                continue;
            }
            let Some(root) = &self.prune_root else {
                continue;
            };
            let mut ancestor = dir.parent();
            while let Some(current) = ancestor {
                if current == root.as_path() || !current.starts_with(root) || !prune_dir(current) {
                    break;
                }
                ancestor = current.parent();
            }
        }
    }
}

fn stage_outcome(stage: CompletionStage, total: usize, failures: Vec<io::Error>) -> Result<usize> {
    let count = failures.len();
    match failures.into_iter().next() {
        None => Ok(total),
        Some(source) => {
            let err = IndexerError::Completion {
                stage,
                failures: count,
                total,
                source,
            };
            log::error!("{err}");
            Err(err)
        }
    }
}

/// Remove `<path>PENDING_SUFFIX` and `path`. Already-missing files count as
/// deleted.
fn delete_with_provisional(path: &Path) -> io::Result<()> {
    remove_if_present(&pending_path(path))?;
    remove_if_present(path)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            log::trace!("Deleted obsolete file {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn move_into_place(transient: &Path, target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::rename(transient, target)
}

/// Remove `dir` when no file lives anywhere below it, file-less
/// subdirectories first.
fn prune_dir(dir: &Path) -> bool {
    let mut skeleton = Vec::new();
    if !collect_fileless(dir, &mut skeleton) {
        return false;
    }
    for child in skeleton {
        try_remove_dir(&child);
    }
    try_remove_dir(dir)
}

/// Collect the subdirectories of `dir` that hold no file at any depth,
/// deepest first. Returns whether `dir` itself holds no file.
fn collect_fileless(dir: &Path, out: &mut Vec<PathBuf>) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    let mut subdirs = Vec::new();
    for entry in entries {
        match entry.and_then(|e| Ok((e.path(), e.file_type()?))) {
            Ok((path, file_type)) if file_type.is_dir() => subdirs.push(path),
            _ => return false,
        }
    }
    let mut found = Vec::new();
    for subdir in subdirs {
        if !collect_fileless(&subdir, &mut found) {
            return false;
        }
        found.push(subdir);
    }
    out.append(&mut found);
    true
}

/// Fails harmlessly while the directory still has entries.
fn try_remove_dir(dir: &Path) -> bool {
    let removed = std::fs::remove_dir(dir).is_ok();
    if removed {
        log::debug!("Removed empty dir {}", dir.display());
    }
    removed
}
