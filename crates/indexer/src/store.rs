//! Segment-file document store.
//!
//! ```text
//! <index dir>/
//!   segments.json     manifest: generation + live segment files, in order
//!   seg-<gen>.json    documents added and uids deleted by one commit
//!   write.lock        PID of the writer holding the directory
//!   dirty             see DirtyMarker
//! ```
//!
//! Every JSON file is written to `<name>.tmp` and renamed into place, so a
//! crash leaves either the previous manifest or the new one. Readers see an
//! immutable snapshot of the last commit; writes stay invisible until
//! [`IndexStore::commit`].

use crate::uid::UidKey;
use crate::{IndexerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const MANIFEST_FILE_NAME: &str = "segments.json";
const LOCK_FILE_NAME: &str = "write.lock";
const SPELLING_FILE_NAME: &str = "spelling.json";

/// One indexed file. Field content is whatever the analyzer produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub uid: UidKey,
    pub path: String,
    pub analyzer: String,
    /// Version of `analyzer` that produced the fields; 0 when unknown.
    #[serde(default)]
    pub analyzer_version: u32,
    #[serde(default)]
    pub fields: BTreeMap<String, Vec<String>>,
}

/// Storage engine used by the reconciler.
pub trait IndexStore: Send {
    /// Committed uids `>= start`, ascending.
    fn uids_from(&self, start: &str) -> UidIter;

    fn add_document(&mut self, doc: Document) -> Result<()>;

    fn delete_document(&mut self, uid: &UidKey) -> Result<()>;

    /// Make pending adds and deletes durable and visible.
    fn commit(&mut self) -> Result<()>;

    /// Compact storage; commits first.
    fn optimize(&mut self) -> Result<()>;

    /// Write the sorted distinct terms of `field` under `dest`. Returns the
    /// number of terms.
    fn build_spelling_index(&self, field: &str, dest: &Path) -> Result<usize>;

    /// Committed documents.
    fn num_docs(&self) -> usize;

    fn segment_count(&self) -> usize;
}

/// Owned cursor over a commit snapshot.
#[derive(Debug, Clone)]
pub struct UidIter {
    keys: Arc<Vec<UidKey>>,
    pos: usize,
}

impl UidIter {
    fn new(keys: Arc<Vec<UidKey>>, start: &str) -> Self {
        let pos = keys.partition_point(|k| k.as_str() < start);
        Self { keys, pos }
    }
}

impl Iterator for UidIter {
    type Item = UidKey;

    fn next(&mut self) -> Option<UidKey> {
        let key = self.keys.get(self.pos)?.clone();
        self.pos += 1;
        Some(key)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.keys.len().saturating_sub(self.pos);
        (left, Some(left))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    generation: u64,
    segments: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Segment {
    generation: u64,
    #[serde(default)]
    added: Vec<Document>,
    #[serde(default)]
    deleted: Vec<UidKey>,
}

pub struct SegmentStore {
    dir: PathBuf,
    manifest: Manifest,
    committed: BTreeMap<UidKey, Document>,
    snapshot: Arc<Vec<UidKey>>,
    pending_adds: Vec<Document>,
    pending_deletes: BTreeSet<UidKey>,
    _lock: Option<WriteLock>,
}

impl SegmentStore {
    /// Open (creating if needed) the store in `dir`. With `locking`, fails
    /// with [`IndexerError::LockHeld`] while another writer holds it.
    pub fn open(dir: &Path, locking: bool) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let lock = if locking {
            Some(WriteLock::acquire(dir)?)
        } else {
            None
        };

        let manifest_path = dir.join(MANIFEST_FILE_NAME);
        let manifest: Manifest = if manifest_path.exists() {
            serde_json::from_slice(&std::fs::read(&manifest_path)?)?
        } else {
            Manifest::default()
        };

        let mut committed = BTreeMap::new();
        for name in &manifest.segments {
            let segment: Segment = serde_json::from_slice(&std::fs::read(dir.join(name))?)?;
            apply_segment(&mut committed, segment);
        }
        log::debug!(
            "Opened store {} with {} documents in {} segments",
            dir.display(),
            committed.len(),
            manifest.segments.len()
        );

        let snapshot = Arc::new(committed.keys().cloned().collect());
        Ok(Self {
            dir: dir.to_path_buf(),
            manifest,
            committed,
            snapshot,
            pending_adds: Vec::new(),
            pending_deletes: BTreeSet::new(),
            _lock: lock,
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn document(&self, uid: &UidKey) -> Option<&Document> {
        self.committed.get(uid)
    }

    /// Source paths of committed documents, in key order.
    pub fn paths(&self) -> impl Iterator<Item = &str> + '_ {
        self.committed.values().map(|doc| doc.path.as_str())
    }

    /// Number of committed documents holding each distinct term of `field`.
    #[must_use]
    pub fn term_frequencies(&self, field: &str) -> BTreeMap<&str, usize> {
        let mut frequencies = BTreeMap::new();
        for terms in self.committed.values().filter_map(|doc| doc.fields.get(field)) {
            let distinct: BTreeSet<&str> = terms.iter().map(String::as_str).collect();
            for term in distinct {
                *frequencies.entry(term).or_insert(0) += 1;
            }
        }
        frequencies
    }

    #[must_use]
    pub fn has_pending_changes(&self) -> bool {
        !self.pending_adds.is_empty() || !self.pending_deletes.is_empty()
    }

    fn write_segment(&self, segment: &Segment) -> Result<String> {
        let name = format!("seg-{}.json", segment.generation);
        write_json_atomic(&self.dir.join(&name), segment, false)?;
        Ok(name)
    }

    fn write_manifest(&self) -> Result<()> {
        write_json_atomic(&self.dir.join(MANIFEST_FILE_NAME), &self.manifest, true)
    }

    fn refresh_snapshot(&mut self) {
        self.snapshot = Arc::new(self.committed.keys().cloned().collect());
    }
}

impl IndexStore for SegmentStore {
    fn uids_from(&self, start: &str) -> UidIter {
        UidIter::new(Arc::clone(&self.snapshot), start)
    }

    fn add_document(&mut self, doc: Document) -> Result<()> {
        self.pending_deletes.remove(&doc.uid);
        self.pending_adds.push(doc);
        Ok(())
    }

    fn delete_document(&mut self, uid: &UidKey) -> Result<()> {
        self.pending_adds.retain(|doc| &doc.uid != uid);
        self.pending_deletes.insert(uid.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if !self.has_pending_changes() {
            return Ok(());
        }

        let generation = self.manifest.generation + 1;
        let segment = Segment {
            generation,
            added: std::mem::take(&mut self.pending_adds),
            deleted: std::mem::take(&mut self.pending_deletes).into_iter().collect(),
        };
        let (added, deleted) = (segment.added.len(), segment.deleted.len());
        let name = self.write_segment(&segment)?;
        apply_segment(&mut self.committed, segment);

        self.manifest.generation = generation;
        self.manifest.segments.push(name);
        self.write_manifest()?;
        self.refresh_snapshot();

        log::debug!(
            "Committed generation {generation} in {}: +{added} -{deleted}",
            self.dir.display()
        );
        Ok(())
    }

    fn optimize(&mut self) -> Result<()> {
        self.commit()?;
        if self.manifest.segments.len() <= 1 {
            return Ok(());
        }

        let generation = self.manifest.generation + 1;
        let segment = Segment {
            generation,
            added: self.committed.values().cloned().collect(),
            deleted: Vec::new(),
        };
        let name = self.write_segment(&segment)?;

        let old = std::mem::replace(&mut self.manifest.segments, vec![name]);
        self.manifest.generation = generation;
        self.write_manifest()?;

        for stale in old {
            if let Err(e) = std::fs::remove_file(self.dir.join(&stale)) {
                log::warn!("Failed to remove merged segment {stale}: {e}");
            }
        }
        log::info!(
            "Optimized {} into one segment ({} documents)",
            self.dir.display(),
            self.committed.len()
        );
        Ok(())
    }

    fn build_spelling_index(&self, field: &str, dest: &Path) -> Result<usize> {
        let terms: BTreeSet<&str> = self
            .committed
            .values()
            .filter_map(|doc| doc.fields.get(field))
            .flatten()
            .map(String::as_str)
            .collect();
        std::fs::create_dir_all(dest)?;
        write_json_atomic(&dest.join(SPELLING_FILE_NAME), &terms, false)?;
        log::debug!("Spelling index for {field}: {} terms", terms.len());
        Ok(terms.len())
    }

    fn num_docs(&self) -> usize {
        self.committed.len()
    }

    fn segment_count(&self) -> usize {
        self.manifest.segments.len()
    }
}

fn apply_segment(committed: &mut BTreeMap<UidKey, Document>, segment: Segment) {
    for uid in &segment.deleted {
        committed.remove(uid);
    }
    for doc in segment.added {
        committed.insert(doc.uid.clone(), doc);
    }
}

fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T, pretty: bool) -> Result<()> {
    let bytes = if pretty {
        serde_json::to_vec_pretty(value)?
    } else {
        serde_json::to_vec(value)?
    };
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

static LOCK_ATTEMPTS: AtomicU64 = AtomicU64::new(0);

/// Exclusive writer lock; the file holds the owner's PID and disappears on
/// drop.
#[derive(Debug)]
struct WriteLock {
    path: PathBuf,
}

impl WriteLock {
    /// The PID goes into a private file that is then hard-linked into place,
    /// so `write.lock` never exists without its content.
    fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE_NAME);
        let pid = std::process::id();
        let attempt = LOCK_ATTEMPTS.fetch_add(1, Ordering::Relaxed);
        let staged = dir.join(format!("{LOCK_FILE_NAME}.{pid}.{attempt}"));

        let linked = std::fs::write(&staged, pid.to_string())
            .and_then(|()| std::fs::hard_link(&staged, &path));
        if let Err(e) = std::fs::remove_file(&staged) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to remove {}: {e}", staged.display());
            }
        }

        match linked {
            Ok(()) => Ok(Self { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(IndexerError::LockHeld { path })
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::warn!("Failed to release {}: {e}", self.path.display());
        }
    }
}

/// Whether the process recorded in `dir`'s lock file may still be running.
/// Unreadable or malformed lock files count as abandoned.
#[must_use]
pub fn lock_holder_alive(dir: &Path) -> bool {
    let Ok(raw) = std::fs::read_to_string(dir.join(LOCK_FILE_NAME)) else {
        return false;
    };
    let Ok(pid) = raw.trim().parse::<u32>() else {
        return false;
    };
    if pid == std::process::id() {
        return true;
    }
    process_alive(pid)
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

// Without a cheap liveness check, never steal a lock.
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Remove `dir`'s lock file regardless of its owner.
pub fn force_unlock(dir: &Path) -> Result<()> {
    match std::fs::remove_file(dir.join(LOCK_FILE_NAME)) {
        Ok(()) => {
            log::warn!("Removed stale write lock in {}", dir.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
