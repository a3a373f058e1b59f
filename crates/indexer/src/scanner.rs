use crate::cancel::CancellationToken;
use crate::filter::IgnoreFilter;
use crate::uid::UidKey;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// One accepted file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskEntry {
    pub uid: UidKey,
    /// Source-relative, `/`-separated, leading `/`.
    pub relative: String,
    pub absolute: PathBuf,
}

/// Disk side of the merge-diff: accepted files under `walk_root` in
/// ascending [`UidKey`] order.
///
/// Skips ignored names, symlinks, non-regular files, non-UTF-8 names and
/// the excluded directory. Unreadable files are still yielded; the caller
/// decides what to do with them. A directory that cannot be listed is
/// logged and its subtree is left out. Once the token is
/// cancelled, the next directory entered ends the scan.
pub struct FileScanner<'a> {
    walker: walkdir::IntoIter,
    source_root: PathBuf,
    filter: &'a IgnoreFilter,
    excluded: Option<PathBuf>,
    cancel: CancellationToken,
    cancelled: bool,
    skipped: usize,
}

impl<'a> FileScanner<'a> {
    /// `walk_root` must be `source_root` or below it; both canonical.
    pub fn new(
        source_root: &Path,
        walk_root: &Path,
        filter: &'a IgnoreFilter,
        cancel: CancellationToken,
    ) -> Self {
        let walker = WalkDir::new(walk_root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();
        Self {
            walker,
            source_root: source_root.to_path_buf(),
            filter,
            excluded: None,
            cancel,
            cancelled: false,
            skipped: 0,
        }
    }

    /// Leave out `dir` and everything below it.
    #[must_use]
    pub fn exclude(mut self, dir: Option<PathBuf>) -> Self {
        self.excluded = dir;
        self
    }

    #[must_use]
    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Entries left out for reasons other than ignore patterns.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn relative_path(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.source_root).ok()?;
        let mut out = String::new();
        for component in rel.components() {
            match component {
                Component::Normal(name) => {
                    out.push('/');
                    out.push_str(name.to_str()?);
                }
                _ => return None,
            }
        }
        Some(out)
    }
}

impl Iterator for FileScanner<'_> {
    type Item = DiskEntry;

    fn next(&mut self) -> Option<DiskEntry> {
        if self.cancelled {
            return None;
        }
        loop {
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    let at = e.path().map(|p| p.display().to_string()).unwrap_or_default();
                    log::warn!("Skipping unreadable path {at}: {e}");
                    self.skipped += 1;
                    continue;
                }
            };
            let path = entry.path();
            let file_type = entry.file_type();

            if entry.path_is_symlink() {
                log::debug!("Skipping symlink {}", path.display());
                self.skipped += 1;
                continue;
            }

            if file_type.is_dir() {
                if self.cancel.is_cancelled() {
                    log::info!("Traversal cancelled at {}", path.display());
                    self.cancelled = true;
                    return None;
                }
                if entry.depth() == 0 {
                    continue;
                }
                let excluded = self.excluded.as_deref().is_some_and(|dir| path == dir);
                if excluded || self.filter.is_ignored(path, true) {
                    self.walker.skip_current_dir();
                }
                continue;
            }

            if !file_type.is_file() || self.filter.is_ignored(path, false) {
                continue;
            }

            let Some(relative) = self.relative_path(path) else {
                log::warn!("Skipping file with non UTF-8 name: {}", path.display());
                self.skipped += 1;
                continue;
            };

            let modified = match entry
                .metadata()
                .map_err(std::io::Error::from)
                .and_then(|m| m.modified())
            {
                Ok(modified) => modified,
                Err(e) => {
                    log::warn!("Skipping {relative}: {e}");
                    self.skipped += 1;
                    continue;
                }
            };

            return Some(DiskEntry {
                uid: UidKey::from_modified(&relative, modified),
                absolute: path.to_path_buf(),
                relative,
            });
        }
    }
}
