use crate::Result;
use std::path::{Path, PathBuf};

const DIRTY_FILE_NAME: &str = "dirty";

/// Persisted "post-processing still owed" flag of one store directory.
///
/// Set on the first add or removal of a pass, cleared only after a
/// successful optimize. A marker left behind by an interrupted run makes the
/// next run finish the job even when it finds nothing to change.
#[derive(Debug)]
pub struct DirtyMarker {
    path: PathBuf,
    dirty: bool,
}

impl DirtyMarker {
    pub fn load(index_dir: &Path) -> Self {
        let path = index_dir.join(DIRTY_FILE_NAME);
        let dirty = path.exists();
        Self { path, dirty }
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Idempotent; only the first call of a pass touches the disk.
    pub fn mark(&mut self) -> Result<()> {
        if self.dirty {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, b"")?;
        self.dirty = true;
        log::trace!("Marked {} dirty", self.path.display());
        Ok(())
    }

    pub fn clear(&mut self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.dirty = false;
        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
