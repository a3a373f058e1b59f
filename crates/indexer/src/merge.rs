use crate::scanner::DiskEntry;
use crate::uid::UidKey;
use std::iter::Peekable;

/// One decision of the sorted merge-diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeStep {
    /// Indexed, no longer on disk under this key.
    Remove(UidKey),
    /// Indexed and on disk with the same key.
    Keep(DiskEntry),
    /// Indexed under another timestamp of the same path.
    Replace { stale: UidKey, entry: DiskEntry },
    /// On disk, path not indexed.
    Add(DiskEntry),
}

/// Walks two ascending key streams in lockstep.
///
/// Yields decisions while disk entries remain. Index keys beyond the last
/// disk entry are left for [`MergeDiff::into_tail`], so a caller whose
/// traversal stopped early can decline to treat them as stale.
pub struct MergeDiff<I: Iterator<Item = UidKey>, D: Iterator<Item = DiskEntry>> {
    index: Peekable<I>,
    disk: Peekable<D>,
}

impl<I, D> MergeDiff<I, D>
where
    I: Iterator<Item = UidKey>,
    D: Iterator<Item = DiskEntry>,
{
    pub fn new(index: I, disk: D) -> Self {
        Self {
            index: index.peekable(),
            disk: disk.peekable(),
        }
    }

    /// Index keys never reached by the disk side.
    pub fn into_tail(self) -> Peekable<I> {
        self.index
    }
}

impl<I, D> Iterator for MergeDiff<I, D>
where
    I: Iterator<Item = UidKey>,
    D: Iterator<Item = DiskEntry>,
{
    type Item = MergeStep;

    fn next(&mut self) -> Option<MergeStep> {
        let disk_uid = &self.disk.peek()?.uid;
        if let Some(stale) = self
            .index
            .next_if(|uid| uid < disk_uid && !uid.same_path(disk_uid))
        {
            return Some(MergeStep::Remove(stale));
        }
        let entry = self.disk.next()?;
        match self.index.next_if(|uid| uid.same_path(&entry.uid)) {
            Some(uid) if uid == entry.uid => Some(MergeStep::Keep(entry)),
            Some(stale) => Some(MergeStep::Replace { stale, entry }),
            None => Some(MergeStep::Add(entry)),
        }
    }
}
