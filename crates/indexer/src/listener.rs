/// Observer of committed reconciliation decisions.
///
/// Called from the analysis pool and from the project's decision loop, so
/// implementations must be cheap and thread-safe; a slow listener stalls the
/// owning project's pass. Paths are source-relative and start with `/`.
pub trait IndexChangeListener: Send + Sync {
    /// About to analyze `path`.
    fn file_add(&self, _path: &str, _analyzer: &str) {}

    fn file_added(&self, path: &str, analyzer: &str);

    /// About to remove `path`.
    fn file_remove(&self, _path: &str) {}

    fn file_removed(&self, path: &str);
}

/// Logs every decision at `trace`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl IndexChangeListener for LoggingListener {
    fn file_added(&self, path: &str, analyzer: &str) {
        log::trace!("Added {path} ({analyzer})");
    }

    fn file_removed(&self, path: &str) {
        log::trace!("Removed {path}");
    }
}
