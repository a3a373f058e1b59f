use crate::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashSet;
use std::path::Path;

/// Names ignored when the configuration does not provide its own list.
pub const DEFAULT_IGNORED_NAMES: &[&str] = &[
    "d:.git",
    "d:.svn",
    "d:.hg",
    "d:.bzr",
    "d:CVS",
    "d:SCCS",
    "d:.repo",
    "d:.razor",
    "f:.DS_Store",
    "f:*.swp",
    "*~",
    ".#*",
    "#*#",
];

/// Decides whether a file or directory is excluded from both sides of the
/// merge-diff.
///
/// Entries are prefixed with `f:` (files only) or `d:` (directories only);
/// unprefixed entries apply to both. Each entry is one of:
///
/// - a glob (`*` or `?`), matched against the basename and, when it contains
///   `/`, against the full path as well;
/// - a path suffix (contains `/`), matched against the end of the full path;
/// - an exact basename.
#[derive(Debug, Clone)]
pub struct IgnoreFilter {
    files: NameMatcher,
    dirs: NameMatcher,
}

#[derive(Debug, Clone)]
struct NameMatcher {
    names: HashSet<String>,
    basename_globs: GlobSet,
    path_globs: GlobSet,
    suffixes: Vec<String>,
}

struct NameMatcherBuilder {
    names: HashSet<String>,
    basename_globs: GlobSetBuilder,
    path_globs: GlobSetBuilder,
    suffixes: Vec<String>,
}

impl IgnoreFilter {
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut files = NameMatcherBuilder::new();
        let mut dirs = NameMatcherBuilder::new();

        for raw in patterns {
            let raw = raw.as_ref().trim();
            if raw.is_empty() {
                continue;
            }
            if let Some(pattern) = raw.strip_prefix("f:") {
                files.add(pattern)?;
            } else if let Some(pattern) = raw.strip_prefix("d:") {
                dirs.add(pattern)?;
            } else {
                files.add(raw)?;
                dirs.add(raw)?;
            }
        }

        Ok(Self {
            files: files.build()?,
            dirs: dirs.build()?,
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(DEFAULT_IGNORED_NAMES)
    }

    /// `path` is the absolute path of the entry; `is_dir` selects which
    /// pattern list applies.
    #[must_use]
    pub fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        let matcher = if is_dir { &self.dirs } else { &self.files };
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let full = path.to_string_lossy().replace('\\', "/");
        matcher.matches(name, &full)
    }

    /// Name-only check against both lists, for callers without a path.
    #[must_use]
    pub fn ignores_name(&self, name: &str) -> bool {
        self.files.matches(name, name) || self.dirs.matches(name, name)
    }
}

impl NameMatcherBuilder {
    fn new() -> Self {
        Self {
            names: HashSet::new(),
            basename_globs: GlobSetBuilder::new(),
            path_globs: GlobSetBuilder::new(),
            suffixes: Vec::new(),
        }
    }

    fn add(&mut self, pattern: &str) -> Result<()> {
        if pattern.contains('*') || pattern.contains('?') {
            // `*` may cross `/` here; patterns are basename-oriented.
            let glob = Glob::new(pattern)?;
            if pattern.contains('/') {
                self.path_globs.add(glob.clone());
            }
            self.basename_globs.add(glob);
        } else if pattern.contains('/') {
            let suffix = if pattern.starts_with('/') {
                pattern.to_string()
            } else {
                format!("/{pattern}")
            };
            self.suffixes.push(suffix);
        } else {
            self.names.insert(pattern.to_string());
        }
        Ok(())
    }

    fn build(self) -> Result<NameMatcher> {
        Ok(NameMatcher {
            names: self.names,
            basename_globs: self.basename_globs.build()?,
            path_globs: self.path_globs.build()?,
            suffixes: self.suffixes,
        })
    }
}

impl NameMatcher {
    fn matches(&self, name: &str, full: &str) -> bool {
        self.names.contains(name)
            || self.basename_globs.is_match(name)
            || self.path_globs.is_match(full)
            || self.suffixes.iter().any(|suffix| full.ends_with(suffix.as_str()))
    }
}
