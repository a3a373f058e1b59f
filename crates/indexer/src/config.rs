use crate::filter::{IgnoreFilter, DEFAULT_IGNORED_NAMES};
use crate::pending::pending_path;
use crate::{IndexerError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const INDEX_DIR_NAME: &str = "index";
const SPELLING_DIR_NAME: &str = "spelling";
const XREF_DIR_NAME: &str = "xref";
const STAGING_DIR_NAME: &str = "staging";
const TIMESTAMP_FILE_NAME: &str = "timestamp";

/// A top-level directory of the source root indexed into its own store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    pub name: String,
    /// Path relative to the source root, starting with `/`.
    pub path: String,
}

impl ProjectConfig {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// Everything a synchronization run needs to know, passed explicitly to the
/// fabric, the reconcilers and the runner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IndexerConfig {
    pub source_root: PathBuf,
    pub data_root: PathBuf,
    /// Empty means the whole source root is one unnamed project.
    pub projects: Vec<ProjectConfig>,
    pub ignored_names: Vec<String>,
    /// Threads per pool; 0 picks the number of CPUs.
    pub parallelism: usize,
    pub optimize: bool,
    pub generate_xref: bool,
    /// Path to a Universal Ctags binary. `None` disables definitions.
    pub ctags: Option<PathBuf>,
    pub ctags_timeout_secs: u64,
    /// 0 disables progress logging.
    pub progress_interval_secs: u64,
    /// Field the spelling index is built from.
    pub spelling_field: String,
    pub locking: bool,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            source_root: PathBuf::from("."),
            data_root: PathBuf::from(".treegrok"),
            projects: Vec::new(),
            ignored_names: DEFAULT_IGNORED_NAMES.iter().map(|s| (*s).to_string()).collect(),
            parallelism: 0,
            optimize: true,
            generate_xref: true,
            ctags: None,
            ctags_timeout_secs: 10,
            progress_interval_secs: 10,
            spelling_field: "full".to_string(),
            locking: true,
        }
    }
}

impl IndexerConfig {
    pub fn new(source_root: impl Into<PathBuf>, data_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            data_root: data_root.into(),
            ..Self::default()
        }
    }

    /// Read a TOML file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.source_root.is_dir() {
            return Err(IndexerError::InvalidPath(format!(
                "Source root is not a directory: {}",
                self.source_root.display()
            )));
        }
        let mut names = std::collections::HashSet::new();
        for project in &self.projects {
            if project.name.is_empty() || project.name.contains('/') {
                return Err(IndexerError::InvalidPath(format!(
                    "Invalid project name: {:?}",
                    project.name
                )));
            }
            if !project.path.starts_with('/') || project.path.len() < 2 {
                return Err(IndexerError::InvalidPath(format!(
                    "Project path must be relative to the source root and start with '/': {}",
                    project.path
                )));
            }
            if !names.insert(project.name.as_str()) {
                return Err(IndexerError::InvalidPath(format!(
                    "Duplicate project name: {}",
                    project.name
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn effective_parallelism(&self) -> usize {
        if self.parallelism == 0 {
            num_cpus::get().max(1)
        } else {
            self.parallelism
        }
    }

    #[must_use]
    pub fn ctags_timeout(&self) -> Duration {
        Duration::from_secs(self.ctags_timeout_secs)
    }

    #[must_use]
    pub fn progress_interval(&self) -> Option<Duration> {
        (self.progress_interval_secs > 0).then(|| Duration::from_secs(self.progress_interval_secs))
    }

    pub fn ignore_filter(&self) -> Result<IgnoreFilter> {
        IgnoreFilter::new(&self.ignored_names)
    }

    /// Store directory of `project`, or the shared one without projects.
    #[must_use]
    pub fn index_dir(&self, project: Option<&ProjectConfig>) -> PathBuf {
        let dir = self.data_root.join(INDEX_DIR_NAME);
        match project {
            Some(project) => dir.join(&project.name),
            None => dir,
        }
    }

    #[must_use]
    pub fn spelling_dir(&self, project: Option<&ProjectConfig>) -> PathBuf {
        let dir = self.data_root.join(SPELLING_DIR_NAME);
        match project {
            Some(project) => dir.join(&project.name),
            None => dir,
        }
    }

    #[must_use]
    pub fn xref_root(&self) -> PathBuf {
        self.data_root.join(XREF_DIR_NAME)
    }

    /// Xref location for a `/`-prefixed source-relative path.
    #[must_use]
    pub fn xref_path(&self, relative: &str) -> PathBuf {
        self.xref_root().join(relative.trim_start_matches('/'))
    }

    /// Holds provisional xrefs until the completer moves them under
    /// [`Self::xref_root`]. Never contains live files.
    #[must_use]
    pub fn staging_dir(&self) -> PathBuf {
        self.data_root.join(STAGING_DIR_NAME)
    }

    /// Provisional location of the xref for `relative`.
    #[must_use]
    pub fn staging_path(&self, relative: &str) -> PathBuf {
        pending_path(&self.staging_dir().join(relative.trim_start_matches('/')))
    }

    #[must_use]
    pub fn timestamp_path(&self) -> PathBuf {
        self.data_root.join(TIMESTAMP_FILE_NAME)
    }
}
