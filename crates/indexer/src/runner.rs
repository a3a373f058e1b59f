use crate::cancel::CancellationToken;
use crate::config::{IndexerConfig, ProjectConfig};
use crate::fabric::ExecutionFabric;
use crate::listener::IndexChangeListener;
use crate::pending::PendingFileCompleter;
use crate::reconciler::IndexReconciler;
use crate::stats::ProjectStats;
use crate::store::{IndexStore, SegmentStore};
use crate::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Result of one project's pass within a run.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectOutcome {
    /// Project name, or `/` for the whole source root.
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<ProjectStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub projects: Vec<ProjectOutcome>,
    /// Pending deletions and renamings carried out.
    pub completed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_error: Option<String>,
    pub cancelled: bool,
}

impl RunReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.commit_error.is_none() && self.projects.iter().all(|p| p.error.is_none())
    }

    #[must_use]
    pub fn changed(&self) -> bool {
        self.projects
            .iter()
            .filter_map(|p| p.stats.as_ref())
            .any(ProjectStats::changed)
    }
}

/// Tokens reported by [`IndexRunner::frequent_tokens`] occur in more than
/// this many documents.
pub const FREQUENT_TOKEN_DOCS: usize = 16;
/// ... and are longer than this many characters.
pub const FREQUENT_TOKEN_MIN_LEN: usize = 4;

/// One project (or the whole source root) and the directories to
/// reconcile in it; empty means all of it.
type Scope = (Option<ProjectConfig>, Vec<String>);

/// Drives one synchronization run: a pass per project on the fixed pool,
/// then the pending-file commit.
pub struct IndexRunner {
    config: Arc<IndexerConfig>,
    listeners: Vec<Arc<dyn IndexChangeListener>>,
    cancel: CancellationToken,
}

impl IndexRunner {
    pub fn new(config: IndexerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            listeners: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn add_listener(&mut self, listener: Arc<dyn IndexChangeListener>) {
        self.listeners.push(listener);
    }

    /// Cancelling stops directory descent in every running pass.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Errors only when the run cannot start; per-project failures and
    /// commit failures are reported in the [`RunReport`].
    pub fn run(&self) -> Result<RunReport> {
        let scopes: Vec<Scope> = if self.config.projects.is_empty() {
            vec![(None, Vec::new())]
        } else {
            self.config
                .projects
                .iter()
                .cloned()
                .map(|project| (Some(project), Vec::new()))
                .collect()
        };
        self.run_scopes(scopes)
    }

    /// Reconcile only the given source-relative directories. Each one is
    /// attributed to the project with the longest matching path; paths that
    /// are not directories, or belong to no project, are skipped with a
    /// warning.
    pub fn run_paths<S: AsRef<str>>(&self, paths: &[S]) -> Result<RunReport> {
        let source_root = self.config.source_root.canonicalize()?;
        let mut grouped: BTreeMap<Option<usize>, Vec<String>> = BTreeMap::new();
        for raw in paths {
            let path = format!("/{}", raw.as_ref().trim_matches('/'));
            if !source_root.join(path.trim_start_matches('/')).is_dir() {
                log::warn!("Not a directory below the source root, skipping: {path}");
                continue;
            }
            if self.config.projects.is_empty() {
                grouped.entry(None).or_default().push(path);
                continue;
            }
            match self.project_index_for(&path) {
                Some(index) => grouped.entry(Some(index)).or_default().push(path),
                None => log::warn!("No project contains {path}, skipping"),
            }
        }

        let scopes: Vec<Scope> = grouped
            .into_iter()
            .map(|(index, dirs)| (index.map(|i| self.config.projects[i].clone()), dirs))
            .collect();
        if scopes.is_empty() {
            log::warn!("Nothing to update");
            return Ok(RunReport::default());
        }
        self.run_scopes(scopes)
    }

    fn project_index_for(&self, path: &str) -> Option<usize> {
        self.config
            .projects
            .iter()
            .enumerate()
            .filter(|(_, project)| {
                let root = project.path.trim_end_matches('/');
                path.strip_prefix(root)
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
            })
            .max_by_key(|(_, project)| project.path.trim_end_matches('/').len())
            .map(|(index, _)| index)
    }

    fn run_scopes(&self, scopes: Vec<Scope>) -> Result<RunReport> {
        std::fs::create_dir_all(&self.config.data_root)?;
        let fabric = ExecutionFabric::new(&self.config)?;
        let completer = PendingFileCompleter::new().with_prune_root(self.config.xref_root());

        log::info!(
            "Synchronizing {} project(s) with parallelism {}",
            scopes.len(),
            fabric.parallelism()
        );

        let mut outcomes: Vec<Option<ProjectOutcome>> = vec![None; scopes.len()];
        fabric.fixed().scope(|scope| {
            for (slot, (project, directories)) in outcomes.iter_mut().zip(scopes) {
                let fabric = &fabric;
                let completer = &completer;
                scope.spawn(move |_| {
                    *slot = Some(self.run_project(project, directories, fabric, completer));
                });
            }
        });
        let projects: Vec<ProjectOutcome> = outcomes.into_iter().flatten().collect();

        let mut report = RunReport {
            projects,
            cancelled: self.cancel.is_cancelled(),
            ..RunReport::default()
        };
        match fabric.work_stealing().install(|| completer.complete()) {
            Ok(completed) => {
                report.completed = completed;
                self.sweep_staging();
            }
            Err(e) => {
                log::error!("Commit of pending files failed: {e}");
                report.commit_error = Some(error_chain(&e));
            }
        }
        fabric.shutdown();

        if report.changed() && !report.cancelled {
            self.touch_timestamp()?;
        }
        Ok(report)
    }

    /// Every renaming has landed; whatever is left in staging belongs to
    /// analyses whose documents were never stored.
    fn sweep_staging(&self) {
        let staging = self.config.staging_dir();
        match std::fs::remove_dir_all(&staging) {
            Ok(()) => log::debug!("Removed staging dir {}", staging.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove staging dir {}: {e}", staging.display()),
        }
    }

    /// Source paths of every indexed file, sorted. Reads committed state
    /// without taking the write lock.
    pub fn indexed_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();
        for store in self.open_stores()? {
            files.extend(store.paths().map(str::to_string));
        }
        files.sort();
        Ok(files)
    }

    pub fn indexed_file_count(&self) -> Result<usize> {
        let mut count = 0;
        for store in self.open_stores()? {
            count += store.num_docs();
        }
        Ok(count)
    }

    /// Terms of `field` held by more than [`FREQUENT_TOKEN_DOCS`] documents
    /// of one store and longer than [`FREQUENT_TOKEN_MIN_LEN`], with their
    /// document counts summed over all stores.
    pub fn frequent_tokens(&self, field: &str) -> Result<Vec<(String, usize)>> {
        let mut tokens: BTreeMap<String, usize> = BTreeMap::new();
        for store in self.open_stores()? {
            for (term, docs) in store.term_frequencies(field) {
                if docs > FREQUENT_TOKEN_DOCS && term.chars().count() > FREQUENT_TOKEN_MIN_LEN {
                    *tokens.entry(term.to_string()).or_insert(0) += docs;
                }
            }
        }
        Ok(tokens.into_iter().collect())
    }

    /// Stores that exist on disk, opened read-only.
    fn open_stores(&self) -> Result<Vec<SegmentStore>> {
        let dirs: Vec<_> = if self.config.projects.is_empty() {
            vec![self.config.index_dir(None)]
        } else {
            self.config
                .projects
                .iter()
                .map(|project| self.config.index_dir(Some(project)))
                .collect()
        };
        dirs.into_iter()
            .filter(|dir| dir.is_dir())
            .map(|dir| SegmentStore::open(&dir, false))
            .collect()
    }

    fn run_project(
        &self,
        project: Option<ProjectConfig>,
        directories: Vec<String>,
        fabric: &ExecutionFabric,
        completer: &PendingFileCompleter,
    ) -> ProjectOutcome {
        let name = project
            .as_ref()
            .map_or_else(|| "/".to_string(), |p| p.name.clone());
        let outcome = IndexReconciler::new(Arc::clone(&self.config), project, fabric, completer)
            .map(|reconciler| {
                reconciler
                    .with_listeners(self.listeners.clone())
                    .with_cancellation(self.cancel.clone())
                    .with_directories(directories)
            })
            .and_then(|reconciler| reconciler.run());

        match outcome {
            Ok(stats) => ProjectOutcome {
                name,
                stats: Some(stats),
                error: None,
            },
            Err(e) => {
                log::error!("Indexing {name} failed: {e}");
                ProjectOutcome {
                    name,
                    stats: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    fn touch_timestamp(&self) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        std::fs::write(self.config.timestamp_path(), now.to_string())?;
        Ok(())
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
