//! Treegrok command line
//!
//! Runs one synchronization of a source tree with its index and prints a
//! per-project report.
//!
//! ## Usage
//!
//! ```text
//! treegrok --source-root /srv/src --data-root /srv/data -j 8
//! treegrok --config treegrok.toml --project kernel=/kernel --json
//! treegrok --config treegrok.toml /kernel/drivers /kernel/fs
//! treegrok --config treegrok.toml --list-files
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use treegrok_indexer::{
    CancellationToken, IndexRunner, IndexerConfig, LoggingListener, ProjectConfig, RunReport,
    FULL_FIELD,
};

#[derive(Parser, Debug)]
#[command(
    name = "treegrok",
    version,
    about = "Incrementally synchronize a source tree with its search index"
)]
struct Cli {
    /// TOML configuration file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the sources
    #[arg(long)]
    source_root: Option<PathBuf>,

    /// Directory for index, xref and spelling data
    #[arg(long)]
    data_root: Option<PathBuf>,

    /// Threads per pool (0 = number of CPUs)
    #[arg(short = 'j', long)]
    parallelism: Option<usize>,

    /// Index a top-level directory as its own project (NAME=/PATH)
    #[arg(long = "project", value_name = "NAME=PATH", value_parser = parse_project)]
    projects: Vec<ProjectConfig>,

    /// Extra ignore pattern (prefix with f: or d: to restrict to files or directories)
    #[arg(long = "ignore", value_name = "PATTERN")]
    ignore: Vec<String>,

    /// Skip index optimization
    #[arg(long)]
    no_optimize: bool,

    /// Skip cross-reference generation
    #[arg(long)]
    no_xref: bool,

    /// Universal Ctags binary used for definitions
    #[arg(long, value_name = "BIN")]
    ctags: Option<PathBuf>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// List every indexed file and their count, then exit
    #[arg(long, conflicts_with = "list_tokens")]
    list_files: bool,

    /// List frequent tokens of the full-text field, then exit
    #[arg(long)]
    list_tokens: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only update these source-relative directories
    #[arg(value_name = "DIR", conflicts_with_all = ["list_files", "list_tokens"])]
    paths: Vec<String>,
}

enum Action {
    Sync(Vec<String>),
    ListFiles,
    ListTokens,
}

fn parse_project(raw: &str) -> std::result::Result<ProjectConfig, String> {
    let (name, path) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=PATH, got {raw:?}"))?;
    if name.is_empty() {
        return Err("project name is empty".to_string());
    }
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    Ok(ProjectConfig::new(name, path))
}

impl Cli {
    fn action(&self) -> Action {
        if self.list_files {
            Action::ListFiles
        } else if self.list_tokens {
            Action::ListTokens
        } else {
            Action::Sync(self.paths.clone())
        }
    }

    fn into_config(self) -> Result<IndexerConfig> {
        let mut config = match &self.config {
            Some(path) => IndexerConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => IndexerConfig::default(),
        };

        if let Some(source_root) = self.source_root {
            config.source_root = source_root;
        }
        if let Some(data_root) = self.data_root {
            config.data_root = data_root;
        }
        if let Some(parallelism) = self.parallelism {
            config.parallelism = parallelism;
        }
        if !self.projects.is_empty() {
            config.projects = self.projects;
        }
        config.ignored_names.extend(self.ignore);
        if self.no_optimize {
            config.optimize = false;
        }
        if self.no_xref {
            config.generate_xref = false;
        }
        if self.ctags.is_some() {
            config.ctags = self.ctags;
        }
        Ok(config)
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .target(env_logger::Target::Stderr)
        .init();
}

/// Cancel the run on Ctrl-C; a second Ctrl-C kills the process as usual.
fn cancel_on_interrupt(token: CancellationToken) {
    let spawned = std::thread::Builder::new()
        .name("treegrok-signal".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_io()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    log::warn!("Ctrl-C handling unavailable: {e}");
                    return;
                }
            };
            if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
                log::warn!("Interrupted; finishing files in flight");
                token.cancel();
            }
        });
    if let Err(e) = spawned {
        log::warn!("Ctrl-C handling unavailable: {e}");
    }
}

fn print_report(report: &RunReport) {
    for project in &report.projects {
        match (&project.stats, &project.error) {
            (Some(stats), _) => println!(
                "{}: +{} -{} ={} ~{} failed {} docs {}{}{} ({} ms)",
                project.name,
                stats.added,
                stats.removed,
                stats.unchanged,
                stats.refreshed,
                stats.failed,
                stats.documents,
                if stats.optimized { " optimized" } else { "" },
                if stats.dirty { " dirty" } else { "" },
                stats.time_ms
            ),
            (None, Some(error)) => println!("{}: error: {error}", project.name),
            (None, None) => println!("{}: no result", project.name),
        }
    }
    println!("completed {} pending file operation(s)", report.completed);
    if let Some(error) = &report.commit_error {
        println!("commit failed: {error}");
    }
    if report.cancelled {
        println!("run was cancelled");
    }
}

fn list_files(runner: &IndexRunner) -> Result<()> {
    let files = runner.indexed_files().context("Failed to read the index")?;
    for file in &files {
        println!("{file}");
    }
    println!("{} file(s)", files.len());
    Ok(())
}

fn list_tokens(runner: &IndexRunner) -> Result<()> {
    let tokens = runner
        .frequent_tokens(FULL_FIELD)
        .context("Failed to read the index")?;
    for (token, docs) in tokens {
        println!("{token} {docs}");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let json = cli.json;
    let action = cli.action();
    let config = cli.into_config()?;

    let mut runner = IndexRunner::new(config).context("Invalid configuration")?;
    let paths = match action {
        Action::ListFiles => return list_files(&runner),
        Action::ListTokens => return list_tokens(&runner),
        Action::Sync(paths) => paths,
    };
    runner.add_listener(Arc::new(LoggingListener));
    cancel_on_interrupt(runner.cancellation_token());

    let report = if paths.is_empty() {
        runner.run()
    } else {
        runner.run_paths(paths.as_slice())
    }
    .context("Synchronization failed")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if !report.is_success() {
        bail!("synchronization finished with errors");
    }
    Ok(())
}
