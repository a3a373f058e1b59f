//! Long-lived `ctags` helper processes.
//!
//! Each [`CtagsWorker`] owns one `ctags --filter=yes` child. A request writes
//! one path to its stdin and reads tag lines until the filter terminator.
//! Workers live in the fabric's bounded pool; a worker whose process died or
//! was killed by the timeout watchdog fails validation and gets replaced.

use crate::pool::PoolFactory;
use crate::{IndexerError, Result};
use parking_lot::Mutex;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

const FILTER_TERMINATOR: &str = "__ctags_done_with_file__";

/// One tag reported by ctags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Definition {
    pub symbol: String,
    pub kind: String,
    pub line: u32,
}

pub struct CtagsWorker {
    process: Option<CtagsProcess>,
    timeout: Duration,
    watchdog: Option<Handle>,
}

struct CtagsProcess {
    child: Arc<Mutex<Child>>,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    killed: Arc<AtomicBool>,
}

impl CtagsWorker {
    /// A worker without a process. It reports no definitions.
    #[must_use]
    pub fn inert() -> Self {
        Self {
            process: None,
            timeout: Duration::ZERO,
            watchdog: None,
        }
    }

    pub fn spawn(binary: &Path, timeout: Duration, watchdog: Option<Handle>) -> Result<Self> {
        let mut child = Command::new(binary)
            .args([
                "--c-kinds=+l",
                "--file-scope=yes",
                "-u",
                "--filter=yes",
                &format!("--filter-terminator={FILTER_TERMINATOR}\n"),
                "--fields=-anf+iKnS",
                "--excmd=pattern",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                IndexerError::CtagsError(format!("failed to start {}: {e}", binary.display()))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| IndexerError::CtagsError("ctags stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| IndexerError::CtagsError("ctags stdout unavailable".into()))?;

        log::debug!("Started ctags process {}", child.id());
        Ok(Self {
            process: Some(CtagsProcess {
                child: Arc::new(Mutex::new(child)),
                stdin,
                stdout: BufReader::new(stdout),
                killed: Arc::new(AtomicBool::new(false)),
            }),
            timeout,
            watchdog,
        })
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.process.is_some()
    }

    /// Tags for the file at `path`. Inert workers return nothing.
    pub fn definitions(&mut self, path: &Path) -> Result<Vec<Definition>> {
        let Some(process) = self.process.as_mut() else {
            return Ok(Vec::new());
        };

        writeln!(process.stdin, "{}", path.display())?;
        process.stdin.flush()?;

        let disarm = self
            .watchdog
            .as_ref()
            .filter(|_| !self.timeout.is_zero())
            .map(|handle| arm_watchdog(handle, self.timeout, process));

        let mut definitions = Vec::new();
        let mut line = String::new();
        let outcome = loop {
            line.clear();
            match process.stdout.read_line(&mut line) {
                Ok(0) => break Err(IndexerError::CtagsError(exit_reason(process, path))),
                Ok(_) => {
                    let trimmed = line.trim_end_matches(['\r', '\n']);
                    if trimmed == FILTER_TERMINATOR {
                        break Ok(());
                    }
                    if let Some(def) = parse_tag_line(trimmed) {
                        definitions.push(def);
                    }
                }
                Err(e) => break Err(e.into()),
            }
        };

        if let Some(disarm) = disarm {
            let _ = disarm.send(());
        }
        outcome.map(|()| definitions)
    }

    /// `false` once the process exited or was killed.
    pub fn is_healthy(&mut self) -> bool {
        match self.process.as_ref() {
            None => true,
            Some(process) => {
                !process.killed.load(Ordering::SeqCst)
                    && matches!(process.child.lock().try_wait(), Ok(None))
            }
        }
    }

    pub fn close(&mut self) {
        let Some(process) = self.process.take() else {
            return;
        };
        let CtagsProcess { child, stdin, .. } = process;
        // Closing stdin ends the filter loop.
        drop(stdin);
        let mut child = child.lock();
        if matches!(child.try_wait(), Ok(None)) {
            let _ = child.kill();
        }
        let _ = child.wait();
    }
}

impl Drop for CtagsWorker {
    fn drop(&mut self) {
        self.close();
    }
}

fn arm_watchdog(handle: &Handle, timeout: Duration, process: &CtagsProcess) -> oneshot::Sender<()> {
    let (tx, rx) = oneshot::channel::<()>();
    let child = Arc::clone(&process.child);
    let killed = Arc::clone(&process.killed);
    handle.spawn(async move {
        tokio::select! {
            () = tokio::time::sleep(timeout) => {
                killed.store(true, Ordering::SeqCst);
                let mut child = child.lock();
                log::warn!("ctags process {} timed out after {timeout:?}; killing", child.id());
                let _ = child.kill();
            }
            _ = rx => {}
        }
    });
    tx
}

fn exit_reason(process: &CtagsProcess, path: &Path) -> String {
    if process.killed.load(Ordering::SeqCst) {
        format!("timed out on {}", path.display())
    } else {
        format!("process exited while tagging {}", path.display())
    }
}

/// Parse `name<TAB>file<TAB>pattern;"<TAB>kind<TAB>line:N...`.
fn parse_tag_line(line: &str) -> Option<Definition> {
    let (head, fields) = line.split_once(";\"\t")?;
    let symbol = head.split('\t').next()?.to_string();
    if symbol.is_empty() {
        return None;
    }

    let mut kind = String::new();
    let mut line_no = 0;
    for field in fields.split('\t') {
        if let Some(n) = field.strip_prefix("line:") {
            line_no = n.parse().unwrap_or(0);
        } else if kind.is_empty() && !field.contains(':') {
            kind = field.to_string();
        }
    }

    Some(Definition {
        symbol,
        kind,
        line: line_no,
    })
}

/// Creates the pool's workers; inert ones when no binary is configured.
pub struct CtagsFactory {
    binary: Option<PathBuf>,
    timeout: Duration,
    watchdog: Option<Handle>,
}

impl CtagsFactory {
    #[must_use]
    pub fn new(binary: Option<PathBuf>, timeout: Duration, watchdog: Option<Handle>) -> Self {
        Self {
            binary,
            timeout,
            watchdog,
        }
    }
}

impl PoolFactory<CtagsWorker> for CtagsFactory {
    fn create(&self) -> Result<CtagsWorker> {
        match &self.binary {
            Some(binary) => CtagsWorker::spawn(binary, self.timeout, self.watchdog.clone()),
            None => Ok(CtagsWorker::inert()),
        }
    }

    fn validate(&self, item: &mut CtagsWorker) -> bool {
        item.is_healthy()
    }

    fn destroy(&self, mut item: CtagsWorker) {
        item.close();
    }
}
