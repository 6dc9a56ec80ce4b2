#![forbid(unsafe_code)]

//! Deferred removal of delivered artifacts.
//!
//! A download is deleted only after the response body has been handed to the
//! transport and a grace period has passed. Deletions run on a tracked task
//! set so shutdown can flush them instead of leaving files behind.

use std::{
    collections::HashSet,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::PipelineError;

/// What a scheduled cleanup removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanupPolicy {
    /// Only the workspace of the request that scheduled it.
    #[default]
    RequestScoped,
    /// Everything under the working directory, including files other
    /// in-flight requests may still be producing.
    SweepAll,
}

impl CleanupPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            CleanupPolicy::RequestScoped => "request",
            CleanupPolicy::SweepAll => "sweep-all",
        }
    }
}

impl fmt::Display for CleanupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CleanupPolicy {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "request" => Ok(CleanupPolicy::RequestScoped),
            "sweep-all" | "sweep_all" | "all" => Ok(CleanupPolicy::SweepAll),
            other => Err(PipelineError::validation(format!(
                "Unknown cleanup policy '{other}'. Allowed values are: request, sweep-all"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CleanupSweeper {
    work_dir: PathBuf,
    grace: Duration,
    policy: CleanupPolicy,
    tracker: TaskTracker,
    cancel: CancellationToken,
    pending: Arc<Mutex<HashSet<PathBuf>>>,
}

impl CleanupSweeper {
    pub fn new(work_dir: impl Into<PathBuf>, grace: Duration, policy: CleanupPolicy) -> Self {
        Self {
            work_dir: work_dir.into(),
            grace,
            policy,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            pending: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn policy(&self) -> CleanupPolicy {
        self.policy
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Number of scheduled cleanups that have not run yet.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Schedules removal of a delivered request's workspace after the grace
    /// period. Scheduling the same workspace twice is a no-op. Never blocks.
    pub fn schedule(&self, scope: PathBuf) {
        if self.tracker.is_closed() {
            warn!(scope = %scope.display(), "cleanup scheduled after shutdown, removing now");
        }
        if !self.pending.lock().insert(scope.clone()) {
            debug!(scope = %scope.display(), "cleanup already scheduled");
            return;
        }

        let sweeper = self.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(sweeper.grace) => {}
                _ = sweeper.cancel.cancelled() => {
                    debug!(scope = %scope.display(), "flushing cleanup on shutdown");
                }
            }
            sweeper.run(&scope).await;
            sweeper.pending.lock().remove(&scope);
        });
    }

    async fn run(&self, scope: &Path) {
        let (target, removed) = match self.policy {
            CleanupPolicy::RequestScoped => {
                let target = scope.to_path_buf();
                let removed = tokio::task::spawn_blocking({
                    let target = target.clone();
                    move || remove_tree(&target)
                })
                .await
                .unwrap_or_else(|err| {
                    warn!(%err, "cleanup task panicked");
                    0
                });
                (target, removed)
            }
            CleanupPolicy::SweepAll => {
                let target = self.work_dir.clone();
                let removed = tokio::task::spawn_blocking({
                    let target = target.clone();
                    move || sweep_contents(&target)
                })
                .await
                .unwrap_or_else(|err| {
                    warn!(%err, "cleanup task panicked");
                    0
                });
                (target, removed)
            }
        };
        info!(
            policy = %self.policy,
            target = %target.display(),
            removed,
            "cleanup finished"
        );
    }

    /// Defers [`schedule`](Self::schedule) until the returned guard is
    /// dropped, i.e. when whatever holds it (a response body) is finished.
    pub fn guard(&self, scope: PathBuf) -> CleanupGuard {
        CleanupGuard {
            sweeper: self.clone(),
            scope: Some(scope),
        }
    }

    /// Runs every pending cleanup immediately and waits for all of them.
    pub async fn shutdown(&self) {
        let pending = self.pending();
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!(flushed = pending, "cleanup sweeper stopped");
    }
}

#[derive(Debug)]
pub struct CleanupGuard {
    sweeper: CleanupSweeper,
    scope: Option<PathBuf>,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Some(scope) = self.scope.take() {
            self.sweeper.schedule(scope);
        }
    }
}

/// Removes `root` and everything below it; returns the number of entries
/// removed. Individual failures are logged and skipped.
fn remove_tree(root: &Path) -> usize {
    if !root.exists() {
        return 0;
    }
    remove_entries(WalkDir::new(root).contents_first(true))
}

/// Removes everything below `root` but keeps `root` itself.
fn sweep_contents(root: &Path) -> usize {
    if !root.exists() {
        return 0;
    }
    remove_entries(WalkDir::new(root).min_depth(1).contents_first(true))
}

fn remove_entries(walker: WalkDir) -> usize {
    let mut removed = 0;
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(%err, "cleanup could not read entry");
                continue;
            }
        };
        let path = entry.path();
        let result = if entry.file_type().is_dir() {
            std::fs::remove_dir(path)
        } else {
            std::fs::remove_file(path)
        };
        match result {
            Ok(()) => removed += 1,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), %err, "cleanup could not remove entry"),
        }
    }
    removed
}
