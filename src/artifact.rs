#![forbid(unsafe_code)]

//! On-disk artifacts and the per-request workspace they live in.
//!
//! Every request gets its own subdirectory of the shared working directory,
//! named by a random token. Downloader output is written through a template
//! carrying a marker (`{token}.{role}.%(ext)s`) and found again by scanning,
//! because the downloader picks the extension at runtime.

use std::{
    io,
    ops::Deref,
    path::{Path, PathBuf},
};

use rand_core::{OsRng, RngCore};
use tracing::{debug, warn};

use crate::{
    error::{PipelineError, PipelineResult},
    request::AudioFormat,
};

/// Leftovers of interrupted downloads that never count as the artifact.
const IGNORED_SUFFIXES: [&str; 3] = [".part", ".ytdl", ".temp"];
const TOKEN_ATTEMPTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Intermediate downloader output, deleted as soon as it has been used.
    Raw,
    /// Deliverable named `{title}.{ext}`, deleted by the cleanup sweeper.
    Final,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFile {
    path: PathBuf,
    kind: ArtifactKind,
}

impl ArtifactFile {
    pub fn raw(path: PathBuf) -> Self {
        Self {
            path,
            kind: ArtifactKind::Raw,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    pub fn extension(&self) -> Option<&str> {
        self.path.extension().and_then(|ext| ext.to_str())
    }

    /// Atomically renames the artifact to `target`, replacing whatever was there.
    pub async fn promote(self, target: PathBuf) -> PipelineResult<ArtifactFile> {
        tokio::fs::rename(&self.path, &target)
            .await
            .map_err(|err| PipelineError::io(&target, err))?;
        Ok(Self {
            path: target,
            kind: ArtifactKind::Final,
        })
    }

    /// Best-effort delete; a file that is already gone is fine.
    pub async fn remove(&self) {
        remove_file_quietly(&self.path).await;
    }
}

pub(crate) async fn remove_file_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed file"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), %err, "could not remove file"),
    }
}

/// The process-wide directory all requests write under.
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub async fn prepare(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates a fresh, uniquely named subdirectory for one request.
    pub async fn open_request(&self) -> PipelineResult<RequestWorkspace> {
        let mut last_err = None;
        for _ in 0..TOKEN_ATTEMPTS {
            let token = request_token();
            let dir = self.root.join(&token);
            match tokio::fs::create_dir(&dir).await {
                Ok(()) => return Ok(RequestWorkspace { dir, token }),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => last_err = Some(err),
                Err(err) => return Err(PipelineError::io(dir, err)),
            }
        }
        Err(PipelineError::io(
            &self.root,
            last_err.unwrap_or_else(|| io::Error::other("no unique request token")),
        ))
    }
}

fn request_token() -> String {
    format!("{:016x}", OsRng.next_u64())
}

/// Scratch space owned by a single in-flight request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestWorkspace {
    dir: PathBuf,
    token: String,
}

impl RequestWorkspace {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Marker for one output of this request, e.g. `{token}.src`.
    pub fn marker(&self, role: &str) -> String {
        format!("{}.{role}", self.token)
    }

    /// Downloader `-o` template; the extension is left to the downloader.
    pub fn output_template(&self, marker: &str) -> PathBuf {
        self.dir.join(format!("{marker}.%(ext)s"))
    }

    pub fn scratch_path(&self, marker: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{marker}.{ext}"))
    }

    pub fn final_path(&self, title: &str, format: AudioFormat) -> PathBuf {
        self.dir.join(format!("{title}.{}", format.extension()))
    }

    /// Removes the whole workspace. Used when unwinding after a failure.
    pub async fn discard(&self) {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => debug!(dir = %self.dir.display(), "discarded request workspace"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(dir = %self.dir.display(), %err, "could not discard workspace"),
        }
    }

    /// Wraps the workspace so it is removed if the request is abandoned.
    pub fn guarded(self) -> WorkspaceGuard {
        WorkspaceGuard {
            workspace: self,
            armed: true,
        }
    }
}

/// Removes its workspace on drop unless [`release`](Self::release)d.
///
/// Covers the paths where a request future is dropped mid-flight (client
/// disconnect, outer timeout): child processes die with `kill_on_drop` and
/// the guard takes their partial outputs with them.
#[derive(Debug)]
pub struct WorkspaceGuard {
    workspace: RequestWorkspace,
    armed: bool,
}

impl WorkspaceGuard {
    /// Hands the workspace back; the caller now owns its removal.
    pub fn release(mut self) -> RequestWorkspace {
        self.armed = false;
        self.workspace.clone()
    }
}

impl Deref for WorkspaceGuard {
    type Target = RequestWorkspace;

    fn deref(&self) -> &RequestWorkspace {
        &self.workspace
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let dir = self.workspace.dir.clone();
        warn!(dir = %dir.display(), "request abandoned, discarding workspace");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove_dir_quietly(&dir));
            }
            Err(_) => remove_dir_quietly(&dir),
        }
    }
}

fn remove_dir_quietly(dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => debug!(dir = %dir.display(), "discarded request workspace"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(dir = %dir.display(), %err, "could not discard workspace"),
    }
}

/// Finds the single file in `dir` whose name is `{marker}.{ext}`.
///
/// Zero or several candidates are both failures; the locator never guesses.
pub async fn locate_artifact(dir: &Path, marker: &str) -> PipelineResult<ArtifactFile> {
    let prefix = format!("{marker}.");
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|err| PipelineError::io(dir, err))?;

    let mut candidates = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| PipelineError::io(dir, err))?
    {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(&prefix) || name.len() == prefix.len() {
            continue;
        }
        if IGNORED_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
            continue;
        }
        let is_file = entry
            .file_type()
            .await
            .map(|kind| kind.is_file())
            .unwrap_or(false);
        if is_file {
            candidates.push(entry.path());
        }
    }

    if candidates.len() == 1 {
        let path = candidates.remove(0);
        debug!(path = %path.display(), "located artifact");
        return Ok(ArtifactFile::raw(path));
    }

    warn!(marker, candidates = candidates.len(), dir = %dir.display(), "artifact lookup failed");
    Err(PipelineError::ArtifactNotFound {
        marker: marker.to_string(),
        candidates: candidates.len(),
    })
}
