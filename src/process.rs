#![forbid(unsafe_code)]

//! Bounded execution of the external downloader and encoder programs.
//!
//! Every child is spawned with `kill_on_drop`, so abandoning a wait (timeout,
//! cancelled request) also terminates the process instead of leaking it.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{ProcessFailure, Tool};

const STDERR_TAIL_BYTES: usize = 2048;

/// Locations of the two external programs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    downloader: PathBuf,
    encoder: PathBuf,
}

impl Toolchain {
    pub fn new(downloader: impl Into<PathBuf>, encoder: impl Into<PathBuf>) -> Self {
        Self {
            downloader: downloader.into(),
            encoder: encoder.into(),
        }
    }

    pub fn program(&self, tool: Tool) -> &Path {
        match tool {
            Tool::Downloader => &self.downloader,
            Tool::Encoder => &self.encoder,
        }
    }

    /// Base command for `tool` with stdin detached and kill-on-drop enabled.
    pub fn command(&self, tool: Tool) -> Command {
        let mut command = Command::new(self.program(tool));
        command.stdin(Stdio::null()).kill_on_drop(true);
        command
    }
}

/// Whether the caller needs the process's stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    Stdout,
    Discard,
}

/// Runs `command` to completion within `limit`.
///
/// Returns captured stdout on a zero exit status. On timeout the child is
/// killed before the error is returned. Stderr is always captured and its
/// tail logged on failure; it never leaves this function.
pub async fn run_bounded(
    tool: Tool,
    mut command: Command,
    limit: Duration,
    capture: Capture,
) -> Result<Vec<u8>, ProcessFailure> {
    command
        .stdout(match capture {
            Capture::Stdout => Stdio::piped(),
            Capture::Discard => Stdio::null(),
        })
        .stderr(Stdio::piped());

    debug!(%tool, command = ?command.as_std(), "spawning external process");
    let child = command.spawn().map_err(ProcessFailure::Spawn)?;
    let pid = child.id();

    let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(result) => result.map_err(ProcessFailure::Io)?,
        Err(_) => {
            // Dropping the wait future dropped the child, which sends SIGKILL.
            warn!(%tool, ?pid, limit_secs = limit.as_secs(), "external process timed out, killed");
            return Err(ProcessFailure::TimedOut(limit));
        }
    };

    if output.status.success() {
        return Ok(output.stdout);
    }

    warn!(
        %tool,
        ?pid,
        status = %output.status,
        stderr = %stderr_tail(&output.stderr),
        "external process failed"
    );
    Err(ProcessFailure::Exited(output.status.code()))
}

/// Last few KiB of stderr, lossily decoded, for logs.
pub(crate) fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}
