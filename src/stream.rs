#![forbid(unsafe_code)]

//! "stream" executor: `downloader -o - | encoder -i pipe:0 ... pipe:1`.
//!
//! Nothing touches disk. The encoder's stdout is exposed as a pull-based
//! stream of fixed-size chunks; each read happens only when the consumer asks
//! for the next chunk. The [`StreamSession`] owns both children and tears
//! them down on every exit path: exhaustion (wait and check statuses),
//! read error or stall (kill), and early drop by the consumer (kill + reap).
//!
//! [`start_stream`] holds the session back until the first chunk exists, so a
//! source that fails before producing audio is reported as a pipeline error
//! rather than as an empty body.

use std::{
    fmt,
    future::Future,
    io,
    pin::Pin,
    process::Stdio,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, ChildStdout},
    time::{Instant, Sleep},
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::{
    encoder,
    error::{PipelineError, PipelineResult, ProcessFailure, Tool},
    process::Toolchain,
    request::DownloadRequest,
};

/// Bytes read from the encoder per chunk.
pub const CHUNK_SIZE: usize = 8 * 1024;

pub fn stream_download_args(source_url: &str) -> Vec<String> {
    [
        "-f",
        "bestaudio",
        "--no-playlist",
        "--no-progress",
        "--no-warnings",
        "--quiet",
        "-o",
        "-",
        "--",
        source_url,
    ]
    .map(str::to_string)
    .to_vec()
}

pub fn stream_encode_args(request: &DownloadRequest) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-i", "pipe:0"]
        .map(str::to_string)
        .to_vec();
    args.extend(encoder::output_args(request.format(), request.bitrate()));
    args.push("pipe:1".to_string());
    args
}

/// Starts both processes connected by a pipe.
///
/// `idle_timeout` bounds the wait for each chunk and for the final exit of
/// both processes once the output is exhausted.
pub fn spawn_stream(
    tools: &Toolchain,
    request: &DownloadRequest,
    idle_timeout: Duration,
) -> PipelineResult<StreamSession> {
    let mut command = tools.command(Tool::Downloader);
    command
        .args(stream_download_args(request.source_url()))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut downloader = command
        .spawn()
        .map_err(|err| PipelineError::process(Tool::Downloader, ProcessFailure::Spawn(err)))?;
    if let Some(stderr) = downloader.stderr.take() {
        tokio::spawn(log_stderr(Tool::Downloader, stderr));
    }

    let pipe: Stdio = downloader
        .stdout
        .take()
        .ok_or_else(|| missing_pipe(Tool::Downloader))?
        .try_into()
        .map_err(|err| PipelineError::process(Tool::Downloader, ProcessFailure::Io(err)))?;

    let mut command = tools.command(Tool::Encoder);
    command
        .args(stream_encode_args(request))
        .stdin(pipe)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // On failure `downloader` is dropped here and killed.
    let mut encoder = command
        .spawn()
        .map_err(|err| PipelineError::process(Tool::Encoder, ProcessFailure::Spawn(err)))?;
    if let Some(stderr) = encoder.stderr.take() {
        tokio::spawn(log_stderr(Tool::Encoder, stderr));
    }
    let output = encoder
        .stdout
        .take()
        .ok_or_else(|| missing_pipe(Tool::Encoder))?;

    debug!(
        downloader = ?downloader.id(),
        encoder = ?encoder.id(),
        "stream pipeline started"
    );
    Ok(StreamSession::new(
        ProcessPair {
            downloader,
            encoder,
        },
        output,
        idle_timeout,
    ))
}

/// Spawns the pair and waits for the first chunk of audio.
///
/// A failure before that chunk (bad source, encoder crash, stall) comes back
/// as a [`PipelineError`] with both processes torn down. The chunk itself is
/// replayed as the first item of the returned session.
pub async fn start_stream(
    tools: &Toolchain,
    request: &DownloadRequest,
    idle_timeout: Duration,
) -> PipelineResult<StreamSession> {
    let mut session = spawn_stream(tools, request, idle_timeout)?;
    match session.next().await {
        Some(Ok(chunk)) => session.pending = Some(chunk),
        Some(Err(err)) => {
            warn!(%err, "stream failed before producing audio");
            return Err(startup_failure(err));
        }
        None => debug!("stream finished without producing audio"),
    }
    Ok(session)
}

/// Recovers the pipeline error carried inside a session's io error.
fn startup_failure(err: io::Error) -> PipelineError {
    let kind = err.kind();
    match err.into_inner().map(|inner| inner.downcast::<PipelineError>()) {
        Some(Ok(failure)) => *failure,
        Some(Err(other)) => {
            PipelineError::process(Tool::Encoder, ProcessFailure::Io(io::Error::new(kind, other)))
        }
        None => PipelineError::process(Tool::Encoder, ProcessFailure::Io(kind.into())),
    }
}

/// Forwards a stream child's stderr into the log, line by line.
async fn log_stderr(tool: Tool, stderr: impl AsyncRead + Unpin) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => warn!(%tool, line, "stream process stderr"),
            Ok(None) => break,
            Err(err) => {
                debug!(%tool, %err, "stopped reading stream process stderr");
                break;
            }
        }
    }
}

fn missing_pipe(tool: Tool) -> PipelineError {
    PipelineError::process(
        tool,
        ProcessFailure::Io(io::Error::other("stdout pipe was not captured")),
    )
}

struct ProcessPair {
    downloader: Child,
    encoder: Child,
}

impl ProcessPair {
    fn ids(&self) -> Option<(u32, u32)> {
        Some((self.downloader.id()?, self.encoder.id()?))
    }

    /// Kills both children and reaps them in the background.
    fn terminate(mut self) {
        for (tool, child) in [
            (Tool::Encoder, &mut self.encoder),
            (Tool::Downloader, &mut self.downloader),
        ] {
            if let Err(err) = child.start_kill() {
                debug!(%tool, %err, "kill on stream teardown");
            }
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = self.encoder.wait().await;
                    let _ = self.downloader.wait().await;
                    debug!("stream processes reaped after teardown");
                });
            }
            // Outside a runtime, kill_on_drop and tokio's orphan reaping take over.
            Err(_) => drop(self),
        }
    }

    /// Waits for both children after the encoder closed its output.
    async fn finish(mut self, limit: Duration) -> PipelineResult<()> {
        let encoder = wait_bounded(Tool::Encoder, &mut self.encoder, limit).await;
        let downloader = wait_bounded(Tool::Downloader, &mut self.downloader, limit).await;
        // The encoder usually fails only because its input did.
        downloader?;
        encoder?;
        Ok(())
    }
}

async fn wait_bounded(tool: Tool, child: &mut Child, limit: Duration) -> PipelineResult<()> {
    let status = match tokio::time::timeout(limit, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(err)) => return Err(PipelineError::process(tool, ProcessFailure::Io(err))),
        Err(_) => {
            child.start_kill().ok();
            return Err(PipelineError::process(tool, ProcessFailure::TimedOut(limit)));
        }
    };
    if status.success() {
        Ok(())
    } else {
        warn!(%tool, %status, "stream process failed");
        Err(PipelineError::process(tool, ProcessFailure::Exited(status.code())))
    }
}

enum SessionState {
    Running {
        chunks: ReaderStream<ChildStdout>,
        processes: ProcessPair,
    },
    Reaping(Pin<Box<dyn Future<Output = PipelineResult<()>> + Send>>),
    Done,
}

/// Live audio produced by a running downloader/encoder pair.
pub struct StreamSession {
    state: SessionState,
    /// Chunk read while starting up, yielded before anything else.
    pending: Option<Bytes>,
    idle_timeout: Duration,
    idle: Pin<Box<Sleep>>,
    /// Whether the idle deadline covers the current wait for output.
    waiting: bool,
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            SessionState::Running { .. } => "running",
            SessionState::Reaping(_) => "reaping",
            SessionState::Done => "done",
        };
        f.debug_struct("StreamSession")
            .field("state", &state)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

impl StreamSession {
    fn new(processes: ProcessPair, output: ChildStdout, idle_timeout: Duration) -> Self {
        Self {
            state: SessionState::Running {
                chunks: ReaderStream::with_capacity(output, CHUNK_SIZE),
                processes,
            },
            pending: None,
            idle_timeout,
            idle: Box::pin(tokio::time::sleep(idle_timeout)),
            waiting: false,
        }
    }

    /// `(downloader, encoder)` process ids while both are running.
    pub fn process_ids(&self) -> Option<(u32, u32)> {
        match &self.state {
            SessionState::Running { processes, .. } => processes.ids(),
            _ => None,
        }
    }

    fn begin_reaping(&mut self) {
        if let SessionState::Running { processes, .. } =
            std::mem::replace(&mut self.state, SessionState::Done)
        {
            self.state = SessionState::Reaping(Box::pin(processes.finish(self.idle_timeout)));
        }
    }

    fn abort(&mut self) {
        if let SessionState::Running { processes, .. } =
            std::mem::replace(&mut self.state, SessionState::Done)
        {
            processes.terminate();
        }
    }
}

impl Stream for StreamSession {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if let Some(chunk) = this.pending.take() {
            return Poll::Ready(Some(Ok(chunk)));
        }
        loop {
            let polled = match &mut this.state {
                SessionState::Running { chunks, .. } => {
                    // Time spent by a slow consumer does not count as a stall.
                    if !this.waiting {
                        this.waiting = true;
                        let deadline = Instant::now() + this.idle_timeout;
                        this.idle.as_mut().reset(deadline);
                    }
                    Pin::new(chunks).poll_next(cx)
                }
                SessionState::Reaping(finish) => {
                    let result = match finish.as_mut().poll(cx) {
                        Poll::Ready(result) => result,
                        Poll::Pending => return Poll::Pending,
                    };
                    this.state = SessionState::Done;
                    return match result {
                        Ok(()) => {
                            info!("stream finished");
                            Poll::Ready(None)
                        }
                        Err(err) => Poll::Ready(Some(Err(io::Error::other(err)))),
                    };
                }
                SessionState::Done => return Poll::Ready(None),
            };

            match polled {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.waiting = false;
                    return Poll::Ready(Some(Ok(chunk)));
                }
                Poll::Ready(Some(Err(err))) => {
                    warn!(%err, "reading encoder output failed");
                    this.abort();
                    let failure = PipelineError::process(Tool::Encoder, ProcessFailure::Io(err));
                    return Poll::Ready(Some(Err(io::Error::other(failure))));
                }
                Poll::Ready(None) => this.begin_reaping(),
                Poll::Pending => {
                    if this.idle.as_mut().poll(cx).is_ready() {
                        warn!(
                            idle_secs = this.idle_timeout.as_secs(),
                            "stream stalled, terminating"
                        );
                        this.abort();
                        let failure = PipelineError::process(
                            Tool::Downloader,
                            ProcessFailure::TimedOut(this.idle_timeout),
                        );
                        return Poll::Ready(Some(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            failure,
                        ))));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if matches!(self.state, SessionState::Running { .. }) {
            debug!("stream consumer went away, terminating processes");
        }
        self.abort();
    }
}
