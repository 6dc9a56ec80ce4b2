#![forbid(unsafe_code)]

//! Request orchestration: validated request in, finished file or live stream out.

use std::{path::PathBuf, time::Duration};

use tracing::{info, warn};

use crate::{
    artifact::{ArtifactFile, WorkDir},
    error::PipelineResult,
    extract::extract_direct,
    metadata::{MetadataResolver, SearchResult},
    process::Toolchain,
    request::{AudioFormat, DownloadRequest},
    strategy::{ExecutionStrategy, select_strategy},
    stream::{StreamSession, start_stream},
    transcode::{TranscodeTimeouts, transcode},
};

/// Bounds for every kind of external-process wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineTimeouts {
    pub metadata: Duration,
    pub download: Duration,
    pub transcode: Duration,
    pub stream_idle: Duration,
}

impl Default for PipelineTimeouts {
    fn default() -> Self {
        Self {
            metadata: Duration::from_secs(60),
            download: Duration::from_secs(900),
            transcode: Duration::from_secs(900),
            stream_idle: Duration::from_secs(60),
        }
    }
}

/// A file ready to be sent. `scope` is the request workspace to hand to the
/// cleanup sweeper once the body has been delivered.
#[derive(Debug)]
pub struct FinishedDownload {
    pub artifact: ArtifactFile,
    pub title: String,
    pub format: AudioFormat,
    pub scope: PathBuf,
}

impl FinishedDownload {
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.title, self.format.extension())
    }
}

#[derive(Debug)]
pub struct StreamedAudio {
    pub session: StreamSession,
    pub title: String,
    pub format: AudioFormat,
}

impl StreamedAudio {
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.title, self.format.extension())
    }
}

#[derive(Debug)]
pub enum PipelineOutput {
    File(FinishedDownload),
    Stream(StreamedAudio),
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    tools: Toolchain,
    work_dir: WorkDir,
    resolver: MetadataResolver,
    timeouts: PipelineTimeouts,
}

impl Pipeline {
    pub fn new(tools: Toolchain, work_dir: WorkDir, timeouts: PipelineTimeouts) -> Self {
        let resolver = MetadataResolver::new(tools.clone(), timeouts.metadata);
        Self {
            tools,
            work_dir,
            resolver,
            timeouts,
        }
    }

    pub fn work_dir(&self) -> &WorkDir {
        &self.work_dir
    }

    pub async fn search(&self, query: &str, limit: usize) -> PipelineResult<Vec<SearchResult>> {
        self.resolver.search(query, limit).await
    }

    /// Runs one request end to end.
    ///
    /// The strategy is decided before anything is spawned, so disallowed
    /// combinations fail without side effects. On any executor failure the
    /// request workspace is removed before the error is returned; if the
    /// returned future is dropped instead, the workspace guard removes it.
    pub async fn run(&self, request: &DownloadRequest) -> PipelineResult<PipelineOutput> {
        let strategy = select_strategy(request.format(), request.strategy())?;
        info!(
            url = request.source_url(),
            format = %request.format(),
            bitrate = ?request.bitrate(),
            requested = %request.strategy(),
            %strategy,
            "starting download"
        );

        let metadata = self.resolver.resolve(request.source_url()).await?;
        let title = metadata.title;

        if strategy == ExecutionStrategy::Stream {
            let session = start_stream(&self.tools, request, self.timeouts.stream_idle).await?;
            return Ok(PipelineOutput::Stream(StreamedAudio {
                session,
                title,
                format: request.format(),
            }));
        }

        let workspace = self.work_dir.open_request().await?.guarded();
        let produced = match strategy {
            ExecutionStrategy::Fast => {
                extract_direct(
                    &self.tools,
                    &workspace,
                    request,
                    &title,
                    self.timeouts.download,
                )
                .await
            }
            _ => {
                let timeouts = TranscodeTimeouts {
                    download: self.timeouts.download,
                    encode: self.timeouts.transcode,
                };
                transcode(&self.tools, &workspace, request, &title, timeouts).await
            }
        };

        let workspace = workspace.release();
        match produced {
            Ok(artifact) => Ok(PipelineOutput::File(FinishedDownload {
                artifact,
                title,
                format: request.format(),
                scope: workspace.dir().to_path_buf(),
            })),
            Err(err) => {
                warn!(%err, %strategy, "download failed, discarding workspace");
                workspace.discard().await;
                Err(err)
            }
        }
    }
}
