#![forbid(unsafe_code)]

//! "fast" executor: the downloader extracts and encodes audio in one run.

use std::time::Duration;

use tracing::info;

use crate::{
    artifact::{ArtifactFile, RequestWorkspace, locate_artifact},
    error::{PipelineError, PipelineResult, Tool},
    process::{Capture, Toolchain, run_bounded},
    request::{AudioFormat, DownloadRequest},
};

const MARKER_ROLE: &str = "extract";

/// Name the downloader's `--audio-format` flag uses for `format`.
pub fn downloader_codec(format: AudioFormat) -> &'static str {
    match format {
        AudioFormat::Ogg => "vorbis",
        other => other.as_str(),
    }
}

/// Downloader arguments for a one-step extraction into `template`.
pub fn extract_args(request: &DownloadRequest, template: &str) -> Vec<String> {
    let mut args = vec![
        "-f".to_string(),
        "bestaudio".to_string(),
        "--extract-audio".to_string(),
        "--audio-format".to_string(),
        downloader_codec(request.format()).to_string(),
    ];
    if let Some(bitrate) = request.bitrate() {
        args.push("--audio-quality".to_string());
        args.push(format!("{}K", bitrate.kbps()));
    }
    args.extend(
        [
            "--no-playlist",
            "--no-progress",
            "--no-warnings",
            "-o",
            template,
            "--",
            request.source_url(),
        ]
        .map(str::to_string),
    );
    args
}

/// Runs the extraction and moves the result to `{title}.{ext}` inside the
/// workspace. The downloader decides the real extension, so the output is
/// found through the marker rather than predicted.
pub async fn extract_direct(
    tools: &Toolchain,
    workspace: &RequestWorkspace,
    request: &DownloadRequest,
    title: &str,
    timeout: Duration,
) -> PipelineResult<ArtifactFile> {
    let marker = workspace.marker(MARKER_ROLE);
    let template = workspace.output_template(&marker);

    let mut command = tools.command(Tool::Downloader);
    command.args(extract_args(request, &template.to_string_lossy()));
    run_bounded(Tool::Downloader, command, timeout, Capture::Discard)
        .await
        .map_err(|failure| PipelineError::process(Tool::Downloader, failure))?;

    let produced = locate_artifact(workspace.dir(), &marker).await?;
    let target = workspace.final_path(title, request.format());
    let artifact = produced.promote(target).await?;
    info!(path = %artifact.path().display(), "direct extraction finished");
    Ok(artifact)
}
