#![forbid(unsafe_code)]

//! "quality" executor: download the best raw audio, then transcode it with
//! the dedicated encoder.
//!
//! The raw intermediate is deleted as soon as the encoder succeeds. When the
//! encoder fails, both the intermediate and any partial output are removed
//! before the error is returned.

use std::time::Duration;

use tracing::{info, warn};

use crate::{
    artifact::{ArtifactFile, RequestWorkspace, locate_artifact, remove_file_quietly},
    encoder,
    error::{PipelineError, PipelineResult, Tool},
    process::{Capture, Toolchain, run_bounded},
    request::DownloadRequest,
};

const RAW_ROLE: &str = "raw";
const ENCODED_ROLE: &str = "encoded";

#[derive(Debug, Clone, Copy)]
pub struct TranscodeTimeouts {
    pub download: Duration,
    pub encode: Duration,
}

pub fn raw_download_args(source_url: &str, template: &str) -> Vec<String> {
    [
        "-f",
        "bestaudio[ext=m4a]/bestaudio",
        "--no-playlist",
        "--no-progress",
        "--no-warnings",
        "-o",
        template,
        "--",
        source_url,
    ]
    .map(str::to_string)
    .to_vec()
}

pub fn encode_args(request: &DownloadRequest, input: &str, output: &str) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin", "-y", "-i", input]
        .map(str::to_string)
        .to_vec();
    args.extend(encoder::output_args(request.format(), request.bitrate()));
    args.push(output.to_string());
    args
}

pub async fn transcode(
    tools: &Toolchain,
    workspace: &RequestWorkspace,
    request: &DownloadRequest,
    title: &str,
    timeouts: TranscodeTimeouts,
) -> PipelineResult<ArtifactFile> {
    // Step 1: fetch raw audio. Nothing to clean up if this fails.
    let raw_marker = workspace.marker(RAW_ROLE);
    let template = workspace.output_template(&raw_marker);
    let mut command = tools.command(Tool::Downloader);
    command.args(raw_download_args(
        request.source_url(),
        &template.to_string_lossy(),
    ));
    run_bounded(Tool::Downloader, command, timeouts.download, Capture::Discard)
        .await
        .map_err(|failure| PipelineError::process(Tool::Downloader, failure))?;
    let raw = locate_artifact(workspace.dir(), &raw_marker).await?;

    // Step 2: encode into a scratch name, then promote.
    let encoded = workspace.scratch_path(&workspace.marker(ENCODED_ROLE), request.format().extension());
    let mut command = tools.command(Tool::Encoder);
    command.args(encode_args(
        request,
        &raw.path().to_string_lossy(),
        &encoded.to_string_lossy(),
    ));
    let outcome = run_bounded(Tool::Encoder, command, timeouts.encode, Capture::Discard).await;

    raw.remove().await;
    if let Err(failure) = outcome {
        remove_file_quietly(&encoded).await;
        warn!(%failure, "transcode failed, intermediates removed");
        return Err(PipelineError::process(Tool::Encoder, failure));
    }

    let artifact = ArtifactFile::raw(encoded)
        .promote(workspace.final_path(title, request.format()))
        .await?;
    info!(path = %artifact.path().display(), "transcode finished");
    Ok(artifact)
}
