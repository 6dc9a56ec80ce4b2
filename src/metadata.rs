#![forbid(unsafe_code)]

//! Metadata-only downloader invocations: title/duration lookup and search.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    error::{PipelineError, PipelineResult, ProcessFailure, Tool},
    process::{Capture, Toolchain, run_bounded},
};

/// Longest title (in characters) kept after sanitization.
pub const MAX_TITLE_CHARS: usize = 200;
pub const FALLBACK_TITLE: &str = "audio";
/// Upper bound for `ytsearchN:` regardless of configuration.
pub const MAX_SEARCH_RESULTS: usize = 25;

const FORBIDDEN_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VideoMetadata {
    /// Filesystem-safe display title.
    pub title: String,
    /// Length in whole seconds when the source reports one.
    pub duration: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub title: Option<String>,
    pub url: Option<String>,
    pub thumbnail: Option<String>,
    pub duration: Option<f64>,
}

/// Subset of the downloader's JSON dump we care about.
#[derive(Debug, Deserialize)]
struct InfoDump {
    title: Option<String>,
    duration: Option<f64>,
    webpage_url: Option<String>,
    thumbnail: Option<String>,
}

/// Strips characters that are illegal in file names, trims, and caps the
/// length. Idempotent: sanitizing a sanitized title returns it unchanged.
pub fn sanitize_title(raw: &str) -> String {
    let stripped: String = raw
        .chars()
        .filter(|c| !FORBIDDEN_CHARS.contains(c) && !c.is_control())
        .collect();
    let capped: String = stripped.trim().chars().take(MAX_TITLE_CHARS).collect();
    let title = capped.trim();
    if title.is_empty() {
        FALLBACK_TITLE.to_string()
    } else {
        title.to_string()
    }
}

fn whole_seconds(duration: Option<f64>) -> Option<u64> {
    duration
        .filter(|value| value.is_finite() && *value >= 0.0)
        .map(|value| value.round() as u64)
}

#[derive(Debug, Clone)]
pub struct MetadataResolver {
    tools: Toolchain,
    timeout: Duration,
}

impl MetadataResolver {
    pub fn new(tools: Toolchain, timeout: Duration) -> Self {
        Self { tools, timeout }
    }

    /// Asks the downloader for a metadata dump of `url`.
    pub async fn resolve(&self, url: &str) -> PipelineResult<VideoMetadata> {
        let mut command = self.tools.command(Tool::Downloader);
        command
            .arg("--dump-json")
            .arg("--skip-download")
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--")
            .arg(url);

        let stdout = run_bounded(Tool::Downloader, command, self.timeout, Capture::Stdout)
            .await
            .map_err(|failure| fetch_error(url, &failure))?;

        let info: InfoDump = serde_json::from_slice(&stdout).map_err(|err| {
            PipelineError::MetadataFetch {
                url: url.to_string(),
                reason: format!("unparseable metadata dump: {err}"),
            }
        })?;

        let metadata = VideoMetadata {
            title: sanitize_title(info.title.as_deref().unwrap_or(FALLBACK_TITLE)),
            duration: whole_seconds(info.duration),
        };
        info!(url, title = %metadata.title, duration = ?metadata.duration, "resolved metadata");
        Ok(metadata)
    }

    /// Runs the downloader's search mode. Lines that are not valid JSON are skipped.
    pub async fn search(&self, query: &str, limit: usize) -> PipelineResult<Vec<SearchResult>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(PipelineError::validation(
                "Please provide a search term using the 'query' parameter.",
            ));
        }
        let limit = limit.clamp(1, MAX_SEARCH_RESULTS);
        let target = format!("ytsearch{limit}:{query}");

        let mut command = self.tools.command(Tool::Downloader);
        command
            .arg("--ignore-errors")
            .arg("--dump-json")
            .arg("--skip-download")
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg(&target);

        let stdout = run_bounded(Tool::Downloader, command, self.timeout, Capture::Stdout)
            .await
            .map_err(|failure| fetch_error(&target, &failure))?;

        let results: Vec<SearchResult> = String::from_utf8_lossy(&stdout)
            .lines()
            .filter_map(|line| {
                let parsed = serde_json::from_str::<InfoDump>(line.trim());
                if let Err(err) = &parsed {
                    debug!(%err, "skipping unparseable search line");
                }
                parsed.ok()
            })
            .take(limit)
            .map(|info| SearchResult {
                title: info.title,
                url: info.webpage_url,
                thumbnail: info.thumbnail,
                duration: info.duration,
            })
            .collect();
        Ok(results)
    }
}

fn fetch_error(url: &str, failure: &ProcessFailure) -> PipelineError {
    PipelineError::MetadataFetch {
        url: url.to_string(),
        reason: format!("downloader {failure}"),
    }
}
