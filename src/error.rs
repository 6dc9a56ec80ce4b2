#![forbid(unsafe_code)]

//! Error taxonomy shared by every stage of the download pipeline.

use std::{fmt, io, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::request::{AudioFormat, Strategy};

pub type PipelineResult<T> = Result<T, PipelineError>;

/// External programs the pipeline drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Downloader,
    Encoder,
}

impl Tool {
    pub fn name(self) -> &'static str {
        match self {
            Self::Downloader => "downloader",
            Self::Encoder => "encoder",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why an external process did not produce a usable result.
#[derive(Debug, Error)]
pub enum ProcessFailure {
    #[error("could not be started: {0}")]
    Spawn(#[source] io::Error),
    #[error("exited with {}", describe_exit(.0))]
    Exited(Option<i32>),
    #[error("timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
    #[error("i/o failure while running: {0}")]
    Io(#[source] io::Error),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad or missing input. Nothing was spawned.
    #[error("{0}")]
    Validation(String),

    #[error("metadata fetch failed for {url}: {reason}")]
    MetadataFetch { url: String, reason: String },

    #[error("{tool} {failure}")]
    ExternalProcess { tool: Tool, failure: ProcessFailure },

    /// Zero or several files matched the marker after the downloader exited.
    #[error("expected exactly one artifact matching {marker}, found {candidates}")]
    ArtifactNotFound { marker: String, candidates: usize },

    #[error("method {strategy} is not supported for {format}")]
    UnsupportedStrategy {
        format: AudioFormat,
        strategy: Strategy,
    },

    #[error("filesystem error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl PipelineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn process(tool: Tool, failure: ProcessFailure) -> Self {
        Self::ExternalProcess { tool, failure }
    }

    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Errors caused by the caller's input. Everything else is a server-side failure.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::UnsupportedStrategy { .. }
        )
    }
}
