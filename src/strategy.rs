#![forbid(unsafe_code)]

use std::fmt;

use crate::{
    error::PipelineError,
    request::{AudioFormat, Strategy},
};

/// Concrete executor a request runs on once `auto` has been resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    /// Downloader extracts and encodes in one step.
    Fast,
    /// Downloader fetches raw audio, encoder transcodes it.
    Quality,
    /// Downloader piped into the encoder, output streamed live.
    Stream,
}

impl ExecutionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Quality => "quality",
            Self::Stream => "stream",
        }
    }
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps the requested method onto an executor.
///
/// `auto` picks `fast` for the fast-format set and `quality` otherwise.
/// `stream` must be asked for explicitly and only works for fast formats,
/// since the transcode path needs a finished intermediate file.
pub fn select_strategy(
    format: AudioFormat,
    requested: Strategy,
) -> Result<ExecutionStrategy, PipelineError> {
    match requested {
        Strategy::Auto if format.is_fast() => Ok(ExecutionStrategy::Fast),
        Strategy::Auto => Ok(ExecutionStrategy::Quality),
        Strategy::Fast => Ok(ExecutionStrategy::Fast),
        Strategy::Quality => Ok(ExecutionStrategy::Quality),
        Strategy::Stream if format.is_fast() => Ok(ExecutionStrategy::Stream),
        Strategy::Stream => Err(PipelineError::UnsupportedStrategy {
            format,
            strategy: requested,
        }),
    }
}
