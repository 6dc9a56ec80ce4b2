#![forbid(unsafe_code)]

//! Audio download service: resolve a media URL, fetch its audio with an
//! external downloader, optionally transcode it with an external encoder, and
//! hand back either a finished file or a live byte stream.

pub mod artifact;
pub mod cleanup;
pub mod config;
pub mod encoder;
pub mod error;
pub mod extract;
pub mod logging;
pub mod metadata;
pub mod pipeline;
pub mod process;
pub mod request;
pub mod strategy;
pub mod stream;
pub mod transcode;

#[cfg(test)]
mod testing;
