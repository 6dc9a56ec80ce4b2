#![forbid(unsafe_code)]

//! Validated input contract handed to the pipeline by the HTTP layer.
//!
//! `DownloadQuery` mirrors the raw query string. `DownloadRequest` is only
//! constructed through validation and never changes afterwards.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

pub const DEFAULT_FORMAT: AudioFormat = AudioFormat::Mp3;
pub const DEFAULT_BITRATE: Bitrate = Bitrate::K320;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Mp3,
    Aac,
    Alac,
    Flac,
    Wav,
    Ogg,
}

impl AudioFormat {
    pub const ALL: [AudioFormat; 6] = [
        Self::Mp3,
        Self::Aac,
        Self::Alac,
        Self::Flac,
        Self::Wav,
        Self::Ogg,
    ];

    /// Formats the downloader's own extraction path encodes well enough.
    pub const FAST: [AudioFormat; 2] = [Self::Mp3, Self::Aac];

    /// Formats that need the dedicated encoder for precise control.
    pub const QUALITY: [AudioFormat; 4] = [Self::Alac, Self::Flac, Self::Wav, Self::Ogg];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Aac => "aac",
            Self::Alac => "alac",
            Self::Flac => "flac",
            Self::Wav => "wav",
            Self::Ogg => "ogg",
        }
    }

    pub fn is_fast(self) -> bool {
        Self::FAST.contains(&self)
    }

    /// Lossy codecs accept a bitrate; lossless ones ignore it entirely.
    pub fn accepts_bitrate(self) -> bool {
        matches!(self, Self::Mp3 | Self::Aac | Self::Ogg)
    }

    /// Extension of the final artifact. ALAC lives in an MP4 container.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Alac => "m4a",
            other => other.as_str(),
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Mp3 => "audio/mpeg",
            Self::Aac => "audio/aac",
            Self::Alac => "audio/mp4",
            Self::Flac => "audio/flac",
            Self::Wav => "audio/wav",
            Self::Ogg => "audio/ogg",
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioFormat {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|format| format.as_str() == normalized)
            .ok_or_else(|| {
                PipelineError::validation(format!(
                    "Invalid audio format. Allowed values are: {}",
                    join(Self::ALL.iter().map(|format| format.as_str()))
                ))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bitrate {
    K128,
    K192,
    K256,
    K320,
}

impl Bitrate {
    pub const ALL: [Bitrate; 4] = [Self::K128, Self::K192, Self::K256, Self::K320];

    pub fn kbps(self) -> u32 {
        match self {
            Self::K128 => 128,
            Self::K192 => 192,
            Self::K256 => 256,
            Self::K320 => 320,
        }
    }
}

impl fmt::Display for Bitrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kbps())
    }
}

impl FromStr for Bitrate {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let trimmed = trimmed
            .strip_suffix(['k', 'K'])
            .unwrap_or(trimmed);
        Self::ALL
            .into_iter()
            .find(|bitrate| bitrate.kbps().to_string() == trimmed)
            .ok_or_else(|| {
                PipelineError::validation(format!(
                    "Invalid bitrate. Allowed values are: {}",
                    join(Self::ALL.iter().map(|bitrate| bitrate.kbps().to_string()))
                ))
            })
    }
}

impl Serialize for Bitrate {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Execution method requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Auto,
    Fast,
    Quality,
    Stream,
}

impl Strategy {
    pub const ALL: [Strategy; 4] = [Self::Auto, Self::Fast, Self::Quality, Self::Stream];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Fast => "fast",
            Self::Quality => "quality",
            Self::Stream => "stream",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == normalized)
            .ok_or_else(|| {
                PipelineError::validation(format!(
                    "Invalid method. Allowed values are: {}",
                    join(Self::ALL.iter().map(|strategy| strategy.as_str()))
                ))
            })
    }
}

/// Raw `/download` query parameters exactly as they arrive over HTTP.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DownloadQuery {
    pub url: Option<String>,
    pub format: Option<String>,
    pub bitrate: Option<String>,
    pub method: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    source_url: String,
    format: AudioFormat,
    bitrate: Option<Bitrate>,
    strategy: Strategy,
}

impl DownloadRequest {
    /// Builds a request from already-typed values. The bitrate is kept only
    /// when the format is bitrate-sensitive, falling back to the default.
    pub fn new(
        source_url: &str,
        format: AudioFormat,
        bitrate: Option<Bitrate>,
        strategy: Strategy,
    ) -> Result<Self, PipelineError> {
        let source_url = validate_source_url(source_url)?;
        let bitrate = format
            .accepts_bitrate()
            .then(|| bitrate.unwrap_or(DEFAULT_BITRATE));
        Ok(Self {
            source_url,
            format,
            bitrate,
            strategy,
        })
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// `Some` exactly when the format accepts a bitrate.
    pub fn bitrate(&self) -> Option<Bitrate> {
        self.bitrate
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }
}

impl TryFrom<DownloadQuery> for DownloadRequest {
    type Error = PipelineError;

    fn try_from(query: DownloadQuery) -> Result<Self, Self::Error> {
        let url = non_blank(query.url.as_deref()).ok_or_else(|| {
            PipelineError::validation("Please provide a valid URL using the 'url' parameter.")
        })?;
        let format = match non_blank(query.format.as_deref()) {
            Some(value) => value.parse()?,
            None => DEFAULT_FORMAT,
        };
        let strategy = match non_blank(query.method.as_deref()) {
            Some(value) => value.parse()?,
            None => Strategy::Auto,
        };
        // Lossless formats ignore the bitrate, so a bogus value is not an error there.
        let bitrate = match non_blank(query.bitrate.as_deref()) {
            Some(value) if format.accepts_bitrate() => Some(value.parse()?),
            _ => None,
        };
        Self::new(url, format, bitrate, strategy)
    }
}

fn validate_source_url(raw: &str) -> Result<String, PipelineError> {
    let trimmed = raw.trim();
    let lowered = trimmed.to_ascii_lowercase();
    let has_scheme = lowered.starts_with("http://") || lowered.starts_with("https://");
    if !has_scheme || trimmed.chars().any(char::is_whitespace) {
        return Err(PipelineError::validation(
            "Please provide a valid http(s) URL using the 'url' parameter.",
        ));
    }
    Ok(trimmed.to_string())
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn join<I, S>(values: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    values
        .into_iter()
        .map(|value| value.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Static description served by `/formats`.
#[derive(Debug, Clone, Serialize)]
pub struct FormatCatalog {
    pub formats: FormatGroups,
    pub bitrates: Vec<Bitrate>,
    pub methods: Vec<Strategy>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FormatGroups {
    pub fast: FormatGroup,
    pub quality: FormatGroup,
}

#[derive(Debug, Clone, Serialize)]
pub struct FormatGroup {
    pub formats: Vec<AudioFormat>,
    pub description: &'static str,
    pub recommended_for: &'static str,
}

impl FormatCatalog {
    pub fn current() -> Self {
        Self {
            formats: FormatGroups {
                fast: FormatGroup {
                    formats: AudioFormat::FAST.to_vec(),
                    description: "Fastest processing using the downloader's own extraction",
                    recommended_for: "General use, quick downloads, live streaming",
                },
                quality: FormatGroup {
                    formats: AudioFormat::QUALITY.to_vec(),
                    description: "Highest quality using a dedicated encoder pass; alac is delivered as .m4a (MP4 container)",
                    recommended_for: "Audiophiles, archival purposes",
                },
            },
            bitrates: Bitrate::ALL.to_vec(),
            methods: Strategy::ALL.to_vec(),
        }
    }
}
