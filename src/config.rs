#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use crate::{
    cleanup::CleanupPolicy,
    logging::LogFormat,
    metadata::MAX_SEARCH_RESULTS,
    pipeline::PipelineTimeouts,
    process::Toolchain,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_WORK_DIR: &str = "./downloads";
pub const DEFAULT_DOWNLOADER: &str = "yt-dlp";
pub const DEFAULT_ENCODER: &str = "ffmpeg";
pub const DEFAULT_METADATA_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 900;
pub const DEFAULT_TRANSCODE_TIMEOUT_SECS: u64 = 900;
pub const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_CLEANUP_GRACE_SECS: u64 = 30;
pub const DEFAULT_SEARCH_LIMIT: usize = 5;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub work_dir: PathBuf,
    /// Bundled frontend; `None` serves the welcome text at `/`.
    pub www_root: Option<PathBuf>,
    pub downloader: PathBuf,
    pub encoder: PathBuf,
    pub timeouts: PipelineTimeouts,
    pub cleanup_grace: Duration,
    pub cleanup_policy: CleanupPolicy,
    pub search_limit: usize,
    pub log_format: LogFormat,
}

impl ServiceConfig {
    pub fn toolchain(&self) -> Toolchain {
        Toolchain::new(&self.downloader, &self.encoder)
    }
}

/// Values given on the command line; they win over everything else.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub work_dir: Option<PathBuf>,
    pub www_root: Option<PathBuf>,
    pub downloader: Option<PathBuf>,
    pub encoder: Option<PathBuf>,
    pub cleanup_policy: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn load_config(overrides: ConfigOverrides) -> Result<ServiceConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_config(&file_vars, env_var_string, overrides)
}

fn build_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: ConfigOverrides,
) -> Result<ServiceConfig> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let text = |cli: Option<String>, key: &str| {
        cli.map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| lookup(key))
    };
    let path = |cli: Option<PathBuf>, key: &str| {
        cli.filter(|value| !value.as_os_str().is_empty())
            .or_else(|| lookup(key).map(PathBuf::from))
    };
    let secs = |key: &str, default: u64| {
        Duration::from_secs(parsed_or(lookup(key), default).max(1))
    };

    let cleanup_policy = match text(overrides.cleanup_policy, "CLEANUP_POLICY") {
        Some(raw) => CleanupPolicy::from_str(&raw).context("Parsing CLEANUP_POLICY")?,
        None => CleanupPolicy::default(),
    };
    let log_format = match lookup("AUDIOPIPE_LOG_FORMAT") {
        Some(raw) => LogFormat::from_str(&raw).context("Parsing AUDIOPIPE_LOG_FORMAT")?,
        None => LogFormat::default(),
    };

    Ok(ServiceConfig {
        host: text(overrides.host, "AUDIOPIPE_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
        port: overrides
            .port
            .unwrap_or_else(|| parsed_or(lookup("AUDIOPIPE_PORT"), DEFAULT_PORT)),
        work_dir: path(overrides.work_dir, "WORK_DIR")
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORK_DIR)),
        www_root: path(overrides.www_root, "WWW_ROOT"),
        downloader: path(overrides.downloader, "YTDLP_BIN")
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOADER)),
        encoder: path(overrides.encoder, "FFMPEG_BIN")
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ENCODER)),
        timeouts: PipelineTimeouts {
            metadata: secs("METADATA_TIMEOUT_SECS", DEFAULT_METADATA_TIMEOUT_SECS),
            download: secs("DOWNLOAD_TIMEOUT_SECS", DEFAULT_DOWNLOAD_TIMEOUT_SECS),
            transcode: secs("TRANSCODE_TIMEOUT_SECS", DEFAULT_TRANSCODE_TIMEOUT_SECS),
            stream_idle: secs("STREAM_IDLE_TIMEOUT_SECS", DEFAULT_STREAM_IDLE_TIMEOUT_SECS),
        },
        cleanup_grace: Duration::from_secs(parsed_or(
            lookup("CLEANUP_GRACE_SECS"),
            DEFAULT_CLEANUP_GRACE_SECS,
        )),
        cleanup_policy,
        search_limit: parsed_or(lookup("SEARCH_LIMIT"), DEFAULT_SEARCH_LIMIT)
            .clamp(1, MAX_SEARCH_RESULTS),
        log_format,
    })
}

/// Unparseable values fall back to `default`.
fn parsed_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(non_blank)
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned().and_then(non_blank))
}

/// Parses `KEY=value` lines; `export`, quotes and `#` comments are accepted.
/// A missing file is an empty set.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
