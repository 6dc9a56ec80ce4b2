#![forbid(unsafe_code)]

//! Stub downloader/encoder scripts used by the unit tests.
//!
//! Each stub appends its argv (one line per invocation) to `calls.log` in the
//! directory it lives in, so tests can assert which programs ran.

use std::{
    fs,
    path::{Path, PathBuf},
};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use crate::process::Toolchain;

pub const STUB_TITLE: &str = "Artist - Song: Live/Remix?";
pub const STUB_TITLE_SANITIZED: &str = "Artist - Song LiveRemix";

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/usr/bin/env bash\nset -eu\n{body}")).unwrap();
    #[cfg(unix)]
    {
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
    }
    path
}

/// Knobs for the fake downloader.
#[derive(Debug, Clone)]
pub struct DownloaderStub {
    pub title: String,
    /// Extension written for raw (non-extracting) downloads.
    pub raw_ext: String,
    /// Exit code for file downloads; `0` succeeds.
    pub download_exit: i32,
    /// Exit code for metadata dumps.
    pub metadata_exit: i32,
    /// Shell snippet producing the bytes for `-o -`.
    pub stream_body: String,
    /// Write an additional stray file matching the marker.
    pub duplicate_output: bool,
}

impl Default for DownloaderStub {
    fn default() -> Self {
        Self {
            title: STUB_TITLE.to_string(),
            raw_ext: "webm".to_string(),
            download_exit: 0,
            metadata_exit: 0,
            stream_body: "printf 'stream-bytes'".to_string(),
            duplicate_output: false,
        }
    }
}

/// Knobs for the fake encoder.
#[derive(Debug, Clone, Default)]
pub struct EncoderStub {
    /// Write a partial output file and exit 1.
    pub fail: bool,
    /// Write a partial output file and never exit on its own.
    pub hang: bool,
}

pub fn calls_log(dir: &Path) -> PathBuf {
    dir.join("calls.log")
}

pub fn read_calls(dir: &Path) -> Vec<String> {
    fs::read_to_string(calls_log(dir))
        .map(|raw| raw.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

pub fn install_downloader(dir: &Path, stub: &DownloaderStub) -> PathBuf {
    let log = calls_log(dir);
    let script = format!(
        r#"echo "yt-dlp $*" >> '{log}'
args=("$@")
output=""
audio_format=""
extract=0
while [[ $# -gt 0 ]]; do
  case "$1" in
    -o|--output) shift; output="$1" ;;
    --audio-format) shift; audio_format="$1" ;;
    --extract-audio|-x) extract=1 ;;
  esac
  shift
done

if printf '%s\n' "${{args[@]}}" | grep -q -- '--dump-json'; then
  if [[ {metadata_exit} -ne 0 ]]; then
    echo "ERROR: unavailable" >&2
    exit {metadata_exit}
  fi
  if printf '%s\n' "${{args[@]}}" | grep -q '^ytsearch'; then
    echo '{{"title":"First","webpage_url":"https://example.com/1","thumbnail":"https://img/1.jpg","duration":61}}'
    echo 'not json at all'
    echo '{{"title":"Second","webpage_url":"https://example.com/2","duration":12.5}}'
    exit 0
  fi
  cat <<'JSON'
{{"id":"abc","title":{title_json},"duration":212.4,"webpage_url":"https://example.com/watch"}}
JSON
  exit 0
fi

if [[ "$output" == "-" ]]; then
  {stream_body}
  exit 0
fi

if [[ {download_exit} -ne 0 ]]; then
  echo "ERROR: download failed" >&2
  exit {download_exit}
fi

if [[ $extract -eq 1 ]]; then
  ext="$audio_format"
  if [[ "$ext" == "aac" ]]; then ext="m4a"; fi
  if [[ "$ext" == "vorbis" ]]; then ext="ogg"; fi
else
  ext="{raw_ext}"
fi
target="${{output//%(ext)s/$ext}}"
printf 'audio-data' > "$target"
if [[ {duplicate} -eq 1 ]]; then
  printf 'stray' > "${{output//%(ext)s/part2.opus}}"
fi
exit 0
"#,
        log = log.display(),
        metadata_exit = stub.metadata_exit,
        title_json = serde_json::to_string(&stub.title).unwrap(),
        stream_body = stub.stream_body,
        download_exit = stub.download_exit,
        raw_ext = stub.raw_ext,
        duplicate = i32::from(stub.duplicate_output),
    );
    write_script(dir, "yt-dlp", &script)
}

pub fn install_encoder(dir: &Path, stub: &EncoderStub) -> PathBuf {
    let log = calls_log(dir);
    let script = format!(
        r#"echo "ffmpeg $*" >> '{log}'
input=""
args=("$@")
while [[ $# -gt 0 ]]; do
  case "$1" in
    -i) shift; input="$1" ;;
  esac
  shift
done
output="${{args[${{#args[@]}}-1]}}"

if [[ "$output" == "pipe:1" ]]; then
  exec cat
fi

if [[ ! -f "$input" ]]; then
  echo "missing input $input" >&2
  exit 1
fi

if [[ {hang} -eq 1 ]]; then
  printf 'partial' > "$output"
  exec sleep 30
fi

if [[ {fail} -eq 1 ]]; then
  printf 'partial' > "$output"
  echo "encode failed" >&2
  exit 1
fi

printf 'encoded:' > "$output"
cat "$input" >> "$output"
exit 0
"#,
        log = log.display(),
        fail = i32::from(stub.fail),
        hang = i32::from(stub.hang),
    );
    write_script(dir, "ffmpeg", &script)
}

/// Installs both stubs into `dir` and returns a toolchain pointing at them.
pub fn stub_toolchain(dir: &Path, downloader: &DownloaderStub, encoder: &EncoderStub) -> Toolchain {
    Toolchain::new(
        install_downloader(dir, downloader),
        install_encoder(dir, encoder),
    )
}
