#![forbid(unsafe_code)]

//! Per-format encoder parameters.
//!
//! | format | codec        | extra                                 | muxer  |
//! |--------|--------------|---------------------------------------|--------|
//! | mp3    | `libmp3lame` | `-b:a {kbps}k -joint_stereo 1`        | `mp3`  |
//! | aac    | `aac`        | `-b:a {kbps}k -profile:a aac_low`     | `adts` |
//! | alac   | `alac`       |                                       | `ipod` |
//! | flac   | `flac`       | `-compression_level 8`                | `flac` |
//! | wav    | `pcm_s16le`  |                                       | `wav`  |
//! | ogg    | `libvorbis`  | `-b:a {kbps}k`                        | `ogg`  |
//!
//! Every format is normalized to 44.1 kHz stereo. The muxer is always given
//! explicitly so the output name never has to carry the container.

use crate::request::{AudioFormat, Bitrate, DEFAULT_BITRATE};

pub const SAMPLE_RATE_HZ: u32 = 44_100;
pub const CHANNELS: u32 = 2;

pub fn codec(format: AudioFormat) -> &'static str {
    match format {
        AudioFormat::Mp3 => "libmp3lame",
        AudioFormat::Aac => "aac",
        AudioFormat::Alac => "alac",
        AudioFormat::Flac => "flac",
        AudioFormat::Wav => "pcm_s16le",
        AudioFormat::Ogg => "libvorbis",
    }
}

pub fn muxer(format: AudioFormat) -> &'static str {
    match format {
        AudioFormat::Mp3 => "mp3",
        AudioFormat::Aac => "adts",
        AudioFormat::Alac => "ipod",
        AudioFormat::Flac => "flac",
        AudioFormat::Wav => "wav",
        AudioFormat::Ogg => "ogg",
    }
}

/// Codec, quality, normalization and muxer arguments for `format`.
/// The bitrate is only consulted for formats that accept one.
pub fn output_args(format: AudioFormat, bitrate: Option<Bitrate>) -> Vec<String> {
    let mut args = strings(&["-vn", "-c:a", codec(format)]);

    if format.accepts_bitrate() {
        let kbps = bitrate.unwrap_or(DEFAULT_BITRATE).kbps();
        args.push("-b:a".to_string());
        args.push(format!("{kbps}k"));
    }

    let extra: &[&str] = match format {
        AudioFormat::Mp3 => &["-joint_stereo", "1"],
        AudioFormat::Aac => &["-profile:a", "aac_low"],
        AudioFormat::Flac => &["-compression_level", "8"],
        AudioFormat::Alac | AudioFormat::Wav | AudioFormat::Ogg => &[],
    };
    args.extend(strings(extra));

    args.push("-ar".to_string());
    args.push(SAMPLE_RATE_HZ.to_string());
    args.push("-ac".to_string());
    args.push(CHANNELS.to_string());
    args.extend(strings(&["-f", muxer(format)]));
    args
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}
