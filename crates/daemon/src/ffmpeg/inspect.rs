//! Transcoder capability queries
//!
//! Short synchronous `ffmpeg` invocations used at startup and for the
//! `report` command. Queries never fail loudly: any spawn error, nonzero exit
//! or unparsable output yields `None`.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Kind of encoder listed by `ffmpeg -encoders`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderKind {
    Audio,
    Video,
}

impl EncoderKind {
    /// Flag character in the first capability column
    fn flag(self) -> char {
        match self {
            EncoderKind::Audio => 'A',
            EncoderKind::Video => 'V',
        }
    }
}

/// One entry of the `ffmpeg -encoders` listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderInfo {
    pub name: String,
    pub description: String,
}

/// Audio codecs the cluster knows how to request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Copy,
    Mp3,
    Aac,
}

impl AudioCodec {
    pub const ALL: [AudioCodec; 3] = [AudioCodec::Copy, AudioCodec::Mp3, AudioCodec::Aac];

    /// Value passed to ffmpeg's `-c:a`
    pub fn as_str(self) -> &'static str {
        match self {
            AudioCodec::Copy => "copy",
            AudioCodec::Mp3 => "mp3",
            AudioCodec::Aac => "aac",
        }
    }

    /// ffmpeg encoders able to produce this codec (empty for stream copy)
    fn encoder_names(self) -> &'static [&'static str] {
        match self {
            AudioCodec::Copy => &[],
            AudioCodec::Mp3 => &["libmp3lame", "mp3", "mp3_mf"],
            AudioCodec::Aac => &["aac", "libfdk_aac", "aac_mf"],
        }
    }
}

/// Video codecs the cluster knows how to request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VideoCodec {
    #[serde(rename = "copy")]
    Copy,
    #[serde(rename = "libx264")]
    X264,
    #[serde(rename = "libx265")]
    X265,
}

impl VideoCodec {
    pub const ALL: [VideoCodec; 3] = [VideoCodec::Copy, VideoCodec::X264, VideoCodec::X265];

    /// Value passed to ffmpeg's `-c:v`
    pub fn as_str(self) -> &'static str {
        match self {
            VideoCodec::Copy => "copy",
            VideoCodec::X264 => "libx264",
            VideoCodec::X265 => "libx265",
        }
    }
}

/// Filter the known audio codecs down to those the listed encoders support.
///
/// Stream copy needs no encoder and is always supported.
pub fn supported_audio_codecs(encoders: &[EncoderInfo]) -> Vec<AudioCodec> {
    AudioCodec::ALL
        .into_iter()
        .filter(|codec| {
            *codec == AudioCodec::Copy
                || encoders
                    .iter()
                    .any(|e| codec.encoder_names().contains(&e.name.as_str()))
        })
        .collect()
}

/// Filter the known video codecs down to those the listed encoders support.
pub fn supported_video_codecs(encoders: &[EncoderInfo]) -> Vec<VideoCodec> {
    VideoCodec::ALL
        .into_iter()
        .filter(|codec| {
            *codec == VideoCodec::Copy || encoders.iter().any(|e| e.name == codec.as_str())
        })
        .collect()
}

/// Parse the version out of `ffmpeg -version` output.
///
/// Takes the third word of the first line and drops any build suffix after
/// the first hyphen: `ffmpeg version 6.1.1-3ubuntu5 ...` -> `6.1.1`.
pub fn parse_version(output: &str) -> Option<String> {
    let first_line = output.lines().next()?;
    let version = first_line.split_whitespace().nth(2)?;
    let version = version.split('-').next()?;
    if version.is_empty() {
        return None;
    }
    Some(version.to_string())
}

/// Parse `ffmpeg -encoders` output, keeping the entries of one kind.
///
/// The capability legend above the ` ------` separator is skipped.
pub fn parse_encoders(output: &str, kind: EncoderKind) -> Option<Vec<EncoderInfo>> {
    let mut lines = output.lines();
    lines.find(|line| line.trim_start().starts_with("---"))?;

    let encoders = lines
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let flags = parts.next()?;
            if !flags.starts_with(kind.flag()) {
                return None;
            }
            let name = parts.next()?.to_string();
            let description = parts.collect::<Vec<_>>().join(" ");
            Some(EncoderInfo { name, description })
        })
        .collect();
    Some(encoders)
}

/// Capabilities of the installed transcoder, queried once at startup
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TranscoderInfo {
    pub version: Option<String>,
    pub audio_codecs: Vec<AudioCodec>,
    pub video_codecs: Vec<VideoCodec>,
}

/// Synchronous queries against a transcoder binary
#[derive(Debug, Clone)]
pub struct TranscoderInspector {
    path: PathBuf,
}

impl TranscoderInspector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Version string of the transcoder, e.g. `6.1.1`
    pub fn version(&self) -> Option<String> {
        let output = self.run(&["-version"])?;
        parse_version(&output)
    }

    /// Encoders of the requested kind as `(name, description)` pairs
    pub fn list_encoders(&self, kind: EncoderKind) -> Option<Vec<EncoderInfo>> {
        let output = self.run(&["-hide_banner", "-encoders"])?;
        parse_encoders(&output, kind)
    }

    /// Gather version and codec support in one go
    pub fn info(&self) -> TranscoderInfo {
        let audio = self.list_encoders(EncoderKind::Audio).unwrap_or_default();
        let video = self.list_encoders(EncoderKind::Video).unwrap_or_default();
        TranscoderInfo {
            version: self.version(),
            audio_codecs: supported_audio_codecs(&audio),
            video_codecs: supported_video_codecs(&video),
        }
    }

    fn run(&self, args: &[&str]) -> Option<String> {
        let output = match Command::new(&self.path).args(args).output() {
            Ok(output) => output,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "transcoder query failed to start");
                return None;
            }
        };
        if !output.status.success() {
            debug!(path = %self.path.display(), status = %output.status, "transcoder query exited with failure");
            return None;
        }
        String::from_utf8(output.stdout).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ENCODERS_OUTPUT: &str = "Encoders:
 V..... = Video
 A..... = Audio
 S..... = Subtitle
 .F.... = Frame-level multithreading
 ..S... = Slice-level multithreading
 ...X.. = Codec is experimental
 ....B. = Supports draw_horiz_band
 .....D = Supports direct rendering method 1
 ------
 V....D a64multi             Multicolor charset for Commodore 64 (codec a64_multi)
 V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC / MPEG-4 part 10 (codec h264)
 V....D libsvtav1            SVT-AV1(Scalable Video Technology for AV1) encoder (codec av1)
 A....D aac                  AAC (Advanced Audio Coding)
 A....D libmp3lame           libmp3lame MP3 (MPEG audio layer 3) (codec mp3)
 S..... ass                  ASS (Advanced SubStation Alpha) subtitle
";

    // Property: the version is the third token with any build suffix removed.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_version_parsing_strips_build_suffix(
            major in 1u32..20,
            minor in 0u32..10,
            suffix in "[a-z0-9]{1,12}",
        ) {
            let output = format!(
                "ffmpeg version {}.{}-{} Copyright (c) 2000-2024 the FFmpeg developers\nbuilt with gcc 13",
                major, minor, suffix
            );
            prop_assert_eq!(parse_version(&output), Some(format!("{}.{}", major, minor)));
        }
    }

    #[test]
    fn test_parse_version_plain() {
        let output = "ffmpeg version 7.1 Copyright (c) 2000-2024 the FFmpeg developers";
        assert_eq!(parse_version(output), Some("7.1".to_string()));
    }

    #[test]
    fn test_parse_version_n_prefixed_keeps_prefix() {
        let output = "ffmpeg version n8.0-5-g1234567 Copyright (c) 2000-2024";
        assert_eq!(parse_version(output), Some("n8.0".to_string()));
    }

    #[test]
    fn test_parse_version_invalid() {
        assert_eq!(parse_version(""), None);
        assert_eq!(parse_version("ffmpeg"), None);
    }

    #[test]
    fn test_parse_encoders_video() {
        let video = parse_encoders(ENCODERS_OUTPUT, EncoderKind::Video).unwrap();
        let names: Vec<_> = video.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a64multi", "libx264", "libsvtav1"]);
        assert_eq!(
            video[0].description,
            "Multicolor charset for Commodore 64 (codec a64_multi)"
        );
    }

    #[test]
    fn test_parse_encoders_audio_skips_legend() {
        let audio = parse_encoders(ENCODERS_OUTPUT, EncoderKind::Audio).unwrap();
        let names: Vec<_> = audio.iter().map(|e| e.name.as_str()).collect();
        // The " A..... = Audio" legend line sits above the separator.
        assert_eq!(names, vec!["aac", "libmp3lame"]);
    }

    #[test]
    fn test_parse_encoders_without_separator() {
        assert_eq!(parse_encoders("garbage\nmore garbage", EncoderKind::Audio), None);
    }

    #[test]
    fn test_supported_codecs() {
        let audio = parse_encoders(ENCODERS_OUTPUT, EncoderKind::Audio).unwrap();
        let video = parse_encoders(ENCODERS_OUTPUT, EncoderKind::Video).unwrap();

        assert_eq!(supported_audio_codecs(&audio), AudioCodec::ALL.to_vec());
        assert_eq!(
            supported_video_codecs(&video),
            vec![VideoCodec::Copy, VideoCodec::X264]
        );
        assert_eq!(supported_audio_codecs(&[]), vec![AudioCodec::Copy]);
    }

    #[test]
    fn test_codec_wire_names() {
        assert_eq!(serde_json::to_value(AudioCodec::Mp3).unwrap(), "mp3");
        assert_eq!(serde_json::to_value(VideoCodec::X265).unwrap(), "libx265");
        for codec in VideoCodec::ALL {
            assert_eq!(serde_json::to_value(codec).unwrap(), codec.as_str());
        }
        for codec in AudioCodec::ALL {
            assert_eq!(serde_json::to_value(codec).unwrap(), codec.as_str());
        }
    }

    #[test]
    fn test_missing_binary_yields_none() {
        let inspector = TranscoderInspector::new("/nonexistent/ffmpeg-binary");
        assert_eq!(inspector.version(), None);
        assert_eq!(inspector.list_encoders(EncoderKind::Video), None);
        let info = inspector.info();
        assert_eq!(info.version, None);
        assert_eq!(info.audio_codecs, vec![AudioCodec::Copy]);
        assert_eq!(info.video_codecs, vec![VideoCodec::Copy]);
    }
}
