//! Encoder selection and bitrate policy
//!
//! Hardware H.264 encoders are modeled as an explicit enum with a fixed
//! per-platform priority order; availability comes from parsing
//! `ffmpeg -encoders` once and caching the result. The bitrate table is a
//! floor to keep under-provisioned streams from stalling downstream.

use std::collections::HashSet;
use std::path::Path;
use std::process::Command;

use crate::error::EncoderError;

/// H.264-class encoders the engine knows how to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncoderKind {
    /// Apple VideoToolbox
    VideoToolbox,
    /// NVIDIA NVENC
    Nvenc,
    /// AMD AMF
    Amf,
    /// Intel QuickSync
    Qsv,
    /// Software x264, the universal fallback
    X264,
}

impl EncoderKind {
    /// Name ffmpeg knows the encoder by
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            EncoderKind::VideoToolbox => "h264_videotoolbox",
            EncoderKind::Nvenc => "h264_nvenc",
            EncoderKind::Amf => "h264_amf",
            EncoderKind::Qsv => "h264_qsv",
            EncoderKind::X264 => "libx264",
        }
    }

    pub fn from_name(name: &str) -> Option<EncoderKind> {
        match name {
            "h264_videotoolbox" => Some(EncoderKind::VideoToolbox),
            "h264_nvenc" => Some(EncoderKind::Nvenc),
            "h264_amf" => Some(EncoderKind::Amf),
            "h264_qsv" => Some(EncoderKind::Qsv),
            "libx264" => Some(EncoderKind::X264),
            _ => None,
        }
    }

    pub fn is_hardware(&self) -> bool {
        !matches!(self, EncoderKind::X264)
    }

    /// Preference order for this platform, best first
    pub fn platform_priority() -> &'static [EncoderKind] {
        #[cfg(target_os = "macos")]
        {
            &[
                EncoderKind::VideoToolbox,
                EncoderKind::Nvenc,
                EncoderKind::Qsv,
                EncoderKind::X264,
            ]
        }
        #[cfg(target_os = "windows")]
        {
            &[
                EncoderKind::Nvenc,
                EncoderKind::Amf,
                EncoderKind::Qsv,
                EncoderKind::X264,
            ]
        }
        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        {
            &[EncoderKind::Nvenc, EncoderKind::Qsv, EncoderKind::X264]
        }
    }
}

/// Encoder names ffmpeg reports as available
pub type EncoderSet = HashSet<String>;

/// Parse `ffmpeg -encoders` output into the set of encoder names.
///
/// Lines look like ` V....D h264_videotoolbox  VideoToolbox H.264 ...`.
pub fn parse_encoder_list(output: &str) -> EncoderSet {
    let mut set = EncoderSet::new();
    for line in output.lines() {
        let mut parts = line.split_whitespace();
        let (Some(flags), Some(name)) = (parts.next(), parts.next()) else {
            continue;
        };
        if flags.starts_with(['V', 'A', 'S', '.']) && !name.starts_with('=') {
            set.insert(name.to_string());
        }
    }
    set
}

/// Run the probe once; callers cache the result for the process lifetime.
pub fn probe_encoders(ffmpeg: &Path) -> Result<EncoderSet, EncoderError> {
    let output = Command::new(ffmpeg)
        .args(["-hide_banner", "-v", "quiet", "-encoders"])
        .output()
        .map_err(|e| EncoderError::ProbeFailed(e.to_string()))?;
    let text = String::from_utf8_lossy(&output.stdout);
    let set = parse_encoder_list(&text);
    tracing::debug!(count = set.len(), "probed available encoders");
    Ok(set)
}

/// Choose the best available encoder, best hardware first, x264 otherwise.
pub fn select_encoder(available: &EncoderSet) -> EncoderKind {
    for kind in EncoderKind::platform_priority() {
        if available.contains(kind.ffmpeg_name()) {
            return *kind;
        }
    }
    EncoderKind::X264
}

/// Recommended CBR bitrate (kbps) for a resolution and frame rate.
///
/// Used when the caller supplies no explicit bitrate; values follow common
/// live-ingest guidance and act as floors.
pub fn recommended_bitrate_kbps(width: u32, height: u32, fps: u32) -> u32 {
    let pixels = width as u64 * height as u64;
    let high_rate = fps > 30;
    if pixels >= 3840 * 2160 {
        if high_rate {
            51_000
        } else {
            45_000
        }
    } else if pixels >= 2560 * 1440 {
        if high_rate {
            24_000
        } else {
            16_000
        }
    } else if pixels >= 1920 * 1080 {
        if high_rate {
            9_000
        } else {
            6_000
        }
    } else if pixels >= 1280 * 720 {
        if high_rate {
            6_000
        } else {
            4_500
        }
    } else {
        3_000
    }
}

/// Stderr markers that mean the configured encoder cannot run at all.
///
/// These trigger the forced software fallback with an immediate restart:
/// a correctness condition, not a transient failure.
pub fn is_fatal_encoder_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    lower.contains("unknown encoder") || lower.contains("error selecting an encoder")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitrate_table_documented_values() {
        assert_eq!(recommended_bitrate_kbps(1920, 1080, 30), 6_000);
        assert_eq!(recommended_bitrate_kbps(1920, 1080, 60), 9_000);
        assert_eq!(recommended_bitrate_kbps(3840, 2160, 30), 45_000);
        assert_eq!(recommended_bitrate_kbps(3840, 2160, 60), 51_000);
        assert_eq!(recommended_bitrate_kbps(1280, 720, 30), 4_500);
        assert_eq!(recommended_bitrate_kbps(2560, 1440, 30), 16_000);
        assert_eq!(recommended_bitrate_kbps(640, 360, 30), 3_000);
    }

    #[test]
    fn test_parse_encoder_list() {
        let output = "\
 V....D libx264              libx264 H.264 / AVC
 V....D h264_nvenc           NVIDIA NVENC H.264 encoder
 A....D aac                  AAC (Advanced Audio Coding)
 ------
";
        let set = parse_encoder_list(output);
        assert!(set.contains("libx264"));
        assert!(set.contains("h264_nvenc"));
        assert!(set.contains("aac"));
        assert!(!set.contains("------"));
    }

    #[test]
    fn test_selection_prefers_hardware() {
        let mut set = EncoderSet::new();
        set.insert("libx264".to_string());
        assert_eq!(select_encoder(&set), EncoderKind::X264);

        set.insert("h264_nvenc".to_string());
        assert_eq!(select_encoder(&set), EncoderKind::Nvenc);
    }

    #[test]
    fn test_selection_falls_back_to_software() {
        assert_eq!(select_encoder(&EncoderSet::new()), EncoderKind::X264);
    }

    #[test]
    fn test_priority_ends_with_software() {
        assert_eq!(
            EncoderKind::platform_priority().last(),
            Some(&EncoderKind::X264)
        );
    }

    #[test]
    fn test_fatal_encoder_markers() {
        assert!(is_fatal_encoder_line("Unknown encoder 'h264_videotoolbox'"));
        assert!(is_fatal_encoder_line(
            "Error selecting an encoder for stream 0:0"
        ));
        assert!(!is_fatal_encoder_line("frame=  100 fps= 30 q=23.0"));
    }

    #[test]
    fn test_name_roundtrip() {
        for kind in [
            EncoderKind::VideoToolbox,
            EncoderKind::Nvenc,
            EncoderKind::Amf,
            EncoderKind::Qsv,
            EncoderKind::X264,
        ] {
            assert_eq!(EncoderKind::from_name(kind.ffmpeg_name()), Some(kind));
        }
        assert_eq!(EncoderKind::from_name("h265_blah"), None);
    }
}
