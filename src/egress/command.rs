//! ffmpeg command construction for the supervised delivery path
//!
//! Pure functions from settings to argv, so every input/output variant is
//! testable without spawning anything. Two shapes exist: the pipe command
//! (raw RGBA frames on stdin, program audio from a device, a media file or
//! synthesized silence) and the passthrough command (a media file sent
//! straight to the target without compositing).

use std::path::Path;

use crate::config::StreamSettings;
use crate::egress::encoder::EncoderKind;
use crate::mux::is_stream_url;

/// Extensions treated as audio-only media in passthrough mode
const AUDIO_ONLY_EXTENSIONS: &[&str] = &["mp3", "wav", "aac", "m4a", "flac"];

/// Audio container formats that can be stream-copied to FLV
const COPYABLE_AUDIO_EXTENSIONS: &[&str] = &["mp3", "aac", "m4a"];

/// Applied when media-file audio is used without an explicit A/V delay;
/// prevents gradual delay buildup against the piped video.
const DEFAULT_MEDIA_DELAY_MS: i64 = 50;

/// Build the argv for pipe mode: video from stdin, audio per settings.
pub fn build_pipe_args(
    settings: &StreamSettings,
    encoder: EncoderKind,
    bitrate_kbps: u32,
) -> Vec<String> {
    let mut cmd: Vec<String> = Vec::new();
    push(&mut cmd, &["-loglevel", "info", "-hide_banner", "-fflags", "+genpts"]);

    // Input 0: raw RGBA program frames on stdin
    push(
        &mut cmd,
        &[
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgba",
            "-s",
            &format!("{}x{}", settings.width, settings.height),
            "-r",
            &settings.fps.to_string(),
            "-i",
            "pipe:0",
        ],
    );

    // Positive delay shifts audio later, negative shifts video later
    let mut audio_delay_ms = settings.av_sync_delay_ms.max(0);
    let video_delay_ms = (-settings.av_sync_delay_ms).max(0);

    // Input 1: program audio
    let media_audio = settings
        .media_audio_path
        .as_ref()
        .filter(|p| !p.as_os_str().is_empty());
    if let Some(path) = media_audio {
        if settings.av_sync_delay_ms == 0 {
            audio_delay_ms = DEFAULT_MEDIA_DELAY_MS;
        }
        if settings.media_audio_start_ms > 0 {
            push(&mut cmd, &["-ss", &seconds(settings.media_audio_start_ms)]);
        }
        push(&mut cmd, &["-thread_queue_size", "1024", "-i"]);
        cmd.push(path.display().to_string());
    } else if settings.capture_audio && !settings.audio_device.is_empty() {
        push_device_input(&mut cmd, &settings.audio_device);
    } else {
        // Silent stereo bed keeps ingest endpoints that require audio happy
        push(&mut cmd, &["-f", "lavfi", "-i", "anullsrc=cl=stereo:r=48000"]);
    }

    push(&mut cmd, &["-map", "0:v:0", "-map", "1:a:0"]);

    if video_delay_ms > 0 {
        push(
            &mut cmd,
            &["-vf", &format!("setpts=PTS+{:.3}/TB", video_delay_ms as f64 / 1000.0)],
        );
    }

    push_video_codec(&mut cmd, settings, encoder, bitrate_kbps);

    push(&mut cmd, &["-c:a", "aac", "-b:a", "192k", "-ar", "48000", "-ac", "2"]);
    let mut afilters = vec!["asetpts=PTS-STARTPTS".to_string()];
    if audio_delay_ms > 0 {
        afilters.push(format!("adelay={audio_delay_ms}|{audio_delay_ms}"));
    }
    afilters.push("aresample=async=1000:min_hard_comp=0.100:first_pts=0".to_string());
    push(&mut cmd, &["-af", &afilters.join(",")]);

    push_output(&mut cmd, &settings.target);
    cmd
}

/// Build the argv for direct passthrough of a media file.
///
/// Audio-only files are paired with a synthesized black video track;
/// video files attempt a stream copy of both elementary streams.
pub fn build_passthrough_args(
    settings: &StreamSettings,
    media_path: &Path,
    encoder: EncoderKind,
    bitrate_kbps: u32,
) -> Vec<String> {
    let mut cmd: Vec<String> = Vec::new();
    push(&mut cmd, &["-loglevel", "info", "-hide_banner"]);

    let ext = media_path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    if settings.media_audio_start_ms > 0 {
        push(&mut cmd, &["-ss", &seconds(settings.media_audio_start_ms)]);
    }
    push(&mut cmd, &["-re", "-thread_queue_size", "1024", "-i"]);
    cmd.push(media_path.display().to_string());

    if AUDIO_ONLY_EXTENSIONS.contains(&ext.as_str()) {
        // Input 1: synthesized black video matching the target geometry
        push(
            &mut cmd,
            &[
                "-f",
                "lavfi",
                "-r",
                &settings.fps.to_string(),
                "-i",
                &format!(
                    "color=size={}x{}:color=black",
                    settings.width, settings.height
                ),
            ],
        );
        push(&mut cmd, &["-map", "1:v:0"]);
        // Hardware encoders bring no benefit to a static color source
        let encoder = if encoder.is_hardware() {
            EncoderKind::X264
        } else {
            encoder
        };
        push_video_codec(&mut cmd, settings, encoder, bitrate_kbps);

        push(&mut cmd, &["-map", "0:a:0"]);
        if COPYABLE_AUDIO_EXTENSIONS.contains(&ext.as_str()) {
            push(&mut cmd, &["-c:a", "copy"]);
        } else {
            push(&mut cmd, &["-c:a", "aac", "-b:a", "192k", "-ar", "48000", "-ac", "2"]);
        }
    } else {
        // Many containers already carry H.264/AAC; copy and let the ingest
        // reject it if not (the optional audio map tolerates silent files)
        push(
            &mut cmd,
            &["-map", "0:v:0", "-map", "0:a:0?", "-c:v", "copy", "-c:a", "copy", "-shortest"],
        );
    }

    push_output(&mut cmd, &settings.target);
    cmd
}

fn push_device_input(cmd: &mut Vec<String>, device: &str) {
    #[cfg(target_os = "macos")]
    push(cmd, &["-f", "avfoundation", "-i", &format!(":{device}")]);
    #[cfg(target_os = "windows")]
    push(cmd, &["-f", "dshow", "-i", &format!("audio={device}")]);
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    push(cmd, &["-f", "pulse", "-i", device]);
}

fn push_video_codec(
    cmd: &mut Vec<String>,
    settings: &StreamSettings,
    encoder: EncoderKind,
    bitrate_kbps: u32,
) {
    let gop = (settings.fps.max(1) * 2).to_string();
    let bitrate = format!("{}k", bitrate_kbps.max(500));
    let bufsize = format!("{}k", 2 * bitrate_kbps.max(500));

    push(&mut *cmd, &["-c:v", encoder.ffmpeg_name()]);
    push(
        &mut *cmd,
        &["-g", &gop, "-keyint_min", &gop, "-sc_threshold", "0", "-pix_fmt", "yuv420p"],
    );
    match encoder {
        EncoderKind::X264 => push(
            cmd,
            &[
                "-preset",
                &settings.preset,
                "-tune",
                "zerolatency",
                "-profile:v",
                "high",
                "-level",
                "4.2",
            ],
        ),
        EncoderKind::Nvenc => push(
            cmd,
            &[
                "-preset",
                &settings.preset,
                "-tune",
                "ll",
                "-rc",
                "cbr",
                "-profile:v",
                "high",
                "-rc-lookahead",
                "0",
                "-bf",
                "2",
            ],
        ),
        EncoderKind::VideoToolbox => push(cmd, &["-profile:v", "high", "-realtime", "1"]),
        EncoderKind::Qsv => push(cmd, &["-profile:v", "high", "-look_ahead", "0", "-bf", "2"]),
        EncoderKind::Amf => push(cmd, &["-profile:v", "high", "-rc", "cbr", "-usage", "lowlatency"]),
    }
    push(cmd, &["-b:v", &bitrate, "-maxrate", &bitrate, "-bufsize", &bufsize]);
}

fn push_output(cmd: &mut Vec<String>, target: &str) {
    if is_stream_url(target) {
        push(
            cmd,
            &[
                "-flvflags",
                "no_duration_filesize",
                "-vsync",
                "1",
                "-f",
                "flv",
                "-rtmp_live",
                "live",
                "-rw_timeout",
                "15000000",
            ],
        );
        cmd.push(target.to_string());
    } else {
        push(cmd, &["-vsync", "1", "-y"]);
        cmd.push(target.to_string());
    }
}

fn seconds(ms: u64) -> String {
    format!("{:.3}", ms as f64 / 1000.0)
}

fn push(cmd: &mut Vec<String>, args: &[&str]) {
    cmd.extend(args.iter().map(|s| s.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn rtmp_settings() -> StreamSettings {
        StreamSettings {
            target: "rtmp://ingest.example/live/key".into(),
            width: 1920,
            height: 1080,
            fps: 60,
            ..Default::default()
        }
    }

    fn joined(args: &[String]) -> String {
        args.join(" ")
    }

    #[test]
    fn test_pipe_silence_bed_when_no_audio() {
        let args = build_pipe_args(&rtmp_settings(), EncoderKind::X264, 9000);
        let cmd = joined(&args);
        assert!(cmd.contains("-f rawvideo -pix_fmt rgba -s 1920x1080 -r 60 -i pipe:0"));
        assert!(cmd.contains("anullsrc=cl=stereo:r=48000"));
        assert!(cmd.contains("-map 0:v:0 -map 1:a:0"));
        assert!(cmd.contains("-c:v libx264"));
        assert!(cmd.contains("-tune zerolatency"));
        assert!(cmd.contains("-b:v 9000k -maxrate 9000k -bufsize 18000k"));
        assert!(cmd.contains("-g 120 -keyint_min 120"));
        assert!(cmd.contains("-rtmp_live live"));
        assert!(cmd.ends_with("rtmp://ingest.example/live/key"));
    }

    #[test]
    fn test_pipe_media_audio_with_seek_and_default_delay() {
        let settings = StreamSettings {
            media_audio_path: Some(PathBuf::from("/media/show.mp4")),
            media_audio_start_ms: 12_500,
            ..rtmp_settings()
        };
        let cmd = joined(&build_pipe_args(&settings, EncoderKind::X264, 9000));
        assert!(cmd.contains("-ss 12.500 -thread_queue_size 1024 -i /media/show.mp4"));
        // Implicit 50 ms audio delay guards against buildup
        assert!(cmd.contains("adelay=50|50"));
        assert!(cmd.contains("aresample=async=1000"));
    }

    #[test]
    fn test_pipe_explicit_audio_delay() {
        let settings = StreamSettings {
            av_sync_delay_ms: 200,
            ..rtmp_settings()
        };
        let cmd = joined(&build_pipe_args(&settings, EncoderKind::X264, 9000));
        assert!(cmd.contains("adelay=200|200"));
        assert!(!cmd.contains("setpts=PTS+"));
    }

    #[test]
    fn test_pipe_negative_delay_shifts_video() {
        let settings = StreamSettings {
            av_sync_delay_ms: -120,
            ..rtmp_settings()
        };
        let cmd = joined(&build_pipe_args(&settings, EncoderKind::X264, 9000));
        assert!(cmd.contains("-vf setpts=PTS+0.120/TB"));
        assert!(!cmd.contains("adelay="));
    }

    #[test]
    fn test_pipe_hardware_encoder_options() {
        let cmd = joined(&build_pipe_args(&rtmp_settings(), EncoderKind::Nvenc, 9000));
        assert!(cmd.contains("-c:v h264_nvenc"));
        assert!(cmd.contains("-rc cbr"));
        assert!(cmd.contains("-rc-lookahead 0"));

        let cmd = joined(&build_pipe_args(&rtmp_settings(), EncoderKind::VideoToolbox, 9000));
        assert!(cmd.contains("-c:v h264_videotoolbox"));
        assert!(cmd.contains("-realtime 1"));
    }

    #[test]
    fn test_pipe_bitrate_floor() {
        let cmd = joined(&build_pipe_args(&rtmp_settings(), EncoderKind::X264, 200));
        assert!(cmd.contains("-b:v 500k"));
    }

    #[test]
    fn test_file_target_skips_rtmp_options() {
        let settings = StreamSettings {
            target: "/tmp/out.mp4".into(),
            ..rtmp_settings()
        };
        let cmd = joined(&build_pipe_args(&settings, EncoderKind::X264, 9000));
        assert!(!cmd.contains("-rtmp_live"));
        assert!(!cmd.contains("-f flv"));
        assert!(cmd.ends_with("-vsync 1 -y /tmp/out.mp4"));
    }

    #[test]
    fn test_passthrough_video_file_copies_streams() {
        let settings = rtmp_settings();
        let cmd = joined(&build_passthrough_args(
            &settings,
            Path::new("/media/show.mp4"),
            EncoderKind::X264,
            9000,
        ));
        assert!(cmd.contains("-re -thread_queue_size 1024 -i /media/show.mp4"));
        assert!(cmd.contains("-map 0:v:0 -map 0:a:0? -c:v copy -c:a copy -shortest"));
        assert!(cmd.contains("-rtmp_live live"));
    }

    #[test]
    fn test_passthrough_audio_file_gets_black_video() {
        let settings = StreamSettings {
            media_audio_start_ms: 3000,
            ..rtmp_settings()
        };
        let cmd = joined(&build_passthrough_args(
            &settings,
            Path::new("/media/track.mp3"),
            EncoderKind::Nvenc,
            9000,
        ));
        assert!(cmd.contains("-ss 3.000"));
        assert!(cmd.contains("color=size=1920x1080:color=black"));
        // mp3 audio can be copied; video falls back to software for lavfi
        assert!(cmd.contains("-c:a copy"));
        assert!(cmd.contains("-c:v libx264"));
        assert!(cmd.contains("-map 1:v:0"));
        assert!(cmd.contains("-map 0:a:0"));
    }

    #[test]
    fn test_passthrough_wav_transcodes_audio() {
        let cmd = joined(&build_passthrough_args(
            &rtmp_settings(),
            Path::new("/media/track.wav"),
            EncoderKind::X264,
            9000,
        ));
        assert!(cmd.contains("-c:a aac"));
    }
}
