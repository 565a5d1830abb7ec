//! H.264 video encoding through an ffmpeg child process
//!
//! Raw RGBA frames are written to the child's stdin; the Annex-B stream on
//! stdout is split into access units on a reader thread. The encoder runs
//! zero-latency (no B-frames, output order == input order) with access-unit
//! delimiters enabled, so packet PTS is a plain output counter at 1/fps.

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver};
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};

use crate::codec::{annexb, EncodedPacket, TimeBase, VideoEncoder};
use crate::error::EncoderError;
use crate::frame::VideoFrame;

pub struct PipeH264Encoder {
    child: Child,
    stdin: Option<ChildStdin>,
    units: Receiver<Vec<u8>>,
    reader: Option<std::thread::JoinHandle<()>>,
    time_base: TimeBase,
    frame_bytes: usize,
    out_count: i64,
    frames_in: u64,
}

impl PipeH264Encoder {
    pub fn spawn(
        ffmpeg: &Path,
        width: u32,
        height: u32,
        fps: u32,
        bitrate_kbps: u32,
        preset: &str,
    ) -> Result<Self, EncoderError> {
        let args = build_args(width, height, fps, bitrate_kbps, preset);
        let mut child = Command::new(ffmpeg)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EncoderError::InitFailed(format!("spawn video encoder: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EncoderError::InitFailed("no stdin on video encoder".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EncoderError::InitFailed("no stdout on video encoder".into()))?;
        if let Some(stderr) = child.stderr.take() {
            std::thread::Builder::new()
                .name("venc-diag".into())
                .spawn(move || {
                    use std::io::BufRead;
                    for line in std::io::BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                        tracing::debug!(target: "video_encoder", "{line}");
                    }
                })
                .ok();
        }

        let (tx, units) = unbounded();
        let reader = std::thread::Builder::new()
            .name("venc-read".into())
            .spawn(move || {
                let mut stdout = stdout;
                let mut pending = Vec::new();
                let mut chunk = [0u8; 16 * 1024];
                loop {
                    match stdout.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => {
                            pending.extend_from_slice(&chunk[..n]);
                            for unit in annexb::drain_access_units(&mut pending) {
                                if tx.send(unit).is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!("video encoder read failed: {e}");
                            break;
                        }
                    }
                }
                // Trailing access unit after EOF
                if !pending.is_empty() {
                    let _ = tx.send(pending);
                }
            })
            .map_err(|e| EncoderError::InitFailed(e.to_string()))?;

        tracing::info!(width, height, fps, bitrate_kbps, "video pipe encoder started");
        Ok(Self {
            child,
            stdin: Some(stdin),
            units,
            reader: Some(reader),
            time_base: TimeBase::new(1, fps),
            frame_bytes: VideoFrame::byte_len(width, height),
            out_count: 0,
            frames_in: 0,
        })
    }

    fn drain_ready(&mut self) -> Vec<EncodedPacket> {
        let mut packets = Vec::new();
        while let Ok(unit) = self.units.try_recv() {
            packets.push(self.packet_from(unit));
        }
        packets
    }

    fn packet_from(&mut self, unit: Vec<u8>) -> EncodedPacket {
        let keyframe = annexb::contains_idr(&unit);
        let pts = self.out_count;
        self.out_count += 1;
        EncodedPacket {
            data: Bytes::from(unit),
            pts,
            time_base: self.time_base,
            keyframe,
        }
    }

    pub fn frames_in(&self) -> u64 {
        self.frames_in
    }
}

impl VideoEncoder for PipeH264Encoder {
    fn encode(&mut self, frame: &VideoFrame) -> Result<Vec<EncodedPacket>, EncoderError> {
        if frame.data.len() != self.frame_bytes {
            return Err(EncoderError::EncodingFailed(format!(
                "frame is {} bytes, encoder expects {}",
                frame.data.len(),
                self.frame_bytes
            )));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| EncoderError::EncodingFailed("encoder already flushed".into()))?;
        stdin
            .write_all(&frame.data)
            .map_err(|e| EncoderError::EncodingFailed(format!("write to encoder: {e}")))?;
        self.frames_in += 1;
        Ok(self.drain_ready())
    }

    fn flush(&mut self) -> Result<Vec<EncodedPacket>, EncoderError> {
        // Closing stdin signals end-of-stream
        drop(self.stdin.take());
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        let packets = self.drain_ready();
        let _ = self.child.wait();
        Ok(packets)
    }
}

impl Drop for PipeH264Encoder {
    fn drop(&mut self) {
        drop(self.stdin.take());
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

/// ffmpeg argv for the raw-RGBA-to-Annex-B encode leg.
///
/// Zero-latency x264 with AUD insertion; 2-second GOP, CBR-style rate
/// control suitable for live ingest.
fn build_args(width: u32, height: u32, fps: u32, bitrate_kbps: u32, preset: &str) -> Vec<String> {
    let gop = (fps.max(1) * 2).to_string();
    let bitrate = format!("{}k", bitrate_kbps.max(500));
    let bufsize = format!("{}k", 2 * bitrate_kbps.max(500));
    [
        "-hide_banner",
        "-loglevel",
        "error",
        "-f",
        "rawvideo",
        "-pix_fmt",
        "rgba",
        "-s",
        &format!("{width}x{height}"),
        "-r",
        &fps.to_string(),
        "-i",
        "pipe:0",
        "-c:v",
        "libx264",
        "-preset",
        preset,
        "-tune",
        "zerolatency",
        "-profile:v",
        "high",
        "-g",
        &gop,
        "-keyint_min",
        &gop,
        "-sc_threshold",
        "0",
        "-b:v",
        &bitrate,
        "-maxrate",
        &bitrate,
        "-bufsize",
        &bufsize,
        "-pix_fmt",
        "yuv420p",
        "-x264-params",
        "aud=1",
        "-f",
        "h264",
        "pipe:1",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_carry_geometry_and_rate_control() {
        let args = build_args(1280, 720, 30, 4500, "veryfast");
        let joined = args.join(" ");
        assert!(joined.contains("-s 1280x720"));
        assert!(joined.contains("-r 30"));
        assert!(joined.contains("-b:v 4500k"));
        assert!(joined.contains("-maxrate 4500k"));
        assert!(joined.contains("-bufsize 9000k"));
        // 2-second GOP
        assert!(joined.contains("-g 60"));
        // AUD insertion is what makes output splitting possible
        assert!(joined.contains("aud=1"));
        assert!(joined.ends_with("-f h264 pipe:1"));
    }

    #[test]
    fn test_bitrate_floor() {
        let args = build_args(640, 360, 30, 100, "veryfast");
        assert!(args.join(" ").contains("-b:v 500k"));
    }
}
