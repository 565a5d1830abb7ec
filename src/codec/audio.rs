//! AAC audio encoding through an ffmpeg child process
//!
//! Raw s16le blocks go to stdin; the ADTS stream on stdout is split into
//! AAC frames on a reader thread using the length field in each ADTS
//! header. Every AAC frame carries 1024 samples, so packet PTS is the
//! output frame count times 1024 in the 1/48000 time base. That stays
//! sample-accurate as long as the fed samples are contiguous, which the
//! session guarantees.

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver};
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};

use crate::audio::AudioBlock;
use crate::codec::{AudioEncoder, EncodedPacket, TimeBase};
use crate::constants::{AUDIO_CHANNELS, AUDIO_SAMPLE_RATE};
use crate::error::EncoderError;

/// Samples per channel in one AAC frame
pub const AAC_FRAME_SAMPLES: i64 = 1024;

pub struct PipeAacEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
    frames: Receiver<Vec<u8>>,
    reader: Option<std::thread::JoinHandle<()>>,
    time_base: TimeBase,
    out_count: i64,
}

impl PipeAacEncoder {
    pub fn spawn(ffmpeg: &Path, bitrate_kbps: u32) -> Result<Self, EncoderError> {
        let args = build_args(bitrate_kbps);
        let mut child = Command::new(ffmpeg)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EncoderError::InitFailed(format!("spawn audio encoder: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EncoderError::InitFailed("no stdin on audio encoder".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EncoderError::InitFailed("no stdout on audio encoder".into()))?;
        if let Some(stderr) = child.stderr.take() {
            std::thread::Builder::new()
                .name("aenc-diag".into())
                .spawn(move || {
                    use std::io::BufRead;
                    for line in std::io::BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                        tracing::debug!(target: "audio_encoder", "{line}");
                    }
                })
                .ok();
        }

        let (tx, frames) = unbounded();
        let reader = std::thread::Builder::new()
            .name("aenc-read".into())
            .spawn(move || {
                let mut stdout = stdout;
                let mut pending = Vec::new();
                let mut chunk = [0u8; 8 * 1024];
                loop {
                    match stdout.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => {
                            pending.extend_from_slice(&chunk[..n]);
                            for frame in drain_adts_frames(&mut pending) {
                                if tx.send(frame).is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!("audio encoder read failed: {e}");
                            break;
                        }
                    }
                }
            })
            .map_err(|e| EncoderError::InitFailed(e.to_string()))?;

        tracing::info!(bitrate_kbps, "audio pipe encoder started");
        Ok(Self {
            child,
            stdin: Some(stdin),
            frames,
            reader: Some(reader),
            time_base: TimeBase::new(1, AUDIO_SAMPLE_RATE),
            out_count: 0,
        })
    }

    fn drain_ready(&mut self) -> Vec<EncodedPacket> {
        let mut packets = Vec::new();
        while let Ok(frame) = self.frames.try_recv() {
            let pts = self.out_count * AAC_FRAME_SAMPLES;
            self.out_count += 1;
            packets.push(EncodedPacket {
                data: Bytes::from(frame),
                pts,
                time_base: self.time_base,
                keyframe: true,
            });
        }
        packets
    }
}

impl AudioEncoder for PipeAacEncoder {
    fn encode(&mut self, block: &AudioBlock) -> Result<Vec<EncodedPacket>, EncoderError> {
        if block.is_empty() {
            return Ok(Vec::new());
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| EncoderError::EncodingFailed("encoder already flushed".into()))?;
        stdin
            .write_all(&block.to_le_bytes())
            .map_err(|e| EncoderError::EncodingFailed(format!("write to encoder: {e}")))?;
        Ok(self.drain_ready())
    }

    fn flush(&mut self) -> Result<Vec<EncodedPacket>, EncoderError> {
        drop(self.stdin.take());
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        let packets = self.drain_ready();
        let _ = self.child.wait();
        Ok(packets)
    }
}

impl Drop for PipeAacEncoder {
    fn drop(&mut self) {
        drop(self.stdin.take());
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

fn build_args(bitrate_kbps: u32) -> Vec<String> {
    [
        "-hide_banner",
        "-loglevel",
        "error",
        "-f",
        "s16le",
        "-ar",
        &AUDIO_SAMPLE_RATE.to_string(),
        "-ac",
        &AUDIO_CHANNELS.to_string(),
        "-i",
        "pipe:0",
        "-c:a",
        "aac",
        "-b:a",
        &format!("{bitrate_kbps}k"),
        "-f",
        "adts",
        "pipe:1",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Split a growing ADTS stream into complete frames.
///
/// Each ADTS header carries the full frame length (header included), so
/// framing is exact. Bytes before the first syncword are discarded.
pub fn drain_adts_frames(buf: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut pos = 0;

    loop {
        // Find the next syncword
        while pos + 2 <= buf.len() && !(buf[pos] == 0xff && buf[pos + 1] & 0xf0 == 0xf0) {
            pos += 1;
        }
        if pos + 7 > buf.len() {
            break;
        }
        let frame_len = adts_frame_length(&buf[pos..]);
        if frame_len < 7 {
            // Corrupt header; resync one byte later
            pos += 1;
            continue;
        }
        if pos + frame_len > buf.len() {
            break;
        }
        frames.push(buf[pos..pos + frame_len].to_vec());
        pos += frame_len;
    }

    buf.drain(..pos);
    frames
}

/// Frame length field from an ADTS header (13 bits across bytes 3..6)
fn adts_frame_length(header: &[u8]) -> usize {
    ((header[3] as usize & 0x03) << 11) | ((header[4] as usize) << 3) | (header[5] as usize >> 5)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal ADTS frame: 7-byte header + payload
    fn adts_frame(payload: &[u8]) -> Vec<u8> {
        let len = 7 + payload.len();
        let mut frame = vec![
            0xff,
            0xf1,
            0x4c, // AAC-LC, 48 kHz
            0x80 | ((len >> 11) & 0x03) as u8,
            ((len >> 3) & 0xff) as u8,
            (((len & 0x07) << 5) | 0x1f) as u8,
            0xfc,
        ];
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn test_frame_length_field_roundtrip() {
        let frame = adts_frame(&[1, 2, 3, 4, 5]);
        assert_eq!(adts_frame_length(&frame), 12);
    }

    #[test]
    fn test_drain_complete_frames() {
        let f1 = adts_frame(&[1, 2, 3]);
        let f2 = adts_frame(&[4, 5, 6, 7]);
        let mut buf = Vec::new();
        buf.extend_from_slice(&f1);
        buf.extend_from_slice(&f2);
        // A partial third frame
        buf.extend_from_slice(&adts_frame(&[8, 9, 10])[..5]);

        let frames = drain_adts_frames(&mut buf);
        assert_eq!(frames, vec![f1, f2]);
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_garbage_before_sync_discarded() {
        let frame = adts_frame(&[9]);
        let mut buf = vec![0x00, 0x12, 0x34];
        buf.extend_from_slice(&frame);

        let frames = drain_adts_frames(&mut buf);
        assert_eq!(frames, vec![frame]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_args_shape() {
        let args = build_args(192);
        let joined = args.join(" ");
        assert!(joined.contains("-f s16le"));
        assert!(joined.contains("-ar 48000"));
        assert!(joined.contains("-ac 2"));
        assert!(joined.contains("-b:a 192k"));
        assert!(joined.ends_with("-f adts pipe:1"));
    }
}
