//! Media-file audio source
//!
//! Demuxes and decodes a media file's audio through an ffmpeg child
//! process emitting raw s16le at 48 kHz stereo on stdout. `-re` keeps the
//! decode at native speed so blocks arrive paced like a live device.

use crossbeam_channel::{bounded, Receiver};
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use crate::audio::{AudioBlock, AudioSource};
use crate::constants::{AUDIO_CHANNELS, AUDIO_SAMPLE_RATE, SAMPLES_PER_BLOCK};
use crate::error::AudioError;

/// Blocks buffered between the reader thread and the consumer
const CHANNEL_CAPACITY: usize = 8;

/// Audio source backed by a media file
pub struct MediaFileSource {
    rx: Receiver<AudioBlock>,
    child: Child,
    reader: Option<std::thread::JoinHandle<()>>,
}

impl MediaFileSource {
    /// Start decoding `path`, seeking to `start_ms` first.
    pub fn open(ffmpeg: &Path, path: &Path, start_ms: u64) -> Result<Self, AudioError> {
        let mut cmd = Command::new(ffmpeg);
        cmd.arg("-hide_banner").args(["-loglevel", "error"]);
        if start_ms > 0 {
            cmd.args(["-ss", &format!("{:.3}", start_ms as f64 / 1000.0)]);
        }
        cmd.args(["-re", "-i"])
            .arg(path)
            .args(["-vn", "-f", "s16le"])
            .args(["-ar", &AUDIO_SAMPLE_RATE.to_string()])
            .args(["-ac", &AUDIO_CHANNELS.to_string()])
            .arg("pipe:1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| AudioError::DeviceUnavailable(format!("{}: {e}", path.display())))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AudioError::StreamError("no stdout from decoder".into()))?;
        if let Some(stderr) = child.stderr.take() {
            std::thread::Builder::new()
                .name("media-audio-err".into())
                .spawn(move || {
                    use std::io::BufRead;
                    for line in std::io::BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                        tracing::warn!(target: "media_audio", "{line}");
                    }
                })
                .ok();
        }

        let (tx, rx) = bounded(CHANNEL_CAPACITY);
        let reader = std::thread::Builder::new()
            .name("media-audio".into())
            .spawn(move || {
                let mut stdout = stdout;
                let block_bytes = SAMPLES_PER_BLOCK * AUDIO_CHANNELS as usize * 2;
                let mut buf = vec![0u8; block_bytes];
                loop {
                    match read_full(&mut stdout, &mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            let samples: Vec<i16> = buf[..n - n % 2]
                                .chunks_exact(2)
                                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                                .collect();
                            if tx.send(AudioBlock::new(samples)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!("media audio read failed: {e}");
                            break;
                        }
                    }
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        tracing::info!(path = %path.display(), start_ms, "media audio source started");
        Ok(Self {
            rx,
            child,
            reader: Some(reader),
        })
    }
}

/// Read until the buffer is full or the stream ends; returns bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl AudioSource for MediaFileSource {
    fn next_block(&mut self, timeout: Duration) -> Result<AudioBlock, AudioError> {
        match self.rx.recv_timeout(timeout) {
            Ok(block) => Ok(block),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(AudioError::Timeout),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(AudioError::EndOfStream),
        }
    }
}

impl Drop for MediaFileSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_full_assembles_partial_reads() {
        // A reader that trickles two bytes at a time
        struct Trickle(Vec<u8>, usize);
        impl Read for Trickle {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                let remaining = &self.0[self.1..];
                let n = remaining.len().min(2).min(buf.len());
                buf[..n].copy_from_slice(&remaining[..n]);
                self.1 += n;
                Ok(n)
            }
        }

        let mut reader = Trickle((0..10).collect(), 0);
        let mut buf = [0u8; 7];
        assert_eq!(read_full(&mut reader, &mut buf).unwrap(), 7);
        assert_eq!(&buf, &[0, 1, 2, 3, 4, 5, 6]);

        // Short tail at end of stream
        let mut buf = [0u8; 7];
        assert_eq!(read_full(&mut reader, &mut buf).unwrap(), 3);
    }

    #[test]
    fn test_missing_file_is_unavailable() {
        let result = MediaFileSource::open(
            Path::new("/nonexistent/ffmpeg-binary"),
            Path::new("/nonexistent/file.mp4"),
            0,
        );
        assert!(matches!(result, Err(AudioError::DeviceUnavailable(_))));
    }
}
