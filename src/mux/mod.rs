//! Container muxing and transport
//!
//! The session writes encoded packets through the [`Muxer`] seam under a
//! single output lock. The production muxer writes an FLV container over
//! any byte sink: a local file, or the stdin of an ffmpeg copy-remux relay
//! for RTMP-class URLs.

pub mod flv;

use std::io::Write;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use crate::codec::EncodedPacket;
use crate::error::TransportError;

pub use flv::FlvMuxer;

/// Single-writer container seam; the caller serializes access
pub trait Muxer: Send {
    fn write_video(&mut self, packet: &EncodedPacket) -> Result<(), TransportError>;
    fn write_audio(&mut self, packet: &EncodedPacket) -> Result<(), TransportError>;
    /// Close the container; further writes are invalid
    fn finalize(&mut self) -> Result<(), TransportError>;
}

/// Whether a target is a streaming URL rather than a local path
pub fn is_stream_url(target: &str) -> bool {
    let t = target.to_ascii_lowercase();
    t.starts_with("rtmp://") || t.starts_with("rtmps://")
}

/// Byte sink for the FLV muxer: a file, or an ffmpeg relay that copies the
/// FLV stream to an RTMP-class URL without re-encoding.
pub struct FlvTransport {
    writer: Option<Box<dyn Write + Send>>,
    relay: Option<Child>,
}

impl FlvTransport {
    /// Open a transport for `target`; `ffmpeg` is required for URLs.
    pub fn open(target: &str, ffmpeg: Option<&Path>) -> Result<Self, TransportError> {
        if is_stream_url(target) {
            let ffmpeg = ffmpeg.ok_or_else(|| {
                TransportError::SpawnFailed("ffmpeg required for streaming targets".into())
            })?;
            Self::open_relay(ffmpeg, target)
        } else {
            Self::open_file(Path::new(target))
        }
    }

    pub fn open_file(path: &Path) -> Result<Self, TransportError> {
        let file = std::fs::File::create(path)
            .map_err(|e| TransportError::SpawnFailed(format!("{}: {e}", path.display())))?;
        tracing::info!(path = %path.display(), "FLV file output opened");
        Ok(Self {
            writer: Some(Box::new(std::io::BufWriter::new(file))),
            relay: None,
        })
    }

    /// Spawn an `ffmpeg -c copy` relay pushing our FLV stream to the URL
    pub fn open_relay(ffmpeg: &Path, url: &str) -> Result<Self, TransportError> {
        let mut child = Command::new(ffmpeg)
            .args(["-hide_banner", "-loglevel", "warning"])
            .args(["-f", "flv", "-i", "pipe:0"])
            .args(["-c", "copy", "-f", "flv"])
            .args(["-rtmp_live", "live"])
            .arg(url)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TransportError::SpawnFailed(format!("relay: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::SpawnFailed("no stdin on relay".into()))?;
        if let Some(stderr) = child.stderr.take() {
            std::thread::Builder::new()
                .name("flv-relay-diag".into())
                .spawn(move || {
                    use std::io::BufRead;
                    for line in std::io::BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                        tracing::warn!(target: "flv_relay", "{line}");
                    }
                })
                .ok();
        }

        tracing::info!(url, "FLV relay started");
        Ok(Self {
            writer: Some(Box::new(stdin)),
            relay: Some(child),
        })
    }

    /// Flush and close the sink; waits for the relay to drain
    pub fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        }
        if let Some(mut relay) = self.relay.take() {
            let _ = relay.wait();
        }
        Ok(())
    }
}

impl Write for FlvTransport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.writer.as_mut() {
            Some(w) => w.write(buf),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "transport closed",
            )),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.writer.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for FlvTransport {
    fn drop(&mut self) {
        let _ = self.close();
        if let Some(mut relay) = self.relay.take() {
            let _ = relay.kill();
            let _ = relay.wait();
        }
    }
}

/// Open the production muxer for a target
pub fn open_muxer(target: &str, ffmpeg: Option<&Path>) -> Result<Box<dyn Muxer>, TransportError> {
    let transport = FlvTransport::open(target, ffmpeg)?;
    Ok(Box::new(FlvMuxer::new(transport)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_url_detection() {
        assert!(is_stream_url("rtmp://a.example/live/key"));
        assert!(is_stream_url("RTMPS://a.example/live/key"));
        assert!(!is_stream_url("/tmp/out.flv"));
        assert!(!is_stream_url("out.flv"));
    }

    #[test]
    fn test_file_transport_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.flv");
        let mut transport = FlvTransport::open_file(&path).unwrap();
        transport.write_all(b"FLV").unwrap();
        transport.close().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"FLV");
    }

    #[test]
    fn test_url_without_ffmpeg_fails() {
        let result = FlvTransport::open("rtmp://x/y", None);
        assert!(matches!(result, Err(TransportError::SpawnFailed(_))));
    }
}
