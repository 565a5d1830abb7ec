//! Encoder seams and bitstream helpers
//!
//! The session talks to encoders through the [`VideoEncoder`] and
//! [`AudioEncoder`] traits; the production backends pipe raw media through
//! an ffmpeg child per elementary stream and split its output into
//! per-frame packets. Tests substitute in-memory fakes.

pub mod audio;
pub mod video;

use bytes::Bytes;

use crate::audio::AudioBlock;
use crate::error::EncoderError;
use crate::frame::VideoFrame;

pub use audio::PipeAacEncoder;
pub use video::PipeH264Encoder;

/// A stream's time base as a unit fraction (e.g. 1/fps, 1/48000)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
    pub num: u32,
    pub den: u32,
}

impl TimeBase {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// Convert a PTS in this time base to milliseconds
    pub fn to_millis(&self, pts: i64) -> i64 {
        pts * 1000 * self.num as i64 / self.den as i64
    }
}

/// One encoded access unit / audio frame
#[derive(Clone)]
pub struct EncodedPacket {
    pub data: Bytes,
    pub pts: i64,
    pub time_base: TimeBase,
    pub keyframe: bool,
}

/// Video encoder seam: raw RGBA frames in, H.264-class packets out.
///
/// Encoders may buffer internally; `flush` signals end-of-stream and
/// returns the trailing packets.
pub trait VideoEncoder: Send {
    fn encode(&mut self, frame: &VideoFrame) -> Result<Vec<EncodedPacket>, EncoderError>;
    fn flush(&mut self) -> Result<Vec<EncodedPacket>, EncoderError>;
}

/// Audio encoder seam: 48 kHz stereo blocks in, AAC-class packets out.
pub trait AudioEncoder: Send {
    fn encode(&mut self, block: &AudioBlock) -> Result<Vec<EncodedPacket>, EncoderError>;
    fn flush(&mut self) -> Result<Vec<EncodedPacket>, EncoderError>;
}

/// Annex-B H.264 bitstream helpers
pub mod annexb {
    pub const NAL_SLICE: u8 = 1;
    pub const NAL_IDR: u8 = 5;
    pub const NAL_SPS: u8 = 7;
    pub const NAL_PPS: u8 = 8;
    pub const NAL_AUD: u8 = 9;

    /// NAL unit type from the first header byte
    pub fn nal_type(nal: &[u8]) -> u8 {
        nal.first().map_or(0, |b| b & 0x1f)
    }

    /// Byte offsets of every start code (3- or 4-byte) in `data`,
    /// together with the start-code length.
    pub fn start_codes(data: &[u8]) -> Vec<(usize, usize)> {
        let mut codes = Vec::new();
        let mut i = 0;
        while i + 3 <= data.len() {
            if data[i] == 0 && data[i + 1] == 0 {
                if data[i + 2] == 1 {
                    // Prefer the 4-byte form when a leading zero precedes it
                    if i > 0 && data[i - 1] == 0 && codes.last().map_or(true, |&(o, l)| o + l <= i - 1) {
                        codes.push((i - 1, 4));
                    } else {
                        codes.push((i, 3));
                    }
                    i += 3;
                    continue;
                }
            }
            i += 1;
        }
        codes
    }

    /// Split an Annex-B buffer into NAL units (start codes removed)
    pub fn split_nals(data: &[u8]) -> Vec<&[u8]> {
        let codes = start_codes(data);
        let mut nals = Vec::with_capacity(codes.len());
        for (i, &(offset, len)) in codes.iter().enumerate() {
            let begin = offset + len;
            let end = codes.get(i + 1).map_or(data.len(), |&(o, _)| o);
            if begin < end {
                nals.push(&data[begin..end]);
            }
        }
        nals
    }

    /// Whether the access unit contains an IDR slice
    pub fn contains_idr(au: &[u8]) -> bool {
        split_nals(au).iter().any(|nal| nal_type(nal) == NAL_IDR)
    }

    /// Split a growing Annex-B buffer into complete access units delimited
    /// by AUD NALs. Complete units are returned; the buffer retains the
    /// trailing (possibly incomplete) unit.
    pub fn drain_access_units(buf: &mut Vec<u8>) -> Vec<Vec<u8>> {
        let aud_offsets: Vec<usize> = start_codes(buf)
            .iter()
            .filter(|&&(offset, len)| {
                buf.get(offset + len).map_or(false, |b| b & 0x1f == NAL_AUD)
            })
            .map(|&(offset, _)| offset)
            .collect();

        if aud_offsets.len() < 2 {
            return Vec::new();
        }

        let mut units = Vec::with_capacity(aud_offsets.len() - 1);
        for pair in aud_offsets.windows(2) {
            units.push(buf[pair[0]..pair[1]].to_vec());
        }
        let tail_start = *aud_offsets.last().expect("checked length");
        buf.drain(..tail_start);
        units
    }
}

#[cfg(test)]
mod tests {
    use super::annexb::*;
    use super::*;

    fn nal(ty: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![0, 0, 0, 1, ty];
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn test_time_base_millis() {
        assert_eq!(TimeBase::new(1, 30).to_millis(30), 1000);
        assert_eq!(TimeBase::new(1, 48000).to_millis(48000), 1000);
        assert_eq!(TimeBase::new(1, 60).to_millis(90), 1500);
    }

    #[test]
    fn test_split_nals_mixed_start_codes() {
        let mut data = nal(NAL_SPS, &[0xaa]);
        // 3-byte start code in the middle
        data.extend_from_slice(&[0, 0, 1, NAL_PPS, 0xbb]);
        data.extend_from_slice(&nal(NAL_IDR, &[0xcc, 0xdd]));

        let nals = split_nals(&data);
        assert_eq!(nals.len(), 3);
        assert_eq!(nal_type(nals[0]), NAL_SPS);
        assert_eq!(nal_type(nals[1]), NAL_PPS);
        assert_eq!(nal_type(nals[2]), NAL_IDR);
        assert_eq!(nals[2], &[NAL_IDR, 0xcc, 0xdd]);
    }

    #[test]
    fn test_contains_idr() {
        let mut au = nal(NAL_AUD, &[0xf0]);
        au.extend_from_slice(&nal(NAL_IDR, &[0x11]));
        assert!(contains_idr(&au));

        let au = nal(NAL_SLICE, &[0x22]);
        assert!(!contains_idr(&au));
    }

    #[test]
    fn test_drain_access_units() {
        let mut au1 = nal(NAL_AUD, &[0xf0]);
        au1.extend_from_slice(&nal(NAL_SPS, &[0x01]));
        au1.extend_from_slice(&nal(NAL_IDR, &[0x02]));
        let mut au2 = nal(NAL_AUD, &[0xf0]);
        au2.extend_from_slice(&nal(NAL_SLICE, &[0x03]));
        let mut au3_partial = nal(NAL_AUD, &[0xf0]);
        au3_partial.extend_from_slice(&[0, 0]);

        let mut buf = Vec::new();
        buf.extend_from_slice(&au1);
        buf.extend_from_slice(&au2);
        buf.extend_from_slice(&au3_partial);

        let units = drain_access_units(&mut buf);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0], au1);
        assert_eq!(units[1], au2);
        // Tail stays buffered
        assert_eq!(buf, au3_partial);

        // No new complete unit yet
        assert!(drain_access_units(&mut buf).is_empty());
    }

    #[test]
    fn test_incomplete_buffer_yields_nothing() {
        let mut buf = nal(NAL_AUD, &[0xf0]);
        assert!(drain_access_units(&mut buf).is_empty());
        assert!(!buf.is_empty());
    }
}
