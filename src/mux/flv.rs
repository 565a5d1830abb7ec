//! FLV container writer
//!
//! Writes an FLV stream from H.264 Annex-B access units and AAC/ADTS
//! frames: the file header, an AVC sequence header built from the first
//! SPS/PPS pair seen, an AAC AudioSpecificConfig, then interleaved
//! audio/video tags. NALUs are converted to length-prefixed (AVCC) form
//! and AUD NALs are dropped; ADTS headers are stripped to raw AAC.

use std::io::Write;

use crate::codec::annexb;
use crate::codec::EncodedPacket;
use crate::error::TransportError;
use crate::mux::Muxer;

const TAG_AUDIO: u8 = 8;
const TAG_VIDEO: u8 = 9;

/// SoundFormat AAC, 44k-flag (fixed for AAC), 16-bit, stereo
const AAC_TAG_HEADER: u8 = 0xaf;

/// AudioSpecificConfig for AAC-LC, 48 kHz, stereo
const AAC_CONFIG: [u8; 2] = [0x11, 0x90];

pub struct FlvMuxer<W: Write + Send> {
    sink: W,
    header_written: bool,
    video_config_written: bool,
    audio_config_written: bool,
    finalized: bool,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
}

impl<W: Write + Send> FlvMuxer<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            header_written: false,
            video_config_written: false,
            audio_config_written: false,
            finalized: false,
            sps: None,
            pps: None,
        }
    }

    /// Consume the muxer and return the sink (used by owners that need to
    /// close the transport after finalizing)
    pub fn into_sink(self) -> W {
        self.sink
    }

    fn ensure_header(&mut self) -> Result<(), TransportError> {
        if self.header_written {
            return Ok(());
        }
        // "FLV", version 1, audio+video present, 9-byte header, then
        // PreviousTagSize0
        let header: [u8; 13] = [
            0x46, 0x4c, 0x56, 0x01, 0x05, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00,
        ];
        self.write_all(&header)?;
        self.header_written = true;
        Ok(())
    }

    fn write_tag(&mut self, tag_type: u8, timestamp_ms: u32, data: &[u8]) -> Result<(), TransportError> {
        self.ensure_header()?;

        let mut tag = Vec::with_capacity(11 + data.len() + 4);
        tag.push(tag_type);
        tag.extend_from_slice(&u24(data.len() as u32));
        tag.extend_from_slice(&u24(timestamp_ms & 0x00ff_ffff));
        tag.push((timestamp_ms >> 24) as u8);
        tag.extend_from_slice(&[0, 0, 0]); // stream id
        tag.extend_from_slice(data);
        tag.extend_from_slice(&(11 + data.len() as u32).to_be_bytes());
        self.write_all(&tag)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.sink.write_all(data).map_err(|e| {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                TransportError::BrokenPipe(e.to_string())
            } else {
                TransportError::WriteFailed(e.to_string())
            }
        })
    }

    /// Remember SPS/PPS from this access unit and emit the sequence header
    /// tag once both are known.
    fn maybe_write_video_config(&mut self, au: &[u8], ts: u32) -> Result<(), TransportError> {
        if self.video_config_written {
            return Ok(());
        }
        for nal in annexb::split_nals(au) {
            match annexb::nal_type(nal) {
                annexb::NAL_SPS => self.sps = Some(nal.to_vec()),
                annexb::NAL_PPS => self.pps = Some(nal.to_vec()),
                _ => {}
            }
        }
        let (Some(sps), Some(pps)) = (self.sps.as_ref(), self.pps.as_ref()) else {
            return Ok(());
        };

        // AVCDecoderConfigurationRecord
        let mut record = Vec::with_capacity(11 + sps.len() + pps.len());
        record.push(0x01);
        record.push(*sps.get(1).unwrap_or(&0x42)); // profile
        record.push(*sps.get(2).unwrap_or(&0x00)); // compatibility
        record.push(*sps.get(3).unwrap_or(&0x1e)); // level
        record.push(0xff); // 4-byte NALU lengths
        record.push(0xe1); // one SPS
        record.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        record.extend_from_slice(sps);
        record.push(0x01); // one PPS
        record.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        record.extend_from_slice(pps);

        let mut data = Vec::with_capacity(5 + record.len());
        data.extend_from_slice(&[0x17, 0x00, 0x00, 0x00, 0x00]); // keyframe, seq header, cts 0
        data.extend_from_slice(&record);
        self.write_tag(TAG_VIDEO, ts, &data)?;
        self.video_config_written = true;
        Ok(())
    }

    fn maybe_write_audio_config(&mut self, ts: u32) -> Result<(), TransportError> {
        if self.audio_config_written {
            return Ok(());
        }
        let mut data = Vec::with_capacity(2 + AAC_CONFIG.len());
        data.push(AAC_TAG_HEADER);
        data.push(0x00); // AAC sequence header
        data.extend_from_slice(&AAC_CONFIG);
        self.write_tag(TAG_AUDIO, ts, &data)?;
        self.audio_config_written = true;
        Ok(())
    }
}

impl<W: Write + Send> Muxer for FlvMuxer<W> {
    fn write_video(&mut self, packet: &EncodedPacket) -> Result<(), TransportError> {
        if self.finalized {
            return Err(TransportError::MuxFailed("muxer finalized".into()));
        }
        let ts = packet.time_base.to_millis(packet.pts).max(0) as u32;
        self.maybe_write_video_config(&packet.data, ts)?;
        if !self.video_config_written {
            // No decoder config yet; the stream cannot start mid-GOP
            tracing::debug!("dropping pre-config video packet");
            return Ok(());
        }

        // Annex-B -> AVCC, dropping access-unit delimiters
        let mut body = Vec::with_capacity(packet.data.len() + 16);
        body.extend_from_slice(&[
            if packet.keyframe { 0x17 } else { 0x27 },
            0x01, // NALU
            0x00,
            0x00,
            0x00, // composition time: zero-latency stream has no B-frames
        ]);
        for nal in annexb::split_nals(&packet.data) {
            if annexb::nal_type(nal) == annexb::NAL_AUD {
                continue;
            }
            body.extend_from_slice(&(nal.len() as u32).to_be_bytes());
            body.extend_from_slice(nal);
        }
        self.write_tag(TAG_VIDEO, ts, &body)
    }

    fn write_audio(&mut self, packet: &EncodedPacket) -> Result<(), TransportError> {
        if self.finalized {
            return Err(TransportError::MuxFailed("muxer finalized".into()));
        }
        let ts = packet.time_base.to_millis(packet.pts).max(0) as u32;
        self.maybe_write_audio_config(ts)?;

        // Strip the ADTS header (9 bytes when a CRC is present)
        let header_len = if packet.data.len() > 1 && packet.data[1] & 0x01 == 0 {
            9
        } else {
            7
        };
        if packet.data.len() <= header_len {
            return Ok(());
        }
        let raw = &packet.data[header_len..];

        let mut body = Vec::with_capacity(2 + raw.len());
        body.push(AAC_TAG_HEADER);
        body.push(0x01); // raw AAC
        body.extend_from_slice(raw);
        self.write_tag(TAG_AUDIO, ts, &body)
    }

    fn finalize(&mut self) -> Result<(), TransportError> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        self.sink
            .flush()
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }
}

fn u24(value: u32) -> [u8; 3] {
    [(value >> 16) as u8, (value >> 8) as u8, value as u8]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TimeBase;
    use bytes::Bytes;

    fn annexb_au() -> Vec<u8> {
        let mut au = Vec::new();
        au.extend_from_slice(&[0, 0, 0, 1, annexb::NAL_AUD, 0xf0]);
        au.extend_from_slice(&[0, 0, 0, 1, annexb::NAL_SPS, 0x64, 0x00, 0x1f, 0xaa]);
        au.extend_from_slice(&[0, 0, 0, 1, annexb::NAL_PPS, 0xee]);
        au.extend_from_slice(&[0, 0, 0, 1, annexb::NAL_IDR, 0x11, 0x22]);
        au
    }

    fn video_packet(pts: i64) -> EncodedPacket {
        EncodedPacket {
            data: Bytes::from(annexb_au()),
            pts,
            time_base: TimeBase::new(1, 30),
            keyframe: true,
        }
    }

    fn adts_packet(pts: i64) -> EncodedPacket {
        // 7-byte header (no CRC: byte1 bit0 set) + 3 payload bytes
        let data = vec![0xff, 0xf1, 0x4c, 0x80, 0x01, 0x5f, 0xfc, 0xde, 0xad, 0xbe];
        EncodedPacket {
            data: Bytes::from(data),
            pts,
            time_base: TimeBase::new(1, 48000),
            keyframe: true,
        }
    }

    /// Parse (tag_type, timestamp, data) triples from an FLV byte stream
    fn parse_tags(flv: &[u8]) -> Vec<(u8, u32, Vec<u8>)> {
        assert_eq!(&flv[..3], b"FLV");
        assert_eq!(flv[4], 0x05);
        let mut tags = Vec::new();
        let mut pos = 13;
        while pos + 11 <= flv.len() {
            let tag_type = flv[pos];
            let size =
                ((flv[pos + 1] as usize) << 16) | ((flv[pos + 2] as usize) << 8) | flv[pos + 3] as usize;
            let ts = ((flv[pos + 7] as u32) << 24)
                | ((flv[pos + 4] as u32) << 16)
                | ((flv[pos + 5] as u32) << 8)
                | flv[pos + 6] as u32;
            let data = flv[pos + 11..pos + 11 + size].to_vec();
            // trailing PreviousTagSize
            let prev = u32::from_be_bytes(
                flv[pos + 11 + size..pos + 15 + size].try_into().unwrap(),
            );
            assert_eq!(prev as usize, 11 + size);
            tags.push((tag_type, ts, data));
            pos += 11 + size + 4;
        }
        tags
    }

    #[test]
    fn test_video_sequence_header_precedes_frames() {
        let mut muxer = FlvMuxer::new(Vec::new());
        muxer.write_video(&video_packet(0)).unwrap();
        muxer.write_video(&video_packet(1)).unwrap();
        muxer.finalize().unwrap();

        let tags = parse_tags(&muxer.into_sink());
        assert_eq!(tags.len(), 3);

        // Sequence header: keyframe + AVCPacketType 0, config record follows
        let (ty, _, data) = &tags[0];
        assert_eq!(*ty, TAG_VIDEO);
        assert_eq!(&data[..2], &[0x17, 0x00]);
        assert_eq!(data[5], 0x01); // record version
        assert_eq!(data[6], 0x64); // profile from SPS

        // NALU tag: AUD removed, NALs length-prefixed
        let (_, ts, data) = &tags[1];
        assert_eq!(*ts, 0);
        assert_eq!(&data[..2], &[0x17, 0x01]);
        let first_len = u32::from_be_bytes(data[5..9].try_into().unwrap()) as usize;
        assert_eq!(first_len, 5); // the SPS nal
        assert_eq!(data[9] & 0x1f, annexb::NAL_SPS);

        // Second frame timestamp: pts 1 at 1/30 is 33 ms
        assert_eq!(tags[2].1, 33);
    }

    #[test]
    fn test_audio_config_and_payload_stripping() {
        let mut muxer = FlvMuxer::new(Vec::new());
        muxer.write_audio(&adts_packet(0)).unwrap();
        muxer.write_audio(&adts_packet(48000)).unwrap();
        muxer.finalize().unwrap();

        let tags = parse_tags(&muxer.into_sink());
        assert_eq!(tags.len(), 3);

        let (ty, _, data) = &tags[0];
        assert_eq!(*ty, TAG_AUDIO);
        assert_eq!(data, &vec![AAC_TAG_HEADER, 0x00, 0x11, 0x90]);

        // Raw AAC with the 7-byte ADTS header stripped
        let (_, ts, data) = &tags[1];
        assert_eq!(*ts, 0);
        assert_eq!(data, &vec![AAC_TAG_HEADER, 0x01, 0xde, 0xad, 0xbe]);

        // 48000 samples at 1/48000 is one second
        assert_eq!(tags[2].1, 1000);
    }

    #[test]
    fn test_finalized_muxer_rejects_writes() {
        let mut muxer = FlvMuxer::new(Vec::new());
        muxer.finalize().unwrap();
        assert!(muxer.write_video(&video_packet(0)).is_err());
        // finalize is idempotent
        assert!(muxer.finalize().is_ok());
    }
}
