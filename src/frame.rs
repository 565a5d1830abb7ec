//! Video frame payloads and the frame-provider contract

use bytes::Bytes;
use std::sync::Arc;

/// Bytes per RGBA pixel
pub const BYTES_PER_PIXEL: usize = 4;

/// A raw RGBA8888 bitmap
///
/// The payload is shared (`Bytes`), so duplicating a frame for cadence
/// filling is a cheap reference-count bump, not a copy.
#[derive(Clone)]
pub struct VideoFrame {
    /// Interleaved RGBA pixel data, row-major, no padding
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
}

impl VideoFrame {
    pub fn new(data: Bytes, width: u32, height: u32) -> Self {
        debug_assert_eq!(data.len(), width as usize * height as usize * BYTES_PER_PIXEL);
        Self { data, width, height }
    }

    /// Solid-black frame of the given geometry
    pub fn black(width: u32, height: u32) -> Self {
        let mut data = vec![0u8; width as usize * height as usize * BYTES_PER_PIXEL];
        // opaque alpha
        for px in data.chunks_exact_mut(BYTES_PER_PIXEL) {
            px[3] = 0xff;
        }
        Self {
            data: Bytes::from(data),
            width,
            height,
        }
    }

    /// Expected byte length for a frame of the given geometry
    pub fn byte_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * BYTES_PER_PIXEL
    }

    pub fn matches(&self, width: u32, height: u32) -> bool {
        self.width == width && self.height == height
    }

    /// Fit this frame to the exact target geometry.
    ///
    /// The source is copied top-left onto a black canvas; rows and columns
    /// beyond the target are cropped. Returns `self` unchanged when the
    /// geometry already matches.
    pub fn fit_to(&self, width: u32, height: u32) -> VideoFrame {
        if self.matches(width, height) {
            return self.clone();
        }

        let src_stride = self.width as usize * BYTES_PER_PIXEL;
        let dst_stride = width as usize * BYTES_PER_PIXEL;
        let copy_stride = src_stride.min(dst_stride);
        let copy_rows = (self.height as usize).min(height as usize);

        let mut canvas = vec![0u8; dst_stride * height as usize];
        for px in canvas.chunks_exact_mut(BYTES_PER_PIXEL) {
            px[3] = 0xff;
        }
        for row in 0..copy_rows {
            let src = &self.data[row * src_stride..row * src_stride + copy_stride];
            canvas[row * dst_stride..row * dst_stride + copy_stride].copy_from_slice(src);
        }

        VideoFrame::new(Bytes::from(canvas), width, height)
    }
}

/// A frame stamped by the cadence converter
///
/// `target_time` is the scheduled emission time on the ideal output grid and
/// is authoritative downstream; `capture_time` records when the payload
/// actually arrived. `sequence` is strictly increasing and gap-free per
/// source, counting synthesized duplicates too.
#[derive(Clone)]
pub struct TimestampedFrame {
    pub frame: VideoFrame,
    /// Seconds on the master clock when the payload was captured
    pub capture_time: f64,
    /// Seconds on the master clock when the frame is scheduled to emit
    pub target_time: f64,
    pub sequence: u64,
    pub source_id: Arc<str>,
}

/// Callback contract to the external compositor.
///
/// Returns a bitmap for the requested geometry or `None` when nothing is
/// available this instant. Must be safe to call from the delivery loop's
/// thread and must not block for longer than roughly one frame period.
/// The flag requests direct passthrough rendering (bypass compositing).
pub type FrameProvider = Arc<dyn Fn(u32, u32, bool) -> Option<VideoFrame> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_value(width: u32, height: u32, value: u8) -> VideoFrame {
        let data = vec![value; VideoFrame::byte_len(width, height)];
        VideoFrame::new(Bytes::from(data), width, height)
    }

    #[test]
    fn test_fit_to_same_geometry_is_cheap() {
        let frame = frame_with_value(4, 4, 7);
        let fitted = frame.fit_to(4, 4);
        // Bytes clone shares the underlying buffer
        assert_eq!(fitted.data.as_ptr(), frame.data.as_ptr());
    }

    #[test]
    fn test_fit_to_pads_smaller_source() {
        let frame = frame_with_value(2, 2, 9);
        let fitted = frame.fit_to(4, 4);
        assert!(fitted.matches(4, 4));
        assert_eq!(fitted.data.len(), VideoFrame::byte_len(4, 4));

        // top-left pixel came from the source
        assert_eq!(fitted.data[0], 9);
        // outside the source: black with opaque alpha
        let last = &fitted.data[fitted.data.len() - 4..];
        assert_eq!(last, &[0, 0, 0, 0xff]);
    }

    #[test]
    fn test_fit_to_crops_larger_source() {
        let frame = frame_with_value(8, 8, 5);
        let fitted = frame.fit_to(4, 4);
        assert!(fitted.matches(4, 4));
        assert_eq!(fitted.data.len(), VideoFrame::byte_len(4, 4));
        assert!(fitted.data.iter().step_by(4).all(|&b| b == 5));
    }

    #[test]
    fn test_black_frame_is_opaque() {
        let frame = VideoFrame::black(3, 3);
        assert_eq!(frame.data.len(), VideoFrame::byte_len(3, 3));
        for px in frame.data.chunks_exact(4) {
            assert_eq!(px, &[0, 0, 0, 0xff]);
        }
    }
}
