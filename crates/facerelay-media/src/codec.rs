//! Decoded video frames and the decoder seam
//!
//! Decoders produce packed RGB24 frames; the relay only ever ships JPEGs
//! onwards, so encoding lives here too.

use std::time::Instant;

use image::codecs::jpeg::JpegEncoder;
use image::ColorType;

use crate::error::MediaError;

/// JPEG quality used for on-demand captures
pub const FULL_QUALITY: u8 = 95;

/// A decoded RGB24 video frame
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    pub captured_at: Instant,
}

impl VideoFrame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, MediaError> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(MediaError::FrameSize {
                expected,
                actual: data.len(),
            });
        }

        Ok(Self {
            width,
            height,
            data,
            captured_at: Instant::now(),
        })
    }

    /// Encode the frame as a baseline JPEG
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, MediaError> {
        let mut out = Vec::with_capacity(self.data.len() / 8);
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
        encoder.encode(&self.data, self.width, self.height, ColorType::Rgb8)?;
        Ok(out)
    }
}

/// Video decoder fed with complete Annex B access units
pub trait VideoDecoder: Send {
    /// Returns `Ok(None)` while the decoder is still buffering
    fn decode(&mut self, access_unit: &[u8]) -> Result<Option<VideoFrame>, MediaError>;

    fn name(&self) -> &str;
}

/// Creates one decoder per inbound track
pub trait DecoderFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn VideoDecoder>, MediaError>;
}

/// Picks the best decoder compiled into this build
pub fn default_decoder_factory() -> Box<dyn DecoderFactory> {
    #[cfg(feature = "gstreamer")]
    {
        Box::new(crate::gst_decoder::GstDecoderFactory)
    }

    #[cfg(not(feature = "gstreamer"))]
    {
        Box::new(UnavailableDecoderFactory)
    }
}

/// Used when the build has no decoder; every track fails to open
#[derive(Debug, Default)]
pub struct UnavailableDecoderFactory;

impl DecoderFactory for UnavailableDecoderFactory {
    fn create(&self) -> Result<Box<dyn VideoDecoder>, MediaError> {
        Err(MediaError::DecoderUnavailable(
            "built without the `gstreamer` feature".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_buffers() {
        let err = VideoFrame::new(4, 4, vec![0; 10]).unwrap_err();
        assert!(matches!(
            err,
            MediaError::FrameSize {
                expected: 48,
                actual: 10
            }
        ));
    }

    #[test]
    fn encodes_a_jpeg() {
        let frame = VideoFrame::new(16, 8, vec![128; 16 * 8 * 3]).unwrap();
        let jpeg = frame.encode_jpeg(FULL_QUALITY).unwrap();

        // SOI and EOI markers
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn lower_quality_is_smaller() {
        let data: Vec<u8> = (0..64 * 64 * 3).map(|i| (i * 7 % 251) as u8).collect();
        let frame = VideoFrame::new(64, 64, data).unwrap();
        let high = frame.encode_jpeg(95).unwrap();
        let low = frame.encode_jpeg(20).unwrap();
        assert!(low.len() < high.len());
    }

    #[test]
    fn unavailable_factory_reports_why() {
        let err = UnavailableDecoderFactory.create().err().unwrap();
        assert!(err.to_string().contains("gstreamer"));
    }
}
