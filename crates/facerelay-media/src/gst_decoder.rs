//! GStreamer-based H.264 decoder
//!
//! Pipeline: appsrc (Annex B access units) → h264parse → decoder → videoconvert → appsink (RGB).
//! Hardware decoders are preferred; the relay runs on servers, so software
//! decoding is an accepted fallback.

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;

use crate::codec::{DecoderFactory, VideoDecoder, VideoFrame};
use crate::error::MediaError;

fn gst_err(e: impl std::fmt::Display) -> MediaError {
    MediaError::Decode(e.to_string())
}

/// Find the best H.264 decoder element installed on this system
fn detect_decoder() -> Result<&'static str, MediaError> {
    gst::init().map_err(|e| MediaError::DecoderUnavailable(e.to_string()))?;

    #[cfg(target_os = "macos")]
    let hardware = vec![("vtdec_hw", "VideoToolbox (hardware only)")];

    #[cfg(not(target_os = "macos"))]
    let hardware = vec![
        ("nvh264dec", "NVIDIA NVDEC H.264"),
        ("vaapih264dec", "VAAPI H.264 (Intel/AMD)"),
    ];

    let software = [("avdec_h264", "libav H.264"), ("openh264dec", "OpenH264")];

    for (element_name, description) in hardware.iter().chain(software.iter()) {
        if gst::ElementFactory::find(element_name).is_some() {
            tracing::info!("Using H.264 decoder: {} ({})", description, element_name);
            return Ok(*element_name);
        }
    }

    Err(MediaError::DecoderUnavailable(
        "no H.264 decoder element found; install gst-libav or gst-plugins-bad".to_string(),
    ))
}

/// Builds one [`GstH264Decoder`] per track
#[derive(Debug, Default)]
pub struct GstDecoderFactory;

impl DecoderFactory for GstDecoderFactory {
    fn create(&self) -> Result<Box<dyn VideoDecoder>, MediaError> {
        Ok(Box::new(GstH264Decoder::new()?))
    }
}

/// H.264 decoder producing RGB24 frames
pub struct GstH264Decoder {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    appsink: gst_app::AppSink,
    decoder_name: String,
}

impl GstH264Decoder {
    pub fn new() -> Result<Self, MediaError> {
        let decoder = detect_decoder()?;

        let pipeline_str = format!(
            "appsrc name=src format=time is-live=true do-timestamp=true \
             caps=video/x-h264,stream-format=byte-stream,alignment=au ! \
             h264parse ! \
             {} ! \
             videoconvert ! video/x-raw,format=RGB ! \
             appsink name=sink sync=false max-buffers=1 drop=true",
            decoder
        );

        tracing::debug!("Creating H.264 decoder: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(gst_err)?
            .downcast::<gst::Pipeline>()
            .map_err(|_| gst_err("failed to downcast to Pipeline"))?;

        let appsrc = pipeline
            .by_name("src")
            .ok_or_else(|| gst_err("could not find appsrc"))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| gst_err("failed to downcast to AppSrc"))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| gst_err("could not find appsink"))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| gst_err("failed to downcast to AppSink"))?;

        pipeline.set_state(gst::State::Playing).map_err(gst_err)?;

        Ok(Self {
            pipeline,
            appsrc,
            appsink,
            decoder_name: decoder.to_string(),
        })
    }

    fn drain_bus(&self) -> Result<(), MediaError> {
        if let Some(bus) = self.pipeline.bus() {
            while let Some(msg) = bus.pop() {
                use gst::MessageView;
                match msg.view() {
                    MessageView::Error(err) => {
                        return Err(MediaError::Decode(format!(
                            "{} ({:?})",
                            err.error(),
                            err.debug()
                        )));
                    }
                    MessageView::Warning(warn) => {
                        tracing::debug!("Decoder pipeline warning: {}", warn.error());
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

impl VideoDecoder for GstH264Decoder {
    fn decode(&mut self, access_unit: &[u8]) -> Result<Option<VideoFrame>, MediaError> {
        if access_unit.is_empty() {
            return Ok(None);
        }

        let buffer = gst::Buffer::from_mut_slice(access_unit.to_vec());
        self.appsrc.push_buffer(buffer).map_err(gst_err)?;

        self.drain_bus()?;

        let Some(sample) = self
            .appsink
            .try_pull_sample(gst::ClockTime::from_mseconds(10))
        else {
            return Ok(None);
        };

        let buffer = sample.buffer().ok_or_else(|| gst_err("no buffer in sample"))?;
        let caps = sample.caps().ok_or_else(|| gst_err("no caps in sample"))?;
        let info = gst_video::VideoInfo::from_caps(caps).map_err(gst_err)?;

        let width = info.width();
        let height = info.height();
        let stride = info.stride()[0] as usize;
        let row_len = width as usize * 3;

        let map = buffer.map_readable().map_err(gst_err)?;
        let src = map.as_slice();

        // videoconvert pads RGB rows to 4-byte alignment
        let mut data = Vec::with_capacity(row_len * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            let end = start + row_len;
            if end > src.len() {
                return Err(gst_err("decoded buffer shorter than its caps"));
            }
            data.extend_from_slice(&src[start..end]);
        }

        VideoFrame::new(width, height, data).map(Some)
    }

    fn name(&self) -> &str {
        &self.decoder_name
    }
}

impl Drop for GstH264Decoder {
    fn drop(&mut self) {
        let _ = self.appsrc.end_of_stream();
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
