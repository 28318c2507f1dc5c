// SPDX-License-Identifier: MPL-2.0

//! GStreamer backed pipeline stages.
//!
//! - [`source`]: container demuxing or elementary stream parsing
//! - [`decoder`]: hardware decode through the best usable element
//! - [`detection`]: decoder element probing
//!
//! # Decoder Priority (Highest to Lowest)
//!
//! | Backend | H.264 | H.265 | AV1 |
//! |---------|-------|-------|-----|
//! | Vulkan Video | `vulkanh264dec` | `vulkanh265dec` | `vulkanav1dec` |
//! | VA-API | `vah264dec` | `vah265dec` | `vaav1dec` |
//! | NVDEC | `nvh264dec` | `nvh265dec` | `nvav1dec` |
//! | V4L2 stateless | `v4l2slh264dec` | `v4l2slh265dec` | `v4l2slav1dec` |
//! | Software | `avdec_h264` | `avdec_h265` | `dav1ddec` |
//!
//! Vulkan Video elements are only used when the negotiated decode queue
//! family supports the stream's codec.

mod decoder;
pub mod detection;
mod source;

use gstreamer::prelude::*;
use tracing::warn;

pub use decoder::GstVideoDecoder;
pub use source::GstStreamSource;

use crate::{
    decoder::{DecoderOptions, HardwareDecoder},
    device::ExecutionContextSet,
    pipeline::StageFactory,
    sink::{FileFrameSink, FrameSink, SinkOptions},
    stream::{SourceOptions, StreamSource},
};

/// [`StageFactory`] building GStreamer sources and decoders and file sinks.
#[derive(Debug, Default)]
pub struct GstStageFactory;

impl StageFactory for GstStageFactory {
    fn open_source(&mut self, options: &SourceOptions) -> eyre::Result<Box<dyn StreamSource>> {
        Ok(Box::new(GstStreamSource::open(options)?))
    }

    fn open_sink(&mut self, options: &SinkOptions) -> eyre::Result<Box<dyn FrameSink>> {
        Ok(Box::new(FileFrameSink::open(options)?))
    }

    fn create_decoder(
        &mut self,
        contexts: &ExecutionContextSet,
        source: &dyn StreamSource,
        sink: Option<&dyn FrameSink>,
        options: &DecoderOptions,
    ) -> eyre::Result<Box<dyn HardwareDecoder>> {
        Ok(Box::new(GstVideoDecoder::create(
            contexts,
            &source.descriptor(),
            sink.is_some(),
            options,
        )?))
    }
}

/// Quote a path for `gst-launch` syntax.
pub(crate) fn escape_path(path: &str) -> String {
    path.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Drain pending bus messages, returning the first error.
pub(crate) fn pop_bus_error(pipeline: &gstreamer::Pipeline) -> Option<eyre::Report> {
    use gstreamer::MessageView;

    let bus = pipeline.bus()?;
    while let Some(msg) = bus.pop() {
        match msg.view() {
            MessageView::Error(err) => {
                return Some(eyre::eyre!(
                    "{} ({})",
                    err.error(),
                    err.src()
                        .map(|s| s.path_string().to_string())
                        .unwrap_or_default()
                ));
            }
            MessageView::Warning(warning) => {
                warn!(
                    src = ?warning.src().map(|s| s.path_string()),
                    error = %warning.error(),
                    "GStreamer pipeline warning"
                );
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests;
