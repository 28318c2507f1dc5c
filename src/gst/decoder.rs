// SPDX-License-Identifier: MPL-2.0

//! GStreamer backed [`HardwareDecoder`].
//!
//! ```text
//! appsrc (coded units) → parser → decoder [→ download] → videoconvert → appsink (planar)
//! ```
//!
//! Each step pushes at most one coded unit and collects whatever frames are
//! ready. Once more than `queue_depth` units wait in the appsrc the step
//! waits for output. After the source runs dry the decoder is sent EOS and fully
//! drained within that step.

use std::str::FromStr;

use gstreamer::prelude::*;
use gstreamer_video::prelude::*;
use tracing::{debug, info, warn};

use super::{
    detection::{self, DecoderBackend, DecoderCandidate},
    pop_bus_error,
};
use crate::{
    decoder::{DecoderOptions, HardwareDecoder, ProfileInfo, StepStatus},
    device::ExecutionContextSet,
    sink::{DecodedFrame, FrameSink},
    stream::{Extent, StreamDescriptor, StreamSource},
};

/// Wait for output while the in-flight window is full.
const BACKPRESSURE_TIMEOUT: gstreamer::ClockTime = gstreamer::ClockTime::from_mseconds(500);
const DRAIN_TIMEOUT: gstreamer::ClockTime = gstreamer::ClockTime::from_seconds(10);

pub struct GstVideoDecoder {
    pipeline: gstreamer::Pipeline,
    appsrc: gstreamer_app::AppSrc,
    appsink: gstreamer_app::AppSink,
    candidate: DecoderCandidate,
    profile: ProfileInfo,
    coded_extent: Extent,
    queue_depth: u64,
    units_pushed: u64,
    frames_out: u64,
    eos_sent: bool,
    finished: bool,
}

impl GstVideoDecoder {
    /// Build the decode pipeline with the first usable decoder element.
    pub fn create(
        contexts: &ExecutionContextSet,
        descriptor: &StreamDescriptor,
        has_sink: bool,
        options: &DecoderOptions,
    ) -> eyre::Result<Self> {
        gstreamer::init()?;

        static LOGGED_DECODERS: std::sync::Once = std::sync::Once::new();
        LOGGED_DECODERS.call_once(|| {
            detection::get_decoder_support();
        });

        let codec = descriptor.codec;
        let vulkan_allowed = contexts.decode_codecs().contains(codec.decode_operation());
        if !vulkan_allowed {
            warn!(
                codec = %codec,
                family = contexts.decode_queue_family(),
                "Decode queue family lacks this codec, Vulkan Video decode disabled"
            );
        }

        let queue_index = contexts.decode_queue_index(options.queue_id);
        if let Some(filter) = options.post_process_filter {
            debug!(
                filter,
                compute_family = ?contexts.compute_queue_family(),
                "Post-process filter bound to compute queue"
            );
        }

        let candidates = detection::usable_candidates(codec, vulkan_allowed);
        if candidates.is_empty() {
            eyre::bail!("no usable {codec} decoder element found");
        }

        let format = detection::raw_format(descriptor.chroma, descriptor.bit_depth);
        let queue_depth = u64::from(options.queue_depth.max(1));

        let parser = detection::parser_element(codec);
        let (pipeline, candidate) = candidates
            .iter()
            .find_map(|candidate| {
                let pipeline_str = pipeline_description(parser, candidate, format, queue_depth);
                debug!(pipeline = %pipeline_str, "Trying decode pipeline");
                match launch(&pipeline_str) {
                    Ok(pipeline) => Some((pipeline, *candidate)),
                    Err(e) => {
                        debug!(element = candidate.element, error = %e, "Decode pipeline failed");
                        None
                    }
                }
            })
            .ok_or_else(|| eyre::eyre!("no {codec} decode pipeline could be started"))?;

        let appsrc = pipeline
            .by_name("units")
            .ok_or_else(|| eyre::eyre!("Failed to get appsrc from pipeline"))?
            .downcast::<gstreamer_app::AppSrc>()
            .map_err(|_| eyre::eyre!("Element 'units' is not an AppSrc"))?;
        let appsink = pipeline
            .by_name("frames")
            .ok_or_else(|| eyre::eyre!("Failed to get appsink from pipeline"))?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| eyre::eyre!("Element 'frames' is not an AppSink"))?;

        appsrc.set_caps(Some(&gstreamer::Caps::from_str(detection::coded_caps(codec))?));

        let bit_depth = descriptor.bit_depth.max(8);
        let profile = ProfileInfo {
            codec,
            chroma: descriptor.chroma,
            luma_bit_depth: bit_depth,
            chroma_bit_depth: bit_depth,
        };

        info!(
            decoder = candidate.element,
            backend = ?candidate.backend,
            hardware = candidate.backend.is_hardware(),
            codec = %codec,
            format,
            queue_depth,
            queue_index,
            has_sink,
            "Created hardware decoder"
        );

        if candidate.backend == DecoderBackend::Software {
            warn!(codec = %codec, "No hardware decoder usable, decoding in software");
        }

        Ok(Self {
            pipeline,
            appsrc,
            appsink,
            candidate,
            profile,
            coded_extent: descriptor.coded_extent,
            queue_depth,
            units_pushed: 0,
            frames_out: 0,
            eos_sent: false,
            finished: false,
        })
    }

    /// Coded units the decoder has not taken from the appsrc yet.
    fn queued_units(&self) -> u64 {
        self.appsrc.property::<u64>("current-level-buffers")
    }

    fn emit(
        &mut self,
        sample: &gstreamer::Sample,
        step: u64,
        sink: &mut Option<&mut dyn FrameSink>,
    ) -> eyre::Result<()> {
        let frame = self.frame_from_sample(sample, step)?;
        if frame.extent != self.coded_extent {
            debug!(old = %self.coded_extent, new = %frame.extent, "Decoded size changed");
            self.coded_extent = frame.extent;
        }
        if let Some(sink) = sink.as_deref_mut() {
            sink.write_frame(&frame)?;
        }
        self.frames_out += 1;
        Ok(())
    }

    fn frame_from_sample(&self, sample: &gstreamer::Sample, step: u64) -> eyre::Result<DecodedFrame> {
        let buffer = sample
            .buffer()
            .ok_or_else(|| eyre::eyre!("decoded sample without buffer"))?;
        let caps = sample
            .caps()
            .ok_or_else(|| eyre::eyre!("decoded sample without caps"))?;
        let info = gstreamer_video::VideoInfo::from_caps(caps)?;
        let frame = gstreamer_video::VideoFrameRef::from_buffer_ref_readable(buffer, &info)?;

        let mut planes = Vec::with_capacity(frame.n_planes() as usize);
        for plane in 0..frame.n_planes() {
            let data = frame.plane_data(plane)?;
            let stride = frame.plane_stride()[plane as usize] as usize;
            let row_bytes = frame.comp_width(plane) as usize * frame.comp_pstride(plane) as usize;
            let rows = frame.comp_height(plane) as usize;

            let mut packed = Vec::with_capacity(row_bytes * rows);
            for row in data.chunks(stride).take(rows) {
                packed.extend_from_slice(&row[..row_bytes.min(row.len())]);
            }
            planes.push(packed);
        }

        let fps = info.fps();
        let frame_rate = (fps.numer() > 0 && fps.denom() > 0)
            .then(|| (fps.numer() as u32, fps.denom() as u32));

        Ok(DecodedFrame {
            index: self.frames_out,
            step,
            pts: buffer.pts().map(|p| p.nseconds()),
            extent: Extent::new(info.width(), info.height()),
            chroma: self.profile.chroma,
            bit_depth: self.profile.luma_bit_depth,
            frame_rate,
            planes,
        })
    }

    fn check_bus(&self) -> eyre::Result<()> {
        match pop_bus_error(&self.pipeline) {
            Some(err) => Err(err.wrap_err(format!("{} failed", self.candidate.element))),
            None => Ok(()),
        }
    }
}

impl HardwareDecoder for GstVideoDecoder {
    fn negotiated_profile(&self) -> ProfileInfo {
        self.profile
    }

    fn coded_extent(&self) -> Extent {
        self.coded_extent
    }

    fn process_step(
        &mut self,
        step: u64,
        source: &mut dyn StreamSource,
        mut sink: Option<&mut dyn FrameSink>,
    ) -> eyre::Result<StepStatus> {
        if self.finished {
            return Ok(StepStatus::done(0));
        }
        self.check_bus()?;

        if !self.eos_sent {
            match source.next_unit()? {
                Some(unit) => {
                    let mut buffer = gstreamer::Buffer::from_mut_slice(unit.data);
                    if let Some(pts) = unit.pts {
                        buffer
                            .get_mut()
                            .ok_or_else(|| eyre::eyre!("coded buffer not writable"))?
                            .set_pts(gstreamer::ClockTime::from_nseconds(pts));
                    }
                    self.appsrc
                        .push_buffer(buffer)
                        .map_err(|e| eyre::eyre!("decoder rejected coded unit: {e:?}"))?;
                    self.units_pushed += 1;
                }
                None => {
                    self.appsrc
                        .end_of_stream()
                        .map_err(|e| eyre::eyre!("failed to signal end of stream: {e:?}"))?;
                    self.eos_sent = true;
                    debug!(units = self.units_pushed, "Coded stream ended, draining decoder");
                }
            }
        }

        let before = self.frames_out;

        if self.eos_sent {
            while let Some(sample) = self.appsink.try_pull_sample(DRAIN_TIMEOUT) {
                self.emit(&sample, step, &mut sink)?;
            }
            self.check_bus()?;
            if !self.appsink.is_eos() {
                eyre::bail!("{} did not drain within {DRAIN_TIMEOUT}", self.candidate.element);
            }
            self.finished = true;
            info!(frames = self.frames_out, units = self.units_pushed, "Decoder drained");
            return Ok(StepStatus::done(self.frames_out - before));
        }

        loop {
            let timeout = backpressure_timeout(self.queued_units(), self.queue_depth);
            match self.appsink.try_pull_sample(timeout) {
                Some(sample) => self.emit(&sample, step, &mut sink)?,
                None => break,
            }
        }

        Ok(StepStatus::more(self.frames_out - before))
    }
}

impl Drop for GstVideoDecoder {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}

/// Wait for a decoded frame only while more than `queue_depth` units sit in
/// the appsrc, independent of how many units make up a frame.
pub(crate) fn backpressure_timeout(queued_units: u64, queue_depth: u64) -> gstreamer::ClockTime {
    if queued_units > queue_depth {
        BACKPRESSURE_TIMEOUT
    } else {
        gstreamer::ClockTime::ZERO
    }
}

/// `gst-launch` description of a decode pipeline.
pub(crate) fn pipeline_description(
    parser: &str,
    candidate: &DecoderCandidate,
    format: &str,
    queue_depth: u64,
) -> String {
    let download = candidate
        .download
        .map(|element| format!(" ! {element}"))
        .unwrap_or_default();

    format!(
        concat!(
            "appsrc name=units is-live=false ! ",
            "{parser} ! {decoder}{download} ! ",
            "videoconvert ! video/x-raw,format={format} ! ",
            "appsink name=frames sync=false max-buffers={depth}"
        ),
        parser = parser,
        decoder = candidate.element,
        download = download,
        format = format,
        depth = queue_depth,
    )
}

fn launch(pipeline_str: &str) -> eyre::Result<gstreamer::Pipeline> {
    let pipeline = gstreamer::parse::launch(pipeline_str)?
        .downcast::<gstreamer::Pipeline>()
        .map_err(|_| eyre::eyre!("Failed to create pipeline"))?;

    if let Err(e) = pipeline.set_state(gstreamer::State::Playing) {
        let _ = pipeline.set_state(gstreamer::State::Null);
        eyre::bail!("Failed to start pipeline: {e:?}");
    }
    Ok(pipeline)
}
