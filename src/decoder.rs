// SPDX-License-Identifier: MPL-2.0

//! Hardware decoder seam and the pull queue wrapped around it.

use crate::{
    sink::{DecodedFrame, FrameSink},
    stream::{ChromaSubsampling, CodecId, Extent, StreamSource},
};

/// Video profile the decoder settled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileInfo {
    pub codec: CodecId,
    pub chroma: ChromaSubsampling,
    pub luma_bit_depth: u32,
    pub chroma_bit_depth: u32,
}

/// Options passed to the decoder at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderOptions {
    /// Coded units kept in flight.
    pub queue_depth: u32,
    /// Decode queue pinned for submission.
    pub queue_id: u32,
    pub post_process_filter: Option<u32>,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self {
            queue_depth: 5,
            queue_id: 0,
            post_process_filter: None,
        }
    }
}

/// Outcome of one processing step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepStatus {
    /// Frames handed to the sink during the step.
    pub frames_emitted: u64,
    /// Whether another step can make progress.
    pub more_work: bool,
}

impl StepStatus {
    #[must_use]
    pub const fn more(frames_emitted: u64) -> Self {
        Self {
            frames_emitted,
            more_work: true,
        }
    }

    #[must_use]
    pub const fn done(frames_emitted: u64) -> Self {
        Self {
            frames_emitted,
            more_work: false,
        }
    }
}

/// A decoder bound to an execution context set.
///
/// The source and sink are lent for the duration of one step; the decoder
/// never owns them.
pub trait HardwareDecoder {
    fn negotiated_profile(&self) -> ProfileInfo;

    fn coded_extent(&self) -> Extent;

    fn process_step(
        &mut self,
        step: u64,
        source: &mut dyn StreamSource,
        sink: Option<&mut dyn FrameSink>,
    ) -> eyre::Result<StepStatus>;
}

/// Pull interface over decoded work.
pub trait VideoQueue {
    /// Run the next processing step.
    fn pull_step(&mut self, step: u64) -> eyre::Result<StepStatus>;
}

/// [`VideoQueue`] lending a source and sink to a decoder on every pull.
pub struct DecoderQueue<'a> {
    decoder: &'a mut dyn HardwareDecoder,
    source: &'a mut dyn StreamSource,
    sink: Option<&'a mut dyn FrameSink>,
    frames_delivered: u64,
}

impl<'a> DecoderQueue<'a> {
    pub fn new(
        decoder: &'a mut dyn HardwareDecoder,
        source: &'a mut dyn StreamSource,
        sink: Option<&'a mut dyn FrameSink>,
    ) -> Self {
        Self {
            decoder,
            source,
            sink,
            frames_delivered: 0,
        }
    }

    /// Frames the sink accepted so far, including those of a failed step.
    #[must_use]
    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered
    }
}

impl VideoQueue for DecoderQueue<'_> {
    fn pull_step(&mut self, step: u64) -> eyre::Result<StepStatus> {
        let mut counting = self.sink.as_mut().map(|sink| CountingSink {
            inner: &mut **sink,
            written: &mut self.frames_delivered,
        });
        let sink = counting.as_mut().map(|sink| sink as &mut dyn FrameSink);
        self.decoder.process_step(step, &mut *self.source, sink)
    }
}

struct CountingSink<'s> {
    inner: &'s mut dyn FrameSink,
    written: &'s mut u64,
}

impl FrameSink for CountingSink<'_> {
    fn write_frame(&mut self, frame: &DecodedFrame) -> eyre::Result<()> {
        self.inner.write_frame(frame)?;
        *self.written += 1;
        Ok(())
    }

    fn finish(&mut self) -> eyre::Result<Vec<u32>> {
        self.inner.finish()
    }
}
