// SPDX-License-Identifier: MPL-2.0

//! Pipeline assembly and the pull loop.
//!
//! ```text
//! ExecutionContextSet ─┐
//!                      ▼
//!   open source ──► open sink (output path only) ──► create decoder
//!                                                        │
//!                    run: pull_step(0), pull_step(1), ... until no more work
//! ```
//!
//! The first failing stage aborts assembly; later stages are never
//! attempted.

use tracing::{debug, error, info, warn};

use crate::{
    capability::CapabilityRequest,
    decoder::{DecoderOptions, DecoderQueue, HardwareDecoder, VideoQueue},
    device::{DeviceBackend, DeviceSelector, ExecutionContextSet, negotiate},
    error::{PipelineError, boxed},
    sink::{FrameSink, SinkOptions},
    stream::{ChromaSubsampling, CodecId, Extent, SourceOptions, StreamDescriptor, StreamSource},
};

/// Constructs the external pipeline stages.
pub trait StageFactory {
    fn open_source(&mut self, options: &SourceOptions) -> eyre::Result<Box<dyn StreamSource>>;

    fn open_sink(&mut self, options: &SinkOptions) -> eyre::Result<Box<dyn FrameSink>>;

    fn create_decoder(
        &mut self,
        contexts: &ExecutionContextSet,
        source: &dyn StreamSource,
        sink: Option<&dyn FrameSink>,
        options: &DecoderOptions,
    ) -> eyre::Result<Box<dyn HardwareDecoder>>;
}

/// Stage options of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub source: SourceOptions,
    /// `None` when no output path is configured.
    pub sink: Option<SinkOptions>,
    pub decoder: DecoderOptions,
}

/// Negotiated stream properties reported after decoder creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub codec: CodecId,
    pub coded_extent: Extent,
    pub chroma: ChromaSubsampling,
    pub bit_depth: u32,
}

/// Why the pull loop stopped.
#[derive(Debug)]
pub enum TerminationReason {
    StreamExhausted,
    FatalError(PipelineError),
}

#[derive(Debug)]
pub struct RunResult {
    pub frames_processed: u64,
    pub steps: u64,
    pub termination: TerminationReason,
}

impl RunResult {
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self.termination, TerminationReason::StreamExhausted)
    }

    /// Frames processed, or the fatal step error.
    pub fn into_result(self) -> Result<u64, PipelineError> {
        match self.termination {
            TerminationReason::StreamExhausted => Ok(self.frames_processed),
            TerminationReason::FatalError(err) => Err(err),
        }
    }
}

/// An assembled pipeline owning its stages and execution contexts.
pub struct Pipeline {
    // Dropped first, while the source and sink are still alive.
    decoder: Box<dyn HardwareDecoder>,
    sink: Option<Box<dyn FrameSink>>,
    source: Box<dyn StreamSource>,
    contexts: ExecutionContextSet,
    steps_run: u64,
}

impl Pipeline {
    /// Build source, sink and decoder in that order.
    ///
    /// # Errors
    ///
    /// [`PipelineError::SourceOpen`], [`PipelineError::SinkOpen`] or
    /// [`PipelineError::DecoderCreation`] for the first stage that fails.
    pub fn assemble(
        contexts: ExecutionContextSet,
        factory: &mut dyn StageFactory,
        config: &PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let source = factory
            .open_source(&config.source)
            .map_err(|report| PipelineError::SourceOpen {
                path: config.source.path.display().to_string(),
                source: boxed(report),
            })?;

        debug!(descriptor = ?source.descriptor(), "Stream source opened");

        let sink = match &config.sink {
            Some(options) => Some(factory.open_sink(options).map_err(|report| {
                PipelineError::SinkOpen {
                    path: options.path.display().to_string(),
                    source: boxed(report),
                }
            })?),
            None => {
                debug!("No output path, decoding without a frame sink");
                None
            }
        };

        let decoder = factory
            .create_decoder(&contexts, source.as_ref(), sink.as_deref(), &config.decoder)
            .map_err(|report| PipelineError::DecoderCreation(boxed(report)))?;

        let pipeline = Self {
            decoder,
            sink,
            source,
            contexts,
            steps_run: 0,
        };
        pipeline.report_stream_info();
        Ok(pipeline)
    }

    /// Codec, coded size and chroma format as negotiated by the decoder.
    #[must_use]
    pub fn stream_info(&self) -> StreamInfo {
        let profile = self.decoder.negotiated_profile();
        StreamInfo {
            codec: profile.codec,
            coded_extent: self.decoder.coded_extent(),
            chroma: profile.chroma,
            bit_depth: profile.luma_bit_depth,
        }
    }

    fn report_stream_info(&self) {
        let info = self.stream_info();
        info!(
            codec = %info.codec,
            coded_width = info.coded_extent.width,
            coded_height = info.coded_extent.height,
            chroma = %info.chroma,
            bit_depth = info.bit_depth,
            "Stream information"
        );
    }

    #[must_use]
    pub fn contexts(&self) -> &ExecutionContextSet {
        &self.contexts
    }

    #[must_use]
    pub fn source_descriptor(&self) -> StreamDescriptor {
        self.source.descriptor()
    }

    #[must_use]
    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// Pull steps until the decoder reports no more work or a step fails.
    pub fn run(&mut self) -> RunResult {
        let sink = self
            .sink
            .as_mut()
            .map(|sink| sink.as_mut() as &mut dyn FrameSink);
        let mut queue = DecoderQueue::new(self.decoder.as_mut(), self.source.as_mut(), sink);

        let mut frames_processed = 0;
        let mut step = self.steps_run;
        let termination = loop {
            let delivered_before = queue.frames_delivered();
            match queue.pull_step(step) {
                Ok(status) => {
                    frames_processed += status.frames_emitted;
                    step += 1;
                    if !status.more_work {
                        break TerminationReason::StreamExhausted;
                    }
                }
                Err(report) => {
                    // Frames the sink took before the step failed still count.
                    frames_processed += queue.frames_delivered() - delivered_before;
                    error!(step, error = %report, "Decode step failed");
                    step += 1;
                    break TerminationReason::FatalError(PipelineError::StepFatal {
                        step: step - 1,
                        source: boxed(report),
                    });
                }
            }
        };

        let steps = step - self.steps_run;
        self.steps_run = step;

        info!(frames = frames_processed, steps, "Decode loop finished");

        RunResult {
            frames_processed,
            steps,
            termination,
        }
    }

    /// Tear down the decoder and finish the sink, returning its aggregate CRCs.
    ///
    /// # Errors
    ///
    /// [`PipelineError::StepFatal`] when the sink cannot flush its outputs.
    pub fn finish(self) -> Result<Vec<u32>, PipelineError> {
        let Self {
            decoder,
            sink,
            source,
            steps_run,
            ..
        } = self;
        drop(decoder);
        drop(source);

        match sink {
            Some(mut sink) => sink.finish().map_err(|report| PipelineError::StepFatal {
                step: steps_run,
                source: boxed(report),
            }),
            None => Ok(Vec::new()),
        }
    }
}

/// Totals of a run that reached the end of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeSummary {
    pub frames: u64,
    pub steps: u64,
    /// Aggregate CRC per seed, empty without CRC output.
    pub crcs: Vec<u32>,
}

/// Negotiate devices, assemble the stages, run to completion and finish the
/// sink. Nothing is opened when negotiation fails.
///
/// # Errors
///
/// The [`PipelineError`] of the first stage that fails.
pub fn decode(
    backend: &mut dyn DeviceBackend,
    request: &CapabilityRequest,
    selector: &DeviceSelector,
    factory: &mut dyn StageFactory,
    config: &PipelineConfig,
) -> Result<DecodeSummary, PipelineError> {
    let contexts = negotiate(backend, request, selector)?;
    let mut pipeline = Pipeline::assemble(contexts, factory, config)?;

    let result = pipeline.run();
    let (frames, steps) = (result.frames_processed, result.steps);
    if let TerminationReason::FatalError(err) = result.termination {
        warn!(frames, steps, "Decode aborted after partial output");
        return Err(err);
    }

    let crcs = pipeline.finish()?;
    Ok(DecodeSummary {
        frames,
        steps,
        crcs,
    })
}
