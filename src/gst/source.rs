// SPDX-License-Identifier: MPL-2.0

//! GStreamer backed [`StreamSource`].
//!
//! With demuxing enabled the file goes through `parsebin`; otherwise it is
//! read as an elementary stream and handed to the codec's parser. Either way
//! the appsink only accepts whole access units (or AV1 temporal units).

use std::str::FromStr;

use gstreamer::prelude::*;
use tracing::{debug, info};

use super::{detection, escape_path, pop_bus_error};
use crate::stream::{
    ChromaSubsampling, CodecId, CodedUnit, Extent, SourceOptions, StreamDescriptor, StreamSource,
};

const PREROLL_TIMEOUT: gstreamer::ClockTime = gstreamer::ClockTime::from_seconds(5);
/// Coded units parsed ahead of the decoder before the source blocks.
const READ_AHEAD_UNITS: u32 = 8;

/// Coded units pulled from a file through a parsing pipeline.
pub struct GstStreamSource {
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    descriptor: StreamDescriptor,
    units_read: u64,
    exhausted: bool,
}

impl GstStreamSource {
    /// Open the file, preroll and detect the stream geometry.
    pub fn open(options: &SourceOptions) -> eyre::Result<Self> {
        gstreamer::init()?;

        if !options.path.is_file() {
            eyre::bail!("{} is not a readable file", options.path.display());
        }

        let path_str = options
            .path
            .to_str()
            .ok_or_else(|| eyre::eyre!("Invalid path: {}", options.path.display()))?;
        let escaped_path = escape_path(path_str);

        let (pipeline_str, caps_str) = if options.demuxing_enabled {
            let caps = options
                .forced_codec
                .map(|codec| detection::coded_caps(codec).to_string())
                .unwrap_or_else(detection::any_coded_caps);
            (source_description(&escaped_path, "parsebin"), caps)
        } else {
            let codec = options
                .forced_codec
                .or_else(|| CodecId::from_extension(&options.path))
                .ok_or_else(|| {
                    eyre::eyre!(
                        "cannot tell the codec of {} without demuxing; force a parser type",
                        options.path.display()
                    )
                })?;
            let chain = detection::elementary_parser_chain(codec, &options.path);
            (
                source_description(&escaped_path, &chain),
                detection::coded_caps(codec).to_string(),
            )
        };

        debug!(pipeline = %pipeline_str, caps = %caps_str, "Creating stream source pipeline");

        let pipeline = gstreamer::parse::launch(&pipeline_str)?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| eyre::eyre!("Failed to create pipeline"))?;

        let appsink = pipeline
            .by_name("units")
            .ok_or_else(|| eyre::eyre!("Failed to get appsink from pipeline"))?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| eyre::eyre!("Element 'units' is not an AppSink"))?;

        let caps = gstreamer::Caps::from_str(&caps_str)?;
        appsink.set_caps(Some(&caps));

        let mut source = Self {
            pipeline,
            appsink,
            descriptor: StreamDescriptor {
                codec: options.forced_codec.unwrap_or(CodecId::H264),
                coded_extent: Extent::new(options.initial_width, options.initial_height),
                chroma: ChromaSubsampling::Yuv420,
                bit_depth: options.initial_bit_depth,
            },
            units_read: 0,
            exhausted: false,
        };

        source.preroll(options)?;

        info!(
            path = %options.path.display(),
            codec = %source.descriptor.codec,
            coded_size = %source.descriptor.coded_extent,
            chroma = %source.descriptor.chroma,
            bit_depth = source.descriptor.bit_depth,
            demuxing = options.demuxing_enabled,
            "Opened stream source"
        );

        Ok(source)
    }

    fn preroll(&mut self, options: &SourceOptions) -> eyre::Result<()> {
        self.pipeline
            .set_state(gstreamer::State::Paused)
            .map_err(|e| eyre::eyre!("Failed to preroll source: {:?}", e))?;

        let (res, state, _) = self.pipeline.state(PREROLL_TIMEOUT);
        if let Some(err) = pop_bus_error(&self.pipeline) {
            return Err(err);
        }
        if res.is_err() || state != gstreamer::State::Paused {
            eyre::bail!("source did not preroll (state {state:?})");
        }

        let caps = self
            .appsink
            .static_pad("sink")
            .and_then(|pad| pad.current_caps())
            .ok_or_else(|| eyre::eyre!("no supported video stream in {}", options.path.display()))?;
        let structure = caps
            .structure(0)
            .ok_or_else(|| eyre::eyre!("empty caps on stream source"))?;

        debug!(caps = %caps, "Negotiated coded caps");
        self.descriptor = descriptor_from_caps(structure, options)?;

        self.pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| eyre::eyre!("Failed to start source: {:?}", e))?;
        Ok(())
    }

    /// Coded units returned so far.
    #[must_use]
    pub fn units_read(&self) -> u64 {
        self.units_read
    }
}

/// `gst-launch` description of a source pipeline; the appsink blocks once
/// [`READ_AHEAD_UNITS`] units are waiting.
pub(crate) fn source_description(escaped_path: &str, parse_chain: &str) -> String {
    format!(
        concat!(
            "filesrc location=\"{path}\" ! {chain} ! ",
            "appsink name=units sync=false max-buffers={read_ahead} drop=false"
        ),
        path = escaped_path,
        chain = parse_chain,
        read_ahead = READ_AHEAD_UNITS,
    )
}

/// Stream geometry from parser caps, falling back to the open hints.
pub(crate) fn descriptor_from_caps(
    structure: &gstreamer::StructureRef,
    options: &SourceOptions,
) -> eyre::Result<StreamDescriptor> {
    let codec = detection::codec_from_caps_name(structure.name())
        .or(options.forced_codec)
        .ok_or_else(|| eyre::eyre!("unsupported coded format {}", structure.name()))?;

    let dimension = |field: &str, hint: u32| {
        structure
            .get::<i32>(field)
            .ok()
            .and_then(|v| u32::try_from(v).ok())
            .filter(|&v| v > 0)
            .unwrap_or(hint)
    };

    let chroma = structure
        .get::<&str>("chroma-format")
        .ok()
        .and_then(ChromaSubsampling::from_notation)
        .unwrap_or(ChromaSubsampling::Yuv420);

    let bit_depth = structure
        .get::<u32>("bit-depth-luma")
        .ok()
        .filter(|&depth| depth > 0)
        .unwrap_or(options.initial_bit_depth.max(8));

    Ok(StreamDescriptor {
        codec,
        coded_extent: Extent::new(
            dimension("width", options.initial_width),
            dimension("height", options.initial_height),
        ),
        chroma,
        bit_depth,
    })
}

impl StreamSource for GstStreamSource {
    fn descriptor(&self) -> StreamDescriptor {
        self.descriptor
    }

    fn next_unit(&mut self) -> eyre::Result<Option<CodedUnit>> {
        if self.exhausted {
            return Ok(None);
        }

        match self.appsink.pull_sample() {
            Ok(sample) => {
                let buffer = sample
                    .buffer()
                    .ok_or_else(|| eyre::eyre!("coded sample without buffer"))?;
                let map = buffer.map_readable()?;
                self.units_read += 1;
                Ok(Some(CodedUnit {
                    data: map.as_slice().to_vec(),
                    pts: buffer.pts().map(|p| p.nseconds()),
                }))
            }
            Err(_) if self.appsink.is_eos() => {
                debug!(units = self.units_read, "Stream source exhausted");
                self.exhausted = true;
                Ok(None)
            }
            Err(e) => Err(pop_bus_error(&self.pipeline)
                .unwrap_or_else(|| eyre::eyre!("failed to read coded unit: {e}"))),
        }
    }
}

impl Drop for GstStreamSource {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}
