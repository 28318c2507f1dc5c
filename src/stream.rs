// SPDX-License-Identifier: MPL-2.0

//! Coded bitstream side of the pipeline.

use std::fmt;
use std::path::{Path, PathBuf};

use vk_video_dec_config::ParserType;

use crate::capability::CodecOperations;

/// Video codec of a coded stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecId {
    H264,
    H265,
    Av1,
}

impl CodecId {
    /// Human readable codec name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            CodecId::H264 => "H.264/AVC",
            CodecId::H265 => "H.265/HEVC",
            CodecId::Av1 => "AV1",
        }
    }

    /// Decode operation needed for this codec.
    #[must_use]
    pub fn decode_operation(self) -> CodecOperations {
        match self {
            CodecId::H264 => CodecOperations::DECODE_H264,
            CodecId::H265 => CodecOperations::DECODE_H265,
            CodecId::Av1 => CodecOperations::DECODE_AV1,
        }
    }

    /// Codec implied by an elementary stream file extension.
    #[must_use]
    pub fn from_extension(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "h264" | "264" | "avc" | "jsv" => Some(CodecId::H264),
            "h265" | "265" | "hevc" => Some(CodecId::H265),
            "ivf" | "obu" | "av1" => Some(CodecId::Av1),
            _ => None,
        }
    }
}

impl From<ParserType> for CodecId {
    fn from(parser: ParserType) -> Self {
        match parser {
            ParserType::H264 => CodecId::H264,
            ParserType::H265 => CodecId::H265,
            ParserType::Av1 => CodecId::Av1,
        }
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Chroma subsampling of decoded pictures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChromaSubsampling {
    Monochrome,
    Yuv420,
    Yuv422,
    Yuv444,
}

impl ChromaSubsampling {
    /// Parse the `J:a:b` notation used by stream caps.
    #[must_use]
    pub fn from_notation(s: &str) -> Option<Self> {
        match s {
            "4:0:0" => Some(Self::Monochrome),
            "4:2:0" => Some(Self::Yuv420),
            "4:2:2" => Some(Self::Yuv422),
            "4:4:4" => Some(Self::Yuv444),
            _ => None,
        }
    }

    #[must_use]
    pub fn notation(self) -> &'static str {
        match self {
            Self::Monochrome => "4:0:0",
            Self::Yuv420 => "4:2:0",
            Self::Yuv422 => "4:2:2",
            Self::Yuv444 => "4:4:4",
        }
    }

    /// Horizontal and vertical chroma shift.
    #[must_use]
    pub fn shift(self) -> (u32, u32) {
        match self {
            Self::Monochrome | Self::Yuv444 => (0, 0),
            Self::Yuv420 => (1, 1),
            Self::Yuv422 => (1, 0),
        }
    }

    /// Number of planes in a planar picture.
    #[must_use]
    pub fn plane_count(self) -> usize {
        match self {
            Self::Monochrome => 1,
            _ => 3,
        }
    }
}

impl fmt::Display for ChromaSubsampling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.notation())
    }
}

/// Picture size in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Stream geometry known once the source is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub codec: CodecId,
    pub coded_extent: Extent,
    pub chroma: ChromaSubsampling,
    pub bit_depth: u32,
}

/// One coded access unit (H.264/H.265) or temporal unit (AV1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodedUnit {
    pub data: Vec<u8>,
    /// Presentation timestamp in nanoseconds.
    pub pts: Option<u64>,
}

/// Options used to open a stream source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceOptions {
    pub path: PathBuf,
    pub forced_codec: Option<CodecId>,
    pub demuxing_enabled: bool,
    pub initial_width: u32,
    pub initial_height: u32,
    pub initial_bit_depth: u32,
}

impl SourceOptions {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            forced_codec: None,
            demuxing_enabled: true,
            initial_width: 0,
            initial_height: 0,
            initial_bit_depth: 8,
        }
    }
}

/// Producer of coded units.
pub trait StreamSource {
    /// Geometry detected when the source was opened.
    fn descriptor(&self) -> StreamDescriptor;

    /// Next coded unit, or `None` once the stream is exhausted.
    fn next_unit(&mut self) -> eyre::Result<Option<CodedUnit>>;
}
