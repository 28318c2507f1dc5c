// SPDX-License-Identifier: MPL-2.0

//! Decoder element detection.
//!
//! Candidates are probed in priority order per codec:
//! 1. Vulkan Video (`vulkanh264dec` ... followed by `vulkandownload`)
//! 2. VA-API (`vah264dec` ...)
//! 3. NVDEC (`nvh264dec` ...)
//! 4. V4L2 stateless (`v4l2slh264dec` ...)
//! 5. Software (`avdec_h264`, `avdec_h265`, `dav1ddec`)

use std::path::Path;
use std::sync::OnceLock;

use tracing::{debug, info, warn};

use crate::stream::{ChromaSubsampling, CodecId};

/// Which decode engine an element drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecoderBackend {
    Vulkan,
    VaApi,
    Nvdec,
    V4l2,
    Software,
}

impl DecoderBackend {
    #[must_use]
    pub fn is_hardware(self) -> bool {
        self != DecoderBackend::Software
    }
}

/// A decoder element with the elements it needs after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderCandidate {
    pub backend: DecoderBackend,
    pub element: &'static str,
    pub download: Option<&'static str>,
}

const fn candidate(
    backend: DecoderBackend,
    element: &'static str,
    download: Option<&'static str>,
) -> DecoderCandidate {
    DecoderCandidate {
        backend,
        element,
        download,
    }
}

const H264_CANDIDATES: &[DecoderCandidate] = &[
    candidate(DecoderBackend::Vulkan, "vulkanh264dec", Some("vulkandownload")),
    candidate(DecoderBackend::VaApi, "vah264dec", None),
    candidate(DecoderBackend::Nvdec, "nvh264dec", None),
    candidate(DecoderBackend::V4l2, "v4l2slh264dec", None),
    candidate(DecoderBackend::Software, "avdec_h264", None),
];

const H265_CANDIDATES: &[DecoderCandidate] = &[
    candidate(DecoderBackend::Vulkan, "vulkanh265dec", Some("vulkandownload")),
    candidate(DecoderBackend::VaApi, "vah265dec", None),
    candidate(DecoderBackend::Nvdec, "nvh265dec", None),
    candidate(DecoderBackend::V4l2, "v4l2slh265dec", None),
    candidate(DecoderBackend::Software, "avdec_h265", None),
];

const AV1_CANDIDATES: &[DecoderCandidate] = &[
    candidate(DecoderBackend::Vulkan, "vulkanav1dec", Some("vulkandownload")),
    candidate(DecoderBackend::VaApi, "vaav1dec", None),
    candidate(DecoderBackend::Nvdec, "nvav1dec", None),
    candidate(DecoderBackend::V4l2, "v4l2slav1dec", None),
    candidate(DecoderBackend::Software, "dav1ddec", None),
];

/// Decoder candidates for a codec, highest priority first.
#[must_use]
pub fn decoder_candidates(codec: CodecId) -> &'static [DecoderCandidate] {
    match codec {
        CodecId::H264 => H264_CANDIDATES,
        CodecId::H265 => H265_CANDIDATES,
        CodecId::Av1 => AV1_CANDIDATES,
    }
}

/// Bitstream parser element for a codec.
#[must_use]
pub fn parser_element(codec: CodecId) -> &'static str {
    match codec {
        CodecId::H264 => "h264parse",
        CodecId::H265 => "h265parse",
        CodecId::Av1 => "av1parse",
    }
}

/// Parser chain for an elementary stream file without demuxing.
#[must_use]
pub fn elementary_parser_chain(codec: CodecId, path: &Path) -> String {
    let is_ivf = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("ivf"));

    if codec == CodecId::Av1 && is_ivf {
        format!("ivfparse ! {}", parser_element(codec))
    } else {
        parser_element(codec).to_string()
    }
}

/// Caps of coded units exchanged between source and decoder.
#[must_use]
pub fn coded_caps(codec: CodecId) -> &'static str {
    match codec {
        CodecId::H264 => "video/x-h264,stream-format=byte-stream,alignment=au",
        CodecId::H265 => "video/x-h265,stream-format=byte-stream,alignment=au",
        CodecId::Av1 => "video/x-av1,stream-format=obu-stream,alignment=tu",
    }
}

/// Coded caps accepting any supported codec.
#[must_use]
pub fn any_coded_caps() -> String {
    [CodecId::H264, CodecId::H265, CodecId::Av1]
        .map(coded_caps)
        .join("; ")
}

/// Codec for a caps structure name.
#[must_use]
pub fn codec_from_caps_name(name: &str) -> Option<CodecId> {
    match name {
        "video/x-h264" => Some(CodecId::H264),
        "video/x-h265" => Some(CodecId::H265),
        "video/x-av1" => Some(CodecId::Av1),
        _ => None,
    }
}

/// Planar raw format requested from `videoconvert`.
#[must_use]
pub fn raw_format(chroma: ChromaSubsampling, bit_depth: u32) -> &'static str {
    match (chroma, bit_depth) {
        (ChromaSubsampling::Monochrome, 0..=8) => "GRAY8",
        (ChromaSubsampling::Monochrome, _) => "GRAY16_LE",
        (ChromaSubsampling::Yuv420, 0..=8) => "I420",
        (ChromaSubsampling::Yuv420, 9..=10) => "I420_10LE",
        (ChromaSubsampling::Yuv420, _) => "I420_12LE",
        (ChromaSubsampling::Yuv422, 0..=8) => "Y42B",
        (ChromaSubsampling::Yuv422, 9..=10) => "I422_10LE",
        (ChromaSubsampling::Yuv422, _) => "I422_12LE",
        (ChromaSubsampling::Yuv444, 0..=8) => "Y444",
        (ChromaSubsampling::Yuv444, 9..=10) => "Y444_10LE",
        (ChromaSubsampling::Yuv444, _) => "Y444_12LE",
    }
}

/// Cached decoder availability.
static DECODER_SUPPORT: OnceLock<DecoderSupport> = OnceLock::new();

/// Decoder elements registered on the current system.
#[derive(Debug, Clone, Default)]
pub struct DecoderSupport {
    pub has_vulkan: bool,
    pub has_vaapi: bool,
    pub has_nvidia: bool,
    pub has_v4l2: bool,
    /// Every registered candidate element.
    pub decoders: Vec<&'static str>,
}

/// Detect registered decoders once and cache the result.
pub fn get_decoder_support() -> &'static DecoderSupport {
    DECODER_SUPPORT.get_or_init(detect_decoder_support)
}

fn detect_decoder_support() -> DecoderSupport {
    if gstreamer::init().is_err() {
        return DecoderSupport::default();
    }

    let mut support = DecoderSupport::default();

    for codec in [CodecId::H264, CodecId::H265, CodecId::Av1] {
        for candidate in decoder_candidates(codec) {
            if gstreamer::ElementFactory::find(candidate.element).is_none() {
                continue;
            }
            match candidate.backend {
                DecoderBackend::Vulkan => support.has_vulkan = true,
                DecoderBackend::VaApi => support.has_vaapi = true,
                DecoderBackend::Nvdec => support.has_nvidia = true,
                DecoderBackend::V4l2 => support.has_v4l2 = true,
                DecoderBackend::Software => {}
            }
            support.decoders.push(candidate.element);
        }
    }

    info!(
        has_vulkan = support.has_vulkan,
        has_vaapi = support.has_vaapi,
        has_nvidia = support.has_nvidia,
        has_v4l2 = support.has_v4l2,
        decoders = ?support.decoders,
        "Detected video decoder support"
    );

    support
}

/// Whether an element is registered and can actually be instantiated.
///
/// Hardware plugins register their elements even when the device or driver
/// behind them is missing; creating an instance catches that.
#[must_use]
pub fn element_usable(name: &str) -> bool {
    let Some(factory) = gstreamer::ElementFactory::find(name) else {
        return false;
    };

    match factory.create().build() {
        Ok(element) => {
            debug!(element = name, "Element is functional");
            drop(element);
            true
        }
        Err(_) => {
            warn!(element = name, "Element failed to instantiate, skipping");
            false
        }
    }
}

/// Usable candidates for a codec in priority order.
///
/// Vulkan elements are only offered when the negotiated decode family
/// supports the codec.
#[must_use]
pub fn usable_candidates(codec: CodecId, vulkan_allowed: bool) -> Vec<DecoderCandidate> {
    decoder_candidates(codec)
        .iter()
        .filter(|candidate| vulkan_allowed || candidate.backend != DecoderBackend::Vulkan)
        .filter(|candidate| {
            element_usable(candidate.element)
                && candidate.download.is_none_or(|download| {
                    gstreamer::ElementFactory::find(download).is_some()
                })
        })
        .copied()
        .collect()
}
