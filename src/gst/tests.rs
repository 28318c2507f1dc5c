// SPDX-License-Identifier: MPL-2.0

//! Unit tests for the GStreamer stages.

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::super::{
        decoder::{backpressure_timeout, pipeline_description},
        detection::{
            DecoderBackend, any_coded_caps, codec_from_caps_name, coded_caps, decoder_candidates,
            elementary_parser_chain, parser_element, raw_format,
        },
        escape_path,
        source::{descriptor_from_caps, source_description},
    };
    use crate::stream::{ChromaSubsampling, CodecId, Extent, SourceOptions};

    #[test]
    fn test_candidate_priority() {
        for codec in [CodecId::H264, CodecId::H265, CodecId::Av1] {
            let backends: Vec<DecoderBackend> = decoder_candidates(codec)
                .iter()
                .map(|candidate| candidate.backend)
                .collect();
            assert_eq!(
                backends,
                vec![
                    DecoderBackend::Vulkan,
                    DecoderBackend::VaApi,
                    DecoderBackend::Nvdec,
                    DecoderBackend::V4l2,
                    DecoderBackend::Software,
                ],
                "{codec}"
            );
        }
    }

    #[test]
    fn test_vulkan_candidates_download() {
        for codec in [CodecId::H264, CodecId::H265, CodecId::Av1] {
            for candidate in decoder_candidates(codec) {
                assert_eq!(
                    candidate.download.is_some(),
                    candidate.backend == DecoderBackend::Vulkan,
                    "{}",
                    candidate.element
                );
            }
        }
    }

    #[test]
    fn test_parser_chains() {
        assert_eq!(parser_element(CodecId::H265), "h265parse");
        assert_eq!(
            elementary_parser_chain(CodecId::Av1, Path::new("clip.IVF")),
            "ivfparse ! av1parse"
        );
        assert_eq!(
            elementary_parser_chain(CodecId::Av1, Path::new("clip.obu")),
            "av1parse"
        );
        assert_eq!(
            elementary_parser_chain(CodecId::H264, Path::new("clip.ivf")),
            "h264parse"
        );
    }

    #[test]
    fn test_coded_caps() {
        for codec in [CodecId::H264, CodecId::H265, CodecId::Av1] {
            let caps = coded_caps(codec);
            let name = caps.split(',').next().unwrap();
            assert_eq!(codec_from_caps_name(name), Some(codec));
            assert!(any_coded_caps().contains(caps));
        }
        assert_eq!(codec_from_caps_name("video/x-vp9"), None);
    }

    #[test]
    fn test_raw_formats() {
        let cases = [
            (ChromaSubsampling::Yuv420, 8, "I420"),
            (ChromaSubsampling::Yuv420, 10, "I420_10LE"),
            (ChromaSubsampling::Yuv420, 12, "I420_12LE"),
            (ChromaSubsampling::Yuv422, 8, "Y42B"),
            (ChromaSubsampling::Yuv444, 10, "Y444_10LE"),
            (ChromaSubsampling::Monochrome, 8, "GRAY8"),
        ];

        for (chroma, depth, expected) in cases {
            assert_eq!(raw_format(chroma, depth), expected, "{chroma} {depth}");
        }
    }

    #[test]
    fn test_pipeline_description() {
        let vulkan = decoder_candidates(CodecId::H264)[0];
        assert_eq!(
            pipeline_description("h264parse", &vulkan, "I420", 5),
            "appsrc name=units is-live=false ! h264parse ! vulkanh264dec ! vulkandownload ! \
             videoconvert ! video/x-raw,format=I420 ! appsink name=frames sync=false max-buffers=5"
        );

        let software = decoder_candidates(CodecId::Av1)[4];
        let description = pipeline_description("av1parse", &software, "I420_10LE", 2);
        assert!(description.contains("av1parse ! dav1ddec ! videoconvert"));
    }

    #[test]
    fn test_source_appsink_is_bounded() {
        let demux = source_description("/clips/a.mkv", "parsebin");
        assert_eq!(
            demux,
            "filesrc location=\"/clips/a.mkv\" ! parsebin ! \
             appsink name=units sync=false max-buffers=8 drop=false"
        );

        let chain = elementary_parser_chain(CodecId::Av1, Path::new("a.ivf"));
        let elementary = source_description("a.ivf", &chain);
        assert!(elementary.contains("ivfparse ! av1parse ! appsink"));
        assert!(elementary.ends_with("max-buffers=8 drop=false"));
    }

    #[test]
    fn test_backpressure_ignores_unit_frame_ratio() {
        assert_eq!(backpressure_timeout(0, 5), gstreamer::ClockTime::ZERO);
        assert_eq!(backpressure_timeout(5, 5), gstreamer::ClockTime::ZERO);
        assert_eq!(
            backpressure_timeout(6, 5),
            gstreamer::ClockTime::from_mseconds(500)
        );
    }

    #[test]
    fn test_escape_path() {
        assert_eq!(escape_path(r#"/tmp/a "b".h264"#), r#"/tmp/a \"b\".h264"#);
        assert_eq!(escape_path(r"C:\clips\x.ivf"), r"C:\\clips\\x.ivf");
    }

    #[test]
    fn test_descriptor_from_caps() {
        gstreamer::init().unwrap();

        let caps = gstreamer::Structure::builder("video/x-h265")
            .field("width", 3840i32)
            .field("height", 2160i32)
            .field("chroma-format", "4:2:2")
            .field("bit-depth-luma", 10u32)
            .build();
        let options = SourceOptions::new("clip.mkv");

        let descriptor = descriptor_from_caps(&caps, &options).unwrap();
        assert_eq!(descriptor.codec, CodecId::H265);
        assert_eq!(descriptor.coded_extent, Extent::new(3840, 2160));
        assert_eq!(descriptor.chroma, ChromaSubsampling::Yuv422);
        assert_eq!(descriptor.bit_depth, 10);
    }

    #[test]
    fn test_descriptor_falls_back_to_hints() {
        gstreamer::init().unwrap();

        let caps = gstreamer::Structure::builder("video/x-av1").build();
        let mut options = SourceOptions::new("clip.obu");
        options.initial_width = 1280;
        options.initial_height = 720;
        options.initial_bit_depth = 10;

        let descriptor = descriptor_from_caps(&caps, &options).unwrap();
        assert_eq!(descriptor.codec, CodecId::Av1);
        assert_eq!(descriptor.coded_extent, Extent::new(1280, 720));
        assert_eq!(descriptor.chroma, ChromaSubsampling::Yuv420);
        assert_eq!(descriptor.bit_depth, 10);

        let unknown = gstreamer::Structure::builder("video/x-vp9").build();
        assert!(descriptor_from_caps(&unknown, &options).is_err());
    }
}
