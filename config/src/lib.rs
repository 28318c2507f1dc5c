// SPDX-License-Identifier: MPL-2.0-only

use derive_setters::Setters;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const NAME: &str = "vk-video-dec";
pub const CONFIG_FILE: &str = "decoder.ron";

/// Errors raised while loading or checking a decoder configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: ron::error::SpannedError,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Bitstream parser forced onto the stream source
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParserType {
    H264,
    H265,
    Av1,
}

impl std::str::FromStr for ParserType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "h264" | "avc" => Ok(Self::H264),
            "h265" | "hevc" => Ok(Self::H265),
            "av1" => Ok(Self::Av1),
            other => Err(format!("unknown parser type `{other}` (expected h264, h265 or av1)")),
        }
    }
}

/// Configuration of one decode run.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Setters)]
#[serde(deny_unknown_fields, default)]
#[must_use]
pub struct DecoderConfig {
    /// application name reported to the Vulkan instance
    #[setters(into)]
    pub app_name: String,
    /// coded input file
    #[setters(strip_option, into)]
    pub input: Option<PathBuf>,
    /// decoded output file; no frame sink is opened when unset
    #[setters(strip_option, into)]
    pub output: Option<PathBuf>,
    /// PCI device id of the physical device to use
    #[setters(strip_option)]
    pub device_id: Option<u32>,
    /// UUID of the physical device to use
    #[setters(strip_option, into)]
    pub device_uuid: Option<String>,
    /// decode queue pinned for submission, 0 lets the decoder pick
    pub queue_id: u32,
    /// spread decode work over every decode queue of the family
    pub enable_hw_load_balancing: bool,
    /// require the decode queue family to also support compute
    pub select_video_with_compute_queue: bool,
    /// post-process filter id; enables a dedicated compute queue
    #[setters(strip_option)]
    pub post_process_filter: Option<u32>,
    /// skip codec detection and force this parser
    #[setters(strip_option)]
    pub force_parser_type: Option<ParserType>,
    /// demux container files before parsing
    pub enable_stream_demuxing: bool,
    /// coded width hint used when the stream does not carry one
    pub initial_width: u32,
    /// coded height hint used when the stream does not carry one
    pub initial_height: u32,
    /// bit depth hint used when the stream does not carry one
    pub initial_bitdepth: u32,
    /// write YUV4MPEG2 headers into the output file
    pub output_y4m: bool,
    /// compute a running CRC over every decoded frame
    pub output_crc: bool,
    /// compute one CRC per decoded frame
    pub output_crc_per_frame: bool,
    /// file receiving CRC lines; stdout when unset
    #[setters(strip_option, into)]
    pub crc_output_file: Option<PathBuf>,
    /// CRC seeds, one running checksum per seed
    pub crc_init_value: Vec<u32>,
    /// enable the Khronos validation layer
    #[setters(skip)]
    pub validate: bool,
    /// log every validation message
    pub validate_verbose: bool,
    /// debug level logging
    pub verbose: bool,
    /// coded units kept in flight inside the decoder
    pub decoder_queue_size: u32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self::fallback()
    }
}

impl DecoderConfig {
    /// Fallback in case the config file can't be loaded
    pub fn fallback() -> Self {
        Self {
            app_name: NAME.to_string(),
            input: None,
            output: None,
            device_id: None,
            device_uuid: None,
            queue_id: 0,
            enable_hw_load_balancing: false,
            select_video_with_compute_queue: false,
            post_process_filter: None,
            force_parser_type: None,
            enable_stream_demuxing: true,
            initial_width: 0,
            initial_height: 0,
            initial_bitdepth: 8,
            output_y4m: false,
            output_crc: false,
            output_crc_per_frame: false,
            crc_output_file: None,
            crc_init_value: vec![0],
            validate: false,
            validate_verbose: false,
            verbose: false,
            decoder_queue_size: 5,
        }
    }

    /// Default location of the config file.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(NAME).join(CONFIG_FILE))
    }

    /// Load a config from a RON file.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or does not parse.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        ron::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load the given or default config file.
    ///
    /// A missing default file yields the fallback config. A missing explicit
    /// file, or a broken one, yields the fallback config together with the
    /// error, for the caller to report.
    pub fn load_from(path: Option<&Path>) -> (Self, Option<ConfigError>) {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => return (Self::fallback(), None),
            },
        };

        match Self::load(&path) {
            Ok(config) => (config, None),
            Err(why) => (Self::fallback(), Some(why)),
        }
    }

    /// Load a config, falling back to defaults when it is missing or broken.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let (config, error) = Self::load_from(path);
        if let Some(why) = error {
            tracing::warn!(error = %why, "Config file error, falling back to defaults");
        }
        config
    }

    /// Serialize to pretty RON.
    ///
    /// # Errors
    ///
    /// Fails if serialization fails.
    pub fn to_ron(&self) -> Result<String, ron::Error> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
    }

    /// Check the options that cannot be combined.
    ///
    /// # Errors
    ///
    /// Fails on a missing input, a zero queue size, CRC output without an
    /// output file or seed, or a CRC file without any CRC output.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.input.is_none() {
            return Err(ConfigError::Invalid("no input file given".into()));
        }

        if self.decoder_queue_size == 0 {
            return Err(ConfigError::Invalid(
                "decoder queue size must be at least 1".into(),
            ));
        }

        if (self.output_crc || self.output_crc_per_frame) && self.output.is_none() {
            return Err(ConfigError::Invalid(
                "CRC output requires an output file".into(),
            ));
        }

        if (self.output_crc || self.output_crc_per_frame) && self.crc_init_value.is_empty() {
            return Err(ConfigError::Invalid(
                "CRC output requested without a CRC seed".into(),
            ));
        }

        if self.crc_output_file.is_some() && !(self.output_crc || self.output_crc_per_frame) {
            return Err(ConfigError::Invalid(
                "CRC output file given but CRC output is disabled".into(),
            ));
        }

        Ok(())
    }
}
