// SPDX-License-Identifier: MPL-2.0

//! Command line arguments, applied over the loaded configuration.

use std::path::PathBuf;

use clap::Parser;
use vk_video_dec_config::{ConfigError, DecoderConfig, ParserType};

#[derive(Debug, Parser)]
#[command(name = "vk-video-dec", version, about = "Hardware accelerated video decoder")]
pub struct Args {
    /// Coded input file
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Decoded output file; frames are discarded when omitted
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Configuration file (RON)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// PCI device id of the physical device, decimal or 0x-prefixed hex
    #[arg(long, value_parser = parse_u32)]
    pub device_id: Option<u32>,

    /// UUID of the physical device
    #[arg(long)]
    pub device_uuid: Option<String>,

    /// Decode queue to submit on; non-zero requests every decode queue
    #[arg(long)]
    pub queue_id: Option<u32>,

    /// Spread decode work across all decode queues
    #[arg(long)]
    pub enable_hw_load_balancing: bool,

    /// Require the decode queue family to support compute
    #[arg(long)]
    pub select_video_with_compute_queue: bool,

    /// Post-process filter id, -1 disables post-processing
    #[arg(long, allow_negative_numbers = true)]
    pub post_process_filter: Option<i64>,

    /// Force the bitstream parser (h264, h265, av1)
    #[arg(long)]
    pub force_parser_type: Option<ParserType>,

    /// Read the input as an elementary stream
    #[arg(long)]
    pub no_stream_demuxing: bool,

    #[arg(long)]
    pub initial_width: Option<u32>,

    #[arg(long)]
    pub initial_height: Option<u32>,

    #[arg(long)]
    pub initial_bitdepth: Option<u32>,

    /// Write a YUV4MPEG2 stream
    #[arg(long)]
    pub y4m: bool,

    /// Print the aggregate CRC of all frames
    #[arg(long)]
    pub crc: bool,

    /// Print one CRC per frame
    #[arg(long)]
    pub crc_per_frame: bool,

    /// File receiving CRC output instead of stdout
    #[arg(long)]
    pub crc_output_file: Option<PathBuf>,

    /// Comma separated CRC seeds
    #[arg(long, value_delimiter = ',', value_parser = parse_u32)]
    pub crc_init_value: Vec<u32>,

    /// Enable the Vulkan validation layer
    #[arg(long)]
    pub validate: bool,

    /// Log every validation message
    #[arg(long)]
    pub validate_verbose: bool,

    #[arg(short, long)]
    pub verbose: bool,

    /// Coded units in flight inside the decoder
    #[arg(long)]
    pub decoder_queue_size: Option<u32>,
}

impl Args {
    /// Override the configuration with every argument given.
    pub fn apply(self, mut config: DecoderConfig) -> Result<DecoderConfig, ConfigError> {
        if let Some(input) = self.input {
            config.input = Some(input);
        }
        if let Some(output) = self.output {
            config.output = Some(output);
        }
        if let Some(id) = self.device_id {
            config.device_id = Some(id);
        }
        if let Some(uuid) = self.device_uuid {
            config.device_uuid = Some(uuid);
        }
        if let Some(queue_id) = self.queue_id {
            config.queue_id = queue_id;
        }
        config.enable_hw_load_balancing |= self.enable_hw_load_balancing;
        config.select_video_with_compute_queue |= self.select_video_with_compute_queue;

        match self.post_process_filter {
            None => {}
            Some(-1) => config.post_process_filter = None,
            Some(id) => {
                let id = u32::try_from(id).map_err(|_| {
                    ConfigError::Invalid(format!(
                        "invalid post-process filter {id}, use -1 to disable"
                    ))
                })?;
                config.post_process_filter = Some(id);
            }
        }

        if let Some(parser) = self.force_parser_type {
            config.force_parser_type = Some(parser);
        }
        if self.no_stream_demuxing {
            config.enable_stream_demuxing = false;
        }
        if let Some(width) = self.initial_width {
            config.initial_width = width;
        }
        if let Some(height) = self.initial_height {
            config.initial_height = height;
        }
        if let Some(depth) = self.initial_bitdepth {
            config.initial_bitdepth = depth;
        }

        config.output_y4m |= self.y4m;
        config.output_crc |= self.crc;
        config.output_crc_per_frame |= self.crc_per_frame;
        if let Some(path) = self.crc_output_file {
            config.crc_output_file = Some(path);
        }
        if !self.crc_init_value.is_empty() {
            config.crc_init_value = self.crc_init_value;
        }

        config.validate |= self.validate || self.validate_verbose;
        config.validate_verbose |= self.validate_verbose;
        config.verbose |= self.verbose;
        if let Some(size) = self.decoder_queue_size {
            config.decoder_queue_size = size;
        }

        Ok(config)
    }
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("`{s}`: {e}"))
}
