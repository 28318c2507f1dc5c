// SPDX-License-Identifier: MPL-2.0-only

mod cli;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use vk_video_dec::{
    CapabilityOptions, CapabilityRequest, DeviceSelector, PipelineConfig, PipelineError,
    decode,
    decoder::DecoderOptions,
    device::vulkan::VulkanBackend,
    gst::GstStageFactory,
    sink::SinkOptions,
    stream::SourceOptions,
};
use vk_video_dec_config::{ConfigError, DecoderConfig};

const EXIT_INVALID_CONFIG: i32 = -8;

enum Failure {
    Config(ConfigError),
    Pipeline(PipelineError),
}

impl From<ConfigError> for Failure {
    fn from(err: ConfigError) -> Self {
        Failure::Config(err)
    }
}

impl From<PipelineError> for Failure {
    fn from(err: PipelineError) -> Self {
        Failure::Pipeline(err)
    }
}

fn main() {
    if let Err(why) = color_eyre::install() {
        eprintln!("failed to install error reporter: {why}");
    }

    let code = match run() {
        Ok(()) => 0,
        Err(Failure::Config(why)) => {
            error!("{why}");
            eprintln!("vk-video-dec: {why}");
            EXIT_INVALID_CONFIG
        }
        Err(Failure::Pipeline(err)) => {
            let code = err.exit_code();
            error!(stage = err.stage(), code, "{err}");
            eprintln!("Error: {:?}", eyre::Report::new(err));
            code
        }
    };

    std::process::exit(code);
}

fn init_tracing(config: &DecoderConfig) {
    let default_level = if config.verbose { "debug" } else { "info" };
    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    for directive in extra_directives(config) {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Filter directives added on top of the default level.
fn extra_directives(config: &DecoderConfig) -> &'static [&'static str] {
    if config.validate_verbose {
        &["vulkan_validation=trace", "vk_video_dec::device::vulkan=trace"]
    } else {
        &[]
    }
}

fn run() -> Result<(), Failure> {
    let args = cli::Args::parse();
    let explicit_config = args.config.is_some();
    let (file_config, load_error) = DecoderConfig::load_from(args.config.as_deref());
    let config = args.apply(file_config)?;

    init_tracing(&config);

    if let Some(why) = load_error {
        if explicit_config {
            return Err(why.into());
        }
        warn!(error = %why, "Config file error, falling back to defaults");
    }
    config.validate()?;

    let request = CapabilityRequest::new(&CapabilityOptions {
        enable_hw_load_balancing: config.enable_hw_load_balancing,
        queue_id: config.queue_id,
        post_process_filter: config.post_process_filter,
        select_video_with_compute_queue: config.select_video_with_compute_queue,
    });

    let device_uuid = config
        .device_uuid
        .as_deref()
        .map(Uuid::parse_str)
        .transpose()
        .map_err(|why| ConfigError::Invalid(format!("invalid device uuid: {why}")))?;
    let selector = DeviceSelector {
        device_id: config.device_id,
        device_uuid,
    };

    info!(
        policy = ?request.queue_count_policy,
        decode_flags = ?request.decode_queue_flags,
        post_process_flags = ?request.post_process_queue_flags,
        "Requesting video decode capabilities"
    );

    let mut backend = VulkanBackend::new(&config.app_name, config.validate, config.validate_verbose)
        .map_err(PipelineError::DeviceInit)?;
    let summary = decode(
        &mut backend,
        &request,
        &selector,
        &mut GstStageFactory,
        &pipeline_config(&config),
    )?;

    info!(
        frames = summary.frames,
        steps = summary.steps,
        crcs = ?summary.crcs,
        "Decode finished"
    );
    Ok(())
}

fn pipeline_config(config: &DecoderConfig) -> PipelineConfig {
    let mut source = SourceOptions::new(config.input.clone().unwrap_or_default());
    source.forced_codec = config.force_parser_type.map(Into::into);
    source.demuxing_enabled = config.enable_stream_demuxing;
    source.initial_width = config.initial_width;
    source.initial_height = config.initial_height;
    source.initial_bit_depth = config.initial_bitdepth;

    let sink = config.output.as_ref().map(|path| SinkOptions {
        path: path.clone(),
        y4m: config.output_y4m,
        crc: config.output_crc,
        crc_per_frame: config.output_crc_per_frame,
        crc_path: config.crc_output_file.clone(),
        crc_seeds: config.crc_init_value.clone(),
    });

    PipelineConfig {
        source,
        sink,
        decoder: DecoderOptions {
            queue_depth: config.decoder_queue_size,
            queue_id: config.queue_id,
            post_process_filter: config.post_process_filter,
        },
    }
}
