// SPDX-License-Identifier: MPL-2.0

use std::{cell::RefCell, rc::Rc};

use assert_matches::assert_matches;
use uuid::Uuid;
use vk_video_dec::{
    CapabilityOptions, CapabilityRequest, DeviceError, DeviceSelector, ExecutionContextSet,
    Pipeline, PipelineConfig, PipelineError, TerminationReason,
    capability::{CodecOperations, QueueCountPolicy, QueueFlags},
    decoder::{DecoderOptions, HardwareDecoder, ProfileInfo, StepStatus},
    device::{DeviceBackend, LogicalDeviceRequest, PhysicalDeviceInfo, QueueFamilyInfo},
    decode, negotiate,
    pipeline::StageFactory,
    sink::{DecodedFrame, FrameSink, SinkOptions},
    stream::{
        ChromaSubsampling, CodecId, CodedUnit, Extent, SourceOptions, StreamDescriptor,
        StreamSource,
    },
};

type Log = Rc<RefCell<Vec<String>>>;

fn family(index: u32, flags: QueueFlags, queue_count: u32, codecs: CodecOperations) -> QueueFamilyInfo {
    QueueFamilyInfo {
        index,
        flags,
        queue_count,
        codec_operations: codecs,
    }
}

fn device(index: usize, families: Vec<QueueFamilyInfo>) -> PhysicalDeviceInfo {
    PhysicalDeviceInfo {
        index,
        name: format!("gpu{index}"),
        vendor_id: 0x1002,
        device_id: 0x7400 + index as u32,
        uuid: Uuid::from_u128(index as u128 + 1),
        queue_families: families,
    }
}

/// Graphics+compute+transfer family 0, decode+transfer family 1 with two
/// queues, compute-only family 2.
fn typical_device() -> PhysicalDeviceInfo {
    device(
        0,
        vec![
            family(
                0,
                QueueFlags::GRAPHICS | QueueFlags::COMPUTE | QueueFlags::TRANSFER,
                1,
                CodecOperations::empty(),
            ),
            family(
                1,
                QueueFlags::VIDEO_DECODE | QueueFlags::TRANSFER,
                2,
                CodecOperations::DECODE_ALL,
            ),
            family(2, QueueFlags::COMPUTE | QueueFlags::TRANSFER, 4, CodecOperations::empty()),
        ],
    )
}

#[derive(Default)]
struct FakeBackend {
    devices: Vec<PhysicalDeviceInfo>,
    enumerate_error: bool,
    reject_device: bool,
    created: Vec<LogicalDeviceRequest>,
}

impl FakeBackend {
    fn with(devices: Vec<PhysicalDeviceInfo>) -> Self {
        Self {
            devices,
            ..Self::default()
        }
    }
}

impl DeviceBackend for FakeBackend {
    fn physical_devices(&mut self) -> Result<Vec<PhysicalDeviceInfo>, DeviceError> {
        if self.enumerate_error {
            return Err(DeviceError::BackendUnavailable("no loader".into()));
        }
        Ok(self.devices.clone())
    }

    fn create_logical_device(&mut self, request: &LogicalDeviceRequest) -> Result<(), DeviceError> {
        if self.reject_device {
            return Err(DeviceError::Creation("out of device memory".into()));
        }
        self.created.push(request.clone());
        Ok(())
    }
}

fn options(lb: bool, queue_id: u32, filter: Option<u32>, with_compute: bool) -> CapabilityOptions {
    CapabilityOptions {
        enable_hw_load_balancing: lb,
        queue_id,
        post_process_filter: filter,
        select_video_with_compute_queue: with_compute,
    }
}

fn negotiate_on(
    devices: Vec<PhysicalDeviceInfo>,
    options: &CapabilityOptions,
) -> (Result<ExecutionContextSet, PipelineError>, FakeBackend) {
    let mut backend = FakeBackend::with(devices);
    let result = negotiate(
        &mut backend,
        &CapabilityRequest::new(options),
        &DeviceSelector::default(),
    );
    (result, backend)
}

struct FakeSource {
    remaining: u32,
}

impl StreamSource for FakeSource {
    fn descriptor(&self) -> StreamDescriptor {
        StreamDescriptor {
            codec: CodecId::H265,
            coded_extent: Extent::new(4, 2),
            chroma: ChromaSubsampling::Yuv420,
            bit_depth: 8,
        }
    }

    fn next_unit(&mut self) -> eyre::Result<Option<CodedUnit>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        Ok(Some(CodedUnit {
            data: vec![0, 0, 1],
            pts: None,
        }))
    }
}

struct RecordingSink {
    log: Log,
    frames: Rc<RefCell<Vec<(u64, u64)>>>,
}

impl FrameSink for RecordingSink {
    fn write_frame(&mut self, frame: &DecodedFrame) -> eyre::Result<()> {
        self.frames.borrow_mut().push((frame.index, frame.step));
        Ok(())
    }

    fn finish(&mut self) -> eyre::Result<Vec<u32>> {
        self.log.borrow_mut().push("sink finished".into());
        Ok(vec![0xdead_beef])
    }
}

/// Emits one frame per coded unit; fails on `fail_at`.
struct ScriptedDecoder {
    log: Log,
    fail_at: Option<u64>,
    fail_after_frame: bool,
    frames_out: u64,
}

impl HardwareDecoder for ScriptedDecoder {
    fn negotiated_profile(&self) -> ProfileInfo {
        ProfileInfo {
            codec: CodecId::H265,
            chroma: ChromaSubsampling::Yuv420,
            luma_bit_depth: 8,
            chroma_bit_depth: 8,
        }
    }

    fn coded_extent(&self) -> Extent {
        Extent::new(4, 2)
    }

    fn process_step(
        &mut self,
        step: u64,
        source: &mut dyn StreamSource,
        sink: Option<&mut dyn FrameSink>,
    ) -> eyre::Result<StepStatus> {
        self.log.borrow_mut().push(format!("step {step}"));
        let failing = self.fail_at == Some(step);
        if failing && !self.fail_after_frame {
            eyre::bail!("device lost");
        }

        if source.next_unit()?.is_none() {
            return Ok(StepStatus::done(0));
        }

        if let Some(sink) = sink {
            sink.write_frame(&DecodedFrame {
                index: self.frames_out,
                step,
                pts: None,
                extent: Extent::new(4, 2),
                chroma: ChromaSubsampling::Yuv420,
                bit_depth: 8,
                frame_rate: None,
                planes: vec![vec![0; 8], vec![0; 2], vec![0; 2]],
            })?;
        }
        self.frames_out += 1;
        if failing {
            eyre::bail!("device lost after output");
        }
        Ok(StepStatus::more(1))
    }
}

#[derive(Default)]
struct RecordingFactory {
    log: Log,
    frames: Rc<RefCell<Vec<(u64, u64)>>>,
    units: u32,
    fail_source: bool,
    fail_sink: bool,
    fail_decoder: bool,
    fail_step: Option<u64>,
    fail_after_frame: bool,
    decoder_saw_sink: Option<bool>,
}

impl RecordingFactory {
    fn events(&self) -> Vec<String> {
        self.log.borrow().clone()
    }
}

impl StageFactory for RecordingFactory {
    fn open_source(&mut self, _options: &SourceOptions) -> eyre::Result<Box<dyn StreamSource>> {
        self.log.borrow_mut().push("source".into());
        if self.fail_source {
            eyre::bail!("no such file");
        }
        Ok(Box::new(FakeSource {
            remaining: self.units,
        }))
    }

    fn open_sink(&mut self, _options: &SinkOptions) -> eyre::Result<Box<dyn FrameSink>> {
        self.log.borrow_mut().push("sink".into());
        if self.fail_sink {
            eyre::bail!("read-only file system");
        }
        Ok(Box::new(RecordingSink {
            log: self.log.clone(),
            frames: self.frames.clone(),
        }))
    }

    fn create_decoder(
        &mut self,
        _contexts: &ExecutionContextSet,
        _source: &dyn StreamSource,
        sink: Option<&dyn FrameSink>,
        _options: &DecoderOptions,
    ) -> eyre::Result<Box<dyn HardwareDecoder>> {
        self.log.borrow_mut().push("decoder".into());
        self.decoder_saw_sink = Some(sink.is_some());
        if self.fail_decoder {
            eyre::bail!("profile not supported");
        }
        Ok(Box::new(ScriptedDecoder {
            log: self.log.clone(),
            fail_at: self.fail_step,
            fail_after_frame: self.fail_after_frame,
            frames_out: 0,
        }))
    }
}

fn config(with_sink: bool) -> PipelineConfig {
    PipelineConfig {
        source: SourceOptions::new("clip.h265"),
        sink: with_sink.then(|| SinkOptions::new("out.yuv")),
        decoder: DecoderOptions::default(),
    }
}

fn contexts() -> ExecutionContextSet {
    let (result, _) = negotiate_on(vec![typical_device()], &CapabilityOptions::default());
    result.unwrap()
}

#[test]
fn test_default_options_single_decode_queue() {
    let request = CapabilityRequest::new(&CapabilityOptions::default());
    assert_eq!(request.queue_count_policy, QueueCountPolicy::ExactlyOne);
    assert_eq!(request.decode_queue_flags, QueueFlags::VIDEO_DECODE);
    assert!(request.post_process_queue_flags.is_empty());
    assert_eq!(request.required_decode_codecs, CodecOperations::DECODE_ALL);

    let (result, backend) = negotiate_on(vec![typical_device()], &CapabilityOptions::default());
    let contexts = result.unwrap();
    assert_eq!(contexts.decode_queue_family(), 1);
    assert_eq!(contexts.decode_queue_count(), 1);
    assert!(!contexts.transfer_queue_created());
    assert_eq!(contexts.compute_queue_family(), None);

    let created = &backend.created[0];
    assert_eq!(created.encode_queue_count, 0);
    assert!(!created.create_graphics_queue);
    assert!(!created.create_display_queue);
    assert!(!created.create_compute_queue);
    assert!(!created.create_transfer_queue);
}

#[test]
fn test_load_balancing_takes_every_decode_queue() {
    let (result, backend) = negotiate_on(vec![typical_device()], &options(true, 0, None, false));
    assert_eq!(result.unwrap().decode_queue_count(), 2);
    assert_eq!(backend.created[0].decode_queue_count, 2);
}

#[test]
fn test_pinned_queue_takes_every_decode_queue() {
    let (result, _) = negotiate_on(vec![typical_device()], &options(false, 3, None, false));
    let contexts = result.unwrap();
    assert_eq!(contexts.decode_queue_count(), 2);
    assert_eq!(contexts.decode_queue_index(3), 1);
    assert_eq!(contexts.decode_queue_index(1), 1);
}

#[test]
fn test_post_process_filter_adds_compute_queue() {
    let request = CapabilityRequest::new(&options(false, 0, Some(0), false));
    assert_eq!(request.post_process_queue_flags, QueueFlags::COMPUTE);

    let (result, backend) = negotiate_on(vec![typical_device()], &options(false, 0, Some(0), false));
    let contexts = result.unwrap();
    assert_eq!(contexts.compute_queue_family(), Some(2));
    assert!(contexts.compute_queue_family_flags().contains(QueueFlags::COMPUTE));
    assert!(backend.created[0].create_compute_queue);
}

#[test]
fn test_compute_co_scheduled_with_decode() {
    let mut dev = typical_device();
    dev.queue_families[1].flags |= QueueFlags::COMPUTE;
    dev.queue_families.push(family(
        3,
        QueueFlags::VIDEO_DECODE | QueueFlags::TRANSFER,
        1,
        CodecOperations::DECODE_H264,
    ));
    dev.queue_families.swap(1, 3);

    let (result, _) = negotiate_on(vec![dev], &options(false, 0, None, true));
    let contexts = result.unwrap();
    assert!(contexts.decode_queue_family_flags().contains(QueueFlags::COMPUTE));
    assert_eq!(contexts.compute_queue_family(), None);
}

#[test]
fn test_transfer_queue_when_decode_family_cannot_transfer() {
    let dev = device(
        0,
        vec![
            family(0, QueueFlags::VIDEO_DECODE, 1, CodecOperations::DECODE_H264),
            family(1, QueueFlags::GRAPHICS | QueueFlags::TRANSFER, 1, CodecOperations::empty()),
            family(2, QueueFlags::TRANSFER, 1, CodecOperations::empty()),
        ],
    );

    let (result, backend) = negotiate_on(vec![dev], &CapabilityOptions::default());
    let contexts = result.unwrap();
    assert!(contexts.transfer_queue_created());
    assert_eq!(contexts.transfer_queue_family(), Some(2));
    assert!(backend.created[0].create_transfer_queue);
}

#[test]
fn test_negotiation_is_idempotent() {
    let first = negotiate_on(vec![typical_device()], &options(true, 0, Some(1), false)).0;
    let second = negotiate_on(vec![typical_device()], &options(true, 0, Some(1), false)).0;
    assert_eq!(first.unwrap(), second.unwrap());
}

#[test]
fn test_device_failures_map_to_stages() {
    let mut backend = FakeBackend {
        enumerate_error: true,
        ..FakeBackend::default()
    };
    let request = CapabilityRequest::new(&CapabilityOptions::default());
    let err = negotiate(&mut backend, &request, &DeviceSelector::default()).unwrap_err();
    assert_eq!(err.exit_code(), -2);

    let no_decode = device(
        0,
        vec![family(0, QueueFlags::GRAPHICS | QueueFlags::TRANSFER, 1, CodecOperations::empty())],
    );
    let (result, _) = negotiate_on(vec![no_decode], &CapabilityOptions::default());
    assert_matches!(
        result,
        Err(PipelineError::PhysicalDevice(DeviceError::NoMatchingDevice { .. }))
    );

    let mut backend = FakeBackend {
        reject_device: true,
        ..FakeBackend::with(vec![typical_device()])
    };
    let err = negotiate(&mut backend, &request, &DeviceSelector::default()).unwrap_err();
    assert_matches!(err, PipelineError::LogicalDeviceCreation(_));
    assert_eq!(err.exit_code(), -3);
}

#[test]
fn test_selector_skips_other_devices() {
    let selector = DeviceSelector {
        device_id: Some(0x7401),
        device_uuid: None,
    };
    let mut second = typical_device();
    second.index = 1;
    second.device_id = 0x7401;
    let mut backend = FakeBackend::with(vec![typical_device(), second]);

    let request = CapabilityRequest::new(&CapabilityOptions::default());
    let contexts = negotiate(&mut backend, &request, &selector).unwrap();
    assert_eq!(contexts.device().index, 1);
    assert_eq!(backend.created[0].physical_device, 1);
}

#[test]
fn test_failed_device_setup_never_opens_stages() {
    let mut backend = FakeBackend::with(Vec::new());
    let request = CapabilityRequest::new(&CapabilityOptions::default());
    let mut factory = RecordingFactory {
        units: 3,
        ..RecordingFactory::default()
    };

    let err = decode(
        &mut backend,
        &request,
        &DeviceSelector::default(),
        &mut factory,
        &config(true),
    )
    .unwrap_err();

    assert_matches!(&err, PipelineError::PhysicalDevice(DeviceError::NoMatchingDevice { .. }));
    assert_eq!(err.exit_code(), -2);
    assert!(factory.events().is_empty());
    assert!(backend.created.is_empty());
}

#[test]
fn test_rejected_logical_device_never_opens_stages() {
    let mut backend = FakeBackend {
        reject_device: true,
        ..FakeBackend::with(vec![typical_device()])
    };
    let request = CapabilityRequest::new(&CapabilityOptions::default());
    let mut factory = RecordingFactory::default();

    let err = decode(
        &mut backend,
        &request,
        &DeviceSelector::default(),
        &mut factory,
        &config(false),
    )
    .unwrap_err();

    assert_eq!(err.exit_code(), -3);
    assert!(factory.events().is_empty());
}

#[test]
fn test_decode_runs_every_stage() {
    let mut backend = FakeBackend::with(vec![typical_device()]);
    let request = CapabilityRequest::new(&CapabilityOptions::default());
    let mut factory = RecordingFactory {
        units: 2,
        ..RecordingFactory::default()
    };

    let summary = decode(
        &mut backend,
        &request,
        &DeviceSelector::default(),
        &mut factory,
        &config(true),
    )
    .unwrap();

    assert_eq!(summary.frames, 2);
    assert_eq!(summary.steps, 3);
    assert_eq!(summary.crcs, [0xdead_beef]);
    assert_eq!(backend.created.len(), 1);
    assert_eq!(
        factory.events(),
        ["source", "sink", "decoder", "step 0", "step 1", "step 2", "sink finished"]
    );
}

#[test]
fn test_assembly_order_with_sink() {
    let mut factory = RecordingFactory {
        units: 3,
        ..RecordingFactory::default()
    };
    let pipeline = Pipeline::assemble(contexts(), &mut factory, &config(true)).unwrap();

    assert_eq!(factory.events(), ["source", "sink", "decoder"]);
    assert_eq!(factory.decoder_saw_sink, Some(true));
    assert!(pipeline.has_sink());

    let info = pipeline.stream_info();
    assert_eq!(info.codec, CodecId::H265);
    assert_eq!(info.coded_extent, Extent::new(4, 2));
}

#[test]
fn test_no_output_path_skips_sink() {
    let mut factory = RecordingFactory::default();
    let pipeline = Pipeline::assemble(contexts(), &mut factory, &config(false)).unwrap();

    assert_eq!(factory.events(), ["source", "decoder"]);
    assert_eq!(factory.decoder_saw_sink, Some(false));
    assert!(!pipeline.has_sink());
}

#[test]
fn test_source_failure_stops_assembly() {
    let mut factory = RecordingFactory {
        fail_source: true,
        ..RecordingFactory::default()
    };
    let err = Pipeline::assemble(contexts(), &mut factory, &config(true)).err().unwrap();

    assert_matches!(&err, PipelineError::SourceOpen { path, .. } if path == "clip.h265");
    assert_eq!(err.exit_code(), -4);
    assert_eq!(factory.events(), ["source"]);
}

#[test]
fn test_sink_failure_stops_assembly() {
    let mut factory = RecordingFactory {
        fail_sink: true,
        ..RecordingFactory::default()
    };
    let err = Pipeline::assemble(contexts(), &mut factory, &config(true)).err().unwrap();

    assert_matches!(&err, PipelineError::SinkOpen { .. });
    assert_eq!(err.exit_code(), -5);
    assert_eq!(factory.events(), ["source", "sink"]);
}

#[test]
fn test_decoder_failure() {
    let mut factory = RecordingFactory {
        fail_decoder: true,
        ..RecordingFactory::default()
    };
    let err = Pipeline::assemble(contexts(), &mut factory, &config(false)).err().unwrap();

    assert_matches!(&err, PipelineError::DecoderCreation(_));
    assert_eq!(err.exit_code(), -6);
}

#[test]
fn test_run_until_exhausted() {
    let mut factory = RecordingFactory {
        units: 3,
        ..RecordingFactory::default()
    };
    let mut pipeline = Pipeline::assemble(contexts(), &mut factory, &config(true)).unwrap();

    let result = pipeline.run();
    assert!(result.is_exhausted());
    assert_eq!(result.frames_processed, 3);
    assert_eq!(result.steps, 4);

    assert_eq!(*factory.frames.borrow(), [(0, 0), (1, 1), (2, 2)]);
    assert_eq!(pipeline.finish().unwrap(), [0xdead_beef]);
    assert_eq!(
        factory.events(),
        ["source", "sink", "decoder", "step 0", "step 1", "step 2", "step 3", "sink finished"]
    );
}

#[test]
fn test_empty_stream_runs_one_step() {
    let mut factory = RecordingFactory::default();
    let mut pipeline = Pipeline::assemble(contexts(), &mut factory, &config(false)).unwrap();

    let result = pipeline.run();
    assert_eq!(result.steps, 1);
    assert_eq!(result.into_result().unwrap(), 0);
    assert!(pipeline.finish().unwrap().is_empty());
}

#[test]
fn test_fatal_step_stops_loop() {
    let mut factory = RecordingFactory {
        units: 10,
        fail_step: Some(2),
        ..RecordingFactory::default()
    };
    let mut pipeline = Pipeline::assemble(contexts(), &mut factory, &config(true)).unwrap();

    let result = pipeline.run();
    assert_eq!(result.frames_processed, 2);
    assert_eq!(result.steps, 3);
    assert_matches!(
        &result.termination,
        TerminationReason::FatalError(PipelineError::StepFatal { step: 2, .. })
    );

    let err = result.into_result().unwrap_err();
    assert_eq!(err.exit_code(), -7);
    assert!(!factory.events().contains(&"step 3".to_string()));
}

#[test]
fn test_three_frames_without_sink() {
    let mut factory = RecordingFactory {
        units: 3,
        ..RecordingFactory::default()
    };
    let mut pipeline = Pipeline::assemble(contexts(), &mut factory, &config(false)).unwrap();

    let result = pipeline.run();
    assert_matches!(result.termination, TerminationReason::StreamExhausted);
    assert_eq!(result.frames_processed, 3);
    assert!(factory.frames.borrow().is_empty());
    assert!(!factory.events().contains(&"sink".to_string()));
}

#[test]
fn test_frames_written_by_failing_step_are_counted() {
    let mut factory = RecordingFactory {
        units: 10,
        fail_step: Some(2),
        fail_after_frame: true,
        ..RecordingFactory::default()
    };
    let mut pipeline = Pipeline::assemble(contexts(), &mut factory, &config(true)).unwrap();

    let result = pipeline.run();
    assert_eq!(result.frames_processed, 3);
    assert_eq!(*factory.frames.borrow(), [(0, 0), (1, 1), (2, 2)]);
    assert_matches!(
        result.termination,
        TerminationReason::FatalError(PipelineError::StepFatal { step: 2, .. })
    );
}
