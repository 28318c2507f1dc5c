// SPDX-License-Identifier: MPL-2.0

//! Device negotiation.
//!
//! [`negotiate`] turns a [`CapabilityRequest`] into an [`ExecutionContextSet`]
//! against any [`DeviceBackend`]:
//!
//! 1. pick the first physical device that matches the selector and exposes
//!    transfer, decode (plus compute when co-scheduled) and the post-process
//!    compute capability if requested
//! 2. size the decode queues by the queue count policy
//! 3. add a transfer queue only when the decode family cannot transfer
//! 4. add a compute queue only for post-processing
//!
//! Graphics, display and encode queues are never part of the request.

#[cfg(feature = "vulkan")]
pub mod vulkan;

use std::fmt;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    capability::{CapabilityRequest, CodecOperations, QueueCountPolicy, QueueFlags},
    error::{DeviceError, PipelineError},
};

/// Which physical device to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceSelector {
    pub device_id: Option<u32>,
    pub device_uuid: Option<Uuid>,
}

impl DeviceSelector {
    #[must_use]
    pub fn matches(&self, device: &PhysicalDeviceInfo) -> bool {
        self.device_id.is_none_or(|id| id == device.device_id)
            && self.device_uuid.is_none_or(|uuid| uuid == device.uuid)
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(id) = self.device_id {
            write!(f, " with device id {id:#06x}")?;
        }
        if let Some(uuid) = self.device_uuid {
            write!(f, " with uuid {uuid}")?;
        }
        Ok(())
    }
}

/// One queue family of a physical device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueFamilyInfo {
    pub index: u32,
    pub flags: QueueFlags,
    pub queue_count: u32,
    /// Video codec operations, empty unless the family decodes video.
    pub codec_operations: CodecOperations,
}

/// A physical device as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalDeviceInfo {
    /// Position in the backend's enumeration order.
    pub index: usize,
    pub name: String,
    pub vendor_id: u32,
    pub device_id: u32,
    pub uuid: Uuid,
    pub queue_families: Vec<QueueFamilyInfo>,
}

/// Queues to create on one family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueAllocation {
    pub family: u32,
    pub count: u32,
}

/// Logical device creation parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalDeviceRequest {
    pub physical_device: usize,
    pub decode_queue_family: u32,
    pub decode_queue_count: u32,
    pub encode_queue_count: u32,
    pub codec_operations: CodecOperations,
    pub create_transfer_queue: bool,
    pub create_graphics_queue: bool,
    pub create_display_queue: bool,
    pub create_compute_queue: bool,
    /// Per-family queue counts, one entry per distinct family.
    pub queue_allocations: Vec<QueueAllocation>,
}

impl LogicalDeviceRequest {
    fn allocate(&mut self, family: &QueueFamilyInfo, count: u32) {
        match self
            .queue_allocations
            .iter_mut()
            .find(|alloc| alloc.family == family.index)
        {
            Some(alloc) => alloc.count = (alloc.count + count).min(family.queue_count),
            None => self.queue_allocations.push(QueueAllocation {
                family: family.index,
                count: count.min(family.queue_count),
            }),
        }
    }
}

/// Source of physical devices and creator of logical devices.
pub trait DeviceBackend {
    fn physical_devices(&mut self) -> Result<Vec<PhysicalDeviceInfo>, DeviceError>;

    fn create_logical_device(&mut self, request: &LogicalDeviceRequest) -> Result<(), DeviceError>;
}

/// Queues negotiated for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContextSet {
    device: PhysicalDeviceInfo,
    decode_queue_family: u32,
    decode_queue_family_flags: QueueFlags,
    decode_queue_count: u32,
    decode_codecs: CodecOperations,
    compute_queue_family: Option<u32>,
    compute_queue_family_flags: QueueFlags,
    transfer_queue_family: Option<u32>,
}

impl ExecutionContextSet {
    #[must_use]
    pub fn device(&self) -> &PhysicalDeviceInfo {
        &self.device
    }

    #[must_use]
    pub fn decode_queue_family(&self) -> u32 {
        self.decode_queue_family
    }

    #[must_use]
    pub fn decode_queue_family_flags(&self) -> QueueFlags {
        self.decode_queue_family_flags
    }

    #[must_use]
    pub fn decode_queue_count(&self) -> u32 {
        self.decode_queue_count
    }

    /// Codec operations the decode family supports out of the requested set.
    #[must_use]
    pub fn decode_codecs(&self) -> CodecOperations {
        self.decode_codecs
    }

    #[must_use]
    pub fn compute_queue_family(&self) -> Option<u32> {
        self.compute_queue_family
    }

    /// Flags of the post-process compute family, empty without one.
    #[must_use]
    pub fn compute_queue_family_flags(&self) -> QueueFlags {
        self.compute_queue_family_flags
    }

    #[must_use]
    pub fn transfer_queue_family(&self) -> Option<u32> {
        self.transfer_queue_family
    }

    #[must_use]
    pub fn transfer_queue_created(&self) -> bool {
        self.transfer_queue_family.is_some()
    }

    /// Decode queue index for a pinned queue id.
    #[must_use]
    pub fn decode_queue_index(&self, queue_id: u32) -> u32 {
        let index = queue_id % self.decode_queue_count.max(1);
        if index != queue_id {
            warn!(
                queue_id,
                decode_queues = self.decode_queue_count,
                index,
                "Pinned decode queue out of range, wrapping"
            );
        }
        index
    }
}

/// Negotiate execution contexts on the first matching device.
///
/// # Errors
///
/// [`PipelineError::PhysicalDevice`] when enumeration fails or no device
/// matches, [`PipelineError::LogicalDeviceCreation`] when the backend rejects
/// the logical device.
pub fn negotiate(
    backend: &mut dyn DeviceBackend,
    request: &CapabilityRequest,
    selector: &DeviceSelector,
) -> Result<ExecutionContextSet, PipelineError> {
    let devices = backend
        .physical_devices()
        .map_err(PipelineError::PhysicalDevice)?;

    debug!(count = devices.len(), "Enumerated physical devices");

    let (device, decode_family) = devices
        .iter()
        .filter(|device| selector.matches(device))
        .find_map(|device| {
            let family = find_decode_family(device, request)?;
            device_covers(device, request).then_some((device, family))
        })
        .ok_or_else(|| {
            PipelineError::PhysicalDevice(DeviceError::NoMatchingDevice {
                required: format!("{:?}", request.physical_device_flags()),
                selector: selector.to_string(),
            })
        })?;

    let decode_queue_count = match request.queue_count_policy {
        QueueCountPolicy::AllAvailable => decode_family.queue_count,
        QueueCountPolicy::ExactlyOne => 1,
    };

    let transfer_family = if decode_family.flags.contains(QueueFlags::TRANSFER) {
        None
    } else {
        find_transfer_family(device, decode_family.index)
    };

    let compute_family = if request.wants_post_process_compute() {
        find_compute_family(
            device,
            request.post_process_queue_flags,
            decode_family,
            decode_queue_count,
        )
    } else {
        None
    };

    let mut logical = LogicalDeviceRequest {
        physical_device: device.index,
        decode_queue_family: decode_family.index,
        decode_queue_count,
        encode_queue_count: 0,
        codec_operations: request.required_decode_codecs,
        create_transfer_queue: transfer_family.is_some(),
        create_graphics_queue: false,
        create_display_queue: false,
        create_compute_queue: compute_family.is_some(),
        queue_allocations: Vec::new(),
    };

    logical.allocate(decode_family, decode_queue_count);
    if let Some(family) = transfer_family {
        logical.allocate(family, 1);
    }
    if let Some(family) = compute_family {
        logical.allocate(family, 1);
    }

    backend
        .create_logical_device(&logical)
        .map_err(PipelineError::LogicalDeviceCreation)?;

    let contexts = ExecutionContextSet {
        device: device.clone(),
        decode_queue_family: decode_family.index,
        decode_queue_family_flags: decode_family.flags,
        decode_queue_count,
        decode_codecs: decode_family.codec_operations & request.required_decode_codecs,
        compute_queue_family: compute_family.map(|family| family.index),
        compute_queue_family_flags: compute_family
            .map(|family| family.flags)
            .unwrap_or_else(QueueFlags::empty),
        transfer_queue_family: transfer_family.map(|family| family.index),
    };

    info!(
        device = %device.name,
        decode_family = contexts.decode_queue_family,
        decode_queues = contexts.decode_queue_count,
        codecs = ?contexts.decode_codecs,
        transfer_family = ?contexts.transfer_queue_family,
        compute_family = ?contexts.compute_queue_family,
        "Negotiated video decode device"
    );

    Ok(contexts)
}

fn find_decode_family<'a>(
    device: &'a PhysicalDeviceInfo,
    request: &CapabilityRequest,
) -> Option<&'a QueueFamilyInfo> {
    device.queue_families.iter().find(|family| {
        family.queue_count > 0
            && family.flags.contains(request.decode_queue_flags)
            && family.codec_operations.intersects(request.required_decode_codecs)
    })
}

fn device_covers(device: &PhysicalDeviceInfo, request: &CapabilityRequest) -> bool {
    let available = device
        .queue_families
        .iter()
        .filter(|family| family.queue_count > 0)
        .fold(QueueFlags::empty(), |acc, family| acc | family.flags);

    let covered = available.contains(request.physical_device_flags());
    if !covered {
        debug!(
            device = %device.name,
            available = ?available,
            required = ?request.physical_device_flags(),
            "Skipping device: missing queue capabilities"
        );
    }
    covered
}

/// Prefers a transfer-only family, then any other family that can transfer.
fn find_transfer_family(
    device: &PhysicalDeviceInfo,
    decode_family: u32,
) -> Option<&QueueFamilyInfo> {
    let candidates = || {
        device.queue_families.iter().filter(move |family| {
            family.index != decode_family
                && family.queue_count > 0
                && family.flags.contains(QueueFlags::TRANSFER)
        })
    };

    candidates()
        .find(|family| {
            !family
                .flags
                .intersects(QueueFlags::GRAPHICS | QueueFlags::COMPUTE)
        })
        .or_else(|| candidates().next())
}

/// Picks the post-process compute family.
///
/// Families other than the decode family come first, those without graphics
/// ahead of the rest. The decode family is used only with a queue to spare,
/// and shared with the decode queues only when nothing else can compute.
fn find_compute_family<'a>(
    device: &'a PhysicalDeviceInfo,
    flags: QueueFlags,
    decode_family: &QueueFamilyInfo,
    decode_queue_count: u32,
) -> Option<&'a QueueFamilyInfo> {
    let decode_index = decode_family.index;
    let candidates = move || {
        device
            .queue_families
            .iter()
            .filter(move |family| family.queue_count > 0 && family.flags.contains(flags))
    };
    let others = move || candidates().filter(move |family| family.index != decode_index);

    if let Some(family) = others()
        .find(|family| !family.flags.contains(QueueFlags::GRAPHICS))
        .or_else(|| others().next())
    {
        return Some(family);
    }

    let decode = candidates().find(|family| family.index == decode_index)?;
    if decode.queue_count <= decode_queue_count {
        warn!(
            family = decode.index,
            decode_queues = decode_queue_count,
            "No spare compute queue, post-processing shares a decode queue"
        );
    }
    Some(decode)
}
