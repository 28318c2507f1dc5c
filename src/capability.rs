// SPDX-License-Identifier: MPL-2.0

//! Capability descriptor handed to the device negotiator.
//!
//! The descriptor is pure data derived from the run options:
//!
//! - decode is always requested, compute joins the decode request only when
//!   the caller wants decode and compute co-scheduled on one family
//! - a separate compute request exists only for an enabled post-process filter
//! - the offered codec set is always H.264 | H.265 | AV1 decode; unsupported
//!   members are not an error at this point

use bitflags::bitflags;

bitflags! {
    /// Queue family capabilities, bit-compatible with `VkQueueFlags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QueueFlags: u32 {
        const GRAPHICS = 0x0000_0001;
        const COMPUTE = 0x0000_0002;
        const TRANSFER = 0x0000_0004;
        const VIDEO_DECODE = 0x0000_0020;
        const VIDEO_ENCODE = 0x0000_0040;
    }
}

bitflags! {
    /// Video codec operations, bit-compatible with `VkVideoCodecOperationFlagsKHR`
    /// for the decode members.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CodecOperations: u32 {
        const DECODE_H264 = 0x0000_0001;
        const DECODE_H265 = 0x0000_0002;
        const DECODE_AV1 = 0x0000_0004;
    }
}

impl CodecOperations {
    /// Decode operations offered on every run.
    pub const DECODE_ALL: Self = Self::DECODE_H264
        .union(Self::DECODE_H265)
        .union(Self::DECODE_AV1);
}

/// How many decode queues to create on the decode family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueCountPolicy {
    /// Every queue the family exposes.
    AllAvailable,
    /// A single queue.
    ExactlyOne,
}

/// Inputs that shape a [`CapabilityRequest`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityOptions {
    pub enable_hw_load_balancing: bool,
    pub queue_id: u32,
    pub post_process_filter: Option<u32>,
    pub select_video_with_compute_queue: bool,
}

/// What the negotiator is asked to provide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityRequest {
    pub required_decode_codecs: CodecOperations,
    pub queue_count_policy: QueueCountPolicy,
    /// Flags the decode queue family has to carry.
    pub decode_queue_flags: QueueFlags,
    /// Flags of the dedicated post-process queue, empty when none is wanted.
    pub post_process_queue_flags: QueueFlags,
    pub post_process_filter: Option<u32>,
}

impl CapabilityRequest {
    /// Build the request for the given options.
    #[must_use]
    pub fn new(options: &CapabilityOptions) -> Self {
        let queue_count_policy = if options.queue_id != 0 || options.enable_hw_load_balancing {
            QueueCountPolicy::AllAvailable
        } else {
            QueueCountPolicy::ExactlyOne
        };

        let mut decode_queue_flags = QueueFlags::VIDEO_DECODE;
        if options.select_video_with_compute_queue {
            decode_queue_flags |= QueueFlags::COMPUTE;
        }

        let post_process_queue_flags = if options.post_process_filter.is_some() {
            QueueFlags::COMPUTE
        } else {
            QueueFlags::empty()
        };

        Self {
            required_decode_codecs: CodecOperations::DECODE_ALL,
            queue_count_policy,
            decode_queue_flags,
            post_process_queue_flags,
            post_process_filter: options.post_process_filter,
        }
    }

    /// Whether a dedicated compute queue is requested for post-processing.
    #[must_use]
    pub fn wants_post_process_compute(&self) -> bool {
        !self.post_process_queue_flags.is_empty()
    }

    /// Union of flags a physical device must advertise across its families.
    #[must_use]
    pub fn physical_device_flags(&self) -> QueueFlags {
        QueueFlags::TRANSFER | self.decode_queue_flags | self.post_process_queue_flags
    }
}
