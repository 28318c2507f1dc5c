// SPDX-License-Identifier: MPL-2.0

//! Error taxonomy of a decode run.
//!
//! Each assembly stage fails with its own variant, and each variant maps to a
//! distinct negative process exit status:
//!
//! | Variant                 | Stage                        | Exit |
//! |-------------------------|------------------------------|------|
//! | `DeviceInit`            | loader / instance            | -1   |
//! | `PhysicalDevice`        | physical device selection    | -2   |
//! | `LogicalDeviceCreation` | queue and device creation    | -3   |
//! | `SourceOpen`            | stream source                | -4   |
//! | `SinkOpen`              | frame sink                   | -5   |
//! | `DecoderCreation`       | hardware decoder             | -6   |
//! | `StepFatal`             | a failed decode step         | -7   |

use thiserror::Error;

/// Boxed error carried by the stage variants.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures reported by a [`DeviceBackend`](crate::device::DeviceBackend).
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("video device backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("no physical device supports {required}{selector}")]
    NoMatchingDevice { required: String, selector: String },
    #[error("queue family {family} of device {device} cannot host {queues} queue(s)")]
    QueueUnavailable {
        device: String,
        family: u32,
        queues: u32,
    },
    #[error("logical device creation failed: {0}")]
    Creation(String),
}

/// Stage-identifying failure of a decode run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("device initialization failed")]
    DeviceInit(#[source] DeviceError),
    #[error("physical device selection failed")]
    PhysicalDevice(#[source] DeviceError),
    #[error("logical device creation failed")]
    LogicalDeviceCreation(#[source] DeviceError),
    #[error("failed to open stream source {path}")]
    SourceOpen {
        path: String,
        #[source]
        source: BoxError,
    },
    #[error("failed to open frame sink {path}")]
    SinkOpen {
        path: String,
        #[source]
        source: BoxError,
    },
    #[error("failed to create hardware decoder")]
    DecoderCreation(#[source] BoxError),
    #[error("decode step {step} failed")]
    StepFatal {
        step: u64,
        #[source]
        source: BoxError,
    },
}

impl PipelineError {
    /// Process exit status for this failure.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::DeviceInit(_) => -1,
            Self::PhysicalDevice(_) => -2,
            Self::LogicalDeviceCreation(_) => -3,
            Self::SourceOpen { .. } => -4,
            Self::SinkOpen { .. } => -5,
            Self::DecoderCreation(_) => -6,
            Self::StepFatal { .. } => -7,
        }
    }

    /// Short name of the failing stage.
    #[must_use]
    pub fn stage(&self) -> &'static str {
        match self {
            Self::DeviceInit(_) => "device-init",
            Self::PhysicalDevice(_) => "physical-device",
            Self::LogicalDeviceCreation(_) => "logical-device",
            Self::SourceOpen { .. } => "source",
            Self::SinkOpen { .. } => "sink",
            Self::DecoderCreation(_) => "decoder",
            Self::StepFatal { .. } => "decode-step",
        }
    }
}

/// Converts an `eyre::Report` from a collaborator into a boxed source error.
pub(crate) fn boxed(report: eyre::Report) -> BoxError {
    report.into()
}
