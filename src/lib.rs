// SPDX-License-Identifier: MPL-2.0

//! Bootstrap and orchestration of a hardware video decode pipeline.
//!
//! # Module Structure
//!
//! - [`capability`]: what to ask the device for
//! - [`device`]: physical device selection and queue negotiation
//! - [`stream`], [`decoder`], [`sink`]: the stage interfaces
//! - [`pipeline`]: strict-order assembly and the pull loop
//! - [`gst`]: GStreamer backed stages
//! - [`error`]: per-stage failures and exit codes

pub mod capability;
pub mod decoder;
pub mod device;
pub mod error;
#[cfg(feature = "gstreamer")]
pub mod gst;
pub mod pipeline;
pub mod sink;
pub mod stream;

pub use capability::{CapabilityOptions, CapabilityRequest};
pub use device::{DeviceSelector, ExecutionContextSet, negotiate};
pub use error::{DeviceError, PipelineError};
pub use pipeline::{DecodeSummary, Pipeline, PipelineConfig, RunResult, TerminationReason, decode};
