// SPDX-License-Identifier: MPL-2.0

//! Vulkan Video device backend.
//!
//! Owns the loader, the instance and, once negotiated, the logical device.
//! Objects are destroyed in reverse creation order on drop. With validation
//! requested, `VK_LAYER_KHRONOS_validation` and a `VK_EXT_debug_utils`
//! messenger route driver messages into `tracing`.

use std::ffi::{CStr, CString, c_char};

use ash::vk;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{DeviceBackend, LogicalDeviceRequest, PhysicalDeviceInfo, QueueFamilyInfo};
use crate::{
    capability::{CodecOperations, QueueFlags},
    error::DeviceError,
};

const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";
const ENGINE_NAME: &CStr = c"vk-video-dec";

/// Extensions every decode device must expose.
const REQUIRED_DEVICE_EXTENSIONS: &[&CStr] = &[
    ash::khr::video_queue::NAME,
    ash::khr::video_decode_queue::NAME,
    ash::khr::synchronization2::NAME,
];

/// Per-codec decode extensions, enabled when present.
const CODEC_DEVICE_EXTENSIONS: &[(CodecOperations, &CStr)] = &[
    (CodecOperations::DECODE_H264, ash::khr::video_decode_h264::NAME),
    (CodecOperations::DECODE_H265, ash::khr::video_decode_h265::NAME),
    (CodecOperations::DECODE_AV1, ash::khr::video_decode_av1::NAME),
];

struct Candidate {
    handle: vk::PhysicalDevice,
    name: String,
    codec_extensions: CodecOperations,
}

/// [`DeviceBackend`] on top of the system Vulkan loader.
pub struct VulkanBackend {
    _entry: ash::Entry,
    instance: ash::Instance,
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    /// Every enumerated device, by enumeration index. Devices without the
    /// video extensions are `None`.
    candidates: Vec<Option<Candidate>>,
    device: Option<ash::Device>,
}

impl VulkanBackend {
    /// Load Vulkan and create the instance.
    pub fn new(app_name: &str, validate: bool, validate_verbose: bool) -> Result<Self, DeviceError> {
        let entry = unsafe {
            // SAFETY: the entry is stored in the backend and outlives every
            // object created from it.
            ash::Entry::load()
        }
        .map_err(|e| DeviceError::BackendUnavailable(e.to_string()))?;

        let enable_validation = validate && has_validation_layer(&entry);
        if validate && !enable_validation {
            warn!("Validation layer not available, running without validation");
        }

        let instance = create_instance(&entry, app_name, enable_validation)?;
        info!(validation = enable_validation, "Vulkan instance created");

        let debug_utils = if enable_validation && has_debug_utils_extension(&entry) {
            match setup_debug_messenger(&entry, &instance, validate_verbose) {
                Ok(pair) => Some(pair),
                Err(e) => {
                    warn!(error = %e, "Failed to create debug messenger, continuing without it");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            _entry: entry,
            instance,
            debug_utils,
            candidates: Vec::new(),
            device: None,
        })
    }

    fn describe(&self, index: usize, candidate: &Candidate) -> PhysicalDeviceInfo {
        let mut id_props = vk::PhysicalDeviceIDProperties::default();
        let properties = {
            let mut props2 = vk::PhysicalDeviceProperties2::default().push_next(&mut id_props);
            unsafe {
                // SAFETY: the handle was enumerated from this instance.
                self.instance
                    .get_physical_device_properties2(candidate.handle, &mut props2);
            }
            props2.properties
        };

        let queue_families = self.queue_families(candidate.handle);

        let info = PhysicalDeviceInfo {
            index,
            name: candidate.name.clone(),
            vendor_id: properties.vendor_id,
            device_id: properties.device_id,
            uuid: Uuid::from_bytes(id_props.device_uuid),
            queue_families,
        };

        debug!(
            device = %info.name,
            vendor_id = format!("{:#06x}", info.vendor_id),
            device_id = format!("{:#06x}", info.device_id),
            uuid = %info.uuid,
            families = ?info.queue_families,
            "Found video capable physical device"
        );

        info
    }

    fn queue_families(&self, handle: vk::PhysicalDevice) -> Vec<QueueFamilyInfo> {
        let len = unsafe {
            // SAFETY: the handle was enumerated from this instance.
            self.instance
                .get_physical_device_queue_family_properties2_len(handle)
        };

        let mut video_props = vec![vk::QueueFamilyVideoPropertiesKHR::default(); len];
        let basics: Vec<vk::QueueFamilyProperties> = {
            let mut family_props: Vec<vk::QueueFamilyProperties2> = video_props
                .iter_mut()
                .map(|video| vk::QueueFamilyProperties2::default().push_next(video))
                .collect();
            unsafe {
                // SAFETY: `family_props` holds exactly `len` entries, each
                // chaining a video properties struct that outlives the call.
                self.instance
                    .get_physical_device_queue_family_properties2(handle, &mut family_props);
            }
            family_props
                .iter()
                .map(|props| props.queue_family_properties)
                .collect()
        };

        basics
            .iter()
            .zip(&video_props)
            .enumerate()
            .map(|(index, (basic, video))| QueueFamilyInfo {
                index: index as u32,
                flags: queue_flags_from_vk(basic.queue_flags),
                queue_count: basic.queue_count,
                codec_operations: codec_operations_from_vk(video.video_codec_operations),
            })
            .collect()
    }
}

impl DeviceBackend for VulkanBackend {
    fn physical_devices(&mut self) -> Result<Vec<PhysicalDeviceInfo>, DeviceError> {
        let handles = unsafe {
            // SAFETY: the instance is alive for the lifetime of the backend.
            self.instance.enumerate_physical_devices()
        }
        .map_err(|e| DeviceError::BackendUnavailable(format!("enumerate_physical_devices: {e}")))?;

        info!(count = handles.len(), "Found Vulkan physical devices");

        self.candidates = handles
            .into_iter()
            .map(|handle| probe_candidate(&self.instance, handle))
            .collect();

        Ok(self
            .candidates
            .iter()
            .enumerate()
            .filter_map(|(index, candidate)| {
                candidate
                    .as_ref()
                    .map(|candidate| self.describe(index, candidate))
            })
            .collect())
    }

    fn create_logical_device(&mut self, request: &LogicalDeviceRequest) -> Result<(), DeviceError> {
        if self.device.is_some() {
            return Err(DeviceError::Creation("logical device already created".into()));
        }

        let candidate = self
            .candidates
            .get(request.physical_device)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                DeviceError::Creation(format!(
                    "physical device {} was not enumerated",
                    request.physical_device
                ))
            })?;

        let priorities: Vec<Vec<f32>> = request
            .queue_allocations
            .iter()
            .map(|alloc| vec![1.0; alloc.count as usize])
            .collect();
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = request
            .queue_allocations
            .iter()
            .zip(&priorities)
            .map(|(alloc, priorities)| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(alloc.family)
                    .queue_priorities(priorities)
            })
            .collect();

        let mut extensions: Vec<*const c_char> = REQUIRED_DEVICE_EXTENSIONS
            .iter()
            .map(|name| name.as_ptr())
            .collect();
        for (codec, name) in CODEC_DEVICE_EXTENSIONS {
            if request.codec_operations.contains(*codec) && candidate.codec_extensions.contains(*codec) {
                extensions.push(name.as_ptr());
            }
        }

        let mut sync2 = vk::PhysicalDeviceSynchronization2Features::default().synchronization2(true);
        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut sync2);

        let device = unsafe {
            // SAFETY: the queue families come from this physical device and
            // every pointer in `create_info` outlives the call.
            self.instance
                .create_device(candidate.handle, &create_info, None)
        }
        .map_err(|e| DeviceError::Creation(format!("{} ({e})", candidate.name)))?;

        info!(
            device = %candidate.name,
            decode_family = request.decode_queue_family,
            decode_queues = request.decode_queue_count,
            transfer = request.create_transfer_queue,
            compute = request.create_compute_queue,
            extensions = extensions.len(),
            "Vulkan logical device created"
        );

        self.device = Some(device);
        Ok(())
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            // SAFETY: reverse creation order; device, then messenger, then
            // instance. Nothing created from the device outlives the backend.
            if let Some(device) = self.device.take() {
                device.device_wait_idle().ok();
                device.destroy_device(None);
            }
            if let Some((loader, messenger)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        debug!("Vulkan backend destroyed");
    }
}

fn has_validation_layer(entry: &ash::Entry) -> bool {
    let layers = unsafe {
        // SAFETY: enumerates instance layers on a loaded entry.
        entry.enumerate_instance_layer_properties()
    };

    match layers {
        Ok(layers) => layers
            .iter()
            .any(|layer| layer.layer_name_as_c_str() == Ok(VALIDATION_LAYER_NAME)),
        Err(e) => {
            warn!(error = ?e, "Failed to enumerate instance layers");
            false
        }
    }
}

fn has_debug_utils_extension(entry: &ash::Entry) -> bool {
    let extensions = unsafe {
        // SAFETY: enumerates instance extensions on a loaded entry.
        entry.enumerate_instance_extension_properties(None)
    };

    extensions.is_ok_and(|extensions| {
        extensions
            .iter()
            .any(|ext| ext.extension_name_as_c_str() == Ok(ash::ext::debug_utils::NAME))
    })
}

fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
) -> Result<ash::Instance, DeviceError> {
    let app_name = CString::new(app_name)
        .map_err(|_| DeviceError::BackendUnavailable("application name contains NUL".into()))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(ENGINE_NAME)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let mut layers: Vec<*const c_char> = Vec::new();
    let mut extensions: Vec<*const c_char> = Vec::new();
    if enable_validation {
        layers.push(VALIDATION_LAYER_NAME.as_ptr());
        if has_debug_utils_extension(entry) {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }
    }

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_layer_names(&layers)
        .enabled_extension_names(&extensions);

    unsafe {
        // SAFETY: every name pointer outlives the call.
        entry.create_instance(&create_info, None)
    }
    .map_err(|e| DeviceError::BackendUnavailable(format!("vkCreateInstance: {e}")))
}

fn setup_debug_messenger(
    entry: &ash::Entry,
    instance: &ash::Instance,
    verbose: bool,
) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT), vk::Result> {
    let loader = ash::ext::debug_utils::Instance::new(entry, instance);

    let mut severity =
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING;
    if verbose {
        severity |= vk::DebugUtilsMessageSeverityFlagsEXT::INFO
            | vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE;
    }

    let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(severity)
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(vulkan_debug_callback));

    let messenger = unsafe {
        // SAFETY: the instance was created with VK_EXT_debug_utils enabled;
        // the messenger is destroyed before the instance.
        loader.create_debug_utils_messenger(&messenger_info, None)?
    };

    Ok((loader, messenger))
}

fn probe_candidate(instance: &ash::Instance, handle: vk::PhysicalDevice) -> Option<Candidate> {
    let properties = unsafe {
        // SAFETY: the handle was enumerated from this instance.
        instance.get_physical_device_properties(handle)
    };
    let name = decode_device_name(&properties.device_name);

    if properties.api_version < vk::API_VERSION_1_3 {
        debug!(device = %name, "Skipping device: Vulkan 1.3 required");
        return None;
    }

    let extensions = match unsafe {
        // SAFETY: the handle was enumerated from this instance.
        instance.enumerate_device_extension_properties(handle)
    } {
        Ok(extensions) => extensions,
        Err(e) => {
            warn!(device = %name, error = ?e, "Failed to enumerate device extensions");
            return None;
        }
    };

    let has = |wanted: &CStr| {
        extensions
            .iter()
            .any(|ext| ext.extension_name_as_c_str() == Ok(wanted))
    };

    if let Some(missing) = REQUIRED_DEVICE_EXTENSIONS.iter().find(|name| !has(name)) {
        debug!(device = %name, missing = ?missing, "Skipping device: missing video extension");
        return None;
    }

    let codec_extensions = CODEC_DEVICE_EXTENSIONS
        .iter()
        .filter(|(_, ext)| has(ext))
        .fold(CodecOperations::empty(), |acc, (codec, _)| acc | *codec);

    Some(Candidate {
        handle,
        name,
        codec_extensions,
    })
}

fn queue_flags_from_vk(flags: vk::QueueFlags) -> QueueFlags {
    QueueFlags::from_bits_truncate(flags.as_raw())
}

fn codec_operations_from_vk(ops: vk::VideoCodecOperationFlagsKHR) -> CodecOperations {
    CodecOperations::from_bits_truncate(ops.as_raw())
}

/// Routes validation messages into `tracing`.
///
/// # Safety
///
/// Called by the driver with a valid callback data pointer.
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() {
        return vk::FALSE;
    }

    // SAFETY: non-null and valid for the duration of the callback.
    let callback_data = unsafe { &*p_callback_data };
    let message = if callback_data.p_message.is_null() {
        "(no message)".into()
    } else {
        // SAFETY: p_message is a NUL terminated string owned by the driver.
        unsafe { CStr::from_ptr(callback_data.p_message) }.to_string_lossy()
    };
    let kind = format!("{message_type:?}");

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            tracing::error!(target: "vulkan_validation", kind, "{}", message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            tracing::warn!(target: "vulkan_validation", kind, "{}", message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            tracing::info!(target: "vulkan_validation", kind, "{}", message);
        }
        _ => {
            tracing::trace!(target: "vulkan_validation", kind, "{}", message);
        }
    }

    vk::FALSE
}

fn decode_device_name(name: &[c_char; vk::MAX_PHYSICAL_DEVICE_NAME_SIZE]) -> String {
    // SAFETY: deviceName is a NUL terminated string filled by the driver.
    let cstr = unsafe { CStr::from_ptr(name.as_ptr()) };
    cstr.to_string_lossy().into_owned()
}
