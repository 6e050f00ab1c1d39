//! Vulkan instance, surface and error types
//!
//! Everything here is created once per backend and torn down last, after the
//! device and every object that depends on it.

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::Surface;
use ash::{vk, Entry, Instance};
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use thiserror::Error;

use crate::render::window::PlatformSurface;

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Backend initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// No physical device satisfied the requirements
    #[error("No suitable physical device found")]
    NoSuitableDevice,

    /// No memory type matched the requested filter and properties
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// None of the candidate depth formats is usable as a depth attachment
    #[error("No supported depth format found")]
    NoDepthFormat,

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// The object-state table is full
    #[error("Object capacity exceeded (max {max})")]
    CapacityExceeded {
        /// Configured maximum object count
        max: usize,
    },

    /// An object id that was never acquired or was already released
    #[error("Invalid object id: {id}")]
    InvalidObjectId {
        /// The offending id
        id: u32,
    },

    /// A shader binary could not be read
    #[error("Failed to load shader {path}: {source}")]
    ShaderLoad {
        /// Path that was read
        path: String,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// The logical device was lost; nothing can recover this
    #[error("Device lost")]
    DeviceLost,
}

impl VulkanError {
    /// Map a raw result code, singling out device loss
    pub fn from_result(result: vk::Result) -> Self {
        if result == vk::Result::ERROR_DEVICE_LOST {
            Self::DeviceLost
        } else {
            Self::Api(result)
        }
    }

    /// Whether the error should stop the frame pipeline
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::CapacityExceeded { .. } | Self::InvalidObjectId { .. })
    }
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;

const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";

/// Vulkan instance wrapper with RAII cleanup
pub struct VulkanInstance {
    /// Vulkan entry point
    pub entry: Entry,
    /// Vulkan instance handle
    pub instance: Instance,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanInstance {
    /// Create the instance with the platform's surface extensions and, optionally, validation
    pub fn new(platform: &dyn PlatformSurface, app_name: &str, enable_validation: bool) -> VulkanResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| VulkanError::InitializationFailed(format!("Failed to load Vulkan: {e}")))?;

        let app_name_cstr = to_cstring(app_name)?;
        let engine_name_cstr = to_cstring("RenderEngine")?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name_cstr)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_2);

        let required_extensions = platform.required_instance_extensions()
            .map_err(|e| VulkanError::InitializationFailed(format!("Failed to get required extensions: {e}")))?;

        let cstr_extensions = required_extensions
            .iter()
            .map(|ext| to_cstring(ext))
            .collect::<VulkanResult<Vec<_>>>()?;

        let mut extensions: Vec<*const c_char> = cstr_extensions.iter().map(|ext| ext.as_ptr()).collect();
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        log::debug!("Required instance extensions: {:?}", required_extensions);

        let layer_names = if enable_validation {
            Self::check_validation_layer(&entry)?;
            vec![to_cstring(VALIDATION_LAYER)?]
        } else {
            Vec::new()
        };
        let layer_names_ptrs: Vec<*const c_char> = layer_names.iter().map(|name| name.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names_ptrs);

        let instance = unsafe {
            entry.create_instance(&create_info, None)
                .map_err(VulkanError::Api)?
        };
        log::info!("Vulkan instance created");

        let debug_utils = if enable_validation {
            let loader = DebugUtils::new(&entry, &instance);
            let messenger = Self::setup_debug_messenger(&loader)?;
            log::debug!("Vulkan debugger created");
            Some((loader, messenger))
        } else {
            None
        };

        Ok(Self {
            entry,
            instance,
            debug_utils,
        })
    }

    fn check_validation_layer(entry: &Entry) -> VulkanResult<()> {
        let available = entry.enumerate_instance_layer_properties().map_err(VulkanError::Api)?;
        let found = available.iter().any(|layer| {
            let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
            name.to_str().map_or(false, |name| name == VALIDATION_LAYER)
        });

        if found {
            log::info!("Required validation layer is present");
            Ok(())
        } else {
            Err(VulkanError::InitializationFailed(format!(
                "Required validation layer is missing: {VALIDATION_LAYER}"
            )))
        }
    }

    fn setup_debug_messenger(debug_utils: &DebugUtils) -> VulkanResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe {
            debug_utils.create_debug_utils_messenger(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, messenger)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        log::debug!("Vulkan instance destroyed");
    }
}

/// Window surface plus the loader used to query it
pub struct SurfaceContext {
    /// Surface extension loader
    pub loader: Surface,
    /// Surface handle
    pub surface: vk::SurfaceKHR,
}

impl SurfaceContext {
    /// Ask the platform to create a surface for `instance`
    pub fn new(vulkan: &VulkanInstance, platform: &dyn PlatformSurface) -> VulkanResult<Self> {
        let loader = Surface::new(&vulkan.entry, &vulkan.instance);
        let surface = platform.create_surface(vulkan.instance.handle())
            .map_err(|e| VulkanError::InitializationFailed(format!("Failed to create surface: {e}")))?;
        log::debug!("Vulkan surface created");
        Ok(Self { loader, surface })
    }
}

impl Drop for SurfaceContext {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_surface(self.surface, None);
        }
    }
}

fn to_cstring(value: &str) -> VulkanResult<CString> {
    CString::new(value)
        .map_err(|_| VulkanError::InitializationFailed(format!("Interior nul byte in {value:?}")))
}

/// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if callback_data.is_null() || (*callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::INFO {
        log::info!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::trace!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_lost_is_singled_out() {
        assert!(matches!(VulkanError::from_result(vk::Result::ERROR_DEVICE_LOST), VulkanError::DeviceLost));
        assert!(matches!(
            VulkanError::from_result(vk::Result::ERROR_OUT_OF_HOST_MEMORY),
            VulkanError::Api(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
        ));
    }

    #[test]
    fn test_capacity_errors_are_not_fatal() {
        assert!(!VulkanError::CapacityExceeded { max: 4 }.is_fatal());
        assert!(!VulkanError::InvalidObjectId { id: 9 }.is_fatal());
        assert!(VulkanError::DeviceLost.is_fatal());
        assert!(VulkanError::NoDepthFormat.is_fatal());
    }
}
