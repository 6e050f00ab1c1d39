//! Physical device selection and logical device creation
//!
//! Selection walks every physical device in enumeration order and takes the
//! first one that satisfies [`DeviceRequirements`]. Queue family assignment is
//! computed by [`select_queue_families`] from plain capability flags so the
//! scoring can be exercised without a GPU.

use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::{vk, Device, Instance};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;

use super::context::{SurfaceContext, VulkanError, VulkanResult};

bitflags! {
    /// Capabilities of a single queue family, present support included
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueueCapabilities: u8 {
        /// Graphics operations
        const GRAPHICS = 1 << 0;
        /// Compute dispatch
        const COMPUTE = 1 << 1;
        /// Transfer operations
        const TRANSFER = 1 << 2;
        /// Presentation to the target surface
        const PRESENT = 1 << 3;
    }
}

impl QueueCapabilities {
    /// Build from the driver-reported flags plus the surface present query
    pub fn from_vk(flags: vk::QueueFlags, present: bool) -> Self {
        let mut caps = Self::empty();
        caps.set(Self::GRAPHICS, flags.contains(vk::QueueFlags::GRAPHICS));
        caps.set(Self::COMPUTE, flags.contains(vk::QueueFlags::COMPUTE));
        caps.set(Self::TRANSFER, flags.contains(vk::QueueFlags::TRANSFER));
        caps.set(Self::PRESENT, present);
        caps
    }
}

/// What a physical device must offer to be selected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceRequirements {
    /// Require a graphics queue
    pub graphics: bool,
    /// Require a queue that can present to the surface
    pub present: bool,
    /// Require a compute queue
    pub compute: bool,
    /// Require a transfer queue
    pub transfer: bool,
    /// Require anisotropic sampling support
    pub sampler_anisotropy: bool,
    /// Only accept discrete GPUs
    pub discrete_gpu: bool,
    /// Device extensions that must be present, matched by exact name
    pub extensions: Vec<String>,
}

impl Default for DeviceRequirements {
    fn default() -> Self {
        Self {
            graphics: true,
            present: true,
            compute: true,
            transfer: true,
            sampler_anisotropy: true,
            discrete_gpu: false,
            extensions: vec!["VK_KHR_swapchain".to_string()],
        }
    }
}

/// Queue family index per role
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    /// Graphics family
    pub graphics: Option<u32>,
    /// Present family
    pub present: Option<u32>,
    /// Compute family
    pub compute: Option<u32>,
    /// Transfer family
    pub transfer: Option<u32>,
}

impl QueueFamilyIndices {
    /// Whether every role the requirements ask for has a family
    pub fn satisfies(&self, requirements: &DeviceRequirements) -> bool {
        (!requirements.graphics || self.graphics.is_some())
            && (!requirements.present || self.present.is_some())
            && (!requirements.compute || self.compute.is_some())
            && (!requirements.transfer || self.transfer.is_some())
    }

    /// Distinct family indices, one queue-create entry each
    pub fn unique_families(&self) -> Vec<u32> {
        [self.graphics, self.present, self.compute, self.transfer]
            .into_iter()
            .flatten()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Assign a family to every role.
///
/// Graphics, compute and present take the first family that supports them.
/// Transfer takes the family with the fewest other capabilities (graphics and
/// compute count against a family), so a dedicated transfer family beats one
/// shared with graphics; on a tie the later family wins.
pub fn select_queue_families(families: &[QueueCapabilities]) -> QueueFamilyIndices {
    let mut indices = QueueFamilyIndices::default();
    let mut min_transfer_score = u8::MAX;

    for (index, caps) in families.iter().enumerate() {
        let index = index as u32;
        let mut score = 0u8;

        if caps.contains(QueueCapabilities::GRAPHICS) {
            indices.graphics.get_or_insert(index);
            score += 1;
        }
        if caps.contains(QueueCapabilities::COMPUTE) {
            indices.compute.get_or_insert(index);
            score += 1;
        }
        if caps.contains(QueueCapabilities::TRANSFER) && score <= min_transfer_score {
            min_transfer_score = score;
            indices.transfer = Some(index);
        }
        if caps.contains(QueueCapabilities::PRESENT) {
            indices.present.get_or_insert(index);
        }
    }

    indices
}

/// Surface capabilities snapshot, refreshed before every swapchain creation
#[derive(Debug, Clone, Default)]
pub struct SwapchainSupport {
    /// Surface capabilities (extent limits, image counts, transforms)
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupport {
    /// Query the surface for a physical device
    pub fn query(surface: &SurfaceContext, physical_device: vk::PhysicalDevice) -> VulkanResult<Self> {
        unsafe {
            Ok(Self {
                capabilities: surface.loader
                    .get_physical_device_surface_capabilities(physical_device, surface.surface)
                    .map_err(VulkanError::Api)?,
                formats: surface.loader
                    .get_physical_device_surface_formats(physical_device, surface.surface)
                    .map_err(VulkanError::Api)?,
                present_modes: surface.loader
                    .get_physical_device_surface_present_modes(physical_device, surface.surface)
                    .map_err(VulkanError::Api)?,
            })
        }
    }

    /// At least one format and one present mode
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Depth formats tried in order of preference
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// First candidate usable as a depth-stencil attachment under linear or optimal tiling
pub fn select_depth_format<F>(candidates: &[vk::Format], mut format_properties: F) -> Option<vk::Format>
where
    F: FnMut(vk::Format) -> vk::FormatProperties,
{
    let required = vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
    candidates.iter().copied().find(|&format| {
        let props = format_properties(format);
        props.linear_tiling_features.contains(required) || props.optimal_tiling_features.contains(required)
    })
}

/// Index of the first memory type allowed by `type_filter` that has every flag in `flags`
pub fn find_memory_type_index(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&i| {
        type_filter & (1 << i) != 0
            && memory_properties.memory_types[i as usize].property_flags.contains(flags)
    })
}

/// Selected physical device plus the logical device built on it
pub struct VulkanDevice {
    /// Physical device handle
    pub physical_device: vk::PhysicalDevice,
    /// Logical device
    pub logical: Device,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Supported features
    pub features: vk::PhysicalDeviceFeatures,
    /// Memory types and heaps
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Family index per queue role
    pub queue_indices: QueueFamilyIndices,
    /// Graphics queue
    pub graphics_queue: vk::Queue,
    /// Present queue
    pub present_queue: vk::Queue,
    /// Compute queue, when a compute family exists
    pub compute_queue: Option<vk::Queue>,
    /// Transfer queue, when a transfer family exists
    pub transfer_queue: Option<vk::Queue>,
    /// Depth attachment format
    pub depth_format: vk::Format,
    /// Surface support, refreshed on every swapchain (re)creation
    pub swapchain_support: SwapchainSupport,
    /// Whether a device-local memory type is also host visible
    pub supports_device_local_host_visible: bool,
    /// Command pool on the graphics family, lives as long as the device
    pub graphics_command_pool: vk::CommandPool,
}

struct Candidate {
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    features: vk::PhysicalDeviceFeatures,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    queue_indices: QueueFamilyIndices,
    swapchain_support: SwapchainSupport,
}

impl VulkanDevice {
    /// Pick a physical device and create the logical device, queues and graphics command pool
    pub fn new(instance: &Instance, surface: &SurfaceContext, requirements: &DeviceRequirements) -> VulkanResult<Self> {
        let candidate = Self::select_physical_device(instance, surface, requirements)?;

        let graphics_family = candidate.queue_indices.graphics.ok_or_else(|| {
            VulkanError::InitializationFailed("Rendering requires a graphics queue family".to_string())
        })?;
        let present_family = candidate.queue_indices.present.ok_or_else(|| {
            VulkanError::InitializationFailed("Rendering requires a present queue family".to_string())
        })?;

        let queue_priorities = [1.0f32];
        let unique_families = candidate.queue_indices.unique_families();
        let queue_create_infos: Vec<_> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let enabled_features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(requirements.sampler_anisotropy);

        let extension_names = requirements.extensions
            .iter()
            .map(|name| {
                CString::new(name.as_str())
                    .map_err(|_| VulkanError::InitializationFailed(format!("Invalid extension name {name:?}")))
            })
            .collect::<VulkanResult<Vec<_>>>()?;
        let extension_ptrs: Vec<*const c_char> = extension_names.iter().map(|name| name.as_ptr()).collect();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_features(&enabled_features)
            .enabled_extension_names(&extension_ptrs);

        let logical = unsafe {
            instance.create_device(candidate.physical_device, &create_info, None)
                .map_err(VulkanError::Api)?
        };
        log::info!("Logical device created with {} queue famil(ies)", unique_families.len());

        let (graphics_queue, present_queue, compute_queue, transfer_queue) = unsafe {
            (
                logical.get_device_queue(graphics_family, 0),
                logical.get_device_queue(present_family, 0),
                candidate.queue_indices.compute.map(|family| logical.get_device_queue(family, 0)),
                candidate.queue_indices.transfer.map(|family| logical.get_device_queue(family, 0)),
            )
        };

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(graphics_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let graphics_command_pool = match unsafe { logical.create_command_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { logical.destroy_device(None) };
                return Err(VulkanError::Api(e));
            }
        };

        let depth_format = match select_depth_format(&DEPTH_FORMAT_CANDIDATES, |format| unsafe {
            instance.get_physical_device_format_properties(candidate.physical_device, format)
        }) {
            Some(format) => format,
            None => {
                unsafe {
                    logical.destroy_command_pool(graphics_command_pool, None);
                    logical.destroy_device(None);
                }
                return Err(VulkanError::NoDepthFormat);
            }
        };
        log::debug!("Depth format: {:?}", depth_format);

        let supports_device_local_host_visible = (0..candidate.memory_properties.memory_type_count).any(|i| {
            candidate.memory_properties.memory_types[i as usize].property_flags.contains(
                vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE,
            )
        });

        Ok(Self {
            physical_device: candidate.physical_device,
            logical,
            properties: candidate.properties,
            features: candidate.features,
            memory_properties: candidate.memory_properties,
            queue_indices: candidate.queue_indices,
            graphics_queue,
            present_queue,
            compute_queue,
            transfer_queue,
            depth_format,
            swapchain_support: candidate.swapchain_support,
            supports_device_local_host_visible,
            graphics_command_pool,
        })
    }

    fn select_physical_device(
        instance: &Instance,
        surface: &SurfaceContext,
        requirements: &DeviceRequirements,
    ) -> VulkanResult<Candidate> {
        let devices = unsafe {
            instance.enumerate_physical_devices()
                .map_err(VulkanError::Api)?
        };
        if devices.is_empty() {
            log::error!("No devices which support Vulkan were found");
        }

        for physical_device in devices {
            match Self::evaluate_device(instance, surface, physical_device, requirements)? {
                Some(candidate) => {
                    log_device_info(&candidate.properties, &candidate.memory_properties);
                    return Ok(candidate);
                }
                None => continue,
            }
        }

        log::error!("No physical devices were found which meet the requirements");
        Err(VulkanError::NoSuitableDevice)
    }

    fn evaluate_device(
        instance: &Instance,
        surface: &SurfaceContext,
        physical_device: vk::PhysicalDevice,
        requirements: &DeviceRequirements,
    ) -> VulkanResult<Option<Candidate>> {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let features = unsafe { instance.get_physical_device_features(physical_device) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let name = device_name(&properties);

        if requirements.discrete_gpu && properties.device_type != vk::PhysicalDeviceType::DISCRETE_GPU {
            log::info!("Device '{}' is not a discrete GPU, skipping", name);
            return Ok(None);
        }

        let families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let mut capabilities = Vec::with_capacity(families.len());
        for (index, family) in families.iter().enumerate() {
            let present = unsafe {
                surface.loader
                    .get_physical_device_surface_support(physical_device, index as u32, surface.surface)
                    .map_err(VulkanError::Api)?
            };
            capabilities.push(QueueCapabilities::from_vk(family.queue_flags, present));
        }

        let queue_indices = select_queue_families(&capabilities);
        log::debug!(
            "Device '{}' queue families: graphics={:?} present={:?} compute={:?} transfer={:?}",
            name,
            queue_indices.graphics,
            queue_indices.present,
            queue_indices.compute,
            queue_indices.transfer
        );
        if !queue_indices.satisfies(requirements) {
            log::info!("Device '{}' lacks a required queue family, skipping", name);
            return Ok(None);
        }

        let swapchain_support = SwapchainSupport::query(surface, physical_device)?;
        if !swapchain_support.is_adequate() {
            log::info!("Device '{}' has no usable surface format or present mode, skipping", name);
            return Ok(None);
        }

        let available = unsafe {
            instance.enumerate_device_extension_properties(physical_device)
                .map_err(VulkanError::Api)?
        };
        let available_names: Vec<&CStr> = available
            .iter()
            .map(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) })
            .collect();
        if let Some(missing) = requirements.extensions.iter().find(|required| {
            !available_names.iter().any(|name| name.to_bytes() == required.as_bytes())
        }) {
            log::info!("Device '{}' is missing extension '{}', skipping", name, missing);
            return Ok(None);
        }

        if requirements.sampler_anisotropy && features.sampler_anisotropy == vk::FALSE {
            log::info!("Device '{}' does not support sampler anisotropy, skipping", name);
            return Ok(None);
        }

        Ok(Some(Candidate {
            physical_device,
            properties,
            features,
            memory_properties,
            queue_indices,
            swapchain_support,
        }))
    }

    /// Re-query surface support; called before every swapchain creation
    pub fn refresh_swapchain_support(&mut self, surface: &SurfaceContext) -> VulkanResult<()> {
        self.swapchain_support = SwapchainSupport::query(surface, self.physical_device)?;
        Ok(())
    }

    /// Memory type index for an allocation
    pub fn find_memory_index(&self, type_filter: u32, flags: vk::MemoryPropertyFlags) -> VulkanResult<u32> {
        find_memory_type_index(&self.memory_properties, type_filter, flags).ok_or_else(|| {
            log::warn!("Unable to find suitable memory type (filter {:#x}, flags {:?})", type_filter, flags);
            VulkanError::NoSuitableMemoryType
        })
    }

    /// Graphics family index
    pub fn graphics_family(&self) -> u32 {
        self.queue_indices.graphics.unwrap_or_default()
    }

    /// Present family index
    pub fn present_family(&self) -> u32 {
        self.queue_indices.present.unwrap_or_default()
    }

    /// Block until the device finishes all submitted work
    pub fn wait_idle(&self) -> VulkanResult<()> {
        unsafe { self.logical.device_wait_idle() }.map_err(VulkanError::from_result)
    }

    /// Swapchain extension loader for this device
    pub fn swapchain_loader(&self, instance: &Instance) -> SwapchainLoader {
        SwapchainLoader::new(instance, &self.logical)
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.logical.device_wait_idle() {
                log::error!("Failed to wait for device idle during cleanup: {:?}", e);
            }
            self.logical.destroy_command_pool(self.graphics_command_pool, None);
            self.logical.destroy_device(None);
        }
        log::debug!("Logical device destroyed");
    }
}

fn device_name(properties: &vk::PhysicalDeviceProperties) -> String {
    unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

fn log_device_info(properties: &vk::PhysicalDeviceProperties, memory: &vk::PhysicalDeviceMemoryProperties) {
    log::info!("Selected device: '{}'", device_name(properties));
    log::info!("GPU type: {:?}", properties.device_type);
    log::info!(
        "GPU driver version: {}.{}.{}",
        vk::api_version_major(properties.driver_version),
        vk::api_version_minor(properties.driver_version),
        vk::api_version_patch(properties.driver_version)
    );
    log::info!(
        "Vulkan API version: {}.{}.{}",
        vk::api_version_major(properties.api_version),
        vk::api_version_minor(properties.api_version),
        vk::api_version_patch(properties.api_version)
    );

    for heap in &memory.memory_heaps[..memory.memory_heap_count as usize] {
        let gib = heap.size as f64 / (1024.0 * 1024.0 * 1024.0);
        if heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
            log::info!("Local GPU memory: {:.2} GiB", gib);
        } else {
            log::info!("Shared system memory: {:.2} GiB", gib);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GFX: QueueCapabilities = QueueCapabilities::GRAPHICS;
    const CMP: QueueCapabilities = QueueCapabilities::COMPUTE;
    const XFR: QueueCapabilities = QueueCapabilities::TRANSFER;
    const PRS: QueueCapabilities = QueueCapabilities::PRESENT;

    #[test]
    fn test_dedicated_transfer_family_wins() {
        let families = [GFX | PRS | XFR, XFR];
        let indices = select_queue_families(&families);
        assert_eq!(indices.graphics, Some(0));
        assert_eq!(indices.present, Some(0));
        assert_eq!(indices.transfer, Some(1));
        assert_eq!(indices.compute, None);
    }

    #[test]
    fn test_transfer_prefers_fewest_other_capabilities() {
        let families = [GFX | CMP | XFR | PRS, CMP | XFR, GFX | XFR];
        let indices = select_queue_families(&families);
        assert_eq!(indices.graphics, Some(0));
        assert_eq!(indices.compute, Some(0));
        // families 1 and 2 both score 1; the later one takes the tie
        assert_eq!(indices.transfer, Some(2));
    }

    #[test]
    fn test_single_universal_family() {
        let indices = select_queue_families(&[GFX | CMP | XFR | PRS]);
        assert_eq!(indices.graphics, Some(0));
        assert_eq!(indices.present, Some(0));
        assert_eq!(indices.compute, Some(0));
        assert_eq!(indices.transfer, Some(0));
        assert_eq!(indices.unique_families(), vec![0]);
    }

    #[test]
    fn test_unique_families_deduplicates() {
        let indices = QueueFamilyIndices {
            graphics: Some(0),
            present: Some(2),
            compute: Some(0),
            transfer: Some(1),
        };
        assert_eq!(indices.unique_families(), vec![0, 1, 2]);
    }

    #[test]
    fn test_requirements_are_configurable_per_role() {
        let indices = select_queue_families(&[GFX | PRS | XFR]);
        let mut requirements = DeviceRequirements::default();
        assert!(!indices.satisfies(&requirements));

        requirements.compute = false;
        assert!(indices.satisfies(&requirements));
    }

    #[test]
    fn test_capabilities_from_vk_flags() {
        let caps = QueueCapabilities::from_vk(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER, true);
        assert_eq!(caps, GFX | XFR | PRS);
        assert_eq!(QueueCapabilities::from_vk(vk::QueueFlags::COMPUTE, false), CMP);
    }

    #[test]
    fn test_depth_format_probe_order() {
        let supported = |format: vk::Format| {
            let mut props = vk::FormatProperties::default();
            if format == vk::Format::D24_UNORM_S8_UINT {
                props.linear_tiling_features = vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
            }
            if format == vk::Format::D32_SFLOAT_S8_UINT {
                props.optimal_tiling_features = vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
            }
            props
        };
        assert_eq!(
            select_depth_format(&DEPTH_FORMAT_CANDIDATES, supported),
            Some(vk::Format::D32_SFLOAT_S8_UINT)
        );
        assert_eq!(
            select_depth_format(&DEPTH_FORMAT_CANDIDATES, |_| vk::FormatProperties::default()),
            None
        );
    }

    #[test]
    fn test_find_memory_type_index() {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 3;
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        props.memory_types[2].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;

        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(find_memory_type_index(&props, 0b111, host), Some(1));
        assert_eq!(find_memory_type_index(&props, 0b100, vk::MemoryPropertyFlags::DEVICE_LOCAL), Some(2));
        assert_eq!(find_memory_type_index(&props, 0b001, host), None);
    }

    #[test]
    fn test_swapchain_support_adequacy() {
        let mut support = SwapchainSupport::default();
        assert!(!support.is_adequate());
        support.formats.push(vk::SurfaceFormatKHR::default());
        assert!(!support.is_adequate());
        support.present_modes.push(vk::PresentModeKHR::FIFO);
        assert!(support.is_adequate());
    }
}
