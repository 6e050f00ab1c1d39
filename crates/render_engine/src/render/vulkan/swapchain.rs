//! Vulkan swapchain management
//!
//! Owns the presentable image views, the shared depth attachment and the
//! frame-slot cursor. Staleness reported by the presentation engine is
//! absorbed here: acquire and present rebuild the chain in place and tell
//! the caller whether to skip the frame, so resize handling never surfaces
//! as an error.

use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::prelude::VkResult;
use ash::{vk, Device, Instance};

use super::context::{SurfaceContext, VulkanError, VulkanResult};
use super::device::VulkanDevice;
use super::image::{create_image_view, Image, ImageDesc};

/// Prefer 8-bit BGRA in the sRGB-nonlinear colour space, otherwise the first reported format
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|sf| sf.format == vk::Format::B8G8R8A8_UNORM && sf.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .or_else(|| formats.first())
        .copied()
}

/// Mailbox when available, FIFO otherwise (FIFO support is guaranteed)
pub fn choose_present_mode(modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Current extent when the surface defines one, else the requested size; clamped to the surface limits
pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    let (width, height) = if capabilities.current_extent.width == u32::MAX {
        (width, height)
    } else {
        (capabilities.current_extent.width, capabilities.current_extent.height)
    };

    let min = capabilities.min_image_extent;
    let max = capabilities.max_image_extent;
    vk::Extent2D {
        width: width.clamp(min.width, max.width.max(min.width)),
        height: height.clamp(min.height, max.height.max(min.height)),
    }
}

/// One more than the minimum, capped by the maximum (0 means no maximum)
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// Concurrent across both families when graphics and present differ, exclusive otherwise
pub fn choose_sharing(graphics_family: u32, present_family: u32) -> (vk::SharingMode, Vec<u32>) {
    if graphics_family == present_family {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    } else {
        (vk::SharingMode::CONCURRENT, vec![graphics_family, present_family])
    }
}

/// Frame-slot counter bounded by max frames in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCursor {
    current_frame: usize,
    max_frames_in_flight: usize,
}

impl FrameCursor {
    /// Start at slot 0
    pub fn new(max_frames_in_flight: usize) -> Self {
        Self {
            current_frame: 0,
            max_frames_in_flight: max_frames_in_flight.max(1),
        }
    }

    /// Slot used by the frame being recorded
    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    /// Number of slots
    pub fn max_frames_in_flight(&self) -> usize {
        self.max_frames_in_flight
    }

    /// Move to the next slot
    pub fn advance(&mut self) {
        self.current_frame = (self.current_frame + 1) % self.max_frames_in_flight;
    }

    /// Change the slot count, keeping the current slot when it still exists
    pub fn resize(&mut self, max_frames_in_flight: usize) {
        self.max_frames_in_flight = max_frames_in_flight.max(1);
        self.current_frame %= self.max_frames_in_flight;
    }
}

/// Result of asking for the next image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Render into this image
    Acquired {
        /// Swapchain image index
        image_index: u32,
        /// The chain still works but no longer matches the surface exactly
        suboptimal: bool,
    },
    /// The chain was out of date and has been rebuilt; skip this frame
    Stale,
}

/// Result of presenting an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// Presented with no follow-up
    Presented,
    /// Presented (or dropped) and the chain has been rebuilt
    Recreated,
}

/// What to do after `vkAcquireNextImageKHR`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireAction {
    /// Proceed with the image
    Render {
        /// Swapchain image index
        image_index: u32,
        /// Whether the driver flagged the chain suboptimal
        suboptimal: bool,
    },
    /// Rebuild with this size and skip the frame
    Recreate {
        /// Width to rebuild with
        width: u32,
        /// Height to rebuild with
        height: u32,
    },
}

/// Map the acquire result; out-of-date asks for a rebuild at the last known size
pub fn acquire_action(result: VkResult<(u32, bool)>, size: (u32, u32)) -> VulkanResult<AcquireAction> {
    match result {
        Ok((image_index, suboptimal)) => Ok(AcquireAction::Render { image_index, suboptimal }),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireAction::Recreate {
            width: size.0,
            height: size.1,
        }),
        Err(e) => {
            log::error!("Failed to acquire swapchain image: {:?}", e);
            Err(VulkanError::from_result(e))
        }
    }
}

/// Map the present result and advance the cursor.
///
/// Out-of-date and suboptimal both ask for a rebuild at `size`; anything else
/// non-successful is fatal and leaves the cursor where it was.
pub fn present_action(
    result: VkResult<bool>,
    cursor: &mut FrameCursor,
    size: (u32, u32),
) -> VulkanResult<Option<(u32, u32)>> {
    let rebuild = match result {
        Ok(false) => None,
        Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Some(size),
        Err(e) => {
            log::error!("Failed to present swapchain image: {:?}", e);
            return Err(VulkanError::from_result(e));
        }
    };
    cursor.advance();
    Ok(rebuild)
}

struct ChainParts {
    swapchain: vk::SwapchainKHR,
    surface_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    depth: Image,
}

/// Swapchain management wrapper with RAII cleanup
pub struct Swapchain {
    device: Device,
    loader: SwapchainLoader,
    swapchain: vk::SwapchainKHR,
    surface_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    depth: Option<Image>,
    cursor: FrameCursor,
}

impl Swapchain {
    /// Build the chain, its views and the depth attachment
    pub fn create(
        instance: &Instance,
        device: &mut VulkanDevice,
        surface: &SurfaceContext,
        width: u32,
        height: u32,
    ) -> VulkanResult<Self> {
        let loader = device.swapchain_loader(instance);
        let parts = Self::build(&loader, device, surface, width, height)?;
        let cursor = FrameCursor::new(parts.images.len());

        Ok(Self {
            device: device.logical.clone(),
            loader,
            swapchain: parts.swapchain,
            surface_format: parts.surface_format,
            present_mode: parts.present_mode,
            extent: parts.extent,
            images: parts.images,
            views: parts.views,
            depth: Some(parts.depth),
            cursor,
        })
    }

    /// Tear the chain down and build it again at the new size
    pub fn recreate(
        &mut self,
        device: &mut VulkanDevice,
        surface: &SurfaceContext,
        width: u32,
        height: u32,
    ) -> VulkanResult<()> {
        device.wait_idle()?;
        self.destroy_parts();

        let parts = Self::build(&self.loader, device, surface, width, height)?;
        self.swapchain = parts.swapchain;
        self.surface_format = parts.surface_format;
        self.present_mode = parts.present_mode;
        self.extent = parts.extent;
        self.images = parts.images;
        self.views = parts.views;
        self.depth = Some(parts.depth);
        self.cursor.resize(self.images.len());

        log::info!(
            "Swapchain recreated: {}x{}, {} images",
            self.extent.width,
            self.extent.height,
            self.images.len()
        );
        Ok(())
    }

    fn build(
        loader: &SwapchainLoader,
        device: &mut VulkanDevice,
        surface: &SurfaceContext,
        width: u32,
        height: u32,
    ) -> VulkanResult<ChainParts> {
        device.refresh_swapchain_support(surface)?;
        let support = &device.swapchain_support;

        let surface_format = choose_surface_format(&support.formats).ok_or_else(|| {
            VulkanError::InitializationFailed("Surface reports no formats".to_string())
        })?;
        let present_mode = choose_present_mode(&support.present_modes);
        let extent = choose_extent(&support.capabilities, width, height);
        let image_count = choose_image_count(&support.capabilities);
        let (sharing_mode, family_indices) = choose_sharing(device.graphics_family(), device.present_family());

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&family_indices)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(vk::SwapchainKHR::null());

        let swapchain = unsafe {
            loader.create_swapchain(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        let images = match unsafe { loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { loader.destroy_swapchain(swapchain, None) };
                return Err(VulkanError::Api(e));
            }
        };

        let mut views = Vec::with_capacity(images.len());
        for &image in &images {
            match create_image_view(&device.logical, image, surface_format.format, vk::ImageAspectFlags::COLOR) {
                Ok(view) => views.push(view),
                Err(e) => {
                    unsafe {
                        for view in views {
                            device.logical.destroy_image_view(view, None);
                        }
                        loader.destroy_swapchain(swapchain, None);
                    }
                    return Err(e);
                }
            }
        }

        let depth = Image::new(device, &ImageDesc {
            width: extent.width,
            height: extent.height,
            format: device.depth_format,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            memory_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            view_aspect: Some(vk::ImageAspectFlags::DEPTH),
        });
        let depth = match depth {
            Ok(depth) => depth,
            Err(e) => {
                unsafe {
                    for view in views {
                        device.logical.destroy_image_view(view, None);
                    }
                    loader.destroy_swapchain(swapchain, None);
                }
                return Err(e);
            }
        };

        log::debug!(
            "Swapchain built: {:?}/{:?}, {:?}, {}x{}, {} images",
            surface_format.format,
            surface_format.color_space,
            present_mode,
            extent.width,
            extent.height,
            images.len()
        );

        Ok(ChainParts {
            swapchain,
            surface_format,
            present_mode,
            extent,
            images,
            views,
            depth,
        })
    }

    /// Ask for the next image; a stale chain is rebuilt at `size` and reported as [`AcquireOutcome::Stale`]
    pub fn acquire_next_image(
        &mut self,
        device: &mut VulkanDevice,
        surface: &SurfaceContext,
        timeout_ns: u64,
        signal_semaphore: vk::Semaphore,
        fence: Option<vk::Fence>,
        size: (u32, u32),
    ) -> VulkanResult<AcquireOutcome> {
        let result = unsafe {
            self.loader.acquire_next_image(self.swapchain, timeout_ns, signal_semaphore, fence.unwrap_or_default())
        };

        match acquire_action(result, size)? {
            AcquireAction::Render { image_index, suboptimal } => Ok(AcquireOutcome::Acquired { image_index, suboptimal }),
            AcquireAction::Recreate { width, height } => {
                log::debug!("Swapchain out of date on acquire, recreating at {}x{}", width, height);
                self.recreate(device, surface, width, height)?;
                Ok(AcquireOutcome::Stale)
            }
        }
    }

    /// Queue `image_index` for presentation and advance the frame cursor
    pub fn present(
        &mut self,
        device: &mut VulkanDevice,
        surface: &SurfaceContext,
        _graphics_queue: vk::Queue,
        present_queue: vk::Queue,
        wait_semaphore: vk::Semaphore,
        image_index: u32,
        size: (u32, u32),
    ) -> VulkanResult<PresentOutcome> {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.loader.queue_present(present_queue, &present_info) };

        match present_action(result, &mut self.cursor, size)? {
            None => Ok(PresentOutcome::Presented),
            Some((width, height)) => {
                log::debug!("Swapchain stale on present, recreating at {}x{}", width, height);
                self.recreate(device, surface, width, height)?;
                Ok(PresentOutcome::Recreated)
            }
        }
    }

    fn destroy_parts(&mut self) {
        self.depth = None;
        unsafe {
            for view in self.views.drain(..) {
                self.device.destroy_image_view(view, None);
            }
            self.images.clear();
            if self.swapchain != vk::SwapchainKHR::null() {
                self.loader.destroy_swapchain(self.swapchain, None);
                self.swapchain = vk::SwapchainKHR::null();
            }
        }
    }

    /// Realized extent
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Chosen surface format
    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.surface_format
    }

    /// Chosen present mode
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    /// One view per presentable image
    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.views
    }

    /// Shared depth attachment view
    pub fn depth_view(&self) -> vk::ImageView {
        self.depth.as_ref().map_or(vk::ImageView::null(), Image::view)
    }

    /// Number of presentable images
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Frame-slot cursor
    pub fn cursor(&self) -> &FrameCursor {
        &self.cursor
    }

    /// Swapchain handle
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::error!("Failed to wait for device idle before destroying swapchain: {:?}", e);
            }
        }
        self.destroy_parts();
        log::debug!("Swapchain destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(min: (u32, u32), max: (u32, u32), current: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            current_extent: vk::Extent2D { width: current.0, height: current.1 },
            min_image_extent: vk::Extent2D { width: min.0, height: min.1 },
            max_image_extent: vk::Extent2D { width: max.0, height: max.1 },
            ..Default::default()
        }
    }

    #[test]
    fn test_extent_clamped_when_undefined() {
        let caps = capabilities((100, 100), (1920, 1080), (u32::MAX, u32::MAX));
        assert_eq!(choose_extent(&caps, 4000, 20), vk::Extent2D { width: 1920, height: 100 });
        assert_eq!(choose_extent(&caps, 800, 600), vk::Extent2D { width: 800, height: 600 });
        assert_eq!(choose_extent(&caps, 0, 0), vk::Extent2D { width: 100, height: 100 });
    }

    #[test]
    fn test_extent_uses_current_when_defined() {
        let caps = capabilities((1, 1), (4096, 4096), (1280, 720));
        assert_eq!(choose_extent(&caps, 800, 600), vk::Extent2D { width: 1280, height: 720 });
    }

    #[test]
    fn test_extent_never_exceeds_limits() {
        let caps = capabilities((64, 48), (640, 480), (u32::MAX, u32::MAX));
        for (w, h) in [(0, 0), (1, 10_000), (10_000, 1), (u32::MAX - 1, 7), (320, 240)] {
            let extent = choose_extent(&caps, w, h);
            assert!((64..=640).contains(&extent.width));
            assert!((48..=480).contains(&extent.height));
        }
    }

    #[test]
    fn test_surface_format_preference_and_fallback() {
        let preferred = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let other = vk::SurfaceFormatKHR {
            format: vk::Format::R16G16B16A16_SFLOAT,
            color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        };
        assert_eq!(choose_surface_format(&[other, preferred]), Some(preferred));
        assert_eq!(choose_surface_format(&[other]), Some(other));
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn test_present_mode_fallback() {
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX]),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(choose_present_mode(&[vk::PresentModeKHR::IMMEDIATE]), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn test_image_count() {
        let mut caps = capabilities((1, 1), (1, 1), (1, 1));
        assert_eq!(choose_image_count(&caps), 3);
        caps.max_image_count = 2;
        assert_eq!(choose_image_count(&caps), 2);
        caps.max_image_count = 8;
        assert_eq!(choose_image_count(&caps), 3);
    }

    #[test]
    fn test_sharing_mode() {
        assert_eq!(choose_sharing(0, 0), (vk::SharingMode::EXCLUSIVE, vec![]));
        assert_eq!(choose_sharing(0, 2), (vk::SharingMode::CONCURRENT, vec![0, 2]));
    }

    #[test]
    fn test_out_of_date_acquire_requests_rebuild() {
        let action = acquire_action(Err(vk::Result::ERROR_OUT_OF_DATE_KHR), (800, 600)).unwrap();
        assert_eq!(action, AcquireAction::Recreate { width: 800, height: 600 });
    }

    #[test]
    fn test_acquire_success_and_failure() {
        assert_eq!(
            acquire_action(Ok((2, true)), (1, 1)).unwrap(),
            AcquireAction::Render { image_index: 2, suboptimal: true }
        );
        assert!(matches!(
            acquire_action(Err(vk::Result::ERROR_DEVICE_LOST), (1, 1)),
            Err(VulkanError::DeviceLost)
        ));
    }

    #[test]
    fn test_suboptimal_present_rebuilds_and_advances() {
        let mut cursor = FrameCursor::new(3);
        let rebuild = present_action(Ok(true), &mut cursor, (1024, 768)).unwrap();
        assert_eq!(rebuild, Some((1024, 768)));
        assert_eq!(cursor.current_frame(), 1);
    }

    #[test]
    fn test_present_paths() {
        let mut cursor = FrameCursor::new(2);
        assert_eq!(present_action(Ok(false), &mut cursor, (1, 1)).unwrap(), None);
        assert_eq!(cursor.current_frame(), 1);
        assert_eq!(
            present_action(Err(vk::Result::ERROR_OUT_OF_DATE_KHR), &mut cursor, (1, 1)).unwrap(),
            Some((1, 1))
        );
        assert_eq!(cursor.current_frame(), 0);
        assert!(present_action(Err(vk::Result::ERROR_SURFACE_LOST_KHR), &mut cursor, (1, 1)).is_err());
        assert_eq!(cursor.current_frame(), 0);
    }

    #[test]
    fn test_cursor_wraps() {
        let mut cursor = FrameCursor::new(3);
        for expected in [1, 2, 0, 1] {
            cursor.advance();
            assert_eq!(cursor.current_frame(), expected);
        }
        assert_eq!(FrameCursor::new(0).max_frames_in_flight(), 1);
    }

    #[test]
    fn test_cursor_resize_keeps_valid_slot() {
        let mut cursor = FrameCursor::new(4);
        cursor.advance();
        cursor.advance();
        cursor.resize(3);
        assert_eq!(cursor.current_frame(), 2);
        cursor.resize(2);
        assert_eq!(cursor.current_frame(), 0);
        assert_eq!(cursor.max_frames_in_flight(), 2);
    }
}
