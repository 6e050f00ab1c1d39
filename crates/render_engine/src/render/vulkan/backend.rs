//! Vulkan implementation of [`RenderBackend`]
//!
//! Owns every Vulkan object for one window. Initialization order is
//! instance, surface, device, swapchain, render pass, framebuffers, command
//! buffers, sync objects, object shader, default texture, geometry buffers;
//! teardown runs in reverse, which the field order below encodes.

use ash::vk;
use slotmap::{DefaultKey, Key, KeyData, SlotMap};

use super::commands::{BeginFlags, CommandBuffer};
use super::context::{SurfaceContext, VulkanError, VulkanInstance, VulkanResult};
use super::device::VulkanDevice;
use super::framebuffer::Framebuffer;
use super::geometry::GeometryBuffers;
use super::object_shader::{BoundTexture, ObjectShader, ObjectUpdate};
use super::object_state::BindingStamp;
use super::pipeline::{flipped_viewport, full_scissor};
use super::render_pass::{ClearValues, RenderPass};
use super::swapchain::{AcquireOutcome, FrameCursor, PresentOutcome, Swapchain};
use super::sync::{Fence, FenceWaitOutcome, Semaphore};
use super::texture::VulkanTexture;
use crate::render::backend::{BackendType, RenderBackend};
use crate::render::config::RendererConfig;
use crate::render::material::Material;
use crate::render::texture::{Texture, DEFAULT_TEXTURE_ID};
use crate::render::types::{GeometryHandle, GeometryRenderData, GlobalUniformObject, TextureHandle, Vertex3d, INVALID_ID};
use crate::render::window::PlatformSurface;
use crate::render::{RenderError, RenderResult};

/// Tracks reported framebuffer sizes against what the swapchain was built for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferSizeTracker {
    width: u32,
    height: u32,
    generation: u64,
    applied_generation: u64,
}

impl FramebufferSizeTracker {
    /// Start in sync at `width` x `height`
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            generation: 0,
            applied_generation: 0,
        }
    }

    /// Record a resize notification
    pub fn report(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.generation += 1;
    }

    /// A size was reported that the swapchain has not been rebuilt for
    pub fn is_pending(&self) -> bool {
        self.generation != self.applied_generation
    }

    /// Zero-area framebuffer (minimized window)
    pub fn is_minimized(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Mark the latest size as applied
    pub fn mark_applied(&mut self) {
        self.applied_generation = self.generation;
    }

    /// Last reported size
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Where each swapchain image's last submission can be waited on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagesInFlight {
    fences: Vec<Option<usize>>,
}

impl ImagesInFlight {
    /// No image in flight
    pub fn new(image_count: usize) -> Self {
        Self {
            fences: vec![None; image_count],
        }
    }

    /// Frame slot whose fence guards `image_index`, if any
    pub fn guard(&self, image_index: usize) -> Option<usize> {
        self.fences.get(image_index).copied().flatten()
    }

    /// `image_index` is now rendered by `frame`
    pub fn assign(&mut self, image_index: usize, frame: usize) {
        if let Some(slot) = self.fences.get_mut(image_index) {
            *slot = Some(frame);
        }
    }

    /// Forget every association and resize
    pub fn reset(&mut self, image_count: usize) {
        self.fences.clear();
        self.fences.resize(image_count, None);
    }

    /// Tracked image count
    pub fn len(&self) -> usize {
        self.fences.len()
    }

    /// No images tracked
    pub fn is_empty(&self) -> bool {
        self.fences.is_empty()
    }
}

/// How `begin_frame` proceeds once the swapchain has answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStart {
    /// Record into `image_index` from frame slot `frame`
    Record {
        /// Frame slot doing the recording
        frame: usize,
        /// Acquired swapchain image
        image_index: u32,
        /// Another slot whose submission still uses this image and must retire first
        wait_for: Option<usize>,
    },
    /// The chain was rebuilt; regenerate its dependents and skip the frame
    RebuildAndSkip,
}

/// Decide what to do with an acquire outcome. The cursor only moves on present,
/// so a skipped frame leaves the slot where it was.
pub fn frame_start(outcome: AcquireOutcome, cursor: &FrameCursor, images_in_flight: &ImagesInFlight) -> FrameStart {
    match outcome {
        AcquireOutcome::Stale => FrameStart::RebuildAndSkip,
        AcquireOutcome::Acquired { image_index, .. } => {
            let frame = cursor.current_frame();
            FrameStart::Record {
                frame,
                image_index,
                wait_for: images_in_flight.guard(image_index as usize).filter(|&guard| guard != frame),
            }
        }
    }
}

fn texture_handle(key: DefaultKey) -> TextureHandle {
    TextureHandle(key.data().as_ffi())
}

fn texture_key(handle: TextureHandle) -> DefaultKey {
    DefaultKey::from(KeyData::from_ffi(handle.0))
}

struct PerFrameSync {
    image_available: Semaphore,
    queue_complete: Semaphore,
    in_flight: Fence,
}

impl PerFrameSync {
    fn new(device: &ash::Device) -> VulkanResult<Self> {
        Ok(Self {
            image_available: Semaphore::new(device)?,
            queue_complete: Semaphore::new(device)?,
            in_flight: Fence::new(device, true)?,
        })
    }
}

/// Vulkan rendering backend
pub struct VulkanBackend {
    // dropped first to last
    geometry: GeometryBuffers,
    default_texture: VulkanTexture,
    textures: SlotMap<DefaultKey, VulkanTexture>,
    object_shader: ObjectShader,
    frame_sync: Vec<PerFrameSync>,
    command_buffers: Vec<CommandBuffer>,
    framebuffers: Vec<Framebuffer>,
    render_pass: RenderPass,
    swapchain: Swapchain,
    device: VulkanDevice,
    surface: SurfaceContext,
    _instance: VulkanInstance,

    images_in_flight: ImagesInFlight,
    size: FramebufferSizeTracker,
    image_index: u32,
    frame_number: u64,
}

impl VulkanBackend {
    /// Bring up every Vulkan object for `platform`'s window
    pub fn new(config: &RendererConfig, platform: &dyn PlatformSurface) -> VulkanResult<Self> {
        log::info!("Initializing Vulkan backend for '{}'", config.application_name);

        let instance = VulkanInstance::new(platform, &config.application_name, config.enable_validation)?;
        let surface = SurfaceContext::new(&instance, platform)?;
        let mut device = VulkanDevice::new(&instance.instance, &surface, &config.device)?;

        let (width, height) = match platform.framebuffer_size() {
            (0, _) | (_, 0) => config.initial_extent(),
            size => size,
        };
        let swapchain = Swapchain::create(&instance.instance, &mut device, &surface, width, height)?;
        let extent = swapchain.extent();

        let render_pass = RenderPass::new(
            &device.logical,
            swapchain.format().format,
            device.depth_format,
            full_scissor(extent.width, extent.height),
            ClearValues {
                color: config.clear_color,
                depth: config.clear_depth,
                stencil: config.clear_stencil,
            },
        )?;
        let framebuffers = Framebuffer::for_swapchain(&device.logical, &render_pass, &swapchain)?;

        let image_count = swapchain.image_count();
        let command_buffers = allocate_command_buffers(&device, image_count)?;
        let frame_sync = (0..image_count)
            .map(|_| PerFrameSync::new(&device.logical))
            .collect::<VulkanResult<Vec<_>>>()?;

        let object_shader = ObjectShader::new(
            &device,
            &render_pass,
            &config.shader_directory,
            config.max_object_count,
            image_count,
            (extent.width, extent.height),
        )?;

        let checkerboard = Texture::default_checkerboard();
        let default_texture = VulkanTexture::create(
            &device,
            &checkerboard.name,
            checkerboard.width,
            checkerboard.height,
            checkerboard.channel_count,
            &checkerboard.data,
        )?;

        let geometry = GeometryBuffers::new(&device)?;

        log::info!(
            "Vulkan backend ready: {}x{}, {} swapchain images",
            extent.width,
            extent.height,
            image_count
        );

        Ok(Self {
            geometry,
            default_texture,
            textures: SlotMap::new(),
            object_shader,
            frame_sync,
            command_buffers,
            framebuffers,
            render_pass,
            swapchain,
            device,
            surface,
            _instance: instance,
            images_in_flight: ImagesInFlight::new(image_count),
            size: FramebufferSizeTracker::new(width, height),
            image_index: 0,
            frame_number: 0,
        })
    }

    fn current_frame(&self) -> usize {
        self.swapchain.cursor().current_frame()
    }

    fn current_command_buffer(&self) -> VulkanResult<&CommandBuffer> {
        self.command_buffers.get(self.image_index as usize).ok_or_else(|| VulkanError::InvalidOperation {
            reason: format!("No command buffer for image {}", self.image_index),
        })
    }

    fn recreate_swapchain(&mut self) -> VulkanResult<()> {
        let (width, height) = self.size.size();
        log::debug!("Recreating swapchain at {}x{}", width, height);
        self.swapchain.recreate(&mut self.device, &self.surface, width, height)?;
        self.rebuild_swapchain_dependents()
    }

    /// Regenerate everything sized by the swapchain after it was rebuilt
    fn rebuild_swapchain_dependents(&mut self) -> VulkanResult<()> {
        let extent = self.swapchain.extent();
        let image_count = self.swapchain.image_count();

        self.render_pass.set_render_area(full_scissor(extent.width, extent.height));

        self.framebuffers.clear();
        self.framebuffers = Framebuffer::for_swapchain(&self.device.logical, &self.render_pass, &self.swapchain)?;

        let pool = self.device.graphics_command_pool;
        for command_buffer in &mut self.command_buffers {
            command_buffer.free(pool);
        }
        self.command_buffers = allocate_command_buffers(&self.device, image_count)?;

        self.frame_sync.truncate(image_count);
        while self.frame_sync.len() < image_count {
            self.frame_sync.push(PerFrameSync::new(&self.device.logical)?);
        }
        self.images_in_flight.reset(image_count);
        self.object_shader.set_frame_count(image_count)?;

        self.size.mark_applied();
        log::debug!("Swapchain dependents rebuilt: {}x{}, {} images", extent.width, extent.height, image_count);
        Ok(())
    }

    fn resolve_texture(&self, texture: Option<&Texture>) -> BoundTexture {
        let uploaded = texture
            .filter(|t| t.is_uploaded())
            .and_then(|t| t.handle.map(|handle| (t, handle)))
            .and_then(|(t, handle)| self.textures.get(texture_key(handle)).map(|gpu| (t, handle, gpu)));

        match uploaded {
            Some((t, handle, gpu)) => BoundTexture {
                stamp: BindingStamp::new(t.id, t.generation).with_resource(handle.0),
                info: gpu.descriptor_info(),
            },
            None => BoundTexture {
                stamp: BindingStamp::new(DEFAULT_TEXTURE_ID, 0),
                info: self.default_texture.descriptor_info(),
            },
        }
    }

    fn begin_frame_inner(&mut self) -> VulkanResult<bool> {
        if self.size.is_minimized() {
            return Ok(false);
        }

        if self.size.is_pending() {
            self.recreate_swapchain()?;
            return Ok(false);
        }

        let frame = self.current_frame();
        match self.frame_sync[frame].in_flight.wait_outcome(u64::MAX) {
            FenceWaitOutcome::Signaled => {}
            FenceWaitOutcome::DeviceLost => return Err(VulkanError::DeviceLost),
            FenceWaitOutcome::Timeout => return Ok(false),
            other => {
                return Err(VulkanError::InvalidOperation {
                    reason: format!("In-flight fence wait failed: {other:?}"),
                });
            }
        }

        let semaphore = self.frame_sync[frame].image_available.handle();
        let outcome = self.swapchain.acquire_next_image(
            &mut self.device,
            &self.surface,
            u64::MAX,
            semaphore,
            None,
            self.size.size(),
        )?;
        let image_index = match frame_start(outcome, self.swapchain.cursor(), &self.images_in_flight) {
            FrameStart::RebuildAndSkip => {
                self.rebuild_swapchain_dependents()?;
                return Ok(false);
            }
            FrameStart::Record { frame, image_index, wait_for } => {
                // the image's command buffer may still be pending from another slot
                if let Some(guard) = wait_for {
                    if let Some(sync) = self.frame_sync.get_mut(guard) {
                        if !sync.in_flight.wait(u64::MAX) {
                            return Err(VulkanError::InvalidOperation {
                                reason: format!("Wait on in-flight fence {guard} failed"),
                            });
                        }
                    }
                }
                self.images_in_flight.assign(image_index as usize, frame);
                image_index
            }
        };
        self.image_index = image_index;

        let extent = self.swapchain.extent();
        let framebuffer = self.framebuffers.get(image_index as usize).map(Framebuffer::handle).ok_or_else(|| {
            VulkanError::InvalidOperation {
                reason: format!("No framebuffer for image {image_index}"),
            }
        })?;
        let command_buffer = self.command_buffers.get_mut(image_index as usize).ok_or_else(|| {
            VulkanError::InvalidOperation {
                reason: format!("No command buffer for image {image_index}"),
            }
        })?;

        command_buffer.reset()?;
        command_buffer.begin(BeginFlags::default())?;
        command_buffer.set_viewport(flipped_viewport(extent.width, extent.height));
        command_buffer.set_scissor(full_scissor(extent.width, extent.height));
        self.render_pass.begin(command_buffer, framebuffer)?;
        self.object_shader.use_shader(command_buffer);

        Ok(true)
    }

    fn end_frame_inner(&mut self) -> VulkanResult<()> {
        let frame = self.current_frame();
        let image_index = self.image_index as usize;

        let command_buffer = self.command_buffers.get_mut(image_index).ok_or_else(|| VulkanError::InvalidOperation {
            reason: format!("No command buffer for image {image_index}"),
        })?;
        self.render_pass.end(command_buffer)?;
        command_buffer.end()?;

        let sync = &mut self.frame_sync[frame];
        sync.in_flight.reset()?;

        let wait_semaphores = [sync.image_available.handle()];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [sync.queue_complete.handle()];
        let command_buffers = [command_buffer.handle()];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device.logical
                .queue_submit(self.device.graphics_queue, &[submit_info.build()], sync.in_flight.handle())
                .map_err(|e| {
                    log::error!("Queue submit failed: {:?}", e);
                    VulkanError::from_result(e)
                })?;
        }
        command_buffer.mark_submitted()?;

        let queue_complete = sync.queue_complete.handle();
        let graphics_queue = self.device.graphics_queue;
        let present_queue = self.device.present_queue;
        let outcome = self.swapchain.present(
            &mut self.device,
            &self.surface,
            graphics_queue,
            present_queue,
            queue_complete,
            self.image_index,
            self.size.size(),
        )?;
        if outcome == PresentOutcome::Recreated {
            self.rebuild_swapchain_dependents()?;
        }

        self.frame_number += 1;
        Ok(())
    }
}

impl RenderBackend for VulkanBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Vulkan
    }

    fn resized(&mut self, width: u32, height: u32) {
        log::debug!("Framebuffer resized to {}x{}", width, height);
        self.size.report(width, height);
    }

    fn begin_frame(&mut self, _delta_time: f32) -> RenderResult<bool> {
        self.begin_frame_inner().map_err(|e| {
            log::error!("begin_frame failed: {}", e);
            RenderError::from(e)
        })
    }

    fn update_global_state(&mut self, global: &GlobalUniformObject) -> RenderResult<()> {
        let frame = self.current_frame();
        let command_buffer = self.current_command_buffer()?;
        self.object_shader.update_global_state(command_buffer, frame, global)?;
        Ok(())
    }

    fn update_object(&mut self, data: &GeometryRenderData<'_>) -> RenderResult<()> {
        let id = data.material.object_id.ok_or(VulkanError::InvalidObjectId { id: INVALID_ID })?;
        let texture = self.resolve_texture(data.texture);
        let frame = self.current_frame();

        let command_buffer = self.command_buffers.get(self.image_index as usize).ok_or_else(|| {
            VulkanError::InvalidOperation {
                reason: format!("No command buffer for image {}", self.image_index),
            }
        })?;
        let update = ObjectUpdate {
            id,
            model: &data.model,
            diffuse_colour: data.material.diffuse_colour(),
            material_generation: data.material.generation(),
            texture,
        };
        let writes = self.object_shader.update_object(command_buffer, frame, &update)?;
        if writes > 0 {
            log::trace!("Object {} frame {}: {} descriptor writes", id.0, frame, writes);
        }
        Ok(())
    }

    fn draw_geometry(&mut self, geometry: &GeometryHandle) -> RenderResult<()> {
        let command_buffer = self.current_command_buffer()?;
        self.geometry.draw(&self.device.logical, command_buffer, geometry)?;
        Ok(())
    }

    fn end_frame(&mut self, _delta_time: f32) -> RenderResult<()> {
        self.end_frame_inner().map_err(|e| {
            log::error!("end_frame failed: {}", e);
            RenderError::from(e)
        })
    }

    fn create_texture(&mut self, texture: &mut Texture) -> RenderResult<()> {
        let gpu = VulkanTexture::create(
            &self.device,
            &texture.name,
            texture.width,
            texture.height,
            texture.channel_count,
            &texture.data,
        )
        .map_err(|e| {
            log::error!("Failed to create texture '{}': {}", texture.name, e);
            RenderError::ResourceCreationFailed(e.to_string())
        })?;

        if let Some(old) = texture.handle.take() {
            self.device.wait_idle()?;
            self.textures.remove(texture_key(old));
        }
        let key = self.textures.insert(gpu);
        texture.mark_uploaded(texture_handle(key));
        Ok(())
    }

    fn destroy_texture(&mut self, texture: &mut Texture) {
        if let Some(handle) = texture.mark_released() {
            if let Err(e) = self.device.wait_idle() {
                log::error!("wait_idle before destroying texture '{}' failed: {}", texture.name, e);
            }
            if self.textures.remove(texture_key(handle)).is_none() {
                log::warn!("Texture '{}' had a stale handle", texture.name);
            }
        }
    }

    fn create_material(&mut self, material: &mut Material) -> RenderResult<()> {
        if material.object_id.is_some() {
            return Err(RenderError::ResourceCreationFailed(format!(
                "Material '{}' already has backend state",
                material.name
            )));
        }
        let id = self.object_shader.acquire_resources()?;
        material.object_id = Some(id);
        log::debug!("Material '{}' uses object {}", material.name, id.0);
        Ok(())
    }

    fn destroy_material(&mut self, material: &mut Material) {
        if let Some(id) = material.object_id.take() {
            if let Err(e) = self.device.wait_idle() {
                log::error!("wait_idle before destroying material '{}' failed: {}", material.name, e);
            }
            if let Err(e) = self.object_shader.release_resources(id) {
                log::error!("Failed to release material '{}': {}", material.name, e);
            }
        }
    }

    fn create_geometry(&mut self, vertices: &[Vertex3d], indices: &[u32]) -> RenderResult<GeometryHandle> {
        self.geometry.upload(&self.device, vertices, indices).map_err(|e| {
            log::error!("Failed to upload geometry: {}", e);
            RenderError::ResourceCreationFailed(e.to_string())
        })
    }

    fn frame_number(&self) -> u64 {
        self.frame_number
    }

    fn wait_idle(&self) -> RenderResult<()> {
        self.device.wait_idle()?;
        Ok(())
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        log::info!("Shutting down Vulkan backend after {} frames", self.frame_number);
        if let Err(e) = self.device.wait_idle() {
            log::error!("wait_idle during shutdown failed: {}", e);
        }
        let pool = self.device.graphics_command_pool;
        for command_buffer in &mut self.command_buffers {
            command_buffer.free(pool);
        }
    }
}

fn allocate_command_buffers(device: &VulkanDevice, count: usize) -> VulkanResult<Vec<CommandBuffer>> {
    (0..count)
        .map(|_| CommandBuffer::allocate(&device.logical, device.graphics_command_pool, true))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_is_pending_until_applied() {
        let mut size = FramebufferSizeTracker::new(800, 600);
        assert!(!size.is_pending());

        size.report(1024, 768);
        size.report(1280, 720);
        assert!(size.is_pending());
        assert_eq!(size.size(), (1280, 720));

        size.mark_applied();
        assert!(!size.is_pending());
    }

    #[test]
    fn test_minimized_window() {
        let mut size = FramebufferSizeTracker::new(800, 600);
        size.report(0, 0);
        assert!(size.is_minimized());
        size.report(640, 480);
        assert!(!size.is_minimized());
    }

    #[test]
    fn test_images_in_flight_tracking() {
        let mut images = ImagesInFlight::new(3);
        assert_eq!(images.guard(1), None);

        images.assign(1, 2);
        assert_eq!(images.guard(1), Some(2));
        assert_eq!(images.guard(7), None);

        images.reset(2);
        assert_eq!(images.len(), 2);
        assert_eq!(images.guard(1), None);
    }

    #[test]
    fn test_stale_acquire_skips_without_moving_the_slot() {
        let mut cursor = FrameCursor::new(3);
        cursor.advance();
        let images = ImagesInFlight::new(3);

        assert_eq!(frame_start(AcquireOutcome::Stale, &cursor, &images), FrameStart::RebuildAndSkip);
        assert_eq!(cursor.current_frame(), 1);

        // the retried frame records from the same slot
        let retry = AcquireOutcome::Acquired {
            image_index: 0,
            suboptimal: false,
        };
        assert_eq!(
            frame_start(retry, &cursor, &images),
            FrameStart::Record {
                frame: 1,
                image_index: 0,
                wait_for: None,
            }
        );
    }

    #[test]
    fn test_out_of_order_image_waits_for_its_previous_slot() {
        let mut cursor = FrameCursor::new(3);
        let mut images = ImagesInFlight::new(3);
        images.assign(2, 0);
        cursor.advance();

        let acquired = AcquireOutcome::Acquired {
            image_index: 2,
            suboptimal: false,
        };
        assert_eq!(
            frame_start(acquired, &cursor, &images),
            FrameStart::Record {
                frame: 1,
                image_index: 2,
                wait_for: Some(0),
            }
        );

        // an image last used by this very slot was already covered by its own fence
        images.assign(2, 1);
        assert_eq!(
            frame_start(acquired, &cursor, &images),
            FrameStart::Record {
                frame: 1,
                image_index: 2,
                wait_for: None,
            }
        );
    }

    #[test]
    fn test_texture_handles_survive_the_round_trip() {
        let mut textures: SlotMap<DefaultKey, u32> = SlotMap::new();
        let key = textures.insert(5);
        let handle = texture_handle(key);
        assert_eq!(texture_key(handle), key);
        assert_eq!(textures.get(texture_key(handle)), Some(&5));
    }
}
