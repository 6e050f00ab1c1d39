//! Backend abstraction for the rendering system
//!
//! The frontend talks to exactly one [`RenderBackend`], chosen once at
//! startup by [`create_backend`]. Each graphics API gets one implementation.

use serde::{Deserialize, Serialize};

use super::config::RendererConfig;
use super::material::Material;
use super::texture::Texture;
use super::types::{GeometryHandle, GeometryRenderData, GlobalUniformObject, Vertex3d};
use super::vulkan::VulkanBackend;
use super::window::PlatformSurface;
use super::{RenderError, RenderResult};

/// Graphics APIs a backend can be requested for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendType {
    /// Vulkan 1.2
    #[default]
    Vulkan,
    /// OpenGL (not implemented)
    OpenGl,
    /// DirectX (not implemented)
    DirectX,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Vulkan => "Vulkan",
            Self::OpenGl => "OpenGL",
            Self::DirectX => "DirectX",
        };
        f.write_str(name)
    }
}

/// Main rendering backend trait
///
/// A frame is `begin_frame`, one `update_global_state`, then
/// `update_object` + `draw_geometry` per draw, then `end_frame`.
pub trait RenderBackend {
    /// Which API this backend drives
    fn backend_type(&self) -> BackendType;

    /// Record a new framebuffer size; the swapchain is rebuilt on the next frame
    fn resized(&mut self, width: u32, height: u32);

    /// Start a frame. `Ok(false)` means skip this frame and try again next tick
    fn begin_frame(&mut self, delta_time: f32) -> RenderResult<bool>;

    /// Upload and bind the per-frame camera state
    fn update_global_state(&mut self, global: &GlobalUniformObject) -> RenderResult<()>;

    /// Push per-draw constants and bind the object's descriptor state
    fn update_object(&mut self, data: &GeometryRenderData<'_>) -> RenderResult<()>;

    /// Record the draw for a mesh range
    fn draw_geometry(&mut self, geometry: &GeometryHandle) -> RenderResult<()>;

    /// Finish recording, submit and present
    fn end_frame(&mut self, delta_time: f32) -> RenderResult<()>;

    /// Upload `texture.data`, replacing any previous GPU copy
    fn create_texture(&mut self, texture: &mut Texture) -> RenderResult<()>;

    /// Release the GPU copy of `texture`
    fn destroy_texture(&mut self, texture: &mut Texture);

    /// Acquire per-object state for `material`
    fn create_material(&mut self, material: &mut Material) -> RenderResult<()>;

    /// Release the per-object state of `material`
    fn destroy_material(&mut self, material: &mut Material);

    /// Upload a mesh into the shared vertex and index buffers
    fn create_geometry(&mut self, vertices: &[Vertex3d], indices: &[u32]) -> RenderResult<GeometryHandle>;

    /// Frames completed so far
    fn frame_number(&self) -> u64;

    /// Block until the GPU is idle
    fn wait_idle(&self) -> RenderResult<()>;
}

/// Create the backend named by `config.backend`
pub fn create_backend(config: &RendererConfig, platform: &dyn PlatformSurface) -> RenderResult<Box<dyn RenderBackend>> {
    match config.backend {
        BackendType::Vulkan => {
            let backend = VulkanBackend::new(config, platform).map_err(|e| {
                log::error!("Vulkan backend initialization failed: {}", e);
                RenderError::InitializationFailed(e.to_string())
            })?;
            Ok(Box::new(backend))
        }
        other => {
            log::error!("{} backend is not supported", other);
            Err(RenderError::UnsupportedBackend(other))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::window::WindowResult;
    use ash::vk;

    struct NoSurface;

    impl PlatformSurface for NoSurface {
        fn required_instance_extensions(&self) -> WindowResult<Vec<String>> {
            Ok(Vec::new())
        }

        fn create_surface(&self, _instance: vk::Instance) -> WindowResult<vk::SurfaceKHR> {
            Ok(vk::SurfaceKHR::null())
        }

        fn framebuffer_size(&self) -> (u32, u32) {
            (0, 0)
        }
    }

    #[test]
    fn test_unimplemented_backends_are_rejected() {
        for backend in [BackendType::OpenGl, BackendType::DirectX] {
            let config = RendererConfig::default().with_backend(backend);
            let result = create_backend(&config, &NoSurface);
            assert!(matches!(result, Err(RenderError::UnsupportedBackend(b)) if b == backend));
        }
    }

    #[test]
    fn test_backend_names() {
        assert_eq!(BackendType::Vulkan.to_string(), "Vulkan");
        assert_eq!(BackendType::default(), BackendType::Vulkan);
    }
}
