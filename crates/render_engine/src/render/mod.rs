//! # Rendering System
//!
//! A backend-agnostic frontend over a swappable rendering backend.
//!
//! ## Architecture
//!
//! - **Frontend**: [`RendererFrontend`] drives one frame per game-loop tick
//!   from a [`RenderPacket`]
//! - **Backend**: [`RenderBackend`] implementations own every API object;
//!   [`VulkanBackend`](vulkan::VulkanBackend) is the one shipped
//! - **Resources**: [`Texture`] and [`Material`] describe data on the CPU side
//!   and hold handles to their backend state
//! - **Platform**: the backend only needs a [`PlatformSurface`]; [`Window`]
//!   provides one with GLFW

pub mod backend;
pub mod config;
pub mod frontend;
pub mod material;
pub mod texture;
pub mod types;
pub mod vulkan;
pub mod window;

pub use backend::{create_backend, BackendType, RenderBackend};
pub use config::RendererConfig;
pub use frontend::RendererFrontend;
pub use material::Material;
pub use texture::Texture;
pub use types::{
    GeometryHandle, GeometryRenderData, GlobalUniformObject, ObjectId, ObjectUniformObject, RenderPacket,
    RenderViewMode, TextureHandle, Vertex3d, INVALID_ID,
};
pub use window::{PlatformSurface, Window, WindowError, WindowResult};

use thiserror::Error;

use vulkan::VulkanError;

/// Rendering system errors
///
/// Covers failures at every level of the rendering stack, from backend
/// bring-up to per-frame submission.
#[derive(Error, Debug)]
pub enum RenderError {
    /// Renderer initialization failed during setup
    ///
    /// Occurs when no device satisfies the requirements, a swapchain cannot be
    /// built, or shaders and pipelines fail to load. Startup should abort.
    #[error("Renderer initialization failed: {0}")]
    InitializationFailed(String),

    /// A rendering operation failed during execution
    ///
    /// Returned by the frontend when a frame cannot be completed; the
    /// application is expected to shut down.
    #[error("Rendering failed: {0}")]
    RenderingFailed(String),

    /// Resource creation or management failed
    #[error("Resource creation failed: {0}")]
    ResourceCreationFailed(String),

    /// Backend-specific error occurred
    #[error("Backend error: {0}")]
    BackendError(String),

    /// The requested backend has no implementation
    #[error("Unsupported backend: {0}")]
    UnsupportedBackend(BackendType),

    /// The platform window failed
    #[error("Window error: {0}")]
    Window(#[from] WindowError),
}

/// Result type for rendering operations
pub type RenderResult<T> = Result<T, RenderError>;

impl RenderError {
    /// Whether the frame pipeline cannot continue
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::ResourceCreationFailed(_))
    }
}

impl From<VulkanError> for RenderError {
    fn from(error: VulkanError) -> Self {
        if error.is_fatal() {
            Self::BackendError(error.to_string())
        } else {
            // capacity and stale-id errors abort one operation, not the frame loop
            Self::ResourceCreationFailed(error.to_string())
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vulkan_error_severity_is_preserved() {
        let capacity: RenderError = VulkanError::CapacityExceeded { max: 4 }.into();
        assert!(matches!(capacity, RenderError::ResourceCreationFailed(_)));
        assert!(!capacity.is_fatal());

        let lost: RenderError = VulkanError::DeviceLost.into();
        assert!(matches!(lost, RenderError::BackendError(_)));
        assert!(lost.is_fatal());
    }
}

