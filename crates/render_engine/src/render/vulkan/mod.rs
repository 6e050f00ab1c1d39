//! Vulkan rendering backend
//!
//! Low-level wrappers own exactly one Vulkan object each and destroy it on
//! drop. [`VulkanBackend`] composes them into the frame loop.

pub mod backend;
pub mod buffer;
pub mod commands;
pub mod context;
pub mod device;
pub mod framebuffer;
pub mod geometry;
pub mod image;
pub mod object_shader;
pub mod object_state;
pub mod pipeline;
pub mod render_pass;
pub mod swapchain;
pub mod sync;
pub mod texture;

pub use backend::VulkanBackend;
pub use buffer::Buffer;
pub use commands::{BeginFlags, CommandBuffer, CommandBufferState};
pub use context::{SurfaceContext, VulkanError, VulkanInstance, VulkanResult};
pub use device::{DeviceRequirements, QueueFamilyIndices, VulkanDevice};
pub use framebuffer::Framebuffer;
pub use image::Image;
pub use object_shader::ObjectShader;
pub use pipeline::{Pipeline, ShaderStage, ShaderStageKind};
pub use render_pass::{ClearValues, RenderPass};
pub use swapchain::{AcquireOutcome, PresentOutcome, Swapchain};
pub use sync::{Fence, Semaphore};
pub use texture::VulkanTexture;
