//! Framebuffer management
//!
//! One framebuffer per swapchain image, each binding that image's view and
//! the single shared depth view. Regenerated whenever the swapchain is.

use ash::{vk, Device};

use super::context::{VulkanError, VulkanResult};
use super::render_pass::RenderPass;
use super::swapchain::Swapchain;

/// Framebuffer wrapper with RAII cleanup
pub struct Framebuffer {
    device: Device,
    framebuffer: vk::Framebuffer,
    attachments: Vec<vk::ImageView>,
}

impl Framebuffer {
    /// Create a framebuffer over `attachments`
    pub fn new(
        device: &Device,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> VulkanResult<Self> {
        let create_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        let framebuffer = unsafe {
            device.create_framebuffer(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self {
            device: device.clone(),
            framebuffer,
            attachments: attachments.to_vec(),
        })
    }

    /// Build one framebuffer per swapchain image
    pub fn for_swapchain(device: &Device, render_pass: &RenderPass, swapchain: &Swapchain) -> VulkanResult<Vec<Self>> {
        let depth_view = swapchain.depth_view();
        let framebuffers = swapchain
            .image_views()
            .iter()
            .map(|&view| Self::new(device, render_pass.handle(), &[view, depth_view], swapchain.extent()))
            .collect::<VulkanResult<Vec<_>>>()?;

        log::debug!("Generated {} framebuffers", framebuffers.len());
        Ok(framebuffers)
    }

    /// Get the framebuffer handle
    pub fn handle(&self) -> vk::Framebuffer {
        self.framebuffer
    }

    /// Attached views in attachment order
    pub fn attachments(&self) -> &[vk::ImageView] {
        &self.attachments
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_framebuffer(self.framebuffer, None);
        }
    }
}
