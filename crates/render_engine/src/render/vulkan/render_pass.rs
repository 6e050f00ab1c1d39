//! Render pass management
//!
//! One subpass with a colour attachment that ends ready for presentation and
//! a depth attachment whose contents are discarded after the pass.

use ash::{vk, Device};

use super::commands::CommandBuffer;
use super::context::{VulkanError, VulkanResult};

/// Clear values applied when the pass begins
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearValues {
    /// RGBA clear colour
    pub color: [f32; 4],
    /// Depth clear value
    pub depth: f32,
    /// Stencil clear value
    pub stencil: u32,
}

impl Default for ClearValues {
    fn default() -> Self {
        Self {
            color: [0.0, 0.0, 0.2, 1.0],
            depth: 1.0,
            stencil: 0,
        }
    }
}

impl ClearValues {
    fn to_vk(self) -> [vk::ClearValue; 2] {
        [
            vk::ClearValue {
                color: vk::ClearColorValue { float32: self.color },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: self.depth,
                    stencil: self.stencil,
                },
            },
        ]
    }
}

/// Colour (clear/store, undefined -> present) and depth (clear/don't-care) attachments
pub fn attachment_descriptions(color_format: vk::Format, depth_format: vk::Format) -> [vk::AttachmentDescription; 2] {
    [
        vk::AttachmentDescription::builder()
            .format(color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .build(),
        vk::AttachmentDescription::builder()
            .format(depth_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .build(),
    ]
}

/// External -> subpass 0, so colour writes wait for the presentation engine to release the image
pub fn external_dependency() -> vk::SubpassDependency {
    vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
        .build()
}

/// Render pass wrapper with RAII cleanup
pub struct RenderPass {
    device: Device,
    render_pass: vk::RenderPass,
    render_area: vk::Rect2D,
    clear: ClearValues,
}

impl RenderPass {
    /// Create the main pass
    pub fn new(
        device: &Device,
        color_format: vk::Format,
        depth_format: vk::Format,
        render_area: vk::Rect2D,
        clear: ClearValues,
    ) -> VulkanResult<Self> {
        let attachments = attachment_descriptions(color_format, depth_format);

        let color_refs = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let depth_ref = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };

        let subpasses = [vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)
            .depth_stencil_attachment(&depth_ref)
            .build()];
        let dependencies = [external_dependency()];

        let create_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let render_pass = unsafe {
            device.create_render_pass(&create_info, None)
                .map_err(VulkanError::Api)?
        };
        log::debug!("Render pass created ({:?} + {:?})", color_format, depth_format);

        Ok(Self {
            device: device.clone(),
            render_pass,
            render_area,
            clear,
        })
    }

    /// Begin the pass into `framebuffer` with the stored area and clear values
    pub fn begin(&self, command_buffer: &mut CommandBuffer, framebuffer: vk::Framebuffer) -> VulkanResult<()> {
        command_buffer.enter_render_pass()?;

        let clear_values = self.clear.to_vk();
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass)
            .framebuffer(framebuffer)
            .render_area(self.render_area)
            .clear_values(&clear_values);

        unsafe {
            self.device.cmd_begin_render_pass(command_buffer.handle(), &begin_info, vk::SubpassContents::INLINE);
        }
        Ok(())
    }

    /// End the pass
    pub fn end(&self, command_buffer: &mut CommandBuffer) -> VulkanResult<()> {
        command_buffer.leave_render_pass()?;
        unsafe {
            self.device.cmd_end_render_pass(command_buffer.handle());
        }
        Ok(())
    }

    /// Area covered by the pass
    pub fn render_area(&self) -> vk::Rect2D {
        self.render_area
    }

    /// Resize the render area (framebuffer size changed)
    pub fn set_render_area(&mut self, render_area: vk::Rect2D) {
        self.render_area = render_area;
    }

    /// Clear values used on begin
    pub fn clear_values(&self) -> ClearValues {
        self.clear
    }

    /// Get the render pass handle
    pub fn handle(&self) -> vk::RenderPass {
        self.render_pass
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_render_pass(self.render_pass, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attachment_load_store_behavior() {
        let [color, depth] = attachment_descriptions(vk::Format::B8G8R8A8_UNORM, vk::Format::D32_SFLOAT);
        assert_eq!(color.format, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(color.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(color.store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(color.initial_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(color.final_layout, vk::ImageLayout::PRESENT_SRC_KHR);

        assert_eq!(depth.format, vk::Format::D32_SFLOAT);
        assert_eq!(depth.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(depth.store_op, vk::AttachmentStoreOp::DONT_CARE);
    }

    #[test]
    fn test_dependency_gates_color_output() {
        let dep = external_dependency();
        assert_eq!(dep.src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(dep.dst_subpass, 0);
        assert_eq!(dep.src_stage_mask, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(dep.dst_stage_mask, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert!(dep.dst_access_mask.contains(vk::AccessFlags::COLOR_ATTACHMENT_WRITE));
    }

    #[test]
    fn test_clear_values() {
        let clear = ClearValues::default();
        let [color, depth] = clear.to_vk();
        unsafe {
            assert_eq!(color.color.float32, [0.0, 0.0, 0.2, 1.0]);
            assert_eq!(depth.depth_stencil.depth, 1.0);
            assert_eq!(depth.depth_stencil.stencil, 0);
        }
    }
}
