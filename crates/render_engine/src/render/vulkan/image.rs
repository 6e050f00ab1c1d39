//! 2D images with optional views, layout transitions and buffer uploads

use ash::{vk, Device};

use super::commands::CommandBuffer;
use super::context::{VulkanError, VulkanResult};
use super::device::VulkanDevice;

/// Mip levels allocated for every image.
///
/// Only level 0 is written and viewed; the count is a fixed allocation policy.
pub const IMAGE_MIP_LEVELS: u32 = 4;

/// Mip levels for a `width` x `height` image: [`IMAGE_MIP_LEVELS`], capped by the full chain length
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    let full_chain = u32::BITS - width.max(height).max(1).leading_zeros();
    IMAGE_MIP_LEVELS.min(full_chain)
}

/// Parameters for [`Image::new`]
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel format
    pub format: vk::Format,
    /// Tiling mode
    pub tiling: vk::ImageTiling,
    /// Usage flags
    pub usage: vk::ImageUsageFlags,
    /// Memory properties for the backing allocation
    pub memory_flags: vk::MemoryPropertyFlags,
    /// Aspect for the view; `None` skips view creation
    pub view_aspect: Option<vk::ImageAspectFlags>,
}

/// Image, its memory, and an optional view
pub struct Image {
    device: Device,
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    width: u32,
    height: u32,
    format: vk::Format,
}

impl Image {
    /// Create the image, allocate and bind device memory, then create the view if requested
    pub fn new(device: &VulkanDevice, desc: &ImageDesc) -> VulkanResult<Self> {
        let logical = &device.logical;
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(mip_level_count(desc.width, desc.height))
            .array_layers(1)
            .format(desc.format)
            .tiling(desc.tiling)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe {
            logical.create_image(&image_info, None)
                .map_err(VulkanError::Api)?
        };

        let mut created = Self {
            device: logical.clone(),
            image,
            memory: vk::DeviceMemory::null(),
            view: vk::ImageView::null(),
            width: desc.width,
            height: desc.height,
            format: desc.format,
        };

        let requirements = unsafe { logical.get_image_memory_requirements(image) };
        let memory_type_index = device.find_memory_index(requirements.memory_type_bits, desc.memory_flags)?;
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        created.memory = unsafe {
            logical.allocate_memory(&alloc_info, None)
                .map_err(VulkanError::Api)?
        };
        unsafe {
            logical.bind_image_memory(image, created.memory, 0)
                .map_err(VulkanError::Api)?;
        }

        if let Some(aspect) = desc.view_aspect {
            created.view = create_image_view(logical, image, desc.format, aspect)?;
        }

        Ok(created)
    }

    /// Record a layout transition barrier
    pub fn transition_layout(
        &self,
        command_buffer: &CommandBuffer,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> VulkanResult<()> {
        let masks = transition_masks(old_layout, new_layout)?;
        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(color_subresource_range())
            .src_access_mask(masks.src_access)
            .dst_access_mask(masks.dst_access);

        unsafe {
            self.device.cmd_pipeline_barrier(
                command_buffer.handle(),
                masks.src_stage,
                masks.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier.build()],
            );
        }
        Ok(())
    }

    /// Record a copy of tightly packed pixels from `buffer` into mip level 0
    pub fn copy_from_buffer(&self, command_buffer: &CommandBuffer, buffer: vk::Buffer) {
        let region = vk::BufferImageCopy::builder()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_extent(vk::Extent3D {
                width: self.width,
                height: self.height,
                depth: 1,
            });

        unsafe {
            self.device.cmd_copy_buffer_to_image(
                command_buffer.handle(),
                buffer,
                self.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region.build()],
            );
        }
    }

    /// Image handle
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    /// View handle, null when no view was requested
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Pixel format
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Width and height
    pub fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            if self.view != vk::ImageView::null() {
                self.device.destroy_image_view(self.view, None);
            }
            if self.memory != vk::DeviceMemory::null() {
                self.device.free_memory(self.memory, None);
            }
            self.device.destroy_image(self.image, None);
        }
    }
}

/// Create a 2D view of mip level 0
pub fn create_image_view(
    device: &Device,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
) -> VulkanResult<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    unsafe {
        device.create_image_view(&view_info, None)
            .map_err(VulkanError::Api)
    }
}

fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Access masks and stages for one layout transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionMasks {
    /// Accesses that must complete before the barrier
    pub src_access: vk::AccessFlags,
    /// Accesses that wait on the barrier
    pub dst_access: vk::AccessFlags,
    /// Stage producing the source accesses
    pub src_stage: vk::PipelineStageFlags,
    /// Stage consuming the destination accesses
    pub dst_stage: vk::PipelineStageFlags,
}

/// Barrier parameters for the supported upload transitions
pub fn transition_masks(old_layout: vk::ImageLayout, new_layout: vk::ImageLayout) -> VulkanResult<TransitionMasks> {
    match (old_layout, new_layout) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => Ok(TransitionMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        }),
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => Ok(TransitionMasks {
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        }),
        _ => {
            log::error!("Unsupported layout transition {:?} -> {:?}", old_layout, new_layout);
            Err(VulkanError::InvalidOperation {
                reason: format!("Unsupported layout transition {old_layout:?} -> {new_layout:?}"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mip_levels_fixed_but_capped_for_small_images() {
        assert_eq!(mip_level_count(256, 256), IMAGE_MIP_LEVELS);
        assert_eq!(mip_level_count(1920, 1080), IMAGE_MIP_LEVELS);
        assert_eq!(mip_level_count(4, 2), 3);
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(0, 0), 1);
    }

    #[test]
    fn test_upload_transitions() {
        let to_dst = transition_masks(vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL).unwrap();
        assert_eq!(to_dst.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(to_dst.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);

        let to_read = transition_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(to_read.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(to_read.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn test_unsupported_transition_is_rejected() {
        assert!(transition_masks(vk::ImageLayout::UNDEFINED, vk::ImageLayout::PRESENT_SRC_KHR).is_err());
    }
}
