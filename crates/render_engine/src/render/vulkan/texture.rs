//! GPU side of a texture: a sampled image plus its sampler

use std::borrow::Cow;

use ash::{vk, Device};

use super::buffer::Buffer;
use super::commands::CommandBuffer;
use super::context::{VulkanError, VulkanResult};
use super::device::VulkanDevice;
use super::image::{Image, ImageDesc};

/// Anisotropy requested when the device supports it
pub const MAX_SAMPLER_ANISOTROPY: f32 = 16.0;

/// Format every texture is uploaded as
pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Expand 1, 2, 3 or 4 channel pixels to tightly packed RGBA8
pub fn rgba_pixels(pixels: &[u8], width: u32, height: u32, channel_count: u8) -> VulkanResult<Cow<'_, [u8]>> {
    let texel_count = width as usize * height as usize;
    let channels = usize::from(channel_count);
    if channels == 0 || channels > 4 || pixels.len() != texel_count * channels {
        return Err(VulkanError::InvalidOperation {
            reason: format!(
                "Pixel data of {} bytes does not match {width}x{height} with {channel_count} channels",
                pixels.len()
            ),
        });
    }

    if channels == 4 {
        return Ok(Cow::Borrowed(pixels));
    }

    let mut rgba = Vec::with_capacity(texel_count * 4);
    for texel in pixels.chunks_exact(channels) {
        let expanded = match *texel {
            [l] => [l, l, l, 255],
            [l, a] => [l, l, l, a],
            [r, g, b, ..] => [r, g, b, 255],
            [] => continue,
        };
        rgba.extend_from_slice(&expanded);
    }
    Ok(Cow::Owned(rgba))
}

/// Anisotropy enable flag and level for a device feature bit
pub fn sampler_anisotropy(supported: bool) -> (bool, f32) {
    if supported {
        (true, MAX_SAMPLER_ANISOTROPY)
    } else {
        (false, 1.0)
    }
}

/// Uploaded texture
pub struct VulkanTexture {
    device: Device,
    image: Image,
    sampler: vk::Sampler,
}

impl VulkanTexture {
    /// Upload `pixels` through a staging buffer and create a linear repeat sampler
    pub fn create(
        device: &VulkanDevice,
        name: &str,
        width: u32,
        height: u32,
        channel_count: u8,
        pixels: &[u8],
    ) -> VulkanResult<Self> {
        let rgba = rgba_pixels(pixels, width, height, channel_count)?;

        let staging = Buffer::new(
            device,
            rgba.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            true,
        )?;
        staging.load_data(0, &rgba)?;

        let image = Image::new(
            device,
            &ImageDesc {
                width,
                height,
                format: TEXTURE_FORMAT,
                tiling: vk::ImageTiling::OPTIMAL,
                usage: vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::COLOR_ATTACHMENT,
                memory_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                view_aspect: Some(vk::ImageAspectFlags::COLOR),
            },
        )?;

        let pool = device.graphics_command_pool;
        let command_buffer = CommandBuffer::allocate_and_begin_single_use(&device.logical, pool)?;
        let recorded = image
            .transition_layout(&command_buffer, vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .map(|()| image.copy_from_buffer(&command_buffer, staging.handle()))
            .and_then(|()| {
                image.transition_layout(
                    &command_buffer,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                )
            });
        // submit either way so the buffer is freed
        let submitted = command_buffer.end_single_use(pool, device.graphics_queue, None);
        recorded?;
        submitted?;

        let sampler = create_sampler(&device.logical, device.features.sampler_anisotropy == vk::TRUE)?;

        log::debug!("Created texture '{}' ({}x{}, {} channels)", name, width, height, channel_count);

        Ok(Self {
            device: device.logical.clone(),
            image,
            sampler,
        })
    }

    /// Sampled view
    pub fn view(&self) -> vk::ImageView {
        self.image.view()
    }

    /// Sampler
    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    /// Width and height
    pub fn extent(&self) -> (u32, u32) {
        self.image.extent()
    }

    /// Descriptor payload for a combined image sampler binding
    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler,
            image_view: self.image.view(),
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }
}

impl Drop for VulkanTexture {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_sampler(self.sampler, None);
        }
    }
}

fn create_sampler(device: &Device, anisotropy_supported: bool) -> VulkanResult<vk::Sampler> {
    let (anisotropy_enable, max_anisotropy) = sampler_anisotropy(anisotropy_supported);
    let sampler_info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .anisotropy_enable(anisotropy_enable)
        .max_anisotropy(max_anisotropy)
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .unnormalized_coordinates(false)
        .compare_enable(false)
        .compare_op(vk::CompareOp::ALWAYS)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .mip_lod_bias(0.0)
        .min_lod(0.0)
        .max_lod(0.0);

    unsafe {
        device.create_sampler(&sampler_info, None)
            .map_err(VulkanError::Api)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgba_passthrough_borrows() {
        let pixels = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let rgba = rgba_pixels(&pixels, 2, 1, 4).unwrap();
        assert!(matches!(rgba, Cow::Borrowed(_)));
        assert_eq!(&*rgba, &pixels);
    }

    #[test]
    fn test_rgb_and_grey_expand() {
        let rgb = rgba_pixels(&[10, 20, 30], 1, 1, 3).unwrap();
        assert_eq!(&*rgb, &[10, 20, 30, 255]);

        let grey = rgba_pixels(&[7, 9], 2, 1, 1).unwrap();
        assert_eq!(&*grey, &[7, 7, 7, 255, 9, 9, 9, 255]);

        let grey_alpha = rgba_pixels(&[7, 100], 1, 1, 2).unwrap();
        assert_eq!(&*grey_alpha, &[7, 7, 7, 100]);
    }

    #[test]
    fn test_mismatched_pixel_data_is_rejected() {
        assert!(rgba_pixels(&[0; 15], 2, 2, 4).is_err());
        assert!(rgba_pixels(&[0; 16], 2, 2, 5).is_err());
        assert!(rgba_pixels(&[], 0, 0, 0).is_err());
    }

    #[test]
    fn test_anisotropy_follows_device_support() {
        assert_eq!(sampler_anisotropy(true), (true, 16.0));
        assert_eq!(sampler_anisotropy(false), (false, 1.0));
    }
}
