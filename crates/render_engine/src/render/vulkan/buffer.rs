//! Buffer management for vertex data and uniforms

use ash::{vk, Device};

use super::commands::CommandBuffer;
use super::context::{VulkanError, VulkanResult};
use super::device::VulkanDevice;

/// Buffer wrapper with memory management
pub struct Buffer {
    device: Device,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    memory_flags: vk::MemoryPropertyFlags,
}

impl Buffer {
    /// Create a buffer and allocate its memory, binding it immediately when `bind_on_create`
    pub fn new(
        device: &VulkanDevice,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
        bind_on_create: bool,
    ) -> VulkanResult<Self> {
        let logical = &device.logical;
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            logical.create_buffer(&buffer_info, None)
                .map_err(VulkanError::Api)?
        };

        let requirements = unsafe { logical.get_buffer_memory_requirements(buffer) };
        let memory_type_index = match device.find_memory_index(requirements.memory_type_bits, memory_flags) {
            Ok(index) => index,
            Err(e) => {
                unsafe { logical.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = match unsafe { logical.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { logical.destroy_buffer(buffer, None) };
                log::error!("Unable to allocate {} bytes of buffer memory: {:?}", requirements.size, e);
                return Err(VulkanError::Api(e));
            }
        };

        let created = Self {
            device: logical.clone(),
            buffer,
            memory,
            size,
            usage,
            memory_flags,
        };

        if bind_on_create {
            created.bind(0)?;
        }

        Ok(created)
    }

    /// Bind the allocation to the buffer at `offset`
    pub fn bind(&self, offset: vk::DeviceSize) -> VulkanResult<()> {
        unsafe {
            self.device.bind_buffer_memory(self.buffer, self.memory, offset)
                .map_err(VulkanError::Api)
        }
    }

    /// Copy `data` into the buffer at byte `offset` through a host mapping
    pub fn load_data<T: bytemuck::Pod>(&self, offset: vk::DeviceSize, data: &[T]) -> VulkanResult<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        check_range(self.size, offset, bytes.len() as vk::DeviceSize)?;
        if !self.memory_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(VulkanError::InvalidOperation {
                reason: "Cannot map a buffer that is not host visible".to_string(),
            });
        }

        unsafe {
            let ptr = self.device
                .map_memory(self.memory, offset, bytes.len() as vk::DeviceSize, vk::MemoryMapFlags::empty())
                .map_err(VulkanError::Api)?;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>(), bytes.len());
            self.device.unmap_memory(self.memory);
        }
        Ok(())
    }

    /// Copy a region into `dest` with a single-use command buffer, waiting for completion
    pub fn copy_to(
        &self,
        pool: vk::CommandPool,
        queue: vk::Queue,
        dest: &Buffer,
        src_offset: vk::DeviceSize,
        dst_offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VulkanResult<()> {
        check_range(self.size, src_offset, size)?;
        check_range(dest.size, dst_offset, size)?;

        let command_buffer = CommandBuffer::allocate_and_begin_single_use(&self.device, pool)?;
        let region = vk::BufferCopy::builder()
            .src_offset(src_offset)
            .dst_offset(dst_offset)
            .size(size);
        unsafe {
            self.device.cmd_copy_buffer(command_buffer.handle(), self.buffer, dest.buffer, &[region.build()]);
        }
        command_buffer.end_single_use(pool, queue, None)
    }

    /// Get buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Get size
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Usage flags the buffer was created with
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

fn check_range(capacity: vk::DeviceSize, offset: vk::DeviceSize, len: vk::DeviceSize) -> VulkanResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(VulkanError::InvalidOperation {
            reason: format!("Range {offset}+{len} exceeds buffer size {capacity}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_range() {
        assert!(check_range(256, 0, 256).is_ok());
        assert!(check_range(256, 128, 128).is_ok());
        assert!(check_range(256, 128, 129).is_err());
        assert!(check_range(256, u64::MAX, 2).is_err());
    }
}
