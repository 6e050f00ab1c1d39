//! Shared vertex and index buffers
//!
//! Every mesh is appended to one device-local vertex buffer and one index
//! buffer; a [`GeometryHandle`] records where it landed.

use ash::vk;

use super::buffer::Buffer;
use super::commands::CommandBuffer;
use super::context::{VulkanError, VulkanResult};
use super::device::VulkanDevice;
use crate::render::types::{GeometryHandle, Vertex3d};

/// Vertices the shared vertex buffer holds
pub const VERTEX_CAPACITY: u32 = 1024 * 1024;

/// Indices the shared index buffer holds
pub const INDEX_CAPACITY: u32 = 1024 * 1024;

/// Bump allocator over element slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeAllocator {
    capacity: u32,
    used: u32,
}

impl RangeAllocator {
    /// Empty allocator for `capacity` elements
    pub fn new(capacity: u32) -> Self {
        Self { capacity, used: 0 }
    }

    /// Reserve `count` elements, returning the first
    pub fn reserve(&mut self, count: u32) -> Option<u32> {
        let end = self.used.checked_add(count)?;
        if end > self.capacity {
            return None;
        }
        let first = self.used;
        self.used = end;
        Some(first)
    }

    /// Elements handed out
    pub fn used(&self) -> u32 {
        self.used
    }

    /// Total elements
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// Device-local vertex and index storage
pub struct GeometryBuffers {
    vertex_buffer: Buffer,
    index_buffer: Buffer,
    vertices: RangeAllocator,
    indices: RangeAllocator,
}

impl GeometryBuffers {
    /// Allocate both buffers
    pub fn new(device: &VulkanDevice) -> VulkanResult<Self> {
        let usage = vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC;
        let vertex_buffer = Buffer::new(
            device,
            element_bytes::<Vertex3d>(VERTEX_CAPACITY),
            usage | vk::BufferUsageFlags::VERTEX_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            true,
        )?;
        let index_buffer = Buffer::new(
            device,
            element_bytes::<u32>(INDEX_CAPACITY),
            usage | vk::BufferUsageFlags::INDEX_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            true,
        )?;

        Ok(Self {
            vertex_buffer,
            index_buffer,
            vertices: RangeAllocator::new(VERTEX_CAPACITY),
            indices: RangeAllocator::new(INDEX_CAPACITY),
        })
    }

    /// Append a mesh through staging buffers
    pub fn upload(&mut self, device: &VulkanDevice, vertices: &[Vertex3d], indices: &[u32]) -> VulkanResult<GeometryHandle> {
        let vertex_count = element_count(vertices.len())?;
        let index_count = element_count(indices.len())?;
        if vertex_count == 0 {
            return Err(VulkanError::InvalidOperation {
                reason: "Geometry needs at least one vertex".to_string(),
            });
        }

        let mut vertex_slots = self.vertices;
        let mut index_slots = self.indices;
        let first_vertex = vertex_slots.reserve(vertex_count).ok_or(VulkanError::CapacityExceeded {
            max: VERTEX_CAPACITY as usize,
        })?;
        let first_index = index_slots.reserve(index_count).ok_or(VulkanError::CapacityExceeded {
            max: INDEX_CAPACITY as usize,
        })?;

        upload_range(device, &self.vertex_buffer, element_bytes::<Vertex3d>(first_vertex), vertices)?;
        if index_count > 0 {
            upload_range(device, &self.index_buffer, element_bytes::<u32>(first_index), indices)?;
        }
        self.vertices = vertex_slots;
        self.indices = index_slots;

        log::debug!("Uploaded geometry: {} vertices at {}, {} indices at {}", vertex_count, first_vertex, index_count, first_index);
        Ok(GeometryHandle {
            first_vertex,
            vertex_count,
            first_index,
            index_count,
        })
    }

    /// Bind both buffers and record the draw
    pub fn draw(&self, device: &ash::Device, command_buffer: &CommandBuffer, geometry: &GeometryHandle) -> VulkanResult<()> {
        let vertex_offset = i32::try_from(geometry.first_vertex).map_err(|_| VulkanError::InvalidOperation {
            reason: format!("Vertex offset {} out of range", geometry.first_vertex),
        })?;
        let cb = command_buffer.handle();
        unsafe {
            device.cmd_bind_vertex_buffers(cb, 0, &[self.vertex_buffer.handle()], &[0]);
            if geometry.index_count > 0 {
                device.cmd_bind_index_buffer(cb, self.index_buffer.handle(), 0, vk::IndexType::UINT32);
                device.cmd_draw_indexed(cb, geometry.index_count, 1, geometry.first_index, vertex_offset, 0);
            } else {
                device.cmd_draw(cb, geometry.vertex_count, 1, geometry.first_vertex, 0);
            }
        }
        Ok(())
    }
}

fn element_bytes<T>(count: u32) -> vk::DeviceSize {
    vk::DeviceSize::from(count) * std::mem::size_of::<T>() as vk::DeviceSize
}

fn element_count(len: usize) -> VulkanResult<u32> {
    u32::try_from(len).map_err(|_| VulkanError::InvalidOperation {
        reason: format!("{len} elements exceed a single upload"),
    })
}

fn upload_range<T: bytemuck::Pod>(device: &VulkanDevice, dest: &Buffer, offset: vk::DeviceSize, data: &[T]) -> VulkanResult<()> {
    let size = std::mem::size_of_val(data) as vk::DeviceSize;
    let staging = Buffer::new(
        device,
        size,
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        true,
    )?;
    staging.load_data(0, data)?;
    staging.copy_to(device.graphics_command_pool, device.graphics_queue, dest, 0, offset, size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges_are_contiguous() {
        let mut alloc = RangeAllocator::new(10);
        assert_eq!(alloc.reserve(4), Some(0));
        assert_eq!(alloc.reserve(6), Some(4));
        assert_eq!(alloc.used(), 10);
        assert_eq!(alloc.reserve(1), None);
        assert_eq!(alloc.reserve(0), Some(10));
    }

    #[test]
    fn test_overflowing_request_leaves_allocator_untouched() {
        let mut alloc = RangeAllocator::new(8);
        alloc.reserve(3).unwrap();
        assert_eq!(alloc.reserve(u32::MAX), None);
        assert_eq!(alloc.reserve(6), None);
        assert_eq!(alloc.used(), 3);
    }

    #[test]
    fn test_buffer_sizes() {
        assert_eq!(element_bytes::<Vertex3d>(2), 40);
        assert_eq!(element_bytes::<u32>(INDEX_CAPACITY), 4 * 1024 * 1024);
    }
}
