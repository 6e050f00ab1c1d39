//! Built-in object shader: pipeline, global and per-object descriptor state
//!
//! Set 0 holds the camera block and is bound once per frame. Set 1 holds the
//! per-object block (binding 0) and diffuse sampler (binding 1) and is bound
//! for every draw. The model matrix travels as a push constant.

use ash::{vk, Device};
use std::path::Path;

use super::buffer::Buffer;
use super::commands::CommandBuffer;
use super::context::{VulkanError, VulkanResult};
use super::device::VulkanDevice;
use super::object_state::{BindingStamp, ObjectStateTable, DIFFUSE_SAMPLER_BINDING, OBJECT_UNIFORM_BINDING};
use super::pipeline::{flipped_viewport, full_scissor, Pipeline, PipelineDesc, ShaderStage, ShaderStageKind, VertexAttribute};
use super::render_pass::RenderPass;
use crate::foundation::math::{Mat4, Vec4};
use crate::render::types::{GlobalUniformObject, ObjectId, ObjectUniformObject};

/// Base name of the shader binaries
pub const OBJECT_SHADER_NAME: &str = "Builtin.ObjectShader";

/// Upper bound on frame slots the descriptor pools are sized for
pub const MAX_FRAME_SLOTS: usize = 8;

/// Stride of one uniform region, the largest `minUniformBufferOffsetAlignment` in practice
pub const UNIFORM_REGION_SIZE: vk::DeviceSize = 256;

const GLOBAL_SET_INDEX: u32 = 0;
const OBJECT_SET_INDEX: u32 = 1;

/// Vertex layout: position, texture coordinate
pub const OBJECT_SHADER_ATTRIBUTES: [VertexAttribute; 2] = [VertexAttribute::VEC3, VertexAttribute::VEC2];

/// Byte offset of region `index` in a uniform buffer
pub fn uniform_region_offset(index: usize) -> vk::DeviceSize {
    index as vk::DeviceSize * UNIFORM_REGION_SIZE
}

/// Byte offset of the uniform region owned by object `id` in frame slot `frame`.
///
/// Every (object, frame slot) pair has its own region, so a slot only ever
/// writes memory that its own fence guards.
pub fn object_region_offset(id: ObjectId, frame: usize) -> vk::DeviceSize {
    uniform_region_offset(id.0 as usize * MAX_FRAME_SLOTS + frame)
}

/// Pool sizes for `max_objects` objects across every frame slot
pub fn object_pool_sizes(max_objects: u32) -> [vk::DescriptorPoolSize; 2] {
    let count = max_objects * MAX_FRAME_SLOTS as u32;
    [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: count,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: count,
        },
    ]
}

/// Reject frame slot counts the pools were not sized for
pub fn check_frame_count(frame_count: usize) -> VulkanResult<()> {
    if frame_count == 0 || frame_count > MAX_FRAME_SLOTS {
        return Err(VulkanError::InvalidOperation {
            reason: format!("Frame slot count {frame_count} outside 1..={MAX_FRAME_SLOTS}"),
        });
    }
    Ok(())
}

/// Memory for CPU-written uniform buffers, device local when the device allows it
pub fn uniform_memory_flags(device_local_host_visible: bool) -> vk::MemoryPropertyFlags {
    let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
    if device_local_host_visible {
        host | vk::MemoryPropertyFlags::DEVICE_LOCAL
    } else {
        host
    }
}

/// Texture to sample for a draw, already resolved to GPU handles
#[derive(Debug, Clone, Copy)]
pub struct BoundTexture {
    /// Identity and generation of the texture
    pub stamp: BindingStamp,
    /// View, sampler and layout
    pub info: vk::DescriptorImageInfo,
}

/// Per-draw input to [`ObjectShader::update_object`]
#[derive(Debug, Clone, Copy)]
pub struct ObjectUpdate<'a> {
    /// Object whose set is updated
    pub id: ObjectId,
    /// Model matrix, pushed as a constant
    pub model: &'a Mat4,
    /// Material tint
    pub diffuse_colour: &'a Vec4,
    /// Material generation, bumps when the tint changes
    pub material_generation: u32,
    /// Diffuse texture
    pub texture: BoundTexture,
}

/// The built-in object shader
pub struct ObjectShader {
    device: Device,
    pipeline: Pipeline,
    global_layout: vk::DescriptorSetLayout,
    global_pool: vk::DescriptorPool,
    global_sets: Vec<vk::DescriptorSet>,
    global_uniform_buffer: Buffer,
    object_layout: vk::DescriptorSetLayout,
    object_pool: vk::DescriptorPool,
    object_uniform_buffer: Buffer,
    objects: ObjectStateTable,
}

impl ObjectShader {
    /// Load the stages, build the pipeline, descriptor pools and uniform buffers
    pub fn new(
        device: &VulkanDevice,
        render_pass: &RenderPass,
        shader_directory: &Path,
        max_objects: u32,
        frame_count: usize,
        extent: (u32, u32),
    ) -> VulkanResult<Self> {
        check_frame_count(frame_count)?;
        let logical = &device.logical;

        let stages = [
            ShaderStage::load(logical, shader_directory, OBJECT_SHADER_NAME, ShaderStageKind::Vertex)?,
            ShaderStage::load(logical, shader_directory, OBJECT_SHADER_NAME, ShaderStageKind::Fragment)?,
        ];

        let global_layout = create_set_layout(
            logical,
            &[(vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::VERTEX)],
        )?;
        let global_pool = create_pool(
            logical,
            &[vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: MAX_FRAME_SLOTS as u32,
            }],
            MAX_FRAME_SLOTS as u32,
        )?;
        let object_layout = create_set_layout(
            logical,
            &[
                (vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::FRAGMENT),
                (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::ShaderStageFlags::FRAGMENT),
            ],
        )?;
        let object_pool = create_pool(logical, &object_pool_sizes(max_objects), max_objects * MAX_FRAME_SLOTS as u32)?;

        let (width, height) = extent;
        let pipeline = Pipeline::new(
            logical,
            render_pass,
            &PipelineDesc {
                attributes: &OBJECT_SHADER_ATTRIBUTES,
                descriptor_set_layouts: &[global_layout, object_layout],
                stages: &stages,
                viewport: flipped_viewport(width, height),
                scissor: full_scissor(width, height),
                wireframe: false,
            },
        )?;

        let memory_flags = uniform_memory_flags(device.supports_device_local_host_visible);
        let global_uniform_buffer = Buffer::new(
            device,
            uniform_region_offset(MAX_FRAME_SLOTS),
            vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::UNIFORM_BUFFER,
            memory_flags,
            true,
        )?;
        let object_uniform_buffer = Buffer::new(
            device,
            uniform_region_offset(max_objects as usize * MAX_FRAME_SLOTS),
            vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::UNIFORM_BUFFER,
            memory_flags,
            true,
        )?;

        let mut shader = Self {
            device: logical.clone(),
            pipeline,
            global_layout,
            global_pool,
            global_sets: Vec::new(),
            global_uniform_buffer,
            object_layout,
            object_pool,
            object_uniform_buffer,
            objects: ObjectStateTable::new(max_objects, frame_count),
        };
        shader.allocate_global_sets(frame_count)?;

        log::info!("{} ready ({} objects, {} frame slots)", OBJECT_SHADER_NAME, max_objects, frame_count);
        Ok(shader)
    }

    /// Bind the pipeline
    pub fn use_shader(&self, command_buffer: &CommandBuffer) {
        self.pipeline.bind(command_buffer);
    }

    /// Upload the camera block for `frame` and bind set 0
    pub fn update_global_state(
        &self,
        command_buffer: &CommandBuffer,
        frame: usize,
        global: &GlobalUniformObject,
    ) -> VulkanResult<()> {
        let set = self.global_set(frame)?;
        self.global_uniform_buffer.load_data(uniform_region_offset(frame), std::slice::from_ref(global))?;
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                command_buffer.handle(),
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.layout(),
                GLOBAL_SET_INDEX,
                &[set],
                &[],
            );
        }
        Ok(())
    }

    /// Reserve an object id and allocate its per-frame sets
    pub fn acquire_resources(&mut self) -> VulkanResult<ObjectId> {
        let id = self.objects.reserve().map_err(|e| {
            log::error!("Failed to acquire object resources: {}", e);
            e
        })?;

        match self.allocate_object_sets(self.objects.frame_count()) {
            Ok(sets) => {
                self.objects.attach_sets(id, sets)?;
                log::debug!("Acquired object {}", id.0);
                Ok(id)
            }
            Err(e) => {
                self.objects.unreserve(id);
                log::error!("Failed to allocate descriptor sets for object {}: {}", id.0, e);
                Err(e)
            }
        }
    }

    /// Free the object's sets and make its id reusable
    pub fn release_resources(&mut self, id: ObjectId) -> VulkanResult<()> {
        let sets = self.objects.release(id).map_err(|e| {
            log::error!("Failed to release object resources: {}", e);
            e
        })?;
        self.free_object_sets(&sets)?;
        log::debug!("Released object {}", id.0);
        Ok(())
    }

    /// Push the model matrix, write whichever bindings are stale, bind set 1.
    ///
    /// Returns the number of descriptor writes issued.
    pub fn update_object(
        &mut self,
        command_buffer: &CommandBuffer,
        frame: usize,
        update: &ObjectUpdate<'_>,
    ) -> VulkanResult<usize> {
        let layout = self.pipeline.layout();
        let model: [[f32; 4]; 4] = (*update.model).into();
        unsafe {
            self.device.cmd_push_constants(
                command_buffer.handle(),
                layout,
                vk::ShaderStageFlags::VERTEX,
                0,
                bytemuck::bytes_of(&model),
            );
        }

        let uniform_stamp = BindingStamp::new(update.id.0, update.material_generation);
        let plan = self.objects.plan_writes(update.id, frame, uniform_stamp, update.texture.stamp)?;

        let region = object_region_offset(update.id, frame);
        if plan.write_uniform {
            let block = ObjectUniformObject::new(update.diffuse_colour);
            self.object_uniform_buffer.load_data(region, std::slice::from_ref(&block))?;
        }

        let buffer_infos = [vk::DescriptorBufferInfo {
            buffer: self.object_uniform_buffer.handle(),
            offset: region,
            range: UNIFORM_REGION_SIZE,
        }];
        let image_infos = [update.texture.info];

        let mut writes = Vec::with_capacity(plan.write_count());
        if plan.write_uniform {
            writes.push(
                vk::WriteDescriptorSet::builder()
                    .dst_set(plan.set)
                    .dst_binding(OBJECT_UNIFORM_BINDING as u32)
                    .dst_array_element(0)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(&buffer_infos)
                    .build(),
            );
        }
        if plan.write_texture {
            writes.push(
                vk::WriteDescriptorSet::builder()
                    .dst_set(plan.set)
                    .dst_binding(DIFFUSE_SAMPLER_BINDING as u32)
                    .dst_array_element(0)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(&image_infos)
                    .build(),
            );
        }

        if !writes.is_empty() {
            unsafe {
                self.device.update_descriptor_sets(&writes, &[]);
            }
            self.objects.commit(update.id, frame, &plan, uniform_stamp, update.texture.stamp)?;
        }

        unsafe {
            self.device.cmd_bind_descriptor_sets(
                command_buffer.handle(),
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                OBJECT_SET_INDEX,
                &[plan.set],
                &[],
            );
        }
        Ok(writes.len())
    }

    /// Resize every per-frame array after the swapchain image count changed.
    ///
    /// All sets are reallocated so every binding is written again on next use.
    pub fn set_frame_count(&mut self, frame_count: usize) -> VulkanResult<()> {
        check_frame_count(frame_count)?;
        if frame_count == self.objects.frame_count() {
            return Ok(());
        }

        let old_globals = std::mem::take(&mut self.global_sets);
        free_sets(&self.device, self.global_pool, &old_globals)?;
        self.allocate_global_sets(frame_count)?;

        self.objects.set_frame_count(frame_count);
        for id in self.objects.live_ids() {
            let sets = self.allocate_object_sets(frame_count)?;
            let old = self.objects.replace_sets(id, sets)?;
            self.free_object_sets(&old)?;
        }

        log::debug!("{} resized to {} frame slots", OBJECT_SHADER_NAME, frame_count);
        Ok(())
    }

    /// Pipeline layout, for callers pushing their own constants
    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline.layout()
    }

    /// Number of live objects
    pub fn object_count(&self) -> usize {
        self.objects.live_count()
    }

    fn global_set(&self, frame: usize) -> VulkanResult<vk::DescriptorSet> {
        self.global_sets.get(frame).copied().ok_or_else(|| VulkanError::InvalidOperation {
            reason: format!("No global descriptor set for frame {frame}"),
        })
    }

    fn allocate_global_sets(&mut self, frame_count: usize) -> VulkanResult<()> {
        let sets = allocate_sets(&self.device, self.global_pool, self.global_layout, frame_count)?;

        // each set points at its own fixed region; only the contents change per frame
        let buffer_infos: Vec<_> = (0..frame_count)
            .map(|frame| vk::DescriptorBufferInfo {
                buffer: self.global_uniform_buffer.handle(),
                offset: uniform_region_offset(frame),
                range: UNIFORM_REGION_SIZE,
            })
            .collect();
        let writes: Vec<_> = sets
            .iter()
            .zip(&buffer_infos)
            .map(|(&set, info)| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(0)
                    .dst_array_element(0)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(std::slice::from_ref(info))
                    .build()
            })
            .collect();
        unsafe {
            self.device.update_descriptor_sets(&writes, &[]);
        }

        self.global_sets = sets;
        Ok(())
    }

    fn allocate_object_sets(&self, frame_count: usize) -> VulkanResult<Vec<vk::DescriptorSet>> {
        allocate_sets(&self.device, self.object_pool, self.object_layout, frame_count)
    }

    fn free_object_sets(&self, sets: &[vk::DescriptorSet]) -> VulkanResult<()> {
        free_sets(&self.device, self.object_pool, sets)
    }
}

impl Drop for ObjectShader {
    fn drop(&mut self) {
        unsafe {
            // destroying a pool frees its sets
            self.device.destroy_descriptor_pool(self.object_pool, None);
            self.device.destroy_descriptor_set_layout(self.object_layout, None);
            self.device.destroy_descriptor_pool(self.global_pool, None);
            self.device.destroy_descriptor_set_layout(self.global_layout, None);
        }
    }
}

fn create_set_layout(
    device: &Device,
    bindings: &[(vk::DescriptorType, vk::ShaderStageFlags)],
) -> VulkanResult<vk::DescriptorSetLayout> {
    let bindings: Vec<_> = bindings
        .iter()
        .zip(0u32..)
        .map(|(&(ty, stages), binding)| {
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(ty)
                .descriptor_count(1)
                .stage_flags(stages)
                .build()
        })
        .collect();
    let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
    unsafe {
        device.create_descriptor_set_layout(&create_info, None)
            .map_err(VulkanError::Api)
    }
}

fn create_pool(device: &Device, sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> VulkanResult<vk::DescriptorPool> {
    let create_info = vk::DescriptorPoolCreateInfo::builder()
        .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
        .pool_sizes(sizes)
        .max_sets(max_sets);
    unsafe {
        device.create_descriptor_pool(&create_info, None)
            .map_err(VulkanError::Api)
    }
}

fn allocate_sets(
    device: &Device,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    count: usize,
) -> VulkanResult<Vec<vk::DescriptorSet>> {
    let layouts = vec![layout; count];
    let alloc_info = vk::DescriptorSetAllocateInfo::builder()
        .descriptor_pool(pool)
        .set_layouts(&layouts);
    unsafe {
        device.allocate_descriptor_sets(&alloc_info)
            .map_err(VulkanError::Api)
    }
}

fn free_sets(device: &Device, pool: vk::DescriptorPool, sets: &[vk::DescriptorSet]) -> VulkanResult<()> {
    if sets.is_empty() {
        return Ok(());
    }
    unsafe {
        device.free_descriptor_sets(pool, sets)
            .map_err(VulkanError::Api)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_regions_are_aligned() {
        assert_eq!(uniform_region_offset(0), 0);
        assert_eq!(uniform_region_offset(3), 768);
        assert_eq!(UNIFORM_REGION_SIZE as usize, std::mem::size_of::<GlobalUniformObject>());
        assert_eq!(UNIFORM_REGION_SIZE as usize, std::mem::size_of::<ObjectUniformObject>());
    }

    #[test]
    fn test_object_regions_are_private_to_each_frame_slot() {
        let frames = 3;
        let mut offsets: Vec<_> = (0..4u32)
            .flat_map(|id| (0..frames).map(move |frame| object_region_offset(ObjectId(id), frame)))
            .collect();
        let total = offsets.len();
        offsets.sort_unstable();
        offsets.dedup();
        assert_eq!(offsets.len(), total);

        assert_eq!(object_region_offset(ObjectId(0), 1), UNIFORM_REGION_SIZE);
        assert_eq!(object_region_offset(ObjectId(1), 0), uniform_region_offset(MAX_FRAME_SLOTS));

        // last region of the last object still fits the buffer
        let max_objects = 16u32;
        let buffer_size = uniform_region_offset(max_objects as usize * MAX_FRAME_SLOTS);
        let last = object_region_offset(ObjectId(max_objects - 1), MAX_FRAME_SLOTS - 1);
        assert_eq!(last + UNIFORM_REGION_SIZE, buffer_size);
    }

    #[test]
    fn test_object_pool_covers_every_frame_slot() {
        let sizes = object_pool_sizes(1024);
        assert_eq!(sizes[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(sizes[1].ty, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert!(sizes.iter().all(|s| s.descriptor_count == 1024 * MAX_FRAME_SLOTS as u32));
    }

    #[test]
    fn test_frame_count_bounds() {
        assert!(check_frame_count(0).is_err());
        assert!(check_frame_count(1).is_ok());
        assert!(check_frame_count(MAX_FRAME_SLOTS).is_ok());
        assert!(check_frame_count(MAX_FRAME_SLOTS + 1).is_err());
    }

    #[test]
    fn test_uniform_memory_prefers_device_local() {
        assert!(uniform_memory_flags(true).contains(vk::MemoryPropertyFlags::DEVICE_LOCAL));
        assert!(!uniform_memory_flags(false).contains(vk::MemoryPropertyFlags::DEVICE_LOCAL));
        assert!(uniform_memory_flags(false).contains(vk::MemoryPropertyFlags::HOST_VISIBLE));
    }
}
