//! Shader stages and graphics pipeline creation
//!
//! Shader binaries are looked up as `<directory>/<name>.<stage>.spv`, matching
//! what the build script emits for `resources/shaders/<name>.<stage>`.

use ash::{vk, Device};
use std::ffi::CStr;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use super::commands::CommandBuffer;
use super::context::{VulkanError, VulkanResult};
use super::render_pass::RenderPass;

/// Size of the push constant block reserved for per-draw data (guaranteed minimum)
pub const PUSH_CONSTANT_SIZE: u32 = 128;

const SHADER_ENTRY_POINT: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };

/// Programmable stage kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStageKind {
    /// Vertex shader
    Vertex,
    /// Fragment shader
    Fragment,
}

impl ShaderStageKind {
    /// File-name suffix for this stage
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Vertex => "vert",
            Self::Fragment => "frag",
        }
    }

    /// Vulkan stage bit
    pub fn to_vk(self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }
}

/// Path of a compiled stage binary
pub fn shader_path(directory: &Path, name: &str, kind: ShaderStageKind) -> PathBuf {
    directory.join(format!("{name}.{}.spv", kind.suffix()))
}

/// Compiled shader module for one stage
pub struct ShaderStage {
    device: Device,
    module: vk::ShaderModule,
    kind: ShaderStageKind,
}

impl ShaderStage {
    /// Create a stage from SPIR-V bytes
    pub fn from_spirv(device: &Device, kind: ShaderStageKind, bytes: &[u8]) -> VulkanResult<Self> {
        let code = ash::util::read_spv(&mut Cursor::new(bytes)).map_err(|e| {
            log::error!("[SHADER] Invalid SPIR-V for {:?} stage: {}", kind, e);
            VulkanError::InitializationFailed(format!("Invalid SPIR-V: {e}"))
        })?;

        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);
        let module = unsafe {
            device.create_shader_module(&create_info, None)
                .map_err(|e| {
                    log::error!("[SHADER] vkCreateShaderModule failed: {:?}", e);
                    VulkanError::Api(e)
                })?
        };

        Ok(Self {
            device: device.clone(),
            module,
            kind,
        })
    }

    /// Load `<directory>/<name>.<stage>.spv`
    pub fn load(device: &Device, directory: &Path, name: &str, kind: ShaderStageKind) -> VulkanResult<Self> {
        let path = shader_path(directory, name, kind);
        log::debug!("[SHADER] Loading {}", path.display());
        let bytes = std::fs::read(&path).map_err(|source| VulkanError::ShaderLoad {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_spirv(device, kind, &bytes)
    }

    /// Stage info for pipeline creation
    pub fn stage_info(&self) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(self.kind.to_vk())
            .module(self.module)
            .name(SHADER_ENTRY_POINT)
            .build()
    }

    /// Which stage this is
    pub fn kind(&self) -> ShaderStageKind {
        self.kind
    }
}

impl Drop for ShaderStage {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_shader_module(self.module, None);
        }
    }
}

/// One vertex attribute in declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    /// Attribute format
    pub format: vk::Format,
    /// Size in bytes
    pub size: u32,
}

impl VertexAttribute {
    /// Three 32-bit floats
    pub const VEC3: Self = Self {
        format: vk::Format::R32G32B32_SFLOAT,
        size: 12,
    };

    /// Two 32-bit floats
    pub const VEC2: Self = Self {
        format: vk::Format::R32G32_SFLOAT,
        size: 8,
    };
}

/// Attribute descriptions on binding 0 with accumulated offsets, plus the total stride
pub fn attribute_descriptions(attributes: &[VertexAttribute]) -> (Vec<vk::VertexInputAttributeDescription>, u32) {
    let mut offset = 0;
    let descriptions = attributes
        .iter()
        .enumerate()
        .map(|(location, attribute)| {
            let description = vk::VertexInputAttributeDescription {
                location: location as u32,
                binding: 0,
                format: attribute.format,
                offset,
            };
            offset += attribute.size;
            description
        })
        .collect();
    (descriptions, offset)
}

/// Viewport with negated height so +Y points up and the origin sits at the top-left
pub fn flipped_viewport(width: u32, height: u32) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: height as f32,
        width: width as f32,
        height: -(height as f32),
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

/// Scissor covering the whole framebuffer
pub fn full_scissor(width: u32, height: u32) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: vk::Extent2D { width, height },
    }
}

/// Everything needed to build a graphics pipeline
pub struct PipelineDesc<'a> {
    /// Vertex attributes in declaration order
    pub attributes: &'a [VertexAttribute],
    /// Descriptor set layouts by set index
    pub descriptor_set_layouts: &'a [vk::DescriptorSetLayout],
    /// Programmable stages
    pub stages: &'a [ShaderStage],
    /// Initial viewport (dynamic state overrides it per frame)
    pub viewport: vk::Viewport,
    /// Initial scissor (dynamic state overrides it per frame)
    pub scissor: vk::Rect2D,
    /// Rasterize as lines
    pub wireframe: bool,
}

/// Graphics pipeline and its layout
pub struct Pipeline {
    device: Device,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

impl Pipeline {
    /// Build a graphics pipeline for subpass 0 of `render_pass`
    pub fn new(device: &Device, render_pass: &RenderPass, desc: &PipelineDesc<'_>) -> VulkanResult<Self> {
        let viewports = [desc.viewport];
        let scissors = [desc.scissor];
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewports(&viewports)
            .scissors(&scissors);

        let polygon_mode = if desc.wireframe {
            vk::PolygonMode::LINE
        } else {
            vk::PolygonMode::FILL
        };
        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(polygon_mode)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .min_sample_shading(1.0);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::builder()
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD)
            .color_write_mask(
                vk::ColorComponentFlags::R
                    | vk::ColorComponentFlags::G
                    | vk::ColorComponentFlags::B
                    | vk::ColorComponentFlags::A,
            )
            .build()];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .logic_op(vk::LogicOp::COPY)
            .attachments(&color_blend_attachments);

        let dynamic_states = [
            vk::DynamicState::VIEWPORT,
            vk::DynamicState::SCISSOR,
            vk::DynamicState::LINE_WIDTH,
        ];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let (attribute_descriptions, stride) = attribute_descriptions(desc.attributes);
        let binding_descriptions = [vk::VertexInputBindingDescription {
            binding: 0,
            stride,
            input_rate: vk::VertexInputRate::VERTEX,
        }];
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&binding_descriptions)
            .vertex_attribute_descriptions(&attribute_descriptions);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        let push_constant_ranges = [vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::VERTEX,
            offset: 0,
            size: PUSH_CONSTANT_SIZE,
        }];
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(desc.descriptor_set_layouts)
            .push_constant_ranges(&push_constant_ranges);

        let layout = unsafe {
            device.create_pipeline_layout(&layout_info, None)
                .map_err(VulkanError::Api)?
        };

        let stage_infos: Vec<_> = desc.stages.iter().map(ShaderStage::stage_info).collect();
        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stage_infos)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass.handle())
            .subpass(0);

        let pipelines = unsafe {
            device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info.build()], None)
        };
        let pipeline = match pipelines {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                log::error!("Graphics pipeline creation failed: {:?}", e);
                return Err(VulkanError::Api(e));
            }
        };

        log::debug!("Graphics pipeline created");
        Ok(Self {
            device: device.clone(),
            pipeline,
            layout,
        })
    }

    /// Bind for subsequent draws
    pub fn bind(&self, command_buffer: &CommandBuffer) {
        unsafe {
            self.device.cmd_bind_pipeline(command_buffer.handle(), vk::PipelineBindPoint::GRAPHICS, self.pipeline);
        }
    }

    /// Pipeline handle
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// Pipeline layout handle
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_attribute_offsets_accumulate() {
        let (descriptions, stride) = attribute_descriptions(&[VertexAttribute::VEC3, VertexAttribute::VEC2]);
        assert_eq!(descriptions.len(), 2);
        assert_eq!(descriptions[0].offset, 0);
        assert_eq!(descriptions[0].location, 0);
        assert_eq!(descriptions[0].format, vk::Format::R32G32B32_SFLOAT);
        assert_eq!(descriptions[1].offset, 12);
        assert_eq!(descriptions[1].location, 1);
        assert_eq!(stride, 20);
    }

    #[test]
    fn test_viewport_is_flipped() {
        let viewport = flipped_viewport(1280, 720);
        assert_relative_eq!(viewport.y, 720.0);
        assert_relative_eq!(viewport.height, -720.0);
        assert_relative_eq!(viewport.width, 1280.0);
        assert_relative_eq!(viewport.max_depth, 1.0);
    }

    #[test]
    fn test_shader_path_uses_stage_suffix() {
        let dir = Path::new("target/shaders");
        assert_eq!(
            shader_path(dir, "Builtin.ObjectShader", ShaderStageKind::Vertex),
            dir.join("Builtin.ObjectShader.vert.spv")
        );
        assert_eq!(
            shader_path(dir, "Builtin.ObjectShader", ShaderStageKind::Fragment),
            dir.join("Builtin.ObjectShader.frag.spv")
        );
    }

    #[test]
    fn test_scissor_covers_framebuffer() {
        let scissor = full_scissor(800, 600);
        assert_eq!(scissor.offset.x, 0);
        assert_eq!(scissor.extent.height, 600);
    }
}
