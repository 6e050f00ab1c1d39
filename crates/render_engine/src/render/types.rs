//! Data exchanged between the frontend, the resource systems and a backend

use bytemuck::{Pod, Zeroable};

use crate::foundation::math::{Mat4, Vec3, Vec4};
use super::material::Material;
use super::texture::Texture;

/// Sentinel for "no id / no generation yet"
pub const INVALID_ID: u32 = u32::MAX;

/// Handle to per-object backend state (descriptor sets, uniform region)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(pub u32);

/// Handle to backend-side texture data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u64);

/// Range of the shared vertex/index buffers holding one mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GeometryHandle {
    /// First vertex in the vertex buffer
    pub first_vertex: u32,
    /// Number of vertices
    pub vertex_count: u32,
    /// First index in the index buffer
    pub first_index: u32,
    /// Number of indices
    pub index_count: u32,
}

/// Vertex layout consumed by the object shader: position, then texture coordinate
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex3d {
    /// Object-space position
    pub position: [f32; 3],
    /// Texture coordinate
    pub texcoord: [f32; 2],
}

impl Vertex3d {
    /// Build from position and texture coordinate
    pub const fn new(position: [f32; 3], texcoord: [f32; 2]) -> Self {
        Self { position, texcoord }
    }
}

/// Debug view selector forwarded to shaders
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RenderViewMode {
    /// Regular shading
    #[default]
    Default,
    /// Lighting only
    Lighting,
    /// Surface normals
    Normals,
}

impl RenderViewMode {
    /// Value written into the global uniform block
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Default => 0,
            Self::Lighting => 1,
            Self::Normals => 2,
        }
    }
}

/// Per-frame camera state, one 256-byte block per frame slot
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GlobalUniformObject {
    /// Projection matrix (column major)
    pub projection: [[f32; 4]; 4],
    /// View matrix (column major)
    pub view: [[f32; 4]; 4],
    /// Camera world position, w unused
    pub view_position: [f32; 4],
    /// Ambient light colour
    pub ambient_colour: [f32; 4],
    /// [`RenderViewMode`] as an integer
    pub mode: u32,
    _padding: [u32; 23],
}

impl GlobalUniformObject {
    /// Pack the per-frame state
    pub fn new(projection: &Mat4, view: &Mat4, view_position: &Vec3, ambient_colour: &Vec4, mode: RenderViewMode) -> Self {
        Self {
            projection: (*projection).into(),
            view: (*view).into(),
            view_position: [view_position.x, view_position.y, view_position.z, 1.0],
            ambient_colour: (*ambient_colour).into(),
            mode: mode.as_u32(),
            _padding: [0; 23],
        }
    }
}

/// Per-object material data, one 256-byte block per object
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ObjectUniformObject {
    /// Diffuse tint
    pub diffuse_colour: [f32; 4],
    _padding: [[f32; 4]; 15],
}

impl ObjectUniformObject {
    /// Pack the material tint
    pub fn new(diffuse_colour: &Vec4) -> Self {
        Self {
            diffuse_colour: (*diffuse_colour).into(),
            _padding: [[0.0; 4]; 15],
        }
    }
}

/// One draw: where the mesh lives, how it is placed, and what it looks like
#[derive(Debug, Clone, Copy)]
pub struct GeometryRenderData<'a> {
    /// Model matrix, pushed as a constant per draw
    pub model: Mat4,
    /// Material whose backend object state is used
    pub material: &'a Material,
    /// Diffuse texture; missing or unloaded textures fall back to the default texture
    pub texture: Option<&'a Texture>,
    /// Mesh range to draw
    pub geometry: GeometryHandle,
}

/// Everything the frontend needs to render one frame
#[derive(Debug, Clone, Default)]
pub struct RenderPacket<'a> {
    /// Seconds since the previous frame
    pub delta_time: f32,
    /// Draws issued this frame
    pub geometries: Vec<GeometryRenderData<'a>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_blocks_are_256_bytes() {
        assert_eq!(std::mem::size_of::<GlobalUniformObject>(), 256);
        assert_eq!(std::mem::size_of::<ObjectUniformObject>(), 256);
    }

    #[test]
    fn test_vertex_layout() {
        assert_eq!(std::mem::size_of::<Vertex3d>(), 20);
        let v = Vertex3d::new([1.0, 2.0, 3.0], [0.5, 0.25]);
        let floats: &[f32] = bytemuck::cast_slice(std::slice::from_ref(&v));
        assert_eq!(floats, &[1.0, 2.0, 3.0, 0.5, 0.25]);
    }

    #[test]
    fn test_global_uniform_packing() {
        let projection = Mat4::identity();
        let view = Mat4::new_translation(&Vec3::new(1.0, 2.0, 3.0));
        let ubo = GlobalUniformObject::new(
            &projection,
            &view,
            &Vec3::new(4.0, 5.0, 6.0),
            &Vec4::new(0.25, 0.25, 0.25, 1.0),
            RenderViewMode::Normals,
        );
        // column major: translation lives in the last column
        assert_eq!(ubo.view[3], [1.0, 2.0, 3.0, 1.0]);
        assert_eq!(ubo.view_position, [4.0, 5.0, 6.0, 1.0]);
        assert_eq!(ubo.mode, 2);
    }
}
