//! Renderer frontend
//!
//! The only entry point a game loop needs per tick is [`RendererFrontend::draw_frame`].
//! Everything API-specific happens behind the [`RenderBackend`] it owns.

use super::backend::{create_backend, RenderBackend};
use super::config::RendererConfig;
use super::material::Material;
use super::texture::Texture;
use super::types::{GeometryHandle, GlobalUniformObject, RenderPacket, RenderViewMode, Vertex3d};
use super::window::PlatformSurface;
use super::{RenderError, RenderResult};
use crate::foundation::math::{aspect_ratio, perspective, view_from_position, Mat4, Vec3, Vec4};

/// Camera position used until the application sets one
const DEFAULT_CAMERA_POSITION: [f32; 3] = [0.0, 0.0, 30.0];

/// Frontend orchestrator over a single backend
pub struct RendererFrontend {
    backend: Box<dyn RenderBackend>,
    fov_degrees: f32,
    near_clip: f32,
    far_clip: f32,
    projection: Mat4,
    view: Mat4,
    view_position: Vec3,
    ambient_colour: Vec4,
    mode: RenderViewMode,
    next_texture_id: u32,
}

impl RendererFrontend {
    /// Validate `config` and bring up its backend on `platform`
    pub fn initialize(config: &RendererConfig, platform: &dyn PlatformSurface) -> RenderResult<Self> {
        config.validate().map_err(|reason| {
            log::error!("Invalid renderer configuration: {}", reason);
            RenderError::InitializationFailed(reason)
        })?;

        let backend = create_backend(config, platform)?;
        let (width, height) = match platform.framebuffer_size() {
            (0, _) | (_, 0) => config.initial_extent(),
            size => size,
        };
        let frontend = Self::with_backend(config, backend, width, height);
        log::info!("Renderer initialized ({} backend)", frontend.backend.backend_type());
        Ok(frontend)
    }

    /// Wrap an existing backend
    pub fn with_backend(config: &RendererConfig, backend: Box<dyn RenderBackend>, width: u32, height: u32) -> Self {
        let view_position = Vec3::from(DEFAULT_CAMERA_POSITION);
        let aspect = aspect_ratio(width, height).unwrap_or(1.0);
        Self {
            backend,
            fov_degrees: config.fov_degrees,
            near_clip: config.near_clip,
            far_clip: config.far_clip,
            projection: perspective(config.fov_degrees, aspect, config.near_clip, config.far_clip),
            view: view_from_position(view_position),
            view_position,
            ambient_colour: Vec4::new(0.25, 0.25, 0.25, 1.0),
            mode: RenderViewMode::Default,
            next_texture_id: 0,
        }
    }

    /// Wait for the GPU and tear the backend down
    pub fn shutdown(self) {
        if let Err(e) = self.backend.wait_idle() {
            log::error!("wait_idle during shutdown failed: {}", e);
        }
        log::info!("Renderer shut down after {} frames", self.backend.frame_number());
    }

    /// Start a frame; `Ok(false)` means skip it
    pub fn begin_frame(&mut self, delta_time: f32) -> RenderResult<bool> {
        self.backend.begin_frame(delta_time)
    }

    /// Upload the per-frame camera state
    pub fn update_global_state(
        &mut self,
        projection: &Mat4,
        view: &Mat4,
        view_position: &Vec3,
        ambient_colour: &Vec4,
        mode: RenderViewMode,
    ) -> RenderResult<()> {
        let global = GlobalUniformObject::new(projection, view, view_position, ambient_colour, mode);
        self.backend.update_global_state(&global)
    }

    /// Submit and present the frame
    pub fn end_frame(&mut self, delta_time: f32) -> RenderResult<()> {
        self.backend.end_frame(delta_time)
    }

    /// Render everything in `packet`.
    ///
    /// A skipped frame is `Ok`. A draw whose object state is unavailable is
    /// logged and left out. A failed `end_frame` is returned as
    /// [`RenderError::RenderingFailed`] and the application should shut down.
    pub fn draw_frame(&mut self, packet: &RenderPacket<'_>) -> RenderResult<()> {
        if !self.begin_frame(packet.delta_time)? {
            return Ok(());
        }

        let (projection, view, view_position, ambient_colour) =
            (self.projection, self.view, self.view_position, self.ambient_colour);
        self.update_global_state(&projection, &view, &view_position, &ambient_colour, self.mode)?;

        for data in &packet.geometries {
            match self.backend.update_object(data) {
                Ok(()) => self.backend.draw_geometry(&data.geometry)?,
                Err(e) if !e.is_fatal() => {
                    log::error!("Skipping draw for material '{}': {}", data.material.name, e);
                }
                Err(e) => return Err(e),
            }
        }

        self.end_frame(packet.delta_time).map_err(|e| {
            log::error!("end_frame failed, shutting down: {}", e);
            RenderError::RenderingFailed(format!("end_frame failed: {e}"))
        })
    }

    /// Recompute the projection for the new aspect and forward the size to the backend
    pub fn on_resized(&mut self, width: u32, height: u32) {
        if let Some(aspect) = aspect_ratio(width, height) {
            self.projection = perspective(self.fov_degrees, aspect, self.near_clip, self.far_clip);
        }
        self.backend.resized(width, height);
    }

    /// Move the camera
    pub fn set_view(&mut self, view: Mat4, view_position: Vec3) {
        self.view = view;
        self.view_position = view_position;
    }

    /// Ambient light colour
    pub fn set_ambient_colour(&mut self, colour: Vec4) {
        self.ambient_colour = colour;
    }

    /// Debug view mode
    pub fn set_render_mode(&mut self, mode: RenderViewMode) {
        self.mode = mode;
    }

    /// Current projection matrix
    pub fn projection(&self) -> &Mat4 {
        &self.projection
    }

    /// Build and upload a texture from raw pixels
    pub fn create_texture(
        &mut self,
        name: &str,
        width: u32,
        height: u32,
        channel_count: u8,
        pixels: Vec<u8>,
        has_transparency: bool,
    ) -> RenderResult<Texture> {
        let mut texture = Texture::new(self.next_texture_id, name, width, height, channel_count, pixels);
        texture.has_transparency = has_transparency;
        self.backend.create_texture(&mut texture)?;
        self.next_texture_id += 1;
        Ok(texture)
    }

    /// Upload a texture's current pixels again
    pub fn reload_texture(&mut self, texture: &mut Texture) -> RenderResult<()> {
        self.backend.create_texture(texture)
    }

    /// Release a texture's GPU copy
    pub fn destroy_texture(&mut self, texture: &mut Texture) {
        self.backend.destroy_texture(texture);
    }

    /// Acquire backend state for a material
    pub fn create_material(&mut self, material: &mut Material) -> RenderResult<()> {
        self.backend.create_material(material)
    }

    /// Release a material's backend state
    pub fn destroy_material(&mut self, material: &mut Material) {
        self.backend.destroy_material(material);
    }

    /// Upload a mesh
    pub fn create_geometry(&mut self, vertices: &[Vertex3d], indices: &[u32]) -> RenderResult<GeometryHandle> {
        self.backend.create_geometry(vertices, indices)
    }

    /// Frames completed so far
    pub fn frame_number(&self) -> u64 {
        self.backend.frame_number()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backend::BackendType;
    use crate::render::types::{GeometryRenderData, ObjectId, TextureHandle};
    use approx::assert_relative_eq;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Resized(u32, u32),
        Begin,
        Global,
        Object(u32),
        Draw(u32),
        End,
    }

    #[derive(Default)]
    struct MockBackend {
        calls: Rc<RefCell<Vec<Call>>>,
        skip_frame: bool,
        fail_end: bool,
        frames: u64,
    }

    impl RenderBackend for MockBackend {
        fn backend_type(&self) -> BackendType {
            BackendType::Vulkan
        }

        fn resized(&mut self, width: u32, height: u32) {
            self.calls.borrow_mut().push(Call::Resized(width, height));
        }

        fn begin_frame(&mut self, _delta_time: f32) -> RenderResult<bool> {
            self.calls.borrow_mut().push(Call::Begin);
            Ok(!self.skip_frame)
        }

        fn update_global_state(&mut self, _global: &GlobalUniformObject) -> RenderResult<()> {
            self.calls.borrow_mut().push(Call::Global);
            Ok(())
        }

        fn update_object(&mut self, data: &GeometryRenderData<'_>) -> RenderResult<()> {
            let id = data
                .material
                .object_id
                .ok_or_else(|| RenderError::ResourceCreationFailed("no object state".to_string()))?;
            self.calls.borrow_mut().push(Call::Object(id.0));
            Ok(())
        }

        fn draw_geometry(&mut self, geometry: &GeometryHandle) -> RenderResult<()> {
            self.calls.borrow_mut().push(Call::Draw(geometry.first_vertex));
            Ok(())
        }

        fn end_frame(&mut self, _delta_time: f32) -> RenderResult<()> {
            self.calls.borrow_mut().push(Call::End);
            if self.fail_end {
                return Err(RenderError::BackendError("device lost".to_string()));
            }
            self.frames += 1;
            Ok(())
        }

        fn create_texture(&mut self, texture: &mut Texture) -> RenderResult<()> {
            texture.mark_uploaded(TextureHandle(u64::from(texture.id)));
            Ok(())
        }

        fn destroy_texture(&mut self, texture: &mut Texture) {
            texture.handle = None;
        }

        fn create_material(&mut self, material: &mut Material) -> RenderResult<()> {
            material.object_id = Some(ObjectId(0));
            Ok(())
        }

        fn destroy_material(&mut self, material: &mut Material) {
            material.object_id = None;
        }

        fn create_geometry(&mut self, vertices: &[Vertex3d], indices: &[u32]) -> RenderResult<GeometryHandle> {
            Ok(GeometryHandle {
                first_vertex: 0,
                vertex_count: vertices.len() as u32,
                first_index: 0,
                index_count: indices.len() as u32,
            })
        }

        fn frame_number(&self) -> u64 {
            self.frames
        }

        fn wait_idle(&self) -> RenderResult<()> {
            Ok(())
        }
    }

    fn frontend(backend: MockBackend) -> RendererFrontend {
        RendererFrontend::with_backend(&RendererConfig::default(), Box::new(backend), 800, 600)
    }

    fn geometry(first_vertex: u32) -> GeometryHandle {
        GeometryHandle {
            first_vertex,
            vertex_count: 4,
            first_index: 0,
            index_count: 6,
        }
    }

    #[test]
    fn test_draw_frame_call_order() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut renderer = frontend(MockBackend {
            calls: Rc::clone(&calls),
            ..MockBackend::default()
        });

        let mut material = Material::new("a");
        renderer.create_material(&mut material).unwrap();
        let packet = RenderPacket {
            delta_time: 0.016,
            geometries: vec![
                GeometryRenderData {
                    model: Mat4::identity(),
                    material: &material,
                    texture: None,
                    geometry: geometry(0),
                },
                GeometryRenderData {
                    model: Mat4::identity(),
                    material: &material,
                    texture: None,
                    geometry: geometry(4),
                },
            ],
        };

        renderer.draw_frame(&packet).unwrap();
        assert_eq!(
            *calls.borrow(),
            vec![Call::Begin, Call::Global, Call::Object(0), Call::Draw(0), Call::Object(0), Call::Draw(4), Call::End]
        );
        assert_eq!(renderer.frame_number(), 1);
    }

    #[test]
    fn test_skipped_frame_is_not_an_error() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut renderer = frontend(MockBackend {
            calls: Rc::clone(&calls),
            skip_frame: true,
            ..MockBackend::default()
        });

        renderer.draw_frame(&RenderPacket::default()).unwrap();
        assert_eq!(*calls.borrow(), vec![Call::Begin]);
        assert_eq!(renderer.frame_number(), 0);
    }

    #[test]
    fn test_unregistered_material_is_skipped() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut renderer = frontend(MockBackend {
            calls: Rc::clone(&calls),
            ..MockBackend::default()
        });

        let material = Material::new("unregistered");
        let packet = RenderPacket {
            delta_time: 0.016,
            geometries: vec![GeometryRenderData {
                model: Mat4::identity(),
                material: &material,
                texture: None,
                geometry: geometry(0),
            }],
        };

        renderer.draw_frame(&packet).unwrap();
        assert_eq!(*calls.borrow(), vec![Call::Begin, Call::Global, Call::End]);
    }

    #[test]
    fn test_failed_end_frame_requests_shutdown() {
        let mut renderer = frontend(MockBackend {
            fail_end: true,
            ..MockBackend::default()
        });
        let result = renderer.draw_frame(&RenderPacket::default());
        assert!(matches!(result, Err(RenderError::RenderingFailed(_))));
    }

    #[test]
    fn test_resize_recomputes_projection_and_forwards() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut renderer = frontend(MockBackend {
            calls: Rc::clone(&calls),
            ..MockBackend::default()
        });

        renderer.on_resized(1600, 900);
        let expected = perspective(45.0, 1600.0 / 900.0, 0.1, 1000.0);
        assert_relative_eq!(*renderer.projection(), expected, epsilon = 1e-6);
        assert_eq!(*calls.borrow(), vec![Call::Resized(1600, 900)]);

        // minimized: projection kept, size still forwarded
        renderer.on_resized(0, 0);
        assert_relative_eq!(*renderer.projection(), expected, epsilon = 1e-6);
        assert_eq!(calls.borrow().last(), Some(&Call::Resized(0, 0)));
    }

    #[test]
    fn test_created_textures_get_sequential_ids() {
        let mut renderer = frontend(MockBackend::default());
        let a = renderer.create_texture("a", 1, 1, 4, vec![255; 4], false).unwrap();
        let b = renderer.create_texture("b", 1, 1, 4, vec![255; 4], false).unwrap();
        assert_eq!((a.id, b.id), (0, 1));
        assert_eq!(a.generation, 0);
        assert!(a.is_uploaded());
    }
}
