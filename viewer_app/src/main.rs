//! Quad viewer
//!
//! Opens a window, draws a textured, rotating quad every frame and forwards
//! resizes to the renderer. Usage: `viewer [config.toml|config.ron] [texture.png]`.
//! Space cycles the quad's tint; Escape quits.

use glfw::{Action, Key, WindowEvent};
use render_engine::config::Config;
use render_engine::foundation::logging;
use render_engine::foundation::math::{rotation_z, Vec4};
use render_engine::render::{
    GeometryHandle, GeometryRenderData, Material, RenderPacket, RendererConfig, RendererFrontend, Texture, Vertex3d,
    Window,
};

const TINTS: [[f32; 4]; 3] = [[1.0, 1.0, 1.0, 1.0], [1.0, 0.6, 0.6, 1.0], [0.6, 1.0, 0.6, 1.0]];

fn quad() -> ([Vertex3d; 4], [u32; 6]) {
    let half = 10.0;
    (
        [
            Vertex3d::new([-half, -half, 0.0], [0.0, 0.0]),
            Vertex3d::new([half, half, 0.0], [1.0, 1.0]),
            Vertex3d::new([-half, half, 0.0], [0.0, 1.0]),
            Vertex3d::new([half, -half, 0.0], [1.0, 0.0]),
        ],
        [0, 1, 2, 0, 3, 1],
    )
}

// the renderer must drop before the window it presents to
struct Viewer {
    renderer: RendererFrontend,
    material: Material,
    texture: Option<Texture>,
    geometry: GeometryHandle,
    tint: usize,
    window: Window,
}

impl Viewer {
    fn new(config: &RendererConfig, texture_path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        let (width, height) = config.initial_extent();
        let window = Window::new(&config.application_name, width, height)?;
        let mut renderer = RendererFrontend::initialize(config, &window)?;

        let mut material = Material::new("quad");
        renderer.create_material(&mut material)?;

        let texture = match texture_path {
            Some(path) => match Texture::from_file(0, path) {
                Ok(loaded) => Some(renderer.create_texture(
                    &loaded.name,
                    loaded.width,
                    loaded.height,
                    loaded.channel_count,
                    loaded.data,
                    loaded.has_transparency,
                )?),
                Err(e) => {
                    log::warn!("Could not load {}: {}, using the default texture", path, e);
                    None
                }
            },
            None => None,
        };

        let (vertices, indices) = quad();
        let geometry = renderer.create_geometry(&vertices, &indices)?;

        Ok(Self {
            renderer,
            material,
            texture,
            geometry,
            tint: 0,
            window,
        })
    }

    fn handle_events(&mut self) {
        self.window.poll_events();
        for event in self.window.flush_events() {
            match event {
                WindowEvent::Key(Key::Escape, _, Action::Press, _) => self.window.set_should_close(true),
                WindowEvent::Key(Key::Space, _, Action::Press, _) => {
                    self.tint = (self.tint + 1) % TINTS.len();
                    self.material.set_diffuse_colour(Vec4::from(TINTS[self.tint]));
                }
                WindowEvent::FramebufferSize(width, height) => {
                    self.renderer.on_resized(width.max(0) as u32, height.max(0) as u32);
                }
                _ => {}
            }
        }
    }

    fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let mut last = self.window.time();
        let mut angle = 0.0_f32;

        while !self.window.should_close() {
            self.handle_events();

            let now = self.window.time();
            let delta_time = (now - last) as f32;
            last = now;
            angle += delta_time;

            let packet = RenderPacket {
                delta_time,
                geometries: vec![GeometryRenderData {
                    model: rotation_z(angle),
                    material: &self.material,
                    texture: self.texture.as_ref(),
                    geometry: self.geometry,
                }],
            };
            self.renderer.draw_frame(&packet)?;
        }
        Ok(())
    }

    fn shutdown(mut self) {
        self.renderer.destroy_material(&mut self.material);
        if let Some(texture) = self.texture.as_mut() {
            self.renderer.destroy_texture(texture);
        }
        self.renderer.shutdown();
    }
}

fn main() {
    if let Err(e) = logging::init_with_level(log::LevelFilter::Debug) {
        eprintln!("Logger already installed: {e}");
    }

    let mut args = std::env::args().skip(1);
    let config_path = args.next();
    let texture_path = args.next();

    let config = match config_path.as_deref() {
        Some(path) => match RendererConfig::load_or_default(path) {
            Ok(config) => config,
            Err(e) => {
                log::error!("Failed to load {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => RendererConfig::new("Quad Viewer"),
    }
    .with_shader_path_resolution();

    let mut viewer = match Viewer::new(&config, texture_path.as_deref()) {
        Ok(viewer) => viewer,
        Err(e) => {
            log::error!("Initialization failed: {}", e);
            std::process::exit(1);
        }
    };

    let result = viewer.run();
    viewer.shutdown();

    if let Err(e) = result {
        log::error!("Render loop stopped: {}", e);
        std::process::exit(1);
    }
    log::info!("Viewer exited cleanly");
}
