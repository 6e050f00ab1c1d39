//! Window management using GLFW
//!
//! The renderer never talks to GLFW directly; it only sees [`PlatformSurface`],
//! which the window implements.

use ash::vk;
use thiserror::Error;

/// Window management errors
#[derive(Error, Debug)]
pub enum WindowError {
    /// GLFW could not be initialized
    #[error("GLFW initialization failed")]
    InitializationFailed,

    /// The native window could not be created
    #[error("Window creation failed")]
    CreationFailed,

    /// Any other GLFW failure
    #[error("GLFW error: {0}")]
    GlfwError(String),
}

/// Result type for window operations
pub type WindowResult<T> = Result<T, WindowError>;

/// What a rendering backend needs from the platform layer
pub trait PlatformSurface {
    /// Instance extensions required to present to this platform's windows
    fn required_instance_extensions(&self) -> WindowResult<Vec<String>>;

    /// Create a presentation surface for `instance`
    fn create_surface(&self, instance: vk::Instance) -> WindowResult<vk::SurfaceKHR>;

    /// Current framebuffer size in pixels
    fn framebuffer_size(&self) -> (u32, u32);
}

/// GLFW window wrapper
pub struct Window {
    glfw: glfw::Glfw,
    window: glfw::PWindow,
    events: glfw::GlfwReceiver<(f64, glfw::WindowEvent)>,
}

impl Window {
    /// Create a resizable window without a client API (Vulkan renders into it)
    pub fn new(title: &str, width: u32, height: u32) -> WindowResult<Self> {
        let mut glfw = glfw::init(glfw::fail_on_errors)
            .map_err(|_| WindowError::InitializationFailed)?;

        glfw.window_hint(glfw::WindowHint::ClientApi(glfw::ClientApiHint::NoApi));
        glfw.window_hint(glfw::WindowHint::Resizable(true));

        let (mut window, events) = glfw
            .create_window(width, height, title, glfw::WindowMode::Windowed)
            .ok_or(WindowError::CreationFailed)?;

        window.set_key_polling(true);
        window.set_close_polling(true);
        window.set_framebuffer_size_polling(true);

        Ok(Self {
            glfw,
            window,
            events,
        })
    }

    /// Whether the user asked to close the window
    pub fn should_close(&self) -> bool {
        self.window.should_close()
    }

    /// Request (or cancel) closing the window
    pub fn set_should_close(&mut self, should_close: bool) {
        self.window.set_should_close(should_close);
    }

    /// Pump the platform event queue
    pub fn poll_events(&mut self) {
        self.glfw.poll_events();
    }

    /// Drain events received since the last call
    pub fn flush_events(&self) -> Vec<glfw::WindowEvent> {
        glfw::flush_messages(&self.events).map(|(_, event)| event).collect()
    }

    /// Seconds since GLFW was initialized
    pub fn time(&self) -> f64 {
        self.glfw.get_time()
    }
}

impl PlatformSurface for Window {
    fn required_instance_extensions(&self) -> WindowResult<Vec<String>> {
        self.glfw
            .get_required_instance_extensions()
            .ok_or_else(|| WindowError::GlfwError("Vulkan is not supported by this platform".to_string()))
    }

    fn create_surface(&self, instance: vk::Instance) -> WindowResult<vk::SurfaceKHR> {
        let mut surface = vk::SurfaceKHR::null();
        let result = self.window.create_window_surface(instance, std::ptr::null(), &mut surface);

        if result == vk::Result::SUCCESS {
            Ok(surface)
        } else {
            Err(WindowError::GlfwError(format!("Failed to create Vulkan surface: {result:?}")))
        }
    }

    fn framebuffer_size(&self) -> (u32, u32) {
        let (width, height) = self.window.get_framebuffer_size();
        (width.max(0) as u32, height.max(0) as u32)
    }
}
