//! Renderer configuration
//!
//! Loaded through [`Config`] from TOML or RON, or built in code with the
//! `with_*` methods. Unknown fields are rejected, missing ones take defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::backend::BackendType;
use super::vulkan::device::DeviceRequirements;
use crate::config::Config;

/// Size used when the configured initial size is zero
pub const FALLBACK_EXTENT: (u32, u32) = (800, 600);

/// Upper bound for `max_object_count`
pub const MAX_OBJECT_COUNT_LIMIT: u32 = 65536;

const SHADER_SEARCH_DIRS: [&str; 4] = ["target/shaders", "shaders", "resources/shaders", "../target/shaders"];

/// Everything needed to bring a renderer up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RendererConfig {
    /// Application name reported to the driver
    pub application_name: String,
    /// Graphics API to use
    pub backend: BackendType,
    /// Initial framebuffer width, 0 for the fallback
    pub initial_width: u32,
    /// Initial framebuffer height, 0 for the fallback
    pub initial_height: u32,
    /// Colour the frame is cleared to
    pub clear_color: [f32; 4],
    /// Depth clear value
    pub clear_depth: f32,
    /// Stencil clear value
    pub clear_stencil: u32,
    /// Objects that may hold backend state at once
    pub max_object_count: u32,
    /// Load the validation layer and route its messages to the log
    pub enable_validation: bool,
    /// Directory holding `<shader>.<stage>.spv`
    pub shader_directory: PathBuf,
    /// Physical device requirements
    pub device: DeviceRequirements,
    /// Vertical field of view in degrees
    pub fov_degrees: f32,
    /// Near clip distance
    pub near_clip: f32,
    /// Far clip distance
    pub far_clip: f32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            application_name: "Render Engine".to_string(),
            backend: BackendType::Vulkan,
            initial_width: FALLBACK_EXTENT.0,
            initial_height: FALLBACK_EXTENT.1,
            clear_color: [0.0, 0.0, 0.2, 1.0],
            clear_depth: 1.0,
            clear_stencil: 0,
            max_object_count: 1024,
            enable_validation: cfg!(debug_assertions),
            shader_directory: PathBuf::from(SHADER_SEARCH_DIRS[0]),
            device: DeviceRequirements::default(),
            fov_degrees: 45.0,
            near_clip: 0.1,
            far_clip: 1000.0,
        }
    }
}

impl Config for RendererConfig {}

impl RendererConfig {
    /// Defaults with an application name
    pub fn new(application_name: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
            ..Self::default()
        }
    }

    /// Set the backend
    pub fn with_backend(mut self, backend: BackendType) -> Self {
        self.backend = backend;
        self
    }

    /// Set the initial framebuffer size
    pub fn with_initial_size(mut self, width: u32, height: u32) -> Self {
        self.initial_width = width;
        self.initial_height = height;
        self
    }

    /// Set the clear colour
    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    /// Set the object capacity
    pub fn with_max_object_count(mut self, count: u32) -> Self {
        self.max_object_count = count;
        self
    }

    /// Enable or disable validation layers
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = enabled;
        self
    }

    /// Set the shader directory
    pub fn with_shader_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.shader_directory = directory.into();
        self
    }

    /// Set the device requirements
    pub fn with_device_requirements(mut self, device: DeviceRequirements) -> Self {
        self.device = device;
        self
    }

    /// Set the projection parameters
    pub fn with_projection(mut self, fov_degrees: f32, near_clip: f32, far_clip: f32) -> Self {
        self.fov_degrees = fov_degrees;
        self.near_clip = near_clip;
        self.far_clip = far_clip;
        self
    }

    /// Use the first common shader location that exists, keeping the configured one otherwise
    pub fn with_shader_path_resolution(mut self) -> Self {
        if !self.shader_directory.is_dir() {
            if let Some(found) = SHADER_SEARCH_DIRS.iter().map(Path::new).find(|dir| dir.is_dir()) {
                log::debug!("Resolved shader directory to {}", found.display());
                self.shader_directory = found.to_path_buf();
            }
        }
        self
    }

    /// Initial size with zeros replaced by the fallback
    pub fn initial_extent(&self) -> (u32, u32) {
        if self.initial_width == 0 || self.initial_height == 0 {
            FALLBACK_EXTENT
        } else {
            (self.initial_width, self.initial_height)
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.application_name.is_empty() {
            return Err("Application name cannot be empty".to_string());
        }

        if !(self.near_clip > 0.0 && self.near_clip < self.far_clip) {
            return Err(format!(
                "Clip range must satisfy 0 < near < far (near {}, far {})",
                self.near_clip, self.far_clip
            ));
        }

        if self.max_object_count == 0 || self.max_object_count > MAX_OBJECT_COUNT_LIMIT {
            return Err(format!(
                "Max object count must be within 1..={MAX_OBJECT_COUNT_LIMIT}, got {}",
                self.max_object_count
            ));
        }

        if !(self.fov_degrees > 0.0 && self.fov_degrees < 180.0) {
            return Err(format!("Field of view must be within (0, 180), got {}", self.fov_degrees));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RendererConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.clear_color, [0.0, 0.0, 0.2, 1.0]);
        assert_eq!(config.max_object_count, 1024);
        assert_eq!(config.initial_extent(), (800, 600));
    }

    #[test]
    fn test_zero_size_falls_back() {
        let config = RendererConfig::default().with_initial_size(0, 720);
        assert_eq!(config.initial_extent(), FALLBACK_EXTENT);
        let config = RendererConfig::default().with_initial_size(1280, 720);
        assert_eq!(config.initial_extent(), (1280, 720));
    }

    #[test]
    fn test_validation_rules() {
        assert!(RendererConfig::new("").validate().is_err());
        assert!(RendererConfig::default().with_projection(45.0, 10.0, 1.0).validate().is_err());
        assert!(RendererConfig::default().with_projection(45.0, 0.0, 1.0).validate().is_err());
        assert!(RendererConfig::default().with_projection(0.0, 0.1, 1.0).validate().is_err());
        assert!(RendererConfig::default().with_projection(180.0, 0.1, 1.0).validate().is_err());
        assert!(RendererConfig::default().with_max_object_count(0).validate().is_err());
        assert!(RendererConfig::default()
            .with_max_object_count(MAX_OBJECT_COUNT_LIMIT + 1)
            .validate()
            .is_err());
        assert!(RendererConfig::default()
            .with_max_object_count(MAX_OBJECT_COUNT_LIMIT)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_toml_round_trip_through_files() {
        let dir = std::env::temp_dir().join(format!("render_engine_config_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("renderer.toml");

        let config = RendererConfig::new("Viewer")
            .with_initial_size(1024, 768)
            .with_clear_color([0.1, 0.2, 0.3, 1.0])
            .with_validation(false);
        config.save_to_file(&path).unwrap();
        let loaded = RendererConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: RendererConfig = toml::from_str("application_name = \"Partial\"\nmax_object_count = 16\n").unwrap();
        assert_eq!(parsed.application_name, "Partial");
        assert_eq!(parsed.max_object_count, 16);
        assert_eq!(parsed.far_clip, 1000.0);
        assert_eq!(parsed.device, DeviceRequirements::default());
    }
}
