//! # Render Engine
//!
//! A Vulkan rendering backend behind a small, API-agnostic frontend.
//!
//! ## Features
//!
//! - **Swapchain lifecycle**: out-of-date and suboptimal chains are rebuilt
//!   transparently; the caller only ever sees "skip this frame"
//! - **Per-object descriptors**: generation watermarks skip descriptor writes
//!   for bindings whose data has not changed
//! - **Frames in flight**: one fence and semaphore pair per swapchain image
//! - **Configuration**: TOML or RON files through [`config::Config`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use render_engine::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     render_engine::foundation::logging::init();
//!
//!     let config = RendererConfig::new("Demo");
//!     let mut window = Window::new("Demo", 800, 600)?;
//!     let mut renderer = RendererFrontend::initialize(&config, &window)?;
//!
//!     while !window.should_close() {
//!         window.poll_events();
//!         renderer.draw_frame(&RenderPacket::default())?;
//!     }
//!
//!     renderer.shutdown();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod config;
pub mod foundation;
pub mod render;

/// Common imports for engine users
pub mod prelude {
    pub use crate::{
        config::{Config, ConfigError},
        foundation::math::{Mat4, Vec2, Vec3, Vec4},
        render::{
            BackendType, GeometryHandle, GeometryRenderData, Material, PlatformSurface, RenderBackend, RenderError,
            RenderPacket, RenderResult, RenderViewMode, RendererConfig, RendererFrontend, Texture, Vertex3d, Window,
        },
    };
}
