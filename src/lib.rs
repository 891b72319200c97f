//! Shadowmap Renderer - deferred shading with shadow mapping on a render graph
//!
//! Every frame runs three passes through the render graph:
//! - **Shadow**: scene depth from the light's point of view into a shadow map
//! - **G-buffer**: world positions and normals of the visible surfaces
//! - **Lighting**: full-screen composite into the swapchain that samples both
//!
//! An optional overlay draws the shadow map into a corner of the screen. The
//! graph orders the passes and plans the layout transitions between them.
//!
//! Backends:
//! - **wgpu**: cross-platform, high-level GPU abstraction
//! - **Vulkan**: direct Vulkan 1.3 via ash
//! - **Headless**: records commands without a GPU, used by tests

pub mod backend;
pub mod error;
pub mod pipeline;
pub mod render_graph;
pub mod renderer;
pub mod resources;
pub mod scene;
pub mod window;

pub use error::{RendererError, RendererResult};
pub use renderer::ShadowmapRenderer;
pub use window::Window;

pub use backend::wgpu_backend::WgpuBackend;

use glam::Vec3;

/// Backend selection for the renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendType {
    /// wgpu backend - cross-platform, easier to use
    #[default]
    Wgpu,
    /// Vulkan backend via ash - maximum control
    Vulkan,
    /// No GPU; commands are recorded for inspection
    Headless,
}

/// Screen rectangle in pixels, origin at the top-left corner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuadRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for QuadRect {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            width: 512,
            height: 512,
        }
    }
}

/// Shadow-casting light setup
#[derive(Debug, Clone)]
pub struct LightConfig {
    pub position: Vec3,
    pub look_at: Vec3,
    /// Half-extent of the orthographic shadow frustum
    pub radius: f32,
    pub near: f32,
    pub far: f32,
    /// Orbit the light around `look_at`
    pub animate: bool,
    /// Orbit speed in radians per second
    pub rotation_speed: f32,
    pub color: Vec3,
}

impl Default for LightConfig {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 10.0, 10.0),
            look_at: Vec3::ZERO,
            radius: 15.0,
            near: 1.0,
            far: 40.0,
            animate: false,
            rotation_speed: 0.5,
            color: Vec3::new(1.0, 0.95, 0.9),
        }
    }
}

/// Configuration for initializing the renderer
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Window title
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub backend: BackendType,
    pub vsync: bool,
    /// Side of the square shadow map in texels
    pub shadow_map_size: u32,
    /// Overlay the shadow map on screen
    pub draw_debug_quad: bool,
    pub debug_quad_rect: QuadRect,
    /// Cycle the light color over time in the lighting shader
    pub animate_light_color: bool,
    /// Transpose instance matrices when loading a scene
    pub transpose_instance_matrices: bool,
    pub light: LightConfig,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            title: "Shadowmap Renderer".to_string(),
            width: 1280,
            height: 720,
            backend: BackendType::Wgpu,
            vsync: true,
            shadow_map_size: 2048,
            draw_debug_quad: true,
            debug_quad_rect: QuadRect::default(),
            animate_light_color: false,
            transpose_instance_matrices: false,
            light: LightConfig::default(),
        }
    }
}

impl RendererConfig {
    pub fn with_backend(mut self, backend: BackendType) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn with_shadow_map_size(mut self, size: u32) -> Self {
        self.shadow_map_size = size;
        self
    }

    pub fn with_debug_quad(mut self, enabled: bool) -> Self {
        self.draw_debug_quad = enabled;
        self
    }

    pub fn with_debug_quad_rect(mut self, rect: QuadRect) -> Self {
        self.debug_quad_rect = rect;
        self
    }

    pub fn with_light(mut self, light: LightConfig) -> Self {
        self.light = light;
        self
    }

    pub fn with_light_animation(mut self, animate: bool) -> Self {
        self.light.animate = animate;
        self
    }

    pub fn with_light_color_animation(mut self, animate: bool) -> Self {
        self.animate_light_color = animate;
        self
    }

    pub fn with_transposed_instances(mut self, transpose: bool) -> Self {
        self.transpose_instance_matrices = transpose;
        self
    }
}
