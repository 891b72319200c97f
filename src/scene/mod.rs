//! Scene management: merged geometry, cameras, the shadow-casting light and
//! the per-frame data handed to render passes.

mod camera;
mod camera_controller;
mod light;
mod loader;
mod manager;

pub use camera::*;
pub use camera_controller::*;
pub use light::*;
pub use manager::*;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use thiserror::Error;

use crate::backend::traits::BackendError;
use crate::QuadRect;

/// Scene loading and upload errors
#[derive(Error, Debug)]
pub enum SceneError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("glTF error: {0}")]
    Gltf(#[from] gltf::Error),
    #[error("Buffer error: {0}")]
    Buffer(String),
    #[error("Mesh {mesh} uses unsupported topology {mode}")]
    UnsupportedTopology { mesh: usize, mode: String },
    #[error("Mesh {mesh} primitive {primitive} has no POSITION attribute")]
    MissingPositions { mesh: usize, primitive: usize },
    #[error("Unknown mesh id {0}")]
    UnknownMesh(usize),
    #[error("Scene has no geometry")]
    Empty,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type SceneResult<T> = Result<T, SceneError>;

/// Camera parameters stored in a scene file
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneCamera {
    /// Vertical field of view in degrees
    pub fov: f32,
    pub position: Vec3,
    pub up: Vec3,
    pub look_at: Vec3,
    pub near: f32,
    pub far: f32,
}

/// Contents of the constants uniform buffer (std140)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct UniformParams {
    pub light_matrix: Mat4,
    pub light_pos: Vec3,
    pub time: f32,
    pub base_color: Vec3,
    /// Non-zero when the lighting shader cycles the light color
    pub animate_light_color: u32,
}

impl Default for UniformParams {
    fn default() -> Self {
        Self {
            light_matrix: Mat4::IDENTITY,
            light_pos: Vec3::ZERO,
            time: 0.0,
            base_color: Vec3::ONE,
            animate_light_color: 0,
        }
    }
}

/// Per-frame values read by the passes while recording
#[derive(Debug, Clone, Copy)]
pub struct FrameData {
    /// Camera projection * view
    pub world_view_proj: Mat4,
    pub light_matrix: Mat4,
    pub draw_debug_quad: bool,
    pub debug_quad_rect: QuadRect,
}

impl Default for FrameData {
    fn default() -> Self {
        Self {
            world_view_proj: Mat4::IDENTITY,
            light_matrix: Mat4::IDENTITY,
            draw_debug_quad: false,
            debug_quad_rect: QuadRect::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_params_std140_size() {
        assert_eq!(std::mem::size_of::<UniformParams>(), 96);
        assert_eq!(std::mem::offset_of!(UniformParams, light_pos), 64);
        assert_eq!(std::mem::offset_of!(UniformParams, base_color), 80);
    }
}
