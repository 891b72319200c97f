//! Resource management
//!
//! CPU-side meshes and the shader program registry.

mod mesh;
mod shader;

pub use mesh::*;
pub use shader::*;
