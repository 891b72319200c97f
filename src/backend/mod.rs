//! Backend abstraction layer
//!
//! Provides common traits and types that the wgpu, Vulkan and headless backends implement.

pub mod headless;
pub mod layout;
pub mod traits;
pub mod types;
pub mod wgpu_backend;

pub mod vulkan;

pub use layout::*;
pub use traits::*;
pub use types::*;
