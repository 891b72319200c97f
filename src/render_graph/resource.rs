//! Virtual resources for the render graph

use crate::backend::layout::TextureLayout;
use crate::backend::types::*;

/// Unique identifier for a render graph resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub(crate) u32);

/// Texture owned by the graph and allocated by the executor
#[derive(Debug, Clone)]
pub struct VirtualTexture {
    pub id: ResourceId,
    pub name: String,
    pub size: TextureSize,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl VirtualTexture {
    /// Resolve the concrete descriptor for the given screen size
    pub fn descriptor(&self, screen_width: u32, screen_height: u32) -> TextureDescriptor {
        let (width, height) = self.size.resolve(screen_width, screen_height);
        TextureDescriptor {
            label: Some(self.name.clone()),
            width,
            height,
            format: self.format,
            usage: self.usage,
        }
    }
}

/// Texture supplied from outside the graph every frame (the swapchain image)
#[derive(Debug, Clone)]
pub struct ExternalTexture {
    pub id: ResourceId,
    pub name: String,
    pub format: TextureFormat,
    pub usage: TextureUsage,
    /// Transition to `PresentSrc` after the last pass that touches it.
    pub present: bool,
}

/// Resource type enumeration
#[derive(Debug, Clone)]
pub enum VirtualResource {
    Texture(VirtualTexture),
    External(ExternalTexture),
}

impl VirtualResource {
    pub fn id(&self) -> ResourceId {
        match self {
            VirtualResource::Texture(t) => t.id,
            VirtualResource::External(e) => e.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            VirtualResource::Texture(t) => &t.name,
            VirtualResource::External(e) => &e.name,
        }
    }

    pub fn format(&self) -> TextureFormat {
        match self {
            VirtualResource::Texture(t) => t.format,
            VirtualResource::External(e) => e.format,
        }
    }

    pub fn usage(&self) -> TextureUsage {
        match self {
            VirtualResource::Texture(t) => t.usage,
            VirtualResource::External(e) => e.usage,
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, VirtualResource::External(_))
    }

    pub fn presents(&self) -> bool {
        matches!(self, VirtualResource::External(e) if e.present)
    }
}

/// How a pass uses a texture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceUsage {
    /// Sampled from a shader
    TextureRead,
    /// Bound as a color render target
    RenderTarget,
    /// Bound as a depth attachment with writes enabled
    DepthStencilWrite,
    /// Bound as a depth attachment for testing only
    DepthStencilRead,
    /// Copy source
    CopySrc,
    /// Copy destination
    CopyDst,
}

impl ResourceUsage {
    /// The layout a texture must be in for this usage
    pub fn layout(self) -> TextureLayout {
        match self {
            ResourceUsage::TextureRead => TextureLayout::ShaderReadOnly,
            ResourceUsage::RenderTarget => TextureLayout::ColorAttachment,
            ResourceUsage::DepthStencilWrite => TextureLayout::DepthStencilAttachment,
            ResourceUsage::DepthStencilRead => TextureLayout::DepthStencilReadOnly,
            ResourceUsage::CopySrc => TextureLayout::TransferSrc,
            ResourceUsage::CopyDst => TextureLayout::TransferDst,
        }
    }
}

/// Resource access declaration for a pass
#[derive(Debug, Clone)]
pub struct ResourceAccess {
    pub resource: ResourceId,
    pub usage: ResourceUsage,
}

/// Describes texture dimensions that can be relative to screen size
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TextureSize {
    /// Absolute size in pixels
    Absolute { width: u32, height: u32 },
    /// Relative to screen size (1.0 = full screen)
    Relative { width_scale: f32, height_scale: f32 },
}

impl Default for TextureSize {
    fn default() -> Self {
        TextureSize::Relative {
            width_scale: 1.0,
            height_scale: 1.0,
        }
    }
}

impl TextureSize {
    pub fn square(size: u32) -> Self {
        TextureSize::Absolute {
            width: size,
            height: size,
        }
    }

    pub fn is_relative(&self) -> bool {
        matches!(self, TextureSize::Relative { .. })
    }

    /// True when some dimension is zero at every screen size
    pub fn is_empty(&self) -> bool {
        match *self {
            TextureSize::Absolute { width, height } => width == 0 || height == 0,
            TextureSize::Relative {
                width_scale,
                height_scale,
            } => width_scale <= 0.0 || height_scale <= 0.0,
        }
    }

    /// Resolve to pixels; never returns a zero dimension
    pub fn resolve(&self, screen_width: u32, screen_height: u32) -> (u32, u32) {
        let (width, height) = match self {
            TextureSize::Absolute { width, height } => (*width, *height),
            TextureSize::Relative {
                width_scale,
                height_scale,
            } => (
                ((screen_width as f32) * width_scale) as u32,
                ((screen_height as f32) * height_scale) as u32,
            ),
        };
        (width.max(1), height.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_size() {
        let size = TextureSize::Relative {
            width_scale: 0.5,
            height_scale: 0.25,
        };
        assert_eq!(size.resolve(800, 600), (400, 150));
        assert_eq!(size.resolve(1, 1), (1, 1));
    }

    #[test]
    fn test_absolute_size_ignores_screen() {
        assert_eq!(TextureSize::square(2048).resolve(800, 600), (2048, 2048));
        assert!(!TextureSize::square(2048).is_relative());
    }

    #[test]
    fn test_empty_sizes() {
        assert!(TextureSize::square(0).is_empty());
        assert!(TextureSize::Relative {
            width_scale: 1.0,
            height_scale: 0.0
        }
        .is_empty());
        assert!(!TextureSize::default().is_empty());
    }

    #[test]
    fn test_usage_layouts() {
        assert_eq!(
            ResourceUsage::TextureRead.layout(),
            TextureLayout::ShaderReadOnly
        );
        assert_eq!(
            ResourceUsage::DepthStencilRead.layout(),
            TextureLayout::DepthStencilReadOnly
        );
    }
}
