//! Texture layout states and the transitions a texture may take between them.
//!
//! Layouts are tracked by the render graph at compile time. Backends that
//! need explicit synchronization (Vulkan) translate each transition into an
//! image memory barrier; backends with implicit tracking (wgpu) ignore them.

use crate::backend::types::{TextureFormat, TextureUsage};

/// Number of distinct texture layout states.
const TEXTURE_LAYOUT_COUNT: usize = 9;

/// The state a texture's memory is in for a given kind of access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(usize)]
pub enum TextureLayout {
    /// Contents undefined. Valid source for any first write.
    #[default]
    Undefined = 0,
    ColorAttachment = 1,
    DepthStencilAttachment = 2,
    /// Depth bound for testing only, no writes.
    DepthStencilReadOnly = 3,
    /// Sampled from shaders.
    ShaderReadOnly = 4,
    TransferSrc = 5,
    TransferDst = 6,
    /// Ready to be handed to the presentation engine.
    PresentSrc = 7,
    General = 8,
}

impl TextureLayout {
    pub fn is_depth_stencil(self) -> bool {
        matches!(
            self,
            Self::DepthStencilAttachment | Self::DepthStencilReadOnly
        )
    }

    /// Whether a texture of `format` can ever be placed in this layout.
    pub fn is_compatible_with(self, format: TextureFormat) -> bool {
        match self {
            Self::ColorAttachment => !format.is_depth(),
            Self::DepthStencilAttachment | Self::DepthStencilReadOnly => format.is_depth(),
            _ => true,
        }
    }
}

/// Valid layout transitions for a texture, derived from its usage flags.
#[derive(Debug)]
pub struct TextureUsageGraph {
    usage: TextureUsage,
    /// Indexed by `TextureLayout as usize`.
    transitions: [[bool; TEXTURE_LAYOUT_COUNT]; TEXTURE_LAYOUT_COUNT],
}

impl TextureUsageGraph {
    /// Build the transition table for textures created with `usage`.
    ///
    /// `presentable` marks swapchain images, the only textures allowed to
    /// reach [`TextureLayout::PresentSrc`].
    pub fn from_usage(usage: TextureUsage, presentable: bool) -> Self {
        use TextureLayout::*;

        let mut graph = Self {
            usage,
            transitions: [[false; TEXTURE_LAYOUT_COUNT]; TEXTURE_LAYOUT_COUNT],
        };

        let attachment = usage.contains(TextureUsage::RENDER_ATTACHMENT);
        let sampled = usage.contains(TextureUsage::TEXTURE_BINDING);
        let storage = usage.contains(TextureUsage::STORAGE_BINDING);
        let copy_src = usage.contains(TextureUsage::COPY_SRC);
        let copy_dst = usage.contains(TextureUsage::COPY_DST);

        // Every layout the texture can legally be in, per its usage.
        let mut reachable = Vec::new();
        if attachment {
            reachable.extend([ColorAttachment, DepthStencilAttachment]);
        }
        if attachment || sampled {
            reachable.push(DepthStencilReadOnly);
        }
        if sampled {
            reachable.push(ShaderReadOnly);
        }
        if storage {
            reachable.push(General);
        }
        if copy_src {
            reachable.push(TransferSrc);
        }
        if copy_dst {
            reachable.push(TransferDst);
        }
        if presentable && attachment {
            reachable.push(PresentSrc);
        }

        for &to in &reachable {
            graph.allow(Undefined, to);
            for &from in &reachable {
                graph.allow(from, to);
            }
        }

        // Presentation only follows rendering.
        if presentable {
            for from in [DepthStencilAttachment, DepthStencilReadOnly, General] {
                graph.deny(from, PresentSrc);
            }
        }

        graph
    }

    fn allow(&mut self, from: TextureLayout, to: TextureLayout) {
        self.transitions[from as usize][to as usize] = true;
    }

    fn deny(&mut self, from: TextureLayout, to: TextureLayout) {
        self.transitions[from as usize][to as usize] = false;
    }

    /// Get the usage flags this graph was created for.
    pub fn usage(&self) -> TextureUsage {
        self.usage
    }

    /// Check if a transition is valid.
    pub fn is_valid_transition(&self, from: TextureLayout, to: TextureLayout) -> bool {
        self.transitions[from as usize][to as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_graph_render_attachment() {
        let usage = TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING;
        let graph = TextureUsageGraph::from_usage(usage, false);

        assert!(
            graph.is_valid_transition(TextureLayout::Undefined, TextureLayout::ColorAttachment)
        );
        assert!(graph.is_valid_transition(
            TextureLayout::ColorAttachment,
            TextureLayout::ShaderReadOnly
        ));
        assert!(graph.is_valid_transition(
            TextureLayout::DepthStencilAttachment,
            TextureLayout::DepthStencilReadOnly
        ));
        assert!(
            !graph.is_valid_transition(TextureLayout::ColorAttachment, TextureLayout::TransferSrc)
        );
        assert!(
            !graph.is_valid_transition(TextureLayout::ColorAttachment, TextureLayout::PresentSrc)
        );
    }

    #[test]
    fn test_attachment_without_sampling() {
        let graph = TextureUsageGraph::from_usage(TextureUsage::RENDER_ATTACHMENT, false);

        assert!(!graph.is_valid_transition(
            TextureLayout::DepthStencilAttachment,
            TextureLayout::ShaderReadOnly
        ));
    }

    #[test]
    fn test_presentable() {
        let graph = TextureUsageGraph::from_usage(TextureUsage::RENDER_ATTACHMENT, true);

        assert!(graph.is_valid_transition(TextureLayout::ColorAttachment, TextureLayout::PresentSrc));
        assert!(graph.is_valid_transition(TextureLayout::PresentSrc, TextureLayout::ColorAttachment));
        assert!(!graph.is_valid_transition(
            TextureLayout::DepthStencilAttachment,
            TextureLayout::PresentSrc
        ));
    }

    #[test]
    fn test_nothing_returns_to_undefined() {
        let usage = TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING;
        let graph = TextureUsageGraph::from_usage(usage, true);

        assert!(!graph.is_valid_transition(TextureLayout::ShaderReadOnly, TextureLayout::Undefined));
    }

    #[test]
    fn test_layout_format_compatibility() {
        assert!(TextureLayout::ColorAttachment.is_compatible_with(TextureFormat::Rgba32Float));
        assert!(!TextureLayout::ColorAttachment.is_compatible_with(TextureFormat::Depth16Unorm));
        assert!(TextureLayout::DepthStencilReadOnly.is_compatible_with(TextureFormat::Depth32Float));
        assert!(TextureLayout::ShaderReadOnly.is_compatible_with(TextureFormat::Depth16Unorm));
    }
}
