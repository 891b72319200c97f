//! Layout transitions as Vulkan image memory barriers.
//!
//! The render graph plans every transition ahead of time; this module only
//! turns a list of planned transitions into one `vkCmdPipelineBarrier` call.

use ash::vk;

use crate::backend::layout::TextureLayout;

impl TextureLayout {
    /// Convert to Vulkan image layout.
    pub fn to_vk(self) -> vk::ImageLayout {
        match self {
            Self::Undefined => vk::ImageLayout::UNDEFINED,
            Self::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            Self::DepthStencilAttachment => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            Self::DepthStencilReadOnly => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            Self::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Self::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            Self::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            Self::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
            Self::General => vk::ImageLayout::GENERAL,
        }
    }

    /// Accesses that must complete before leaving this layout.
    pub fn src_access_mask(self) -> vk::AccessFlags {
        match self {
            Self::Undefined | Self::PresentSrc => vk::AccessFlags::empty(),
            Self::ColorAttachment => vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            Self::DepthStencilAttachment => vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            Self::DepthStencilReadOnly => vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
            Self::ShaderReadOnly => vk::AccessFlags::SHADER_READ,
            Self::TransferSrc => vk::AccessFlags::TRANSFER_READ,
            Self::TransferDst => vk::AccessFlags::TRANSFER_WRITE,
            Self::General => vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
        }
    }

    /// Accesses that wait for the transition into this layout.
    pub fn dst_access_mask(self) -> vk::AccessFlags {
        match self {
            Self::Undefined | Self::PresentSrc => vk::AccessFlags::empty(),
            Self::ColorAttachment => {
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            }
            Self::DepthStencilAttachment => {
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
            }
            Self::DepthStencilReadOnly => vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
            Self::ShaderReadOnly => vk::AccessFlags::SHADER_READ,
            Self::TransferSrc => vk::AccessFlags::TRANSFER_READ,
            Self::TransferDst => vk::AccessFlags::TRANSFER_WRITE,
            Self::General => vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
        }
    }

    pub fn src_stage(self) -> vk::PipelineStageFlags {
        match self {
            Self::Undefined => vk::PipelineStageFlags::TOP_OF_PIPE,
            Self::ColorAttachment => vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            Self::DepthStencilAttachment => vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            Self::DepthStencilReadOnly => {
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
            }
            Self::ShaderReadOnly => vk::PipelineStageFlags::FRAGMENT_SHADER,
            Self::TransferSrc | Self::TransferDst => vk::PipelineStageFlags::TRANSFER,
            Self::PresentSrc => vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            Self::General => vk::PipelineStageFlags::FRAGMENT_SHADER,
        }
    }

    pub fn dst_stage(self) -> vk::PipelineStageFlags {
        match self {
            Self::Undefined => vk::PipelineStageFlags::TOP_OF_PIPE,
            Self::ColorAttachment => vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            Self::DepthStencilAttachment | Self::DepthStencilReadOnly => {
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
            }
            Self::ShaderReadOnly => vk::PipelineStageFlags::FRAGMENT_SHADER,
            Self::TransferSrc | Self::TransferDst => vk::PipelineStageFlags::TRANSFER,
            Self::PresentSrc => vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            Self::General => vk::PipelineStageFlags::FRAGMENT_SHADER,
        }
    }
}

/// Image barriers submitted together as a single pipeline barrier.
#[derive(Debug, Default)]
pub struct BarrierBatch {
    image_barriers: Vec<vk::ImageMemoryBarrier<'static>>,
    src_stage_mask: vk::PipelineStageFlags,
    dst_stage_mask: vk::PipelineStageFlags,
}

impl BarrierBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an image layout transition. Transitions to the same layout are skipped.
    pub fn add_image_barrier(
        &mut self,
        image: vk::Image,
        aspect_mask: vk::ImageAspectFlags,
        old_layout: TextureLayout,
        new_layout: TextureLayout,
    ) {
        if old_layout == new_layout {
            return;
        }

        self.image_barriers.push(
            vk::ImageMemoryBarrier::default()
                .old_layout(old_layout.to_vk())
                .new_layout(new_layout.to_vk())
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask,
                    base_mip_level: 0,
                    level_count: vk::REMAINING_MIP_LEVELS,
                    base_array_layer: 0,
                    layer_count: vk::REMAINING_ARRAY_LAYERS,
                })
                .src_access_mask(old_layout.src_access_mask())
                .dst_access_mask(new_layout.dst_access_mask()),
        );
        self.src_stage_mask |= old_layout.src_stage();
        self.dst_stage_mask |= new_layout.dst_stage();
    }

    pub fn is_empty(&self) -> bool {
        self.image_barriers.is_empty()
    }

    /// Record all barriers. Does nothing if the batch is empty.
    pub fn submit(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        if self.is_empty() {
            return;
        }

        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                self.src_stage_mask,
                self.dst_stage_mask,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &self.image_barriers,
            );
        }
    }
}

/// Aspect flags of a view over an image of `format`.
pub fn aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT => vk::ImageAspectFlags::DEPTH,
        vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_texture_layout_to_vk() {
        assert_eq!(TextureLayout::Undefined.to_vk(), vk::ImageLayout::UNDEFINED);
        assert_eq!(
            TextureLayout::DepthStencilReadOnly.to_vk(),
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        );
        assert_eq!(
            TextureLayout::ShaderReadOnly.to_vk(),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        assert_eq!(TextureLayout::PresentSrc.to_vk(), vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn test_same_layout_is_skipped() {
        let mut batch = BarrierBatch::new();
        batch.add_image_barrier(
            vk::Image::null(),
            vk::ImageAspectFlags::COLOR,
            TextureLayout::ShaderReadOnly,
            TextureLayout::ShaderReadOnly,
        );
        assert!(batch.is_empty());
    }

    #[test]
    fn test_batch_merges_stages() {
        let mut batch = BarrierBatch::new();
        batch.add_image_barrier(
            vk::Image::null(),
            vk::ImageAspectFlags::DEPTH,
            TextureLayout::DepthStencilAttachment,
            TextureLayout::ShaderReadOnly,
        );
        batch.add_image_barrier(
            vk::Image::null(),
            vk::ImageAspectFlags::COLOR,
            TextureLayout::ColorAttachment,
            TextureLayout::PresentSrc,
        );
        assert_eq!(batch.image_barriers.len(), 2);
        assert!(batch
            .src_stage_mask
            .contains(vk::PipelineStageFlags::LATE_FRAGMENT_TESTS));
        assert!(batch
            .dst_stage_mask
            .contains(vk::PipelineStageFlags::BOTTOM_OF_PIPE));
    }

    #[test]
    fn test_depth_aspect() {
        assert_eq!(aspect_mask(vk::Format::D16_UNORM), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect_mask(vk::Format::R32G32B32A32_SFLOAT),
            vk::ImageAspectFlags::COLOR
        );
    }
}
