//! Deferred shading with shadow mapping
//!
//! The frame is built from four passes:
//! 1. Shadow pass - scene depth from the light into the shadow map
//! 2. G-Buffer pass - world coordinates and normals of visible surfaces
//! 3. Lighting pass - full-screen composite into the swapchain
//! 4. Quad pass - optional overlay of the shadow map

pub mod gbuffer_pass;
pub mod lighting_pass;
pub mod quad_pass;
pub mod shaders;
pub mod shadow_pass;

pub use gbuffer_pass::GBufferPass;
pub use lighting_pass::LightingPass;
pub use quad_pass::QuadPass;
pub use shaders::builtin_shaders;
pub use shadow_pass::ShadowPass;

use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::render_graph::{GraphError, GraphResult, RenderGraph, ResourceId};
use crate::scene::SceneManager;
use crate::RendererConfig;

pub const SWAPCHAIN: &str = "swapchain";
pub const SHADOW_MAP: &str = "shadow_map";
pub const G_BUFFER_COORDS: &str = "g_buffer_coords";
pub const G_BUFFER_NORMALS: &str = "g_buffer_normals";
pub const G_BUFFER_DEPTH: &str = "g_buffer_depth";

/// Per-draw push constants of the scene passes
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct PushConstants {
    pub proj_view: Mat4,
    pub model: Mat4,
}

pub const PUSH_CONSTANTS_SIZE: u32 = std::mem::size_of::<PushConstants>() as u32;

pub(crate) fn scene_push_constants() -> PushConstantRange {
    PushConstantRange {
        stages: ShaderStageFlags::VERTEX,
        offset: 0,
        size: PUSH_CONSTANTS_SIZE,
    }
}

/// Bind the merged scene buffers and draw every instance with `proj_view`
pub fn draw_scene(
    backend: &mut dyn GraphicsBackend,
    scene: &SceneManager,
    proj_view: Mat4,
) -> BackendResult<()> {
    let buffers = scene
        .buffers()
        .ok_or_else(|| BackendError::InvalidHandle("scene geometry is not uploaded".into()))?;

    backend.set_vertex_buffer(0, buffers.vertex, 0);
    backend.set_index_buffer(buffers.index, 0, IndexFormat::Uint32);

    for (mesh, model) in scene.instances() {
        let constants = PushConstants { proj_view, model };
        backend.set_push_constants(ShaderStageFlags::VERTEX, 0, bytemuck::bytes_of(&constants));
        backend.draw_indexed(
            mesh.index_offset..mesh.index_offset + mesh.index_count,
            mesh.vertex_offset,
            0..1,
        );
    }
    Ok(())
}

/// Resource set by `setup`, or an error naming the pass
pub(crate) fn declared(resource: Option<ResourceId>, pass: &str) -> BackendResult<ResourceId> {
    resource.ok_or_else(|| {
        BackendError::CommandRecordingFailed(format!("{} executed before setup", pass))
    })
}

/// Resources of the shadow mapping graph
#[derive(Debug, Clone, Copy)]
pub struct ShadowmapResources {
    pub swapchain: ResourceId,
    pub shadow_map: ResourceId,
    pub g_buffer_coords: ResourceId,
    pub g_buffer_normals: ResourceId,
    pub g_buffer_depth: ResourceId,
}

/// Build the shadow mapping render graph.
///
/// The debug quad pass is always part of the graph; it skips drawing when
/// [`FrameData::draw_debug_quad`](crate::scene::FrameData) is off.
pub fn build_shadowmap_graph(
    config: &RendererConfig,
    swapchain_format: TextureFormat,
) -> GraphResult<(RenderGraph, ShadowmapResources)> {
    let mut graph = RenderGraph::new();

    let swapchain = graph.register_external(
        SWAPCHAIN,
        swapchain_format,
        TextureUsage::RENDER_ATTACHMENT,
        true,
    )?;

    graph.add_pass(ShadowPass::new(config.shadow_map_size))?;
    graph.add_pass(GBufferPass::new())?;
    graph.add_pass(LightingPass::new())?;
    graph.add_pass(QuadPass::new())?;

    let find = |name: &str| {
        graph
            .find_resource(name)
            .ok_or_else(|| GraphError::UnknownResource(name.to_string()))
    };
    let resources = ShadowmapResources {
        swapchain,
        shadow_map: find(SHADOW_MAP)?,
        g_buffer_coords: find(G_BUFFER_COORDS)?,
        g_buffer_normals: find(G_BUFFER_NORMALS)?,
        g_buffer_depth: find(G_BUFFER_DEPTH)?,
    };

    Ok((graph, resources))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{HeadlessBackend, RecordedCommand};
    use crate::backend::layout::TextureLayout;
    use crate::resources::Mesh;

    #[test]
    fn test_push_constants_size() {
        assert_eq!(PUSH_CONSTANTS_SIZE, 128);
    }

    #[test]
    fn test_graph_order_and_layouts() {
        let (graph, resources) =
            build_shadowmap_graph(&RendererConfig::default(), TextureFormat::Bgra8UnormSrgb)
                .unwrap();
        let compiled = graph.compile().unwrap();

        let order: Vec<&str> = compiled
            .pass_order
            .iter()
            .map(|&id| graph.get_pass_node(id).unwrap().name.as_str())
            .collect();
        assert_eq!(order, ["Shadow Pass", "G-Buffer Pass", "Lighting Pass", "Quad Pass"]);

        use TextureLayout::*;
        assert_eq!(
            compiled.layout_sequence(resources.shadow_map),
            [Undefined, DepthStencilAttachment, ShaderReadOnly]
        );
        assert_eq!(
            compiled.layout_sequence(resources.g_buffer_coords),
            [Undefined, ColorAttachment, ShaderReadOnly]
        );
        assert_eq!(
            compiled.layout_sequence(resources.g_buffer_depth),
            [Undefined, DepthStencilAttachment, DepthStencilReadOnly]
        );
        assert_eq!(
            compiled.layout_sequence(resources.swapchain),
            [Undefined, ColorAttachment, PresentSrc]
        );
    }

    #[test]
    fn test_shadow_map_size_follows_config() {
        let config = RendererConfig::default().with_shadow_map_size(1024);
        let (graph, resources) =
            build_shadowmap_graph(&config, TextureFormat::Bgra8UnormSrgb).unwrap();
        let crate::render_graph::VirtualResource::Texture(texture) =
            graph.resource(resources.shadow_map).unwrap()
        else {
            panic!("shadow map should be graph owned");
        };
        assert_eq!(texture.descriptor(640, 480).width, 1024);
        assert_eq!(texture.format, TextureFormat::Depth16Unorm);
    }

    #[test]
    fn test_zero_shadow_map_size_is_rejected() {
        let config = RendererConfig::default().with_shadow_map_size(0);
        let result = build_shadowmap_graph(&config, TextureFormat::Bgra8UnormSrgb);
        assert!(matches!(result, Err(GraphError::ZeroSizedTexture(name)) if name == SHADOW_MAP));
    }

    #[test]
    fn test_draw_scene_pushes_per_instance() {
        let mut backend = HeadlessBackend::new(8, 8);
        let mut scene = SceneManager::new();
        let cube = scene.add_mesh(&Mesh::cube());
        let plane = scene.add_mesh(&Mesh::plane(1.0, 1.0, 1));
        scene.add_instance(plane, Mat4::IDENTITY).unwrap();
        scene
            .add_instance(cube, Mat4::from_scale(glam::Vec3::splat(2.0)))
            .unwrap();
        scene.upload(&mut backend).unwrap();

        backend.begin_frame().unwrap();
        draw_scene(&mut backend, &scene, Mat4::IDENTITY).unwrap();

        let draws: Vec<_> = backend
            .current_commands()
            .iter()
            .filter_map(|c| match c {
                RecordedCommand::DrawIndexed {
                    indices,
                    base_vertex,
                    ..
                } => Some((indices.clone(), *base_vertex)),
                _ => None,
            })
            .collect();
        assert_eq!(draws, [(36..42, 24), (0..36, 0)]);

        let pushes = backend
            .current_commands()
            .iter()
            .filter(|c| matches!(c, RecordedCommand::SetPushConstants { data, .. } if data.len() == 128))
            .count();
        assert_eq!(pushes, 2);
    }

    #[test]
    fn test_draw_scene_requires_upload() {
        let mut backend = HeadlessBackend::new(8, 8);
        let scene = SceneManager::demo_scene();
        assert!(draw_scene(&mut backend, &scene, Mat4::IDENTITY).is_err());
    }
}
