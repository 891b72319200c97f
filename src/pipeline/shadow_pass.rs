//! Shadow map generation
//!
//! Renders the depth of every scene instance from the light's point of view
//! into a square D16 texture that later passes sample.

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::pipeline::shaders::SHADOW_PROGRAM;
use crate::pipeline::{declared, draw_scene, scene_push_constants, SHADOW_MAP};
use crate::render_graph::pass::*;
use crate::render_graph::resource::*;
use crate::render_graph::GraphResult;

pub const SHADOW_MAP_FORMAT: TextureFormat = TextureFormat::Depth16Unorm;

pub struct ShadowPass {
    size: u32,
    shadow_map: Option<ResourceId>,
    pipeline: Option<RenderPipelineHandle>,
}

impl ShadowPass {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            shadow_map: None,
            pipeline: None,
        }
    }

    pub fn shadow_map(&self) -> Option<ResourceId> {
        self.shadow_map
    }
}

impl RenderPass for ShadowPass {
    fn name(&self) -> &str {
        "Shadow Pass"
    }

    fn setup(&mut self, ctx: &mut PassSetupContext) -> GraphResult<()> {
        let shadow_map = ctx.create_texture(
            SHADOW_MAP,
            TextureSize::square(self.size),
            SHADOW_MAP_FORMAT,
            TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
        )?;
        ctx.write(shadow_map, ResourceUsage::DepthStencilWrite);
        self.shadow_map = Some(shadow_map);
        Ok(())
    }

    fn prepare(&mut self, ctx: &mut PassPrepareContext) -> BackendResult<()> {
        if self.pipeline.is_some() {
            return Ok(());
        }

        let program = ctx.shaders.get(SHADOW_PROGRAM)?;
        let pipeline = ctx.backend.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("shadow_pipeline".into()),
            vertex_shader: program.vertex.clone(),
            fragment_shader: None,
            vertex_layouts: vec![Vertex::layout()],
            bind_group_layouts: Vec::new(),
            push_constant_ranges: vec![scene_push_constants()],
            primitive_topology: PrimitiveTopology::TriangleList,
            front_face: FrontFace::Ccw,
            cull_mode: CullMode::None,
            depth_stencil: Some(DepthStencilState {
                format: SHADOW_MAP_FORMAT,
                depth_write_enabled: true,
                depth_compare: CompareFunction::Less,
            }),
            color_targets: Vec::new(),
        })?;
        self.pipeline = Some(pipeline);
        Ok(())
    }

    fn execute(&self, ctx: &mut PassExecuteContext) -> BackendResult<()> {
        let view = ctx.texture(declared(self.shadow_map, self.name())?)?;
        let pipeline = self.pipeline.ok_or_else(|| {
            BackendError::CommandRecordingFailed("shadow pipeline not prepared".into())
        })?;

        ctx.backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("Shadow Pass".into()),
            color_attachments: Vec::new(),
            depth_stencil_attachment: Some(DepthStencilAttachment {
                view,
                depth_load_op: LoadOp::Clear([1.0, 0.0, 0.0, 0.0]),
                depth_store_op: StoreOp::Store,
                depth_clear_value: 1.0,
                read_only: false,
            }),
        })?;

        let size = self.size as f32;
        ctx.backend.set_viewport(0.0, 0.0, size, size, 0.0, 1.0);
        ctx.backend.set_scissor_rect(0, 0, self.size, self.size);
        ctx.backend.set_render_pipeline(pipeline);
        draw_scene(&mut *ctx.backend, ctx.scene, ctx.frame.light_matrix)?;

        ctx.backend.end_render_pass()
    }

    fn release(&mut self, backend: &mut dyn GraphicsBackend) {
        if let Some(pipeline) = self.pipeline.take() {
            backend.destroy_render_pipeline(pipeline);
        }
    }
}
