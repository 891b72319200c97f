//! G-Buffer generation pass for deferred shading
//!
//! Renders geometry to two RGBA32F render targets plus depth:
//! - World-space coordinates (w = 1 where geometry was drawn)
//! - World-space normals
//! - D32 depth, later bound read-only by the lighting pass

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::pipeline::shaders::G_BUFFER_PROGRAM;
use crate::pipeline::{
    declared, draw_scene, scene_push_constants, G_BUFFER_COORDS, G_BUFFER_DEPTH, G_BUFFER_NORMALS,
};
use crate::render_graph::pass::*;
use crate::render_graph::resource::*;
use crate::render_graph::GraphResult;

pub const G_BUFFER_COLOR_FORMAT: TextureFormat = TextureFormat::Rgba32Float;
pub const G_BUFFER_DEPTH_FORMAT: TextureFormat = TextureFormat::Depth32Float;

/// G-Buffer generation pass for deferred shading
pub struct GBufferPass {
    coords: Option<ResourceId>,
    normals: Option<ResourceId>,
    depth: Option<ResourceId>,
    pipeline: Option<RenderPipelineHandle>,
}

impl GBufferPass {
    pub fn new() -> Self {
        Self {
            coords: None,
            normals: None,
            depth: None,
            pipeline: None,
        }
    }
}

impl Default for GBufferPass {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderPass for GBufferPass {
    fn name(&self) -> &str {
        "G-Buffer Pass"
    }

    fn setup(&mut self, ctx: &mut PassSetupContext) -> GraphResult<()> {
        let full_screen = TextureSize::Relative {
            width_scale: 1.0,
            height_scale: 1.0,
        };

        let coords = ctx.create_texture(
            G_BUFFER_COORDS,
            full_screen,
            G_BUFFER_COLOR_FORMAT,
            TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
        )?;
        ctx.write(coords, ResourceUsage::RenderTarget);

        let normals = ctx.create_texture(
            G_BUFFER_NORMALS,
            full_screen,
            G_BUFFER_COLOR_FORMAT,
            TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
        )?;
        ctx.write(normals, ResourceUsage::RenderTarget);

        let depth = ctx.create_texture(
            G_BUFFER_DEPTH,
            full_screen,
            G_BUFFER_DEPTH_FORMAT,
            TextureUsage::RENDER_ATTACHMENT,
        )?;
        ctx.write(depth, ResourceUsage::DepthStencilWrite);

        self.coords = Some(coords);
        self.normals = Some(normals);
        self.depth = Some(depth);
        Ok(())
    }

    fn prepare(&mut self, ctx: &mut PassPrepareContext) -> BackendResult<()> {
        if self.pipeline.is_some() {
            return Ok(());
        }

        let program = ctx.shaders.get(G_BUFFER_PROGRAM)?;
        let target = ColorTargetState {
            format: G_BUFFER_COLOR_FORMAT,
            write_mask: ColorWrites::ALL,
        };
        let pipeline = ctx.backend.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("g_buffer_pipeline".into()),
            vertex_shader: program.vertex.clone(),
            fragment_shader: program.fragment.clone(),
            vertex_layouts: vec![Vertex::layout()],
            bind_group_layouts: Vec::new(),
            push_constant_ranges: vec![scene_push_constants()],
            primitive_topology: PrimitiveTopology::TriangleList,
            front_face: FrontFace::Ccw,
            cull_mode: CullMode::None,
            depth_stencil: Some(DepthStencilState {
                format: G_BUFFER_DEPTH_FORMAT,
                depth_write_enabled: true,
                depth_compare: CompareFunction::Less,
            }),
            // Location 0: coords, location 1: normals
            color_targets: vec![target.clone(), target],
        })?;
        self.pipeline = Some(pipeline);
        Ok(())
    }

    fn execute(&self, ctx: &mut PassExecuteContext) -> BackendResult<()> {
        let coords = ctx.texture(declared(self.coords, self.name())?)?;
        let normals = ctx.texture(declared(self.normals, self.name())?)?;
        let depth = ctx.texture(declared(self.depth, self.name())?)?;
        let pipeline = self.pipeline.ok_or_else(|| {
            BackendError::CommandRecordingFailed("G-buffer pipeline not prepared".into())
        })?;

        let clear = |view| ColorAttachment {
            view,
            load_op: LoadOp::Clear([0.0, 0.0, 0.0, 0.0]),
            store_op: StoreOp::Store,
        };
        ctx.backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("G-Buffer Pass".into()),
            color_attachments: vec![clear(coords), clear(normals)],
            depth_stencil_attachment: Some(DepthStencilAttachment {
                view: depth,
                depth_load_op: LoadOp::Clear([1.0, 0.0, 0.0, 0.0]),
                depth_store_op: StoreOp::Store,
                depth_clear_value: 1.0,
                read_only: false,
            }),
        })?;

        ctx.backend
            .set_viewport(0.0, 0.0, ctx.width as f32, ctx.height as f32, 0.0, 1.0);
        ctx.backend.set_scissor_rect(0, 0, ctx.width, ctx.height);
        ctx.backend.set_render_pipeline(pipeline);
        draw_scene(&mut *ctx.backend, ctx.scene, ctx.frame.world_view_proj)?;

        ctx.backend.end_render_pass()
    }

    fn release(&mut self, backend: &mut dyn GraphicsBackend) {
        if let Some(pipeline) = self.pipeline.take() {
            backend.destroy_render_pipeline(pipeline);
        }
    }
}
