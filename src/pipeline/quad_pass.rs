//! Debug overlay of the shadow map

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::pipeline::shaders::QUAD_PROGRAM;
use crate::pipeline::{declared, SHADOW_MAP, SWAPCHAIN};
use crate::render_graph::pass::*;
use crate::render_graph::resource::*;
use crate::render_graph::GraphResult;

/// Maps the unit quad into the overlay viewport
pub const QUAD_SCALE_AND_OFFSET: [f32; 4] = [0.5, 0.5, -0.5, 0.5];

/// Draws the shadow map on top of the lit image inside
/// [`FrameData::debug_quad_rect`](crate::scene::FrameData).
pub struct QuadPass {
    shadow_map: Option<ResourceId>,
    output: Option<ResourceId>,

    layout: Option<BindGroupLayoutHandle>,
    pipeline: Option<RenderPipelineHandle>,
    bind_group: Option<BindGroupHandle>,
}

impl QuadPass {
    pub fn new() -> Self {
        Self {
            shadow_map: None,
            output: None,
            layout: None,
            pipeline: None,
            bind_group: None,
        }
    }
}

impl Default for QuadPass {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderPass for QuadPass {
    fn name(&self) -> &str {
        "Quad Pass"
    }

    fn setup(&mut self, ctx: &mut PassSetupContext) -> GraphResult<()> {
        let shadow_map = ctx.find(SHADOW_MAP)?;
        let output = ctx.find(SWAPCHAIN)?;

        ctx.read(shadow_map, ResourceUsage::TextureRead);
        // Loads the lit image and draws on top of it
        ctx.read_write(output, ResourceUsage::RenderTarget);

        self.shadow_map = Some(shadow_map);
        self.output = Some(output);
        Ok(())
    }

    fn prepare(&mut self, ctx: &mut PassPrepareContext) -> BackendResult<()> {
        let layout = match self.layout {
            Some(layout) => layout,
            None => {
                let layout = ctx.backend.create_bind_group_layout(&[
                    BindGroupLayoutEntry {
                        binding: 0,
                        visibility: ShaderStageFlags::FRAGMENT,
                        ty: BindingType::Texture {
                            sample_type: TextureSampleType::Depth,
                        },
                    },
                    BindGroupLayoutEntry {
                        binding: 1,
                        visibility: ShaderStageFlags::FRAGMENT,
                        ty: BindingType::Sampler { filtering: false },
                    },
                ])?;
                self.layout = Some(layout);
                layout
            }
        };

        if self.pipeline.is_none() {
            let program = ctx.shaders.get(QUAD_PROGRAM)?;
            let pipeline = ctx.backend.create_render_pipeline(&RenderPipelineDescriptor {
                label: Some("quad_pipeline".into()),
                vertex_shader: program.vertex.clone(),
                fragment_shader: program.fragment.clone(),
                vertex_layouts: Vec::new(),
                bind_group_layouts: vec![layout],
                push_constant_ranges: vec![PushConstantRange {
                    stages: ShaderStageFlags::VERTEX,
                    offset: 0,
                    size: std::mem::size_of_val(&QUAD_SCALE_AND_OFFSET) as u32,
                }],
                primitive_topology: PrimitiveTopology::TriangleList,
                front_face: FrontFace::Ccw,
                cull_mode: CullMode::None,
                depth_stencil: None,
                color_targets: vec![ColorTargetState {
                    format: ctx.swapchain_format,
                    write_mask: ColorWrites::ALL,
                }],
            })?;
            self.pipeline = Some(pipeline);
        }

        if let Some(old) = self.bind_group.take() {
            ctx.backend.destroy_bind_group(old);
        }
        let shadow_map = ctx.texture(declared(self.shadow_map, "Quad Pass")?)?;
        self.bind_group = Some(ctx.backend.create_bind_group(
            layout,
            &[
                (0, BindGroupEntry::Texture(shadow_map)),
                (1, BindGroupEntry::Sampler(ctx.shared.sampler)),
            ],
        )?);
        Ok(())
    }

    fn execute(&self, ctx: &mut PassExecuteContext) -> BackendResult<()> {
        if !ctx.frame.draw_debug_quad {
            return Ok(());
        }

        let rect = ctx.frame.debug_quad_rect;
        let width = rect.width.min(ctx.width.saturating_sub(rect.x));
        let height = rect.height.min(ctx.height.saturating_sub(rect.y));
        if width == 0 || height == 0 {
            log::trace!("Debug quad {:?} is outside the screen", rect);
            return Ok(());
        }

        let output = ctx.texture(declared(self.output, self.name())?)?;
        let (Some(pipeline), Some(bind_group)) = (self.pipeline, self.bind_group) else {
            return Err(BackendError::CommandRecordingFailed(
                "quad pass not prepared".into(),
            ));
        };

        ctx.backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("Quad Pass".into()),
            color_attachments: vec![ColorAttachment {
                view: output,
                load_op: LoadOp::Load,
                store_op: StoreOp::Store,
            }],
            depth_stencil_attachment: None,
        })?;

        ctx.backend.set_viewport(
            rect.x as f32,
            rect.y as f32,
            width as f32,
            height as f32,
            0.0,
            1.0,
        );
        ctx.backend.set_scissor_rect(rect.x, rect.y, width, height);
        ctx.backend.set_render_pipeline(pipeline);
        ctx.backend.set_bind_group(0, bind_group);
        ctx.backend.set_push_constants(
            ShaderStageFlags::VERTEX,
            0,
            bytemuck::cast_slice(&QUAD_SCALE_AND_OFFSET),
        );
        ctx.backend.draw(0..6, 0..1);

        ctx.backend.end_render_pass()
    }

    fn release(&mut self, backend: &mut dyn GraphicsBackend) {
        if let Some(bind_group) = self.bind_group.take() {
            backend.destroy_bind_group(bind_group);
        }
        if let Some(pipeline) = self.pipeline.take() {
            backend.destroy_render_pipeline(pipeline);
        }
        if let Some(layout) = self.layout.take() {
            backend.destroy_bind_group_layout(layout);
        }
    }
}
