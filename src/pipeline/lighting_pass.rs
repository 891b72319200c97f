//! Deferred lighting pass
//!
//! Full-screen composite into the swapchain. Reads world coordinates and
//! normals from the G-buffer, tests them against the shadow map and keeps
//! the G-buffer depth bound read-only.

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::pipeline::gbuffer_pass::G_BUFFER_DEPTH_FORMAT;
use crate::pipeline::shaders::LIGHTING_PROGRAM;
use crate::pipeline::{
    declared, G_BUFFER_COORDS, G_BUFFER_DEPTH, G_BUFFER_NORMALS, SHADOW_MAP, SWAPCHAIN,
};
use crate::render_graph::pass::*;
use crate::render_graph::resource::*;
use crate::render_graph::GraphResult;

/// Deferred lighting pass
pub struct LightingPass {
    shadow_map: Option<ResourceId>,
    normals: Option<ResourceId>,
    coords: Option<ResourceId>,
    depth: Option<ResourceId>,
    output: Option<ResourceId>,

    layout: Option<BindGroupLayoutHandle>,
    pipeline: Option<RenderPipelineHandle>,
    bind_group: Option<BindGroupHandle>,
}

impl LightingPass {
    pub fn new() -> Self {
        Self {
            shadow_map: None,
            normals: None,
            coords: None,
            depth: None,
            output: None,
            layout: None,
            pipeline: None,
            bind_group: None,
        }
    }

    fn bind_group_layout(backend: &mut dyn GraphicsBackend) -> BackendResult<BindGroupLayoutHandle> {
        let unfilterable = BindingType::Texture {
            sample_type: TextureSampleType::Float { filterable: false },
        };
        backend.create_bind_group_layout(&[
            BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::UniformBuffer,
            },
            BindGroupLayoutEntry {
                binding: 1,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::Texture {
                    sample_type: TextureSampleType::Depth,
                },
            },
            BindGroupLayoutEntry {
                binding: 2,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: unfilterable.clone(),
            },
            BindGroupLayoutEntry {
                binding: 3,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: unfilterable,
            },
            BindGroupLayoutEntry {
                binding: 4,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::Sampler { filtering: false },
            },
        ])
    }
}

impl Default for LightingPass {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderPass for LightingPass {
    fn name(&self) -> &str {
        "Lighting Pass"
    }

    fn setup(&mut self, ctx: &mut PassSetupContext) -> GraphResult<()> {
        let shadow_map = ctx.find(SHADOW_MAP)?;
        let normals = ctx.find(G_BUFFER_NORMALS)?;
        let coords = ctx.find(G_BUFFER_COORDS)?;
        let depth = ctx.find(G_BUFFER_DEPTH)?;
        let output = ctx.find(SWAPCHAIN)?;

        ctx.read(shadow_map, ResourceUsage::TextureRead);
        ctx.read(normals, ResourceUsage::TextureRead);
        ctx.read(coords, ResourceUsage::TextureRead);
        ctx.read(depth, ResourceUsage::DepthStencilRead);
        ctx.write(output, ResourceUsage::RenderTarget);

        self.shadow_map = Some(shadow_map);
        self.normals = Some(normals);
        self.coords = Some(coords);
        self.depth = Some(depth);
        self.output = Some(output);
        Ok(())
    }

    fn prepare(&mut self, ctx: &mut PassPrepareContext) -> BackendResult<()> {
        let layout = match self.layout {
            Some(layout) => layout,
            None => {
                let layout = Self::bind_group_layout(&mut *ctx.backend)?;
                self.layout = Some(layout);
                layout
            }
        };

        if self.pipeline.is_none() {
            let program = ctx.shaders.get(LIGHTING_PROGRAM)?;
            let pipeline = ctx.backend.create_render_pipeline(&RenderPipelineDescriptor {
                label: Some("lighting_pipeline".into()),
                vertex_shader: program.vertex.clone(),
                fragment_shader: program.fragment.clone(),
                vertex_layouts: Vec::new(),
                bind_group_layouts: vec![layout],
                push_constant_ranges: Vec::new(),
                primitive_topology: PrimitiveTopology::TriangleList,
                front_face: FrontFace::Ccw,
                cull_mode: CullMode::None,
                depth_stencil: Some(DepthStencilState {
                    format: G_BUFFER_DEPTH_FORMAT,
                    depth_write_enabled: false,
                    depth_compare: CompareFunction::Always,
                }),
                color_targets: vec![ColorTargetState {
                    format: ctx.swapchain_format,
                    write_mask: ColorWrites::ALL,
                }],
            })?;
            self.pipeline = Some(pipeline);
        }

        // Views change whenever screen-sized textures are reallocated
        if let Some(old) = self.bind_group.take() {
            ctx.backend.destroy_bind_group(old);
        }
        let entries = [
            (
                0,
                BindGroupEntry::Buffer {
                    buffer: ctx.shared.constants,
                    offset: 0,
                    size: None,
                },
            ),
            (1, BindGroupEntry::Texture(ctx.texture(declared(self.shadow_map, "Lighting Pass")?)?)),
            (2, BindGroupEntry::Texture(ctx.texture(declared(self.normals, "Lighting Pass")?)?)),
            (3, BindGroupEntry::Texture(ctx.texture(declared(self.coords, "Lighting Pass")?)?)),
            (4, BindGroupEntry::Sampler(ctx.shared.sampler)),
        ];
        self.bind_group = Some(ctx.backend.create_bind_group(layout, &entries)?);
        Ok(())
    }

    fn execute(&self, ctx: &mut PassExecuteContext) -> BackendResult<()> {
        let output = ctx.texture(declared(self.output, self.name())?)?;
        let depth = ctx.texture(declared(self.depth, self.name())?)?;
        let (Some(pipeline), Some(bind_group)) = (self.pipeline, self.bind_group) else {
            return Err(BackendError::CommandRecordingFailed(
                "lighting pass not prepared".into(),
            ));
        };

        ctx.backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("Lighting Pass".into()),
            color_attachments: vec![ColorAttachment {
                view: output,
                load_op: LoadOp::Clear([0.0, 0.0, 0.0, 1.0]),
                store_op: StoreOp::Store,
            }],
            depth_stencil_attachment: Some(DepthStencilAttachment {
                view: depth,
                depth_load_op: LoadOp::Load,
                depth_store_op: StoreOp::Store,
                depth_clear_value: 1.0,
                read_only: true,
            }),
        })?;

        ctx.backend
            .set_viewport(0.0, 0.0, ctx.width as f32, ctx.height as f32, 0.0, 1.0);
        ctx.backend.set_scissor_rect(0, 0, ctx.width, ctx.height);
        ctx.backend.set_render_pipeline(pipeline);
        ctx.backend.set_bind_group(0, bind_group);
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
