//! Headless recording backend.
//!
//! Performs no GPU work. Resources are bookkept in memory and every recording
//! call is appended to the current frame's command list, so tests can inspect
//! exactly what a renderer submitted. The backend also tracks texture layouts
//! and reports a frame as failed when an attachment or sampled texture is used
//! in the wrong layout, or the swapchain image is not ready for presentation.

use crate::backend::layout::TextureLayout;
use crate::backend::traits::*;
use crate::backend::types::*;
use std::collections::HashMap;
use std::ops::Range;

/// Largest texture side accepted, the default 2D limit of wgpu devices
pub const MAX_TEXTURE_DIMENSION: u32 = 8192;

/// A command captured by the headless backend.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    Barriers(Vec<TextureBarrier>),
    BeginRenderPass {
        label: Option<String>,
        color: Vec<(TextureViewHandle, LoadOp)>,
        depth: Option<(TextureViewHandle, LoadOp, bool)>,
    },
    EndRenderPass,
    SetRenderPipeline(RenderPipelineHandle),
    SetBindGroup {
        index: u32,
        bind_group: BindGroupHandle,
    },
    SetPushConstants {
        stages: ShaderStageFlags,
        offset: u32,
        data: Vec<u8>,
    },
    SetVertexBuffer {
        slot: u32,
        buffer: BufferHandle,
        offset: u64,
    },
    SetIndexBuffer {
        buffer: BufferHandle,
        offset: u64,
        format: IndexFormat,
    },
    SetViewport {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
    },
    SetScissorRect {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
    Draw {
        vertices: Range<u32>,
        instances: Range<u32>,
    },
    DrawIndexed {
        indices: Range<u32>,
        base_vertex: i32,
        instances: Range<u32>,
    },
}

struct HeadlessTexture {
    desc: TextureDescriptor,
    layout: TextureLayout,
}

struct HeadlessBuffer {
    desc: BufferDescriptor,
    data: Vec<u8>,
}

/// Backend that records commands instead of executing them.
pub struct HeadlessBackend {
    width: u32,
    height: u32,
    format: TextureFormat,

    textures: HashMap<u64, HeadlessTexture>,
    /// View id -> texture id
    texture_views: HashMap<u64, u64>,
    buffers: HashMap<u64, HeadlessBuffer>,
    samplers: HashMap<u64, SamplerDescriptor>,
    bind_group_layouts: HashMap<u64, Vec<BindGroupLayoutEntry>>,
    bind_groups: HashMap<u64, Vec<(u32, BindGroupEntry)>>,
    pipelines: HashMap<u64, RenderPipelineDescriptor>,
    next_id: u64,

    swapchain_texture: u64,
    swapchain_view: TextureViewHandle,

    recording: bool,
    in_render_pass: bool,
    bound_groups: HashMap<u32, BindGroupHandle>,
    current: Vec<RecordedCommand>,
    last_frame: Vec<RecordedCommand>,
    errors: Vec<String>,
    frame_count: u64,
}

impl HeadlessBackend {
    /// Create a headless backend with a virtual swapchain of the given size.
    pub fn new(width: u32, height: u32) -> Self {
        let mut backend = Self {
            width: width.max(1),
            height: height.max(1),
            format: TextureFormat::Bgra8UnormSrgb,
            textures: HashMap::new(),
            texture_views: HashMap::new(),
            buffers: HashMap::new(),
            samplers: HashMap::new(),
            bind_group_layouts: HashMap::new(),
            bind_groups: HashMap::new(),
            pipelines: HashMap::new(),
            next_id: 1,
            swapchain_texture: 0,
            swapchain_view: TextureViewHandle(0),
            recording: false,
            in_render_pass: false,
            bound_groups: HashMap::new(),
            current: Vec::new(),
            last_frame: Vec::new(),
            errors: Vec::new(),
            frame_count: 0,
        };
        backend.create_swapchain();
        log::info!(
            "Headless backend created ({}x{})",
            backend.width,
            backend.height
        );
        backend
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn create_swapchain(&mut self) {
        let texture = self.alloc_id();
        self.textures.insert(
            texture,
            HeadlessTexture {
                desc: TextureDescriptor {
                    label: Some("swapchain".to_string()),
                    width: self.width,
                    height: self.height,
                    format: self.format,
                    usage: TextureUsage::RENDER_ATTACHMENT,
                },
                layout: TextureLayout::Undefined,
            },
        );
        let view = self.alloc_id();
        self.texture_views.insert(view, texture);
        self.swapchain_texture = texture;
        self.swapchain_view = TextureViewHandle(view);
    }

    fn view_texture(&self, view: TextureViewHandle) -> BackendResult<u64> {
        self.texture_views
            .get(&view.0)
            .copied()
            .ok_or_else(|| BackendError::InvalidHandle(format!("texture view {}", view.0)))
    }

    fn view_layout(&self, view: TextureViewHandle) -> Option<TextureLayout> {
        let texture = self.texture_views.get(&view.0)?;
        self.textures.get(texture).map(|t| t.layout)
    }

    fn record(&mut self, command: RecordedCommand) {
        log::trace!("HeadlessBackend: {:?}", command);
        if !self.recording {
            self.errors
                .push(format!("{:?} recorded outside of a frame", command));
        }
        self.current.push(command);
    }

    fn check_sampled_textures(&mut self) {
        let mut errors = Vec::new();
        for group in self.bound_groups.values() {
            let Some(entries) = self.bind_groups.get(&group.0) else {
                continue;
            };
            for (binding, entry) in entries {
                if let BindGroupEntry::Texture(view) = entry {
                    let layout = self.view_layout(*view);
                    if layout != Some(TextureLayout::ShaderReadOnly) {
                        errors.push(format!(
                            "binding {} sampled in layout {:?}",
                            binding, layout
                        ));
                    }
                }
            }
        }
        self.errors.extend(errors);
    }

    /// Commands recorded during the last completed frame
    pub fn last_frame_commands(&self) -> &[RecordedCommand] {
        &self.last_frame
    }

    /// Commands recorded so far in the frame in flight
    pub fn current_commands(&self) -> &[RecordedCommand] {
        &self.current
    }

    /// Number of frames submitted so far
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Current contents of a buffer
    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(&buffer.0).map(|b| b.data.as_slice())
    }

    /// Descriptor of a live texture
    pub fn texture_desc(&self, texture: TextureHandle) -> Option<&TextureDescriptor> {
        self.textures.get(&texture.0).map(|t| &t.desc)
    }

    /// Descriptor of the texture behind a view
    pub fn view_desc(&self, view: TextureViewHandle) -> Option<&TextureDescriptor> {
        let texture = self.texture_views.get(&view.0)?;
        self.textures.get(texture).map(|t| &t.desc)
    }

    /// Tracked layout of the texture behind a view
    pub fn texture_layout(&self, view: TextureViewHandle) -> Option<TextureLayout> {
        self.view_layout(view)
    }

    /// Descriptor a pipeline was created with
    pub fn pipeline_desc(&self, pipeline: RenderPipelineHandle) -> Option<&RenderPipelineDescriptor> {
        self.pipelines.get(&pipeline.0)
    }

    /// Number of live textures, the swapchain image included
    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    /// Number of live buffers
    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    /// Number of live pipelines
    pub fn live_pipelines(&self) -> usize {
        self.pipelines.len()
    }

    /// Number of live bind groups
    pub fn live_bind_groups(&self) -> usize {
        self.bind_groups.len()
    }

    /// Number of live samplers
    pub fn live_samplers(&self) -> usize {
        self.samplers.len()
    }
}

impl GraphicsBackend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "Headless"
    }

    fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.textures.remove(&self.swapchain_texture);
        self.texture_views.remove(&self.swapchain_view.0);
        self.width = width;
        self.height = height;
        self.create_swapchain();
        log::trace!("HeadlessBackend: resized to {}x{}", width, height);
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn begin_frame(&mut self) -> BackendResult<FrameContext> {
        if self.recording {
            return Err(BackendError::AcquireImageFailed(
                "previous frame was not ended".to_string(),
            ));
        }
        if let Some(texture) = self.textures.get_mut(&self.swapchain_texture) {
            texture.layout = TextureLayout::Undefined;
        }
        self.recording = true;
        self.current.clear();
        self.errors.clear();
        self.bound_groups.clear();

        Ok(FrameContext {
            swapchain_view: self.swapchain_view,
            width: self.width,
            height: self.height,
        })
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        if !self.recording {
            return Err(BackendError::PresentFailed("no frame in flight".to_string()));
        }
        self.recording = false;
        if self.in_render_pass {
            self.errors.push("frame ended inside a render pass".to_string());
            self.in_render_pass = false;
        }
        let swapchain_layout = self.view_layout(self.swapchain_view);
        if swapchain_layout != Some(TextureLayout::PresentSrc) {
            self.errors.push(format!(
                "swapchain image presented in layout {:?}",
                swapchain_layout
            ));
        }

        self.last_frame = std::mem::take(&mut self.current);
        self.frame_count += 1;

        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(BackendError::PresentFailed(self.errors.join("; ")))
        }
    }

    fn swapchain_format(&self) -> TextureFormat {
        self.format
    }

    fn wait_idle(&mut self) {}

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        if desc.size == 0 {
            return Err(BackendError::BufferCreationFailed(format!(
                "{:?} has zero size",
                desc.label
            )));
        }
        log::trace!(
            "HeadlessBackend: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        let id = self.alloc_id();
        self.buffers.insert(
            id,
            HeadlessBuffer {
                desc: desc.clone(),
                data: vec![0; desc.size as usize],
            },
        );
        Ok(BufferHandle(id))
    }

    fn create_buffer_init(
        &mut self,
        desc: &BufferDescriptor,
        data: &[u8],
    ) -> BackendResult<BufferHandle> {
        let handle = self.create_buffer(desc)?;
        self.write_buffer(handle, 0, data)?;
        Ok(handle)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        let entry = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("buffer {}", buffer.0)))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > entry.data.len() {
            return Err(BackendError::BufferCreationFailed(format!(
                "write of {} bytes at {} overflows {:?} ({} bytes)",
                data.len(),
                offset,
                entry.desc.label,
                entry.data.len()
            )));
        }
        entry.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        if desc.width == 0 || desc.height == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "{:?} has zero extent",
                desc.label
            )));
        }
        if desc.width > MAX_TEXTURE_DIMENSION || desc.height > MAX_TEXTURE_DIMENSION {
            return Err(BackendError::TextureCreationFailed(format!(
                "{:?} is {}x{}, limit is {}",
                desc.label, desc.width, desc.height, MAX_TEXTURE_DIMENSION
            )));
        }
        log::trace!(
            "HeadlessBackend: creating texture {:?} ({}x{} {:?})",
            desc.label,
            desc.width,
            desc.height,
            desc.format
        );
        let id = self.alloc_id();
        self.textures.insert(
            id,
            HeadlessTexture {
                desc: desc.clone(),
                layout: TextureLayout::Undefined,
            },
        );
        Ok(TextureHandle(id))
    }

    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle> {
        if !self.textures.contains_key(&texture.0) {
            return Err(BackendError::InvalidHandle(format!("texture {}", texture.0)));
        }
        let id = self.alloc_id();
        self.texture_views.insert(id, texture.0);
        Ok(TextureViewHandle(id))
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        log::trace!("HeadlessBackend: creating sampler {:?}", desc.label);
        let id = self.alloc_id();
        self.samplers.insert(id, desc.clone());
        Ok(SamplerHandle(id))
    }

    fn create_bind_group_layout(
        &mut self,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle> {
        let id = self.alloc_id();
        self.bind_group_layouts.insert(id, entries.to_vec());
        Ok(BindGroupLayoutHandle(id))
    }

    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle> {
        let layout_entries = self
            .bind_group_layouts
            .get(&layout.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("bind group layout {}", layout.0)))?;

        for (binding, entry) in entries {
            let declared = layout_entries
                .iter()
                .find(|e| e.binding == *binding)
                .ok_or_else(|| {
                    BackendError::BindGroupCreationFailed(format!(
                        "binding {} is not in the layout",
                        binding
                    ))
                })?;
            let matches = match (entry, &declared.ty) {
                (BindGroupEntry::Buffer { buffer, .. }, BindingType::UniformBuffer) => {
                    self.buffers.contains_key(&buffer.0)
                }
                (BindGroupEntry::Texture(view), BindingType::Texture { .. }) => {
                    self.texture_views.contains_key(&view.0)
                }
                (BindGroupEntry::Sampler(sampler), BindingType::Sampler { .. }) => {
                    self.samplers.contains_key(&sampler.0)
                }
                _ => false,
            };
            if !matches {
                return Err(BackendError::BindGroupCreationFailed(format!(
                    "binding {} does not match its layout entry",
                    binding
                )));
            }
        }

        let id = self.alloc_id();
        self.bind_groups.insert(id, entries.to_vec());
        Ok(BindGroupHandle(id))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        for layout in &desc.bind_group_layouts {
            if !self.bind_group_layouts.contains_key(&layout.0) {
                return Err(BackendError::PipelineCreationFailed(format!(
                    "{:?} references unknown bind group layout {}",
                    desc.label, layout.0
                )));
            }
        }
        if desc.fragment_shader.is_none() && !desc.color_targets.is_empty() {
            return Err(BackendError::PipelineCreationFailed(format!(
                "{:?} has color targets but no fragment shader",
                desc.label
            )));
        }
        log::trace!("HeadlessBackend: creating render pipeline {:?}", desc.label);
        let id = self.alloc_id();
        self.pipelines.insert(id, desc.clone());
        Ok(RenderPipelineHandle(id))
    }

    fn texture_barriers(&mut self, barriers: &[TextureBarrier]) -> BackendResult<()> {
        if self.in_render_pass {
            return Err(BackendError::CommandRecordingFailed(
                "texture barrier inside a render pass".to_string(),
            ));
        }
        for barrier in barriers {
            let texture = self.view_texture(barrier.view)?;
            if let Some(entry) = self.textures.get_mut(&texture) {
                if barrier.old != TextureLayout::Undefined && barrier.old != entry.layout {
                    self.errors.push(format!(
                        "{:?} transitioned from {:?} but is in {:?}",
                        entry.desc.label, barrier.old, entry.layout
                    ));
                }
                entry.layout = barrier.new;
            }
        }
        self.record(RecordedCommand::Barriers(barriers.to_vec()));
        Ok(())
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) -> BackendResult<()> {
        if self.in_render_pass {
            return Err(BackendError::CommandRecordingFailed(
                "render pass begun inside another render pass".to_string(),
            ));
        }

        let mut extent = None;
        for attachment in &desc.color_attachments {
            self.view_texture(attachment.view)?;
            let layout = self.view_layout(attachment.view);
            if layout != Some(TextureLayout::ColorAttachment) {
                self.errors.push(format!(
                    "{:?}: color attachment in layout {:?}",
                    desc.label, layout
                ));
            }
            extent.get_or_insert(self.view_desc(attachment.view).map(|d| (d.width, d.height)));
        }
        if let Some(depth) = &desc.depth_stencil_attachment {
            self.view_texture(depth.view)?;
            let expected = if depth.read_only {
                TextureLayout::DepthStencilReadOnly
            } else {
                TextureLayout::DepthStencilAttachment
            };
            let layout = self.view_layout(depth.view);
            if layout != Some(expected) {
                self.errors.push(format!(
                    "{:?}: depth attachment in layout {:?}, expected {:?}",
                    desc.label, layout, expected
                ));
            }
            let depth_extent = self.view_desc(depth.view).map(|d| (d.width, d.height));
            if let Some(color_extent) = extent {
                if color_extent != depth_extent {
                    return Err(BackendError::CommandRecordingFailed(format!(
                        "{:?}: attachment sizes differ",
                        desc.label
                    )));
                }
            }
        }

        self.in_render_pass = true;
        self.record(RecordedCommand::BeginRenderPass {
            label: desc.label.clone(),
            color: desc
                .color_attachments
                .iter()
                .map(|a| (a.view, a.load_op.clone()))
                .collect(),
            depth: desc
                .depth_stencil_attachment
                .as_ref()
                .map(|d| (d.view, d.depth_load_op.clone(), d.read_only)),
        });
        Ok(())
    }

    fn end_render_pass(&mut self) -> BackendResult<()> {
        if !self.in_render_pass {
            return Err(BackendError::CommandRecordingFailed(
                "no render pass to end".to_string(),
            ));
        }
        self.in_render_pass = false;
        self.bound_groups.clear();
        self.record(RecordedCommand::EndRenderPass);
        Ok(())
    }

    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        if !self.pipelines.contains_key(&pipeline.0) {
            self.errors.push(format!("unknown pipeline {}", pipeline.0));
        }
        self.record(RecordedCommand::SetRenderPipeline(pipeline));
    }

    fn set_bind_group(&mut self, index: u32, bind_group: BindGroupHandle) {
        if !self.bind_groups.contains_key(&bind_group.0) {
            self.errors.push(format!("unknown bind group {}", bind_group.0));
        }
        self.bound_groups.insert(index, bind_group);
        self.record(RecordedCommand::SetBindGroup { index, bind_group });
    }

    fn set_push_constants(&mut self, stages: ShaderStageFlags, offset: u32, data: &[u8]) {
        self.record(RecordedCommand::SetPushConstants {
            stages,
            offset,
            data: data.to_vec(),
        });
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64) {
        if !self.buffers.contains_key(&buffer.0) {
            self.errors.push(format!("unknown vertex buffer {}", buffer.0));
        }
        self.record(RecordedCommand::SetVertexBuffer {
            slot,
            buffer,
            offset,
        });
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat) {
        if !self.buffers.contains_key(&buffer.0) {
            self.errors.push(format!("unknown index buffer {}", buffer.0));
        }
        self.record(RecordedCommand::SetIndexBuffer {
            buffer,
            offset,
            format,
        });
    }

    fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32, _min_depth: f32, _max_depth: f32) {
        self.record(RecordedCommand::SetViewport {
            x,
            y,
            width,
            height,
        });
    }

    fn set_scissor_rect(&mut self, x: u32, y: u32, width: u32, height: u32) {
        self.record(RecordedCommand::SetScissorRect {
            x,
            y,
            width,
            height,
        });
    }

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        if !self.in_render_pass {
            self.errors.push("draw outside of a render pass".to_string());
        }
        self.check_sampled_textures();
        self.record(RecordedCommand::Draw {
            vertices,
            instances,
        });
    }

    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>) {
        if !self.in_render_pass {
            self.errors.push("draw outside of a render pass".to_string());
        }
        self.check_sampled_textures();
        self.record(RecordedCommand::DrawIndexed {
            indices,
            base_vertex,
            instances,
        });
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer.0);
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(&texture.0);
        self.texture_views.retain(|_, t| *t != texture.0);
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        self.samplers.remove(&sampler.0);
    }

    fn destroy_bind_group(&mut self, bind_group: BindGroupHandle) {
        self.bind_groups.remove(&bind_group.0);
    }

    fn destroy_bind_group_layout(&mut self, layout: BindGroupLayoutHandle) {
        self.bind_group_layouts.remove(&layout.0);
    }

    fn destroy_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        self.pipelines.remove(&pipeline.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn color_target(backend: &mut HeadlessBackend) -> TextureViewHandle {
        let texture = backend
            .create_texture(&TextureDescriptor {
                label: Some("target".to_string()),
                width: 4,
                height: 4,
                format: TextureFormat::Rgba32Float,
                usage: TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
            })
            .unwrap();
        backend.create_texture_view(texture).unwrap()
    }

    fn present(backend: &mut HeadlessBackend, frame: &FrameContext, old: TextureLayout) {
        backend
            .texture_barriers(&[TextureBarrier {
                view: frame.swapchain_view,
                old,
                new: TextureLayout::PresentSrc,
            }])
            .unwrap();
    }

    #[test]
    fn test_records_commands_in_order() {
        let mut backend = HeadlessBackend::new(4, 4);
        let frame = backend.begin_frame().unwrap();
        backend
            .texture_barriers(&[TextureBarrier {
                view: frame.swapchain_view,
                old: TextureLayout::Undefined,
                new: TextureLayout::ColorAttachment,
            }])
            .unwrap();
        backend
            .begin_render_pass(&RenderPassDescriptor {
                label: Some("clear".to_string()),
                color_attachments: vec![ColorAttachment {
                    view: frame.swapchain_view,
                    load_op: LoadOp::Clear([0.0; 4]),
                    store_op: StoreOp::Store,
                }],
                depth_stencil_attachment: None,
            })
            .unwrap();
        backend.draw(0..3, 0..1);
        backend.end_render_pass().unwrap();
        present(&mut backend, &frame, TextureLayout::ColorAttachment);
        backend.end_frame().unwrap();

        let commands = backend.last_frame_commands();
        assert_eq!(commands.len(), 5);
        assert!(matches!(commands[1], RecordedCommand::BeginRenderPass { .. }));
        assert!(matches!(commands[2], RecordedCommand::Draw { .. }));
        assert_eq!(backend.frame_count(), 1);
    }

    #[test]
    fn test_wrong_attachment_layout_fails_frame() {
        let mut backend = HeadlessBackend::new(4, 4);
        let target = color_target(&mut backend);
        let frame = backend.begin_frame().unwrap();
        backend
            .begin_render_pass(&RenderPassDescriptor {
                label: None,
                color_attachments: vec![ColorAttachment {
                    view: target,
                    load_op: LoadOp::Load,
                    store_op: StoreOp::Store,
                }],
                depth_stencil_attachment: None,
            })
            .unwrap();
        backend.end_render_pass().unwrap();
        present(&mut backend, &frame, TextureLayout::Undefined);

        assert!(backend.end_frame().is_err());
    }

    #[test]
    fn test_missing_present_transition_fails_frame() {
        let mut backend = HeadlessBackend::new(4, 4);
        backend.begin_frame().unwrap();
        assert!(matches!(
            backend.end_frame(),
            Err(BackendError::PresentFailed(_))
        ));
    }

    #[test]
    fn test_barrier_inside_render_pass_is_rejected() {
        let mut backend = HeadlessBackend::new(4, 4);
        let target = color_target(&mut backend);
        backend.begin_frame().unwrap();
        backend
            .texture_barriers(&[TextureBarrier {
                view: target,
                old: TextureLayout::Undefined,
                new: TextureLayout::ColorAttachment,
            }])
            .unwrap();
        backend
            .begin_render_pass(&RenderPassDescriptor {
                label: None,
                color_attachments: vec![ColorAttachment {
                    view: target,
                    load_op: LoadOp::Load,
                    store_op: StoreOp::Store,
                }],
                depth_stencil_attachment: None,
            })
            .unwrap();
        let result = backend.texture_barriers(&[TextureBarrier {
            view: target,
            old: TextureLayout::ColorAttachment,
            new: TextureLayout::ShaderReadOnly,
        }]);
        assert!(matches!(
            result,
            Err(BackendError::CommandRecordingFailed(_))
        ));
    }

    #[test]
    fn test_write_buffer_bounds() {
        let mut backend = HeadlessBackend::new(4, 4);
        let buffer = backend
            .create_buffer(&BufferDescriptor {
                label: None,
                size: 8,
                usage: BufferUsage::UNIFORM,
                host_visible: true,
            })
            .unwrap();
        backend.write_buffer(buffer, 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(backend.buffer_contents(buffer).unwrap(), &[0, 0, 0, 0, 1, 2, 3, 4]);
        assert!(backend.write_buffer(buffer, 6, &[0; 4]).is_err());
    }

    #[test]
    fn test_resize_replaces_swapchain() {
        let mut backend = HeadlessBackend::new(4, 4);
        let before = backend.begin_frame().unwrap();
        present(&mut backend, &before, TextureLayout::Undefined);
        backend.end_frame().unwrap();

        backend.resize(8, 6);
        let after = backend.begin_frame().unwrap();
        assert_ne!(before.swapchain_view, after.swapchain_view);
        assert_eq!((after.width, after.height), (8, 6));
        assert!(backend.view_desc(before.swapchain_view).is_none());
    }

    #[test]
    fn test_bind_group_must_match_layout() {
        let mut backend = HeadlessBackend::new(4, 4);
        let view = color_target(&mut backend);
        let layout = backend
            .create_bind_group_layout(&[BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::UniformBuffer,
            }])
            .unwrap();
        let result = backend.create_bind_group(layout, &[(0, BindGroupEntry::Texture(view))]);
        assert!(matches!(
            result,
            Err(BackendError::BindGroupCreationFailed(_))
        ));
    }

    #[test]
    fn test_destroyed_geometry_buffers_fail_frame() {
        let mut backend = HeadlessBackend::new(4, 4);
        let buffer = backend
            .create_buffer(&BufferDescriptor {
                label: None,
                size: 64,
                usage: BufferUsage::VERTEX | BufferUsage::INDEX,
                host_visible: false,
            })
            .unwrap();
        backend.destroy_buffer(buffer);

        let frame = backend.begin_frame().unwrap();
        backend.set_vertex_buffer(0, buffer, 0);
        backend.set_index_buffer(buffer, 0, IndexFormat::Uint32);
        present(&mut backend, &frame, TextureLayout::Undefined);

        let Err(BackendError::PresentFailed(message)) = backend.end_frame() else {
            panic!("frame with destroyed buffers should fail");
        };
        assert!(message.contains("unknown vertex buffer"));
        assert!(message.contains("unknown index buffer"));
    }
}
