//! Render graph executor

use crate::backend::traits::*;
use crate::render_graph::graph::*;
use crate::render_graph::pass::*;
use crate::render_graph::resource::*;
use crate::resources::ShaderLibrary;
use crate::scene::{FrameData, SceneManager};
use std::collections::HashMap;

/// Executor for running the compiled render graph
pub struct RenderGraphExecutor {
    /// Allocated textures mapped by resource ID
    allocated_textures: HashMap<ResourceId, TextureHandle>,
    allocated_texture_views: HashMap<ResourceId, TextureViewHandle>,

    /// External texture views (like swapchain)
    external_views: HashMap<ResourceId, TextureViewHandle>,

    /// Screen size the relative textures were allocated for
    screen_size: (u32, u32),
}

impl RenderGraphExecutor {
    pub fn new() -> Self {
        Self {
            allocated_textures: HashMap::new(),
            allocated_texture_views: HashMap::new(),
            external_views: HashMap::new(),
            screen_size: (0, 0),
        }
    }

    /// Set an external texture view (e.g., swapchain image)
    pub fn set_external_view(&mut self, resource: ResourceId, view: TextureViewHandle) {
        self.external_views.insert(resource, view);
    }

    /// View bound to a resource, graph-owned or external
    pub fn texture_view(&self, resource: ResourceId) -> Option<TextureViewHandle> {
        self.allocated_texture_views
            .get(&resource)
            .or_else(|| self.external_views.get(&resource))
            .copied()
    }

    /// Allocate every graph texture that some pass uses
    pub fn allocate_resources(
        &mut self,
        graph: &RenderGraph,
        compiled: &CompiledGraph,
        backend: &mut dyn GraphicsBackend,
        width: u32,
        height: u32,
    ) -> GraphResult<()> {
        self.screen_size = (width, height);

        for resource in graph.resources() {
            let VirtualResource::Texture(tex) = resource else {
                continue;
            };
            if !compiled.resource_lifetimes.contains_key(&tex.id) {
                log::debug!("Render graph: '{}' is never used, skipping", tex.name);
                continue;
            }
            if self.allocated_textures.contains_key(&tex.id) {
                continue;
            }
            self.allocate_texture(tex, backend)?;
        }

        Ok(())
    }

    fn allocate_texture(
        &mut self,
        tex: &VirtualTexture,
        backend: &mut dyn GraphicsBackend,
    ) -> GraphResult<()> {
        let desc = tex.descriptor(self.screen_size.0, self.screen_size.1);
        log::debug!(
            "Render graph: allocating '{}' {}x{} {:?}",
            tex.name,
            desc.width,
            desc.height,
            desc.format
        );
        let handle = backend.create_texture(&desc)?;
        let view = backend.create_texture_view(handle)?;
        self.allocated_textures.insert(tex.id, handle);
        self.allocated_texture_views.insert(tex.id, view);
        Ok(())
    }

    /// Reallocate screen-relative textures for a new screen size.
    ///
    /// Returns true when any texture was recreated, in which case passes must
    /// be prepared again because their bind groups reference stale views.
    pub fn resize(
        &mut self,
        graph: &RenderGraph,
        backend: &mut dyn GraphicsBackend,
        width: u32,
        height: u32,
    ) -> GraphResult<bool> {
        if self.screen_size == (width, height) {
            return Ok(false);
        }
        self.screen_size = (width, height);

        let mut changed = false;
        for resource in graph.resources() {
            let VirtualResource::Texture(tex) = resource else {
                continue;
            };
            if !tex.size.is_relative() {
                continue;
            }
            if let Some(handle) = self.allocated_textures.remove(&tex.id) {
                self.allocated_texture_views.remove(&tex.id);
                backend.destroy_texture(handle);
                self.allocate_texture(tex, backend)?;
                changed = true;
            }
        }

        Ok(changed)
    }

    /// Let every pass create its pipelines and bind groups
    pub fn prepare_passes(
        &self,
        graph: &mut RenderGraph,
        backend: &mut dyn GraphicsBackend,
        shaders: &ShaderLibrary,
        shared: SharedResources,
    ) -> GraphResult<()> {
        let swapchain_format = backend.swapchain_format();
        for pass in graph.passes_mut() {
            let mut ctx = PassPrepareContext {
                backend: &mut *backend,
                shaders,
                shared,
                swapchain_format,
                resource_textures: &self.allocated_texture_views,
            };
            pass.prepare(&mut ctx)?;
        }
        Ok(())
    }

    /// Execute the render graph: planned barriers, then each pass, then presentation transitions
    pub fn execute(
        &self,
        graph: &RenderGraph,
        compiled: &CompiledGraph,
        backend: &mut dyn GraphicsBackend,
        scene: &SceneManager,
        frame: &FrameData,
        width: u32,
        height: u32,
    ) -> GraphResult<()> {
        let mut texture_views: HashMap<ResourceId, TextureViewHandle> = HashMap::new();
        texture_views.extend(self.allocated_texture_views.iter().map(|(&k, &v)| (k, v)));
        texture_views.extend(self.external_views.iter().map(|(&k, &v)| (k, v)));

        for (step, &pass_id) in compiled.pass_order.iter().enumerate() {
            let Some(pass) = graph.get_pass(pass_id) else {
                continue;
            };

            if let Some(planned) = compiled.barriers.get(step) {
                self.issue_barriers(graph, planned, &texture_views, backend)?;
            }

            let mut ctx = PassExecuteContext {
                backend: &mut *backend,
                scene,
                frame,
                width,
                height,
                resource_textures: &texture_views,
            };
            pass.execute(&mut ctx)?;
        }

        self.issue_barriers(graph, &compiled.final_transitions, &texture_views, backend)?;
        Ok(())
    }

    fn issue_barriers(
        &self,
        graph: &RenderGraph,
        planned: &[PlannedBarrier],
        views: &HashMap<ResourceId, TextureViewHandle>,
        backend: &mut dyn GraphicsBackend,
    ) -> GraphResult<()> {
        if planned.is_empty() {
            return Ok(());
        }
        let barriers = planned
            .iter()
            .map(|b| {
                let view = views.get(&b.resource).copied().ok_or_else(|| {
                    let name = graph
                        .resource(b.resource)
                        .map(|r| r.name().to_string())
                        .unwrap_or_default();
                    GraphError::MissingExternal(name)
                })?;
                Ok(TextureBarrier {
                    view,
                    old: b.old,
                    new: b.new,
                })
            })
            .collect::<GraphResult<Vec<_>>>()?;
        backend.texture_barriers(&barriers)?;
        Ok(())
    }

    /// Clean up allocated resources
    pub fn cleanup(&mut self, backend: &mut dyn GraphicsBackend) {
        for (_, handle) in self.allocated_textures.drain() {
            backend.destroy_texture(handle);
        }
        self.allocated_texture_views.clear();
        self.external_views.clear();
    }
}

impl Default for RenderGraphExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessBackend;
    use crate::backend::types::*;

    struct FillPass;

    impl RenderPass for FillPass {
        fn name(&self) -> &str {
            "fill"
        }

        fn setup(&mut self, ctx: &mut PassSetupContext) -> GraphResult<()> {
            let color = ctx.create_texture(
                "half",
                TextureSize::Relative {
                    width_scale: 0.5,
                    height_scale: 0.5,
                },
                TextureFormat::Rgba16Float,
                TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
            )?;
            ctx.write(color, ResourceUsage::RenderTarget);
            ctx.create_texture(
                "unused",
                TextureSize::square(16),
                TextureFormat::Rgba8Unorm,
                TextureUsage::TEXTURE_BINDING,
            )?;
            let target = ctx.find("swapchain")?;
            ctx.write(target, ResourceUsage::RenderTarget);
            Ok(())
        }

        fn execute(&self, _ctx: &mut PassExecuteContext) -> BackendResult<()> {
            Ok(())
        }
    }

    fn graph() -> (RenderGraph, ResourceId) {
        let mut graph = RenderGraph::new();
        let swapchain = graph
            .register_external(
                "swapchain",
                TextureFormat::Bgra8UnormSrgb,
                TextureUsage::RENDER_ATTACHMENT,
                true,
            )
            .unwrap();
        graph.add_pass(FillPass).unwrap();
        (graph, swapchain)
    }

    #[test]
    fn test_allocates_only_used_textures() {
        let (graph, _) = graph();
        let compiled = graph.compile().unwrap();
        let mut backend = HeadlessBackend::new(64, 32);
        let mut executor = RenderGraphExecutor::new();

        let before = backend.live_textures();
        executor
            .allocate_resources(&graph, &compiled, &mut backend, 64, 32)
            .unwrap();
        assert_eq!(backend.live_textures(), before + 1);

        let half = graph.find_resource("half").unwrap();
        let view = executor.texture_view(half).unwrap();
        let desc = backend.view_desc(view).unwrap();
        assert_eq!((desc.width, desc.height), (32, 16));

        executor.cleanup(&mut backend);
        assert_eq!(backend.live_textures(), before);
    }

    #[test]
    fn test_resize_recreates_relative_textures() {
        let (graph, _) = graph();
        let compiled = graph.compile().unwrap();
        let mut backend = HeadlessBackend::new(64, 32);
        let mut executor = RenderGraphExecutor::new();
        executor
            .allocate_resources(&graph, &compiled, &mut backend, 64, 32)
            .unwrap();

        assert!(!executor.resize(&graph, &mut backend, 64, 32).unwrap());
        assert!(executor.resize(&graph, &mut backend, 128, 128).unwrap());

        let half = graph.find_resource("half").unwrap();
        let desc = backend.view_desc(executor.texture_view(half).unwrap()).unwrap();
        assert_eq!((desc.width, desc.height), (64, 64));
    }

    #[test]
    fn test_missing_external_view_fails() {
        let (graph, _) = graph();
        let compiled = graph.compile().unwrap();
        let mut backend = HeadlessBackend::new(64, 32);
        let mut executor = RenderGraphExecutor::new();
        executor
            .allocate_resources(&graph, &compiled, &mut backend, 64, 32)
            .unwrap();

        backend.begin_frame().unwrap();
        let result = executor.execute(
            &graph,
            &compiled,
            &mut backend,
            &SceneManager::new(),
            &FrameData::default(),
            64,
            32,
        );
        assert!(matches!(result, Err(GraphError::MissingExternal(_))));
    }

    #[test]
    fn test_execute_issues_planned_barriers() {
        let (graph, swapchain) = graph();
        let compiled = graph.compile().unwrap();
        let mut backend = HeadlessBackend::new(64, 32);
        let mut executor = RenderGraphExecutor::new();
        executor
            .allocate_resources(&graph, &compiled, &mut backend, 64, 32)
            .unwrap();

        let frame = backend.begin_frame().unwrap();
        executor.set_external_view(swapchain, frame.swapchain_view);
        executor
            .execute(
                &graph,
                &compiled,
                &mut backend,
                &SceneManager::new(),
                &FrameData::default(),
                64,
                32,
            )
            .unwrap();
        backend.end_frame().unwrap();

        let barrier_batches = backend
            .last_frame_commands()
            .iter()
            .filter(|c| matches!(c, crate::backend::headless::RecordedCommand::Barriers(_)))
            .count();
        assert_eq!(barrier_batches, 2);
    }
}
