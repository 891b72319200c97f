//! Shadow mapping renderer: owns the backend, the render graph and the scene

use crate::backend::headless::HeadlessBackend;
use crate::backend::traits::*;
use crate::backend::types::*;
use crate::backend::vulkan::VulkanBackend;
use crate::backend::wgpu_backend::WgpuBackend;
use crate::error::{RendererError, RendererResult};
use crate::pipeline::{build_shadowmap_graph, builtin_shaders, ShadowmapResources};
use crate::render_graph::{CompiledGraph, RenderGraph, RenderGraphExecutor, SharedResources};
use crate::resources::ShaderLibrary;
use crate::scene::{Camera, FrameData, Light, SceneManager, UniformParams};
use crate::{BackendType, RendererConfig};
use glam::Vec3;
use std::path::Path;
use std::sync::Arc;
use winit::window::Window as WinitWindow;

/// Backend wrapper to abstract over different backends
pub enum Backend {
    Wgpu(WgpuBackend),
    Vulkan(VulkanBackend),
    Headless(HeadlessBackend),
}

impl Backend {
    /// Create the backend selected by `backend_type` for a window
    pub fn new(
        window: Arc<WinitWindow>,
        backend_type: BackendType,
        vsync: bool,
    ) -> BackendResult<Self> {
        match backend_type {
            BackendType::Wgpu => Ok(Backend::Wgpu(WgpuBackend::new(window, vsync)?)),
            BackendType::Vulkan => Ok(Backend::Vulkan(VulkanBackend::new(window, vsync)?)),
            BackendType::Headless => {
                let size = window.inner_size();
                Ok(Backend::Headless(HeadlessBackend::new(size.width, size.height)))
            }
        }
    }

    pub fn as_dyn(&self) -> &dyn GraphicsBackend {
        match self {
            Backend::Wgpu(b) => b,
            Backend::Vulkan(b) => b,
            Backend::Headless(b) => b,
        }
    }

    pub fn as_dyn_mut(&mut self) -> &mut dyn GraphicsBackend {
        match self {
            Backend::Wgpu(b) => b,
            Backend::Vulkan(b) => b,
            Backend::Headless(b) => b,
        }
    }

    pub fn backend_type(&self) -> BackendType {
        match self {
            Backend::Wgpu(_) => BackendType::Wgpu,
            Backend::Vulkan(_) => BackendType::Vulkan,
            Backend::Headless(_) => BackendType::Headless,
        }
    }

    /// Get the wgpu backend (if using wgpu)
    pub fn as_wgpu(&self) -> Option<&WgpuBackend> {
        match self {
            Backend::Wgpu(b) => Some(b),
            _ => None,
        }
    }

    /// Get the Vulkan backend (if using Vulkan)
    pub fn as_vulkan(&self) -> Option<&VulkanBackend> {
        match self {
            Backend::Vulkan(b) => Some(b),
            _ => None,
        }
    }

    /// Get the recording backend (if headless)
    pub fn as_headless(&self) -> Option<&HeadlessBackend> {
        match self {
            Backend::Headless(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_headless_mut(&mut self) -> Option<&mut HeadlessBackend> {
        match self {
            Backend::Headless(b) => Some(b),
            _ => None,
        }
    }
}

/// Deferred renderer with a shadow map and an optional debug overlay.
///
/// The usual flow is [`allocate_resources`](Self::allocate_resources), then
/// [`load_scene`](Self::load_scene) (which loads shaders and prepares the
/// pipelines), then per frame [`update_uniforms`](Self::update_uniforms) and
/// [`render_frame`](Self::render_frame).
pub struct ShadowmapRenderer {
    backend: Backend,
    config: RendererConfig,

    graph: RenderGraph,
    resources: ShadowmapResources,
    compiled: CompiledGraph,
    executor: RenderGraphExecutor,
    shaders: ShaderLibrary,

    scene: SceneManager,
    camera: Camera,
    light: Light,

    /// Constants buffer and default sampler, `None` until allocated
    shared: Option<SharedResources>,
    pipelines_ready: bool,
    uniforms: UniformParams,
    time: f32,

    width: u32,
    height: u32,
    draw_debug_quad: bool,
}

impl ShadowmapRenderer {
    /// Build the render graph on top of an initialized backend
    pub fn new(config: RendererConfig, backend: Backend) -> RendererResult<Self> {
        let (width, height) = backend.as_dyn().surface_size();
        let swapchain_format = backend.as_dyn().swapchain_format();

        let (graph, resources) = build_shadowmap_graph(&config, swapchain_format)?;
        let compiled = graph.compile()?;
        log::debug!(
            "Shadowmap graph compiled: {} passes, {} final transitions",
            compiled.pass_order.len(),
            compiled.final_transitions.len()
        );

        let mut camera = Camera::new(Vec3::new(0.0, 5.0, 10.0), Vec3::ZERO);
        camera.set_aspect(width as f32, height as f32);
        let light = Light::from_config(&config.light);

        log::info!(
            "Shadowmap renderer created on {} backend ({}x{})",
            backend.as_dyn().name(),
            width,
            height
        );

        Ok(Self {
            draw_debug_quad: config.draw_debug_quad,
            backend,
            config,
            graph,
            resources,
            compiled,
            executor: RenderGraphExecutor::new(),
            shaders: ShaderLibrary::new(),
            scene: SceneManager::new(),
            camera,
            light,
            shared: None,
            pipelines_ready: false,
            uniforms: UniformParams::default(),
            time: 0.0,
            width,
            height,
        })
    }

    /// Renderer on the recording backend, sized from the configuration
    pub fn with_headless(config: RendererConfig) -> RendererResult<Self> {
        let backend = Backend::Headless(HeadlessBackend::new(config.width, config.height));
        Self::new(config, backend)
    }

    /// Create the configured backend for `window` and build the renderer on it
    pub fn from_window(window: Arc<WinitWindow>, config: RendererConfig) -> RendererResult<Self> {
        let backend = Backend::new(window, config.backend, config.vsync)?;
        Self::new(config, backend)
    }

    /// Create the constants buffer, the default sampler and every graph texture
    pub fn allocate_resources(&mut self) -> RendererResult<()> {
        if self.shared.is_some() {
            return Ok(());
        }
        let backend = self.backend.as_dyn_mut();

        let constants = backend.create_buffer_init(
            &BufferDescriptor {
                label: Some("constants".to_string()),
                size: std::mem::size_of::<UniformParams>() as u64,
                usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
                host_visible: true,
            },
            bytemuck::bytes_of(&self.uniforms),
        )?;

        // Nearest filtering keeps it bindable next to depth and 32-bit float textures
        let sampler = match backend.create_sampler(&SamplerDescriptor {
            label: Some("default_sampler".to_string()),
            mag_filter: FilterMode::Nearest,
            min_filter: FilterMode::Nearest,
            ..Default::default()
        }) {
            Ok(sampler) => sampler,
            Err(e) => {
                backend.destroy_buffer(constants);
                return Err(e.into());
            }
        };

        if let Err(e) = self.executor.allocate_resources(
            &self.graph,
            &self.compiled,
            backend,
            self.width,
            self.height,
        ) {
            self.executor.cleanup(backend);
            backend.destroy_sampler(sampler);
            backend.destroy_buffer(constants);
            return Err(e.into());
        }
        self.shared = Some(SharedResources { constants, sampler });

        log::info!("Renderer resources allocated ({}x{})", self.width, self.height);
        Ok(())
    }

    /// Load a glTF scene from disk, then shaders, pipelines and the camera
    pub fn load_scene(&mut self, path: impl AsRef<Path>, transpose: bool) -> RendererResult<()> {
        let mut scene = SceneManager::new();
        scene.load_gltf(path, transpose)?;
        self.set_scene(scene)
    }

    /// Load a glTF or GLB scene held in memory
    pub fn load_scene_slice(&mut self, bytes: &[u8], transpose: bool) -> RendererResult<()> {
        let mut scene = SceneManager::new();
        scene.load_gltf_slice(bytes, transpose)?;
        self.set_scene(scene)
    }

    /// Replace the current scene with `scene` and get it ready to draw
    ///
    /// The current scene stays loaded when `scene` cannot be uploaded.
    pub fn set_scene(&mut self, mut scene: SceneManager) -> RendererResult<()> {
        if self.shared.is_none() {
            return Err(RendererError::NotAllocated);
        }
        let backend = self.backend.as_dyn_mut();
        scene.upload(backend)?;
        backend.wait_idle();
        self.scene.release(backend);
        self.scene = scene;

        self.load_shaders();
        self.prepare_pipelines()?;
        self.reset_camera();
        Ok(())
    }

    /// Register the built-in programs. Programs already registered through
    /// [`shaders_mut`](Self::shaders_mut) are kept.
    pub fn load_shaders(&mut self) {
        let builtin = builtin_shaders();
        for program in builtin.programs() {
            if !self.shaders.contains(&program.name) {
                self.shaders
                    .insert(&program.name, &program.vertex, program.fragment.as_deref());
            }
        }
        log::info!("Shader programs loaded: {}", self.shaders.len());
    }

    /// Create pipelines and bind groups of every pass
    pub fn prepare_pipelines(&mut self) -> RendererResult<()> {
        let shared = self.shared.ok_or(RendererError::NotAllocated)?;
        self.executor.prepare_passes(
            &mut self.graph,
            self.backend.as_dyn_mut(),
            &self.shaders,
            shared,
        )?;
        self.pipelines_ready = true;
        log::info!("Pipelines prepared for {} passes", self.graph.passes().len());
        Ok(())
    }

    /// Put the camera where the scene file says, or frame the whole scene
    fn reset_camera(&mut self) {
        let aspect = self.width as f32 / self.height.max(1) as f32;
        if let Some(scene_camera) = self.scene.camera(0) {
            self.camera = Camera::from_scene_camera(scene_camera, aspect);
        } else if let Some((min, max)) = self.scene.bounds() {
            log::warn!("Scene has no camera, framing its bounds");
            self.camera = Camera::framing(min, max, aspect);
        }
    }

    /// Advance time and the light, then write the constants buffer
    pub fn update_uniforms(&mut self, dt: f32) -> RendererResult<()> {
        let shared = self.shared.ok_or(RendererError::NotAllocated)?;

        self.time += dt;
        self.light.update(dt);
        self.uniforms = UniformParams {
            light_matrix: self.light.light_matrix(),
            light_pos: self.light.position,
            time: self.time,
            base_color: self.light.color,
            animate_light_color: u32::from(self.config.animate_light_color),
        };

        self.backend.as_dyn_mut().write_buffer(
            shared.constants,
            0,
            bytemuck::bytes_of(&self.uniforms),
        )?;
        Ok(())
    }

    /// Acquire a swapchain image, record every pass and present
    pub fn render_frame(&mut self) -> RendererResult<()> {
        if !self.pipelines_ready {
            return Err(RendererError::NoScene);
        }

        let frame = self.backend.as_dyn_mut().begin_frame()?;
        let recorded = self.build_command_buffer(&frame);
        // Close the frame even when recording failed so the next one starts clean
        let presented = self.backend.as_dyn_mut().end_frame();
        recorded?;
        presented?;
        Ok(())
    }

    /// Record barriers and passes for one frame into the backend
    pub fn build_command_buffer(&mut self, frame: &FrameContext) -> RendererResult<()> {
        self.executor
            .set_external_view(self.resources.swapchain, frame.swapchain_view);
        let data = self.frame_data();
        self.executor.execute(
            &self.graph,
            &self.compiled,
            self.backend.as_dyn_mut(),
            &self.scene,
            &data,
            frame.width,
            frame.height,
        )?;
        Ok(())
    }

    /// Values the passes read while recording the next frame
    pub fn frame_data(&self) -> FrameData {
        FrameData {
            world_view_proj: self.camera.view_projection_matrix(),
            light_matrix: self.light.light_matrix(),
            draw_debug_quad: self.draw_debug_quad,
            debug_quad_rect: self.config.debug_quad_rect,
        }
    }

    /// Handle window resize
    pub fn resize(&mut self, width: u32, height: u32) -> RendererResult<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        let backend = self.backend.as_dyn_mut();
        backend.resize(width, height);

        // The surface may be clamped by device limits
        let (actual_width, actual_height) = backend.surface_size();
        if (actual_width, actual_height) == (self.width, self.height) {
            return Ok(());
        }
        self.width = actual_width;
        self.height = actual_height;
        self.camera
            .set_aspect(actual_width as f32, actual_height as f32);

        if self.shared.is_some() {
            backend.wait_idle();
            let reallocated =
                self.executor
                    .resize(&self.graph, backend, actual_width, actual_height)?;
            if reallocated && self.pipelines_ready {
                self.prepare_pipelines()?;
            }
        }

        log::info!("Renderer resized to {}x{}", actual_width, actual_height);
        Ok(())
    }

    /// Destroy every GPU object the renderer created, passes first
    pub fn deallocate_resources(&mut self) {
        let backend = self.backend.as_dyn_mut();
        backend.wait_idle();

        self.graph.release_passes(backend);
        self.executor.cleanup(backend);
        self.scene.release(backend);
        if let Some(shared) = self.shared.take() {
            backend.destroy_sampler(shared.sampler);
            backend.destroy_buffer(shared.constants);
            log::info!("Renderer resources deallocated");
        }
        self.pipelines_ready = false;
    }

    pub fn set_draw_debug_quad(&mut self, enabled: bool) {
        self.draw_debug_quad = enabled;
    }

    pub fn draw_debug_quad(&self) -> bool {
        self.draw_debug_quad
    }

    /// Get current dimensions
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut Backend {
        &mut self.backend
    }

    pub fn graph(&self) -> &RenderGraph {
        &self.graph
    }

    pub fn compiled_graph(&self) -> &CompiledGraph {
        &self.compiled
    }

    /// Resource ids of the swapchain, shadow map and G-buffer images
    pub fn resources(&self) -> &ShadowmapResources {
        &self.resources
    }

    /// View currently bound to a graph resource
    pub fn texture_view(&self, resource: crate::render_graph::ResourceId) -> Option<TextureViewHandle> {
        self.executor.texture_view(resource)
    }

    pub fn shared_resources(&self) -> Option<SharedResources> {
        self.shared
    }

    pub fn shaders(&self) -> &ShaderLibrary {
        &self.shaders
    }

    /// Register programs here before loading a scene to replace built-ins
    pub fn shaders_mut(&mut self) -> &mut ShaderLibrary {
        &mut self.shaders
    }

    pub fn scene(&self) -> &SceneManager {
        &self.scene
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    pub fn light(&self) -> &Light {
        &self.light
    }

    pub fn light_mut(&mut self) -> &mut Light {
        &mut self.light
    }

    /// Last values written to the constants buffer
    pub fn uniforms(&self) -> &UniformParams {
        &self.uniforms
    }

    /// Seconds accumulated by `update_uniforms`
    pub fn time(&self) -> f32 {
        self.time
    }
}

impl Drop for ShadowmapRenderer {
    fn drop(&mut self) {
        self.deallocate_resources();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn renderer() -> ShadowmapRenderer {
        ShadowmapRenderer::with_headless(RendererConfig::default().with_size(320, 240)).unwrap()
    }

    #[test]
    fn test_render_requires_scene() {
        let mut renderer = renderer();
        renderer.allocate_resources().unwrap();
        assert!(matches!(renderer.render_frame(), Err(RendererError::NoScene)));
    }

    #[test]
    fn test_scene_requires_allocation() {
        let mut renderer = renderer();
        let result = renderer.set_scene(SceneManager::demo_scene());
        assert!(matches!(result, Err(RendererError::NotAllocated)));
        assert!(matches!(
            renderer.update_uniforms(0.016),
            Err(RendererError::NotAllocated)
        ));
    }

    #[test]
    fn test_failed_allocation_releases_shared_resources() {
        use crate::backend::headless::MAX_TEXTURE_DIMENSION;

        let config = RendererConfig::default()
            .with_size(320, 240)
            .with_shadow_map_size(MAX_TEXTURE_DIMENSION * 2);
        let mut renderer = ShadowmapRenderer::with_headless(config).unwrap();
        assert!(renderer.allocate_resources().is_err());
        assert!(renderer.shared_resources().is_none());

        let headless = renderer.backend().as_headless().unwrap();
        assert_eq!(headless.live_buffers(), 0);
        assert_eq!(headless.live_samplers(), 0);
        assert_eq!(headless.live_textures(), 1);

        // A retry must not report success without graph textures
        assert!(renderer.allocate_resources().is_err());
    }

    #[test]
    fn test_allocate_is_idempotent() {
        let mut renderer = renderer();
        renderer.allocate_resources().unwrap();
        let shared = renderer.shared_resources().unwrap();
        renderer.allocate_resources().unwrap();
        assert_eq!(renderer.shared_resources().unwrap().constants, shared.constants);
    }

    #[test]
    fn test_update_uniforms_writes_constants() {
        let mut renderer = renderer();
        renderer.allocate_resources().unwrap();
        renderer.update_uniforms(0.5).unwrap();
        renderer.update_uniforms(0.25).unwrap();

        let shared = renderer.shared_resources().unwrap();
        let headless = renderer.backend().as_headless().unwrap();
        let bytes = headless.buffer_contents(shared.constants).unwrap();
        let written: UniformParams = bytemuck::pod_read_unaligned(bytes);
        assert_eq!(written.time, 0.75);
        assert_eq!(written.light_matrix, renderer.light().light_matrix());
        assert_eq!(written.animate_light_color, 0);
    }

    #[test]
    fn test_scene_without_camera_is_framed() {
        let mut renderer = renderer();
        renderer.allocate_resources().unwrap();
        renderer.set_scene(SceneManager::demo_scene()).unwrap();
        let (min, max) = renderer.scene().bounds().unwrap();
        assert_eq!(renderer.camera().target, (min + max) * 0.5);
    }

    #[test]
    fn test_user_shaders_take_precedence() {
        let mut renderer = renderer();
        renderer
            .shaders_mut()
            .insert(crate::pipeline::shaders::QUAD_PROGRAM, "custom", Some("custom"));
        renderer.load_shaders();
        let quad = renderer
            .shaders()
            .get(crate::pipeline::shaders::QUAD_PROGRAM)
            .unwrap();
        assert_eq!(quad.vertex, "custom");
        assert_eq!(renderer.shaders().len(), 4);
    }
}
