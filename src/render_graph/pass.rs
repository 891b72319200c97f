//! Render pass definitions for the render graph

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::render_graph::graph::{GraphError, GraphResult};
use crate::render_graph::resource::*;
use crate::resources::ShaderLibrary;
use crate::scene::{FrameData, SceneManager};
use std::collections::HashMap;

/// Unique identifier for a render pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PassId(pub(crate) u32);

impl PassId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Context for setting up pass resources
pub struct PassSetupContext<'a> {
    pub(crate) resources: &'a mut Vec<VirtualResource>,
    pub(crate) inputs: &'a mut Vec<ResourceAccess>,
    pub(crate) outputs: &'a mut Vec<ResourceAccess>,
    pub(crate) next_resource_id: &'a mut u32,
}

impl<'a> PassSetupContext<'a> {
    /// Create a new texture resource owned by the graph
    pub fn create_texture(
        &mut self,
        name: &str,
        size: TextureSize,
        format: TextureFormat,
        usage: TextureUsage,
    ) -> GraphResult<ResourceId> {
        if self.resources.iter().any(|r| r.name() == name) {
            return Err(GraphError::DuplicateResource(name.to_string()));
        }
        if size.is_empty() {
            return Err(GraphError::ZeroSizedTexture(name.to_string()));
        }

        let id = ResourceId(*self.next_resource_id);
        *self.next_resource_id += 1;

        self.resources.push(VirtualResource::Texture(VirtualTexture {
            id,
            name: name.to_string(),
            size,
            format,
            usage,
        }));

        Ok(id)
    }

    /// Look up a resource created by an earlier pass or registered as external
    pub fn find(&self, name: &str) -> GraphResult<ResourceId> {
        self.resources
            .iter()
            .find(|r| r.name() == name)
            .map(|r| r.id())
            .ok_or_else(|| GraphError::UnknownResource(name.to_string()))
    }

    /// Declare that this pass reads from a resource
    pub fn read(&mut self, resource: ResourceId, usage: ResourceUsage) {
        self.inputs.push(ResourceAccess { resource, usage });
    }

    /// Declare that this pass writes to a resource
    pub fn write(&mut self, resource: ResourceId, usage: ResourceUsage) {
        self.outputs.push(ResourceAccess { resource, usage });
    }

    /// Declare that this pass loads a resource and writes on top of it
    pub fn read_write(&mut self, resource: ResourceId, usage: ResourceUsage) {
        self.read(resource, usage);
        self.write(resource, usage);
    }
}

/// Buffers and samplers owned by the renderer and shared by every pass
#[derive(Debug, Clone, Copy)]
pub struct SharedResources {
    /// Per-frame constants uniform buffer
    pub constants: BufferHandle,
    pub sampler: SamplerHandle,
}

/// Context for creating pipelines and bind groups once textures exist
pub struct PassPrepareContext<'a> {
    pub backend: &'a mut dyn GraphicsBackend,
    pub shaders: &'a ShaderLibrary,
    pub shared: SharedResources,
    pub swapchain_format: TextureFormat,
    pub(crate) resource_textures: &'a HashMap<ResourceId, TextureViewHandle>,
}

impl<'a> PassPrepareContext<'a> {
    /// Get the view allocated for a graph texture
    pub fn texture(&self, resource: ResourceId) -> BackendResult<TextureViewHandle> {
        lookup_view(self.resource_textures, resource)
    }
}

/// Context for executing a render pass
pub struct PassExecuteContext<'a> {
    pub backend: &'a mut dyn GraphicsBackend,
    pub scene: &'a SceneManager,
    pub frame: &'a FrameData,
    pub width: u32,
    pub height: u32,
    pub(crate) resource_textures: &'a HashMap<ResourceId, TextureViewHandle>,
}

impl<'a> PassExecuteContext<'a> {
    /// Get a texture view handle for a resource
    pub fn texture(&self, resource: ResourceId) -> BackendResult<TextureViewHandle> {
        lookup_view(self.resource_textures, resource)
    }
}

fn lookup_view(
    views: &HashMap<ResourceId, TextureViewHandle>,
    resource: ResourceId,
) -> BackendResult<TextureViewHandle> {
    views
        .get(&resource)
        .copied()
        .ok_or_else(|| BackendError::InvalidHandle(format!("graph resource {}", resource.0)))
}

/// Trait for render passes
pub trait RenderPass: Send + Sync {
    /// Get the pass name for debugging
    fn name(&self) -> &str;

    /// Setup phase - declare resources and dependencies
    fn setup(&mut self, ctx: &mut PassSetupContext) -> GraphResult<()>;

    /// Create GPU objects that depend on allocated graph textures.
    ///
    /// Called after allocation and again whenever textures were reallocated.
    fn prepare(&mut self, _ctx: &mut PassPrepareContext) -> BackendResult<()> {
        Ok(())
    }

    /// Execute phase - record commands
    fn execute(&self, ctx: &mut PassExecuteContext) -> BackendResult<()>;

    /// Destroy GPU objects created in `prepare`
    fn release(&mut self, _backend: &mut dyn GraphicsBackend) {}
}

/// Metadata about a pass in the graph
#[derive(Debug)]
pub struct PassNode {
    pub id: PassId,
    pub name: String,
    pub inputs: Vec<ResourceAccess>,
    pub outputs: Vec<ResourceAccess>,
}

impl PassNode {
    pub fn writes_resource(&self, resource: ResourceId) -> bool {
        self.outputs.iter().any(|a| a.resource == resource)
    }
}
