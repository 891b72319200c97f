//! Render graph definition and compilation

use crate::backend::layout::{TextureLayout, TextureUsageGraph};
use crate::backend::traits::{BackendError, GraphicsBackend};
use crate::backend::types::{TextureFormat, TextureUsage};
use crate::render_graph::pass::*;
use crate::render_graph::resource::*;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use thiserror::Error;

/// Render graph error type
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Dependency cycle between passes: {0:?}")]
    Cycle(Vec<String>),
    #[error("Unknown resource: {0}")]
    UnknownResource(String),
    #[error("Resource already exists: {0}")]
    DuplicateResource(String),
    #[error("Pass '{pass}' accesses '{resource}' with conflicting layouts")]
    ConflictingAccess { pass: String, resource: String },
    #[error("Pass '{pass}' cannot move '{resource}' from {from:?} to {to:?}")]
    InvalidTransition {
        pass: String,
        resource: String,
        from: TextureLayout,
        to: TextureLayout,
    },
    #[error("Pass '{pass}' reads '{resource}' before any pass writes it")]
    ReadBeforeWrite { pass: String, resource: String },
    #[error("Texture '{0}' has a zero dimension")]
    ZeroSizedTexture(String),
    #[error("No view bound for external resource '{0}'")]
    MissingExternal(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type GraphResult<T> = Result<T, GraphError>;

/// The main render graph structure
pub struct RenderGraph {
    passes: Vec<Box<dyn RenderPass>>,
    pass_nodes: Vec<PassNode>,
    resources: Vec<VirtualResource>,
    next_resource_id: u32,
}

impl RenderGraph {
    pub fn new() -> Self {
        Self {
            passes: Vec::new(),
            pass_nodes: Vec::new(),
            resources: Vec::new(),
            next_resource_id: 0,
        }
    }

    /// Register an external texture (like the swapchain image)
    pub fn register_external(
        &mut self,
        name: &str,
        format: TextureFormat,
        usage: TextureUsage,
        present: bool,
    ) -> GraphResult<ResourceId> {
        if self.find_resource(name).is_some() {
            return Err(GraphError::DuplicateResource(name.to_string()));
        }
        let id = ResourceId(self.next_resource_id);
        self.next_resource_id += 1;
        self.resources.push(VirtualResource::External(ExternalTexture {
            id,
            name: name.to_string(),
            format,
            usage,
            present,
        }));
        Ok(id)
    }

    /// Find a resource by name
    pub fn find_resource(&self, name: &str) -> Option<ResourceId> {
        self.resources
            .iter()
            .find(|r| r.name() == name)
            .map(|r| r.id())
    }

    /// Get resource by ID
    pub fn resource(&self, id: ResourceId) -> Option<&VirtualResource> {
        self.resources.iter().find(|r| r.id() == id)
    }

    /// Add a render pass to the graph
    pub fn add_pass<P: RenderPass + 'static>(&mut self, pass: P) -> GraphResult<PassId> {
        let id = PassId(self.pass_nodes.len() as u32);

        let name = pass.name().to_string();
        let mut boxed_pass = Box::new(pass);

        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        {
            let mut ctx = PassSetupContext {
                resources: &mut self.resources,
                inputs: &mut inputs,
                outputs: &mut outputs,
                next_resource_id: &mut self.next_resource_id,
            };
            boxed_pass.setup(&mut ctx)?;
        }

        log::debug!(
            "Render graph: added pass '{}' ({} reads, {} writes)",
            name,
            inputs.len(),
            outputs.len()
        );

        self.passes.push(boxed_pass);
        self.pass_nodes.push(PassNode {
            id,
            name,
            inputs,
            outputs,
        });

        Ok(id)
    }

    /// Compile the graph: order passes, compute lifetimes and plan layout transitions.
    ///
    /// A pass that only reads a resource runs after every pass that writes it.
    /// Passes that write the same resource keep their insertion order, so a
    /// pass that loads and draws over a target follows the pass that cleared it.
    pub fn compile(&self) -> GraphResult<CompiledGraph> {
        let count = self.pass_nodes.len();
        let mut dependencies: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); count];

        for (index, node) in self.pass_nodes.iter().enumerate() {
            for input in &node.inputs {
                let read_modify_write = node.writes_resource(input.resource);
                for (writer_index, writer) in self.pass_nodes.iter().enumerate() {
                    if writer_index == index || !writer.writes_resource(input.resource) {
                        continue;
                    }
                    if read_modify_write && writer_index > index {
                        continue;
                    }
                    dependencies[index].insert(writer_index);
                }
            }
            for output in &node.outputs {
                for earlier in 0..index {
                    if self.pass_nodes[earlier].writes_resource(output.resource) {
                        dependencies[index].insert(earlier);
                    }
                }
            }
        }

        // Kahn's algorithm; ties go to the pass added first
        let mut in_degree: Vec<usize> = dependencies.iter().map(|d| d.len()).collect();
        let mut ready: BTreeSet<usize> = (0..count).filter(|&i| in_degree[i] == 0).collect();
        let mut sorted = Vec::with_capacity(count);

        while let Some(index) = ready.pop_first() {
            sorted.push(index);
            for (dependent, deps) in dependencies.iter().enumerate() {
                if deps.contains(&index) {
                    in_degree[dependent] -= 1;
                    if in_degree[dependent] == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if sorted.len() != count {
            let stuck = (0..count)
                .filter(|i| !sorted.contains(i))
                .map(|i| self.pass_nodes[i].name.clone())
                .collect();
            return Err(GraphError::Cycle(stuck));
        }

        let mut resource_lifetimes: HashMap<ResourceId, ResourceLifetime> = HashMap::new();
        for (order, &index) in sorted.iter().enumerate() {
            let node = &self.pass_nodes[index];
            for access in node.inputs.iter().chain(node.outputs.iter()) {
                let lifetime = resource_lifetimes
                    .entry(access.resource)
                    .or_insert(ResourceLifetime {
                        first_use: order,
                        last_use: order,
                    });
                lifetime.last_use = order;
            }
        }

        let (barriers, final_transitions) = self.plan_transitions(&sorted)?;

        let compiled = CompiledGraph {
            pass_order: sorted.iter().map(|&i| self.pass_nodes[i].id).collect(),
            resource_lifetimes,
            barriers,
            final_transitions,
        };

        log::debug!(
            "Render graph compiled: {:?}",
            sorted
                .iter()
                .map(|&i| self.pass_nodes[i].name.as_str())
                .collect::<Vec<_>>()
        );

        Ok(compiled)
    }

    /// Walk the sorted passes and record every layout change they require.
    fn plan_transitions(
        &self,
        sorted: &[usize],
    ) -> GraphResult<(Vec<Vec<PlannedBarrier>>, Vec<PlannedBarrier>)> {
        let mut current: HashMap<ResourceId, TextureLayout> = HashMap::new();
        let mut written: HashSet<ResourceId> = HashSet::new();
        let mut usage_graphs: HashMap<ResourceId, TextureUsageGraph> = HashMap::new();
        let mut barriers = Vec::with_capacity(sorted.len());

        for &index in sorted {
            let node = &self.pass_nodes[index];

            let mut required: BTreeMap<ResourceId, TextureLayout> = BTreeMap::new();
            for access in node.inputs.iter().chain(node.outputs.iter()) {
                let layout = access.usage.layout();
                if let Some(existing) = required.insert(access.resource, layout) {
                    if existing != layout {
                        return Err(GraphError::ConflictingAccess {
                            pass: node.name.clone(),
                            resource: self.resource_name(access.resource),
                        });
                    }
                }
            }

            let mut pass_barriers = Vec::new();
            for (id, layout) in required {
                let resource = self
                    .resource(id)
                    .ok_or_else(|| GraphError::UnknownResource(format!("#{}", id.0)))?;
                let writes = node.writes_resource(id);

                if !resource.is_external() && !writes && !written.contains(&id) {
                    return Err(GraphError::ReadBeforeWrite {
                        pass: node.name.clone(),
                        resource: resource.name().to_string(),
                    });
                }

                let from = current.get(&id).copied().unwrap_or_default();
                if from != layout {
                    let usage_graph = usage_graphs.entry(id).or_insert_with(|| {
                        TextureUsageGraph::from_usage(resource.usage(), resource.presents())
                    });
                    if !layout.is_compatible_with(resource.format())
                        || !usage_graph.is_valid_transition(from, layout)
                    {
                        return Err(GraphError::InvalidTransition {
                            pass: node.name.clone(),
                            resource: resource.name().to_string(),
                            from,
                            to: layout,
                        });
                    }
                    pass_barriers.push(PlannedBarrier {
                        resource: id,
                        old: from,
                        new: layout,
                    });
                    current.insert(id, layout);
                }

                if writes {
                    written.insert(id);
                }
            }
            barriers.push(pass_barriers);
        }

        let mut final_transitions = Vec::new();
        for resource in self.resources.iter().filter(|r| r.presents()) {
            let from = current.get(&resource.id()).copied().unwrap_or_default();
            let usage_graph = TextureUsageGraph::from_usage(resource.usage(), true);
            if !usage_graph.is_valid_transition(from, TextureLayout::PresentSrc) {
                return Err(GraphError::InvalidTransition {
                    pass: "present".to_string(),
                    resource: resource.name().to_string(),
                    from,
                    to: TextureLayout::PresentSrc,
                });
            }
            final_transitions.push(PlannedBarrier {
                resource: resource.id(),
                old: from,
                new: TextureLayout::PresentSrc,
            });
        }

        Ok((barriers, final_transitions))
    }

    fn resource_name(&self, id: ResourceId) -> String {
        self.resource(id)
            .map(|r| r.name().to_string())
            .unwrap_or_else(|| format!("#{}", id.0))
    }

    /// Destroy GPU objects every pass created while preparing
    pub fn release_passes(&mut self, backend: &mut dyn GraphicsBackend) {
        for pass in &mut self.passes {
            pass.release(backend);
        }
    }

    /// Get all passes
    pub fn passes(&self) -> &[Box<dyn RenderPass>] {
        &self.passes
    }

    /// Get mutable passes
    pub fn passes_mut(&mut self) -> &mut [Box<dyn RenderPass>] {
        &mut self.passes
    }

    /// Get pass nodes (metadata)
    pub fn pass_nodes(&self) -> &[PassNode] {
        &self.pass_nodes
    }

    /// Get all resources
    pub fn resources(&self) -> &[VirtualResource] {
        &self.resources
    }

    /// Get pass by ID
    pub fn get_pass(&self, id: PassId) -> Option<&dyn RenderPass> {
        self.passes.get(id.index()).map(|p| p.as_ref())
    }

    /// Get pass node by ID
    pub fn get_pass_node(&self, id: PassId) -> Option<&PassNode> {
        self.pass_nodes.get(id.index())
    }
}

impl Default for RenderGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Resource lifetime in terms of pass execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLifetime {
    pub first_use: usize,
    pub last_use: usize,
}

/// A layout transition scheduled by the compiler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedBarrier {
    pub resource: ResourceId,
    pub old: TextureLayout,
    pub new: TextureLayout,
}

/// Compiled render graph with execution order, lifetimes and transitions
#[derive(Debug)]
pub struct CompiledGraph {
    pub pass_order: Vec<PassId>,
    pub resource_lifetimes: HashMap<ResourceId, ResourceLifetime>,
    /// Transitions to issue before each step of `pass_order`
    pub barriers: Vec<Vec<PlannedBarrier>>,
    /// Transitions to issue after the last pass (presentation)
    pub final_transitions: Vec<PlannedBarrier>,
}

impl CompiledGraph {
    /// Check if a resource is alive at a given execution step
    pub fn is_resource_alive(&self, resource: ResourceId, step: usize) -> bool {
        if let Some(lifetime) = self.resource_lifetimes.get(&resource) {
            step >= lifetime.first_use && step <= lifetime.last_use
        } else {
            false
        }
    }

    /// Every layout the resource passes through during one frame, in order
    pub fn layout_sequence(&self, resource: ResourceId) -> Vec<TextureLayout> {
        let mut sequence = Vec::new();
        for barrier in self
            .barriers
            .iter()
            .flatten()
            .chain(self.final_transitions.iter())
            .filter(|b| b.resource == resource)
        {
            if sequence.is_empty() {
                sequence.push(barrier.old);
            }
            sequence.push(barrier.new);
        }
        sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::traits::BackendResult;

    /// Pass driven entirely by declared accesses; records nothing.
    struct TestPass {
        name: &'static str,
        creates: Vec<(&'static str, TextureFormat)>,
        reads: Vec<(&'static str, ResourceUsage)>,
        writes: Vec<(&'static str, ResourceUsage)>,
        read_writes: Vec<(&'static str, ResourceUsage)>,
    }

    impl TestPass {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                creates: Vec::new(),
                reads: Vec::new(),
                writes: Vec::new(),
                read_writes: Vec::new(),
            }
        }

        fn creates(mut self, name: &'static str, format: TextureFormat) -> Self {
            self.creates.push((name, format));
            self
        }

        fn reads(mut self, name: &'static str, usage: ResourceUsage) -> Self {
            self.reads.push((name, usage));
            self
        }

        fn writes(mut self, name: &'static str, usage: ResourceUsage) -> Self {
            self.writes.push((name, usage));
            self
        }

        fn read_writes(mut self, name: &'static str, usage: ResourceUsage) -> Self {
            self.read_writes.push((name, usage));
            self
        }
    }

    impl RenderPass for TestPass {
        fn name(&self) -> &str {
            self.name
        }

        fn setup(&mut self, ctx: &mut PassSetupContext) -> GraphResult<()> {
            for (name, format) in &self.creates {
                ctx.create_texture(
                    name,
                    TextureSize::default(),
                    *format,
                    TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
                )?;
            }
            for (name, usage) in &self.reads {
                let id = ctx.find(name)?;
                ctx.read(id, *usage);
            }
            for (name, usage) in &self.writes {
                let id = ctx.find(name)?;
                ctx.write(id, *usage);
            }
            for (name, usage) in &self.read_writes {
                let id = ctx.find(name)?;
                ctx.read_write(id, *usage);
            }
            Ok(())
        }

        fn execute(&self, _ctx: &mut PassExecuteContext) -> BackendResult<()> {
            Ok(())
        }
    }

    fn order_names(graph: &RenderGraph, compiled: &CompiledGraph) -> Vec<String> {
        compiled
            .pass_order
            .iter()
            .map(|id| graph.get_pass_node(*id).unwrap().name.clone())
            .collect()
    }

    #[test]
    fn test_reader_runs_after_writer_regardless_of_insertion() {
        let mut graph = RenderGraph::new();
        graph
            .register_external(
                "target",
                TextureFormat::Rgba8Unorm,
                TextureUsage::RENDER_ATTACHMENT,
                true,
            )
            .unwrap();
        graph
            .add_pass(
                TestPass::new("producer")
                    .creates("color", TextureFormat::Rgba16Float)
                    .writes("color", ResourceUsage::RenderTarget),
            )
            .unwrap();
        graph
            .add_pass(
                TestPass::new("consumer")
                    .reads("color", ResourceUsage::TextureRead)
                    .writes("target", ResourceUsage::RenderTarget),
            )
            .unwrap();

        let compiled = graph.compile().unwrap();
        assert_eq!(order_names(&graph, &compiled), ["producer", "consumer"]);

        let color = graph.find_resource("color").unwrap();
        assert_eq!(
            compiled.layout_sequence(color),
            [
                TextureLayout::Undefined,
                TextureLayout::ColorAttachment,
                TextureLayout::ShaderReadOnly
            ]
        );
        assert!(compiled.is_resource_alive(color, 1));
    }

    #[test]
    fn test_final_transition_to_present() {
        let mut graph = RenderGraph::new();
        let target = graph
            .register_external(
                "target",
                TextureFormat::Rgba8Unorm,
                TextureUsage::RENDER_ATTACHMENT,
                true,
            )
            .unwrap();
        graph
            .add_pass(TestPass::new("draw").writes("target", ResourceUsage::RenderTarget))
            .unwrap();

        let compiled = graph.compile().unwrap();
        assert_eq!(
            compiled.final_transitions,
            [PlannedBarrier {
                resource: target,
                old: TextureLayout::ColorAttachment,
                new: TextureLayout::PresentSrc,
            }]
        );
    }

    #[test]
    fn test_read_modify_write_keeps_insertion_order() {
        let mut graph = RenderGraph::new();
        graph
            .register_external(
                "target",
                TextureFormat::Rgba8Unorm,
                TextureUsage::RENDER_ATTACHMENT,
                true,
            )
            .unwrap();
        graph
            .add_pass(TestPass::new("clear").writes("target", ResourceUsage::RenderTarget))
            .unwrap();
        graph
            .add_pass(TestPass::new("overlay").read_writes("target", ResourceUsage::RenderTarget))
            .unwrap();

        let compiled = graph.compile().unwrap();
        assert_eq!(order_names(&graph, &compiled), ["clear", "overlay"]);
        // Same layout in both passes: only the initial transition is planned.
        assert_eq!(compiled.barriers[0].len(), 1);
        assert!(compiled.barriers[1].is_empty());
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut graph = RenderGraph::new();
        graph
            .add_pass(
                TestPass::new("a")
                    .creates("x", TextureFormat::Rgba8Unorm)
                    .creates("y", TextureFormat::Rgba8Unorm)
                    .writes("x", ResourceUsage::RenderTarget)
                    .reads("y", ResourceUsage::TextureRead),
            )
            .unwrap();
        graph
            .add_pass(
                TestPass::new("b")
                    .reads("x", ResourceUsage::TextureRead)
                    .writes("y", ResourceUsage::RenderTarget),
            )
            .unwrap();

        assert!(matches!(graph.compile(), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn test_read_before_write_is_rejected() {
        let mut graph = RenderGraph::new();
        graph
            .add_pass(
                TestPass::new("sampler")
                    .creates("never_written", TextureFormat::Rgba8Unorm)
                    .reads("never_written", ResourceUsage::TextureRead),
            )
            .unwrap();

        assert!(matches!(
            graph.compile(),
            Err(GraphError::ReadBeforeWrite { .. })
        ));
    }

    #[test]
    fn test_conflicting_access_is_rejected() {
        let mut graph = RenderGraph::new();
        graph
            .add_pass(
                TestPass::new("feedback")
                    .creates("color", TextureFormat::Rgba8Unorm)
                    .writes("color", ResourceUsage::RenderTarget)
                    .reads("color", ResourceUsage::TextureRead),
            )
            .unwrap();

        assert!(matches!(
            graph.compile(),
            Err(GraphError::ConflictingAccess { .. })
        ));
    }

    #[test]
    fn test_depth_format_cannot_be_color_target() {
        let mut graph = RenderGraph::new();
        graph
            .add_pass(
                TestPass::new("bad")
                    .creates("depth", TextureFormat::Depth32Float)
                    .writes("depth", ResourceUsage::RenderTarget),
            )
            .unwrap();

        assert!(matches!(
            graph.compile(),
            Err(GraphError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_sampling_requires_texture_binding() {
        let mut graph = RenderGraph::new();
        graph
            .register_external(
                "target",
                TextureFormat::Rgba8Unorm,
                TextureUsage::RENDER_ATTACHMENT,
                true,
            )
            .unwrap();
        graph
            .add_pass(TestPass::new("draw").writes("target", ResourceUsage::RenderTarget))
            .unwrap();
        graph
            .add_pass(TestPass::new("sample").reads("target", ResourceUsage::TextureRead))
            .unwrap();

        assert!(matches!(
            graph.compile(),
            Err(GraphError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_duplicate_and_unknown_names() {
        let mut graph = RenderGraph::new();
        graph
            .add_pass(TestPass::new("a").creates("x", TextureFormat::Rgba8Unorm))
            .unwrap();
        assert!(matches!(
            graph.add_pass(TestPass::new("b").creates("x", TextureFormat::Rgba8Unorm)),
            Err(GraphError::DuplicateResource(_))
        ));
        assert!(matches!(
            graph.add_pass(TestPass::new("c").reads("missing", ResourceUsage::TextureRead)),
            Err(GraphError::UnknownResource(_))
        ));
    }
}
