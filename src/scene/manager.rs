//! Merged geometry and instances of the loaded scene

use std::path::Path;

use glam::{Mat4, Vec3};

use super::loader;
use super::{SceneCamera, SceneError, SceneResult};
use crate::backend::traits::{BufferHandle, GraphicsBackend};
use crate::backend::types::{BufferDescriptor, BufferUsage, Vertex};
use crate::resources::Mesh;

/// Location of one mesh inside the merged vertex and index buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshInfo {
    pub index_count: u32,
    /// First index in the merged index buffer
    pub index_offset: u32,
    /// Added to every index of the mesh
    pub vertex_offset: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceInfo {
    pub mesh_id: usize,
}

/// GPU copies of the merged geometry
#[derive(Debug, Clone, Copy)]
pub struct SceneBuffers {
    pub vertex: BufferHandle,
    pub index: BufferHandle,
}

/// Scene geometry with every mesh packed into one vertex and one 32-bit index buffer
#[derive(Debug, Default)]
pub struct SceneManager {
    vertices: Vec<Vertex>,
    indices: Vec<u32>,
    meshes: Vec<MeshInfo>,
    instances: Vec<InstanceInfo>,
    instance_matrices: Vec<Mat4>,
    cameras: Vec<SceneCamera>,
    buffers: Option<SceneBuffers>,
}

impl SceneManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ground plane with a few boxes and spheres
    pub fn demo_scene() -> Self {
        let mut scene = Self::new();
        let plane = scene.add_mesh(&Mesh::plane(20.0, 20.0, 4));
        let cube = scene.add_mesh(&Mesh::cube());
        let sphere = scene.add_mesh(&Mesh::sphere(32, 16));

        scene.push_instance(plane, Mat4::IDENTITY);
        for (i, x) in [-4.0f32, 0.0, 4.0].into_iter().enumerate() {
            let height = 1.0 + i as f32;
            scene.push_instance(
                cube,
                Mat4::from_translation(Vec3::new(x, height * 0.5, -2.0))
                    * Mat4::from_scale(Vec3::new(1.5, height, 1.5)),
            );
            scene.push_instance(
                sphere,
                Mat4::from_translation(Vec3::new(x, 1.0, 2.5)) * Mat4::from_scale(Vec3::splat(2.0)),
            );
        }
        scene
    }

    /// Append a mesh to the merged buffers and return its id
    pub fn add_mesh(&mut self, mesh: &Mesh) -> usize {
        let info = MeshInfo {
            index_count: mesh.indices.len() as u32,
            index_offset: self.indices.len() as u32,
            vertex_offset: self.vertices.len() as i32,
        };
        self.vertices.extend_from_slice(&mesh.vertices);
        self.indices.extend_from_slice(&mesh.indices);
        self.meshes.push(info);
        self.meshes.len() - 1
    }

    /// Place a mesh in the world; returns the instance index
    pub fn add_instance(&mut self, mesh_id: usize, matrix: Mat4) -> SceneResult<usize> {
        if mesh_id >= self.meshes.len() {
            return Err(SceneError::UnknownMesh(mesh_id));
        }
        Ok(self.push_instance(mesh_id, matrix))
    }

    fn push_instance(&mut self, mesh_id: usize, matrix: Mat4) -> usize {
        self.instances.push(InstanceInfo { mesh_id });
        self.instance_matrices.push(matrix);
        self.instances.len() - 1
    }

    pub fn add_camera(&mut self, camera: SceneCamera) {
        self.cameras.push(camera);
    }

    /// Load a `.gltf` or `.glb` file, appending its meshes, instances and cameras.
    ///
    /// With `transpose_instance_matrices` every node matrix is transposed
    /// before it is stored.
    pub fn load_gltf(
        &mut self,
        path: impl AsRef<Path>,
        transpose_instance_matrices: bool,
    ) -> SceneResult<()> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| SceneError::Io {
            path: path.display().to_string(),
            source,
        })?;
        loader::load(self, &bytes, path.parent(), transpose_instance_matrices)?;
        log::info!(
            "Loaded scene '{}': {} meshes, {} instances, {} cameras",
            path.display(),
            self.meshes.len(),
            self.instances.len(),
            self.cameras.len()
        );
        Ok(())
    }

    /// Load a self-contained glTF document from memory
    pub fn load_gltf_slice(
        &mut self,
        bytes: &[u8],
        transpose_instance_matrices: bool,
    ) -> SceneResult<()> {
        loader::load(self, bytes, None, transpose_instance_matrices)
    }

    /// Drop all CPU-side content. GPU buffers must be released first.
    pub fn clear(&mut self) {
        if self.buffers.is_some() {
            log::warn!("Scene cleared while GPU buffers are still alive");
        }
        self.vertices.clear();
        self.indices.clear();
        self.meshes.clear();
        self.instances.clear();
        self.instance_matrices.clear();
        self.cameras.clear();
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn meshes_num(&self) -> usize {
        self.meshes.len()
    }

    pub fn mesh_info(&self, mesh_id: usize) -> Option<&MeshInfo> {
        self.meshes.get(mesh_id)
    }

    pub fn instances_num(&self) -> usize {
        self.instances.len()
    }

    pub fn instance_info(&self, index: usize) -> Option<&InstanceInfo> {
        self.instances.get(index)
    }

    pub fn instance_matrix(&self, index: usize) -> Option<Mat4> {
        self.instance_matrices.get(index).copied()
    }

    /// Instances paired with their mesh and world matrix
    pub fn instances(&self) -> impl Iterator<Item = (&MeshInfo, Mat4)> + '_ {
        self.instances
            .iter()
            .zip(&self.instance_matrices)
            .filter_map(|(instance, matrix)| {
                self.meshes.get(instance.mesh_id).map(|mesh| (mesh, *matrix))
            })
    }

    pub fn camera(&self, index: usize) -> Option<&SceneCamera> {
        self.cameras.get(index)
    }

    pub fn cameras(&self) -> &[SceneCamera] {
        &self.cameras
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// World-space bounding box of every instance
    pub fn bounds(&self) -> Option<(Vec3, Vec3)> {
        let mut min = Vec3::splat(f32::MAX);
        let mut max = Vec3::splat(f32::MIN);
        let mut any = false;

        for (mesh, matrix) in self.instances() {
            let start = mesh.index_offset as usize;
            let end = start + mesh.index_count as usize;
            for &index in self.indices.get(start..end).unwrap_or_default() {
                let vertex = mesh.vertex_offset as i64 + index as i64;
                let Some(vertex) = self.vertices.get(vertex as usize) else {
                    continue;
                };
                let p = matrix.transform_point3(vertex.position);
                min = min.min(p);
                max = max.max(p);
                any = true;
            }
        }

        any.then_some((min, max))
    }

    /// Upload the merged geometry, replacing previous GPU buffers
    pub fn upload(&mut self, backend: &mut dyn GraphicsBackend) -> SceneResult<SceneBuffers> {
        if self.vertices.is_empty() || self.indices.is_empty() {
            return Err(SceneError::Empty);
        }
        self.release(backend);

        let vertex = backend.create_buffer_init(
            &BufferDescriptor {
                label: Some("scene_vertices".to_string()),
                size: std::mem::size_of_val(self.vertices.as_slice()) as u64,
                usage: BufferUsage::VERTEX,
                host_visible: false,
            },
            bytemuck::cast_slice(&self.vertices),
        )?;
        let index = match backend.create_buffer_init(
            &BufferDescriptor {
                label: Some("scene_indices".to_string()),
                size: std::mem::size_of_val(self.indices.as_slice()) as u64,
                usage: BufferUsage::INDEX,
                host_visible: false,
            },
            bytemuck::cast_slice(&self.indices),
        ) {
            Ok(index) => index,
            Err(e) => {
                backend.destroy_buffer(vertex);
                return Err(e.into());
            }
        };

        let buffers = SceneBuffers { vertex, index };
        self.buffers = Some(buffers);
        log::info!(
            "Scene uploaded: {} vertices, {} indices",
            self.vertices.len(),
            self.indices.len()
        );
        Ok(buffers)
    }

    pub fn buffers(&self) -> Option<SceneBuffers> {
        self.buffers
    }

    /// Destroy the GPU buffers, if any
    pub fn release(&mut self, backend: &mut dyn GraphicsBackend) {
        if let Some(buffers) = self.buffers.take() {
            backend.destroy_buffer(buffers.vertex);
            backend.destroy_buffer(buffers.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessBackend;

    #[test]
    fn test_meshes_are_packed_back_to_back() {
        let mut scene = SceneManager::new();
        let cube = scene.add_mesh(&Mesh::cube());
        let plane = scene.add_mesh(&Mesh::plane(1.0, 1.0, 1));

        assert_eq!(
            scene.mesh_info(cube),
            Some(&MeshInfo {
                index_count: 36,
                index_offset: 0,
                vertex_offset: 0,
            })
        );
        assert_eq!(
            scene.mesh_info(plane),
            Some(&MeshInfo {
                index_count: 6,
                index_offset: 36,
                vertex_offset: 24,
            })
        );
        assert_eq!(scene.vertices().len(), 28);
    }

    #[test]
    fn test_add_instance_rejects_unknown_mesh() {
        let mut scene = SceneManager::new();
        assert!(matches!(
            scene.add_instance(3, Mat4::IDENTITY),
            Err(SceneError::UnknownMesh(3))
        ));
    }

    #[test]
    fn test_bounds_follow_instance_matrices() {
        let mut scene = SceneManager::new();
        let cube = scene.add_mesh(&Mesh::cube());
        scene
            .add_instance(cube, Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0)))
            .unwrap();

        let (min, max) = scene.bounds().unwrap();
        assert!((min - Vec3::new(9.5, -0.5, -0.5)).length() < 1e-5);
        assert!((max - Vec3::new(10.5, 0.5, 0.5)).length() < 1e-5);
    }

    #[test]
    fn test_upload_and_release() {
        let mut backend = HeadlessBackend::new(16, 16);
        let mut scene = SceneManager::demo_scene();
        let before = backend.live_buffers();

        let buffers = scene.upload(&mut backend).unwrap();
        assert_eq!(backend.live_buffers(), before + 2);
        assert_eq!(
            backend.buffer_contents(buffers.index).unwrap().len(),
            scene.indices().len() * 4
        );

        scene.release(&mut backend);
        assert!(scene.buffers().is_none());
        assert_eq!(backend.live_buffers(), before);
    }

    #[test]
    fn test_upload_empty_scene_fails() {
        let mut backend = HeadlessBackend::new(16, 16);
        let mut scene = SceneManager::new();
        assert!(matches!(scene.upload(&mut backend), Err(SceneError::Empty)));
    }
}
