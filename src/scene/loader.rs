//! glTF import into the merged scene buffers

use std::path::Path;

use glam::{Mat4, Vec2, Vec3};

use super::{SceneCamera, SceneError, SceneManager, SceneResult};
use crate::backend::types::Vertex;
use crate::resources::Mesh;

/// Far plane used when a perspective camera has an infinite projection
const DEFAULT_FAR_PLANE: f32 = 100.0;

pub(super) fn load(
    scene: &mut SceneManager,
    bytes: &[u8],
    base: Option<&Path>,
    transpose: bool,
) -> SceneResult<()> {
    let gltf::Gltf { document, blob } = gltf::Gltf::from_slice(bytes)?;
    let buffers = gltf::import_buffers(&document, base, blob)?;

    // glTF mesh index -> scene mesh id per primitive
    let mut mesh_map = Vec::new();
    for mesh in document.meshes() {
        let mut ids = Vec::new();
        for primitive in mesh.primitives() {
            let cpu_mesh = load_primitive(&mesh, &primitive, &buffers)?;
            ids.push(scene.add_mesh(&cpu_mesh));
        }
        mesh_map.push(ids);
    }

    let Some(root) = document.default_scene().or_else(|| document.scenes().next()) else {
        log::warn!("glTF document has no scene, nothing instanced");
        return Ok(());
    };

    for node in root.nodes() {
        load_node(scene, &node, Mat4::IDENTITY, &mesh_map, transpose)?;
    }

    if scene.cameras().is_empty() {
        log::warn!("Scene has no perspective camera, a framing camera will be used");
    }
    Ok(())
}

fn load_primitive(
    mesh: &gltf::Mesh<'_>,
    primitive: &gltf::Primitive<'_>,
    buffers: &[gltf::buffer::Data],
) -> SceneResult<Mesh> {
    if primitive.mode() != gltf::mesh::Mode::Triangles {
        return Err(SceneError::UnsupportedTopology {
            mesh: mesh.index(),
            mode: format!("{:?}", primitive.mode()),
        });
    }

    let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(|data| data.0.as_slice()));
    let positions: Vec<Vec3> = reader
        .read_positions()
        .ok_or(SceneError::MissingPositions {
            mesh: mesh.index(),
            primitive: primitive.index(),
        })?
        .map(Vec3::from)
        .collect();
    let indices: Vec<u32> = match reader.read_indices() {
        Some(indices) => indices.into_u32().collect(),
        None => (0..positions.len() as u32).collect(),
    };
    if let Some(&bad) = indices.iter().find(|&&i| i as usize >= positions.len()) {
        return Err(SceneError::Buffer(format!(
            "mesh {} index {} out of range ({} vertices)",
            mesh.index(),
            bad,
            positions.len()
        )));
    }

    let normals: Vec<Vec3> = match reader.read_normals() {
        Some(normals) => normals.map(Vec3::from).collect(),
        None => compute_normals(&positions, &indices),
    };
    let uvs: Vec<Vec2> = match reader.read_tex_coords(0) {
        Some(uvs) => uvs.into_f32().map(Vec2::from).collect(),
        None => vec![Vec2::ZERO; positions.len()],
    };

    let name = match (mesh.name(), mesh.primitives().len()) {
        (Some(name), 1) => name.to_string(),
        (Some(name), _) => format!("{}_prim{}", name, primitive.index()),
        (None, _) => format!("mesh{}_prim{}", mesh.index(), primitive.index()),
    };

    let mut cpu_mesh = Mesh::new(&name);
    cpu_mesh.vertices = positions
        .iter()
        .enumerate()
        .map(|(i, &position)| {
            Vertex::new(
                position,
                normals.get(i).copied().unwrap_or(Vec3::Y),
                uvs.get(i).copied().unwrap_or(Vec2::ZERO),
            )
        })
        .collect();
    cpu_mesh.indices = indices;
    Ok(cpu_mesh)
}

/// Area-weighted vertex normals
fn compute_normals(positions: &[Vec3], indices: &[u32]) -> Vec<Vec3> {
    let mut normals = vec![Vec3::ZERO; positions.len()];
    for tri in indices.chunks_exact(3) {
        let [a, b, c] = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
        let face = (positions[b] - positions[a]).cross(positions[c] - positions[a]);
        normals[a] += face;
        normals[b] += face;
        normals[c] += face;
    }
    normals
        .into_iter()
        .map(|n| n.try_normalize().unwrap_or(Vec3::Y))
        .collect()
}

fn load_node(
    scene: &mut SceneManager,
    node: &gltf::Node<'_>,
    parent: Mat4,
    mesh_map: &[Vec<usize>],
    transpose: bool,
) -> SceneResult<()> {
    let world = parent * Mat4::from_cols_array_2d(&node.transform().matrix());

    if let Some(mesh) = node.mesh() {
        let matrix = if transpose { world.transpose() } else { world };
        for &mesh_id in mesh_map.get(mesh.index()).map(Vec::as_slice).unwrap_or_default() {
            scene.add_instance(mesh_id, matrix)?;
        }
    }

    if let Some(camera) = node.camera() {
        match camera.projection() {
            gltf::camera::Projection::Perspective(p) => {
                scene.add_camera(scene_camera(world, &p));
            }
            gltf::camera::Projection::Orthographic(_) => {
                log::warn!("Skipping orthographic camera {}", camera.index());
            }
        }
    }

    for child in node.children() {
        load_node(scene, &child, world, mesh_map, transpose)?;
    }
    Ok(())
}

/// glTF cameras look down their local -Z with +Y up
fn scene_camera(world: Mat4, perspective: &gltf::camera::Perspective<'_>) -> SceneCamera {
    let position = world.transform_point3(Vec3::ZERO);
    let forward = world.transform_vector3(Vec3::NEG_Z).normalize_or_zero();
    SceneCamera {
        fov: perspective.yfov().to_degrees(),
        position,
        up: world.transform_vector3(Vec3::Y).normalize_or_zero(),
        look_at: position + forward,
        near: perspective.znear(),
        far: perspective.zfar().unwrap_or(DEFAULT_FAR_PLANE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One triangle instanced by two nodes (the second one a child of the
    /// first, translated by +2 on X) and a camera node at z = 5.
    const TRIANGLE_GLTF: &str = r#"{
        "asset": { "version": "2.0" },
        "scene": 0,
        "scenes": [ { "nodes": [0, 2] } ],
        "nodes": [
            { "mesh": 0, "children": [1] },
            { "mesh": 0, "translation": [2.0, 0.0, 0.0] },
            { "camera": 0, "translation": [0.0, 0.0, 5.0] }
        ],
        "cameras": [
            { "type": "perspective", "perspective": { "yfov": 1.0, "znear": 0.1, "zfar": 40.0 } }
        ],
        "meshes": [ { "name": "tri", "primitives": [ { "attributes": { "POSITION": 0 } } ] } ],
        "accessors": [
            { "bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3",
              "min": [0.0, 0.0, 0.0], "max": [1.0, 1.0, 0.0] }
        ],
        "bufferViews": [ { "buffer": 0, "byteLength": 36 } ],
        "buffers": [ {
            "byteLength": 36,
            "uri": "data:application/octet-stream;base64,AAAAAAAAAAAAAAAAAACAPwAAAAAAAAAAAAAAAAAAgD8AAAAA"
        } ]
    }"#;

    #[test]
    fn test_load_instances_and_camera() {
        let mut scene = SceneManager::new();
        scene
            .load_gltf_slice(TRIANGLE_GLTF.as_bytes(), false)
            .unwrap();

        assert_eq!(scene.meshes_num(), 1);
        assert_eq!(scene.instances_num(), 2);
        assert_eq!(scene.indices(), &[0, 1, 2]);

        let child = scene.instance_matrix(1).unwrap();
        assert_eq!(child.w_axis.x, 2.0);

        let camera = scene.camera(0).unwrap();
        assert_eq!(camera.position, Vec3::new(0.0, 0.0, 5.0));
        assert_eq!(camera.look_at, Vec3::new(0.0, 0.0, 4.0));
        assert_eq!(camera.far, 40.0);
        assert!((camera.fov - 1f32.to_degrees()).abs() < 1e-4);
    }

    #[test]
    fn test_missing_normals_are_generated() {
        let mut scene = SceneManager::new();
        scene
            .load_gltf_slice(TRIANGLE_GLTF.as_bytes(), false)
            .unwrap();
        for vertex in scene.vertices() {
            assert!((vertex.normal - Vec3::Z).length() < 1e-6);
        }
    }

    #[test]
    fn test_transpose_instance_matrices() {
        let mut scene = SceneManager::new();
        scene
            .load_gltf_slice(TRIANGLE_GLTF.as_bytes(), true)
            .unwrap();
        let child = scene.instance_matrix(1).unwrap();
        assert_eq!(child.w_axis.x, 0.0);
        assert_eq!(child.x_axis.w, 2.0);
    }

    #[test]
    fn test_invalid_document() {
        let mut scene = SceneManager::new();
        assert!(matches!(
            scene.load_gltf_slice(b"not a gltf file", false),
            Err(SceneError::Gltf(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let mut scene = SceneManager::new();
        assert!(matches!(
            scene.load_gltf("/nonexistent/scene.gltf", false),
            Err(SceneError::Io { .. })
        ));
    }
}
