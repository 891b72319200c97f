//! CPU-side mesh data and procedural primitives

use crate::backend::types::Vertex;
use glam::{Vec2, Vec3};

/// A mesh with vertex and index data
#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub name: String,
}

impl Mesh {
    pub fn new(name: &str) -> Self {
        Self {
            vertices: Vec::new(),
            indices: Vec::new(),
            name: name.to_string(),
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Unit cube centered at origin
    pub fn cube() -> Self {
        let mut mesh = Mesh::new("cube");

        // (normal, tangent-u, tangent-v) per face
        let faces = [
            (Vec3::Z, Vec3::X, Vec3::Y),
            (-Vec3::Z, -Vec3::X, Vec3::Y),
            (Vec3::X, -Vec3::Z, Vec3::Y),
            (-Vec3::X, Vec3::Z, Vec3::Y),
            (Vec3::Y, Vec3::X, -Vec3::Z),
            (-Vec3::Y, Vec3::X, Vec3::Z),
        ];
        let corners = [(-0.5, -0.5), (0.5, -0.5), (0.5, 0.5), (-0.5, 0.5)];

        for (normal, u_axis, v_axis) in faces {
            let base = mesh.vertices.len() as u32;
            for (u, v) in corners {
                mesh.vertices.push(Vertex::new(
                    normal * 0.5 + u_axis * u + v_axis * v,
                    normal,
                    Vec2::new(u + 0.5, 0.5 - v),
                ));
            }
            mesh.indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }

        mesh
    }

    /// UV sphere of radius 0.5
    pub fn sphere(segments: u32, rings: u32) -> Self {
        let mut mesh = Mesh::new("sphere");

        let segment_angle = std::f32::consts::TAU / segments as f32;
        let ring_angle = std::f32::consts::PI / rings as f32;

        for ring in 0..=rings {
            let phi = ring as f32 * ring_angle;
            for segment in 0..=segments {
                let theta = segment as f32 * segment_angle;
                let normal = Vec3::new(phi.sin() * theta.cos(), phi.cos(), phi.sin() * theta.sin());
                mesh.vertices.push(Vertex::new(
                    normal * 0.5,
                    normal,
                    Vec2::new(
                        segment as f32 / segments as f32,
                        ring as f32 / rings as f32,
                    ),
                ));
            }
        }

        mesh.indices = grid_indices(segments, rings, true);
        mesh
    }

    /// Plane on the XZ axis facing +Y
    pub fn plane(width: f32, depth: f32, subdivisions: u32) -> Self {
        let mut mesh = Mesh::new("plane");

        let step_x = width / subdivisions as f32;
        let step_z = depth / subdivisions as f32;

        for z in 0..=subdivisions {
            for x in 0..=subdivisions {
                mesh.vertices.push(Vertex::new(
                    Vec3::new(
                        -width / 2.0 + x as f32 * step_x,
                        0.0,
                        -depth / 2.0 + z as f32 * step_z,
                    ),
                    Vec3::Y,
                    Vec2::new(
                        x as f32 / subdivisions as f32,
                        z as f32 / subdivisions as f32,
                    ),
                ));
            }
        }

        mesh.indices = grid_indices(subdivisions, subdivisions, false);
        mesh
    }
}

/// Two triangles per cell of a `(columns + 1) x (rows + 1)` vertex grid
fn grid_indices(columns: u32, rows: u32, flip: bool) -> Vec<u32> {
    let mut indices = Vec::with_capacity((columns * rows * 6) as usize);
    for row in 0..rows {
        for column in 0..columns {
            let current = row * (columns + 1) + column;
            let next = current + columns + 1;
            if flip {
                indices.extend_from_slice(&[
                    current,
                    current + 1,
                    next,
                    current + 1,
                    next + 1,
                    next,
                ]);
            } else {
                indices.extend_from_slice(&[
                    current,
                    next,
                    current + 1,
                    current + 1,
                    next,
                    next + 1,
                ]);
            }
        }
    }
    indices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cube_counts() {
        let cube = Mesh::cube();
        assert_eq!(cube.vertex_count(), 24);
        assert_eq!(cube.triangle_count(), 12);
        for vertex in &cube.vertices {
            assert!((vertex.position.abs().max_element() - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn test_cube_faces_point_outward() {
        let cube = Mesh::cube();
        for tri in cube.indices.chunks(3) {
            let [a, b, c] = [0, 1, 2].map(|i| cube.vertices[tri[i] as usize]);
            let face_normal = (b.position - a.position).cross(c.position - a.position);
            assert!(face_normal.dot(a.normal) > 0.0);
        }
    }

    #[test]
    fn test_plane_indices_in_range() {
        let plane = Mesh::plane(10.0, 10.0, 4);
        assert_eq!(plane.vertex_count(), 25);
        assert_eq!(plane.index_count(), 4 * 4 * 6);
        assert!(plane.indices.iter().all(|&i| (i as usize) < plane.vertex_count()));
    }

    #[test]
    fn test_sphere_normals_are_unit() {
        let sphere = Mesh::sphere(16, 8);
        for vertex in &sphere.vertices {
            assert!((vertex.normal.length() - 1.0).abs() < 1e-4);
        }
    }
}
