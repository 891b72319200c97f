//! Camera system

use glam::{Mat4, Vec3};

use super::SceneCamera;

/// Camera projection type
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Projection {
    Perspective {
        fov_y: f32,
        aspect: f32,
        near: f32,
        far: f32,
    },
    Orthographic {
        left: f32,
        right: f32,
        bottom: f32,
        top: f32,
        near: f32,
        far: f32,
    },
}

impl Default for Projection {
    fn default() -> Self {
        Projection::Perspective {
            fov_y: std::f32::consts::FRAC_PI_4, // 45 degrees
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 100.0,
        }
    }
}

impl Projection {
    pub fn perspective(fov_y_degrees: f32, aspect: f32, near: f32, far: f32) -> Self {
        Projection::Perspective {
            fov_y: fov_y_degrees.to_radians(),
            aspect,
            near,
            far,
        }
    }

    /// Symmetric box of half-extent `radius` around the view axis
    pub fn orthographic(radius: f32, near: f32, far: f32) -> Self {
        Projection::Orthographic {
            left: -radius,
            right: radius,
            bottom: -radius,
            top: radius,
            near,
            far,
        }
    }

    pub fn matrix(&self) -> Mat4 {
        match *self {
            Projection::Perspective {
                fov_y,
                aspect,
                near,
                far,
            } => Mat4::perspective_rh(fov_y, aspect, near, far),
            Projection::Orthographic {
                left,
                right,
                bottom,
                top,
                near,
                far,
            } => Mat4::orthographic_rh(left, right, bottom, top, near, far),
        }
    }

    pub fn near(&self) -> f32 {
        match self {
            Projection::Perspective { near, .. } => *near,
            Projection::Orthographic { near, .. } => *near,
        }
    }

    pub fn far(&self) -> f32 {
        match self {
            Projection::Perspective { far, .. } => *far,
            Projection::Orthographic { far, .. } => *far,
        }
    }

    pub fn set_aspect(&mut self, aspect: f32) {
        if let Projection::Perspective { aspect: a, .. } = self {
            *a = aspect;
        }
    }
}

/// Camera for viewing the scene
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub projection: Projection,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 2.0, 5.0),
            target: Vec3::ZERO,
            up: Vec3::Y,
            projection: Projection::default(),
        }
    }
}

impl Camera {
    pub fn new(position: Vec3, target: Vec3) -> Self {
        Self {
            position,
            target,
            up: Vec3::Y,
            projection: Projection::default(),
        }
    }

    /// Build a perspective camera from one stored in a scene file
    pub fn from_scene_camera(camera: &SceneCamera, aspect: f32) -> Self {
        Self {
            position: camera.position,
            target: camera.look_at,
            up: camera.up,
            projection: Projection::perspective(camera.fov, aspect, camera.near, camera.far),
        }
    }

    /// Camera framing an axis-aligned box, used when a scene has no camera
    pub fn framing(min: Vec3, max: Vec3, aspect: f32) -> Self {
        let center = (min + max) * 0.5;
        let radius = ((max - min).length() * 0.5).max(1.0);
        let position = center + Vec3::new(0.0, 0.5, 1.0).normalize() * radius * 2.5;
        Self {
            position,
            target: center,
            up: Vec3::Y,
            projection: Projection::perspective(45.0, aspect, 0.1, radius * 10.0),
        }
    }

    pub fn look_at(&mut self, target: Vec3) {
        self.target = target;
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
    }

    /// Get the view matrix
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    /// Get the projection matrix
    pub fn projection_matrix(&self) -> Mat4 {
        self.projection.matrix()
    }

    /// Get combined view-projection matrix
    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// Get the forward direction
    pub fn forward(&self) -> Vec3 {
        (self.target - self.position).normalize()
    }

    /// Get the right direction
    pub fn right(&self) -> Vec3 {
        self.forward().cross(self.up).normalize()
    }

    /// Update aspect ratio for perspective projection
    pub fn set_aspect(&mut self, width: f32, height: f32) {
        if height > 0.0 {
            self.projection.set_aspect(width / height);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_projects_to_center() {
        let camera = Camera::new(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO);
        let clip = camera.view_projection_matrix() * Vec3::ZERO.extend(1.0);
        let ndc = clip.truncate() / clip.w;
        assert!(ndc.x.abs() < 1e-5);
        assert!(ndc.y.abs() < 1e-5);
        assert!(ndc.z > 0.0 && ndc.z < 1.0);
    }

    #[test]
    fn test_from_scene_camera() {
        let scene_camera = SceneCamera {
            fov: 60.0,
            position: Vec3::new(1.0, 2.0, 3.0),
            up: Vec3::Y,
            look_at: Vec3::ZERO,
            near: 0.5,
            far: 50.0,
        };
        let camera = Camera::from_scene_camera(&scene_camera, 2.0);
        assert_eq!(camera.position, scene_camera.position);
        assert_eq!(camera.projection.far(), 50.0);
        match camera.projection {
            Projection::Perspective { fov_y, aspect, .. } => {
                assert!((fov_y - 60f32.to_radians()).abs() < 1e-6);
                assert_eq!(aspect, 2.0);
            }
            Projection::Orthographic { .. } => panic!("expected perspective projection"),
        }
    }

    #[test]
    fn test_set_aspect_ignores_zero_height() {
        let mut camera = Camera::default();
        camera.set_aspect(800.0, 0.0);
        assert_eq!(camera.projection, Projection::default());
    }

    #[test]
    fn test_framing_looks_at_center() {
        let camera = Camera::framing(Vec3::splat(-1.0), Vec3::splat(3.0), 1.0);
        assert_eq!(camera.target, Vec3::ONE);
        assert!(camera.position.distance(camera.target) > 2.0);
    }
}
